//! PostgreSQL store.
//!
//! Uses dynamic queries (`sqlx::query`) instead of compile-time checked macros
//! so the crate builds without a `DATABASE_URL`. Advisory locks are
//! `pg_advisory_xact_lock` taken inside a transaction that the returned guard
//! owns; committing (or dropping) the guard releases the lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use warden_domain::{
    AgedPositionRecord, AgedRecordStatus, EngineEvent, ExchangeId, Position, PositionId,
    Quantity, Symbol,
};

use crate::dto::{AgedPositionRow, PositionRow};
use crate::error::StoreError;
use crate::lock::{AdvisoryLock, LockKey};
use crate::repository::{AgedPositionRepository, EventRepository, PositionRepository, Store};

const POSITION_COLUMNS: &str = "id, symbol, exchange, side, quantity, entry_price, current_price, \
     status, exchange_order_id, protective_order_id, opened_at, closed_at, exit_reason, updated_at";

const AGED_COLUMNS: &str = "position_id, symbol, exchange, side, entry_price, target_price, \
     phase, loss_tolerance, hours_aged, status, created_at, updated_at";

/// PostgreSQL-backed [`Store`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Apply embedded migrations. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Migrations completed");
        Ok(())
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_positions(
        &self,
        filter: &str,
        binds: &[&str],
    ) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE status = 'active' {} ORDER BY opened_at",
            POSITION_COLUMNS, filter
        );
        let mut query = sqlx::query_as::<_, PositionRow>(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(PositionRow::to_domain).collect()
    }
}

// =============================================================================
// Position Repository Implementation
// =============================================================================

#[async_trait]
impl PositionRepository for PgStore {
    async fn save(&self, position: &Position) -> Result<(), StoreError> {
        let row = PositionRow::from_domain(position);
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, exchange, side, quantity, entry_price, current_price, status,
                exchange_order_id, protective_order_id, opened_at, closed_at, exit_reason, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                current_price = EXCLUDED.current_price,
                status = EXCLUDED.status,
                exchange_order_id = EXCLUDED.exchange_order_id,
                protective_order_id = EXCLUDED.protective_order_id,
                closed_at = EXCLUDED.closed_at,
                exit_reason = EXCLUDED.exit_reason,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(row.id)
        .bind(&row.symbol)
        .bind(&row.exchange)
        .bind(&row.side)
        .bind(row.quantity)
        .bind(row.entry_price)
        .bind(row.current_price)
        .bind(&row.status)
        .bind(&row.exchange_order_id)
        .bind(&row.protective_order_id)
        .bind(row.opened_at)
        .bind(row.closed_at)
        .bind(&row.exit_reason)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        let sql = format!("SELECT {} FROM positions WHERE id = $1", POSITION_COLUMNS);
        let row = sqlx::query_as::<_, PositionRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(PositionRow::to_domain).transpose()
    }

    async fn find_active(&self) -> Result<Vec<Position>, StoreError> {
        self.fetch_positions("", &[]).await
    }

    async fn find_active_by_exchange(
        &self,
        exchange: &ExchangeId,
    ) -> Result<Vec<Position>, StoreError> {
        self.fetch_positions("AND exchange = $1", &[exchange.as_str()]).await
    }

    async fn find_active_by_symbol(
        &self,
        symbol: &Symbol,
        exchange: &ExchangeId,
    ) -> Result<Option<Position>, StoreError> {
        let pair = symbol.as_pair();
        let mut found = self
            .fetch_positions("AND symbol = $1 AND exchange = $2", &[pair.as_str(), exchange.as_str()])
            .await?;
        Ok(if found.is_empty() { None } else { Some(found.swap_remove(0)) })
    }

    async fn update_quantity(&self, id: PositionId, quantity: Quantity) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE positions SET quantity = $1, updated_at = $2 WHERE id = $3")
            .bind(quantity.as_decimal())
            .bind(Utc::now())
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("position", id));
        }
        Ok(())
    }

    async fn mark_closed(
        &self,
        id: PositionId,
        reason: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE positions
            SET status = 'closed', closed_at = $1, exit_reason = $2, updated_at = $1
            WHERE id = $3 AND status NOT IN ('closed', 'failed')
            "#,
        )
        .bind(closed_at)
        .bind(reason)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.find_by_id(id).await?.is_none() {
            return Err(StoreError::not_found("position", id));
        }
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Aged Position Repository Implementation
// =============================================================================

#[async_trait]
impl AgedPositionRepository for PgStore {
    async fn upsert(&self, record: &AgedPositionRecord) -> Result<(), StoreError> {
        let row = AgedPositionRow::from_domain(record);
        sqlx::query(
            r#"
            INSERT INTO aged_positions (
                position_id, symbol, exchange, side, entry_price, target_price, phase,
                loss_tolerance, hours_aged, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (position_id) DO UPDATE SET
                target_price = EXCLUDED.target_price,
                phase = EXCLUDED.phase,
                loss_tolerance = EXCLUDED.loss_tolerance,
                hours_aged = EXCLUDED.hours_aged,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(row.position_id)
        .bind(&row.symbol)
        .bind(&row.exchange)
        .bind(&row.side)
        .bind(row.entry_price)
        .bind(row.target_price)
        .bind(&row.phase)
        .bind(row.loss_tolerance)
        .bind(row.hours_aged)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_active(&self) -> Result<Vec<AgedPositionRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM aged_positions WHERE status = 'active' ORDER BY created_at",
            AGED_COLUMNS
        );
        let rows = sqlx::query_as::<_, AgedPositionRow>(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(AgedPositionRow::to_domain).collect()
    }

    async fn find_by_position(
        &self,
        position_id: PositionId,
    ) -> Result<Option<AgedPositionRecord>, StoreError> {
        let sql = format!("SELECT {} FROM aged_positions WHERE position_id = $1", AGED_COLUMNS);
        let row = sqlx::query_as::<_, AgedPositionRow>(&sql)
            .bind(position_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(AgedPositionRow::to_domain).transpose()
    }

    async fn update_status(
        &self,
        position_id: PositionId,
        status: AgedRecordStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE aged_positions SET status = $1, updated_at = $2 WHERE position_id = $3",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(position_id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("aged_position", position_id));
        }
        Ok(())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM aged_positions WHERE status <> 'active' AND updated_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Event Repository Implementation
// =============================================================================

fn decode_events(payloads: Vec<serde_json::Value>) -> Result<Vec<EngineEvent>, StoreError> {
    payloads
        .into_iter()
        .map(|payload| {
            serde_json::from_value(payload)
                .map_err(|e| StoreError::corrupt(format!("event payload: {}", e)))
        })
        .collect()
}

#[async_trait]
impl EventRepository for PgStore {
    async fn append(&self, event: &EngineEvent) -> Result<i64, StoreError> {
        let payload =
            serde_json::to_value(event).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO engine_events (event_type, position_id, symbol, exchange, payload, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING seq
            "#,
        )
        .bind(event.event_type())
        .bind(event.position_id().map(|id| id.as_uuid()))
        .bind(event.symbol().map(|s| s.as_pair()))
        .bind(event.exchange().map(|e| e.as_str().to_string()))
        .bind(payload)
        .bind(event.timestamp())
        .fetch_one(&self.pool)
        .await?;

        Ok(seq)
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<EngineEvent>, StoreError> {
        let mut payloads: Vec<serde_json::Value> =
            sqlx::query_scalar("SELECT payload FROM engine_events ORDER BY seq DESC LIMIT $1")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
        payloads.reverse();
        decode_events(payloads)
    }

    async fn find_by_type(&self, event_type: &str) -> Result<Vec<EngineEvent>, StoreError> {
        let payloads: Vec<serde_json::Value> =
            sqlx::query_scalar("SELECT payload FROM engine_events WHERE event_type = $1 ORDER BY seq")
                .bind(event_type)
                .fetch_all(&self.pool)
                .await?;
        decode_events(payloads)
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM engine_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// =============================================================================
// Store Implementation
// =============================================================================

#[async_trait]
impl Store for PgStore {
    fn positions(&self) -> &dyn PositionRepository {
        self
    }

    fn aged_positions(&self) -> &dyn AgedPositionRepository {
        self
    }

    fn events(&self) -> &dyn EventRepository {
        self
    }

    async fn advisory_lock(&self, key: LockKey) -> Result<AdvisoryLock, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key.as_i64())
            .execute(&mut *tx)
            .await?;
        Ok(AdvisoryLock::postgres(key, tx))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{insert_active_exclusive, InsertOutcome};
    use rust_decimal_macros::dec;
    use warden_domain::{Price, Side};

    fn position(order_id: &str) -> Position {
        Position::new_active(
            Symbol::from_pair("BTCUSDT").unwrap(),
            ExchangeId::new("binance").unwrap(),
            Side::Long,
            Quantity::new(dec!(0.5)).unwrap(),
            Price::new(dec!(42000)).unwrap(),
            order_id.to_string(),
        )
    }

    /// Needs a live database.
    ///
    /// Run with: `cargo test -p warden-store --features postgres`
    #[sqlx::test(migrations = "./migrations")]
    async fn test_partial_index_allows_one_active_row(pool: PgPool) {
        let store = PgStore::new(pool);
        let first = position("1");
        store.save(&first).await.unwrap();

        let err = store.save(&position("2")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        let outcome = insert_active_exclusive(&store, &position("3")).await.unwrap();
        assert_eq!(outcome, InsertOutcome::AlreadyPresent(first.id));

        assert!(store.mark_closed(first.id, "test", Utc::now()).await.unwrap());
        assert!(!store.mark_closed(first.id, "test", Utc::now()).await.unwrap());

        let next = position("4");
        let outcome = insert_active_exclusive(&store, &next).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_events_round_trip_through_jsonb(pool: PgPool) {
        let store = PgStore::new(pool);
        let event = EngineEvent::MissingPositionRejected {
            symbol: Symbol::from_pair("ETHUSDT").unwrap(),
            exchange: ExchangeId::new("bybit").unwrap(),
            reason: "no order id".to_string(),
            timestamp: Utc::now(),
        };

        store.append(&event).await.unwrap();

        let found = store.find_by_type("missing_position_rejected").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].symbol().map(|s| s.as_pair()), Some("ETHUSDT".to_string()));
        assert_eq!(EventRepository::count(&store).await.unwrap(), 1);
    }
}
