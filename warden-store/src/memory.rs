//! In-memory store implementation
//!
//! Used for testing and development without a database.
//! Advisory locks are per-key tokio mutexes, so the check-then-insert
//! guarantee holds across tasks exactly as it does with Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use warden_domain::{
    AgedPositionRecord, AgedRecordStatus, EngineEvent, ExchangeId, Position, PositionId,
    Quantity, Symbol,
};

use crate::error::StoreError;
use crate::lock::{AdvisoryLock, LockKey};
use crate::repository::{AgedPositionRepository, EventRepository, PositionRepository, Store};

/// In-memory store for testing
pub struct MemoryStore {
    positions: RwLock<HashMap<PositionId, Position>>,
    aged: RwLock<HashMap<PositionId, AgedPositionRecord>>,
    events: RwLock<Vec<StoredEvent>>,
    event_seq: AtomicI64,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

/// Event with sequence number
struct StoredEvent {
    seq: i64,
    event: EngineEvent,
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            aged: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            event_seq: AtomicI64::new(0),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored positions, any status
    pub async fn position_count(&self) -> usize {
        self.positions.read().await.len()
    }

    /// Drop the event log, keeping positions and records
    pub async fn clear_events(&self) {
        self.events.write().await.clear();
    }

    /// Clear all data (useful for test setup)
    pub async fn clear(&self) {
        self.positions.write().await.clear();
        self.aged.write().await.clear();
        self.events.write().await.clear();
        self.event_seq.store(0, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Position Repository Implementation
// =============================================================================

#[async_trait]
impl PositionRepository for MemoryStore {
    async fn save(&self, position: &Position) -> Result<(), StoreError> {
        let mut positions = self.positions.write().await;
        positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        let positions = self.positions.read().await;
        Ok(positions.get(&id).cloned())
    }

    async fn find_active(&self) -> Result<Vec<Position>, StoreError> {
        let positions = self.positions.read().await;
        let mut active: Vec<Position> =
            positions.values().filter(|p| p.is_active()).cloned().collect();
        active.sort_by_key(|p| p.opened_at);
        Ok(active)
    }

    async fn find_active_by_exchange(
        &self,
        exchange: &ExchangeId,
    ) -> Result<Vec<Position>, StoreError> {
        let positions = self.positions.read().await;
        let mut active: Vec<Position> = positions
            .values()
            .filter(|p| p.is_active() && &p.exchange == exchange)
            .cloned()
            .collect();
        active.sort_by_key(|p| p.opened_at);
        Ok(active)
    }

    async fn find_active_by_symbol(
        &self,
        symbol: &Symbol,
        exchange: &ExchangeId,
    ) -> Result<Option<Position>, StoreError> {
        let positions = self.positions.read().await;
        Ok(positions
            .values()
            .find(|p| p.is_active() && &p.symbol == symbol && &p.exchange == exchange)
            .cloned())
    }

    async fn update_quantity(&self, id: PositionId, quantity: Quantity) -> Result<(), StoreError> {
        let mut positions = self.positions.write().await;
        let position =
            positions.get_mut(&id).ok_or_else(|| StoreError::not_found("position", id))?;
        position.quantity = quantity;
        position.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_closed(
        &self,
        id: PositionId,
        reason: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut positions = self.positions.write().await;
        let position =
            positions.get_mut(&id).ok_or_else(|| StoreError::not_found("position", id))?;
        if position.status.is_terminal() {
            return Ok(false);
        }
        position.close(reason, closed_at)?;
        Ok(true)
    }
}

// =============================================================================
// Aged Position Repository Implementation
// =============================================================================

#[async_trait]
impl AgedPositionRepository for MemoryStore {
    async fn upsert(&self, record: &AgedPositionRecord) -> Result<(), StoreError> {
        let mut aged = self.aged.write().await;
        aged.insert(record.position_id, record.clone());
        Ok(())
    }

    async fn find_active(&self) -> Result<Vec<AgedPositionRecord>, StoreError> {
        let aged = self.aged.read().await;
        Ok(aged
            .values()
            .filter(|r| r.status == AgedRecordStatus::Active)
            .cloned()
            .collect())
    }

    async fn find_by_position(
        &self,
        position_id: PositionId,
    ) -> Result<Option<AgedPositionRecord>, StoreError> {
        let aged = self.aged.read().await;
        Ok(aged.get(&position_id).cloned())
    }

    async fn update_status(
        &self,
        position_id: PositionId,
        status: AgedRecordStatus,
    ) -> Result<(), StoreError> {
        let mut aged = self.aged.write().await;
        let record = aged
            .get_mut(&position_id)
            .ok_or_else(|| StoreError::not_found("aged_position", position_id))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut aged = self.aged.write().await;
        let before = aged.len();
        aged.retain(|_, r| r.status == AgedRecordStatus::Active || r.updated_at >= older_than);
        Ok((before - aged.len()) as u64)
    }
}

// =============================================================================
// Event Repository Implementation
// =============================================================================

#[async_trait]
impl EventRepository for MemoryStore {
    async fn append(&self, event: &EngineEvent) -> Result<i64, StoreError> {
        let mut events = self.events.write().await;
        let seq = self.event_seq.fetch_add(1, Ordering::SeqCst) + 1;
        events.push(StoredEvent { seq, event: event.clone() });
        Ok(seq)
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<EngineEvent>, StoreError> {
        let events = self.events.read().await;
        let skip = events.len().saturating_sub(limit);
        Ok(events.iter().skip(skip).map(|e| e.event.clone()).collect())
    }

    async fn find_by_type(&self, event_type: &str) -> Result<Vec<EngineEvent>, StoreError> {
        let events = self.events.read().await;
        let mut matching: Vec<&StoredEvent> =
            events.iter().filter(|e| e.event.event_type() == event_type).collect();
        matching.sort_by_key(|e| e.seq);
        Ok(matching.into_iter().map(|e| e.event.clone()).collect())
    }

    async fn count(&self) -> Result<i64, StoreError> {
        Ok(self.events.read().await.len() as i64)
    }
}

// =============================================================================
// Store Implementation
// =============================================================================

#[async_trait]
impl Store for MemoryStore {
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
        let mutex = {
            let mut locks = self.locks.lock().await;
            locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(AdvisoryLock::memory(key, guard))
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
    use std::time::Duration;
    use warden_domain::{AgedPhase, Price, Side};

    fn create_test_position(symbol: &str, exchange: &str) -> Position {
        Position::new_active(
            Symbol::from_pair(symbol).unwrap(),
            ExchangeId::new(exchange).unwrap(),
            Side::Long,
            Quantity::new(dec!(0.1)).unwrap(),
            Price::new(dec!(42000)).unwrap(),
            format!("ord-{}", symbol),
        )
    }

    fn create_test_record(position: &Position, status: AgedRecordStatus) -> AgedPositionRecord {
        AgedPositionRecord {
            position_id: position.id,
            symbol: position.symbol.clone(),
            exchange: position.exchange.clone(),
            side: position.side,
            entry_price: position.entry_price,
            target_price: dec!(42050),
            phase: AgedPhase::Grace,
            loss_tolerance: dec!(0),
            hours_aged: dec!(4),
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_position_save_and_find() {
        let store = MemoryStore::new();
        let position = create_test_position("BTCUSDT", "binance");

        store.positions().save(&position).await.unwrap();

        let found = store.positions().find_by_id(position.id).await.unwrap();
        assert_eq!(found.unwrap().id, position.id);

        let by_symbol = store
            .positions()
            .find_active_by_symbol(&position.symbol, &position.exchange)
            .await
            .unwrap();
        assert!(by_symbol.is_some());

        let other_exchange = ExchangeId::new("bybit").unwrap();
        assert!(store
            .positions()
            .find_active_by_symbol(&position.symbol, &other_exchange)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_mark_closed_is_idempotent() {
        let store = MemoryStore::new();
        let position = create_test_position("BTCUSDT", "binance");
        store.positions().save(&position).await.unwrap();

        let now = Utc::now();
        assert!(store.positions().mark_closed(position.id, "manual", now).await.unwrap());
        assert!(!store.positions().mark_closed(position.id, "manual", now).await.unwrap());

        let closed = store.positions().find_by_id(position.id).await.unwrap().unwrap();
        assert_eq!(closed.exit_reason.as_deref(), Some("manual"));
        assert!(store.positions().find_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_quantity_missing_position() {
        let store = MemoryStore::new();
        let result = store
            .positions()
            .update_quantity(PositionId::new(), Quantity::new(dec!(1)).unwrap())
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_aged_cleanup_keeps_active_records() {
        let store = MemoryStore::new();
        let a = create_test_position("BTCUSDT", "binance");
        let b = create_test_position("ETHUSDT", "binance");

        store.aged_positions().upsert(&create_test_record(&a, AgedRecordStatus::Active)).await.unwrap();
        store.aged_positions().upsert(&create_test_record(&b, AgedRecordStatus::Stale)).await.unwrap();

        let removed = store
            .aged_positions()
            .cleanup(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let active = store.aged_positions().find_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].position_id, a.id);
    }

    #[tokio::test]
    async fn test_event_log_append_and_query() {
        let store = MemoryStore::new();
        let exchange = ExchangeId::new("binance").unwrap();

        for _ in 0..3 {
            store
                .events()
                .append(&EngineEvent::SynchronizationStarted {
                    exchange: exchange.clone(),
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }
        let seq = store
            .events()
            .append(&EngineEvent::PhantomPositionDetected {
                position_id: PositionId::new(),
                symbol: Symbol::from_pair("BTCUSDT").unwrap(),
                exchange: exchange.clone(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(seq, 4);
        assert_eq!(store.events().count().await.unwrap(), 4);
        assert_eq!(store.events().find_by_type("synchronization_started").await.unwrap().len(), 3);

        let recent = store.events().find_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].event_type(), "phantom_position_detected");
    }

    #[tokio::test]
    async fn test_advisory_lock_blocks_second_holder() {
        let store = Arc::new(MemoryStore::new());
        let key = LockKey::for_position(
            &Symbol::from_pair("BTCUSDT").unwrap(),
            &ExchangeId::new("binance").unwrap(),
        );

        let held = store.advisory_lock(key).await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move { store.advisory_lock(key).await.map(|l| l.key()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        held.release().await.unwrap();
        let acquired = tokio::time::timeout(Duration::from_secs(1), contender).await;
        assert_eq!(acquired.unwrap().unwrap().unwrap(), key);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_guarded_inserts_leave_one_active_position() {
        let store = Arc::new(MemoryStore::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let position = create_test_position("BTCUSDT", "binance");
                insert_active_exclusive(store.as_ref(), &position).await.unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        let binance = ExchangeId::new("binance").unwrap();
        assert_eq!(store.positions().find_active_by_exchange(&binance).await.unwrap().len(), 1);
        assert_eq!(store.position_count().await, 1);
    }
}
