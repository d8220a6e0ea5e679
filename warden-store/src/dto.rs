//! Row-shaped DTOs for persistence.
//!
//! Flat, string-typed mirrors of the domain records. The postgres store reads
//! them with `sqlx::FromRow`; conversion back to the domain validates every
//! field so a corrupt row surfaces as `StoreError::Corrupt`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use warden_domain::{
    AgedPositionRecord, ExchangeId, Position, PositionId, Price, Quantity, Symbol,
};

use crate::error::StoreError;

/// Row of the `positions` table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct PositionRow {
    pub id: Uuid,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Option<Decimal>,
    pub status: String,
    pub exchange_order_id: Option<String>,
    pub protective_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PositionRow {
    /// Flatten a domain position
    pub fn from_domain(position: &Position) -> Self {
        Self {
            id: position.id.as_uuid(),
            symbol: position.symbol.as_pair(),
            exchange: position.exchange.as_str().to_string(),
            side: position.side.as_str().to_string(),
            quantity: position.quantity.as_decimal(),
            entry_price: position.entry_price.as_decimal(),
            current_price: position.current_price.map(|p| p.as_decimal()),
            status: position.status.as_str().to_string(),
            exchange_order_id: position.exchange_order_id.clone(),
            protective_order_id: position.protective_order_id.clone(),
            opened_at: position.opened_at,
            closed_at: position.closed_at,
            exit_reason: position.exit_reason.clone(),
            updated_at: position.updated_at,
        }
    }

    /// Rebuild the domain position
    pub fn to_domain(&self) -> Result<Position, StoreError> {
        let corrupt = |field: &str, e: warden_domain::DomainError| {
            StoreError::corrupt(format!("position {} field {}: {}", self.id, field, e))
        };

        Ok(Position {
            id: PositionId::from_uuid(self.id),
            symbol: Symbol::from_pair(&self.symbol).map_err(|e| corrupt("symbol", e))?,
            exchange: ExchangeId::new(&self.exchange).map_err(|e| corrupt("exchange", e))?,
            side: self.side.parse().map_err(|e| corrupt("side", e))?,
            quantity: Quantity::new(self.quantity).map_err(|e| corrupt("quantity", e))?,
            entry_price: Price::new(self.entry_price).map_err(|e| corrupt("entry_price", e))?,
            current_price: self
                .current_price
                .map(Price::new)
                .transpose()
                .map_err(|e| corrupt("current_price", e))?,
            status: self.status.parse().map_err(|e| corrupt("status", e))?,
            exchange_order_id: self.exchange_order_id.clone(),
            protective_order_id: self.protective_order_id.clone(),
            opened_at: self.opened_at,
            closed_at: self.closed_at,
            exit_reason: self.exit_reason.clone(),
            updated_at: self.updated_at,
        })
    }
}

/// Row of the `aged_positions` table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct AgedPositionRow {
    pub position_id: Uuid,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub entry_price: Decimal,
    pub target_price: Decimal,
    pub phase: String,
    pub loss_tolerance: Decimal,
    pub hours_aged: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgedPositionRow {
    /// Flatten a domain record
    pub fn from_domain(record: &AgedPositionRecord) -> Self {
        Self {
            position_id: record.position_id.as_uuid(),
            symbol: record.symbol.as_pair(),
            exchange: record.exchange.as_str().to_string(),
            side: record.side.as_str().to_string(),
            entry_price: record.entry_price.as_decimal(),
            target_price: record.target_price,
            phase: record.phase.as_str().to_string(),
            loss_tolerance: record.loss_tolerance,
            hours_aged: record.hours_aged,
            status: record.status.as_str().to_string(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    /// Rebuild the domain record
    pub fn to_domain(&self) -> Result<AgedPositionRecord, StoreError> {
        let corrupt = |field: &str, e: warden_domain::DomainError| {
            StoreError::corrupt(format!("aged record {} field {}: {}", self.position_id, field, e))
        };

        Ok(AgedPositionRecord {
            position_id: PositionId::from_uuid(self.position_id),
            symbol: Symbol::from_pair(&self.symbol).map_err(|e| corrupt("symbol", e))?,
            exchange: ExchangeId::new(&self.exchange).map_err(|e| corrupt("exchange", e))?,
            side: self.side.parse().map_err(|e| corrupt("side", e))?,
            entry_price: Price::new(self.entry_price).map_err(|e| corrupt("entry_price", e))?,
            target_price: self.target_price,
            phase: self.phase.parse().map_err(|e| corrupt("phase", e))?,
            loss_tolerance: self.loss_tolerance,
            hours_aged: self.hours_aged,
            status: self.status.parse().map_err(|e| corrupt("status", e))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use warden_domain::{PositionStatus, Side};

    fn create_test_position() -> Position {
        Position::new_active(
            Symbol::from_pair("ETHUSDT").unwrap(),
            ExchangeId::new("bybit").unwrap(),
            Side::Short,
            Quantity::new(dec!(3)).unwrap(),
            Price::new(dec!(2500)).unwrap(),
            "ord-9".to_string(),
        )
    }

    #[test]
    fn test_position_row_preserves_domain_fields() {
        let position = create_test_position();
        let row = PositionRow::from_domain(&position);

        assert_eq!(row.symbol, "ETHUSDT");
        assert_eq!(row.side, "short");
        assert_eq!(row.status, "active");
        assert_eq!(row.to_domain().unwrap(), position);
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let mut row = PositionRow::from_domain(&create_test_position());
        row.status = "half_open".to_string();

        let err = row.to_domain().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(ref msg) if msg.contains("status")));

        row.status = PositionStatus::Closed.as_str().to_string();
        row.quantity = dec!(0);
        assert!(matches!(row.to_domain(), Err(StoreError::Corrupt(_))));
    }
}
