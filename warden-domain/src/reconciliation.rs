//! Reconciliation discrepancies between stored and exchange state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::PositionId;
use crate::value_objects::{ExchangeId, Side, Symbol};

/// Kind of drift between the store and the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Open on the exchange, absent from the store
    MissingInStore,
    /// Active in the store, absent from the exchange (phantom)
    MissingOnExchange,
    /// Present in both with different sizes
    QuantityMismatch,
}

/// One detected discrepancy plus the evidence needed to act on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDiscrepancy {
    /// Trading pair
    pub symbol: Symbol,
    /// Exchange
    pub exchange: ExchangeId,
    /// What is wrong
    pub kind: DiscrepancyKind,
    /// Stored position, if any
    pub stored_position_id: Option<PositionId>,
    /// Stored quantity, if any
    pub stored_quantity: Option<Decimal>,
    /// Exchange-reported quantity, if any
    pub exchange_quantity: Option<Decimal>,
    /// Exchange-native order/position identifier, if any
    pub exchange_position_id: Option<String>,
    /// Direction (exchange side when present, else stored side)
    pub side: Side,
    /// Exchange-reported entry price, if any
    pub entry_price: Option<Decimal>,
}

impl PositionDiscrepancy {
    /// Absolute quantity difference (zero unless both sides are known)
    pub fn quantity_delta(&self) -> Decimal {
        match (self.stored_quantity, self.exchange_quantity) {
            (Some(stored), Some(exchange)) => (stored - exchange).abs(),
            _ => Decimal::ZERO,
        }
    }
}
