//! Engine events.
//!
//! Every reconciliation action, aged-position transition and close outcome
//! is recorded as an immutable event in the append-only log.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::aged::AgedPhase;
use crate::entities::PositionId;
use crate::value_objects::{ExchangeId, Side, Symbol};

/// Structured engine events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Reconciliation pass started for an exchange
    SynchronizationStarted {
        /// Exchange being reconciled
        exchange: ExchangeId,
        /// When the pass started
        timestamp: DateTime<Utc>,
    },

    /// Reconciliation pass finished
    SynchronizationCompleted {
        /// Exchange reconciled
        exchange: ExchangeId,
        /// Positions inserted from exchange state
        added: u32,
        /// Quantities corrected
        corrected: u32,
        /// Phantom positions closed
        closed_phantom: u32,
        /// Exchange positions rejected
        rejected: u32,
        /// Pass duration
        duration_ms: u64,
        /// When the pass finished
        timestamp: DateTime<Utc>,
    },

    /// Stored position confirmed on the exchange
    PositionVerified {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Confirmed quantity
        quantity: Decimal,
        /// When verified
        timestamp: DateTime<Utc>,
    },

    /// Stored and exchange quantities disagree beyond tolerance
    QuantityMismatchDetected {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Quantity in the store
        stored_quantity: Decimal,
        /// Quantity reported by the exchange
        exchange_quantity: Decimal,
        /// When detected
        timestamp: DateTime<Utc>,
    },

    /// Stored quantity corrected to the exchange value
    QuantityUpdated {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Previous stored quantity
        previous_quantity: Decimal,
        /// New stored quantity
        new_quantity: Decimal,
        /// When updated
        timestamp: DateTime<Utc>,
    },

    /// Stored active position not present on the exchange
    PhantomPositionDetected {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// When detected
        timestamp: DateTime<Utc>,
    },

    /// Phantom position marked closed
    PhantomPositionClosed {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Exit reason written to the store
        reason: String,
        /// When closed
        timestamp: DateTime<Utc>,
    },

    /// Exchange-only position not adopted
    MissingPositionRejected {
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Why it was rejected
        reason: String,
        /// When rejected
        timestamp: DateTime<Utc>,
    },

    /// Exchange-only position adopted into the store
    MissingPositionAdded {
        /// New position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Direction
        side: Side,
        /// Size
        quantity: Decimal,
        /// Entry price reported by the exchange
        entry_price: Decimal,
        /// Exchange-native order/position id
        exchange_order_id: String,
        /// When added
        timestamp: DateTime<Utc>,
    },

    /// Position crossed the maximum age and is now tracked
    AgedPositionDetected {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Age when detected
        hours_aged: Decimal,
        /// Initial phase
        phase: AgedPhase,
        /// Initial target
        target_price: Decimal,
        /// When detected
        timestamp: DateTime<Utc>,
    },

    /// Aged position moved to a later phase
    AgedPhaseChanged {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Previous phase
        from: AgedPhase,
        /// New phase
        to: AgedPhase,
        /// New loss tolerance
        loss_tolerance: Decimal,
        /// New target
        target_price: Decimal,
        /// When changed
        timestamp: DateTime<Utc>,
    },

    /// Close condition met for an aged position
    AgedCloseTriggered {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Phase at trigger
        phase: AgedPhase,
        /// Price that triggered
        trigger_price: Decimal,
        /// Target at trigger
        target_price: Decimal,
        /// PnL percent at trigger
        pnl_percent: Decimal,
        /// When triggered
        timestamp: DateTime<Utc>,
    },

    /// Aged position closed on the exchange
    AgedCloseSuccess {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Phase at close
        phase: AgedPhase,
        /// Exchange order id
        order_id: Option<String>,
        /// Order type that succeeded
        order_type: Option<String>,
        /// Fill price
        fill_price: Option<Decimal>,
        /// Total attempts across the cascade
        attempts: u32,
        /// When closed
        timestamp: DateTime<Utc>,
    },

    /// Aged close cascade exhausted; position stays tracked
    AgedCloseFailed {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Phase at failure
        phase: AgedPhase,
        /// Last error
        error: String,
        /// Total attempts across the cascade
        attempts: u32,
        /// When failed
        timestamp: DateTime<Utc>,
    },

    /// Aged position no longer exists on the exchange
    AgedGhostDetected {
        /// Position
        position_id: PositionId,
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// When detected
        timestamp: DateTime<Utc>,
    },

    /// Close order filled/accepted by the exchange
    CloseOrderExecuted {
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Exchange order id
        order_id: String,
        /// Order type that succeeded
        order_type: String,
        /// Fill price (if known)
        fill_price: Option<Decimal>,
        /// Executed amount
        executed_amount: Decimal,
        /// Total attempts
        attempts: u32,
        /// Wall time spent
        elapsed_ms: u64,
        /// Caller-supplied reason
        reason: String,
        /// When executed
        timestamp: DateTime<Utc>,
    },

    /// Close cascade failed
    CloseOrderFailed {
        /// Trading pair
        symbol: Symbol,
        /// Exchange
        exchange: ExchangeId,
        /// Last error message
        error: String,
        /// Last error code
        error_code: Option<String>,
        /// Total attempts
        attempts: u32,
        /// Wall time spent
        elapsed_ms: u64,
        /// Caller-supplied reason
        reason: String,
        /// When failed
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Snake-case event name, as stored in the log's `event_type` column
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::SynchronizationStarted { .. } => "synchronization_started",
            EngineEvent::SynchronizationCompleted { .. } => "synchronization_completed",
            EngineEvent::PositionVerified { .. } => "position_verified",
            EngineEvent::QuantityMismatchDetected { .. } => "quantity_mismatch_detected",
            EngineEvent::QuantityUpdated { .. } => "quantity_updated",
            EngineEvent::PhantomPositionDetected { .. } => "phantom_position_detected",
            EngineEvent::PhantomPositionClosed { .. } => "phantom_position_closed",
            EngineEvent::MissingPositionRejected { .. } => "missing_position_rejected",
            EngineEvent::MissingPositionAdded { .. } => "missing_position_added",
            EngineEvent::AgedPositionDetected { .. } => "aged_position_detected",
            EngineEvent::AgedPhaseChanged { .. } => "aged_phase_changed",
            EngineEvent::AgedCloseTriggered { .. } => "aged_close_triggered",
            EngineEvent::AgedCloseSuccess { .. } => "aged_close_success",
            EngineEvent::AgedCloseFailed { .. } => "aged_close_failed",
            EngineEvent::AgedGhostDetected { .. } => "aged_ghost_detected",
            EngineEvent::CloseOrderExecuted { .. } => "close_order_executed",
            EngineEvent::CloseOrderFailed { .. } => "close_order_failed",
        }
    }

    /// Position the event refers to, if any
    pub fn position_id(&self) -> Option<PositionId> {
        match self {
            EngineEvent::PositionVerified { position_id, .. }
            | EngineEvent::QuantityMismatchDetected { position_id, .. }
            | EngineEvent::QuantityUpdated { position_id, .. }
            | EngineEvent::PhantomPositionDetected { position_id, .. }
            | EngineEvent::PhantomPositionClosed { position_id, .. }
            | EngineEvent::MissingPositionAdded { position_id, .. }
            | EngineEvent::AgedPositionDetected { position_id, .. }
            | EngineEvent::AgedPhaseChanged { position_id, .. }
            | EngineEvent::AgedCloseTriggered { position_id, .. }
            | EngineEvent::AgedCloseSuccess { position_id, .. }
            | EngineEvent::AgedCloseFailed { position_id, .. }
            | EngineEvent::AgedGhostDetected { position_id, .. } => Some(*position_id),
            EngineEvent::SynchronizationStarted { .. }
            | EngineEvent::SynchronizationCompleted { .. }
            | EngineEvent::MissingPositionRejected { .. }
            | EngineEvent::CloseOrderExecuted { .. }
            | EngineEvent::CloseOrderFailed { .. } => None,
        }
    }

    /// Symbol the event refers to, if any
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            EngineEvent::SynchronizationStarted { .. }
            | EngineEvent::SynchronizationCompleted { .. } => None,
            EngineEvent::PositionVerified { symbol, .. }
            | EngineEvent::QuantityMismatchDetected { symbol, .. }
            | EngineEvent::QuantityUpdated { symbol, .. }
            | EngineEvent::PhantomPositionDetected { symbol, .. }
            | EngineEvent::PhantomPositionClosed { symbol, .. }
            | EngineEvent::MissingPositionRejected { symbol, .. }
            | EngineEvent::MissingPositionAdded { symbol, .. }
            | EngineEvent::AgedPositionDetected { symbol, .. }
            | EngineEvent::AgedPhaseChanged { symbol, .. }
            | EngineEvent::AgedCloseTriggered { symbol, .. }
            | EngineEvent::AgedCloseSuccess { symbol, .. }
            | EngineEvent::AgedCloseFailed { symbol, .. }
            | EngineEvent::AgedGhostDetected { symbol, .. }
            | EngineEvent::CloseOrderExecuted { symbol, .. }
            | EngineEvent::CloseOrderFailed { symbol, .. } => Some(symbol),
        }
    }

    /// Exchange the event refers to, if any
    pub fn exchange(&self) -> Option<&ExchangeId> {
        match self {
            EngineEvent::AgedPhaseChanged { .. } => None,
            EngineEvent::SynchronizationStarted { exchange, .. }
            | EngineEvent::SynchronizationCompleted { exchange, .. }
            | EngineEvent::PositionVerified { exchange, .. }
            | EngineEvent::QuantityMismatchDetected { exchange, .. }
            | EngineEvent::QuantityUpdated { exchange, .. }
            | EngineEvent::PhantomPositionDetected { exchange, .. }
            | EngineEvent::PhantomPositionClosed { exchange, .. }
            | EngineEvent::MissingPositionRejected { exchange, .. }
            | EngineEvent::MissingPositionAdded { exchange, .. }
            | EngineEvent::AgedPositionDetected { exchange, .. }
            | EngineEvent::AgedCloseTriggered { exchange, .. }
            | EngineEvent::AgedCloseSuccess { exchange, .. }
            | EngineEvent::AgedCloseFailed { exchange, .. }
            | EngineEvent::AgedGhostDetected { exchange, .. }
            | EngineEvent::CloseOrderExecuted { exchange, .. }
            | EngineEvent::CloseOrderFailed { exchange, .. } => Some(exchange),
        }
    }

    /// When the event happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::SynchronizationStarted { timestamp, .. }
            | EngineEvent::SynchronizationCompleted { timestamp, .. }
            | EngineEvent::PositionVerified { timestamp, .. }
            | EngineEvent::QuantityMismatchDetected { timestamp, .. }
            | EngineEvent::QuantityUpdated { timestamp, .. }
            | EngineEvent::PhantomPositionDetected { timestamp, .. }
            | EngineEvent::PhantomPositionClosed { timestamp, .. }
            | EngineEvent::MissingPositionRejected { timestamp, .. }
            | EngineEvent::MissingPositionAdded { timestamp, .. }
            | EngineEvent::AgedPositionDetected { timestamp, .. }
            | EngineEvent::AgedPhaseChanged { timestamp, .. }
            | EngineEvent::AgedCloseTriggered { timestamp, .. }
            | EngineEvent::AgedCloseSuccess { timestamp, .. }
            | EngineEvent::AgedCloseFailed { timestamp, .. }
            | EngineEvent::AgedGhostDetected { timestamp, .. }
            | EngineEvent::CloseOrderExecuted { timestamp, .. }
            | EngineEvent::CloseOrderFailed { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_serialized_tag_matches_event_type() {
        let event = EngineEvent::QuantityUpdated {
            position_id: PositionId::new(),
            symbol: Symbol::from_pair("ETHUSDT").unwrap(),
            exchange: ExchangeId::new("bybit").unwrap(),
            previous_quantity: dec!(1.5),
            new_quantity: dec!(1.2),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
        assert_eq!(json["symbol"], "ETHUSDT");
        assert_eq!(json["exchange"], "bybit");
    }

    #[test]
    fn test_accessors() {
        let rejected = EngineEvent::MissingPositionRejected {
            symbol: Symbol::from_pair("SOLUSDT").unwrap(),
            exchange: ExchangeId::new("binance").unwrap(),
            reason: "no order id".to_string(),
            timestamp: Utc::now(),
        };
        assert!(rejected.position_id().is_none());
        assert_eq!(rejected.symbol().unwrap().as_pair(), "SOLUSDT");
        assert_eq!(rejected.exchange().unwrap().as_str(), "binance");
    }
}
