//! Domain Entities
//!
//! The persisted position record and its identifier.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::value_objects::{DomainError, ExchangeId, Price, Quantity, Side, Symbol};

// =============================================================================
// PositionId
// =============================================================================

/// Opaque position identifier.
///
/// Time-ordered (UUID v7). The same value is used from creation through
/// persistence, events and aged-position records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(Uuid);

impl PositionId {
    /// Generate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID (e.g., read back from storage)
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PositionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PositionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidValue(format!("Invalid position id {}: {}", s, e)))
    }
}

// =============================================================================
// PositionStatus
// =============================================================================

/// Lifecycle status of a persisted position.
///
/// ```text
/// PendingEntry → EntryPlaced → PendingSl → Active → Closed
///        └──────────┴────────────┴──────────→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Signal accepted, entry not yet sent
    PendingEntry,
    /// Entry order sent to exchange
    EntryPlaced,
    /// Entry filled, protective stop not yet confirmed
    PendingSl,
    /// Open on the exchange
    Active,
    /// Closed (terminal)
    Closed,
    /// Entry or protection failed (terminal)
    Failed,
}

impl PositionStatus {
    /// Storage spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::PendingEntry => "pending_entry",
            PositionStatus::EntryPlaced => "entry_placed",
            PositionStatus::PendingSl => "pending_sl",
            PositionStatus::Active => "active",
            PositionStatus::Closed => "closed",
            PositionStatus::Failed => "failed",
        }
    }

    /// Closed or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Failed)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_entry" => Ok(PositionStatus::PendingEntry),
            "entry_placed" => Ok(PositionStatus::EntryPlaced),
            "pending_sl" => Ok(PositionStatus::PendingSl),
            "active" => Ok(PositionStatus::Active),
            "closed" => Ok(PositionStatus::Closed),
            "failed" => Ok(PositionStatus::Failed),
            other => Err(DomainError::InvalidValue(format!("Unknown position status: {}", other))),
        }
    }
}

// =============================================================================
// Position
// =============================================================================

/// A leveraged derivatives position as recorded by the engine.
///
/// # Invariants
/// - At most one `Active` position per (symbol, exchange); enforced by the
///   store's advisory lock, not by this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier
    pub id: PositionId,
    /// Trading pair
    pub symbol: Symbol,
    /// Exchange account holding the position
    pub exchange: ExchangeId,
    /// Direction
    pub side: Side,
    /// Size in contracts
    pub quantity: Quantity,
    /// Average entry price
    pub entry_price: Price,
    /// Last observed mark/trade price
    pub current_price: Option<Price>,
    /// Lifecycle status
    pub status: PositionStatus,
    /// Exchange order (or position) id that opened the position
    pub exchange_order_id: Option<String>,
    /// Protective stop order id
    pub protective_order_id: Option<String>,
    /// When the position was opened
    pub opened_at: DateTime<Utc>,
    /// When the position was closed
    pub closed_at: Option<DateTime<Utc>>,
    /// Why the position was closed (e.g., "aged_grace", "not found on exchange")
    pub exit_reason: Option<String>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a new position awaiting entry
    pub fn new(
        symbol: Symbol,
        exchange: ExchangeId,
        side: Side,
        quantity: Quantity,
        entry_price: Price,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PositionId::new(),
            symbol,
            exchange,
            side,
            quantity,
            entry_price,
            current_price: None,
            status: PositionStatus::PendingEntry,
            exchange_order_id: None,
            protective_order_id: None,
            opened_at: now,
            closed_at: None,
            exit_reason: None,
            updated_at: now,
        }
    }

    /// Create an already-open position (adopted from exchange state)
    pub fn new_active(
        symbol: Symbol,
        exchange: ExchangeId,
        side: Side,
        quantity: Quantity,
        entry_price: Price,
        exchange_order_id: String,
    ) -> Self {
        let mut position = Self::new(symbol, exchange, side, quantity, entry_price);
        position.status = PositionStatus::Active;
        position.exchange_order_id = Some(exchange_order_id);
        position
    }

    /// Backdate the opening time (recovery, tests)
    pub fn with_opened_at(mut self, opened_at: DateTime<Utc>) -> Self {
        self.opened_at = opened_at;
        self
    }

    /// Is the position open on the exchange
    pub fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    /// Mark the entry as filled and the position live
    ///
    /// # Errors
    /// Fails if the position is already terminal.
    pub fn activate(&mut self) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidStateTransition(format!(
                "Cannot activate position in {} state",
                self.status
            )));
        }
        self.status = PositionStatus::Active;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the position closed
    ///
    /// # Errors
    /// Fails if the position is already terminal.
    pub fn close(&mut self, reason: &str, at: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidStateTransition(format!(
                "Position {} already {}",
                self.id, self.status
            )));
        }
        self.status = PositionStatus::Closed;
        self.closed_at = Some(at);
        self.exit_reason = Some(reason.to_string());
        self.updated_at = at;
        Ok(())
    }

    /// Age in (fractional) hours at `now`
    pub fn age_hours(&self, now: DateTime<Utc>) -> Decimal {
        hours_between(self.opened_at, now)
    }

    /// Unrealized PnL in percent of entry at `price`
    pub fn pnl_percent(&self, price: Price) -> Decimal {
        self.side.pnl_percent(self.entry_price.as_decimal(), price.as_decimal())
    }
}

/// Fractional hours between two instants (negative if `to` precedes `from`)
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    let seconds = to.signed_duration_since(from).num_seconds();
    Decimal::from(seconds) / Decimal::from(3600)
}

// =============================================================================
// Tests
// =============================================================================
