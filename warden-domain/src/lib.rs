//! Warden Domain Layer
//!
//! Pure domain logic with zero I/O dependencies: positions, identifiers,
//! the aged-position policy, reconciliation discrepancies and engine events.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aged;
pub mod entities;
pub mod events;
pub mod reconciliation;
pub mod value_objects;

// Re-export commonly used types
pub use aged::{
    AgedPhase, AgedPolicy, AgedPositionRecord, AgedPositionTarget, AgedRecordStatus,
    CloseTrigger, PhaseChange, PhaseTarget,
};
pub use entities::{hours_between, Position, PositionId, PositionStatus};
pub use events::EngineEvent;
pub use reconciliation::{DiscrepancyKind, PositionDiscrepancy};
pub use value_objects::{DomainError, ExchangeId, OrderSide, Price, Quantity, Side, Symbol};
