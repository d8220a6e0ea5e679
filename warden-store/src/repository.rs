//! Repository trait definitions (Ports)
//!
//! These traits define the storage interface for the engine.
//! Implementations can be PostgreSQL, in-memory, or mock for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use warden_domain::{
    AgedPositionRecord, AgedRecordStatus, EngineEvent, ExchangeId, Position, PositionId,
    Quantity, Symbol,
};

use crate::error::StoreError;
use crate::lock::{AdvisoryLock, LockKey};

/// Repository for Position entities
#[async_trait]
pub trait PositionRepository: Send + Sync {
    /// Save a position (insert or update)
    async fn save(&self, position: &Position) -> Result<(), StoreError>;

    /// Find a position by ID
    async fn find_by_id(&self, id: PositionId) -> Result<Option<Position>, StoreError>;

    /// Find all active positions across exchanges
    async fn find_active(&self) -> Result<Vec<Position>, StoreError>;

    /// Find active positions held on one exchange
    async fn find_active_by_exchange(
        &self,
        exchange: &ExchangeId,
    ) -> Result<Vec<Position>, StoreError>;

    /// Find the active position for (symbol, exchange), if any
    async fn find_active_by_symbol(
        &self,
        symbol: &Symbol,
        exchange: &ExchangeId,
    ) -> Result<Option<Position>, StoreError>;

    /// Overwrite the stored quantity
    async fn update_quantity(&self, id: PositionId, quantity: Quantity) -> Result<(), StoreError>;

    /// Mark a position closed.
    ///
    /// Returns `false` when the position was already terminal (no change).
    async fn mark_closed(
        &self,
        id: PositionId,
        reason: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Repository for persisted aged-position records (crash recovery)
#[async_trait]
pub trait AgedPositionRepository: Send + Sync {
    /// Insert or replace the record for its position
    async fn upsert(&self, record: &AgedPositionRecord) -> Result<(), StoreError>;

    /// Records with status `active`
    async fn find_active(&self) -> Result<Vec<AgedPositionRecord>, StoreError>;

    /// Record for one position
    async fn find_by_position(
        &self,
        position_id: PositionId,
    ) -> Result<Option<AgedPositionRecord>, StoreError>;

    /// Change a record's status
    async fn update_status(
        &self,
        position_id: PositionId,
        status: AgedRecordStatus,
    ) -> Result<(), StoreError>;

    /// Delete non-active records last written before `older_than`
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Repository for engine events (append-only)
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append an event to the log, returning its sequence number
    async fn append(&self, event: &EngineEvent) -> Result<i64, StoreError>;

    /// Most recent `limit` events, oldest first
    async fn find_recent(&self, limit: usize) -> Result<Vec<EngineEvent>, StoreError>;

    /// All events of one type, oldest first
    async fn find_by_type(&self, event_type: &str) -> Result<Vec<EngineEvent>, StoreError>;

    /// Number of events in the log
    async fn count(&self) -> Result<i64, StoreError>;
}

/// Combined store interface
#[async_trait]
pub trait Store: Send + Sync {
    /// Get position repository
    fn positions(&self) -> &dyn PositionRepository;

    /// Get aged-position record repository
    fn aged_positions(&self) -> &dyn AgedPositionRepository;

    /// Get event repository
    fn events(&self) -> &dyn EventRepository;

    /// Acquire the advisory lock for `key`, waiting if another writer holds it.
    ///
    /// The lock is held until the returned guard is released or dropped.
    async fn advisory_lock(&self, key: LockKey) -> Result<AdvisoryLock, StoreError>;
}
