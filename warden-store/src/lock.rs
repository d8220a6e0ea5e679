//! Advisory locks serialising check-then-insert of active positions.
//!
//! ```text
//! writer A ── lock(BTCUSDT@binance) ── find_active_by_symbol ── save ── release
//! writer B ── lock(BTCUSDT@binance) ······· waits ·········· find → AlreadyPresent
//! ```
//!
//! Every path that may create an active position goes through
//! [`insert_active_exclusive`], which is what keeps the one-active-position
//! per (symbol, exchange) invariant under concurrent writers.

use sha2::{Digest, Sha256};
use std::fmt;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use warden_domain::{ExchangeId, Position, PositionId, Symbol};

use crate::error::StoreError;
use crate::repository::Store;

// =============================================================================
// LockKey
// =============================================================================

/// 64-bit advisory lock key derived from (symbol, exchange)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    /// Key guarding the active position of `symbol` on `exchange`
    pub fn for_position(symbol: &Symbol, exchange: &ExchangeId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(exchange.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(symbol.as_pair().as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(i64::from_be_bytes(bytes))
    }

    /// Raw key (the `bigint` passed to `pg_advisory_xact_lock`)
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// AdvisoryLock guard
// =============================================================================

enum LockGuard {
    Memory(OwnedMutexGuard<()>),
    #[cfg(feature = "postgres")]
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
}

/// Held advisory lock. Dropping it releases the lock as well; `release`
/// additionally reports backend errors.
pub struct AdvisoryLock {
    key: LockKey,
    guard: LockGuard,
}

impl AdvisoryLock {
    pub(crate) fn memory(key: LockKey, guard: OwnedMutexGuard<()>) -> Self {
        Self { key, guard: LockGuard::Memory(guard) }
    }

    #[cfg(feature = "postgres")]
    pub(crate) fn postgres(key: LockKey, tx: sqlx::Transaction<'static, sqlx::Postgres>) -> Self {
        Self { key, guard: LockGuard::Postgres(tx) }
    }

    /// Key this guard holds
    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Release the lock
    pub async fn release(self) -> Result<(), StoreError> {
        match self.guard {
            LockGuard::Memory(guard) => {
                drop(guard);
                Ok(())
            },
            #[cfg(feature = "postgres")]
            LockGuard::Postgres(tx) => {
                // xact locks are released at transaction end
                tx.commit().await?;
                Ok(())
            },
        }
    }
}

impl fmt::Debug for AdvisoryLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvisoryLock").field("key", &self.key).finish()
    }
}

// =============================================================================
// Guarded insert
// =============================================================================

/// Result of [`insert_active_exclusive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The position was written
    Inserted,
    /// Another writer already holds an active position for the key
    AlreadyPresent(PositionId),
}

/// Insert `position` unless an active position for its (symbol, exchange)
/// already exists, holding the advisory lock across the check and the write.
pub async fn insert_active_exclusive<S: Store + ?Sized>(
    store: &S,
    position: &Position,
) -> Result<InsertOutcome, StoreError> {
    let key = LockKey::for_position(&position.symbol, &position.exchange);
    let lock = store.advisory_lock(key).await?;

    let result = async {
        if let Some(existing) = store
            .positions()
            .find_active_by_symbol(&position.symbol, &position.exchange)
            .await?
        {
            return Ok(InsertOutcome::AlreadyPresent(existing.id));
        }
        store.positions().save(position).await?;
        Ok::<_, StoreError>(InsertOutcome::Inserted)
    }
    .await;

    let released = lock.release().await;
    let outcome = result?;
    released?;

    debug!(
        symbol = %position.symbol,
        exchange = %position.exchange,
        %key,
        ?outcome,
        "Guarded insert finished"
    );
    Ok(outcome)
}
