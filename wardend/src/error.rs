//! Daemon error types.

use thiserror::Error;
use warden_domain::{DomainError, PositionId};
use warden_exec::ExecError;
use warden_store::StoreError;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Execution error
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Position not found
    #[error("Position not found: {0}")]
    PositionNotFound(PositionId),

    /// Price bus subscription error
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Price handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
