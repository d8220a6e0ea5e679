//! Warden Daemon Library
//!
//! Runtime for the position lifecycle reconciliation engine.
//!
//! # Architecture
//!
//! ```text
//! ticks → PriceBus → AgedPositionAdapter → AgedPositionMonitor → OrderExecutor → Exchange
//!            │                                     │
//!            └── TrailingStopAdapter               └── Store (records, events)
//!
//! PositionSynchronizer ── every interval ──► Exchange ⇄ Store
//! ```
//!
//! # Components
//!
//! - **Daemon**: wires components, owns background loops, graceful shutdown
//! - **PriceBus**: per-symbol fan-out with throttling and self-healing
//! - **Adapters**: bus subscriptions with liveness verification
//! - **AgedPositionMonitor**: grace → progressive → stale liquidation
//! - **PositionSynchronizer**: store/exchange reconciliation
//! - **API**: operational HTTP endpoints
//! - **Config**: environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use wardend::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     Daemon::new_stub(config)?.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod adapters;
pub mod aged_monitor;
pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod metrics;
pub mod price_bus;
pub mod synchronizer;

// Re-exports for convenience
pub use adapters::{
    AdapterHealth, AgedPositionAdapter, RegistrationOutcome, TrailingStopAdapter,
    TrailingStopModule,
};
pub use aged_monitor::{
    AgedPositionMonitor, AgedStats, CloseOutcome, RecoveryReport, ScanReport, TrackingChange,
};
pub use config::{AgedConfig, ApiConfig, Config, Environment, PriceBusConfig, SyncConfig};
pub use daemon::{Daemon, Engine, HealthReport};
pub use error::{DaemonError, DaemonResult};
pub use metrics::{EngineStats, Metrics};
pub use price_bus::{
    BusStats, NoopPriceFeed, PriceBus, PriceFeed, PriceHandler, PriceTick, Staleness,
    SubscriptionId, AGED_MODULE, TRAILING_STOP_MODULE,
};
pub use synchronizer::{
    find_discrepancies, PositionSynchronizer, ReconcilePlan, SyncReport, SyncStats,
};
