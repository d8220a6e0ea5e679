//! Daemon: wires the engine components and owns their background loops.
//!
//! # Lifecycle
//!
//! 1. Recover aged-position state from the store
//! 2. Spawn reconciliation, aged scan/validation, price health and adapter loops
//! 3. Start the API server
//! 4. Wait for SIGINT (or the shutdown token)
//! 5. Cancel every loop and wait for them to finish
//! 6. Persist aged-position state

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_exec::{EventSink, ExchangePort, Gateways, OrderExecutor, StoreEventSink, StubExchange};
use warden_store::{MemoryStore, Store};

use crate::adapters::{AdapterHealth, AgedPositionAdapter, TrailingStopAdapter, TrailingStopModule};
use crate::aged_monitor::AgedPositionMonitor;
use crate::api::{create_router, ApiState};
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::metrics::{EngineStats, Metrics};
use crate::price_bus::{NoopPriceFeed, PriceBus, PriceFeed};
use crate::synchronizer::PositionSynchronizer;

/// Aged records in a terminal state are deleted after this many days.
const RECORD_RETENTION_DAYS: i64 = 7;

// =============================================================================
// Engine
// =============================================================================

/// Health summary served by `/health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// "healthy" or "degraded"
    pub status: String,
    /// Daemon version
    pub version: String,
    /// Per-adapter subscription health
    pub adapters: Vec<AdapterHealth>,
}

/// The wired component graph.
pub struct Engine<S: Store + ?Sized> {
    /// Persistence
    pub store: Arc<S>,
    /// Close execution
    pub executor: Arc<OrderExecutor>,
    /// Price fan-out
    pub bus: Arc<PriceBus>,
    /// Aged-position state machine
    pub monitor: Arc<AgedPositionMonitor<S>>,
    /// Keeps the bus subscribed for the monitor
    pub aged_adapter: Arc<AgedPositionAdapter<S>>,
    /// Optional trailing-stop bridge
    pub trailing_adapter: Option<Arc<TrailingStopAdapter>>,
    /// Reconciliation
    pub synchronizer: Arc<PositionSynchronizer<S>>,
    /// Prometheus gauges
    pub metrics: Metrics,
}

impl<S: Store + ?Sized + 'static> Engine<S> {
    /// Wire every component. Backoff waits in the executor stop when
    /// `cancel` fires.
    pub fn new(
        config: &Config,
        gateways: Gateways,
        store: Arc<S>,
        feed: Arc<dyn PriceFeed>,
        cancel: &CancellationToken,
    ) -> DaemonResult<Self> {
        config.aged.policy.validate()?;

        let events: Arc<dyn EventSink> = Arc::new(StoreEventSink::new(store.clone()));
        let executor = Arc::new(
            OrderExecutor::new(gateways.clone(), config.executor.clone())
                .with_event_sink(events.clone())
                .with_cancellation(cancel.child_token()),
        );
        let bus = Arc::new(PriceBus::new(config.price_bus.clone(), feed));
        let monitor = Arc::new(AgedPositionMonitor::new(
            config.aged.clone(),
            store.clone(),
            executor.clone(),
            events.clone(),
        ));
        let aged_adapter = Arc::new(AgedPositionAdapter::new(
            bus.clone(),
            monitor.clone(),
            config.price_bus.resubscribe_wait,
        ));
        let synchronizer = Arc::new(PositionSynchronizer::new(
            config.sync.clone(),
            gateways,
            store.clone(),
            events,
        ));

        Ok(Self {
            store,
            executor,
            bus,
            monitor,
            aged_adapter,
            trailing_adapter: None,
            synchronizer,
            metrics: Metrics::new()?,
        })
    }

    /// Attach an external trailing-stop module
    pub fn with_trailing_stop(
        mut self,
        module: Arc<dyn TrailingStopModule>,
        liveness_timeout: std::time::Duration,
    ) -> Self {
        self.trailing_adapter =
            Some(Arc::new(TrailingStopAdapter::new(self.bus.clone(), module, liveness_timeout)));
        self
    }

    /// Stats of every component
    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            aged: self.monitor.get_stats().await,
            sync: self.synchronizer.stats(),
            executor: self.executor.stats(),
            price_bus: self.bus.stats().await,
        }
    }

    /// Adapter health
    pub async fn health(&self) -> HealthReport {
        let mut adapters = vec![self.aged_adapter.check_health().await];
        if let Some(trailing) = &self.trailing_adapter {
            adapters.push(trailing.check_health().await);
        }
        let healthy = adapters.iter().all(|a| a.healthy);

        HealthReport {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            adapters,
        }
    }

    /// Refresh and render Prometheus metrics
    pub async fn render_metrics(&self) -> DaemonResult<String> {
        let stats = self.stats().await;
        self.metrics.observe(&stats);
        self.metrics.render()
    }
}

// =============================================================================
// Daemon
// =============================================================================

/// The warden daemon.
pub struct Daemon<S: Store + ?Sized + 'static> {
    config: Config,
    engine: Arc<Engine<S>>,
    shutdown: CancellationToken,
}

impl Daemon<MemoryStore> {
    /// Daemon over stub exchanges and an in-memory store.
    pub fn new_stub(config: Config) -> DaemonResult<Self> {
        Self::with_stub_exchanges(config, Arc::new(MemoryStore::new()))
    }
}

impl<S: Store + ?Sized + 'static> Daemon<S> {
    /// Daemon over one stub exchange per configured exchange id.
    pub fn with_stub_exchanges(config: Config, store: Arc<S>) -> DaemonResult<Self> {
        let gateways: Gateways = config
            .exchanges
            .iter()
            .map(|id| (id.clone(), Arc::new(StubExchange::new(id.clone())) as Arc<dyn ExchangePort>))
            .collect();
        let shutdown = CancellationToken::new();
        let engine = Engine::new(&config, gateways, store, Arc::new(NoopPriceFeed), &shutdown)?;
        Ok(Self::new(config, engine, shutdown))
    }

    /// Daemon over an already wired engine. `shutdown` must be the token the
    /// engine was built with.
    pub fn new(config: Config, engine: Engine<S>, shutdown: CancellationToken) -> Self {
        Self { config, engine: Arc::new(engine), shutdown }
    }

    /// The wired components
    pub fn engine(&self) -> Arc<Engine<S>> {
        self.engine.clone()
    }

    /// Cancelling this token shuts the daemon down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until SIGINT or the shutdown token fires.
    pub async fn run(self) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            exchanges = self.config.exchanges.len(),
            "Starting warden daemon"
        );

        // 1. Recover aged state
        self.recover().await?;

        // 2. Background loops
        let handles = self.spawn_loops();

        // 3. API server
        let (api_addr, api_handle) = self.start_api_server().await?;
        info!(%api_addr, "API server started");

        // 4. Wait for shutdown
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
        }

        // 5. Stop loops
        self.shutdown.cancel();
        for handle in futures_util::future::join_all(handles.into_iter().chain([api_handle])).await
        {
            if let Err(e) = handle {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        // 6. Persist
        self.shutdown_persist().await
    }

    async fn recover(&self) -> DaemonResult<()> {
        let report = self.engine.monitor.recover_state().await?;
        info!(recovered = report.recovered, discarded = report.discarded, "Aged state restored");

        let cutoff = Utc::now() - ChronoDuration::days(RECORD_RETENTION_DAYS);
        if let Err(e) = self.engine.monitor.cleanup_stale_records(cutoff).await {
            warn!(error = %e, "Aged record cleanup failed");
        }
        Ok(())
    }

    fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        let engine = &self.engine;
        let token = || self.shutdown.child_token();

        vec![
            tokio::spawn(engine.synchronizer.clone().run(token())),
            tokio::spawn(engine.monitor.clone().run_periodic_scan(token())),
            tokio::spawn(engine.monitor.clone().run_periodic_validation(token())),
            tokio::spawn(engine.bus.clone().run_health_monitor(token())),
            tokio::spawn(engine.aged_adapter.clone().run(token())),
        ]
    }

    /// Bind and serve the API. The server stops with the shutdown token.
    async fn start_api_server(&self) -> DaemonResult<(SocketAddr, JoinHandle<()>)> {
        let state = Arc::new(ApiState { engine: self.engine.clone() });
        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Config(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Config(format!("Failed to get local address: {}", e)))?;

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "API server error");
            }
        });

        Ok((local_addr, handle))
    }

    async fn shutdown_persist(&self) -> DaemonResult<()> {
        info!("Initiating graceful shutdown");
        let persisted = self.engine.monitor.persist_state().await?;
        let stats = self.engine.stats().await;
        info!(
            persisted,
            closes_succeeded = stats.executor.closes_succeeded,
            sync_passes = stats.sync.passes,
            "Shutdown complete"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stub_daemon_wires_every_exchange() {
        let daemon = Daemon::new_stub(Config::test()).unwrap();
        let engine = daemon.engine();

        assert_eq!(engine.synchronizer.exchanges(), Config::test().exchanges);
        assert!(engine.executor.gateway(&Config::test().exchanges[0]).is_some());
        assert_eq!(engine.health().await.status, "healthy");
    }

    #[tokio::test]
    async fn test_invalid_policy_is_rejected() {
        let mut config = Config::test();
        config.aged.policy.max_loss_percent = rust_decimal::Decimal::NEGATIVE_ONE;

        assert!(matches!(Daemon::new_stub(config), Err(DaemonError::Domain(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_token() {
        let daemon = Daemon::new_stub(Config::test()).unwrap();
        let shutdown = daemon.shutdown_token();
        let handle = tokio::spawn(daemon.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
