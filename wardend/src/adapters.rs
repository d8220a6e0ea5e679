//! Protection adapters: bridges between risk modules and the price bus.
//!
//! Each adapter owns its module's subscriptions. A symbol only counts as
//! registered once a real tick has been observed after subscribing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_domain::Symbol;
use warden_store::Store;

use crate::aged_monitor::{AgedPositionMonitor, TrackingChange};
use crate::error::DaemonResult;
use crate::price_bus::{
    PriceBus, PriceHandler, PriceTick, SubscriptionId, AGED_MODULE, TRAILING_STOP_MODULE,
};

/// Dispatch priority of the aged-position module
pub const AGED_PRIORITY: i32 = 50;

/// Dispatch priority of the trailing-stop module (runs before liquidation)
pub const TRAILING_STOP_PRIORITY: i32 = 10;

// =============================================================================
// Shared registration bookkeeping
// =============================================================================

/// Outcome of registering a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    /// Subscribed and a tick was observed
    Registered,
    /// The module was already subscribed
    AlreadyRegistered,
    /// Subscribed but no tick arrived within the liveness timeout
    Unverified,
}

/// Health report for one adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdapterHealth {
    /// Bus module name
    pub module: String,
    /// Symbols with a live subscription
    pub registered: Vec<Symbol>,
    /// Subscribed but never confirmed live
    pub unverified: Vec<Symbol>,
    /// Past the module's staleness threshold
    pub stale: Vec<Symbol>,
    /// No unverified or stale symbols
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    subscription_id: SubscriptionId,
    verified: bool,
}

/// Subscription table shared by both adapters.
struct Registrations {
    bus: Arc<PriceBus>,
    module: &'static str,
    priority: i32,
    liveness_timeout: Duration,
    entries: Mutex<HashMap<Symbol, Registration>>,
}

impl Registrations {
    fn new(bus: Arc<PriceBus>, module: &'static str, priority: i32, liveness_timeout: Duration) -> Self {
        Self { bus, module, priority, liveness_timeout, entries: Mutex::new(HashMap::new()) }
    }

    async fn register(
        &self,
        symbol: &Symbol,
        handler: Arc<dyn PriceHandler>,
    ) -> DaemonResult<RegistrationOutcome> {
        let waiter = {
            let mut entries = self.entries.lock().await;
            if entries.contains_key(symbol) || self.bus.is_subscribed(symbol, self.module).await {
                debug!(%symbol, module = self.module, "Already subscribed");
                return Ok(RegistrationOutcome::AlreadyRegistered);
            }
            let waiter = self.bus.watch_updates(symbol).await;
            let subscription_id =
                self.bus.subscribe(symbol, handler, self.module, self.priority).await?;
            entries.insert(symbol.clone(), Registration { subscription_id, verified: false });
            waiter
        };

        if !waiter.wait(self.liveness_timeout).await {
            warn!(
                %symbol,
                module = self.module,
                timeout_ms = self.liveness_timeout.as_millis() as u64,
                "Subscription not confirmed live"
            );
            return Ok(RegistrationOutcome::Unverified);
        }

        if let Some(entry) = self.entries.lock().await.get_mut(symbol) {
            entry.verified = true;
        }
        info!(%symbol, module = self.module, "Symbol registered");
        Ok(RegistrationOutcome::Registered)
    }

    async fn unregister(&self, symbol: &Symbol) -> bool {
        let Some(entry) = self.entries.lock().await.remove(symbol) else {
            return false;
        };
        let removed = self.bus.unsubscribe(symbol, entry.subscription_id).await;
        info!(%symbol, module = self.module, "Symbol unregistered");
        removed
    }

    async fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.entries.lock().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    async fn health(&self) -> AdapterHealth {
        let symbols = self.symbols().await;
        let staleness = self.bus.check_staleness(&symbols, self.module).await;

        let mut entries = self.entries.lock().await;
        let mut health = AdapterHealth { module: self.module.to_string(), ..AdapterHealth::default() };

        for report in staleness {
            let Some(entry) = entries.get_mut(&report.symbol) else {
                continue;
            };
            // A fresh tick since subscribing confirms liveness late.
            if !entry.verified && report.received && !report.is_stale {
                entry.verified = true;
            }

            if report.is_stale {
                health.stale.push(report.symbol.clone());
            }
            if entry.verified {
                health.registered.push(report.symbol);
            } else {
                health.unverified.push(report.symbol);
            }
        }

        health.healthy = health.unverified.is_empty() && health.stale.is_empty();
        health
    }
}

// =============================================================================
// AgedPositionAdapter
// =============================================================================

/// Forwards ticks to the aged-position monitor.
struct AgedPriceHandler<S: Store + ?Sized> {
    monitor: Arc<AgedPositionMonitor<S>>,
}

#[async_trait]
impl<S: Store + ?Sized + 'static> PriceHandler for AgedPriceHandler<S> {
    async fn on_price(&self, tick: &PriceTick) -> DaemonResult<()> {
        let closed = self.monitor.check_price_target(&tick.symbol, tick.price).await?;
        if !closed.is_empty() {
            debug!(symbol = %tick.symbol, closed = closed.len(), "Aged positions closed on tick");
        }
        Ok(())
    }
}

/// Keeps the price bus subscribed to every symbol the aged monitor tracks.
pub struct AgedPositionAdapter<S: Store + ?Sized> {
    monitor: Arc<AgedPositionMonitor<S>>,
    registrations: Registrations,
}

impl<S: Store + ?Sized + 'static> AgedPositionAdapter<S> {
    /// Create an adapter. `liveness_timeout` bounds the wait for a first tick.
    pub fn new(
        bus: Arc<PriceBus>,
        monitor: Arc<AgedPositionMonitor<S>>,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            monitor,
            registrations: Registrations::new(bus, AGED_MODULE, AGED_PRIORITY, liveness_timeout),
        }
    }

    /// Subscribe the monitor to `symbol` and verify the feed is live.
    pub async fn register_symbol(&self, symbol: &Symbol) -> DaemonResult<RegistrationOutcome> {
        let handler = Arc::new(AgedPriceHandler { monitor: self.monitor.clone() });
        self.registrations.register(symbol, handler).await
    }

    /// Drop the subscription for `symbol`
    pub async fn unregister_symbol(&self, symbol: &Symbol) -> bool {
        self.registrations.unregister(symbol).await
    }

    /// Symbols currently subscribed
    pub async fn registered_symbols(&self) -> Vec<Symbol> {
        self.registrations.symbols().await
    }

    /// Registered, unverified and stale symbols
    pub async fn check_health(&self) -> AdapterHealth {
        self.registrations.health().await
    }

    /// Align subscriptions with the monitor's tracked symbols.
    pub async fn reconcile_subscriptions(self: &Arc<Self>) {
        let tracked = self.monitor.tracked_symbols().await;
        let registered = self.registered_symbols().await;

        for symbol in registered.iter().filter(|s| !tracked.contains(s)) {
            self.unregister_symbol(symbol).await;
        }
        for symbol in tracked.into_iter().filter(|s| !registered.contains(s)) {
            self.spawn_register(symbol);
        }
    }

    fn spawn_register(self: &Arc<Self>, symbol: Symbol) {
        let adapter = self.clone();
        tokio::spawn(async move { adapter.register_tracked(&symbol).await });
    }

    /// Register `symbol`, then release it again if the monitor stopped
    /// tracking it while the registration was in flight.
    async fn register_tracked(&self, symbol: &Symbol) {
        if let Err(e) = self.register_symbol(symbol).await {
            warn!(%symbol, error = %e, "Aged symbol registration failed");
        }
        if !self.monitor.tracked_symbols().await.contains(symbol)
            && self.unregister_symbol(symbol).await
        {
            debug!(%symbol, "Symbol untracked during registration, subscription released");
        }
    }

    /// Follow the monitor's tracking changes until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut changes = self.monitor.subscribe_tracking();
        self.reconcile_subscriptions().await;
        info!("Aged position adapter started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Aged position adapter shutdown requested");
                    break;
                }
                change = changes.recv() => match change {
                    Ok(TrackingChange::Added(symbol)) => self.spawn_register(symbol),
                    Ok(TrackingChange::Removed(symbol)) => {
                        self.unregister_symbol(&symbol).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Tracking changes lagged, resyncing");
                        self.reconcile_subscriptions().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

// =============================================================================
// TrailingStopAdapter
// =============================================================================

/// External trailing-stop logic.
#[async_trait]
pub trait TrailingStopModule: Send + Sync {
    /// Handle one tick for a symbol the module follows
    async fn on_price(&self, tick: &PriceTick) -> DaemonResult<()>;
}

struct TrailingStopHandler(Arc<dyn TrailingStopModule>);

#[async_trait]
impl PriceHandler for TrailingStopHandler {
    async fn on_price(&self, tick: &PriceTick) -> DaemonResult<()> {
        self.0.on_price(tick).await
    }
}

/// Subscribes an external trailing-stop module ahead of liquidation.
pub struct TrailingStopAdapter {
    module: Arc<dyn TrailingStopModule>,
    registrations: Registrations,
}

impl TrailingStopAdapter {
    /// Create an adapter for `module`
    pub fn new(
        bus: Arc<PriceBus>,
        module: Arc<dyn TrailingStopModule>,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            module,
            registrations: Registrations::new(
                bus,
                TRAILING_STOP_MODULE,
                TRAILING_STOP_PRIORITY,
                liveness_timeout,
            ),
        }
    }

    /// Subscribe the module to `symbol`
    pub async fn register_symbol(&self, symbol: &Symbol) -> DaemonResult<RegistrationOutcome> {
        let handler = Arc::new(TrailingStopHandler(self.module.clone()));
        self.registrations.register(symbol, handler).await
    }

    /// Drop the subscription for `symbol`
    pub async fn unregister_symbol(&self, symbol: &Symbol) -> bool {
        self.registrations.unregister(symbol).await
    }

    /// Registered, unverified and stale symbols
    pub async fn check_health(&self) -> AdapterHealth {
        self.registrations.health().await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgedConfig, Config};
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;
    use chrono::{Duration as ChronoDuration, Utc};
    use warden_domain::{ExchangeId, Position, Price, Quantity, Side};
    use warden_exec::{CloseConfig, Gateways, NoopEventSink, OrderExecutor};
    use warden_store::MemoryStore;

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    fn bus() -> Arc<PriceBus> {
        Arc::new(PriceBus::standalone(Config::test().price_bus))
    }

    fn monitor() -> Arc<AgedPositionMonitor<MemoryStore>> {
        let executor = Arc::new(OrderExecutor::new(Gateways::new(), CloseConfig::default()));
        Arc::new(AgedPositionMonitor::new(
            AgedConfig::default(),
            Arc::new(MemoryStore::new()),
            executor,
            Arc::new(NoopEventSink),
        ))
    }

    fn aged_position() -> Position {
        Position::new_active(
            btc(),
            ExchangeId::new("binance").unwrap(),
            Side::Long,
            Quantity::new(dec!(0.5)).unwrap(),
            Price::new(dec!(42000)).unwrap(),
            "ord-1".to_string(),
        )
        .with_opened_at(Utc::now() - ChronoDuration::hours(4))
    }

    #[derive(Default)]
    struct RecordingTrailingStop {
        seen: StdMutex<Vec<Symbol>>,
    }

    #[async_trait]
    impl TrailingStopModule for RecordingTrailingStop {
        async fn on_price(&self, tick: &PriceTick) -> DaemonResult<()> {
            self.seen.lock().unwrap().push(tick.symbol.clone());
            Ok(())
        }
    }

    async fn publish_after(bus: Arc<PriceBus>, delay: Duration) {
        tokio::time::sleep(delay).await;
        bus.update_price(&btc(), Price::new(dec!(42000)).unwrap()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_verifies_liveness() {
        let bus = bus();
        let adapter = AgedPositionAdapter::new(bus.clone(), monitor(), Duration::from_secs(5));

        let symbol = btc();
        let (outcome, _) = tokio::join!(
            adapter.register_symbol(&symbol),
            publish_after(bus.clone(), Duration::from_millis(100)),
        );

        assert_eq!(outcome.unwrap(), RegistrationOutcome::Registered);
        let health = adapter.check_health().await;
        assert_eq!(health.registered, vec![btc()]);
        assert!(health.healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_is_guarded() {
        let bus = bus();
        let adapter = AgedPositionAdapter::new(bus.clone(), monitor(), Duration::from_millis(50));

        assert_eq!(adapter.register_symbol(&btc()).await.unwrap(), RegistrationOutcome::Unverified);
        assert_eq!(
            adapter.register_symbol(&btc()).await.unwrap(),
            RegistrationOutcome::AlreadyRegistered
        );
        assert_eq!(bus.stats().await.subscriptions, 1);

        let health = adapter.check_health().await;
        assert_eq!(health.unverified, vec![btc()]);
        assert!(!health.healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_tick_confirms_unverified_symbol() {
        let bus = bus();
        let adapter = AgedPositionAdapter::new(bus.clone(), monitor(), Duration::from_millis(50));
        adapter.register_symbol(&btc()).await.unwrap();

        bus.update_price(&btc(), Price::new(dec!(42000)).unwrap()).await;

        let health = adapter.check_health().await;
        assert_eq!(health.registered, vec![btc()]);
        assert!(health.unverified.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_releases_bus_subscription() {
        let bus = bus();
        let adapter = AgedPositionAdapter::new(bus.clone(), monitor(), Duration::from_millis(50));
        adapter.register_symbol(&btc()).await.unwrap();

        assert!(adapter.unregister_symbol(&btc()).await);
        assert!(!adapter.unregister_symbol(&btc()).await);
        assert!(!bus.is_subscribed(&btc(), AGED_MODULE).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trailing_stop_receives_ticks_at_higher_priority() {
        let bus = bus();
        let module = Arc::new(RecordingTrailingStop::default());
        let trailing = TrailingStopAdapter::new(bus.clone(), module.clone(), Duration::from_secs(1));
        let aged = AgedPositionAdapter::new(bus.clone(), monitor(), Duration::from_millis(10));

        aged.register_symbol(&btc()).await.unwrap();
        let symbol = btc();
        let (outcome, _) = tokio::join!(
            trailing.register_symbol(&symbol),
            publish_after(bus.clone(), Duration::from_millis(10)),
        );
        assert_eq!(outcome.unwrap(), RegistrationOutcome::Registered);

        // let the worker drain
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(module.seen.lock().unwrap().as_slice(), &[btc()]);
        // registered second, queued first
        assert_eq!(bus.dispatch_order(&btc()).await, vec![TRAILING_STOP_MODULE, AGED_MODULE]);
        assert_eq!(bus.symbols_for(AGED_MODULE).await, vec![btc()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_finishing_after_untrack_is_released() {
        let bus = bus();
        let adapter = AgedPositionAdapter::new(bus.clone(), monitor(), Duration::from_millis(50));

        // the monitor tracks nothing, as after a Removed that raced the spawn
        adapter.register_tracked(&btc()).await;

        assert!(adapter.registered_symbols().await.is_empty());
        assert!(!bus.is_subscribed(&btc(), AGED_MODULE).await);
        assert_eq!(bus.stats().await.subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_of_tracked_symbol_is_kept() {
        let bus = bus();
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(OrderExecutor::new(Gateways::new(), CloseConfig::default()));
        let monitor = Arc::new(AgedPositionMonitor::new(
            AgedConfig::default(),
            store,
            executor,
            Arc::new(NoopEventSink),
        ));
        let position = aged_position();
        assert!(monitor.add_aged_position(&position).await.unwrap());
        let adapter = AgedPositionAdapter::new(bus.clone(), monitor, Duration::from_millis(50));

        adapter.register_tracked(&btc()).await;

        assert_eq!(adapter.registered_symbols().await, vec![btc()]);
        assert!(bus.is_subscribed(&btc(), AGED_MODULE).await);
    }
}
