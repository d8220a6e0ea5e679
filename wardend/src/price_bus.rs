//! Price bus: single ingress for price ticks, fanned out to risk modules.
//!
//! ```text
//! feed ──update_price──▶ PriceBus ──try_send──▶ [trailing_stop  p=10] ─▶ worker ─▶ handler
//!                          │        └─try_send──▶ [aged_position  p=50] ─▶ worker ─▶ handler
//!                          └── last_update / watch ◀── check_staleness, wait_for_update
//! ```
//!
//! Each subscription owns a bounded queue drained by its own task, so a slow
//! or failing handler only ever loses its own ticks. The health loop finds
//! symbols that stopped updating and resubscribes them through the
//! [`PriceFeed`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_domain::{Price, Symbol};

use crate::config::PriceBusConfig;
use crate::error::{DaemonError, DaemonResult};

/// Module name the aged-position adapter subscribes under
pub const AGED_MODULE: &str = "aged_position";

/// Module name the trailing-stop adapter subscribes under
pub const TRAILING_STOP_MODULE: &str = "trailing_stop";

// =============================================================================
// Ports
// =============================================================================

/// One price observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceTick {
    /// Trading pair
    pub symbol: Symbol,
    /// Observed price
    pub price: Price,
    /// When the bus received it
    pub timestamp: DateTime<Utc>,
}

/// Receiver of price ticks.
#[async_trait]
pub trait PriceHandler: Send + Sync {
    /// Handle one tick. Errors are logged and counted by the bus.
    async fn on_price(&self, tick: &PriceTick) -> DaemonResult<()>;
}

/// Upstream subscription control (websocket streams).
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Start streaming `symbol`
    async fn subscribe(&self, symbol: &Symbol) -> DaemonResult<()>;

    /// Stop streaming `symbol`
    async fn unsubscribe(&self, symbol: &Symbol) -> DaemonResult<()>;
}

/// Feed with nothing upstream
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPriceFeed;

#[async_trait]
impl PriceFeed for NoopPriceFeed {
    async fn subscribe(&self, _symbol: &Symbol) -> DaemonResult<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _symbol: &Symbol) -> DaemonResult<()> {
        Ok(())
    }
}

/// Handle returned by [`PriceBus::subscribe`]
pub type SubscriptionId = u64;

/// Armed wait for the next tick of one symbol.
///
/// Ticks published after [`PriceBus::watch_updates`] returns are seen even
/// if they arrive before [`UpdateWaiter::wait`] is polled.
pub struct UpdateWaiter {
    rx: watch::Receiver<u64>,
}

impl UpdateWaiter {
    /// Returns `false` if no tick arrived within `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.rx.changed()).await, Ok(Ok(())))
    }
}

// =============================================================================
// State
// =============================================================================

struct Subscription {
    id: SubscriptionId,
    module: String,
    priority: i32,
    handler: Arc<dyn PriceHandler>,
    sender: mpsc::Sender<PriceTick>,
}

#[derive(Default)]
struct BusState {
    subscriptions: HashMap<Symbol, Vec<Subscription>>,
    subscribed_at: HashMap<Symbol, Instant>,
    last_update: HashMap<Symbol, Instant>,
    last_dispatch: HashMap<Symbol, Instant>,
    stale_warned: HashSet<(String, Symbol)>,
    watchers: HashMap<Symbol, watch::Sender<u64>>,
    stale_thresholds: HashMap<String, Duration>,
    resubscriptions: VecDeque<Instant>,
    rate_alert_raised_at: Option<Instant>,
}

#[derive(Default)]
struct Counters {
    updates: AtomicU64,
    dispatched: AtomicU64,
    throttled: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    handler_errors: AtomicU64,
    handler_panics: AtomicU64,
    stale_warnings: AtomicU64,
    resubscriptions: AtomicU64,
    resubscribe_failures: AtomicU64,
    alerts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Staleness of one symbol for one module
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Staleness {
    /// Trading pair
    pub symbol: Symbol,
    /// Seconds since the last tick (or since subscription if none yet)
    pub seconds_since_update: Option<f64>,
    /// Past the module's threshold
    pub is_stale: bool,
    /// At least one tick has been seen
    pub received: bool,
}

/// Bus counters and sizes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Symbols with at least one subscriber
    pub symbols: usize,
    /// Live subscriptions
    pub subscriptions: usize,
    /// Symbols with a recorded last update
    pub tracked: usize,
    /// `update_price` calls
    pub updates: u64,
    /// Updates that were dispatched (not throttled)
    pub dispatched: u64,
    /// Updates suppressed by the per-symbol interval
    pub throttled: u64,
    /// Ticks dropped because a subscriber queue was full
    pub dropped: u64,
    /// Ticks handled successfully
    pub delivered: u64,
    /// Handler errors
    pub handler_errors: u64,
    /// Handler panics
    pub handler_panics: u64,
    /// Stale warnings logged
    pub stale_warnings: u64,
    /// Resubscriptions performed
    pub resubscriptions: u64,
    /// Symbols that could not be healed
    pub resubscribe_failures: u64,
    /// Alerts raised
    pub alerts: u64,
}

/// Result of one health pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthPass {
    /// Stale symbols found
    pub stale: usize,
    /// Symbols that received a tick after resubscribing
    pub healed: usize,
    /// Symbols still silent after every attempt
    pub failed: usize,
}

// =============================================================================
// PriceBus
// =============================================================================

/// Prioritised price fan-out with staleness tracking.
pub struct PriceBus {
    config: PriceBusConfig,
    feed: Arc<dyn PriceFeed>,
    state: RwLock<BusState>,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

impl PriceBus {
    /// Bus backed by `feed`
    pub fn new(config: PriceBusConfig, feed: Arc<dyn PriceFeed>) -> Self {
        let mut state = BusState::default();
        state.stale_thresholds.insert(AGED_MODULE.to_string(), config.aged_stale_after);

        Self {
            config,
            feed,
            state: RwLock::new(state),
            next_id: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Bus with no upstream feed
    pub fn standalone(config: PriceBusConfig) -> Self {
        Self::new(config, Arc::new(NoopPriceFeed))
    }

    /// Override the staleness threshold for `module`
    pub async fn set_stale_threshold(&self, module: &str, threshold: Duration) {
        self.state.write().await.stale_thresholds.insert(module.to_string(), threshold);
    }

    /// Subscribe `handler` to `symbol`. Lower `priority` dispatches first.
    pub async fn subscribe(
        &self,
        symbol: &Symbol,
        handler: Arc<dyn PriceHandler>,
        module: &str,
        priority: i32,
    ) -> DaemonResult<SubscriptionId> {
        let first = !self.state.read().await.subscriptions.contains_key(symbol);
        if first {
            self.feed.subscribe(symbol).await.map_err(|e| {
                DaemonError::Subscription(format!("feed subscribe {}: {}", symbol, e))
            })?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sender = self.spawn_worker(symbol, module, handler.clone());

        let mut state = self.state.write().await;
        state.subscribed_at.entry(symbol.clone()).or_insert_with(Instant::now);
        let subs = state.subscriptions.entry(symbol.clone()).or_default();
        subs.push(Subscription { id, module: module.to_string(), priority, handler, sender });
        subs.sort_by_key(|s| (s.priority, s.id));

        info!(%symbol, module, priority, subscription_id = id, "Price subscription added");
        Ok(id)
    }

    /// Remove a subscription. Returns `false` if it did not exist.
    pub async fn unsubscribe(&self, symbol: &Symbol, id: SubscriptionId) -> bool {
        let now_empty = {
            let mut state = self.state.write().await;
            let Some(subs) = state.subscriptions.get_mut(symbol) else {
                return false;
            };
            let before = subs.len();
            subs.retain(|s| s.id != id);
            if subs.len() == before {
                return false;
            }
            let empty = subs.is_empty();
            if empty {
                state.subscriptions.remove(symbol);
                state.subscribed_at.remove(symbol);
                state.last_dispatch.remove(symbol);
                state.stale_warned.retain(|(_, s)| s != symbol);
                if !state.watchers.contains_key(symbol) {
                    state.last_update.remove(symbol);
                }
            }
            empty
        };

        if now_empty {
            if let Err(e) = self.feed.unsubscribe(symbol).await {
                warn!(%symbol, error = %e, "Feed unsubscribe failed");
            }
        }
        debug!(%symbol, subscription_id = id, "Price subscription removed");
        true
    }

    /// Whether `module` has a subscription for `symbol`
    pub async fn is_subscribed(&self, symbol: &Symbol, module: &str) -> bool {
        self.state
            .read()
            .await
            .subscriptions
            .get(symbol)
            .is_some_and(|subs| subs.iter().any(|s| s.module == module))
    }

    /// Symbols with at least one subscription from `module`
    pub async fn symbols_for(&self, module: &str) -> Vec<Symbol> {
        let state = self.state.read().await;
        let mut symbols: Vec<Symbol> = state
            .subscriptions
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.module == module))
            .map(|(symbol, _)| symbol.clone())
            .collect();
        symbols.sort();
        symbols
    }

    /// Modules subscribed to `symbol`, in the order ticks are queued to them
    pub async fn dispatch_order(&self, symbol: &Symbol) -> Vec<String> {
        self.state
            .read()
            .await
            .subscriptions
            .get(symbol)
            .map(|subs| subs.iter().map(|s| s.module.clone()).collect())
            .unwrap_or_default()
    }

    /// Publish a price. Returns the number of subscribers it was queued for.
    ///
    /// Refreshes liveness for symbols that are subscribed or awaited and
    /// ignores the rest. Dispatch is skipped if the symbol was dispatched
    /// less than the minimum interval ago.
    pub async fn update_price(&self, symbol: &Symbol, price: Price) -> usize {
        bump(&self.counters.updates);
        let now = Instant::now();
        let tick = PriceTick { symbol: symbol.clone(), price, timestamp: Utc::now() };

        let mut state = self.state.write().await;
        let watched = match state.watchers.get(symbol).map(watch::Sender::receiver_count) {
            Some(0) => {
                state.watchers.remove(symbol);
                false
            },
            Some(_) => true,
            None => false,
        };
        if !watched && !state.subscriptions.contains_key(symbol) {
            return 0;
        }

        state.last_update.insert(symbol.clone(), now);
        state.stale_warned.retain(|(_, s)| s != symbol);
        if let Some(watcher) = state.watchers.get(symbol) {
            watcher.send_modify(|n| *n = n.wrapping_add(1));
        }

        let throttled = state
            .last_dispatch
            .get(symbol)
            .is_some_and(|last| now.duration_since(*last) < self.config.min_dispatch_interval);
        if throttled {
            bump(&self.counters.throttled);
            return 0;
        }

        let Some(subs) = state.subscriptions.get(symbol) else {
            return 0;
        };

        let mut queued = 0;
        for sub in subs {
            match sub.sender.try_send(tick.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    bump(&self.counters.dropped);
                    warn!(%symbol, module = %sub.module, "Subscriber queue full, tick dropped");
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    bump(&self.counters.dropped);
                    warn!(%symbol, module = %sub.module, "Subscriber worker gone, tick dropped");
                },
            }
        }

        state.last_dispatch.insert(symbol.clone(), now);
        bump(&self.counters.dispatched);
        queued
    }

    /// Arm a wait for the next price of `symbol`.
    pub async fn watch_updates(&self, symbol: &Symbol) -> UpdateWaiter {
        let mut state = self.state.write().await;
        state.watchers.retain(|s, tx| s == symbol || tx.receiver_count() > 0);
        let rx = state
            .watchers
            .entry(symbol.clone())
            .or_insert_with(|| watch::channel(0u64).0)
            .subscribe();
        UpdateWaiter { rx }
    }

    /// Wait until the next price for `symbol` arrives. Returns `false` on
    /// timeout.
    pub async fn wait_for_update(&self, symbol: &Symbol, timeout: Duration) -> bool {
        self.watch_updates(symbol).await.wait(timeout).await
    }

    /// Staleness of `symbols` against `module`'s threshold.
    ///
    /// A warning is logged once per uninterrupted stale interval.
    pub async fn check_staleness(&self, symbols: &[Symbol], module: &str) -> Vec<Staleness> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let threshold = state
            .stale_thresholds
            .get(module)
            .copied()
            .unwrap_or(self.config.default_stale_after);

        let mut reports = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let received = state.last_update.contains_key(symbol);
            let since = state
                .last_update
                .get(symbol)
                .or_else(|| state.subscribed_at.get(symbol))
                .map(|at| now.duration_since(*at));

            let is_stale = since.map_or(true, |age| age > threshold);
            if is_stale && state.stale_warned.insert((module.to_string(), symbol.clone())) {
                bump(&self.counters.stale_warnings);
                warn!(
                    %symbol,
                    module,
                    seconds_since_update = since.map(|d| d.as_secs_f64()),
                    threshold_secs = threshold.as_secs(),
                    "Price feed stale"
                );
            }

            reports.push(Staleness {
                symbol: symbol.clone(),
                seconds_since_update: since.map(|d| d.as_secs_f64()),
                is_stale,
                received,
            });
        }
        reports
    }

    /// Re-establish the upstream stream for `symbol` and restart its workers.
    pub async fn resubscribe(&self, symbol: &Symbol) -> DaemonResult<()> {
        if let Err(e) = self.feed.unsubscribe(symbol).await {
            debug!(%symbol, error = %e, "Feed unsubscribe before resubscribe failed");
        }
        self.feed.subscribe(symbol).await.map_err(|e| {
            DaemonError::Subscription(format!("feed resubscribe {}: {}", symbol, e))
        })?;

        let mut state = self.state.write().await;
        let now = Instant::now();
        state.resubscriptions.push_back(now);
        if let Some(subs) = state.subscriptions.get_mut(symbol) {
            for sub in subs.iter_mut() {
                sub.sender = self.spawn_worker(symbol, &sub.module, sub.handler.clone());
            }
        }
        bump(&self.counters.resubscriptions);
        info!(%symbol, "Resubscribed price feed");
        Ok(())
    }

    /// Run health passes until `cancel` fires.
    pub async fn run_health_monitor(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.health_interval.as_secs(),
            "Price bus health monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.health_interval);
        ticker.tick().await; // First tick is immediate

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Price bus health monitor shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let pass = self.health_pass(&cancel).await;
                    if pass.stale > 0 {
                        info!(stale = pass.stale, healed = pass.healed, failed = pass.failed, "Price bus health pass");
                    }
                }
            }
        }

        info!("Price bus health monitor stopped");
    }

    /// One health pass over every module's symbols.
    pub async fn health_pass(&self, cancel: &CancellationToken) -> HealthPass {
        let modules: Vec<String> = {
            let state = self.state.read().await;
            let mut modules: Vec<String> = state
                .subscriptions
                .values()
                .flatten()
                .map(|s| s.module.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            modules.sort();
            modules
        };

        let mut pass = HealthPass::default();
        let mut handled: HashSet<Symbol> = HashSet::new();

        for module in modules {
            let symbols = self.symbols_for(&module).await;
            for report in self.check_staleness(&symbols, &module).await {
                if !report.is_stale || !handled.insert(report.symbol.clone()) {
                    continue;
                }
                pass.stale += 1;
                if cancel.is_cancelled() {
                    return pass;
                }
                if self.heal(&report.symbol, &module, cancel).await {
                    pass.healed += 1;
                } else {
                    pass.failed += 1;
                }
            }
        }

        self.check_resubscribe_rate().await;
        pass
    }

    /// Resubscribe until a real tick arrives, with exponential backoff.
    async fn heal(&self, symbol: &Symbol, module: &str, cancel: &CancellationToken) -> bool {
        let max_attempts = self.config.max_resubscribe_attempts.max(1);

        for attempt in 1..=max_attempts {
            let waiter = self.watch_updates(symbol).await;
            match self.resubscribe(symbol).await {
                Ok(()) => {
                    if waiter.wait(self.config.resubscribe_wait).await {
                        info!(%symbol, module, attempt, "Price feed recovered");
                        return true;
                    }
                    warn!(%symbol, module, attempt, "No tick after resubscribe");
                },
                Err(e) => warn!(%symbol, module, attempt, error = %e, "Resubscribe failed"),
            }

            if attempt < max_attempts {
                let backoff = self
                    .config
                    .resubscribe_backoff
                    .saturating_mul(1u32 << (attempt - 1).min(16));
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        bump(&self.counters.resubscribe_failures);
        bump(&self.counters.alerts);
        error!(
            %symbol,
            module,
            attempts = max_attempts,
            alert = true,
            "Price feed could not be recovered"
        );
        false
    }

    /// Alert when resubscriptions within the window exceed the threshold.
    async fn check_resubscribe_rate(&self) {
        let now = Instant::now();
        let window = self.config.resubscribe_window;
        let mut state = self.state.write().await;

        while state.resubscriptions.front().is_some_and(|at| now.duration_since(*at) > window) {
            state.resubscriptions.pop_front();
        }

        let count = state.resubscriptions.len();
        let recently_alerted =
            state.rate_alert_raised_at.is_some_and(|at| now.duration_since(at) < window);
        if count > self.config.resubscribe_alert_threshold && !recently_alerted {
            state.rate_alert_raised_at = Some(now);
            bump(&self.counters.alerts);
            error!(
                resubscriptions = count,
                window_secs = window.as_secs(),
                alert = true,
                "Abnormal price feed resubscription rate"
            );
        }
    }

    /// Counter snapshot
    pub async fn stats(&self) -> BusStats {
        let (symbols, subscriptions, tracked) = {
            let state = self.state.read().await;
            (
                state.subscriptions.len(),
                state.subscriptions.values().map(Vec::len).sum(),
                state.last_update.len(),
            )
        };
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        BusStats {
            symbols,
            subscriptions,
            tracked,
            updates: load(&c.updates),
            dispatched: load(&c.dispatched),
            throttled: load(&c.throttled),
            dropped: load(&c.dropped),
            delivered: load(&c.delivered),
            handler_errors: load(&c.handler_errors),
            handler_panics: load(&c.handler_panics),
            stale_warnings: load(&c.stale_warnings),
            resubscriptions: load(&c.resubscriptions),
            resubscribe_failures: load(&c.resubscribe_failures),
            alerts: load(&c.alerts),
        }
    }

    fn spawn_worker(
        &self,
        symbol: &Symbol,
        module: &str,
        handler: Arc<dyn PriceHandler>,
    ) -> mpsc::Sender<PriceTick> {
        let (sender, mut receiver) = mpsc::channel::<PriceTick>(self.config.channel_capacity.max(1));
        let counters = self.counters.clone();
        let module = module.to_string();
        let symbol = symbol.clone();

        tokio::spawn(async move {
            while let Some(tick) = receiver.recv().await {
                match AssertUnwindSafe(handler.on_price(&tick)).catch_unwind().await {
                    Ok(Ok(())) => bump(&counters.delivered),
                    Ok(Err(e)) => {
                        bump(&counters.handler_errors);
                        warn!(%symbol, module = %module, error = %e, "Price handler failed");
                    },
                    Err(_) => {
                        bump(&counters.handler_panics);
                        error!(%symbol, module = %module, "Price handler panicked");
                    },
                }
            }
            debug!(%symbol, module = %module, "Price worker stopped");
        });

        sender
    }
}

// =============================================================================
// Tests
// =============================================================================
