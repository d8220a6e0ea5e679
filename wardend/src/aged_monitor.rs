//! Aged Position Monitor: age-driven liquidation of positions held too long.
//!
//! A position older than `max_age_hours` is tracked and walks
//! grace → progressive → stale, never backwards. Each tick for a tracked
//! symbol re-evaluates the phase and closes the position once it is in profit
//! or the price crosses the phase target.
//!
//! Before a close the monitor asks the exchange whether the position still
//! exists. A confirmed-absent position is a ghost: it is marked closed without
//! placing an order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_domain::{
    AgedPhase, AgedPositionRecord, AgedPositionTarget, AgedRecordStatus, EngineEvent, ExchangeId,
    Position, PositionId, Price, Quantity, Symbol,
};
use warden_exec::{EventSink, ExchangePosition, OrderExecutor};
use warden_store::Store;

use crate::config::AgedConfig;
use crate::error::{DaemonError, DaemonResult};

/// Exit reason for aged positions found absent on the exchange
pub const GHOST_EXIT_REASON: &str = "aged_ghost";

// =============================================================================
// Types
// =============================================================================

/// Change in the set of symbols the monitor needs prices for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingChange {
    /// First tracked position for the symbol
    Added(Symbol),
    /// Last tracked position for the symbol removed
    Removed(Symbol),
}

/// What a pre-close exchange check found
#[derive(Debug, Clone, PartialEq)]
enum ExchangeCheck {
    /// Position present; close this quantity
    Present(Quantity),
    /// Exchange confirms no such position
    Ghost,
    /// Check failed; use the stored quantity
    Unverified,
}

/// Outcome of a close attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Order placed and position marked closed
    Closed,
    /// Position was gone from the exchange
    Ghost,
    /// Cascade failed; still tracked
    Failed,
    /// Another close for the position is in flight
    InFlight,
    /// Position is not tracked
    NotTracked,
}

/// Result of a full scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Active positions examined
    pub examined: usize,
    /// Newly tracked
    pub added: usize,
    /// Dropped because the position is no longer active
    pub released: usize,
}

/// Result of crash recovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Targets rebuilt
    pub recovered: usize,
    /// Records marked stale
    pub discarded: usize,
}

/// Monitor statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgedStats {
    /// Tracked positions
    pub tracked: usize,
    /// Tracked in grace
    pub grace: usize,
    /// Tracked in progressive
    pub progressive: usize,
    /// Tracked in stale
    pub stale: usize,
    /// Positions that started being tracked
    pub detected: u64,
    /// Phase transitions
    pub phase_changes: u64,
    /// Close conditions met
    pub closes_triggered: u64,
    /// Closes that placed an order
    pub closes_succeeded: u64,
    /// Closes whose cascade failed
    pub closes_failed: u64,
    /// Ghosts detected
    pub ghosts: u64,
    /// Targets rebuilt on recovery
    pub recovered: u64,
    /// Records discarded on recovery
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    detected: AtomicU64,
    phase_changes: AtomicU64,
    closes_triggered: AtomicU64,
    closes_succeeded: AtomicU64,
    closes_failed: AtomicU64,
    ghosts: AtomicU64,
    recovered: AtomicU64,
    discarded: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// =============================================================================
// Monitor
// =============================================================================

/// Owns the aged-position targets.
pub struct AgedPositionMonitor<S: Store + ?Sized> {
    config: AgedConfig,
    store: Arc<S>,
    executor: Arc<OrderExecutor>,
    events: Arc<dyn EventSink>,
    targets: RwLock<HashMap<PositionId, AgedPositionTarget>>,
    closing: Mutex<HashSet<PositionId>>,
    tracking_tx: broadcast::Sender<TrackingChange>,
    counters: Counters,
}

impl<S: Store + ?Sized + 'static> AgedPositionMonitor<S> {
    /// Create a monitor.
    pub fn new(
        config: AgedConfig,
        store: Arc<S>,
        executor: Arc<OrderExecutor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (tracking_tx, _) = broadcast::channel(256);
        Self {
            config,
            store,
            executor,
            events,
            targets: RwLock::new(HashMap::new()),
            closing: Mutex::new(HashSet::new()),
            tracking_tx,
            counters: Counters::default(),
        }
    }

    /// Receive tracking changes (symbols added/removed)
    pub fn subscribe_tracking(&self) -> broadcast::Receiver<TrackingChange> {
        self.tracking_tx.subscribe()
    }

    /// Symbols with at least one tracked position
    pub async fn tracked_symbols(&self) -> Vec<Symbol> {
        let targets = self.targets.read().await;
        let mut symbols: Vec<Symbol> =
            targets.values().map(|t| t.symbol.clone()).collect::<HashSet<_>>().into_iter().collect();
        symbols.sort();
        symbols
    }

    /// Current target for a position
    pub async fn target(&self, position_id: PositionId) -> Option<AgedPositionTarget> {
        self.targets.read().await.get(&position_id).cloned()
    }

    /// Number of tracked positions
    pub async fn tracked_count(&self) -> usize {
        self.targets.read().await.len()
    }

    /// Whether `position` is past the maximum age; returns the target it
    /// would be tracked with.
    pub fn check_position_age(&self, position: &Position) -> Option<AgedPositionTarget> {
        if !position.is_active() {
            return None;
        }
        AgedPositionTarget::from_position(position, &self.config.policy, Utc::now())
    }

    /// Start tracking `position` if it is aged. Returns `false` if it is not
    /// aged or already tracked.
    pub async fn add_aged_position(&self, position: &Position) -> DaemonResult<bool> {
        let Some(target) = self.check_position_age(position) else {
            return Ok(false);
        };

        let symbol_is_new = {
            let mut targets = self.targets.write().await;
            if targets.contains_key(&position.id) {
                return Ok(false);
            }
            let symbol_is_new = !targets.values().any(|t| t.symbol == target.symbol);
            targets.insert(position.id, target.clone());
            symbol_is_new
        };

        bump(&self.counters.detected);
        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            exchange = %position.exchange,
            hours_aged = %target.hours_aged.round_dp(2),
            phase = %target.phase,
            target_price = %target.target_price,
            "Aged position detected"
        );

        self.record(EngineEvent::AgedPositionDetected {
            position_id: position.id,
            symbol: target.symbol.clone(),
            exchange: target.exchange.clone(),
            hours_aged: target.hours_aged,
            phase: target.phase,
            target_price: target.target_price,
            timestamp: Utc::now(),
        })
        .await;

        if let Err(e) = self
            .store
            .aged_positions()
            .upsert(&AgedPositionRecord::from_target(&target, Utc::now()))
            .await
        {
            warn!(position_id = %position.id, error = %e, "Failed to persist aged record");
        }

        if symbol_is_new {
            let _ = self.tracking_tx.send(TrackingChange::Added(target.symbol));
        }
        Ok(true)
    }

    /// Handle a price tick for `symbol`. Returns the positions closed.
    pub async fn check_price_target(
        &self,
        symbol: &Symbol,
        price: Price,
    ) -> DaemonResult<Vec<PositionId>> {
        let now = Utc::now();
        let mut triggered = Vec::new();
        let mut changes = Vec::new();

        {
            let mut targets = self.targets.write().await;
            for target in targets.values_mut().filter(|t| &t.symbol == symbol) {
                if let Some(change) = target.refresh(&self.config.policy, now) {
                    changes.push((target.clone(), change.from));
                }
                if let Some(trigger) = target.should_close(price) {
                    debug!(
                        position_id = %target.position_id,
                        ?trigger,
                        price = %price,
                        target_price = %target.target_price,
                        "Aged close condition met"
                    );
                    triggered.push(target.position_id);
                }
            }
        }

        for (target, from) in changes {
            self.on_phase_change(&target, from).await;
        }

        let mut closed = Vec::new();
        for position_id in triggered {
            if self.close_position(position_id, price).await == CloseOutcome::Closed {
                closed.push(position_id);
            }
        }
        Ok(closed)
    }

    /// Close a tracked position now, at `trigger_price`.
    pub async fn close_position(&self, position_id: PositionId, trigger_price: Price) -> CloseOutcome {
        if !self.closing.lock().await.insert(position_id) {
            debug!(%position_id, "Close already in flight");
            return CloseOutcome::InFlight;
        }

        let outcome = self.close_inner(position_id, trigger_price).await;
        self.closing.lock().await.remove(&position_id);
        outcome
    }

    async fn close_inner(&self, position_id: PositionId, trigger_price: Price) -> CloseOutcome {
        let Some(target) = self.target(position_id).await else {
            return CloseOutcome::NotTracked;
        };

        bump(&self.counters.closes_triggered);
        info!(
            %position_id,
            symbol = %target.symbol,
            phase = %target.phase,
            trigger_price = %trigger_price,
            target_price = %target.target_price,
            "Aged close triggered"
        );
        self.record(EngineEvent::AgedCloseTriggered {
            position_id,
            symbol: target.symbol.clone(),
            exchange: target.exchange.clone(),
            phase: target.phase,
            trigger_price: trigger_price.as_decimal(),
            target_price: target.target_price,
            pnl_percent: target.pnl_percent(trigger_price),
            timestamp: Utc::now(),
        })
        .await;

        let quantity = match self.check_on_exchange(&target).await {
            ExchangeCheck::Ghost => {
                self.release_ghost(&target).await;
                return CloseOutcome::Ghost;
            },
            ExchangeCheck::Present(quantity) => quantity,
            ExchangeCheck::Unverified => target.quantity,
        };

        let reason = target.phase.exit_reason();
        let result = self
            .executor
            .execute_close(&target.symbol, &target.exchange, target.side, quantity, &reason)
            .await;

        if result.success {
            bump(&self.counters.closes_succeeded);
            if let Err(e) = self.store.positions().mark_closed(position_id, &reason, Utc::now()).await
            {
                // The order went through; the next reconciliation pass will
                // close the row as a phantom.
                error!(%position_id, error = %e, "Closed on exchange but failed to mark closed");
            }
            self.record(EngineEvent::AgedCloseSuccess {
                position_id,
                symbol: target.symbol.clone(),
                exchange: target.exchange.clone(),
                phase: target.phase,
                order_id: result.order_id.clone(),
                order_type: result.order_type.map(|t| t.to_string()),
                fill_price: result.fill_price,
                attempts: result.attempts,
                timestamp: Utc::now(),
            })
            .await;
            self.untrack(position_id, AgedRecordStatus::Closed).await;
            info!(%position_id, %reason, attempts = result.attempts, "Aged position closed");
            CloseOutcome::Closed
        } else {
            bump(&self.counters.closes_failed);
            let error = result.error_message.clone().unwrap_or_default();
            warn!(
                %position_id,
                attempts = result.attempts,
                executed = %result.executed_amount,
                %error,
                "Aged close failed, keeping tracked"
            );
            self.record(EngineEvent::AgedCloseFailed {
                position_id,
                symbol: target.symbol.clone(),
                exchange: target.exchange.clone(),
                phase: target.phase,
                error,
                attempts: result.attempts,
                timestamp: Utc::now(),
            })
            .await;
            CloseOutcome::Failed
        }
    }

    /// Ask the exchange whether the target's position still exists.
    async fn check_on_exchange(&self, target: &AgedPositionTarget) -> ExchangeCheck {
        let Some(gateway) = self.executor.gateway(&target.exchange) else {
            warn!(exchange = %target.exchange, "No gateway for pre-close check");
            return ExchangeCheck::Unverified;
        };

        match gateway.fetch_positions().await {
            Ok(positions) => self.match_exchange_position(target, &positions),
            Err(e) => {
                warn!(
                    position_id = %target.position_id,
                    error = %e,
                    "Pre-close check failed, using stored quantity"
                );
                ExchangeCheck::Unverified
            },
        }
    }

    fn match_exchange_position(
        &self,
        target: &AgedPositionTarget,
        positions: &[ExchangePosition],
    ) -> ExchangeCheck {
        let found = positions.iter().find(|p| {
            p.symbol == target.symbol && p.side == target.side && p.contracts > Decimal::ZERO
        });
        let Some(found) = found else {
            return ExchangeCheck::Ghost;
        };

        if target.quantity.differs_from(found.contracts, self.config.quantity_tolerance) {
            warn!(
                position_id = %target.position_id,
                stored = %target.quantity,
                exchange = %found.contracts,
                "Quantity differs from exchange, closing exchange quantity"
            );
            match Quantity::new(found.contracts) {
                Ok(quantity) => return ExchangeCheck::Present(quantity),
                Err(_) => return ExchangeCheck::Unverified,
            }
        }
        ExchangeCheck::Present(target.quantity)
    }

    async fn release_ghost(&self, target: &AgedPositionTarget) {
        bump(&self.counters.ghosts);
        warn!(
            position_id = %target.position_id,
            symbol = %target.symbol,
            exchange = %target.exchange,
            "Aged position not found on exchange (ghost)"
        );
        self.record(EngineEvent::AgedGhostDetected {
            position_id: target.position_id,
            symbol: target.symbol.clone(),
            exchange: target.exchange.clone(),
            timestamp: Utc::now(),
        })
        .await;

        if let Err(e) = self
            .store
            .positions()
            .mark_closed(target.position_id, GHOST_EXIT_REASON, Utc::now())
            .await
        {
            warn!(position_id = %target.position_id, error = %e, "Failed to close ghost position");
        }
        self.untrack(target.position_id, AgedRecordStatus::Closed).await;
    }

    async fn on_phase_change(&self, target: &AgedPositionTarget, from: AgedPhase) {
        bump(&self.counters.phase_changes);
        info!(
            position_id = %target.position_id,
            symbol = %target.symbol,
            %from,
            to = %target.phase,
            loss_tolerance = %target.loss_tolerance,
            target_price = %target.target_price,
            "Aged phase changed"
        );
        self.record(EngineEvent::AgedPhaseChanged {
            position_id: target.position_id,
            symbol: target.symbol.clone(),
            from,
            to: target.phase,
            loss_tolerance: target.loss_tolerance,
            target_price: target.target_price,
            timestamp: Utc::now(),
        })
        .await;

        if let Err(e) = self
            .store
            .aged_positions()
            .upsert(&AgedPositionRecord::from_target(target, Utc::now()))
            .await
        {
            warn!(position_id = %target.position_id, error = %e, "Failed to persist phase change");
        }
    }

    /// Stop tracking and mark the persisted record.
    async fn untrack(&self, position_id: PositionId, status: AgedRecordStatus) {
        let removed_symbol = {
            let mut targets = self.targets.write().await;
            targets.remove(&position_id).and_then(|removed| {
                let still_tracked = targets.values().any(|t| t.symbol == removed.symbol);
                (!still_tracked).then_some(removed.symbol)
            })
        };

        if let Err(e) = self.store.aged_positions().update_status(position_id, status).await {
            debug!(%position_id, error = %e, "Aged record status not updated");
        }
        if let Some(symbol) = removed_symbol {
            let _ = self.tracking_tx.send(TrackingChange::Removed(symbol));
        }
    }

    // -------------------------------------------------------------------------
    // Periodic work
    // -------------------------------------------------------------------------

    /// Re-evaluate every active position for age qualification.
    pub async fn scan_positions(&self) -> DaemonResult<ScanReport> {
        let positions = self.store.positions().find_active().await?;
        let mut report = ScanReport { examined: positions.len(), ..ScanReport::default() };

        let active: HashSet<PositionId> = positions.iter().map(|p| p.id).collect();
        for position in &positions {
            match self.add_aged_position(position).await {
                Ok(true) => report.added += 1,
                Ok(false) => {},
                Err(e) => warn!(position_id = %position.id, error = %e, "Aged check failed"),
            }
        }

        let gone: Vec<PositionId> = self
            .targets
            .read()
            .await
            .keys()
            .filter(|id| !active.contains(id))
            .copied()
            .collect();
        for position_id in gone {
            debug!(%position_id, "Position no longer active, releasing");
            self.untrack(position_id, AgedRecordStatus::Closed).await;
            report.released += 1;
        }

        Ok(report)
    }

    /// Compare tracked targets with each exchange's positions and purge
    /// ghosts. Returns the number of ghosts found.
    pub async fn validate_tracked(&self) -> DaemonResult<usize> {
        let by_exchange: HashMap<ExchangeId, Vec<AgedPositionTarget>> = {
            let targets = self.targets.read().await;
            let mut grouped: HashMap<ExchangeId, Vec<AgedPositionTarget>> = HashMap::new();
            for target in targets.values() {
                grouped.entry(target.exchange.clone()).or_default().push(target.clone());
            }
            grouped
        };

        let mut ghosts = 0;
        for (exchange, targets) in by_exchange {
            let Some(gateway) = self.executor.gateway(&exchange) else {
                warn!(%exchange, "No gateway for aged validation");
                continue;
            };
            let positions = match gateway.fetch_positions().await {
                Ok(positions) => positions,
                Err(e) => {
                    warn!(%exchange, error = %e, "Aged validation fetch failed");
                    continue;
                },
            };

            for target in targets {
                if self.closing.lock().await.contains(&target.position_id) {
                    continue;
                }
                if self.match_exchange_position(&target, &positions) == ExchangeCheck::Ghost {
                    self.release_ghost(&target).await;
                    ghosts += 1;
                }
            }
        }
        Ok(ghosts)
    }

    /// Run full scans until `cancel` fires.
    pub async fn run_periodic_scan(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.config.scan_interval.as_secs(), "Aged scan loop started");
        let mut ticker = tokio::time::interval(self.config.scan_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Aged scan loop shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    match self.scan_positions().await {
                        Ok(report) if report.added > 0 || report.released > 0 => {
                            info!(added = report.added, released = report.released, "Aged scan");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Aged scan failed (will retry)"),
                    }
                }
            }
        }
    }

    /// Run exchange validation until `cancel` fires.
    pub async fn run_periodic_validation(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.validation_interval.as_secs(),
            "Aged validation loop started"
        );
        let mut ticker = tokio::time::interval(self.config.validation_interval);
        ticker.tick().await; // First tick is immediate

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Aged validation loop shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.validate_tracked().await {
                        error!(error = %e, "Aged validation failed (will retry)");
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write every tracked target to the store. Returns the number written.
    pub async fn persist_state(&self) -> DaemonResult<usize> {
        let now = Utc::now();
        let records: Vec<AgedPositionRecord> = self
            .targets
            .read()
            .await
            .values()
            .map(|t| AgedPositionRecord::from_target(t, now))
            .collect();

        for record in &records {
            self.store.aged_positions().upsert(record).await?;
        }
        info!(count = records.len(), "Aged state persisted");
        Ok(records.len())
    }

    /// Rebuild targets from persisted records.
    ///
    /// Records whose position is missing or no longer active are marked stale.
    pub async fn recover_state(&self) -> DaemonResult<RecoveryReport> {
        let records = self.store.aged_positions().find_active().await?;
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for record in records {
            let position = self.store.positions().find_by_id(record.position_id).await?;
            let position = match position {
                Some(position) if position.is_active() => position,
                _ => {
                    self.store
                        .aged_positions()
                        .update_status(record.position_id, AgedRecordStatus::Stale)
                        .await?;
                    bump(&self.counters.discarded);
                    report.discarded += 1;
                    warn!(position_id = %record.position_id, "Discarded aged record without active position");
                    continue;
                },
            };

            let mut target = AgedPositionTarget {
                position_id: position.id,
                symbol: position.symbol.clone(),
                exchange: position.exchange.clone(),
                side: position.side,
                quantity: position.quantity,
                entry_price: position.entry_price,
                target_price: record.target_price,
                phase: record.phase,
                loss_tolerance: record.loss_tolerance,
                hours_aged: record.hours_aged,
                opened_at: position.opened_at,
                detected_at: record.created_at,
                last_updated: record.updated_at,
            };
            target.refresh(&self.config.policy, now);

            let symbol_is_new = {
                let mut targets = self.targets.write().await;
                let symbol_is_new = !targets.values().any(|t| t.symbol == target.symbol);
                targets.insert(position.id, target.clone());
                symbol_is_new
            };
            if symbol_is_new {
                let _ = self.tracking_tx.send(TrackingChange::Added(target.symbol.clone()));
            }
            bump(&self.counters.recovered);
            report.recovered += 1;
        }

        info!(recovered = report.recovered, discarded = report.discarded, "Aged state recovered");
        Ok(report)
    }

    /// Delete closed/stale records last written before `older_than`.
    pub async fn cleanup_stale_records(&self, older_than: DateTime<Utc>) -> DaemonResult<u64> {
        let removed = self.store.aged_positions().cleanup(older_than).await?;
        if removed > 0 {
            info!(removed, "Cleaned up aged records");
        }
        Ok(removed)
    }

    /// Statistics snapshot
    pub async fn get_stats(&self) -> AgedStats {
        let targets = self.targets.read().await;
        let count = |phase: AgedPhase| targets.values().filter(|t| t.phase == phase).count();
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);

        AgedStats {
            tracked: targets.len(),
            grace: count(AgedPhase::Grace),
            progressive: count(AgedPhase::Progressive),
            stale: count(AgedPhase::Stale),
            detected: load(&c.detected),
            phase_changes: load(&c.phase_changes),
            closes_triggered: load(&c.closes_triggered),
            closes_succeeded: load(&c.closes_succeeded),
            closes_failed: load(&c.closes_failed),
            ghosts: load(&c.ghosts),
            recovered: load(&c.recovered),
            discarded: load(&c.discarded),
        }
    }

    /// Look up a tracked position or fail
    pub async fn require_target(&self, position_id: PositionId) -> DaemonResult<AgedPositionTarget> {
        self.target(position_id).await.ok_or(DaemonError::PositionNotFound(position_id))
    }

    async fn record(&self, event: EngineEvent) {
        if let Err(e) = self.events.record(event).await {
            warn!(error = %e, "Failed to record aged event");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use warden_domain::Side;
    use warden_exec::{
        BookLevel, CloseConfig, ExchangePort, ExecError, Gateways, OrderBook, StoreEventSink,
        StubExchange, StubOrderKind,
    };
    use warden_store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        exchange: Arc<StubExchange>,
        monitor: AgedPositionMonitor<MemoryStore>,
    }

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    fn binance() -> ExchangeId {
        ExchangeId::new("binance").unwrap()
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(StubExchange::new(binance()));
        exchange.set_ticker(&btc(), dec!(42000));

        let mut gateways = Gateways::new();
        gateways.insert(binance(), exchange.clone() as Arc<dyn ExchangePort>);
        let events: Arc<dyn EventSink> = Arc::new(StoreEventSink::new(store.clone()));
        let executor =
            Arc::new(OrderExecutor::new(gateways, CloseConfig::default()).with_event_sink(events.clone()));

        let monitor = AgedPositionMonitor::new(AgedConfig::default(), store.clone(), executor, events);
        Harness { store, exchange, monitor }
    }

    async fn aged_long(h: &Harness, hours: i64) -> Position {
        let position = Position::new_active(
            btc(),
            binance(),
            Side::Long,
            Quantity::new(dec!(0.5)).unwrap(),
            Price::new(dec!(42000)).unwrap(),
            "ord-1".to_string(),
        )
        .with_opened_at(Utc::now() - ChronoDuration::hours(hours));
        h.store.positions().save(&position).await.unwrap();
        h.exchange.add_position(ExchangePosition::new(btc(), Side::Long, dec!(0.5), dec!(42000)));
        position
    }

    fn price(value: Decimal) -> Price {
        Price::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_young_position_is_not_tracked() {
        let h = harness();
        let position = aged_long(&h, 1).await;

        assert!(h.monitor.check_position_age(&position).is_none());
        assert!(!h.monitor.add_aged_position(&position).await.unwrap());
        assert_eq!(h.monitor.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn test_add_is_idempotent_and_broadcasts_symbol_once() {
        let h = harness();
        let mut changes = h.monitor.subscribe_tracking();
        let position = aged_long(&h, 4).await;

        assert!(h.monitor.add_aged_position(&position).await.unwrap());
        assert!(!h.monitor.add_aged_position(&position).await.unwrap());

        assert_eq!(changes.try_recv().unwrap(), TrackingChange::Added(btc()));
        assert!(changes.try_recv().is_err());
        assert_eq!(h.store.events().find_by_type("aged_position_detected").await.unwrap().len(), 1);
        assert!(h.store.aged_positions().find_by_position(position.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_grace_close_at_break_even() {
        let h = harness();
        let position = aged_long(&h, 4).await;
        h.monitor.add_aged_position(&position).await.unwrap();

        let target = h.monitor.target(position.id).await.unwrap();
        assert_eq!(target.phase, AgedPhase::Grace);
        // 42000 × (1 + 2 × 0.0006)
        assert_eq!(target.target_price, dec!(42050.4));

        // below entry, above nothing: keep waiting
        assert!(h.monitor.check_price_target(&btc(), price(dec!(41900))).await.unwrap().is_empty());

        let closed = h.monitor.check_price_target(&btc(), price(dec!(42060))).await.unwrap();
        assert_eq!(closed, vec![position.id]);

        let stored = h.store.positions().find_by_id(position.id).await.unwrap().unwrap();
        assert_eq!(stored.exit_reason.as_deref(), Some("aged_grace"));
        assert_eq!(h.monitor.tracked_count().await, 0);
        assert!(h.exchange.positions().is_empty());
    }

    #[tokio::test]
    async fn test_ghost_is_closed_without_order() {
        let h = harness();
        let position = aged_long(&h, 4).await;
        h.monitor.add_aged_position(&position).await.unwrap();
        h.exchange.remove_position(&btc());

        let outcome = h.monitor.close_position(position.id, price(dec!(42100))).await;

        assert_eq!(outcome, CloseOutcome::Ghost);
        assert!(h.exchange.placed_orders().is_empty());
        let stored = h.store.positions().find_by_id(position.id).await.unwrap().unwrap();
        assert_eq!(stored.exit_reason.as_deref(), Some(GHOST_EXIT_REASON));
        assert_eq!(h.monitor.get_stats().await.ghosts, 1);
    }

    #[tokio::test]
    async fn test_failed_check_falls_back_to_stored_quantity() {
        let h = harness();
        let position = aged_long(&h, 4).await;
        h.monitor.add_aged_position(&position).await.unwrap();
        h.exchange.fail_fetch_positions(ExecError::Timeout("slow".into()));

        let outcome = h.monitor.close_position(position.id, price(dec!(42100))).await;

        assert_eq!(outcome, CloseOutcome::Closed);
        assert_eq!(h.exchange.placed_orders()[0].amount, dec!(0.5));
    }

    #[tokio::test]
    async fn test_failed_cascade_keeps_position_tracked() {
        let h = harness();
        let position = aged_long(&h, 4).await;
        h.monitor.add_aged_position(&position).await.unwrap();
        h.exchange.fail_orders(
            StubOrderKind::Market,
            [ExecError::InsufficientFunds("margin is insufficient".into())],
        );

        let outcome = h.monitor.close_position(position.id, price(dec!(42100))).await;

        assert_eq!(outcome, CloseOutcome::Failed);
        assert_eq!(h.monitor.tracked_count().await, 1);
        let stats = h.monitor.get_stats().await;
        assert_eq!(stats.closes_failed, 1);
        assert_eq!(h.store.events().find_by_type("aged_close_failed").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfilled_orders_leave_position_open_and_tracked() {
        let h = harness();
        let position = aged_long(&h, 4).await;
        h.monitor.add_aged_position(&position).await.unwrap();
        for kind in [StubOrderKind::Market, StubOrderKind::LimitIoc, StubOrderKind::LimitPostOnly] {
            h.exchange.fill_orders(kind, [dec!(0), dec!(0), dec!(0)]);
        }
        h.exchange.set_order_book(
            &btc(),
            OrderBook {
                bids: vec![BookLevel { price: dec!(42090), amount: dec!(1) }],
                asks: vec![BookLevel { price: dec!(42110), amount: dec!(1) }],
            },
        );

        let outcome = h.monitor.close_position(position.id, price(dec!(42100))).await;

        assert_eq!(outcome, CloseOutcome::Failed);
        assert_eq!(h.exchange.placed_orders().len(), 9);
        assert!(h.store.positions().find_by_id(position.id).await.unwrap().unwrap().is_active());
        assert!(h.monitor.target(position.id).await.is_some());
        assert!(h.store.events().find_by_type("aged_close_success").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_phase_advances_on_tick() {
        let h = harness();
        // 3 h max + 8 h grace + 2 h progressive = 13 h
        let position = aged_long(&h, 13).await;
        h.monitor.add_aged_position(&position).await.unwrap();

        let target = h.monitor.target(position.id).await.unwrap();
        assert_eq!(target.phase, AgedPhase::Progressive);
        // just over 2 h progressive × 0.5 % ≈ 1 %
        assert!(target.loss_tolerance >= dec!(1) && target.loss_tolerance < dec!(1.01));
        assert!(target.target_price <= dec!(41580) && target.target_price > dec!(41570));

        let closed = h.monitor.check_price_target(&btc(), price(dec!(41600))).await.unwrap();
        assert_eq!(closed, vec![position.id]);
        let stored = h.store.positions().find_by_id(position.id).await.unwrap().unwrap();
        assert_eq!(stored.exit_reason.as_deref(), Some("aged_progressive"));
    }

    #[tokio::test]
    async fn test_validation_purges_ghosts() {
        let h = harness();
        let position = aged_long(&h, 4).await;
        h.monitor.add_aged_position(&position).await.unwrap();

        assert_eq!(h.monitor.validate_tracked().await.unwrap(), 0);
        h.exchange.remove_position(&btc());
        assert_eq!(h.monitor.validate_tracked().await.unwrap(), 1);
        assert_eq!(h.monitor.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn test_persist_and_recover() {
        let h = harness();
        let kept = aged_long(&h, 5).await;
        h.monitor.add_aged_position(&kept).await.unwrap();
        assert_eq!(h.monitor.persist_state().await.unwrap(), 1);

        // record without a live position
        let orphan_position = Position::new_active(
            Symbol::from_pair("ETHUSDT").unwrap(),
            binance(),
            Side::Short,
            Quantity::new(dec!(2)).unwrap(),
            Price::new(dec!(2500)).unwrap(),
            "ord-2".to_string(),
        )
        .with_opened_at(Utc::now() - ChronoDuration::hours(6));
        h.store.positions().save(&orphan_position).await.unwrap();
        let orphan =
            AgedPositionTarget::from_position(&orphan_position, &AgedConfig::default().policy, Utc::now())
                .unwrap();
        h.store
            .aged_positions()
            .upsert(&AgedPositionRecord::from_target(&orphan, Utc::now()))
            .await
            .unwrap();
        h.store.positions().mark_closed(orphan_position.id, "manual", Utc::now()).await.unwrap();

        let restarted = AgedPositionMonitor::new(
            AgedConfig::default(),
            h.store.clone(),
            h.monitor.executor.clone(),
            h.monitor.events.clone(),
        );
        let report = restarted.recover_state().await.unwrap();

        assert_eq!(report, RecoveryReport { recovered: 1, discarded: 1 });
        assert_eq!(restarted.target(kept.id).await.unwrap().phase, AgedPhase::Grace);
        let orphan_record =
            h.store.aged_positions().find_by_position(orphan_position.id).await.unwrap().unwrap();
        assert_eq!(orphan_record.status, AgedRecordStatus::Stale);

        let removed = restarted.cleanup_stale_records(Utc::now() + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_scan_tracks_and_releases() {
        let h = harness();
        let position = aged_long(&h, 4).await;

        let report = h.monitor.scan_positions().await.unwrap();
        assert_eq!(report.added, 1);

        h.store.positions().mark_closed(position.id, "manual", Utc::now()).await.unwrap();
        let report = h.monitor.scan_positions().await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(h.monitor.tracked_count().await, 0);
    }
}
