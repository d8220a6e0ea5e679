//! Position Synchronizer: reconciles stored positions with exchange state.
//!
//! Each pass per exchange:
//! 1. Fetch exchange positions (a failed fetch aborts before any mutation)
//! 2. Load active stored positions for that exchange
//! 3. Compute discrepancies ([`find_discrepancies`], pure)
//! 4. Act on them: adopt missing positions under the advisory lock, close
//!    phantoms, correct quantities to the exchange value
//!
//! Every action is recorded as an engine event.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_domain::{
    DiscrepancyKind, EngineEvent, ExchangeId, Position, PositionDiscrepancy, PositionId, Price,
    Quantity, Symbol,
};
use warden_exec::{EventSink, ExchangePosition, ExecError, Gateways};
use warden_store::{insert_active_exclusive, InsertOutcome, Store};

use crate::config::SyncConfig;
use crate::error::{DaemonError, DaemonResult};

/// Exit reason for stored positions absent from the exchange
pub const PHANTOM_EXIT_REASON: &str = "not found on exchange";

/// Rejection reason for exchange positions without a native identifier
pub const NO_ORDER_ID_REASON: &str = "no order id";

/// Rejection reason for cached exchange positions with zero raw quantity
pub const STALE_CACHE_REASON: &str = "stale cache: native quantity is zero";

// =============================================================================
// Discrepancy detection
// =============================================================================

/// Result of comparing one exchange's positions with the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Drift to act on
    pub discrepancies: Vec<PositionDiscrepancy>,
    /// Stored positions confirmed with matching quantity
    pub matched: Vec<(PositionId, Decimal)>,
    /// Exchange entries refused outright, with the reason
    pub rejected: Vec<(Symbol, &'static str)>,
}

/// Compare stored positions with exchange positions for `exchange`.
///
/// Zero-quantity exchange entries are ignored. Stale-cache entries are
/// rejected and their symbols are neither adopted nor treated as phantoms.
pub fn find_discrepancies(
    exchange: &ExchangeId,
    stored: &[Position],
    live: &[ExchangePosition],
    tolerance: Decimal,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let mut on_exchange: HashMap<&Symbol, &ExchangePosition> = HashMap::new();
    let mut suspect: HashSet<&Symbol> = HashSet::new();

    for position in live {
        if position.contracts.is_zero() {
            continue;
        }
        if position.is_stale_cache() {
            suspect.insert(&position.symbol);
            plan.rejected.push((position.symbol.clone(), STALE_CACHE_REASON));
            continue;
        }
        on_exchange.entry(&position.symbol).or_insert(position);
    }

    let mut stored_symbols: HashSet<&Symbol> = HashSet::new();
    for position in stored {
        stored_symbols.insert(&position.symbol);
        let stored_quantity = position.quantity.as_decimal();

        match on_exchange.get(&position.symbol) {
            Some(live) if position.quantity.differs_from(live.contracts, tolerance) => {
                plan.discrepancies.push(PositionDiscrepancy {
                    symbol: position.symbol.clone(),
                    exchange: exchange.clone(),
                    kind: DiscrepancyKind::QuantityMismatch,
                    stored_position_id: Some(position.id),
                    stored_quantity: Some(stored_quantity),
                    exchange_quantity: Some(live.contracts),
                    exchange_position_id: live.exchange_position_id.clone(),
                    side: live.side,
                    entry_price: Some(live.entry_price),
                });
            },
            Some(_) => plan.matched.push((position.id, stored_quantity)),
            None if suspect.contains(&position.symbol) => {},
            None => plan.discrepancies.push(PositionDiscrepancy {
                symbol: position.symbol.clone(),
                exchange: exchange.clone(),
                kind: DiscrepancyKind::MissingOnExchange,
                stored_position_id: Some(position.id),
                stored_quantity: Some(stored_quantity),
                exchange_quantity: None,
                exchange_position_id: None,
                side: position.side,
                entry_price: None,
            }),
        }
    }

    let mut missing: Vec<&ExchangePosition> = on_exchange
        .values()
        .filter(|live| !stored_symbols.contains(&live.symbol))
        .copied()
        .collect();
    missing.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    for live in missing {
        plan.discrepancies.push(PositionDiscrepancy {
            symbol: live.symbol.clone(),
            exchange: exchange.clone(),
            kind: DiscrepancyKind::MissingInStore,
            stored_position_id: None,
            stored_quantity: None,
            exchange_quantity: Some(live.contracts),
            exchange_position_id: live.exchange_position_id.clone(),
            side: live.side,
            entry_price: Some(live.entry_price),
        });
    }

    plan
}

// =============================================================================
// Reports and statistics
// =============================================================================

/// Outcome of one pass over one exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Exchange reconciled
    pub exchange: String,
    /// Exchange-only positions adopted
    pub added: u32,
    /// Stored quantities corrected
    pub corrected: u32,
    /// Phantom positions closed
    pub closed_phantom: u32,
    /// Exchange positions rejected for the first time
    pub rejected: u32,
    /// Positions confirmed for the first time
    pub verified: u32,
    /// Adoptions lost to a concurrent writer
    pub already_present: u32,
    /// Per-symbol failures (the pass continued)
    pub errors: u32,
}

/// Synchronizer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Completed passes
    pub passes: u64,
    /// Passes aborted by a fetch failure
    pub failed_passes: u64,
    /// Positions adopted
    pub added: u64,
    /// Quantities corrected
    pub corrected: u64,
    /// Phantoms closed
    pub closed_phantom: u64,
    /// Exchange positions rejected
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    passes: AtomicU64,
    failed_passes: AtomicU64,
    added: AtomicU64,
    corrected: AtomicU64,
    closed_phantom: AtomicU64,
    rejected: AtomicU64,
}

// =============================================================================
// Synchronizer
// =============================================================================

/// Bookkeeping for one pass over one exchange
struct Pass {
    report: SyncReport,
    /// Rejections seen this pass
    rejected: HashSet<(Symbol, &'static str)>,
    /// Stored positions still active after this pass
    active: HashSet<PositionId>,
}

/// Periodic reconciliation between exchange gateways and the store.
///
/// `verified` and `rejected` remember what was already reported per exchange
/// so an unchanged exchange produces no events beyond the pass markers. Both
/// are pruned at the end of every pass to what that pass still saw.
pub struct PositionSynchronizer<S: Store + ?Sized> {
    config: SyncConfig,
    gateways: Gateways,
    store: Arc<S>,
    events: Arc<dyn EventSink>,
    verified: Mutex<HashMap<ExchangeId, HashSet<PositionId>>>,
    rejected: Mutex<HashMap<ExchangeId, HashSet<(Symbol, &'static str)>>>,
    counters: Counters,
}

impl<S: Store + ?Sized + 'static> PositionSynchronizer<S> {
    /// Create a synchronizer over `gateways`.
    pub fn new(
        config: SyncConfig,
        gateways: Gateways,
        store: Arc<S>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            gateways,
            store,
            events,
            verified: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Configured exchanges, sorted
    pub fn exchanges(&self) -> Vec<ExchangeId> {
        let mut exchanges: Vec<ExchangeId> = self.gateways.keys().cloned().collect();
        exchanges.sort();
        exchanges
    }

    /// Run one pass over `exchange`.
    pub async fn synchronize_exchange(&self, exchange: &ExchangeId) -> DaemonResult<SyncReport> {
        let gateway = self
            .gateways
            .get(exchange)
            .cloned()
            .ok_or_else(|| DaemonError::Exec(ExecError::UnknownExchange(exchange.clone())))?;

        let started = Instant::now();
        self.record(EngineEvent::SynchronizationStarted {
            exchange: exchange.clone(),
            timestamp: Utc::now(),
        })
        .await;

        let live = match gateway.fetch_positions().await {
            Ok(live) => live,
            Err(e) => {
                self.counters.failed_passes.fetch_add(1, Ordering::Relaxed);
                warn!(%exchange, error = %e, "Position fetch failed, pass aborted");
                return Err(e.into());
            },
        };
        let stored = self.store.positions().find_active_by_exchange(exchange).await?;

        let plan = find_discrepancies(exchange, &stored, &live, self.config.quantity_tolerance);
        let mut by_symbol: HashMap<&Symbol, &ExchangePosition> = HashMap::new();
        for position in live.iter().filter(|p| !p.contracts.is_zero() && !p.is_stale_cache()) {
            by_symbol.entry(&position.symbol).or_insert(position);
        }
        let stored_by_id: HashMap<PositionId, &Position> = stored.iter().map(|p| (p.id, p)).collect();

        let mut pass = Pass {
            report: SyncReport { exchange: exchange.to_string(), ..SyncReport::default() },
            rejected: HashSet::new(),
            active: stored.iter().map(|p| p.id).collect(),
        };

        for (symbol, reason) in &plan.rejected {
            self.reject(symbol, exchange, *reason, &mut pass).await;
        }

        for discrepancy in &plan.discrepancies {
            let outcome = match discrepancy.kind {
                DiscrepancyKind::MissingInStore => {
                    let native = by_symbol.get(&discrepancy.symbol).copied();
                    self.adopt(discrepancy, native, &mut pass).await
                },
                DiscrepancyKind::MissingOnExchange => self.close_phantom(discrepancy, &mut pass).await,
                DiscrepancyKind::QuantityMismatch => {
                    let stored = discrepancy.stored_position_id.and_then(|id| stored_by_id.get(&id));
                    self.correct_quantity(discrepancy, stored.copied(), &mut pass).await
                },
            };
            if let Err(e) = outcome {
                pass.report.errors += 1;
                error!(
                    symbol = %discrepancy.symbol,
                    %exchange,
                    kind = ?discrepancy.kind,
                    error = %e,
                    "Failed to resolve discrepancy"
                );
            }
        }

        for (position_id, quantity) in &plan.matched {
            if self.mark_verified(exchange, *position_id).await {
                if let Some(position) = stored_by_id.get(position_id) {
                    self.record(EngineEvent::PositionVerified {
                        position_id: *position_id,
                        symbol: position.symbol.clone(),
                        exchange: exchange.clone(),
                        quantity: *quantity,
                        timestamp: Utc::now(),
                    })
                    .await;
                }
                pass.report.verified += 1;
            }
        }

        self.prune(exchange, &pass).await;
        let report = pass.report;

        let elapsed = started.elapsed();
        self.record(EngineEvent::SynchronizationCompleted {
            exchange: exchange.clone(),
            added: report.added,
            corrected: report.corrected,
            closed_phantom: report.closed_phantom,
            rejected: report.rejected,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        })
        .await;

        self.tally(&report);
        if report.added + report.corrected + report.closed_phantom + report.rejected > 0 {
            info!(
                %exchange,
                added = report.added,
                corrected = report.corrected,
                closed_phantom = report.closed_phantom,
                rejected = report.rejected,
                elapsed_ms = elapsed.as_millis() as u64,
                "Synchronization pass corrected drift"
            );
        } else {
            debug!(%exchange, verified = report.verified, "Synchronization pass clean");
        }
        Ok(report)
    }

    /// Run one pass over every exchange. Failures are logged per exchange.
    pub async fn synchronize_all(&self) -> Vec<DaemonResult<SyncReport>> {
        let mut results = Vec::new();
        for exchange in self.exchanges() {
            let result = self.synchronize_exchange(&exchange).await;
            if let Err(e) = &result {
                warn!(%exchange, error = %e, "Synchronization pass failed");
            }
            results.push(result);
        }
        results
    }

    /// Run passes every `interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            exchanges = self.gateways.len(),
            "Position synchronizer started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Position synchronizer shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.synchronize_all().await;
                }
            }
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> SyncStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        SyncStats {
            passes: load(&c.passes),
            failed_passes: load(&c.failed_passes),
            added: load(&c.added),
            corrected: load(&c.corrected),
            closed_phantom: load(&c.closed_phantom),
            rejected: load(&c.rejected),
        }
    }

    /// Configured pass interval
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    async fn adopt(
        &self,
        discrepancy: &PositionDiscrepancy,
        native: Option<&ExchangePosition>,
        pass: &mut Pass,
    ) -> DaemonResult<()> {
        let exchange_order_id = discrepancy
            .exchange_position_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let (Some(exchange_order_id), Some(native)) = (exchange_order_id, native) else {
            self.reject(&discrepancy.symbol, &discrepancy.exchange, NO_ORDER_ID_REASON, pass).await;
            return Ok(());
        };

        let position = Position::new_active(
            native.symbol.clone(),
            discrepancy.exchange.clone(),
            native.side,
            Quantity::new(native.contracts)?,
            Price::new(native.entry_price)?,
            exchange_order_id.to_string(),
        );

        match insert_active_exclusive(self.store.as_ref(), &position).await? {
            InsertOutcome::Inserted => {
                self.mark_verified(&position.exchange, position.id).await;
                pass.active.insert(position.id);
                pass.report.added += 1;
                info!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    exchange = %position.exchange,
                    side = %position.side,
                    quantity = %position.quantity,
                    "Adopted exchange position missing from store"
                );
                self.record(EngineEvent::MissingPositionAdded {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    exchange: position.exchange.clone(),
                    side: position.side,
                    quantity: native.contracts,
                    entry_price: native.entry_price,
                    exchange_order_id: exchange_order_id.to_string(),
                    timestamp: Utc::now(),
                })
                .await;
            },
            InsertOutcome::AlreadyPresent(existing) => {
                pass.active.insert(existing);
                pass.report.already_present += 1;
                debug!(
                    symbol = %position.symbol,
                    exchange = %position.exchange,
                    %existing,
                    "Concurrent writer already inserted the position"
                );
            },
        }
        Ok(())
    }

    async fn close_phantom(
        &self,
        discrepancy: &PositionDiscrepancy,
        pass: &mut Pass,
    ) -> DaemonResult<()> {
        let Some(position_id) = discrepancy.stored_position_id else {
            return Ok(());
        };

        warn!(
            %position_id,
            symbol = %discrepancy.symbol,
            exchange = %discrepancy.exchange,
            "Stored position not found on exchange (phantom)"
        );
        self.record(EngineEvent::PhantomPositionDetected {
            position_id,
            symbol: discrepancy.symbol.clone(),
            exchange: discrepancy.exchange.clone(),
            timestamp: Utc::now(),
        })
        .await;

        let closed = self
            .store
            .positions()
            .mark_closed(position_id, PHANTOM_EXIT_REASON, Utc::now())
            .await?;
        pass.active.remove(&position_id);
        if !closed {
            debug!(%position_id, "Phantom was already closed");
            return Ok(());
        }

        pass.report.closed_phantom += 1;
        self.record(EngineEvent::PhantomPositionClosed {
            position_id,
            symbol: discrepancy.symbol.clone(),
            exchange: discrepancy.exchange.clone(),
            reason: PHANTOM_EXIT_REASON.to_string(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    async fn correct_quantity(
        &self,
        discrepancy: &PositionDiscrepancy,
        stored: Option<&Position>,
        pass: &mut Pass,
    ) -> DaemonResult<()> {
        let (Some(stored), Some(exchange_quantity)) = (stored, discrepancy.exchange_quantity) else {
            return Ok(());
        };
        let previous = stored.quantity.as_decimal();

        warn!(
            position_id = %stored.id,
            symbol = %stored.symbol,
            exchange = %stored.exchange,
            stored = %previous,
            exchange_quantity = %exchange_quantity,
            "Quantity mismatch, exchange value wins"
        );
        self.record(EngineEvent::QuantityMismatchDetected {
            position_id: stored.id,
            symbol: stored.symbol.clone(),
            exchange: stored.exchange.clone(),
            stored_quantity: previous,
            exchange_quantity,
            timestamp: Utc::now(),
        })
        .await;

        self.store.positions().update_quantity(stored.id, Quantity::new(exchange_quantity)?).await?;
        self.mark_verified(&stored.exchange, stored.id).await;
        pass.report.corrected += 1;

        self.record(EngineEvent::QuantityUpdated {
            position_id: stored.id,
            symbol: stored.symbol.clone(),
            exchange: stored.exchange.clone(),
            previous_quantity: previous,
            new_quantity: exchange_quantity,
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    /// Record a rejection unless the same (symbol, reason) was already
    /// reported on an earlier pass and has been present ever since.
    async fn reject(
        &self,
        symbol: &Symbol,
        exchange: &ExchangeId,
        reason: &'static str,
        pass: &mut Pass,
    ) {
        pass.rejected.insert((symbol.clone(), reason));
        let first = self
            .rejected
            .lock()
            .await
            .entry(exchange.clone())
            .or_default()
            .insert((symbol.clone(), reason));
        if !first {
            debug!(%symbol, %exchange, reason, "Exchange position still rejected");
            return;
        }

        warn!(%symbol, %exchange, reason, "Exchange position rejected");
        pass.report.rejected += 1;
        self.record(EngineEvent::MissingPositionRejected {
            symbol: symbol.clone(),
            exchange: exchange.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Returns `true` the first time `position_id` is confirmed.
    async fn mark_verified(&self, exchange: &ExchangeId, position_id: PositionId) -> bool {
        self.verified.lock().await.entry(exchange.clone()).or_default().insert(position_id)
    }

    /// Forget positions that are no longer active and rejections that no
    /// longer appear on the exchange.
    async fn prune(&self, exchange: &ExchangeId, pass: &Pass) {
        if let Some(verified) = self.verified.lock().await.get_mut(exchange) {
            verified.retain(|id| pass.active.contains(id));
        }
        if let Some(rejected) = self.rejected.lock().await.get_mut(exchange) {
            rejected.retain(|entry| pass.rejected.contains(entry));
        }
    }

    fn tally(&self, report: &SyncReport) {
        let c = &self.counters;
        c.passes.fetch_add(1, Ordering::Relaxed);
        c.added.fetch_add(u64::from(report.added), Ordering::Relaxed);
        c.corrected.fetch_add(u64::from(report.corrected), Ordering::Relaxed);
        c.closed_phantom.fetch_add(u64::from(report.closed_phantom), Ordering::Relaxed);
        c.rejected.fetch_add(u64::from(report.rejected), Ordering::Relaxed);
    }

    async fn record(&self, event: EngineEvent) {
        if let Err(e) = self.events.record(event).await {
            warn!(error = %e, "Failed to record sync event");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
