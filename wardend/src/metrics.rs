//! Prometheus exposition of component statistics.
//!
//! Components keep their own atomic counters; the gauges here are refreshed
//! from a stats snapshot on every scrape.

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use warden_exec::ExecutorStats;

use crate::aged_monitor::AgedStats;
use crate::error::{DaemonError, DaemonResult};
use crate::price_bus::BusStats;
use crate::synchronizer::SyncStats;

/// Stats of every component at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    /// Aged-position monitor
    pub aged: AgedStats,
    /// Reconciliation
    pub sync: SyncStats,
    /// Close execution
    pub executor: ExecutorStats,
    /// Price fan-out
    pub price_bus: BusStats,
}

/// Gauges owned by one registry.
pub struct Metrics {
    registry: Registry,
    aged_tracked: IntGaugeVec,
    aged_total: IntGaugeVec,
    sync_total: IntGaugeVec,
    executor_total: IntGaugeVec,
    bus_total: IntGaugeVec,
    bus_symbols: IntGauge,
    bus_subscriptions: IntGauge,
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, label: &str) -> DaemonResult<IntGaugeVec> {
    let vec = IntGaugeVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> DaemonResult<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl Metrics {
    /// Register every gauge in a fresh registry
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new_custom(Some("warden".to_string()), None)?;

        Ok(Self {
            aged_tracked: gauge_vec(&registry, "aged_tracked", "Tracked aged positions", "phase")?,
            aged_total: gauge_vec(&registry, "aged_total", "Aged monitor counters", "kind")?,
            sync_total: gauge_vec(&registry, "sync_total", "Reconciliation counters", "kind")?,
            executor_total: gauge_vec(&registry, "executor_total", "Close executor counters", "kind")?,
            bus_total: gauge_vec(&registry, "price_bus_total", "Price bus counters", "kind")?,
            bus_symbols: gauge(&registry, "price_bus_symbols", "Symbols with subscribers")?,
            bus_subscriptions: gauge(&registry, "price_bus_subscriptions", "Live subscriptions")?,
            registry,
        })
    }

    /// Refresh gauges from `stats`
    pub fn observe(&self, stats: &EngineStats) {
        let aged = &stats.aged;
        for (phase, count) in
            [("grace", aged.grace), ("progressive", aged.progressive), ("stale", aged.stale)]
        {
            self.aged_tracked.with_label_values(&[phase]).set(count as i64);
        }
        set_all(
            &self.aged_total,
            &[
                ("detected", aged.detected),
                ("phase_changes", aged.phase_changes),
                ("closes_triggered", aged.closes_triggered),
                ("closes_succeeded", aged.closes_succeeded),
                ("closes_failed", aged.closes_failed),
                ("ghosts", aged.ghosts),
                ("recovered", aged.recovered),
                ("discarded", aged.discarded),
            ],
        );

        let sync = &stats.sync;
        set_all(
            &self.sync_total,
            &[
                ("passes", sync.passes),
                ("failed_passes", sync.failed_passes),
                ("added", sync.added),
                ("corrected", sync.corrected),
                ("closed_phantom", sync.closed_phantom),
                ("rejected", sync.rejected),
            ],
        );

        let exec = &stats.executor;
        set_all(
            &self.executor_total,
            &[
                ("closes_requested", exec.closes_requested),
                ("closes_succeeded", exec.closes_succeeded),
                ("closes_failed", exec.closes_failed),
                ("attempts", exec.attempts),
                ("retries", exec.retries),
                ("rate_limited", exec.rate_limited),
                ("permanent_failures", exec.permanent_failures),
                ("validation_failures", exec.validation_failures),
                ("transient_failures", exec.transient_failures),
                ("unknown_failures", exec.unknown_failures),
                ("market_fills", exec.market_fills),
                ("limit_aggressive_fills", exec.limit_aggressive_fills),
                ("limit_maker_fills", exec.limit_maker_fills),
            ],
        );

        let bus = &stats.price_bus;
        set_all(
            &self.bus_total,
            &[
                ("updates", bus.updates),
                ("dispatched", bus.dispatched),
                ("throttled", bus.throttled),
                ("dropped", bus.dropped),
                ("delivered", bus.delivered),
                ("handler_errors", bus.handler_errors),
                ("handler_panics", bus.handler_panics),
                ("stale_warnings", bus.stale_warnings),
                ("resubscriptions", bus.resubscriptions),
                ("resubscribe_failures", bus.resubscribe_failures),
                ("alerts", bus.alerts),
            ],
        );
        self.bus_symbols.set(bus.symbols as i64);
        self.bus_subscriptions.set(bus.subscriptions as i64);
    }

    /// Prometheus text format
    pub fn render(&self) -> DaemonResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| DaemonError::Handler(format!("metrics are not UTF-8: {}", e)))
    }
}

fn set_all(vec: &IntGaugeVec, values: &[(&str, u64)]) {
    for (kind, value) in values {
        vec.with_label_values(&[*kind]).set(to_i64(*value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_reflects_latest_stats() {
        let metrics = Metrics::new().unwrap();
        let mut stats = EngineStats::default();
        stats.aged.grace = 2;
        stats.sync.closed_phantom = 3;
        stats.executor.limit_maker_fills = 1;
        stats.executor.unknown_failures = 4;
        metrics.observe(&stats);

        let text = metrics.render().unwrap();
        assert!(text.contains("warden_aged_tracked{phase=\"grace\"} 2"));
        assert!(text.contains("warden_sync_total{kind=\"closed_phantom\"} 3"));
        assert!(text.contains("warden_executor_total{kind=\"limit_maker_fills\"} 1"));
        assert!(text.contains("warden_executor_total{kind=\"unknown_failures\"} 4"));
        assert!(text.contains("warden_executor_total{kind=\"transient_failures\"} 0"));

        stats.aged.grace = 0;
        metrics.observe(&stats);
        assert!(metrics.render().unwrap().contains("warden_aged_tracked{phase=\"grace\"} 0"));
    }

    #[test]
    fn test_registries_are_independent() {
        // two daemons in one process must not collide on metric names
        assert!(Metrics::new().is_ok());
        assert!(Metrics::new().is_ok());
    }
}
