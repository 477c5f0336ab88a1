//! Metrics collection for observability
//!
//! Prometheus metrics for the economy core, held in a private registry so
//! several cores (tests, multiple worlds) can live in one process.
//!
//! # Metrics
//!
//! - `economy_ledger_appends_total` - Ledger entries written
//! - `economy_ledger_index_rebuilds_total` - Index files rebuilt from the log
//! - `economy_cache_hits_total` / `economy_cache_misses_total` - Account cache lookups
//! - `economy_cache_entries` - Slots currently held by the account cache
//! - `economy_directory_writes_total` - Identity directory flushes
//! - `economy_leaderboard_cycles_total` - Published leaderboard snapshots
//! - `economy_leaderboard_skipped_total` - Accounts skipped during recomputation
//! - `economy_leaderboard_size` - Entries in the published snapshot
//! - `economy_leaderboard_cycle_seconds` - Recomputation latency

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Ledger entries appended
    pub ledger_appends: IntCounter,

    /// Index rebuilds
    pub index_rebuilds: IntCounter,

    /// Cache hits
    pub cache_hits: IntCounter,

    /// Cache misses (account constructed)
    pub cache_misses: IntCounter,

    /// Cache slots (live or not yet swept)
    pub cache_entries: IntGauge,

    /// Directory flushes
    pub directory_writes: IntCounter,

    /// Leaderboard cycles published
    pub leaderboard_cycles: IntCounter,

    /// Accounts skipped by the leaderboard
    pub leaderboard_skipped: IntCounter,

    /// Leaderboard size
    pub leaderboard_size: IntGauge,

    /// Leaderboard cycle duration histogram
    pub leaderboard_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let ledger_appends = IntCounter::new(
            "economy_ledger_appends_total",
            "Ledger entries appended",
        )?;
        registry.register(Box::new(ledger_appends.clone()))?;

        let index_rebuilds = IntCounter::new(
            "economy_ledger_index_rebuilds_total",
            "Ledger index files rebuilt from the log",
        )?;
        registry.register(Box::new(index_rebuilds.clone()))?;

        let cache_hits = IntCounter::new("economy_cache_hits_total", "Account cache hits")?;
        registry.register(Box::new(cache_hits.clone()))?;

        let cache_misses =
            IntCounter::new("economy_cache_misses_total", "Account cache misses")?;
        registry.register(Box::new(cache_misses.clone()))?;

        let cache_entries =
            IntGauge::new("economy_cache_entries", "Slots held by the account cache")?;
        registry.register(Box::new(cache_entries.clone()))?;

        let directory_writes = IntCounter::new(
            "economy_directory_writes_total",
            "Identity directory flushes",
        )?;
        registry.register(Box::new(directory_writes.clone()))?;

        let leaderboard_cycles = IntCounter::new(
            "economy_leaderboard_cycles_total",
            "Leaderboard snapshots published",
        )?;
        registry.register(Box::new(leaderboard_cycles.clone()))?;

        let leaderboard_skipped = IntCounter::new(
            "economy_leaderboard_skipped_total",
            "Accounts skipped during leaderboard recomputation",
        )?;
        registry.register(Box::new(leaderboard_skipped.clone()))?;

        let leaderboard_size =
            IntGauge::new("economy_leaderboard_size", "Entries in the published leaderboard")?;
        registry.register(Box::new(leaderboard_size.clone()))?;

        let leaderboard_duration = Histogram::with_opts(
            HistogramOpts::new(
                "economy_leaderboard_cycle_seconds",
                "Leaderboard recomputation latency",
            )
            .buckets(vec![0.001, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 30.0]),
        )?;
        registry.register(Box::new(leaderboard_duration.clone()))?;

        Ok(Self {
            ledger_appends,
            index_rebuilds,
            cache_hits,
            cache_misses,
            cache_entries,
            directory_writes,
            leaderboard_cycles,
            leaderboard_skipped,
            leaderboard_size,
            leaderboard_duration,
            registry,
        })
    }

    /// Record a published leaderboard cycle
    pub fn record_leaderboard_cycle(&self, size: usize, duration_seconds: f64) {
        self.leaderboard_cycles.inc();
        self.leaderboard_size.set(size as i64);
        self.leaderboard_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("ledger_appends", &self.ledger_appends.get())
            .field("cache_entries", &self.cache_entries.get())
            .field("leaderboard_cycles", &self.leaderboard_cycles.get())
            .finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
