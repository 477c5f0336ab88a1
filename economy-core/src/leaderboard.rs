//! Background leaderboard recomputation
//!
//! ```text
//!            ┌──────────── interval tick ────────────┐
//!            ▼                                        │
//!   Idle ──► Computing ──► Published ──► Idle ────────┘
//!    │          │
//!    └──────────┴──► Stopped   (cancellation token fired)
//! ```
//!
//! Each cycle lists every ledger on disk, reads balances through the account
//! cache (so it honours the per-account lock), sorts, and swaps the new
//! snapshot in with `ArcSwap`. Readers keep whatever snapshot they loaded;
//! nothing they do blocks the engine and nothing the engine does blocks them.
//! A cancelled cycle publishes nothing.

use crate::{
    cache::AccountCache,
    error::{Error, Result},
    metrics::Metrics,
    storage::TransactionLedger,
};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One ranked account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderboardEntry {
    /// Account identifier
    pub identifier: Uuid,
    /// Balance when the snapshot was taken
    pub balance: Decimal,
}

/// Immutable ranking, richest first
#[derive(Debug, Clone, Default)]
pub struct LeaderboardSnapshot {
    entries: Vec<LeaderboardEntry>,
    computed_at: Option<DateTime<Utc>>,
    skipped: usize,
}

impl LeaderboardSnapshot {
    /// Snapshot with no entries, published before the first cycle
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rank balances: descending, ties by ascending identifier
    pub fn from_balances(balances: Vec<(Uuid, Decimal)>, skipped: usize) -> Self {
        let mut entries: Vec<LeaderboardEntry> = balances
            .into_iter()
            .map(|(identifier, balance)| LeaderboardEntry {
                identifier,
                balance,
            })
            .collect();
        entries.sort_by(|a, b| {
            b.balance
                .cmp(&a.balance)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });

        Self {
            entries,
            computed_at: Some(Utc::now()),
            skipped,
        }
    }

    /// All entries in rank order
    pub fn entries(&self) -> &[LeaderboardEntry] {
        &self.entries
    }

    /// Number of ranked accounts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is ranked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Page `page` (0-based) of `per_page` entries
    pub fn page(&self, page: usize, per_page: usize) -> &[LeaderboardEntry] {
        let start = page.saturating_mul(per_page).min(self.entries.len());
        let end = start.saturating_add(per_page).min(self.entries.len());
        &self.entries[start..end]
    }

    /// Number of pages of `per_page` entries
    pub fn page_count(&self, per_page: usize) -> usize {
        if per_page == 0 {
            return 0;
        }
        self.entries.len().div_ceil(per_page)
    }

    /// 1-based rank of an account
    pub fn rank_of(&self, identifier: &Uuid) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.identifier == *identifier)
            .map(|pos| pos + 1)
    }

    /// Sum of all ranked balances, saturating at the `Decimal` range
    pub fn total(&self) -> Decimal {
        self.entries
            .iter()
            .fold(Decimal::ZERO, |sum, entry| sum.saturating_add(entry.balance))
    }

    /// When this snapshot was computed; `None` for the initial empty one
    pub fn computed_at(&self) -> Option<DateTime<Utc>> {
        self.computed_at
    }

    /// Accounts left out because their ledger could not be read
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting for the next tick
    Idle,
    /// Reading balances
    Computing,
    /// A snapshot was just swapped in
    Published,
    /// Cancelled; terminal
    Stopped,
}

/// Periodic leaderboard recomputation
#[derive(Debug)]
pub struct LeaderboardEngine {
    cache: Arc<AccountCache>,
    ledger: Arc<TransactionLedger>,
    snapshot: ArcSwap<LeaderboardSnapshot>,
    state: Mutex<EngineState>,
    interval: Duration,
    started: AtomicBool,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl LeaderboardEngine {
    /// Create an idle engine with an empty snapshot
    pub fn new(
        cache: Arc<AccountCache>,
        ledger: Arc<TransactionLedger>,
        interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            ledger,
            snapshot: ArcSwap::from_pointee(LeaderboardSnapshot::empty()),
            state: Mutex::new(EngineState::Idle),
            interval,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            metrics,
        }
    }

    /// Most recently published snapshot
    pub fn snapshot(&self) -> Arc<LeaderboardSnapshot> {
        self.snapshot.load_full()
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Token that stops the engine when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop at the next safe point; the engine never restarts
    pub fn stop(&self) {
        self.cancel.cancel();
        self.set_state(EngineState::Stopped);
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.lock();
        if *state != EngineState::Stopped {
            *state = next;
        }
    }

    /// Spawn the periodic loop on the current tokio runtime
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::PreconditionViolation(
                "leaderboard engine already started".to_string(),
            ));
        }
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            engine.run().await;
        }))
    }

    async fn run(self: Arc<Self>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Leaderboard engine started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // File scans block; keep them off the async workers
            let engine = Arc::clone(&self);
            if let Err(e) = tokio::task::spawn_blocking(move || engine.recompute()).await {
                tracing::error!(error = %e, "Leaderboard recomputation task failed");
            }

            if self.cancel.is_cancelled() {
                break;
            }
            self.set_state(EngineState::Idle);
        }

        self.set_state(EngineState::Stopped);
        tracing::info!("Leaderboard engine stopped");
    }

    /// Run one cycle now and publish the result
    ///
    /// Returns `None` if the engine was stopped before the cycle finished;
    /// nothing is published in that case.
    pub fn recompute(&self) -> Option<Arc<LeaderboardSnapshot>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.set_state(EngineState::Computing);
        let started = Instant::now();

        let mut identifiers: Vec<Uuid> = match self.ledger.known_identifiers() {
            Ok(identifiers) => identifiers.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot list ledgers; keeping previous leaderboard");
                self.set_state(EngineState::Idle);
                return None;
            }
        };

        identifiers.sort_unstable();

        let mut balances = Vec::with_capacity(identifiers.len());
        let mut skipped = 0;
        for identifier in identifiers {
            if self.cancel.is_cancelled() {
                tracing::debug!("Leaderboard cycle abandoned");
                return None;
            }
            match self.cache.get(identifier).and_then(|account| account.balance()) {
                Ok(balance) => balances.push((identifier, balance)),
                Err(e) => {
                    skipped += 1;
                    self.metrics.leaderboard_skipped.inc();
                    tracing::warn!(
                        identifier = %identifier,
                        error = %e,
                        "Skipping unreadable account in leaderboard"
                    );
                }
            }
        }

        let snapshot = Arc::new(LeaderboardSnapshot::from_balances(balances, skipped));
        if self.cancel.is_cancelled() {
            return None;
        }
        self.snapshot.store(Arc::clone(&snapshot));
        self.set_state(EngineState::Published);

        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record_leaderboard_cycle(snapshot.len(), elapsed);
        tracing::debug!(
            accounts = snapshot.len(),
            skipped,
            elapsed_ms = (elapsed * 1000.0) as u64,
            "Leaderboard published"
        );

        Some(snapshot)
    }
}
