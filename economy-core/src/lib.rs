//! Economy Core
//!
//! Per-player balance ledgers, a persistent name directory and a background
//! leaderboard for game servers.
//!
//! # Architecture
//!
//! - **Append-only ledgers**: one JSON-lines log per account, with a sparse
//!   binary index that is verified on every tail lookup and rebuilt on mismatch
//! - **Weak account cache**: at most one live account per identifier; its mutex
//!   is the account's write lock
//! - **Identity directory**: name ↔ identifier pairs flushed atomically on
//!   every change, with deterministic offline identifiers
//! - **Leaderboard engine**: periodic recomputation published by atomic swap
//!
//! # Invariants
//!
//! - Every stored amount and balance has at most two decimal places
//! - Balance after an entry = previous balance + delta, truncated toward zero
//! - Sequence numbers in a log are contiguous from zero
//! - Migration moves the log and index together or not at all

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod cache;
pub mod config;
pub mod directory;
pub mod economy;
pub mod error;
pub mod leaderboard;
pub mod metrics;
pub mod money;
pub mod storage;
pub mod types;

// Re-exports
pub use cache::{Account, AccountCache, AccountGuard};
pub use config::Config;
pub use directory::{derive_offline_identifier, IdentityDirectory};
pub use economy::Economy;
pub use error::{Error, Result};
pub use leaderboard::{EngineState, LeaderboardEngine, LeaderboardEntry, LeaderboardSnapshot};
pub use metrics::Metrics;
pub use storage::TransactionLedger;
pub use types::{HistoryRange, IndexRecord, LedgerEntry};
