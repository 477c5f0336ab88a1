//! Core types for the economy
//!
//! All types are designed for:
//! - Deterministic serialization (JSON lines for the log, fixed-width bincode
//!   for the index)
//! - Exact arithmetic (Decimal for money)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized file key of an identifier: lowercase hex, no separators
pub fn storage_key(identifier: &Uuid) -> String {
    identifier.simple().to_string()
}

/// Parse an identifier from its hyphenated or simple text form
pub fn parse_identifier(text: &str) -> Option<Uuid> {
    Uuid::parse_str(text.trim()).ok()
}

/// One immutable ledger record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Position in this account's log, starting at 0
    pub seq: u64,

    /// When the entry was written (milliseconds since Unix epoch)
    pub timestamp_ms: i64,

    /// Other side of a transfer; `None` for system adjustments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<Uuid>,

    /// Signed change applied by this entry
    pub amount: Decimal,

    /// Balance after this entry
    pub balance: Decimal,

    /// Free-form note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl LedgerEntry {
    /// Entry timestamp as a `DateTime`
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default()
    }

    /// True for admin/system adjustments
    pub fn is_system(&self) -> bool {
        self.counterparty.is_none()
    }
}

/// Sparse index record: where entry `seq` starts in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Entry sequence number
    pub seq: u64,

    /// Byte offset of that entry's line in the log
    pub offset: u64,
}

impl IndexRecord {
    /// Encoded size on disk (two little-endian u64)
    pub const SIZE: usize = 16;
}

/// Page selector for history queries, counted from the newest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRange {
    /// Newest entries to skip
    pub skip: u64,

    /// Maximum entries to return
    pub limit: u64,
}

impl HistoryRange {
    /// The `limit` newest entries
    pub fn latest(limit: u64) -> Self {
        Self { skip: 0, limit }
    }

    /// Page `page` (0-based) of `per_page` entries
    pub fn page(page: u64, per_page: u64) -> Self {
        Self {
            skip: page.saturating_mul(per_page),
            limit: per_page,
        }
    }
}
