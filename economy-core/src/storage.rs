//! Per-account ledger storage
//!
//! # Layout
//!
//! Every account owns two files under `<data_dir>/users/`, named by the
//! account's storage key (lowercase hex identifier):
//!
//! - `<key>.log` - Append-only entry log, one JSON record per line
//! - `<key>.idx` - Sparse index of `(seq, offset)` records, one for every
//!   `index_stride`-th entry, fixed-width bincode
//!
//! The log is the source of truth. The index is derived state: it is checked
//! each time the tail of the log is located and rebuilt from the log whenever
//! it disagrees.
//!
//! # Concurrency
//!
//! The ledger does not lock. Callers serialize writes per account; the
//! [`Account`](crate::cache::Account) handle holds that lock. Public reads
//! never change files, so they may run without it.

use crate::{
    error::{Error, IoResultExt, Result},
    metrics::Metrics,
    money,
    types::{storage_key, parse_identifier, HistoryRange, IndexRecord, LedgerEntry},
    Config,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const LOG_EXTENSION: &str = "log";
const INDEX_EXTENSION: &str = "idx";

/// Most recent entry of a log plus the verified index
#[derive(Debug, Clone)]
struct Tail {
    last: LedgerEntry,
    log_len: u64,
    index: Vec<IndexRecord>,
}

/// Whether a tail lookup may rewrite files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Repair {
    /// Work around damage in memory; safe without the account lock
    InMemory,
    /// Truncate a torn tail and rewrite the index; needs the account lock
    OnDisk,
}

/// One line read from the log
enum RawLine<'a> {
    /// Newline-terminated record (newline stripped)
    Complete { offset: u64, bytes: &'a [u8] },
    /// Trailing bytes with no newline: an interrupted append
    Torn { offset: u64 },
}

/// Sequential line reader over a log file
struct LogReader {
    reader: BufReader<File>,
    offset: u64,
    buf: Vec<u8>,
}

impl LogReader {
    fn open_at(path: &Path, offset: u64) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader: BufReader::new(file),
            offset,
            buf: Vec::with_capacity(256),
        })
    }

    fn next_line(&mut self) -> std::io::Result<Option<RawLine<'_>>> {
        self.buf.clear();
        let start = self.offset;
        let n = self.reader.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.offset += n as u64;
        if self.buf.last() != Some(&b'\n') {
            return Ok(Some(RawLine::Torn { offset: start }));
        }
        Ok(Some(RawLine::Complete {
            offset: start,
            bytes: &self.buf[..n - 1],
        }))
    }
}

/// File-backed transaction ledger for all accounts
#[derive(Debug)]
pub struct TransactionLedger {
    users_dir: PathBuf,
    index_stride: u64,
    sync_on_append: bool,
    metrics: Arc<Metrics>,
}

impl TransactionLedger {
    /// Open (creating if needed) the ledger directory
    pub fn open(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        let users_dir = config.users_dir();
        std::fs::create_dir_all(&users_dir).at(&users_dir)?;

        tracing::info!(path = ?users_dir, stride = config.ledger.index_stride, "Opened ledger store");

        Ok(Self {
            users_dir,
            index_stride: config.ledger.index_stride.max(1),
            sync_on_append: config.ledger.sync_on_append,
            metrics,
        })
    }

    /// Path of an account's entry log
    pub fn log_path(&self, identifier: &Uuid) -> PathBuf {
        self.users_dir
            .join(format!("{}.{}", storage_key(identifier), LOG_EXTENSION))
    }

    /// Path of an account's index
    pub fn index_path(&self, identifier: &Uuid) -> PathBuf {
        self.users_dir
            .join(format!("{}.{}", storage_key(identifier), INDEX_EXTENSION))
    }

    /// Whether an entry log exists for the account
    pub fn has_ledger(&self, identifier: &Uuid) -> bool {
        self.log_path(identifier).is_file()
    }

    // Read operations
    //
    // The public reads never modify files, so they are safe without the
    // account lock. A damaged index or torn tail is worked around in memory;
    // the locked paths (`Account`, `append`, `migrate`) repair it on disk.

    /// Balance after the most recent entry, zero if there is none
    pub fn current_balance(&self, identifier: Uuid) -> Result<Decimal> {
        self.balance_with(identifier, Repair::InMemory)
    }

    pub(crate) fn balance_with(&self, identifier: Uuid, repair: Repair) -> Result<Decimal> {
        Ok(self
            .locate_tail(identifier, repair)?
            .map(|tail| tail.last.balance)
            .unwrap_or(Decimal::ZERO))
    }

    /// Most recent entry, if any
    pub fn last_entry(&self, identifier: Uuid) -> Result<Option<LedgerEntry>> {
        Ok(self
            .locate_tail(identifier, Repair::InMemory)?
            .map(|tail| tail.last))
    }

    /// Number of entries in the account's log
    pub fn entry_count(&self, identifier: Uuid) -> Result<u64> {
        Ok(self
            .locate_tail(identifier, Repair::InMemory)?
            .map(|tail| tail.last.seq + 1)
            .unwrap_or(0))
    }

    /// Entries newest-first, paged through the index
    pub fn history(&self, identifier: Uuid, range: HistoryRange) -> Result<Vec<LedgerEntry>> {
        self.history_with(identifier, range, Repair::InMemory)
    }

    pub(crate) fn history_with(
        &self,
        identifier: Uuid,
        range: HistoryRange,
        repair: Repair,
    ) -> Result<Vec<LedgerEntry>> {
        let Some(tail) = self.locate_tail(identifier, repair)? else {
            return Ok(Vec::new());
        };

        match self.read_range(identifier, &tail, range) {
            Err(Error::LedgerCorruption { reason, .. }) => {
                // Only the last index record is checked on lookup; an earlier
                // one may still point at the wrong byte
                tracing::warn!(
                    identifier = %identifier,
                    reason = %reason,
                    "Index record disagrees with log; rescanning"
                );
                match self.rebuild(identifier, repair)? {
                    Some(tail) => self.read_range(identifier, &tail, range),
                    None => Ok(Vec::new()),
                }
            }
            result => result,
        }
    }

    fn read_range(
        &self,
        identifier: Uuid,
        tail: &Tail,
        range: HistoryRange,
    ) -> Result<Vec<LedgerEntry>> {
        let total = tail.last.seq + 1;
        if range.limit == 0 || range.skip >= total {
            return Ok(Vec::new());
        }
        let hi = total - 1 - range.skip;
        let lo = hi.saturating_sub(range.limit - 1);

        // Closest indexed entry at or before `lo`
        let pos = tail.index.partition_point(|record| record.seq <= lo);
        let start = tail.index[pos.saturating_sub(1)];

        let log = self.log_path(&identifier);
        let mut reader = LogReader::open_at(&log, start.offset).at(&log)?;
        let mut expected = start.seq;
        let mut entries = Vec::with_capacity((hi - lo + 1) as usize);

        while expected <= hi {
            let entry = match reader.next_line().at(&log)? {
                Some(RawLine::Complete { offset, bytes }) => {
                    parse_entry(identifier, offset, bytes, expected)?
                }
                Some(RawLine::Torn { offset }) => {
                    return Err(Error::corruption(
                        identifier,
                        format!("log ends mid-record at byte {}", offset),
                    ));
                }
                None => {
                    return Err(Error::corruption(
                        identifier,
                        format!("log ended before entry {}", expected),
                    ));
                }
            };
            if entry.seq >= lo {
                entries.push(entry);
            }
            expected += 1;
        }

        entries.reverse();
        Ok(entries)
    }

    /// Every identifier with an entry log on disk
    pub fn known_identifiers(&self) -> Result<HashSet<Uuid>> {
        let dir = match std::fs::read_dir(&self.users_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(Error::storage(&self.users_dir, e)),
        };

        let mut identifiers = HashSet::new();
        for item in dir {
            let item = item.at(&self.users_dir)?;
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            match path.file_stem().and_then(|stem| stem.to_str()).and_then(parse_identifier) {
                Some(identifier) => {
                    identifiers.insert(identifier);
                }
                None => tracing::debug!(path = ?path, "Ignoring unrecognized ledger file"),
            }
        }
        Ok(identifiers)
    }

    // Write operations

    /// Append one entry and return it
    ///
    /// `delta` is truncated to cents before it is applied, and so is the
    /// resulting balance. Callers must hold the account's lock.
    pub fn append(
        &self,
        identifier: Uuid,
        delta: Decimal,
        counterparty: Option<Uuid>,
        memo: Option<String>,
    ) -> Result<LedgerEntry> {
        let delta = money::truncate(delta);
        let tail = self.locate_tail(identifier, Repair::OnDisk)?;

        let (seq, previous, offset) = match &tail {
            Some(tail) => (tail.last.seq + 1, tail.last.balance, tail.log_len),
            None => (0, Decimal::ZERO, 0),
        };
        let balance = previous.checked_add(delta).ok_or_else(|| {
            Error::PreconditionViolation(format!(
                "balance {} + {} is out of range for {}",
                previous, delta, identifier
            ))
        })?;

        let entry = LedgerEntry {
            seq,
            timestamp_ms: Utc::now().timestamp_millis(),
            counterparty,
            amount: delta,
            balance: money::truncate(balance),
            memo,
        };

        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| Error::corruption(identifier, format!("cannot encode entry: {}", e)))?;
        line.push(b'\n');

        let log = self.log_path(&identifier);
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(tail.is_none())
                .open(&log)
                .at(&log)?;
            file.seek(SeekFrom::Start(offset)).at(&log)?;
            file.write_all(&line).at(&log)?;
            if self.sync_on_append {
                file.sync_data().at(&log)?;
            }
        }

        if seq % self.index_stride == 0 {
            let record = encode_record(&IndexRecord { seq, offset })?;
            let index = self.index_path(&identifier);
            let mut file = if seq == 0 {
                File::create(&index).at(&index)?
            } else {
                OpenOptions::new().append(true).create(true).open(&index).at(&index)?
            };
            file.write_all(&record).at(&index)?;
        }

        self.metrics.ledger_appends.inc();
        tracing::debug!(
            identifier = %identifier,
            seq,
            amount = %entry.amount,
            balance = %entry.balance,
            "Ledger entry appended"
        );

        Ok(entry)
    }

    /// Move an account's log and index to a new identifier
    ///
    /// Returns `false` and changes nothing if the source has no log or either
    /// destination file exists. A missing source index is rebuilt first.
    /// Callers must hold both accounts' locks.
    pub fn migrate(&self, old: Uuid, new: Uuid) -> bool {
        match self.try_migrate(old, new) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(old = %old, new = %new, error = %e, "Ledger migration refused");
                false
            }
        }
    }

    /// [`migrate`](Self::migrate) with the reason for a refusal
    pub fn try_migrate(&self, old: Uuid, new: Uuid) -> Result<()> {
        if old == new {
            return Err(Error::MigrationConflict(format!(
                "{} is both source and destination",
                old
            )));
        }

        let (old_log, old_idx) = (self.log_path(&old), self.index_path(&old));
        let (new_log, new_idx) = (self.log_path(&new), self.index_path(&new));

        if !old_log.is_file() {
            return Err(Error::MigrationConflict(format!("no ledger for {}", old)));
        }
        if new_log.exists() || new_idx.exists() {
            return Err(Error::MigrationConflict(format!(
                "ledger for {} already exists",
                new
            )));
        }
        if !old_idx.is_file() {
            self.rebuild(old, Repair::OnDisk)?;
        }

        // The log rename commits; the index goes first so it can be put back
        std::fs::rename(&old_idx, &new_idx).at(&old_idx)?;
        if let Err(e) = std::fs::rename(&old_log, &new_log) {
            if let Err(rollback) = std::fs::rename(&new_idx, &old_idx) {
                tracing::error!(
                    old = %old,
                    new = %new,
                    error = %rollback,
                    "Failed to restore index after aborted migration"
                );
            }
            return Err(Error::storage(old_log, e));
        }

        tracing::info!(old = %old, new = %new, "Ledger migrated");
        Ok(())
    }

    // Index maintenance

    /// Rebuild the index from a full scan of the log
    ///
    /// A torn final record (interrupted append) is truncated away. Callers
    /// must hold the account's lock.
    pub fn rebuild_index(&self, identifier: Uuid) -> Result<()> {
        self.rebuild(identifier, Repair::OnDisk).map(|_| ())
    }

    fn rebuild(&self, identifier: Uuid, repair: Repair) -> Result<Option<Tail>> {
        let log = self.log_path(&identifier);
        if !log.is_file() {
            return Ok(None);
        }

        let mut reader = LogReader::open_at(&log, 0).at(&log)?;
        let mut index = Vec::new();
        let mut last = None;
        let mut expected = 0u64;
        let mut torn_at = None;

        while let Some(line) = reader.next_line().at(&log)? {
            match line {
                RawLine::Complete { offset, bytes } => {
                    let entry = parse_entry(identifier, offset, bytes, expected)?;
                    if entry.seq % self.index_stride == 0 {
                        index.push(IndexRecord {
                            seq: entry.seq,
                            offset,
                        });
                    }
                    last = Some(entry);
                    expected += 1;
                }
                RawLine::Torn { offset } => {
                    torn_at = Some(offset);
                    break;
                }
            }
        }
        let mut log_len = reader.offset;
        drop(reader);

        // A torn tail seen without the lock may be an append still in flight
        if let Some(offset) = torn_at {
            log_len = offset;
        }

        if repair == Repair::InMemory {
            tracing::debug!(
                identifier = %identifier,
                entries = expected,
                "Rescanned ledger log without repairing"
            );
            return Ok(last.map(|last| Tail {
                last,
                log_len,
                index,
            }));
        }

        if let Some(offset) = torn_at {
            tracing::warn!(
                identifier = %identifier,
                offset,
                "Truncating interrupted append at end of log"
            );
            let file = OpenOptions::new().write(true).open(&log).at(&log)?;
            file.set_len(offset).at(&log)?;
            file.sync_all().at(&log)?;
        }

        self.write_index(&identifier, &index)?;
        self.metrics.index_rebuilds.inc();
        tracing::warn!(
            identifier = %identifier,
            entries = expected,
            records = index.len(),
            "Rebuilt ledger index from log"
        );

        Ok(last.map(|last| Tail {
            last,
            log_len,
            index,
        }))
    }

    fn write_index(&self, identifier: &Uuid, index: &[IndexRecord]) -> Result<()> {
        let path = self.index_path(identifier);
        let temp_path = path.with_extension("idx.tmp");

        let mut bytes = Vec::with_capacity(index.len() * IndexRecord::SIZE);
        for record in index {
            bytes.extend_from_slice(&encode_record(record)?);
        }

        {
            let mut file = File::create(&temp_path).at(&temp_path)?;
            file.write_all(&bytes).at(&temp_path)?;
            file.sync_all().at(&temp_path)?;
        }
        std::fs::rename(&temp_path, &path).at(&path)?;
        Ok(())
    }

    /// Read the index, or `None` if it is missing or structurally invalid
    fn read_index(&self, identifier: &Uuid, log_len: u64) -> Result<Option<Vec<IndexRecord>>> {
        let path = self.index_path(identifier);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage(path, e)),
        };

        if bytes.is_empty() || bytes.len() % IndexRecord::SIZE != 0 {
            return Ok(None);
        }

        let mut index = Vec::with_capacity(bytes.len() / IndexRecord::SIZE);
        for chunk in bytes.chunks_exact(IndexRecord::SIZE) {
            let Ok(record) = bincode::deserialize::<IndexRecord>(chunk) else {
                return Ok(None);
            };
            index.push(record);
        }

        let first_ok = index[0] == IndexRecord { seq: 0, offset: 0 };
        let monotonic = index
            .windows(2)
            .all(|pair| pair[0].seq < pair[1].seq && pair[0].offset < pair[1].offset);
        let strided = index.iter().all(|record| record.seq % self.index_stride == 0);
        let in_bounds = index.last().map_or(false, |record| record.offset < log_len);

        Ok((first_ok && monotonic && strided && in_bounds).then_some(index))
    }

    /// Find the newest entry, verifying the index on the way
    fn locate_tail(&self, identifier: Uuid, repair: Repair) -> Result<Option<Tail>> {
        let log = self.log_path(&identifier);
        let log_len = match std::fs::metadata(&log) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::storage(log, e)),
        };
        if log_len == 0 {
            return Ok(None);
        }

        let Some(index) = self.read_index(&identifier, log_len)? else {
            return self.rebuild(identifier, repair);
        };

        // Only the records after the last indexed entry need scanning
        let start = index[index.len() - 1];
        let mut reader = LogReader::open_at(&log, start.offset).at(&log)?;
        let mut expected = start.seq;
        let mut last = None;

        while let Some(line) = reader.next_line().at(&log)? {
            let RawLine::Complete { offset, bytes } = line else {
                return self.rebuild(identifier, repair);
            };
            let Ok(entry) = parse_entry(identifier, offset, bytes, expected) else {
                return self.rebuild(identifier, repair);
            };
            // An unindexed stride boundary means the index fell behind
            if entry.seq != start.seq && entry.seq % self.index_stride == 0 {
                return self.rebuild(identifier, repair);
            }
            last = Some(entry);
            expected += 1;
        }

        match last {
            Some(last) => Ok(Some(Tail {
                last,
                log_len: reader.offset,
                index,
            })),
            None => self.rebuild(identifier, repair),
        }
    }
}

fn parse_entry(identifier: Uuid, offset: u64, bytes: &[u8], expected: u64) -> Result<LedgerEntry> {
    let entry: LedgerEntry = serde_json::from_slice(bytes).map_err(|e| {
        Error::corruption(identifier, format!("unreadable entry at byte {}: {}", offset, e))
    })?;
    if entry.seq != expected {
        return Err(Error::corruption(
            identifier,
            format!(
                "entry at byte {} has seq {}, expected {}",
                offset, entry.seq, expected
            ),
        ));
    }
    Ok(entry)
}

fn encode_record(record: &IndexRecord) -> Result<Vec<u8>> {
    Ok(bincode::serialize(record)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_ledger(stride: u64) -> (TransactionLedger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.ledger.index_stride = stride;
        config.ledger.sync_on_append = false;
        let ledger = TransactionLedger::open(&config, Arc::new(Metrics::new().unwrap())).unwrap();
        (ledger, temp_dir)
    }

    fn cents(value: i64) -> Decimal {
        Decimal::new(value, 2)
    }

    #[test]
    fn test_balance_of_unknown_account_is_zero() {
        let (ledger, _temp) = test_ledger(4);
        let id = Uuid::new_v4();
        assert_eq!(ledger.current_balance(id).unwrap(), Decimal::ZERO);
        assert!(ledger.history(id, HistoryRange::latest(10)).unwrap().is_empty());
        assert!(!ledger.has_ledger(&id));
    }

    #[test]
    fn test_append_truncates_delta() {
        let (ledger, _temp) = test_ledger(4);
        let id = Uuid::new_v4();

        let entry = ledger
            .append(id, Decimal::new(150005, 3), None, None)
            .unwrap();
        assert_eq!(entry.amount, cents(15000));
        assert_eq!(entry.balance, cents(15000));
        assert_eq!(ledger.current_balance(id).unwrap(), cents(15000));
    }

    #[test]
    fn test_balance_follows_appends() {
        let (ledger, _temp) = test_ledger(3);
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();

        for i in 0..10 {
            ledger.append(id, cents(1000), Some(other), Some(format!("pay {}", i))).unwrap();
        }
        ledger.append(id, cents(-2550), None, None).unwrap();

        assert_eq!(ledger.current_balance(id).unwrap(), cents(7450));
        assert_eq!(ledger.entry_count(id).unwrap(), 11);
        // 0, 3, 6, 9 indexed
        let idx_len = std::fs::metadata(ledger.index_path(&id)).unwrap().len();
        assert_eq!(idx_len, 4 * IndexRecord::SIZE as u64);
    }

    #[test]
    fn test_history_newest_first_and_paged() {
        let (ledger, _temp) = test_ledger(4);
        let id = Uuid::new_v4();
        for i in 1..=10 {
            ledger.append(id, Decimal::from(i), None, None).unwrap();
        }

        let latest = ledger.history(id, HistoryRange::latest(3)).unwrap();
        let seqs: Vec<u64> = latest.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![9, 8, 7]);

        let page = ledger.history(id, HistoryRange::page(1, 4)).unwrap();
        let seqs: Vec<u64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![5, 4, 3, 2]);

        let last_page = ledger.history(id, HistoryRange::page(2, 4)).unwrap();
        let seqs: Vec<u64> = last_page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 0]);

        assert!(ledger.history(id, HistoryRange::page(3, 4)).unwrap().is_empty());
    }

    #[test]
    fn test_memo_with_newline_stays_on_one_line() {
        let (ledger, _temp) = test_ledger(4);
        let id = Uuid::new_v4();
        ledger
            .append(id, cents(100), None, Some("line one\nline two".to_string()))
            .unwrap();
        ledger.append(id, cents(100), None, None).unwrap();

        let history = ledger.history(id, HistoryRange::latest(2)).unwrap();
        assert_eq!(history[1].memo.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn test_corrupt_index_is_rebuilt() {
        let (ledger, _temp) = test_ledger(2);
        let id = Uuid::new_v4();
        for _ in 0..7 {
            ledger.append(id, cents(100), None, None).unwrap();
        }

        std::fs::write(ledger.index_path(&id), b"garbage").unwrap();
        assert_eq!(ledger.current_balance(id).unwrap(), cents(700));
        assert_eq!(ledger.history(id, HistoryRange::latest(7)).unwrap().len(), 7);
        assert_eq!(ledger.metrics.index_rebuilds.get(), 0);

        // The locked path repairs it on disk, once
        assert_eq!(ledger.balance_with(id, Repair::OnDisk).unwrap(), cents(700));
        assert_eq!(ledger.metrics.index_rebuilds.get(), 1);
        assert_eq!(ledger.history(id, HistoryRange::latest(7)).unwrap().len(), 7);
        assert_eq!(ledger.balance_with(id, Repair::OnDisk).unwrap(), cents(700));
        assert_eq!(ledger.metrics.index_rebuilds.get(), 1);
    }

    #[test]
    fn test_bad_intermediate_index_record_is_recovered() {
        let (ledger, _temp) = test_ledger(2);
        let id = Uuid::new_v4();
        for _ in 0..7 {
            ledger.append(id, cents(100), None, None).unwrap();
        }

        // Shift the seq-2 record by one byte: still ordered and in bounds
        let path = ledger.index_path(&id);
        let mut bytes = std::fs::read(&path).unwrap();
        let at = IndexRecord::SIZE + 8;
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&bytes[at..at + 8]);
        let shifted = u64::from_le_bytes(offset) + 1;
        bytes[at..at + 8].copy_from_slice(&shifted.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert_eq!(ledger.current_balance(id).unwrap(), cents(700));
        let seqs: Vec<u64> = ledger
            .history(id, HistoryRange::latest(5))
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![6, 5, 4, 3, 2]);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);

        // Locked history rewrites the index
        let history = ledger
            .history_with(id, HistoryRange::latest(5), Repair::OnDisk)
            .unwrap();
        assert_eq!(history.len(), 5);
        assert_ne!(std::fs::read(&path).unwrap(), bytes);
        assert_eq!(ledger.metrics.index_rebuilds.get(), 1);
    }

    #[test]
    fn test_unlocked_reads_never_touch_files() {
        let (ledger, _temp) = test_ledger(4);
        let id = Uuid::new_v4();
        ledger.append(id, cents(100), None, None).unwrap();
        ledger.append(id, cents(200), None, None).unwrap();

        // Looks exactly like an append still being written
        let log = ledger.log_path(&id);
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(b"{\"seq\":2,\"timest").unwrap();
        drop(file);
        std::fs::write(ledger.index_path(&id), b"garbage").unwrap();
        let log_before = std::fs::read(&log).unwrap();

        assert_eq!(ledger.current_balance(id).unwrap(), cents(300));
        assert_eq!(ledger.entry_count(id).unwrap(), 2);
        assert_eq!(ledger.last_entry(id).unwrap().unwrap().seq, 1);
        assert_eq!(ledger.history(id, HistoryRange::latest(5)).unwrap().len(), 2);

        assert_eq!(std::fs::read(&log).unwrap(), log_before);
        assert_eq!(std::fs::read(ledger.index_path(&id)).unwrap(), b"garbage");
        assert_eq!(ledger.metrics.index_rebuilds.get(), 0);
    }

    #[test]
    fn test_balance_overflow_is_refused() {
        let (ledger, _temp) = test_ledger(4);
        let id = Uuid::new_v4();
        let huge: Decimal = "50000000000000000000000000000".parse().unwrap();
        ledger.append(id, huge, None, None).unwrap();
        let log_before = std::fs::read(ledger.log_path(&id)).unwrap();

        let err = ledger.append(id, huge, None, None).unwrap_err();
        assert!(matches!(err, Error::PreconditionViolation(_)));
        assert_eq!(std::fs::read(ledger.log_path(&id)).unwrap(), log_before);
        assert_eq!(ledger.current_balance(id).unwrap(), huge);
    }

    #[test]
    fn test_missing_index_is_rebuilt() {
        let (ledger, _temp) = test_ledger(2);
        let id = Uuid::new_v4();
        for _ in 0..5 {
            ledger.append(id, cents(100), None, None).unwrap();
        }

        std::fs::remove_file(ledger.index_path(&id)).unwrap();
        assert_eq!(ledger.current_balance(id).unwrap(), cents(500));
        assert!(ledger.index_path(&id).is_file());
    }

    #[test]
    fn test_torn_append_is_truncated() {
        let (ledger, _temp) = test_ledger(4);
        let id = Uuid::new_v4();
        ledger.append(id, cents(100), None, None).unwrap();
        ledger.append(id, cents(200), None, None).unwrap();

        let mut file = OpenOptions::new().append(true).open(ledger.log_path(&id)).unwrap();
        file.write_all(b"{\"seq\":2,\"timest").unwrap();
        drop(file);

        assert_eq!(ledger.current_balance(id).unwrap(), cents(300));
        let entry = ledger.append(id, cents(50), None, None).unwrap();
        assert_eq!(entry.seq, 2);
        assert_eq!(ledger.current_balance(id).unwrap(), cents(350));
    }

    #[test]
    fn test_unreadable_log_is_corruption() {
        let (ledger, _temp) = test_ledger(4);
        let id = Uuid::new_v4();
        std::fs::write(ledger.log_path(&id), b"this is not json\n").unwrap();

        let err = ledger.current_balance(id).unwrap_err();
        assert!(matches!(err, Error::LedgerCorruption { identifier, .. } if identifier == id));
    }

    #[test]
    fn test_migrate_moves_balance() {
        let (ledger, _temp) = test_ledger(4);
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        ledger.append(old, cents(4200), None, None).unwrap();

        assert!(ledger.migrate(old, new));
        assert_eq!(ledger.current_balance(new).unwrap(), cents(4200));
        assert_eq!(ledger.current_balance(old).unwrap(), Decimal::ZERO);
        assert!(!ledger.has_ledger(&old));
    }

    #[test]
    fn test_migrate_refuses_existing_destination() {
        let (ledger, _temp) = test_ledger(4);
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        ledger.append(old, cents(100), None, None).unwrap();
        ledger.append(new, cents(900), None, None).unwrap();

        assert!(!ledger.migrate(old, new));
        assert_eq!(ledger.current_balance(old).unwrap(), cents(100));
        assert_eq!(ledger.current_balance(new).unwrap(), cents(900));
        assert!(matches!(
            ledger.try_migrate(old, new),
            Err(Error::MigrationConflict(_))
        ));
    }

    #[test]
    fn test_migrate_rebuilds_missing_source_index() {
        let (ledger, _temp) = test_ledger(2);
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        for _ in 0..3 {
            ledger.append(old, cents(100), None, None).unwrap();
        }
        std::fs::remove_file(ledger.index_path(&old)).unwrap();

        assert!(ledger.migrate(old, new));
        assert!(ledger.index_path(&new).is_file());
        assert!(!ledger.index_path(&old).exists());
        assert_eq!(ledger.current_balance(new).unwrap(), cents(300));
    }

    #[test]
    fn test_migrate_refuses_missing_source() {
        let (ledger, _temp) = test_ledger(4);
        assert!(!ledger.migrate(Uuid::new_v4(), Uuid::new_v4()));
    }

    #[test]
    fn test_known_identifiers() {
        let (ledger, _temp) = test_ledger(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        ledger.append(a, cents(1), None, None).unwrap();
        ledger.append(b, cents(1), None, None).unwrap();
        std::fs::write(ledger.users_dir.join("notes.txt"), b"hi").unwrap();
        std::fs::write(ledger.users_dir.join("bogus.log"), b"").unwrap();

        let known = ledger.known_identifiers().unwrap();
        assert_eq!(known, HashSet::from([a, b]));
    }
}
