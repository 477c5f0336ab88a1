//! Persistent name ↔ identifier directory
//!
//! Loaded fully at startup from `names.dat` and flushed on every change.
//! Writes are serialized and go to a temp file that is renamed over the old
//! one, so a crash never leaves a half-written directory behind. Readers work
//! from memory and never wait on disk.
//!
//! Name lookups are case-insensitive. When a name has been used by more than
//! one identifier, the most recently recorded one wins.

use crate::{
    error::{Error, IoResultExt, Result},
    metrics::Metrics,
    types::parse_identifier,
    Config,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Namespace for offline identifiers
const OFFLINE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_52d8_8a3e_4b0f_9d27_5e4a_c1b3_7f60);

const FORMAT_VERSION: u32 = 1;

/// Deterministic identifier for a name with no authoritative identifier
///
/// Depends only on the lowercased name, so `Steve` and `steve` map to the
/// same account on every run.
pub fn derive_offline_identifier(name: &str) -> Uuid {
    let key = format!("OfflinePlayer:{}", name.trim().to_lowercase());
    Uuid::new_v5(&OFFLINE_NAMESPACE, key.as_bytes())
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    identifier: Uuid,
    name: String,
    revision: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDirectory {
    version: u32,
    records: Vec<StoredRecord>,
}

#[derive(Debug, Clone)]
struct NameEntry {
    name: String,
    revision: u64,
}

#[derive(Debug, Default)]
struct DirectoryState {
    by_id: HashMap<Uuid, NameEntry>,
    by_name: HashMap<String, Uuid>,
    revision: u64,
}

impl DirectoryState {
    /// Apply an upsert; returns false when nothing changed
    fn upsert(&mut self, identifier: Uuid, name: &str) -> bool {
        let key = name.to_lowercase();
        let unchanged = self
            .by_id
            .get(&identifier)
            .is_some_and(|entry| entry.name == name)
            && self.by_name.get(&key) == Some(&identifier);
        if unchanged {
            return false;
        }

        self.revision += 1;
        let mut vacated = None;
        if let Some(previous) = self.by_id.get(&identifier) {
            let previous_key = previous.name.to_lowercase();
            if previous_key != key && self.by_name.get(&previous_key) == Some(&identifier) {
                self.by_name.remove(&previous_key);
                vacated = Some(previous_key);
            }
        }
        self.by_id.insert(
            identifier,
            NameEntry {
                name: name.to_string(),
                revision: self.revision,
            },
        );
        self.by_name.insert(key, identifier);

        // A vacated name falls back to its most recent remaining holder
        if let Some(vacated) = vacated {
            let successor = self
                .by_id
                .iter()
                .filter(|(_, entry)| entry.name.to_lowercase() == vacated)
                .max_by_key(|(_, entry)| entry.revision)
                .map(|(holder, _)| *holder);
            if let Some(successor) = successor {
                self.by_name.insert(vacated, successor);
            }
        }
        true
    }

    fn to_stored(&self) -> StoredDirectory {
        let mut records: Vec<StoredRecord> = self
            .by_id
            .iter()
            .map(|(identifier, entry)| StoredRecord {
                identifier: *identifier,
                name: entry.name.clone(),
                revision: entry.revision,
            })
            .collect();
        records.sort_by_key(|record| record.revision);
        StoredDirectory {
            version: FORMAT_VERSION,
            records,
        }
    }

    fn from_stored(mut stored: StoredDirectory) -> Self {
        stored.records.sort_by_key(|record| record.revision);
        let mut state = DirectoryState::default();
        for record in stored.records {
            state.upsert(record.identifier, &record.name);
        }
        state
    }
}

/// Identity directory
#[derive(Debug)]
pub struct IdentityDirectory {
    path: PathBuf,
    state: RwLock<DirectoryState>,
    /// Serializes flushes so they land in mutation order
    write_lock: Mutex<()>,
    metrics: Arc<Metrics>,
}

impl IdentityDirectory {
    /// Load the directory, importing `import-uuids.txt` on first startup
    pub fn open(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).at(&config.data_dir)?;
        let path = config.names_path();

        let (state, first_start) = match std::fs::read(&path) {
            Ok(bytes) => {
                let stored: StoredDirectory = bincode::deserialize(&bytes)?;
                if stored.version != FORMAT_VERSION {
                    return Err(Error::Config(format!(
                        "{} has unsupported format version {}",
                        path.display(),
                        stored.version
                    )));
                }
                (DirectoryState::from_stored(stored), false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (DirectoryState::default(), true)
            }
            Err(e) => return Err(Error::storage(path, e)),
        };

        let directory = Self {
            path,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
            metrics,
        };

        if first_start {
            let import_path = config.import_path();
            if import_path.is_file() {
                directory.import(&import_path)?;
            }
        }

        tracing::info!(
            path = ?directory.path,
            identities = directory.len(),
            "Opened identity directory"
        );
        Ok(directory)
    }

    /// Identifier most recently recorded for `name` (case-insensitive)
    pub fn resolve(&self, name: &str) -> Option<Uuid> {
        self.state
            .read()
            .by_name
            .get(&name.trim().to_lowercase())
            .copied()
    }

    /// Current name of an identifier
    pub fn name_of(&self, identifier: &Uuid) -> Option<String> {
        self.state
            .read()
            .by_id
            .get(identifier)
            .map(|entry| entry.name.clone())
    }

    /// Number of identifiers with a recorded name
    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    /// True if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that `identifier` currently goes by `name`
    ///
    /// Idempotent; returns `true` if the directory changed (and was flushed).
    pub fn record_identity(&self, identifier: Uuid, name: &str) -> Result<bool> {
        let name = validate_name(name)?;
        if identifier.is_nil() {
            return Err(Error::PreconditionViolation(
                "identifier must not be nil".to_string(),
            ));
        }

        let _flush = self.write_lock.lock();
        let stored = {
            let mut state = self.state.write();
            if !state.upsert(identifier, name) {
                return Ok(false);
            }
            state.to_stored()
        };

        self.persist(&stored)?;
        tracing::debug!(identifier = %identifier, name, "Identity recorded");
        Ok(true)
    }

    /// Seed the directory from `identifier name` lines
    ///
    /// Malformed lines are skipped. Returns the number of pairs applied.
    pub fn import(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path).at(path)?;

        let mut pairs = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let parsed = match (parts.next(), parts.next(), parts.next()) {
                (Some(id), Some(name), None) => parse_identifier(id)
                    .filter(|id| !id.is_nil())
                    .map(|id| (id, name.to_string())),
                _ => None,
            };
            match parsed {
                Some(pair) => pairs.push(pair),
                None => tracing::warn!(
                    path = ?path,
                    line = line_no + 1,
                    "Skipping malformed identity import line"
                ),
            }
        }

        let _flush = self.write_lock.lock();
        let stored = {
            let mut state = self.state.write();
            for (identifier, name) in &pairs {
                state.upsert(*identifier, name);
            }
            state.to_stored()
        };
        self.persist(&stored)?;

        tracing::info!(path = ?path, imported = pairs.len(), "Imported identities");
        Ok(pairs.len())
    }

    fn persist(&self, stored: &StoredDirectory) -> Result<()> {
        let bytes = bincode::serialize(stored)?;
        let temp_path = self.path.with_extension("dat.tmp");

        {
            let mut file = std::fs::File::create(&temp_path).at(&temp_path)?;
            file.write_all(&bytes).at(&temp_path)?;
            file.sync_all().at(&temp_path)?;
        }
        std::fs::rename(&temp_path, &self.path).at(&self.path)?;

        self.metrics.directory_writes.inc();
        Ok(())
    }
}

/// Trimmed name, or a precondition violation for blank input
pub(crate) fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::PreconditionViolation(
            "name must not be blank".to_string(),
        ));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(Error::PreconditionViolation(format!(
            "name '{}' must not contain whitespace",
            trimmed
        )));
    }
    Ok(trimmed)
}
