//! Error types for the economy core

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Result type for economy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Economy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input passed to an API (nil identifier, blank name, ...)
    #[error("Precondition violation: {0}")]
    PreconditionViolation(String),

    /// Name has no resolvable identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Migration source missing or destination already present
    #[error("Migration conflict: {0}")]
    MigrationConflict(String),

    /// Payer balance too low for a transfer or withdrawal
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Ledger log or index for one account is unreadable or inconsistent
    #[error("Ledger corruption for {identifier}: {reason}")]
    LedgerCorruption {
        /// Account whose ledger is damaged
        identifier: Uuid,
        /// What was wrong with it
        reason: String,
    },

    /// Filesystem failure, tagged with the path involved
    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        /// File or directory being accessed
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Directory encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Attach a path to an IO error
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Storage {
            path: path.into(),
            source,
        }
    }

    /// Ledger corruption for one account
    pub fn corruption(identifier: Uuid, reason: impl Into<String>) -> Self {
        Error::LedgerCorruption {
            identifier,
            reason: reason.into(),
        }
    }
}

/// Extension for tagging IO results with the path they touched
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| Error::storage(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_names_path() {
        let err = Error::storage(
            "/tmp/users/abc.log",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/users/abc.log"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_corruption_message() {
        let id = Uuid::nil();
        let err = Error::corruption(id, "bad line 3");
        assert!(err.to_string().contains("bad line 3"));
    }
}
