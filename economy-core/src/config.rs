//! Configuration for the economy core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Economy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory (ledgers under `users/`, directory in `names.dat`)
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Ledger configuration
    pub ledger: LedgerConfig,

    /// Leaderboard configuration
    pub leaderboard: LeaderboardConfig,

    /// Currency display configuration
    pub currency: CurrencyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/economy"),
            service_name: "economy-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            ledger: LedgerConfig::default(),
            leaderboard: LeaderboardConfig::default(),
            currency: CurrencyConfig::default(),
        }
    }
}

/// Ledger storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Write an index record every N entries
    pub index_stride: u64,

    /// fsync the log after each append
    pub sync_on_append: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            index_stride: 16,
            sync_on_append: true,
        }
    }
}

/// Leaderboard engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardConfig {
    /// Seconds between recomputations
    pub interval_secs: u64,

    /// Run the background engine
    pub enabled: bool,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300, // 5 minutes
            enabled: true,
        }
    }
}

/// Currency display configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencyConfig {
    /// Placed before the number
    pub prefix: String,

    /// Placed after the number
    pub suffix: String,
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self {
            prefix: "$".to_string(),
            suffix: String::new(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| crate::Error::storage(path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("ECONOMY_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(secs) = std::env::var("ECONOMY_LEADERBOARD_INTERVAL_SECS") {
            config.leaderboard.interval_secs = secs.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid leaderboard interval '{}': {}", secs, e))
            })?;
        }

        if let Ok(prefix) = std::env::var("ECONOMY_CURRENCY_PREFIX") {
            config.currency.prefix = prefix;
        }

        if let Ok(suffix) = std::env::var("ECONOMY_CURRENCY_SUFFIX") {
            config.currency.suffix = suffix;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.ledger.index_stride == 0 {
            return Err(crate::Error::Config(
                "ledger.index_stride must be greater than zero".to_string(),
            ));
        }
        if self.leaderboard.interval_secs == 0 {
            return Err(crate::Error::Config(
                "leaderboard.interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding per-account ledger files
    pub fn users_dir(&self) -> PathBuf {
        self.data_dir.join("users")
    }

    /// Persisted identity directory
    pub fn names_path(&self) -> PathBuf {
        self.data_dir.join("names.dat")
    }

    /// One-time identity import file
    pub fn import_path(&self) -> PathBuf {
        self.data_dir.join("import-uuids.txt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "economy-core");
        assert_eq!(config.ledger.index_stride, 16);
        assert_eq!(config.currency.prefix, "$");
        assert!(config.leaderboard.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/srv/economy"

            [currency]
            prefix = ""
            suffix = " coins"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/economy"));
        assert_eq!(config.currency.suffix, " coins");
        assert_eq!(config.leaderboard.interval_secs, 300);
        assert_eq!(config.users_dir(), PathBuf::from("/srv/economy/users"));
    }

    #[test]
    fn test_zero_stride_rejected() {
        let mut config = Config::default();
        config.ledger.index_stride = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("economy.toml");
        std::fs::write(&path, "[leaderboard]\ninterval_secs = 60\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.leaderboard.interval_secs, 60);
    }
}
