//! Economy facade
//!
//! Owns the ledger, identity directory, account cache and leaderboard engine,
//! and exposes the operations the command and event layers call.
//!
//! # Example
//!
//! ```no_run
//! use economy_core::{Config, Economy};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> economy_core::Result<()> {
//!     let economy = Economy::open(Config::default())?;
//!     economy.start_leaderboard()?;
//!
//!     let alice = economy.account_by_name("alice")?;
//!     alice.deposit(Decimal::new(15000, 2), None)?;
//!     println!("{}", economy.format(alice.balance()?));
//!
//!     economy.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::{
    cache::{Account, AccountCache, AccountGuard},
    directory::{derive_offline_identifier, validate_name, IdentityDirectory},
    leaderboard::{LeaderboardEngine, LeaderboardSnapshot},
    metrics::Metrics,
    money,
    storage::TransactionLedger,
    types::LedgerEntry,
    Config, Error, Result,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Main economy interface
#[derive(Debug)]
pub struct Economy {
    config: Config,
    ledger: Arc<TransactionLedger>,
    directory: Arc<IdentityDirectory>,
    cache: Arc<AccountCache>,
    leaderboard: Arc<LeaderboardEngine>,
    engine_task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl Economy {
    /// Open the economy rooted at `config.data_dir`
    ///
    /// Loads the identity directory (importing on first start) and prepares
    /// the ledger directory. The leaderboard engine is created idle; see
    /// [`start_leaderboard`](Self::start_leaderboard).
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(
            Metrics::new().map_err(|e| Error::Config(format!("Metrics registry: {}", e)))?,
        );
        let ledger = Arc::new(TransactionLedger::open(&config, metrics.clone())?);
        let directory = Arc::new(IdentityDirectory::open(&config, metrics.clone())?);
        let cache = Arc::new(AccountCache::new(
            ledger.clone(),
            directory.clone(),
            metrics.clone(),
        ));
        let leaderboard = Arc::new(LeaderboardEngine::new(
            cache.clone(),
            ledger.clone(),
            Duration::from_secs(config.leaderboard.interval_secs),
            metrics.clone(),
        ));

        tracing::info!(
            data_dir = ?config.data_dir,
            identities = directory.len(),
            "Economy opened"
        );

        Ok(Self {
            config,
            ledger,
            directory,
            cache,
            leaderboard,
            engine_task: Mutex::new(None),
            metrics,
        })
    }

    // Accounts

    /// Account for an identifier
    pub fn account(&self, identifier: Uuid) -> Result<Arc<Account>> {
        self.cache.get(identifier)
    }

    /// Account for a player name, assigning an offline identifier if unknown
    pub fn account_by_name(&self, name: &str) -> Result<Arc<Account>> {
        self.cache.get_by_name(name)
    }

    /// Identifier a name currently resolves to
    pub fn identifier_of(&self, name: &str) -> Result<Uuid> {
        let name = validate_name(name)?;
        self.directory
            .resolve(name)
            .ok_or_else(|| Error::NotFound(format!("no identifier for '{}'", name)))
    }

    /// Last recorded name of an identifier
    pub fn name_of(&self, identifier: &Uuid) -> Option<String> {
        self.directory.name_of(identifier)
    }

    /// Every identifier with a ledger on disk
    pub fn known_identifiers(&self) -> Result<HashSet<Uuid>> {
        self.ledger.known_identifiers()
    }

    // Identity

    /// Record a login and reconcile an offline ledger
    ///
    /// If `name` was last seen under its offline identifier and only that
    /// identifier has a ledger, the ledger moves to `identifier`. Returns
    /// whether a migration happened.
    pub fn register_login(&self, identifier: Uuid, name: &str) -> Result<bool> {
        let name = validate_name(name)?;
        let previous = self.directory.resolve(name);
        self.directory.record_identity(identifier, name)?;

        let offline = derive_offline_identifier(name);
        if offline == identifier || previous != Some(offline) {
            return Ok(false);
        }
        if !self.ledger.has_ledger(&offline) || self.ledger.has_ledger(&identifier) {
            return Ok(false);
        }

        let migrated = self.migrate(offline, identifier);
        if migrated {
            tracing::info!(
                name,
                offline = %offline,
                identifier = %identifier,
                "Offline ledger reconciled on login"
            );
        }
        Ok(migrated)
    }

    /// Move a ledger from `old` to `new`
    ///
    /// Returns `false` and changes nothing if `old` has no ledger or `new`
    /// already has one.
    pub fn migrate(&self, old: Uuid, new: Uuid) -> bool {
        match self.try_migrate(old, new) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(old = %old, new = %new, error = %e, "Migration refused");
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
        let old_account = self.cache.get(old)?;
        let new_account = self.cache.get(new)?;

        let (mut old_guard, mut new_guard) = lock_pair(&old_account, &new_account);
        self.ledger.try_migrate(old, new)?;
        old_guard.invalidate();
        new_guard.invalidate();
        Ok(())
    }

    // Money

    /// Move `amount` from one account to another
    ///
    /// Returns the payer's debit entry and the payee's credit entry.
    pub fn transfer(
        &self,
        from: Uuid,
        to: Uuid,
        amount: Decimal,
        memo: Option<String>,
    ) -> Result<(LedgerEntry, LedgerEntry)> {
        if from == to {
            return Err(Error::PreconditionViolation(
                "cannot transfer to the same account".to_string(),
            ));
        }
        let amount = money::truncate(amount);
        if amount <= Decimal::ZERO {
            return Err(Error::PreconditionViolation(format!(
                "transfer amount {} must be positive",
                amount
            )));
        }

        let payer = self.cache.get(from)?;
        let payee = self.cache.get(to)?;
        let (mut payer_guard, mut payee_guard) = lock_pair(&payer, &payee);

        let available = payer_guard.balance()?;
        if available < amount {
            return Err(Error::InsufficientFunds(format!(
                "{} has {}, needs {}",
                from, available, amount
            )));
        }
        let received = payee_guard.balance()?;
        if received.checked_add(amount).is_none() {
            return Err(Error::PreconditionViolation(format!(
                "balance of {} cannot hold another {}",
                to, amount
            )));
        }

        let debit = payer_guard.append(-amount, Some(to), memo.clone())?;
        let credit = match payee_guard.append(amount, Some(from), memo) {
            Ok(credit) => credit,
            Err(e) => {
                // Refund the payer so the debit does not stand alone
                if let Err(refund) =
                    payer_guard.append(amount, None, Some("transfer reversal".to_string()))
                {
                    tracing::error!(
                        from = %from,
                        to = %to,
                        error = %refund,
                        "Failed to reverse debit after failed credit"
                    );
                }
                return Err(e);
            }
        };

        tracing::debug!(from = %from, to = %to, amount = %amount, "Transfer completed");
        Ok((debit, credit))
    }

    /// Display an amount with the configured currency
    pub fn format(&self, amount: Decimal) -> String {
        money::format(amount, &self.config.currency)
    }

    /// Parse user-entered amount text
    pub fn parse_amount(&self, text: &str) -> Result<Decimal> {
        money::parse_amount(text, &self.config.currency)
    }

    // Leaderboard

    /// Latest published leaderboard
    pub fn leaderboard(&self) -> Arc<LeaderboardSnapshot> {
        self.leaderboard.snapshot()
    }

    /// The leaderboard engine
    pub fn leaderboard_engine(&self) -> &Arc<LeaderboardEngine> {
        &self.leaderboard
    }

    /// Spawn the periodic leaderboard task (no-op when disabled)
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_leaderboard(&self) -> Result<()> {
        if !self.config.leaderboard.enabled {
            tracing::info!("Leaderboard disabled by configuration");
            return Ok(());
        }
        let handle = self.leaderboard.spawn()?;
        *self.engine_task.lock() = Some(handle);
        Ok(())
    }

    /// Stop the leaderboard engine and wait for its task to finish
    pub async fn shutdown(&self) {
        self.leaderboard.stop();
        let handle = self.engine_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Leaderboard task ended abnormally");
            }
        }
        tracing::info!("Economy shut down");
    }

    // Accessors

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ledger storage
    pub fn ledger(&self) -> &Arc<TransactionLedger> {
        &self.ledger
    }

    /// Identity directory
    pub fn directory(&self) -> &Arc<IdentityDirectory> {
        &self.directory
    }

    /// Account cache
    pub fn cache(&self) -> &Arc<AccountCache> {
        &self.cache
    }

    /// Metrics
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Lock two distinct accounts in identifier order; guards return as `(a, b)`
fn lock_pair<'a>(a: &'a Account, b: &'a Account) -> (AccountGuard<'a>, AccountGuard<'a>) {
    if a.identifier() < b.identifier() {
        let first = a.lock();
        let second = b.lock();
        (first, second)
    } else {
        let first = b.lock();
        let second = a.lock();
        (second, first)
    }
}
