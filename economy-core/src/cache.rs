//! Account handles and the weakly-held account cache
//!
//! The cache maps identifiers to `Weak<Account>` slots. Callers get an
//! `Arc<Account>`; once every caller has dropped theirs the account is gone
//! and its slot is dead. Dead slots are purged whenever a miss takes the write
//! lock, so the map grows with active usage, not with every account ever seen.
//!
//! Lookup is double-checked: shared read lock first, then the write lock with
//! a second look before constructing anything. At most one live `Account`
//! exists per identifier, which makes its internal mutex the per-account
//! write lock for the ledger.

use crate::{
    directory::{derive_offline_identifier, validate_name, IdentityDirectory},
    error::{Error, Result},
    metrics::Metrics,
    money,
    storage::{Repair, TransactionLedger},
    types::{HistoryRange, LedgerEntry},
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

#[derive(Debug, Default)]
struct AccountState {
    /// Balance as of the last ledger read or append; `None` until loaded
    balance: Option<Decimal>,
}

/// Live handle to one player's account
#[derive(Debug)]
pub struct Account {
    identifier: Uuid,
    ledger: Arc<TransactionLedger>,
    state: Mutex<AccountState>,
}

impl Account {
    fn new(identifier: Uuid, ledger: Arc<TransactionLedger>) -> Self {
        Self {
            identifier,
            ledger,
            state: Mutex::new(AccountState::default()),
        }
    }

    /// Account identifier
    pub fn identifier(&self) -> Uuid {
        self.identifier
    }

    /// Take the account's write lock
    ///
    /// Operations spanning several accounts must lock them in identifier
    /// order.
    pub fn lock(&self) -> AccountGuard<'_> {
        AccountGuard {
            account: self,
            state: self.state.lock(),
        }
    }

    /// Current balance
    pub fn balance(&self) -> Result<Decimal> {
        self.lock().balance()
    }

    /// Whether the balance covers `amount`
    pub fn has(&self, amount: Decimal) -> Result<bool> {
        Ok(self.balance()? >= money::truncate(amount))
    }

    /// Append a raw entry
    pub fn append(
        &self,
        delta: Decimal,
        counterparty: Option<Uuid>,
        memo: Option<String>,
    ) -> Result<LedgerEntry> {
        self.lock().append(delta, counterparty, memo)
    }

    /// Admin credit
    pub fn deposit(&self, amount: Decimal, memo: Option<String>) -> Result<LedgerEntry> {
        let amount = positive(amount)?;
        self.lock().append(amount, None, memo)
    }

    /// Admin debit; refuses to go below zero
    pub fn withdraw(&self, amount: Decimal, memo: Option<String>) -> Result<LedgerEntry> {
        let amount = positive(amount)?;
        let mut guard = self.lock();
        let balance = guard.balance()?;
        if balance < amount {
            return Err(Error::InsufficientFunds(format!(
                "{} has {}, needs {}",
                self.identifier, balance, amount
            )));
        }
        guard.append(-amount, None, memo)
    }

    /// Admin set: appends whatever adjustment reaches `target`
    pub fn set_balance(&self, target: Decimal, memo: Option<String>) -> Result<LedgerEntry> {
        let mut guard = self.lock();
        let target = money::truncate(target);
        let current = guard.balance()?;
        let delta = target.checked_sub(current).ok_or_else(|| {
            Error::PreconditionViolation(format!(
                "adjustment from {} to {} is out of range",
                current, target
            ))
        })?;
        guard.append(delta, None, memo)
    }

    /// Entries newest-first
    pub fn history(&self, range: HistoryRange) -> Result<Vec<LedgerEntry>> {
        let _guard = self.lock();
        self.ledger
            .history_with(self.identifier, range, Repair::OnDisk)
    }
}

/// Exclusive access to one account
#[derive(Debug)]
pub struct AccountGuard<'a> {
    account: &'a Account,
    state: MutexGuard<'a, AccountState>,
}

impl AccountGuard<'_> {
    /// Account identifier
    pub fn identifier(&self) -> Uuid {
        self.account.identifier
    }

    /// Current balance, loading it from the ledger on first use
    pub fn balance(&mut self) -> Result<Decimal> {
        if let Some(balance) = self.state.balance {
            return Ok(balance);
        }
        let balance = self
            .account
            .ledger
            .balance_with(self.account.identifier, Repair::OnDisk)?;
        self.state.balance = Some(balance);
        Ok(balance)
    }

    /// Append an entry and update the cached balance
    pub fn append(
        &mut self,
        delta: Decimal,
        counterparty: Option<Uuid>,
        memo: Option<String>,
    ) -> Result<LedgerEntry> {
        match self
            .account
            .ledger
            .append(self.account.identifier, delta, counterparty, memo)
        {
            Ok(entry) => {
                self.state.balance = Some(entry.balance);
                Ok(entry)
            }
            Err(e) => {
                self.state.balance = None;
                Err(e)
            }
        }
    }

    /// Forget the cached balance (after the files moved underneath)
    pub(crate) fn invalidate(&mut self) {
        self.state.balance = None;
    }
}

fn positive(amount: Decimal) -> Result<Decimal> {
    let amount = money::truncate(amount);
    if amount <= Decimal::ZERO {
        return Err(Error::PreconditionViolation(format!(
            "amount {} must be positive",
            amount
        )));
    }
    Ok(amount)
}

/// Identifier → account cache
#[derive(Debug)]
pub struct AccountCache {
    accounts: RwLock<HashMap<Uuid, Weak<Account>>>,
    ledger: Arc<TransactionLedger>,
    directory: Arc<IdentityDirectory>,
    metrics: Arc<Metrics>,
}

impl AccountCache {
    /// Create an empty cache over the given ledger and directory
    pub fn new(
        ledger: Arc<TransactionLedger>,
        directory: Arc<IdentityDirectory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            ledger,
            directory,
            metrics,
        }
    }

    /// Live account for `identifier`, created on first use
    pub fn get(&self, identifier: Uuid) -> Result<Arc<Account>> {
        if identifier.is_nil() {
            return Err(Error::PreconditionViolation(
                "identifier must not be nil".to_string(),
            ));
        }

        let cached = self.accounts.read().get(&identifier).and_then(Weak::upgrade);
        if let Some(account) = cached {
            self.metrics.cache_hits.inc();
            return Ok(account);
        }

        let mut accounts = self.accounts.write();
        // Another caller may have created it while we waited
        if let Some(account) = accounts.get(&identifier).and_then(Weak::upgrade) {
            self.metrics.cache_hits.inc();
            return Ok(account);
        }

        let purged = purge_dead(&mut accounts);
        if purged > 0 {
            tracing::debug!(purged, "Purged reclaimed account slots");
        }

        let account = Arc::new(Account::new(identifier, self.ledger.clone()));
        accounts.insert(identifier, Arc::downgrade(&account));

        self.metrics.cache_misses.inc();
        self.metrics.cache_entries.set(accounts.len() as i64);
        Ok(account)
    }

    /// Live account for a player name
    ///
    /// An unknown name is given its offline identifier, which is recorded in
    /// the directory before the account is returned.
    pub fn get_by_name(&self, name: &str) -> Result<Arc<Account>> {
        let name = validate_name(name)?;
        let identifier = match self.directory.resolve(name) {
            Some(identifier) => identifier,
            None => {
                let identifier = derive_offline_identifier(name);
                self.directory.record_identity(identifier, name)?;
                tracing::info!(identifier = %identifier, name, "Assigned offline identifier");
                identifier
            }
        };
        self.get(identifier)
    }

    /// Slots held, including reclaimed ones not yet purged
    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    /// True if no slots are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accounts currently referenced by some caller
    pub fn live_count(&self) -> usize {
        self.accounts
            .read()
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    /// Drop every reclaimed slot now; returns how many went
    pub fn sweep(&self) -> usize {
        let mut accounts = self.accounts.write();
        let purged = purge_dead(&mut accounts);
        self.metrics.cache_entries.set(accounts.len() as i64);
        purged
    }
}

fn purge_dead(accounts: &mut HashMap<Uuid, Weak<Account>>) -> usize {
    let before = accounts.len();
    accounts.retain(|_, slot| slot.strong_count() > 0);
    before - accounts.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn test_cache() -> (AccountCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.ledger.sync_on_append = false;

        let metrics = Arc::new(Metrics::new().unwrap());
        let ledger = Arc::new(TransactionLedger::open(&config, metrics.clone()).unwrap());
        let directory = Arc::new(IdentityDirectory::open(&config, metrics.clone()).unwrap());
        (AccountCache::new(ledger, directory, metrics), temp_dir)
    }

    #[test]
    fn test_same_handle_while_alive() {
        let (cache, _temp) = test_cache();
        let id = Uuid::new_v4();

        let a = cache.get(id).unwrap();
        let b = cache.get(id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.metrics.cache_misses.get(), 1);
        assert_eq!(cache.metrics.cache_hits.get(), 1);
    }

    #[test]
    fn test_nil_identifier_rejected() {
        let (cache, _temp) = test_cache();
        assert!(matches!(
            cache.get(Uuid::nil()),
            Err(Error::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_dropped_accounts_are_reclaimed_and_purged() {
        let (cache, _temp) = test_cache();

        for _ in 0..10 {
            let account = cache.get(Uuid::new_v4()).unwrap();
            drop(account);
        }
        assert_eq!(cache.live_count(), 0);

        // Next miss purges the dead slots before inserting
        let keep = cache.get(Uuid::new_v4()).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.live_count(), 1);
        drop(keep);
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_recreated_account_sees_ledger_state() {
        let (cache, _temp) = test_cache();
        let id = Uuid::new_v4();

        cache.get(id).unwrap().deposit(Decimal::from(25), None).unwrap();
        cache.sweep();

        let account = cache.get(id).unwrap();
        assert_eq!(account.balance().unwrap(), Decimal::from(25));
    }

    #[test]
    fn test_concurrent_first_get_shares_account() {
        let (cache, _temp) = test_cache();
        let cache = Arc::new(cache);
        let id = Uuid::new_v4();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.get(id).unwrap()
                })
            })
            .collect();
        let accounts: Vec<Arc<Account>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(accounts.iter().all(|a| Arc::ptr_eq(a, &accounts[0])));
        assert_eq!(cache.metrics.cache_misses.get(), 1);
    }

    #[test]
    fn test_concurrent_deposits_are_serialized() {
        let (cache, _temp) = test_cache();
        let cache = Arc::new(cache);
        let id = Uuid::new_v4();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let account = cache.get(id).unwrap();
                        account.deposit(Decimal::new(101, 2), None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let account = cache.get(id).unwrap();
        assert_eq!(account.balance().unwrap(), Decimal::new(10100, 2));
        assert_eq!(account.history(HistoryRange::latest(1000)).unwrap().len(), 100);
    }

    #[test]
    fn test_get_by_name_assigns_offline_identifier() {
        let (cache, _temp) = test_cache();

        let account = cache.get_by_name("Steve").unwrap();
        let expected = derive_offline_identifier("steve");
        assert_eq!(account.identifier(), expected);
        assert_eq!(cache.directory.resolve("STEVE"), Some(expected));

        let again = cache.get_by_name("steve").unwrap();
        assert!(Arc::ptr_eq(&account, &again));
    }

    #[test]
    fn test_get_by_name_prefers_recorded_identifier() {
        let (cache, _temp) = test_cache();
        let id = Uuid::new_v4();
        cache.directory.record_identity(id, "Alex").unwrap();

        assert_eq!(cache.get_by_name("alex").unwrap().identifier(), id);
        assert!(matches!(
            cache.get_by_name(""),
            Err(Error::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_withdraw_and_set_balance() {
        let (cache, _temp) = test_cache();
        let account = cache.get(Uuid::new_v4()).unwrap();

        account.deposit(Decimal::from(10), Some("grant".to_string())).unwrap();
        assert!(matches!(
            account.withdraw(Decimal::from(11), None),
            Err(Error::InsufficientFunds(_))
        ));
        account.withdraw(Decimal::new(250, 2), None).unwrap();
        assert_eq!(account.balance().unwrap(), Decimal::new(750, 2));
        assert!(account.has(Decimal::new(750, 2)).unwrap());

        let entry = account.set_balance(Decimal::new(100999, 3), None).unwrap();
        assert_eq!(entry.balance, Decimal::new(10099, 2));
        assert_eq!(entry.amount, Decimal::new(9349, 2));

        assert!(matches!(
            account.deposit(Decimal::new(1, 3), None),
            Err(Error::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_out_of_range_adjustments_are_refused() {
        let (cache, _temp) = test_cache();
        let account = cache.get(Uuid::new_v4()).unwrap();
        let huge = money::parse_amount("50000000000000000000000000000", &Default::default())
            .unwrap();

        account.deposit(huge, None).unwrap();
        assert!(matches!(
            account.deposit(huge, None),
            Err(Error::PreconditionViolation(_))
        ));
        assert!(matches!(
            account.set_balance(-huge, None),
            Err(Error::PreconditionViolation(_))
        ));
        assert_eq!(account.balance().unwrap(), huge);
        assert_eq!(account.history(HistoryRange::latest(10)).unwrap().len(), 1);
    }
}
