use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::{Duration, Instant},
};

use time::OffsetDateTime;

use simplebank_core::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer,
};

// Backends in this crate implement the core traits.
pub use simplebank_core::storage::{Queries, StorageBackend, StorageError, Transaction, TransactionId};

/// How long a transaction waits for another one's row lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn check_page_bounds(limit: i64, offset: i64) -> Result<(), StorageError> {
    if limit < 0 || offset < 0 {
        return Err(StorageError::Constraint("limit and offset must not be negative".to_string()));
    }
    Ok(())
}

fn paginate<T>(items: Vec<T>, limit: i64, offset: i64) -> Result<Vec<T>, StorageError> {
    check_page_bounds(limit, offset)?;
    Ok(items
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect())
}

struct RowState {
    account: Account,
    locked_by: Option<TransactionId>,
    deleted: bool,
}

/// Committed account row plus the exclusive lock a writer holds until it
/// commits or rolls back.
struct AccountRow {
    state: Mutex<RowState>,
    released: Condvar,
}

impl AccountRow {
    fn new(account: Account) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RowState {
                account,
                locked_by: None,
                deleted: false,
            }),
            released: Condvar::new(),
        })
    }

    fn snapshot(&self) -> Option<Account> {
        let state = lock(&self.state);
        if state.deleted {
            None
        } else {
            Some(state.account.clone())
        }
    }

    /// Blocks until `tx_id` owns the row, returning the latest committed value.
    fn acquire(&self, tx_id: TransactionId, wait_until: Instant, deadline_bound: bool) -> Result<Account, StorageError> {
        let mut state = lock(&self.state);
        loop {
            if state.deleted {
                return Err(StorageError::account_not_found(state.account.id));
            }
            match state.locked_by {
                None => {
                    state.locked_by = Some(tx_id);
                    return Ok(state.account.clone());
                }
                Some(owner) if owner == tx_id => return Ok(state.account.clone()),
                Some(owner) => {
                    let now = Instant::now();
                    if now >= wait_until {
                        tracing::debug!(tx_id, owner, account_id = state.account.id, "Row lock wait expired");
                        return Err(if deadline_bound {
                            StorageError::DeadlineExceeded
                        } else {
                            StorageError::Conflict(format!("lock wait timeout on account {}", state.account.id))
                        });
                    }
                    let (guard, _) = self
                        .released
                        .wait_timeout(state, wait_until - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }

    fn release(&self, tx_id: TransactionId) {
        let mut state = lock(&self.state);
        if state.locked_by == Some(tx_id) {
            state.locked_by = None;
            self.released.notify_all();
        }
    }
}

pub struct InMemoryStorage {
    accounts: RwLock<BTreeMap<i64, Arc<AccountRow>>>,
    entries: RwLock<BTreeMap<i64, Entry>>,
    transfers: RwLock<BTreeMap<i64, Transfer>>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    tx_counter: AtomicU64,
    lock_timeout: Duration,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            entries: RwLock::new(BTreeMap::new()),
            transfers: RwLock::new(BTreeMap::new()),
            account_seq: AtomicI64::new(1),
            entry_seq: AtomicI64::new(1),
            transfer_seq: AtomicI64::new(1),
            tx_counter: AtomicU64::new(1),
            lock_timeout,
        }
    }

    fn begin(&self, deadline: Option<Instant>) -> MemoryTransaction<'_> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        MemoryTransaction {
            storage: self,
            id: tx_id,
            deadline,
            locked: Vec::new(),
            updated: BTreeMap::new(),
            created_accounts: BTreeMap::new(),
            deleted_accounts: BTreeSet::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
            finished: false,
        }
    }
}

impl StorageBackend for InMemoryStorage {
    fn begin_transaction(&self, deadline: Option<Instant>) -> Result<Box<dyn Transaction + '_>, StorageError> {
        let tx = self.begin(deadline);
        tracing::debug!(tx_id = tx.id, "Transaction started");
        Ok(Box::new(tx))
    }

    fn connection(&self) -> Result<Box<dyn Queries + '_>, StorageError> {
        Ok(Box::new(AutoCommit { storage: self }))
    }
}

/// Writes are buffered here and published to the shared tables in one step
/// at commit. Balance updates hold the account's row lock until then.
pub struct MemoryTransaction<'a> {
    storage: &'a InMemoryStorage,
    id: TransactionId,
    deadline: Option<Instant>,
    locked: Vec<Arc<AccountRow>>,
    updated: BTreeMap<i64, Account>,
    created_accounts: BTreeMap<i64, Account>,
    deleted_accounts: BTreeSet<i64>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
    finished: bool,
}

impl<'a> MemoryTransaction<'a> {
    fn visible_account(&self, id: i64) -> Result<Account, StorageError> {
        if let Some(account) = self.created_accounts.get(&id) {
            return Ok(account.clone());
        }
        if self.deleted_accounts.contains(&id) {
            return Err(StorageError::account_not_found(id));
        }
        if let Some(account) = self.updated.get(&id) {
            return Ok(account.clone());
        }
        read(&self.storage.accounts)
            .get(&id)
            .and_then(|row| row.snapshot())
            .ok_or_else(|| StorageError::account_not_found(id))
    }

    fn lock_wait_bound(&self) -> (Instant, bool) {
        let lock_deadline = Instant::now() + self.storage.lock_timeout;
        match self.deadline {
            Some(deadline) if deadline < lock_deadline => (deadline, true),
            _ => (lock_deadline, false),
        }
    }

    fn lock_row(&mut self, id: i64) -> Result<Account, StorageError> {
        let row = read(&self.storage.accounts)
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::account_not_found(id))?;
        let (wait_until, deadline_bound) = self.lock_wait_bound();
        let committed = row.acquire(self.id, wait_until, deadline_bound)?;
        if !self.locked.iter().any(|held| Arc::ptr_eq(held, &row)) {
            self.locked.push(row);
        }
        Ok(self.updated.get(&id).cloned().unwrap_or(committed))
    }

    fn referenced_by_pending(&self, account_id: i64) -> bool {
        self.entries.iter().any(|e| e.account_id == account_id)
            || self
                .transfers
                .iter()
                .any(|t| t.from_account_id == account_id || t.to_account_id == account_id)
    }

    fn publish(&mut self) -> Result<(), StorageError> {
        let storage = self.storage;
        let mut accounts = write(&storage.accounts);
        let mut entries = write(&storage.entries);
        let mut transfers = write(&storage.transfers);

        {
            let exists = |id: i64| {
                self.created_accounts.contains_key(&id)
                    || (accounts.contains_key(&id) && !self.deleted_accounts.contains(&id))
            };
            for entry in &self.entries {
                if !exists(entry.account_id) {
                    return Err(StorageError::Conflict(format!(
                        "account {} was deleted concurrently",
                        entry.account_id
                    )));
                }
            }
            for transfer in &self.transfers {
                for id in [transfer.from_account_id, transfer.to_account_id] {
                    if !exists(id) {
                        return Err(StorageError::Conflict(format!("account {} was deleted concurrently", id)));
                    }
                }
            }
            for id in &self.deleted_accounts {
                let referenced = entries.values().any(|e| e.account_id == *id)
                    || transfers
                        .values()
                        .any(|t| t.from_account_id == *id || t.to_account_id == *id);
                if referenced {
                    return Err(StorageError::Conflict(format!("account {} gained references concurrently", id)));
                }
            }
        }

        for (id, account) in std::mem::take(&mut self.created_accounts) {
            accounts.insert(id, AccountRow::new(account));
        }
        for (id, account) in std::mem::take(&mut self.updated) {
            if let Some(row) = accounts.get(&id) {
                lock(&row.state).account = account;
            }
        }
        for id in std::mem::take(&mut self.deleted_accounts) {
            if let Some(row) = accounts.remove(&id) {
                lock(&row.state).deleted = true;
            }
        }
        for entry in self.entries.drain(..) {
            entries.insert(entry.id, entry);
        }
        for transfer in self.transfers.drain(..) {
            transfers.insert(transfer.id, transfer);
        }
        Ok(())
    }

    fn release_locks(&mut self) {
        for row in self.locked.drain(..) {
            row.release(self.id);
        }
    }

    fn finish(&mut self, commit: bool) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::NoActiveTransaction);
        }
        self.finished = true;
        let result = if commit { self.publish() } else { Ok(()) };
        self.release_locks();
        result
    }
}

impl<'a> Drop for MemoryTransaction<'a> {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.release_locks();
            tracing::debug!(tx_id = self.id, "Transaction dropped without commit");
        }
    }
}

impl<'a> Queries for MemoryTransaction<'a> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StorageError> {
        let id = self.storage.account_seq.fetch_add(1, Ordering::SeqCst);
        let account = Account {
            id,
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.created_accounts.insert(id, account.clone());
        Ok(account)
    }

    fn get_account(&mut self, id: i64) -> Result<Account, StorageError> {
        self.visible_account(id)
    }

    fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        let mut visible: BTreeMap<i64, Account> = read(&self.storage.accounts)
            .iter()
            .filter(|(id, _)| !self.deleted_accounts.contains(*id))
            .filter_map(|(id, row)| row.snapshot().map(|account| (*id, account)))
            .collect();
        for (id, account) in self.updated.iter().chain(self.created_accounts.iter()) {
            visible.insert(*id, account.clone());
        }
        let matching = visible
            .into_values()
            .filter(|a| params.owner.as_deref().map_or(true, |owner| a.owner == owner))
            .collect();
        paginate(matching, params.limit, params.offset)
    }

    fn add_account_balance(&mut self, params: &AddAccountBalanceParams) -> Result<Account, StorageError> {
        let out_of_range = || StorageError::Constraint(format!("balance out of range for account {}", params.id));
        if let Some(account) = self.created_accounts.get_mut(&params.id) {
            account.balance = account.balance.checked_add(params.amount).ok_or_else(out_of_range)?;
            return Ok(account.clone());
        }
        if self.deleted_accounts.contains(&params.id) {
            return Err(StorageError::account_not_found(params.id));
        }
        let mut account = self.lock_row(params.id)?;
        account.balance = account.balance.checked_add(params.amount).ok_or_else(out_of_range)?;
        self.updated.insert(params.id, account.clone());
        Ok(account)
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StorageError> {
        let in_use = || StorageError::Constraint(format!("account {} is referenced by entries or transfers", id));
        if self.created_accounts.contains_key(&id) {
            if self.referenced_by_pending(id) {
                return Err(in_use());
            }
            self.created_accounts.remove(&id);
            return Ok(());
        }
        if self.deleted_accounts.contains(&id) {
            return Err(StorageError::account_not_found(id));
        }
        self.lock_row(id)?;
        let committed_refs = read(&self.storage.entries).values().any(|e| e.account_id == id)
            || read(&self.storage.transfers)
                .values()
                .any(|t| t.from_account_id == id || t.to_account_id == id);
        if committed_refs || self.referenced_by_pending(id) {
            return Err(in_use());
        }
        self.updated.remove(&id);
        self.deleted_accounts.insert(id);
        Ok(())
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StorageError> {
        self.visible_account(params.account_id)?;
        let entry = Entry {
            id: self.storage.entry_seq.fetch_add(1, Ordering::SeqCst),
            account_id: params.account_id,
            amount: params.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError> {
        if let Some(entry) = self.entries.iter().find(|e| e.id == id) {
            return Ok(entry.clone());
        }
        read(&self.storage.entries)
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("entry {}", id)))
    }

    fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        let mut matching: Vec<Entry> = read(&self.storage.entries)
            .values()
            .chain(self.entries.iter())
            .filter(|e| e.account_id == params.account_id)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.id);
        paginate(matching, params.limit, params.offset)
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StorageError> {
        self.visible_account(params.from_account_id)?;
        self.visible_account(params.to_account_id)?;
        let transfer = Transfer {
            id: self.storage.transfer_seq.fetch_add(1, Ordering::SeqCst),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError> {
        if let Some(transfer) = self.transfers.iter().find(|t| t.id == id) {
            return Ok(transfer.clone());
        }
        read(&self.storage.transfers)
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("transfer {}", id)))
    }

    fn list_transfers(&mut self, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        let mut matching: Vec<Transfer> = read(&self.storage.transfers)
            .values()
            .chain(self.transfers.iter())
            .filter(|t| t.from_account_id == params.from_account_id || t.to_account_id == params.to_account_id)
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.id);
        paginate(matching, params.limit, params.offset)
    }
}

impl<'a> Transaction for MemoryTransaction<'a> {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let tx_id = self.id;
        self.finish(true)?;
        tracing::debug!(tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        let tx_id = self.id;
        self.finish(false)?;
        tracing::debug!(tx_id, "Transaction rolled back");
        Ok(())
    }
}

/// Runs each primitive in its own single-statement transaction.
struct AutoCommit<'a> {
    storage: &'a InMemoryStorage,
}

impl<'a> AutoCommit<'a> {
    fn run<T>(&self, op: impl FnOnce(&mut MemoryTransaction<'a>) -> Result<T, StorageError>) -> Result<T, StorageError> {
        let mut tx = self.storage.begin(None);
        let value = op(&mut tx)?;
        tx.finish(true)?;
        Ok(value)
    }
}

impl<'a> Queries for AutoCommit<'a> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StorageError> {
        self.run(|tx| tx.create_account(params))
    }

    fn get_account(&mut self, id: i64) -> Result<Account, StorageError> {
        self.run(|tx| tx.get_account(id))
    }

    fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        self.run(|tx| tx.list_accounts(params))
    }

    fn add_account_balance(&mut self, params: &AddAccountBalanceParams) -> Result<Account, StorageError> {
        self.run(|tx| tx.add_account_balance(params))
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StorageError> {
        self.run(|tx| tx.delete_account(id))
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StorageError> {
        self.run(|tx| tx.create_entry(params))
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError> {
        self.run(|tx| tx.get_entry(id))
    }

    fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        self.run(|tx| tx.list_entries(params))
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StorageError> {
        self.run(|tx| tx.create_transfer(params))
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError> {
        self.run(|tx| tx.get_transfer(id))
    }

    fn list_transfers(&mut self, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        self.run(|tx| tx.list_transfers(params))
    }
}
