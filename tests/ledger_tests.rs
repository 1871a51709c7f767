use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};

use simplebank::postgres_storage::PostgresStorage;
use simplebank::sqlite_storage::SqliteStorage;
use simplebank::storage::{InMemoryStorage, StorageError};
use simplebank::{
    Account, CreateAccountParams, CreateEntryParams, CreateTransferParams, ErrorKind, LedgerError,
    LedgerPolicy, ListAccountsParams, ListEntriesParams, ListTransfersParams, OverdraftPolicy, Store,
    TransferTxParams, TxContext,
};

const POSTGRES_URL_VAR: &str = "SIMPLEBANK_TEST_POSTGRES_URL";

fn memory_store() -> Store {
    Store::new(Arc::new(InMemoryStorage::new()))
}

fn sqlite_store() -> Store {
    Store::new(Arc::new(SqliteStorage::new(":memory:").unwrap()))
}

/// One pool shared by every test, so schema setup runs once.
fn postgres_store() -> Option<Store> {
    static STORE: OnceLock<Option<Store>> = OnceLock::new();
    STORE
        .get_or_init(|| {
            let url = std::env::var(POSTGRES_URL_VAR).ok()?;
            Some(Store::new(Arc::new(PostgresStorage::new(&url).unwrap())))
        })
        .clone()
}

/// Runs each scenario against every backend. Postgres runs only when a
/// database is configured.
macro_rules! ledger_suite {
    ($($test:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[test]
                fn [<memory_ $test>]() {
                    $test(memory_store());
                }

                #[test]
                fn [<sqlite_ $test>]() {
                    $test(sqlite_store());
                }

                #[test]
                fn [<postgres_ $test>]() {
                    match postgres_store() {
                        Some(store) => $test(store),
                        None => eprintln!("skipping: {} not set", POSTGRES_URL_VAR),
                    }
                }
            )*
        }
    };
}

ledger_suite!(
    create_and_get_account,
    list_accounts_by_owner,
    list_entries_paginates,
    list_transfers_paginates,
    transfer_moves_money,
    transfer_to_self_is_rejected,
    transfer_rejects_non_positive_amount,
    transfer_to_missing_account,
    transfer_from_missing_account,
    failed_unit_of_work_leaves_no_trace,
    concurrent_transfers_conserve_money,
    opposing_transfers_do_not_deadlock,
    overdraft_reject_policy,
    delete_account_guards_references,
    missing_records_are_not_found,
    balance_overflow_is_rejected,
);

fn unique_owner() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "owner-{}-{}-{}",
        std::process::id(),
        time::OffsetDateTime::now_utc().unix_timestamp_nanos(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

fn open_account(store: &Store, balance: i64) -> Account {
    store
        .exec_tx(&TxContext::new(), |q| {
            Ok(q.create_account(&CreateAccountParams {
                owner: unique_owner(),
                currency: "USD".to_string(),
                balance,
            })?)
        })
        .expect("Failed to open account")
}

fn balance(store: &Store, id: i64) -> i64 {
    store.get_account(id).expect("Failed to read account").balance
}

fn entries_of(store: &Store, account_id: i64) -> Vec<simplebank::Entry> {
    store
        .list_entries(&ListEntriesParams { account_id, limit: 1000, offset: 0 })
        .unwrap()
}

fn transfers_touching(store: &Store, account_id: i64) -> Vec<simplebank::Transfer> {
    store
        .list_transfers(&ListTransfersParams {
            from_account_id: account_id,
            to_account_id: account_id,
            limit: 1000,
            offset: 0,
        })
        .unwrap()
}

fn transfer(store: &Store, from: i64, to: i64, amount: i64) -> Result<simplebank::TransferTxResult, LedgerError> {
    store.transfer_tx(
        &TxContext::new(),
        TransferTxParams {
            from_account_id: from,
            to_account_id: to,
            amount,
        },
    )
}

fn create_and_get_account(store: Store) {
    let owner = unique_owner();
    let account = store
        .create_account(&CreateAccountParams {
            owner: owner.clone(),
            currency: "EUR".to_string(),
            balance: 0,
        })
        .unwrap();
    assert!(account.id > 0);
    assert_eq!(account.owner, owner);
    assert_eq!(account.balance, 0);

    let fetched = store.get_account(account.id).unwrap();
    assert_eq!(fetched.id, account.id);
    assert_eq!(fetched.owner, account.owner);
    assert_eq!(fetched.currency, "EUR");
    assert_eq!(fetched.created_at.unix_timestamp(), account.created_at.unix_timestamp());
}

fn list_accounts_by_owner(store: Store) {
    let owner = unique_owner();
    let mut created = Vec::new();
    for _ in 0..4 {
        created.push(
            store
                .create_account(&CreateAccountParams {
                    owner: owner.clone(),
                    currency: "CAD".to_string(),
                    balance: 0,
                })
                .unwrap()
                .id,
        );
    }
    open_account(&store, 0);

    let page = store
        .list_accounts(&ListAccountsParams { owner: Some(owner.clone()), limit: 2, offset: 1 })
        .unwrap();
    let ids: Vec<i64> = page.iter().map(|a| a.id).collect();
    assert_eq!(ids, created[1..3].to_vec());
    assert!(page.iter().all(|a| a.owner == owner));
}

fn list_entries_paginates(store: Store) {
    let account = open_account(&store, 1000);
    store
        .exec_tx(&TxContext::new(), |q| {
            for i in 0..10 {
                q.create_entry(&CreateEntryParams { account_id: account.id, amount: 100 + i })?;
            }
            Ok(())
        })
        .unwrap();

    let all = entries_of(&store, account.id);
    assert_eq!(all.len(), 10);
    assert!(all.windows(2).all(|w| w[0].id < w[1].id), "Entries must be in insertion order");

    let page = store
        .list_entries(&ListEntriesParams { account_id: account.id, limit: 5, offset: 5 })
        .unwrap();
    assert_eq!(page.len(), 5);
    assert_eq!(page, all[5..].to_vec());
    assert_eq!(page[0].amount, 105);
}

fn list_transfers_paginates(store: Store) {
    let a = open_account(&store, 1000);
    let b = open_account(&store, 1000);
    for _ in 0..10 {
        store
            .exec_tx(&TxContext::new(), |q| {
                Ok(q.create_transfer(&CreateTransferParams {
                    from_account_id: a.id,
                    to_account_id: b.id,
                    amount: 100,
                })?)
            })
            .unwrap();
    }

    let page = store
        .list_transfers(&ListTransfersParams {
            from_account_id: a.id,
            to_account_id: b.id,
            limit: 5,
            offset: 5,
        })
        .unwrap();
    assert_eq!(page.len(), 5);
    for t in &page {
        assert_eq!(t.from_account_id, a.id);
        assert_eq!(t.to_account_id, b.id);
        assert_eq!(t.amount, 100);
    }
}

fn transfer_moves_money(store: Store) {
    let a = open_account(&store, 100);
    let b = open_account(&store, 50);

    let result = transfer(&store, a.id, b.id, 30).unwrap();

    assert_eq!(result.transfer.from_account_id, a.id);
    assert_eq!(result.transfer.to_account_id, b.id);
    assert_eq!(result.transfer.amount, 30);
    assert_eq!(result.from_entry.account_id, a.id);
    assert_eq!(result.from_entry.amount, -30);
    assert_eq!(result.to_entry.account_id, b.id);
    assert_eq!(result.to_entry.amount, 30);
    assert_eq!(result.from_account.id, a.id);
    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.id, b.id);
    assert_eq!(result.to_account.balance, 80);

    assert_eq!(balance(&store, a.id), 70);
    assert_eq!(balance(&store, b.id), 80);

    let stored = store.get_transfer(result.transfer.id).unwrap();
    assert_eq!(stored.amount, 30);
    assert_eq!(store.get_entry(result.from_entry.id).unwrap().amount, -30);

    let a_entries = entries_of(&store, a.id);
    let b_entries = entries_of(&store, b.id);
    assert_eq!(a_entries.len(), 1);
    assert_eq!(b_entries.len(), 1);
    assert_eq!(a_entries[0].amount + b_entries[0].amount, 0);
    assert_eq!(transfers_touching(&store, a.id).len(), 1);
}

fn transfer_to_self_is_rejected(store: Store) {
    let a = open_account(&store, 100);

    let err = transfer(&store, a.id, a.id, 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert_eq!(balance(&store, a.id), 100);
    assert!(entries_of(&store, a.id).is_empty());
    assert!(transfers_touching(&store, a.id).is_empty());
}

fn transfer_rejects_non_positive_amount(store: Store) {
    let a = open_account(&store, 100);
    let b = open_account(&store, 100);

    for amount in [0, -10] {
        let err = transfer(&store, a.id, b.id, amount).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
    assert_eq!(balance(&store, a.id), 100);
    assert!(transfers_touching(&store, a.id).is_empty());
}

fn transfer_to_missing_account(store: Store) {
    let a = open_account(&store, 100);
    let missing = a.id + 1_000_000;

    let err = transfer(&store, a.id, missing, 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound, "got {:?}", err);

    assert_eq!(balance(&store, a.id), 100);
    assert!(entries_of(&store, a.id).is_empty());
    assert!(transfers_touching(&store, a.id).is_empty());
}

fn transfer_from_missing_account(store: Store) {
    let b = open_account(&store, 100);
    let missing = b.id + 1_000_000;

    let err = transfer(&store, missing, b.id, 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound, "got {:?}", err);

    assert_eq!(balance(&store, b.id), 100);
    assert!(entries_of(&store, b.id).is_empty());
}

fn failed_unit_of_work_leaves_no_trace(store: Store) {
    let a = open_account(&store, 100);
    let b = open_account(&store, 100);

    let err = store
        .exec_tx(&TxContext::new(), |q| -> Result<(), LedgerError> {
            q.create_transfer(&CreateTransferParams { from_account_id: a.id, to_account_id: b.id, amount: 5 })?;
            q.create_entry(&CreateEntryParams { account_id: a.id, amount: -5 })?;
            q.add_account_balance(&simplebank::AddAccountBalanceParams { id: a.id, amount: -5 })?;
            Err(LedgerError::invalid("abort"))
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert_eq!(balance(&store, a.id), 100);
    assert!(entries_of(&store, a.id).is_empty());
    assert!(transfers_touching(&store, a.id).is_empty());
}

fn concurrent_transfers_conserve_money(store: Store) {
    let a = open_account(&store, 1000);
    let b = open_account(&store, 1000);
    let n = 10;
    let amount = 10;

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..n)
            .map(|_| s.spawn(|| transfer(&store, a.id, b.id, amount)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = std::collections::HashSet::new();
    for result in results {
        let result = result.expect("Concurrent transfer failed");
        let debited = a.balance - result.from_account.balance;
        let credited = result.to_account.balance - b.balance;
        assert_eq!(debited, credited);
        assert!(debited > 0 && debited % amount == 0);
        let k = debited / amount;
        assert!((1..=n).contains(&k));
        assert!(seen.insert(k), "Two transfers observed the same balance");
    }

    assert_eq!(balance(&store, a.id), a.balance - n * amount);
    assert_eq!(balance(&store, b.id), b.balance + n * amount);
    assert_eq!(entries_of(&store, a.id).len(), n as usize);
    assert_eq!(entries_of(&store, b.id).len(), n as usize);
}

fn opposing_transfers_do_not_deadlock(store: Store) {
    let a = open_account(&store, 1000);
    let b = open_account(&store, 1000);
    let n = 10;
    let amount = 10;

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..n)
            .map(|i| {
                let store = &store;
                let (from, to) = if i % 2 == 1 { (a.id, b.id) } else { (b.id, a.id) };
                s.spawn(move || transfer(store, from, to, amount))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().expect("Opposing transfer failed");
        }
    });

    assert_eq!(balance(&store, a.id), 1000);
    assert_eq!(balance(&store, b.id), 1000);
}

fn overdraft_reject_policy(store: Store) {
    let store = store.with_policy(LedgerPolicy {
        overdraft: OverdraftPolicy::Reject,
        ..LedgerPolicy::default()
    });
    let a = open_account(&store, 20);
    let b = open_account(&store, 0);

    let err = transfer(&store, a.id, b.id, 30).unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { account_id, balance: -10 } if account_id == a.id));
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(balance(&store, a.id), 20);
    assert_eq!(balance(&store, b.id), 0);
    assert!(entries_of(&store, a.id).is_empty());

    transfer(&store, a.id, b.id, 20).unwrap();
    assert_eq!(balance(&store, a.id), 0);
    assert_eq!(balance(&store, b.id), 20);
}

fn delete_account_guards_references(store: Store) {
    let unused = open_account(&store, 0);
    let a = open_account(&store, 100);
    let b = open_account(&store, 0);
    transfer(&store, a.id, b.id, 10).unwrap();

    store.delete_account(unused.id).unwrap();
    assert_eq!(store.get_account(unused.id).unwrap_err().kind(), ErrorKind::NotFound);

    let err = store.delete_account(a.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput, "got {:?}", err);
    assert_eq!(balance(&store, a.id), 90);
}

fn missing_records_are_not_found(store: Store) {
    let a = open_account(&store, 0);
    let missing = a.id + 1_000_000;

    assert!(matches!(store.get_account(missing), Err(LedgerError::Storage(StorageError::NotFound(_)))));
    assert_eq!(store.get_entry(missing).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(store.get_transfer(missing).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(store.delete_account(missing).unwrap_err().kind(), ErrorKind::NotFound);
}

fn balance_overflow_is_rejected(store: Store) {
    let full = open_account(&store, i64::MAX);
    let other = open_account(&store, 10);

    let err = store
        .add_account_balance(&simplebank::AddAccountBalanceParams { id: full.id, amount: 1 })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput, "got {:?}", err);
    assert_eq!(balance(&store, full.id), i64::MAX);

    let err = transfer(&store, other.id, full.id, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput, "got {:?}", err);
    assert_eq!(balance(&store, other.id), 10);
    assert_eq!(balance(&store, full.id), i64::MAX);
    assert!(entries_of(&store, other.id).is_empty());
    assert!(transfers_touching(&store, full.id).is_empty());
}
