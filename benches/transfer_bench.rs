use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use simplebank::sqlite_storage::SqliteStorage;
use simplebank::storage::{InMemoryStorage, StorageBackend};
use simplebank::{CreateAccountParams, ListEntriesParams, Store, TransferTxParams, TxContext};

fn setup(backend: Arc<dyn StorageBackend>) -> (Store, i64, i64) {
    let store = Store::new(backend);
    let open = |owner: &str| {
        store
            .create_account(&CreateAccountParams {
                owner: owner.to_string(),
                currency: "USD".to_string(),
                balance: 1_000_000,
            })
            .unwrap()
            .id
    };
    let a = open("alice");
    let b = open("bob");
    (store, a, b)
}

fn bench_transfer(c: &mut Criterion) {
    let (store, a, b) = setup(Arc::new(InMemoryStorage::new()));
    c.bench_function("transfer_memory", |bench| {
        bench.iter(|| {
            store
                .transfer_tx(
                    &TxContext::new(),
                    black_box(TransferTxParams {
                        from_account_id: a,
                        to_account_id: b,
                        amount: 1,
                    }),
                )
                .unwrap()
        })
    });

    let (store, a, b) = setup(Arc::new(SqliteStorage::new(":memory:").unwrap()));
    c.bench_function("transfer_sqlite", |bench| {
        bench.iter(|| {
            store
                .transfer_tx(
                    &TxContext::new(),
                    black_box(TransferTxParams {
                        from_account_id: a,
                        to_account_id: b,
                        amount: 1,
                    }),
                )
                .unwrap()
        })
    });
}

fn bench_contended_transfers(c: &mut Criterion) {
    let (store, a, b) = setup(Arc::new(InMemoryStorage::new()));

    // Half the workers move money one way, half the other.
    c.bench_function("opposing_transfers_memory_8x", |bench| {
        bench.iter(|| {
            std::thread::scope(|s| {
                for i in 0..8 {
                    let store = &store;
                    let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
                    s.spawn(move || {
                        store
                            .transfer_tx(
                                &TxContext::new(),
                                TransferTxParams {
                                    from_account_id: from,
                                    to_account_id: to,
                                    amount: 1,
                                },
                            )
                            .unwrap()
                    });
                }
            })
        })
    });
}

fn bench_list_entries(c: &mut Criterion) {
    let (store, a, b) = setup(Arc::new(InMemoryStorage::new()));
    for _ in 0..1000 {
        store
            .transfer_tx(
                &TxContext::new(),
                TransferTxParams {
                    from_account_id: a,
                    to_account_id: b,
                    amount: 1,
                },
            )
            .unwrap();
    }

    let params = ListEntriesParams {
        account_id: a,
        limit: 50,
        offset: 500,
    };
    c.bench_function("list_entries_page", |bench| {
        bench.iter(|| store.list_entries(black_box(&params)).unwrap())
    });
}

criterion_group!(benches, bench_transfer, bench_contended_transfers, bench_list_entries);
criterion_main!(benches);
