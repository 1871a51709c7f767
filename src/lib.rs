//! SimpleBank: account balances, append-only entries and atomic transfers
//! over pluggable transactional storage.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod postgres_storage;
pub mod sqlite_storage;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod transfer;

pub use simplebank_core::{
    Account, AddAccountBalanceParams, CancelHandle, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer,
    TxContext,
};
pub use error::{ErrorKind, LedgerError};
pub use store::{LedgerPolicy, OverdraftPolicy, Store};
pub use transfer::{TransferTxParams, TransferTxResult};
