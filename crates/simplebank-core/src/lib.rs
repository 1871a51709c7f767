//! Core types and traits for SimpleBank storage backends.
//!
//! This crate provides the `StorageBackend` trait, the row-level `Queries`
//! primitives and the ledger record types, so that storage implementations
//! can live outside the transfer engine.

pub mod context;
pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use context::{CancelHandle, TxContext};
pub use models::{Account, Entry, Transfer};
pub use models::write::{
    AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    ListAccountsParams, ListEntriesParams, ListTransfersParams,
};
pub use storage::{Queries, StorageBackend, StorageError, Transaction, TransactionId};
