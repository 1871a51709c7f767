use std::time::Instant;

use crate::models::{
    write::{
        AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
        ListAccountsParams, ListEntriesParams, ListTransfersParams,
    },
    Account, Entry, Transfer,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("transaction cancelled")]
    Cancelled,
    #[error("transaction deadline exceeded")]
    DeadlineExceeded,
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn account_not_found(id: i64) -> Self {
        StorageError::NotFound(format!("account {}", id))
    }
}

pub type TransactionId = u64;

/// Row-level primitives. Each call is a single statement against the
/// datastore; when the handle belongs to a [`Transaction`] the effects stay
/// private to it until commit.
pub trait Queries {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StorageError>;
    fn get_account(&mut self, id: i64) -> Result<Account, StorageError>;
    fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError>;
    /// `balance = balance + amount` as one atomic read-modify-write, taking the
    /// row lock until the enclosing transaction ends.
    fn add_account_balance(&mut self, params: &AddAccountBalanceParams) -> Result<Account, StorageError>;
    fn delete_account(&mut self, id: i64) -> Result<(), StorageError>;

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StorageError>;
    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError>;
    fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError>;

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StorageError>;
    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError>;
    fn list_transfers(&mut self, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError>;
}

pub trait Transaction: Queries {
    fn id(&self) -> TransactionId;
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

pub trait StorageBackend: Send + Sync {
    /// Opens an independent transaction. Lock waits inside it give up at
    /// `deadline` when one is set.
    fn begin_transaction(&self, deadline: Option<Instant>) -> Result<Box<dyn Transaction + '_>, StorageError>;

    /// A handle whose statements each commit on their own.
    fn connection(&self) -> Result<Box<dyn Queries + '_>, StorageError>;
}
