use thiserror::Error;

use crate::storage::StorageError;

/// Coarse classification callers use to pick a response or a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    TransactionConflict,
    StorageFault,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("insufficient funds in account {account_id}: balance would be {balance}")]
    InsufficientFunds { account_id: i64, balance: i64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        LedgerError::InvalidInput(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidInput(_) | LedgerError::InsufficientFunds { .. } => ErrorKind::InvalidInput,
            LedgerError::Storage(e) => match e {
                StorageError::NotFound(_) => ErrorKind::NotFound,
                StorageError::Constraint(_) => ErrorKind::InvalidInput,
                StorageError::Conflict(_) => ErrorKind::TransactionConflict,
                StorageError::Cancelled | StorageError::DeadlineExceeded => ErrorKind::Cancelled,
                StorageError::NoActiveTransaction | StorageError::Other(_) => ErrorKind::StorageFault,
            },
        }
    }

    /// Conflicts and cancellations leave nothing behind, so the same request
    /// may be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransactionConflict | ErrorKind::Cancelled)
    }
}
