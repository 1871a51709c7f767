use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use time::OffsetDateTime;

use simplebank_core::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer,
};

use crate::storage::{check_page_bounds, Queries, StorageBackend, StorageError, Transaction, TransactionId};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

/// SQLite allows a single writer, so a transaction keeps the connection for
/// its whole lifetime and starts with `BEGIN IMMEDIATE`. Waiting for the
/// connection is bounded by the caller's deadline.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(map_sqlite_error)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(map_sqlite_error)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(map_sqlite_error)?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn lock_until(&self, deadline: Option<Instant>) -> Result<MutexGuard<'_, Connection>, StorageError> {
        match deadline {
            Some(deadline) => self.conn.try_lock_until(deadline).ok_or(StorageError::DeadlineExceeded),
            None => Ok(self.lock()),
        }
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                balance INTEGER NOT NULL CHECK (typeof(balance) = 'integer'),
                currency TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_account_id INTEGER NOT NULL REFERENCES accounts(id),
                to_account_id INTEGER NOT NULL REFERENCES accounts(id),
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers(from_account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers(to_account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_pair ON transfers(from_account_id, to_account_id);
            ",
        )
        .map_err(map_sqlite_error)?;
        Ok(())
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> StorageError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StorageError::Conflict(e.to_string()),
        Some(ErrorCode::ConstraintViolation) => StorageError::Constraint(e.to_string()),
        _ => StorageError::Other(e.to_string()),
    }
}

fn is_foreign_key_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

/// Inserts that point at a missing account surface as NotFound.
fn map_reference_error(e: rusqlite::Error, missing: impl FnOnce() -> StorageError) -> StorageError {
    if is_foreign_key_violation(&e) {
        missing()
    } else {
        map_sqlite_error(e)
    }
}

fn account_from_row(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        owner: row.get(1)?,
        balance: row.get(2)?,
        currency: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn transfer_from_row(row: &rusqlite::Row) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: row.get(0)?,
        from_account_id: row.get(1)?,
        to_account_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl StorageBackend for SqliteStorage {
    fn begin_transaction(&self, deadline: Option<Instant>) -> Result<Box<dyn Transaction + '_>, StorageError> {
        let conn = self.lock_until(deadline)?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(map_sqlite_error)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(Box::new(SqliteQueries {
            conn,
            tx: Some(tx_id),
            finished: false,
        }))
    }

    fn connection(&self) -> Result<Box<dyn Queries + '_>, StorageError> {
        Ok(Box::new(SqliteQueries {
            conn: self.lock(),
            tx: None,
            finished: false,
        }))
    }
}

/// Statement handle over the locked connection. With `tx` unset every
/// statement commits on its own.
pub struct SqliteQueries<'a> {
    conn: MutexGuard<'a, Connection>,
    tx: Option<TransactionId>,
    finished: bool,
}

impl<'a> SqliteQueries<'a> {
    fn finish(&mut self, statement: &str) -> Result<TransactionId, StorageError> {
        let tx_id = match self.tx {
            Some(tx_id) if !self.finished => tx_id,
            _ => return Err(StorageError::NoActiveTransaction),
        };
        self.finished = true;
        if let Err(e) = self.conn.execute_batch(statement) {
            // a failed COMMIT can leave the transaction open
            if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(tx_id, error = %rollback_err, "SQLite rollback after failed {} failed", statement);
            }
            return Err(map_sqlite_error(e));
        }
        Ok(tx_id)
    }
}

impl<'a> Drop for SqliteQueries<'a> {
    fn drop(&mut self) {
        if let (Some(tx_id), false) = (self.tx, self.finished) {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(tx_id, error = %e, "SQLite rollback on drop failed");
            } else {
                tracing::debug!(tx_id, "SQLite transaction dropped without commit");
            }
        }
    }
}

impl<'a> Queries for SqliteQueries<'a> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO accounts (owner, balance, currency, created_at) VALUES (?1, ?2, ?3, ?4) RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.owner, params.balance, params.currency, OffsetDateTime::now_utc()],
                account_from_row,
            )
            .map_err(map_sqlite_error)
    }

    fn get_account(&mut self, id: i64) -> Result<Account, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                params![id],
                account_from_row,
            )
            .optional()
            .map_err(map_sqlite_error)?
            .ok_or_else(|| StorageError::account_not_found(id))
    }

    fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        check_page_bounds(params.limit, params.offset)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM accounts WHERE (?1 IS NULL OR owner = ?1) ORDER BY id LIMIT ?2 OFFSET ?3",
                ACCOUNT_COLUMNS
            ))
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params![params.owner, params.limit, params.offset], account_from_row)
            .map_err(map_sqlite_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_error)
    }

    fn add_account_balance(&mut self, params: &AddAccountBalanceParams) -> Result<Account, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2 RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.amount, params.id],
                account_from_row,
            )
            .optional()
            .map_err(map_sqlite_error)?
            .ok_or_else(|| StorageError::account_not_found(params.id))
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StorageError> {
        let deleted = self
            .conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    StorageError::Constraint(format!("account {} is referenced by entries or transfers", id))
                } else {
                    map_sqlite_error(e)
                }
            })?;
        if deleted == 0 {
            return Err(StorageError::account_not_found(id));
        }
        Ok(())
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO entries (account_id, amount, created_at) VALUES (?1, ?2, ?3) RETURNING {}",
                    ENTRY_COLUMNS
                ),
                params![params.account_id, params.amount, OffsetDateTime::now_utc()],
                entry_from_row,
            )
            .map_err(|e| map_reference_error(e, || StorageError::account_not_found(params.account_id)))
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                entry_from_row,
            )
            .optional()
            .map_err(map_sqlite_error)?
            .ok_or_else(|| StorageError::NotFound(format!("entry {}", id)))
    }

    fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        check_page_bounds(params.limit, params.offset)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM entries WHERE account_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
                ENTRY_COLUMNS
            ))
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params![params.account_id, params.limit, params.offset], entry_from_row)
            .map_err(map_sqlite_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_error)
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StorageError> {
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at) VALUES (?1, ?2, ?3, ?4) RETURNING {}",
                    TRANSFER_COLUMNS
                ),
                params![params.from_account_id, params.to_account_id, params.amount, OffsetDateTime::now_utc()],
                transfer_from_row,
            )
            .map_err(|e| {
                map_reference_error(e, || {
                    StorageError::NotFound(format!("account {} or {}", params.from_account_id, params.to_account_id))
                })
            })
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM transfers WHERE id = ?1", TRANSFER_COLUMNS),
                params![id],
                transfer_from_row,
            )
            .optional()
            .map_err(map_sqlite_error)?
            .ok_or_else(|| StorageError::NotFound(format!("transfer {}", id)))
    }

    fn list_transfers(&mut self, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        check_page_bounds(params.limit, params.offset)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM transfers WHERE from_account_id = ?1 OR to_account_id = ?2 ORDER BY id LIMIT ?3 OFFSET ?4",
                TRANSFER_COLUMNS
            ))
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(
                params![params.from_account_id, params.to_account_id, params.limit, params.offset],
                transfer_from_row,
            )
            .map_err(map_sqlite_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite_error)
    }
}

impl<'a> Transaction for SqliteQueries<'a> {
    fn id(&self) -> TransactionId {
        self.tx.unwrap_or_default()
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let tx_id = self.finish("COMMIT")?;
        tracing::debug!(tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        let tx_id = self.finish("ROLLBACK")?;
        tracing::debug!(tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_account(storage: &SqliteStorage, balance: i64) -> Account {
        storage
            .connection()
            .unwrap()
            .create_account(&CreateAccountParams {
                owner: "dan".to_string(),
                currency: "USD".to_string(),
                balance,
            })
            .unwrap()
    }

    #[test]
    fn test_sqlite_basic_operations() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let account = open_account(&storage, 1000);
        assert_eq!(account.balance, 1000);
        assert_eq!(account.currency, "USD");

        let mut conn = storage.connection().unwrap();
        let fetched = conn.get_account(account.id).unwrap();
        assert_eq!(fetched.id, account.id);
        assert_eq!(fetched.owner, account.owner);

        let updated = conn
            .add_account_balance(&AddAccountBalanceParams { id: account.id, amount: -300 })
            .unwrap();
        assert_eq!(updated.balance, 700);

        let entry = conn
            .create_entry(&CreateEntryParams { account_id: account.id, amount: -300 })
            .unwrap();
        assert_eq!(conn.get_entry(entry.id).unwrap().amount, -300);
    }

    #[test]
    fn test_sqlite_transaction_rollback() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let account = open_account(&storage, 500);

        let mut tx = storage.begin_transaction(None).unwrap();
        tx.add_account_balance(&AddAccountBalanceParams { id: account.id, amount: 500 })
            .unwrap();
        tx.create_entry(&CreateEntryParams { account_id: account.id, amount: 500 })
            .unwrap();
        tx.rollback().unwrap();

        let mut conn = storage.connection().unwrap();
        let bal = conn.get_account(account.id).unwrap().balance;
        assert_eq!(bal, 500, "Balance should be unchanged after rollback");
        let entries = conn
            .list_entries(&ListEntriesParams { account_id: account.id, limit: 10, offset: 0 })
            .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_sqlite_dropped_transaction_rolls_back() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let account = open_account(&storage, 10);
        {
            let mut tx = storage.begin_transaction(None).unwrap();
            tx.add_account_balance(&AddAccountBalanceParams { id: account.id, amount: 10 })
                .unwrap();
        }
        let bal = storage.connection().unwrap().get_account(account.id).unwrap().balance;
        assert_eq!(bal, 10);
    }

    #[test]
    fn test_sqlite_foreign_keys() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let account = open_account(&storage, 0);
        let mut conn = storage.connection().unwrap();

        let err = conn
            .create_entry(&CreateEntryParams { account_id: 404, amount: 1 })
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)), "got {:?}", err);

        conn.create_transfer(&CreateTransferParams {
            from_account_id: account.id,
            to_account_id: account.id,
            amount: 1,
        })
        .unwrap();
        let err = conn.delete_account(account.id).unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)), "got {:?}", err);
    }

    #[test]
    fn test_sqlite_balance_overflow_leaves_row_intact() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let account = open_account(&storage, i64::MAX);
        let mut conn = storage.connection().unwrap();

        let err = conn
            .add_account_balance(&AddAccountBalanceParams { id: account.id, amount: 1 })
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)), "got {:?}", err);
        assert_eq!(conn.get_account(account.id).unwrap().balance, i64::MAX);
    }

    #[test]
    fn test_sqlite_connection_wait_respects_deadline() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let holder = storage.begin_transaction(None).unwrap();

        let err = match storage.begin_transaction(Some(Instant::now() + Duration::from_millis(20))) {
            Ok(_) => panic!("Connection is held by another transaction"),
            Err(e) => e,
        };
        assert!(matches!(err, StorageError::DeadlineExceeded), "got {:?}", err);

        holder.commit().unwrap();
        let tx = storage.begin_transaction(Some(Instant::now() + Duration::from_secs(5))).unwrap();
        tx.rollback().unwrap();
    }
}
