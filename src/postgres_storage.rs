use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use postgres::{error::SqlState, NoTls, Row};
use r2d2_postgres::PostgresConnectionManager;

use simplebank_core::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer,
};

use crate::storage::{check_page_bounds, Queries, StorageBackend, StorageError, Transaction, TransactionId};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

type PgPool = r2d2::Pool<PostgresConnectionManager<NoTls>>;
type PgConnection = r2d2::PooledConnection<PostgresConnectionManager<NoTls>>;

#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub pool_size: usize,
    pub acquire_timeout: Duration,
    pub lock_timeout: Duration,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            pool_size: 10,
            acquire_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

pub struct PostgresStorage {
    pool: PgPool,
    acquire_timeout: Duration,
    tx_counter: AtomicU64,
    lock_timeout: Duration,
}

impl PostgresStorage {
    pub fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_options(connection_string, PostgresOptions::default())
    }

    pub fn with_options(connection_string: &str, options: PostgresOptions) -> Result<Self, StorageError> {
        let config: postgres::Config = connection_string.parse().map_err(map_pg_error)?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        let max_size = u32::try_from(options.pool_size.max(1)).unwrap_or(u32::MAX);
        let pool = r2d2::Pool::builder()
            .max_size(max_size)
            .connection_timeout(options.acquire_timeout)
            .build(manager)
            .map_err(|e| StorageError::Other(format!("PostgreSQL connection failed: {}", e)))?;

        let storage = Self {
            pool,
            acquire_timeout: options.acquire_timeout,
            tx_counter: AtomicU64::new(1),
            lock_timeout: options.lock_timeout,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Checks a connection out of the pool, waiting no longer than the
    /// caller's deadline when it is nearer than the pool timeout.
    fn checkout(&self, deadline: Option<Instant>) -> Result<PgConnection, StorageError> {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let (timeout, deadline_bound) = match remaining {
            Some(remaining) if remaining < self.acquire_timeout => (remaining, true),
            _ => (self.acquire_timeout, false),
        };
        self.pool.get_timeout(timeout).map_err(|e| {
            if deadline_bound {
                StorageError::DeadlineExceeded
            } else {
                StorageError::Other(format!("no pooled connection available: {}", e))
            }
        })
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let mut conn = self.checkout(None)?;
        conn.batch_execute(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id BIGSERIAL PRIMARY KEY,
                owner VARCHAR NOT NULL,
                balance BIGINT NOT NULL,
                currency VARCHAR NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS entries (
                id BIGSERIAL PRIMARY KEY,
                account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id BIGSERIAL PRIMARY KEY,
                from_account_id BIGINT NOT NULL REFERENCES accounts(id),
                to_account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE INDEX IF NOT EXISTS idx_pg_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_pg_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_from ON transfers(from_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_to ON transfers(to_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_pair ON transfers(from_account_id, to_account_id);
            ",
        )
        .map_err(map_pg_error)?;
        Ok(())
    }
}

fn map_pg_error(e: postgres::Error) -> StorageError {
    match e.code() {
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::LOCK_NOT_AVAILABLE =>
        {
            StorageError::Conflict(e.to_string())
        }
        Some(code) if *code == SqlState::QUERY_CANCELED => StorageError::DeadlineExceeded,
        Some(code)
            if *code == SqlState::FOREIGN_KEY_VIOLATION
                || *code == SqlState::CHECK_VIOLATION
                || *code == SqlState::NUMERIC_VALUE_OUT_OF_RANGE =>
        {
            StorageError::Constraint(e.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}

fn map_reference_error(e: postgres::Error, missing: impl FnOnce() -> StorageError) -> StorageError {
    if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
        missing()
    } else {
        map_pg_error(e)
    }
}

fn account_from_row(row: &Row) -> Result<Account, StorageError> {
    Ok(Account {
        id: row.try_get(0).map_err(map_pg_error)?,
        owner: row.try_get(1).map_err(map_pg_error)?,
        balance: row.try_get(2).map_err(map_pg_error)?,
        currency: row.try_get(3).map_err(map_pg_error)?,
        created_at: row.try_get(4).map_err(map_pg_error)?,
    })
}

fn entry_from_row(row: &Row) -> Result<Entry, StorageError> {
    Ok(Entry {
        id: row.try_get(0).map_err(map_pg_error)?,
        account_id: row.try_get(1).map_err(map_pg_error)?,
        amount: row.try_get(2).map_err(map_pg_error)?,
        created_at: row.try_get(3).map_err(map_pg_error)?,
    })
}

fn transfer_from_row(row: &Row) -> Result<Transfer, StorageError> {
    Ok(Transfer {
        id: row.try_get(0).map_err(map_pg_error)?,
        from_account_id: row.try_get(1).map_err(map_pg_error)?,
        to_account_id: row.try_get(2).map_err(map_pg_error)?,
        amount: row.try_get(3).map_err(map_pg_error)?,
        created_at: row.try_get(4).map_err(map_pg_error)?,
    })
}

fn millis(d: Duration) -> u128 {
    d.as_millis().max(1)
}

impl StorageBackend for PostgresStorage {
    fn begin_transaction(&self, deadline: Option<Instant>) -> Result<Box<dyn Transaction + '_>, StorageError> {
        let mut conn = self.checkout(deadline)?;
        let mut setup = format!("BEGIN; SET LOCAL lock_timeout = {};", millis(self.lock_timeout));
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            setup.push_str(&format!(" SET LOCAL statement_timeout = {};", millis(remaining)));
        }
        if let Err(e) = conn.batch_execute(&setup) {
            // BEGIN may have succeeded before a SET failed
            if let Err(rollback_err) = conn.batch_execute("ROLLBACK") {
                tracing::warn!(error = %rollback_err, "PostgreSQL rollback after failed begin failed");
            }
            return Err(map_pg_error(e));
        }
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "PostgreSQL transaction started");
        Ok(Box::new(PgQueries {
            conn,
            tx: Some(tx_id),
            finished: false,
        }))
    }

    fn connection(&self) -> Result<Box<dyn Queries + '_>, StorageError> {
        Ok(Box::new(PgQueries {
            conn: self.checkout(None)?,
            tx: None,
            finished: false,
        }))
    }
}

pub struct PgQueries {
    conn: PgConnection,
    tx: Option<TransactionId>,
    finished: bool,
}

impl PgQueries {
    fn query_one_opt<T>(
        &mut self,
        sql: &str,
        args: &[&(dyn postgres::types::ToSql + Sync)],
        map: fn(&Row) -> Result<T, StorageError>,
    ) -> Result<Option<T>, StorageError> {
        let row = self.conn.query_opt(sql, args).map_err(map_pg_error)?;
        row.as_ref().map(map).transpose()
    }

    fn query_all<T>(
        &mut self,
        sql: &str,
        args: &[&(dyn postgres::types::ToSql + Sync)],
        map: fn(&Row) -> Result<T, StorageError>,
    ) -> Result<Vec<T>, StorageError> {
        let rows = self.conn.query(sql, args).map_err(map_pg_error)?;
        rows.iter().map(map).collect()
    }

    fn finish(&mut self, statement: &str) -> Result<TransactionId, StorageError> {
        let tx_id = match self.tx {
            Some(tx_id) if !self.finished => tx_id,
            _ => return Err(StorageError::NoActiveTransaction),
        };
        self.finished = true;
        self.conn.batch_execute(statement).map_err(map_pg_error)?;
        Ok(tx_id)
    }
}

impl Drop for PgQueries {
    fn drop(&mut self) {
        if let (Some(tx_id), false) = (self.tx, self.finished) {
            if let Err(e) = self.conn.batch_execute("ROLLBACK") {
                tracing::warn!(tx_id, error = %e, "PostgreSQL rollback on drop failed");
            } else {
                tracing::debug!(tx_id, "PostgreSQL transaction dropped without commit");
            }
        }
    }
}

impl Queries for PgQueries {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StorageError> {
        let sql = format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {}",
            ACCOUNT_COLUMNS
        );
        let row = self
            .conn
            .query_one(&sql, &[&params.owner, &params.balance, &params.currency])
            .map_err(map_pg_error)?;
        account_from_row(&row)
    }

    fn get_account(&mut self, id: i64) -> Result<Account, StorageError> {
        let sql = format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS);
        self.query_one_opt(&sql, &[&id], account_from_row)?
            .ok_or_else(|| StorageError::account_not_found(id))
    }

    fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        check_page_bounds(params.limit, params.offset)?;
        let sql = format!(
            "SELECT {} FROM accounts WHERE ($1::VARCHAR IS NULL OR owner = $1) ORDER BY id LIMIT $2 OFFSET $3",
            ACCOUNT_COLUMNS
        );
        self.query_all(&sql, &[&params.owner, &params.limit, &params.offset], account_from_row)
    }

    fn add_account_balance(&mut self, params: &AddAccountBalanceParams) -> Result<Account, StorageError> {
        let sql = format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {}",
            ACCOUNT_COLUMNS
        );
        self.query_one_opt(&sql, &[&params.amount, &params.id], account_from_row)?
            .ok_or_else(|| StorageError::account_not_found(params.id))
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StorageError> {
        let deleted = self
            .conn
            .execute("DELETE FROM accounts WHERE id = $1", &[&id])
            .map_err(|e| {
                map_reference_error(e, || {
                    StorageError::Constraint(format!("account {} is referenced by entries or transfers", id))
                })
            })?;
        if deleted == 0 {
            return Err(StorageError::account_not_found(id));
        }
        Ok(())
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StorageError> {
        let sql = format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {}",
            ENTRY_COLUMNS
        );
        let row = self
            .conn
            .query_one(&sql, &[&params.account_id, &params.amount])
            .map_err(|e| map_reference_error(e, || StorageError::account_not_found(params.account_id)))?;
        entry_from_row(&row)
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError> {
        let sql = format!("SELECT {} FROM entries WHERE id = $1", ENTRY_COLUMNS);
        self.query_one_opt(&sql, &[&id], entry_from_row)?
            .ok_or_else(|| StorageError::NotFound(format!("entry {}", id)))
    }

    fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        check_page_bounds(params.limit, params.offset)?;
        let sql = format!(
            "SELECT {} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
            ENTRY_COLUMNS
        );
        self.query_all(&sql, &[&params.account_id, &params.limit, &params.offset], entry_from_row)
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StorageError> {
        let sql = format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) RETURNING {}",
            TRANSFER_COLUMNS
        );
        let row = self
            .conn
            .query_one(&sql, &[&params.from_account_id, &params.to_account_id, &params.amount])
            .map_err(|e| {
                map_reference_error(e, || {
                    StorageError::NotFound(format!("account {} or {}", params.from_account_id, params.to_account_id))
                })
            })?;
        transfer_from_row(&row)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError> {
        let sql = format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS);
        self.query_one_opt(&sql, &[&id], transfer_from_row)?
            .ok_or_else(|| StorageError::NotFound(format!("transfer {}", id)))
    }

    fn list_transfers(&mut self, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        check_page_bounds(params.limit, params.offset)?;
        let sql = format!(
            "SELECT {} FROM transfers WHERE from_account_id = $1 OR to_account_id = $2 ORDER BY id LIMIT $3 OFFSET $4",
            TRANSFER_COLUMNS
        );
        self.query_all(
            &sql,
            &[&params.from_account_id, &params.to_account_id, &params.limit, &params.offset],
            transfer_from_row,
        )
    }
}

impl Transaction for PgQueries {
    fn id(&self) -> TransactionId {
        self.tx.unwrap_or_default()
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let tx_id = self.finish("COMMIT")?;
        tracing::debug!(tx_id, "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        let tx_id = self.finish("ROLLBACK")?;
        tracing::debug!(tx_id, "PostgreSQL transaction rolled back");
        Ok(())
    }
}
