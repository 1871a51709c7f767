use std::sync::Arc;

use serde::Deserialize;

use simplebank_core::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
    Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams, Transfer, TxContext,
};

use crate::{
    error::LedgerError,
    storage::{Queries, StorageBackend, StorageError, Transaction},
};

/// What a transfer does when the debit would take the source below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverdraftPolicy {
    #[default]
    Allow,
    Reject,
}

#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    pub overdraft: OverdraftPolicy,
    pub currencies: Vec<String>,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            overdraft: OverdraftPolicy::Allow,
            currencies: vec!["USD".to_string(), "EUR".to_string(), "CAD".to_string()],
        }
    }
}

impl LedgerPolicy {
    pub fn validate_currency(&self, currency: &str) -> Result<(), LedgerError> {
        let well_formed = currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase());
        if !well_formed || !self.currencies.iter().any(|c| c == currency) {
            return Err(LedgerError::invalid(format!("unsupported currency: {}", currency)));
        }
        Ok(())
    }
}

fn validate_page(limit: i64, offset: i64) -> Result<(), LedgerError> {
    if limit < 0 || offset < 0 {
        return Err(LedgerError::invalid("limit and offset must not be negative"));
    }
    Ok(())
}

/// Entry point into the ledger. Owns nothing but the backend handle, so one
/// `Store` is shared by every worker and each call runs independently.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StorageBackend>,
    policy: LedgerPolicy,
}

impl Store {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            policy: LedgerPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: LedgerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    /// Runs `work` inside one transaction. The work's error is returned
    /// unchanged after rollback; a failed commit replaces the work's result.
    pub fn exec_tx<T, F>(&self, ctx: &TxContext, work: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn Queries) -> Result<T, LedgerError>,
    {
        ctx.check()?;
        let mut tx = self.backend.begin_transaction(ctx.deadline())?;
        let tx_id = tx.id();

        let result = {
            let mut queries = ContextQueries { ctx, tx: tx.as_mut() };
            work(&mut queries)
        }
        .and_then(|value| {
            ctx.check()?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(tx_id, error = %rollback_err, "Rollback failed");
                }
                tracing::debug!(tx_id, error = %err, "Unit of work aborted");
                Err(err)
            }
        }
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut dyn Queries) -> Result<T, StorageError>) -> Result<T, LedgerError> {
        let mut conn = self.backend.connection()?;
        Ok(op(conn.as_mut())?)
    }

    pub fn create_account(&self, params: &CreateAccountParams) -> Result<Account, LedgerError> {
        if params.owner.trim().is_empty() {
            return Err(LedgerError::invalid("owner must not be empty"));
        }
        self.policy.validate_currency(&params.currency)?;
        let account = self.with_connection(|q| q.create_account(params))?;
        tracing::info!(account_id = account.id, owner = %account.owner, currency = %account.currency, "Account created");
        Ok(account)
    }

    pub fn get_account(&self, id: i64) -> Result<Account, LedgerError> {
        self.with_connection(|q| q.get_account(id))
    }

    pub fn list_accounts(&self, params: &ListAccountsParams) -> Result<Vec<Account>, LedgerError> {
        validate_page(params.limit, params.offset)?;
        self.with_connection(|q| q.list_accounts(params))
    }

    pub fn add_account_balance(&self, params: &AddAccountBalanceParams) -> Result<Account, LedgerError> {
        self.with_connection(|q| q.add_account_balance(params))
    }

    /// Corrects an account's balance by `amount`, recording the change as an
    /// entry in the same transaction.
    pub fn adjust_account_balance(&self, ctx: &TxContext, id: i64, amount: i64) -> Result<(Account, Entry), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::invalid("adjustment amount must not be zero"));
        }
        let overdraft = self.policy.overdraft;
        let (account, entry) = self.exec_tx(ctx, |q| {
            let entry = q.create_entry(&CreateEntryParams { account_id: id, amount })?;
            let account = q.add_account_balance(&AddAccountBalanceParams { id, amount })?;
            if overdraft == OverdraftPolicy::Reject && amount < 0 && account.balance < 0 {
                return Err(LedgerError::InsufficientFunds {
                    account_id: id,
                    balance: account.balance,
                });
            }
            Ok((account, entry))
        })?;
        tracing::info!(account_id = id, amount, balance = account.balance, "Account balance adjusted");
        Ok((account, entry))
    }

    pub fn delete_account(&self, id: i64) -> Result<(), LedgerError> {
        self.with_connection(|q| q.delete_account(id))?;
        tracing::info!(account_id = id, "Account deleted");
        Ok(())
    }

    pub fn get_entry(&self, id: i64) -> Result<Entry, LedgerError> {
        self.with_connection(|q| q.get_entry(id))
    }

    pub fn list_entries(&self, params: &ListEntriesParams) -> Result<Vec<Entry>, LedgerError> {
        validate_page(params.limit, params.offset)?;
        self.with_connection(|q| q.list_entries(params))
    }

    pub fn get_transfer(&self, id: i64) -> Result<Transfer, LedgerError> {
        self.with_connection(|q| q.get_transfer(id))
    }

    pub fn list_transfers(&self, params: &ListTransfersParams) -> Result<Vec<Transfer>, LedgerError> {
        validate_page(params.limit, params.offset)?;
        self.with_connection(|q| q.list_transfers(params))
    }
}

/// Checks the caller's context before every statement of a unit of work.
struct ContextQueries<'a, 'b> {
    ctx: &'a TxContext,
    tx: &'a mut (dyn Transaction + 'b),
}

impl<'a, 'b> Queries for ContextQueries<'a, 'b> {
    fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account, StorageError> {
        self.ctx.check()?;
        self.tx.create_account(params)
    }

    fn get_account(&mut self, id: i64) -> Result<Account, StorageError> {
        self.ctx.check()?;
        self.tx.get_account(id)
    }

    fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        self.ctx.check()?;
        self.tx.list_accounts(params)
    }

    fn add_account_balance(&mut self, params: &AddAccountBalanceParams) -> Result<Account, StorageError> {
        self.ctx.check()?;
        self.tx.add_account_balance(params)
    }

    fn delete_account(&mut self, id: i64) -> Result<(), StorageError> {
        self.ctx.check()?;
        self.tx.delete_account(id)
    }

    fn create_entry(&mut self, params: &CreateEntryParams) -> Result<Entry, StorageError> {
        self.ctx.check()?;
        self.tx.create_entry(params)
    }

    fn get_entry(&mut self, id: i64) -> Result<Entry, StorageError> {
        self.ctx.check()?;
        self.tx.get_entry(id)
    }

    fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        self.ctx.check()?;
        self.tx.list_entries(params)
    }

    fn create_transfer(&mut self, params: &CreateTransferParams) -> Result<Transfer, StorageError> {
        self.ctx.check()?;
        self.tx.create_transfer(params)
    }

    fn get_transfer(&mut self, id: i64) -> Result<Transfer, StorageError> {
        self.ctx.check()?;
        self.tx.get_transfer(id)
    }

    fn list_transfers(&mut self, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        self.ctx.check()?;
        self.tx.list_transfers(params)
    }
}
