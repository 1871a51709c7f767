use std::time::Instant;

use serde::{Deserialize, Serialize};

use simplebank_core::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Entry, Transfer, TxContext,
};

use crate::{
    error::LedgerError,
    storage::{Queries, StorageError},
    store::{OverdraftPolicy, Store},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferTxParams {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= 0 {
            return Err(LedgerError::invalid("transfer amount must be positive"));
        }
        if self.from_account_id == self.to_account_id {
            return Err(LedgerError::invalid("cannot transfer to the same account"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// The two balance deltas of a transfer, lowest account id first. Every
/// transfer touching the same pair takes the row locks in this order, so
/// opposing transfers cannot wait on each other in a cycle.
pub fn balance_update_order(params: &TransferTxParams) -> [AddAccountBalanceParams; 2] {
    let debit = AddAccountBalanceParams {
        id: params.from_account_id,
        amount: -params.amount,
    };
    let credit = AddAccountBalanceParams {
        id: params.to_account_id,
        amount: params.amount,
    };
    if debit.id < credit.id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}

fn add_money(q: &mut dyn Queries, params: &TransferTxParams) -> Result<(Account, Account), StorageError> {
    let [first, second] = balance_update_order(params);
    let first = q.add_account_balance(&first)?;
    let second = q.add_account_balance(&second)?;
    if first.id == params.from_account_id {
        Ok((first, second))
    } else {
        Ok((second, first))
    }
}

impl Store {
    /// Moves `amount` from one account to another: one transfer record, a
    /// debit and a credit entry, and both balance updates, all in one
    /// transaction.
    pub fn transfer_tx(&self, ctx: &TxContext, params: TransferTxParams) -> Result<TransferTxResult, LedgerError> {
        params.validate()?;
        let overdraft = self.policy().overdraft;
        let started = Instant::now();

        let result = self.exec_tx(ctx, |q| {
            let transfer = q.create_transfer(&CreateTransferParams {
                from_account_id: params.from_account_id,
                to_account_id: params.to_account_id,
                amount: params.amount,
            })?;
            let from_entry = q.create_entry(&CreateEntryParams {
                account_id: params.from_account_id,
                amount: -params.amount,
            })?;
            let to_entry = q.create_entry(&CreateEntryParams {
                account_id: params.to_account_id,
                amount: params.amount,
            })?;

            let (from_account, to_account) = add_money(q, &params)?;
            if overdraft == OverdraftPolicy::Reject && from_account.balance < 0 {
                return Err(LedgerError::InsufficientFunds {
                    account_id: from_account.id,
                    balance: from_account.balance,
                });
            }

            Ok(TransferTxResult {
                transfer,
                from_account,
                to_account,
                from_entry,
                to_entry,
            })
        });

        let outcome = match &result {
            Ok(r) => {
                tracing::info!(
                    transfer_id = r.transfer.id,
                    from = params.from_account_id,
                    to = params.to_account_id,
                    amount = params.amount,
                    "Transfer completed"
                );
                "ok"
            }
            Err(e) => {
                tracing::warn!(
                    from = params.from_account_id,
                    to = params.to_account_id,
                    amount = params.amount,
                    error = %e,
                    "Transfer failed"
                );
                crate::telemetry::outcome_label(e.kind())
            }
        };
        crate::telemetry::record_transfer(outcome, started.elapsed());

        result
    }
}
