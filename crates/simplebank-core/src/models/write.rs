#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAccountParams {
    pub owner: String,
    pub currency: String,
    pub balance: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddAccountBalanceParams {
    pub id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListAccountsParams {
    pub owner: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListEntriesParams {
    pub account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Matches transfers leaving `from_account_id` or arriving at `to_account_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListTransfersParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub limit: i64,
    pub offset: i64,
}
