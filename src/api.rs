use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use simplebank_core::{Account, CreateAccountParams, Entry, ListAccountsParams, ListEntriesParams, TxContext};

use crate::{
    auth::auth_middleware,
    config::AuthConfig,
    error::{ErrorKind, LedgerError},
    store::Store,
    transfer::{TransferTxParams, TransferTxResult},
};

pub struct AppState {
    pub store: Store,
    pub request_timeout: Duration,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::TransactionConflict => StatusCode::CONFLICT,
            ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::StorageFault => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "Storage fault");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody {
            success: false,
            error: self.message,
        })).into_response()
    }
}

/// Storage backends block, so every call leaves the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("worker failed: {}", e),
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub owner: String,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub owner: Option<String>,
    pub page_id: i64,
    pub page_size: i64,
}

impl PageQuery {
    fn bounds(&self) -> Result<(i64, i64), ApiError> {
        if self.page_id < 1 {
            return Err(ApiError::bad_request("page_id must be at least 1"));
        }
        if !(1..=100).contains(&self.page_size) {
            return Err(ApiError::bad_request("page_size must be between 1 and 100"));
        }
        let offset = (self.page_id - 1)
            .checked_mul(self.page_size)
            .ok_or_else(|| ApiError::bad_request("page_id is out of range"))?;
        Ok((self.page_size, offset))
    }
}

#[derive(Debug, Deserialize)]
pub struct AdjustBalanceRequest {
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct AdjustBalanceResponse {
    pub account: Account,
    pub entry: Entry,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
    pub currency: String,
}

fn require_id(id: i64) -> Result<i64, ApiError> {
    if id < 1 {
        return Err(ApiError::bad_request("id must be positive"));
    }
    Ok(id)
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let store = state.store.clone();
    let account = blocking(move || {
        store.create_account(&CreateAccountParams {
            owner: req.owner,
            currency: req.currency,
            balance: 0,
        })
    })
    .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_account(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<Json<Account>, ApiError> {
    let id = require_id(id)?;
    let store = state.store.clone();
    Ok(Json(blocking(move || store.get_account(id)).await?))
}

async fn list_accounts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<Account>>, ApiError> {
    let (limit, offset) = query.bounds()?;
    let store = state.store.clone();
    let params = ListAccountsParams {
        owner: query.owner,
        limit,
        offset,
    };
    Ok(Json(blocking(move || store.list_accounts(&params)).await?))
}

async fn adjust_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<AdjustBalanceRequest>,
) -> Result<Json<AdjustBalanceResponse>, ApiError> {
    let id = require_id(id)?;
    let store = state.store.clone();
    let ctx = TxContext::with_timeout(state.request_timeout);
    let (account, entry) = blocking(move || store.adjust_account_balance(&ctx, id, req.amount)).await?;
    Ok(Json(AdjustBalanceResponse { account, entry }))
}

async fn delete_account(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    let id = require_id(id)?;
    let store = state.store.clone();
    blocking(move || store.delete_account(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_entries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    let account_id = require_id(id)?;
    let (limit, offset) = query.bounds()?;
    let store = state.store.clone();
    let params = ListEntriesParams {
        account_id,
        limit,
        offset,
    };
    Ok(Json(blocking(move || store.list_entries(&params)).await?))
}

fn check_currency(account: &Account, currency: &str) -> Result<(), LedgerError> {
    if account.currency != currency {
        return Err(LedgerError::invalid(format!(
            "account {} currency mismatch: {} vs {}",
            account.id, account.currency, currency
        )));
    }
    Ok(())
}

async fn create_transfer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<TransferTxResult>, ApiError> {
    let params = TransferTxParams {
        from_account_id: req.from_account_id,
        to_account_id: req.to_account_id,
        amount: req.amount,
    };
    params.validate()?;

    let store = state.store.clone();
    let ctx = TxContext::with_timeout(state.request_timeout);
    let result = blocking(move || {
        store.policy().validate_currency(&req.currency)?;
        check_currency(&store.get_account(params.from_account_id)?, &req.currency)?;
        check_currency(&store.get_account(params.to_account_id)?, &req.currency)?;
        store.transfer_tx(&ctx, params)
    })
    .await?;
    Ok(Json(result))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router(state: Arc<AppState>, auth: Arc<AuthConfig>) -> Router {
    let protected = Router::new()
        .route("/accounts", post(create_account).get(list_accounts))
        .route(
            "/accounts/:id",
            get(get_account).post(adjust_account).delete(delete_account),
        )
        .route("/accounts/:id/entries", get(list_entries))
        .route("/transfers", post(create_transfer))
        .route_layer(middleware::from_fn(auth_middleware));

    let public = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics));

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(Extension(auth))
        .with_state(state)
}
