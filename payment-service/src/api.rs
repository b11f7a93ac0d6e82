use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accounts::AccountOpening;
use crate::ledger::{Ledger, LedgerError, PgLedger};
use crate::models::BalanceView;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger<PgLedger>>,
    pub accounts: PgLedger,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub amount: BigDecimal,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::InvalidAmount(_) | LedgerError::InsufficientFunds => StatusCode::BAD_REQUEST,
            LedgerError::AccountNotFound => StatusCode::NOT_FOUND,
            LedgerError::ConcurrencyExhausted { .. } => StatusCode::CONFLICT,
            LedgerError::Store(_) => {
                tracing::error!("Ledger storage failure: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError(status, err.to_string())
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/accounts", post(create_account))
        .route("/api/accounts/:id/topup", post(top_up))
        .route("/api/accounts/:id/balance", get(get_balance))
        .route("/api/accounts/by-user/:user_id/balance", get(get_balance_by_user))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<BalanceView>), ApiError> {
    match state.accounts.open_account(request.user_id).await? {
        AccountOpening::Opened(view) => Ok((StatusCode::CREATED, Json(view))),
        AccountOpening::Existing(view) => Ok((StatusCode::CONFLICT, Json(view))),
    }
}

pub async fn top_up(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<TopUpRequest>,
) -> Result<Json<BalanceView>, ApiError> {
    let view = state.ledger.top_up(account_id, &request.amount).await?;
    Ok(Json(view))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<BalanceView>, ApiError> {
    state
        .accounts
        .balance(account_id)
        .await?
        .map(Json)
        .ok_or_else(|| LedgerError::AccountNotFound.into())
}

pub async fn get_balance_by_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<BalanceView>, ApiError> {
    state
        .accounts
        .balance_by_user(user_id)
        .await?
        .map(Json)
        .ok_or_else(|| LedgerError::AccountNotFound.into())
}

pub async fn health_check() -> &'static str {
    "OK"
}
