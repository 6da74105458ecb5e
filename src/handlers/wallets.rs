use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;
use crate::handlers::{require_operator, AppState, AuthUser};
use crate::entities::wallet_deposit;
use crate::services::wallet::{PostingOutcome, WalletSnapshot};
use crate::{ApiResponse, ApiResult};

#[derive(Debug, Deserialize, Validate)]
pub struct CreditRequest {
    pub amount: Decimal,
    #[validate(length(min = 1, max = 128, message = "Reference id is required"))]
    pub reference_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct CreditResponse {
    pub outcome: PostingOutcome,
    pub wallet: WalletSnapshot,
}

/// GET /api/v1/wallets/:user_id
pub async fn get_wallet(
    State(state): State<AppState>,
    user: AuthUser,
    Path(user_id): Path<Uuid>,
) -> ApiResult<WalletSnapshot> {
    if user.user_id != user_id {
        require_operator(&state, &user)?;
    }
    let snapshot = state.services.wallet.snapshot(user_id).await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// POST /api/v1/wallets/:user_id/credits
///
/// Operator top-up. Replaying the same `reference_id` changes nothing.
pub async fn credit_wallet(
    State(state): State<AppState>,
    user: AuthUser,
    Path(user_id): Path<Uuid>,
    Json(request): Json<CreditRequest>,
) -> ApiResult<CreditResponse> {
    require_operator(&state, &user)?;
    request.validate()?;
    if request.amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "amount must be positive".to_string(),
        ));
    }

    let outcome = state
        .services
        .wallet
        .credit_wallet(user_id, request.amount, &format!("TOPUP:{}", request.reference_id))
        .await?;
    let wallet = state.services.wallet.snapshot(user_id).await?;
    Ok(Json(ApiResponse::success(CreditResponse { outcome, wallet })))
}

/// POST /api/v1/deposits
///
/// Opens a provider-funded top-up for the caller. The provider callback
/// settles it through the payments endpoint.
pub async fn initiate_deposit(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<DepositRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let deposit = state
        .services
        .deposits
        .initiate(user.user_id, request.amount)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(deposit))))
}

/// GET /api/v1/deposits/:code
pub async fn get_deposit(
    State(state): State<AppState>,
    user: AuthUser,
    Path(code): Path<String>,
) -> ApiResult<wallet_deposit::Model> {
    let deposit = state.services.deposits.get_by_code(&code).await?;
    if deposit.user_id != user.user_id {
        return Err(ServiceError::NotFound(format!("Deposit {} not found", code)));
    }
    Ok(Json(ApiResponse::success(deposit)))
}
