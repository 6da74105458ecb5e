use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::entities::withdraw_request;
use crate::errors::ServiceError;
use crate::handlers::{require_operator, AppState, AuthUser};
use crate::services::withdrawals::WithdrawInput;
use crate::{ApiResponse, ApiResult};

const DEFAULT_REVIEW_PAGE: u64 = 50;

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewQuery {
    pub limit: Option<u64>,
}

/// POST /api/v1/withdrawals
pub async fn request_withdrawal(
    State(state): State<AppState>,
    seller: AuthUser,
    Json(input): Json<WithdrawInput>,
) -> Result<impl IntoResponse, ServiceError> {
    let request = state
        .services
        .withdrawals
        .request(seller.user_id, input)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(request))))
}

/// GET /api/v1/withdrawals
pub async fn list_withdrawals(
    State(state): State<AppState>,
    seller: AuthUser,
) -> ApiResult<Vec<withdraw_request::Model>> {
    let requests = state.services.withdrawals.for_user(seller.user_id).await?;
    Ok(Json(ApiResponse::success(requests)))
}

/// POST /api/v1/withdrawals/:id/cancel
pub async fn cancel_withdrawal(
    State(state): State<AppState>,
    seller: AuthUser,
    Path(request_id): Path<Uuid>,
) -> ApiResult<withdraw_request::Model> {
    let request = state
        .services
        .withdrawals
        .cancel(request_id, seller.user_id)
        .await?;
    Ok(Json(ApiResponse::success(request)))
}

/// GET /api/v1/admin/withdrawals
pub async fn review_queue(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ReviewQuery>,
) -> ApiResult<Vec<withdraw_request::Model>> {
    require_operator(&state, &user)?;
    let limit = query.limit.unwrap_or(DEFAULT_REVIEW_PAGE).clamp(1, 500);
    let requests = state.services.withdrawals.pending(limit).await?;
    Ok(Json(ApiResponse::success(requests)))
}

/// POST /api/v1/admin/withdrawals/:id/approve
pub async fn approve_withdrawal(
    State(state): State<AppState>,
    user: AuthUser,
    Path(request_id): Path<Uuid>,
) -> ApiResult<withdraw_request::Model> {
    require_operator(&state, &user)?;
    let request = state
        .services
        .withdrawals
        .approve(request_id, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(request)))
}

/// POST /api/v1/admin/withdrawals/:id/reject
pub async fn reject_withdrawal(
    State(state): State<AppState>,
    user: AuthUser,
    Path(request_id): Path<Uuid>,
    body: Option<Json<RejectRequest>>,
) -> ApiResult<withdraw_request::Model> {
    require_operator(&state, &user)?;
    let note = body.and_then(|Json(b)| b.note);
    let request = state
        .services
        .withdrawals
        .reject(request_id, user.user_id, note)
        .await?;
    Ok(Json(ApiResponse::success(request)))
}
