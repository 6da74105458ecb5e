use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::handlers::{AppState, AuthUser};
use crate::services::orders::{BuyerOrderView, OrderStatusView};
use crate::services::settlement::{CheckoutRequest, TransitionOutcome};
use crate::{ApiResponse, ApiResult};

fn not_found(order_id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!("Order {} not found", order_id))
}

/// POST /api/v1/checkout
pub async fn checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let receipt = state
        .services
        .settlement
        .checkout(user.user_id, request)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(receipt))))
}

/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<BuyerOrderView> {
    let view = state
        .services
        .orders
        .get_buyer_view(order_id, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(view)))
}

/// GET /api/v1/orders/:id/status
pub async fn get_order_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderStatusView> {
    let view = state.services.orders.get_order_with_items(order_id).await?;
    if view.order.buyer_id != user.user_id {
        return Err(not_found(order_id));
    }
    Ok(Json(ApiResponse::success(OrderStatusView::from(&view.order))))
}

/// POST /api/v1/orders/:id/cancel
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<TransitionOutcome> {
    let outcome = state
        .services
        .settlement
        .cancel_order(order_id, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// POST /api/v1/orders/:id/confirm
///
/// Settles a wallet order now instead of waiting for the queue worker.
pub async fn confirm_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderStatusView> {
    let view = state.services.orders.get_order_with_items(order_id).await?;
    if view.order.buyer_id != user.user_id {
        return Err(not_found(order_id));
    }
    state.services.gateway.confirm_internal(order_id).await?;
    let status = state.services.settlement.get_status(order_id).await?;
    Ok(Json(ApiResponse::success(status)))
}

/// POST /api/v1/orders/:id/items/:item_id/refund
pub async fn refund_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path((order_id, item_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<OrderStatusView> {
    let view = state.services.orders.get_order_with_items(order_id).await?;
    let item = view
        .items
        .iter()
        .find(|i| i.id == item_id)
        .ok_or_else(|| ServiceError::NotFound(format!("Order item {} not found", item_id)))?;
    // Sellers refund their own items; the platform account may refund any
    if item.seller_id != user.user_id && user.user_id != state.config.platform_user_id {
        return Err(ServiceError::Unauthorized(
            "only the seller or an operator can refund this item".to_string(),
        ));
    }

    let status = state
        .services
        .settlement
        .refund_item(order_id, item_id, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(status)))
}
