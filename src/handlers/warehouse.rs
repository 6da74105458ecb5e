use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;
use crate::handlers::{AppState, AuthUser};
use crate::services::warehouse::{StockUnitsInput, UnitSummary};
use crate::{ApiResponse, ApiResult};

#[derive(Debug, Deserialize, Validate)]
pub struct StockUnitsRequest {
    pub shop_id: Uuid,
    pub stall_id: Uuid,
    #[validate(length(min = 1, max = 64, message = "Item type is required"))]
    pub item_type: String,
    #[validate(length(min = 1, max = 1000, message = "Between 1 and 1000 units per upload"))]
    pub payloads: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub product_id: Uuid,
    pub available: u64,
}

/// POST /api/v1/warehouse/products/:product_id/units
pub async fn stock_units(
    State(state): State<AppState>,
    seller: AuthUser,
    Path(product_id): Path<Uuid>,
    Json(request): Json<StockUnitsRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    request.validate()?;
    let units = state
        .services
        .warehouse
        .stock_units(StockUnitsInput {
            seller_id: seller.user_id,
            shop_id: request.shop_id,
            stall_id: request.stall_id,
            product_id,
            item_type: request.item_type,
            payloads: request.payloads,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(units))))
}

/// DELETE /api/v1/warehouse/units/:id
pub async fn delete_unit(
    State(state): State<AppState>,
    seller: AuthUser,
    Path(item_id): Path<Uuid>,
) -> ApiResult<UnitSummary> {
    let unit = state
        .services
        .warehouse
        .soft_delete_unit(seller.user_id, item_id)
        .await?;
    Ok(Json(ApiResponse::success(unit)))
}

/// GET /api/v1/warehouse/products/:product_id/available
pub async fn available_count(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> ApiResult<AvailabilityResponse> {
    let available = state.services.warehouse.available_count(product_id).await?;
    Ok(Json(ApiResponse::success(AvailabilityResponse {
        product_id,
        available,
    })))
}
