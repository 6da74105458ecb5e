//! Keymart settlement core
//!
//! Race-free inventory claims, wallet holds, order settlement, payment
//! reconciliation and expiry reaping for a digital-goods marketplace.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod clock;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod services;
pub mod tracing;

use axum::{
    http::Method,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: services::AppServices,
}

// Common response wrappers
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    let orders = Router::new()
        .route("/checkout", post(handlers::orders::checkout))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route("/orders/:id/status", get(handlers::orders::get_order_status))
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        .route("/orders/:id/confirm", post(handlers::orders::confirm_order))
        .route(
            "/orders/:id/items/:item_id/refund",
            post(handlers::orders::refund_item),
        );

    let warehouse = Router::new()
        .route(
            "/warehouse/products/:product_id/units",
            post(handlers::warehouse::stock_units),
        )
        .route(
            "/warehouse/products/:product_id/available",
            get(handlers::warehouse::available_count),
        )
        .route("/warehouse/units/:id", delete(handlers::warehouse::delete_unit));

    let wallets = Router::new()
        .route("/wallets/:user_id", get(handlers::wallets::get_wallet))
        .route(
            "/wallets/:user_id/credits",
            post(handlers::wallets::credit_wallet),
        )
        .route("/deposits", post(handlers::wallets::initiate_deposit))
        .route("/deposits/:code", get(handlers::wallets::get_deposit));

    let withdrawals = Router::new()
        .route(
            "/withdrawals",
            get(handlers::withdrawals::list_withdrawals)
                .post(handlers::withdrawals::request_withdrawal),
        )
        .route(
            "/withdrawals/:id/cancel",
            post(handlers::withdrawals::cancel_withdrawal),
        )
        .route("/admin/withdrawals", get(handlers::withdrawals::review_queue))
        .route(
            "/admin/withdrawals/:id/approve",
            post(handlers::withdrawals::approve_withdrawal),
        )
        .route(
            "/admin/withdrawals/:id/reject",
            post(handlers::withdrawals::reject_withdrawal),
        );

    let payments = Router::new().route(
        "/payments/callback",
        get(handlers::payments::callback_query).post(handlers::payments::callback_form),
    );

    Router::new()
        .merge(orders)
        .merge(warehouse)
        .merge(wallets)
        .merge(withdrawals)
        .merge(payments)
}

/// Full application router with the HTTP middleware stack applied.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .merge(handlers::health::health_routes())
        .nest("/api/v1", api_v1_routes())
        .layer(crate::tracing::configure_http_tracing())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CompressionLayer::new())
        .layer(cors)
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            crate::tracing::request_id_middleware,
        ))
        .with_state(state)
}
