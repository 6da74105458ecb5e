use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::time::Instant;

use crate::handlers::AppState;

/// Tracks application start time for uptime calculation
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

fn get_uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

/// Liveness plus a database ping. 503 when the database is unreachable.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let start = Instant::now();
    let db_result = crate::db::check_connection(&state.db).await;
    let db_latency = start.elapsed().as_millis() as u64;

    let (status_code, status, database) = match db_result {
        Ok(()) => (
            StatusCode::OK,
            "up",
            json!({ "status": "up", "latency_ms": db_latency }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "down",
            json!({ "status": "down", "error": e.to_string() }),
        ),
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": get_uptime_secs(),
            "checks": { "database": database },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
