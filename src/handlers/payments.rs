use axum::{
    extract::{Form, Query, State},
    response::Json,
};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::payment_gateway::CallbackAck;

/// Acknowledgement body the provider expects back.
#[derive(Debug, Serialize)]
pub struct ProviderAck {
    #[serde(rename = "RspCode")]
    pub rsp_code: &'static str,
    #[serde(rename = "Message")]
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CallbackAck>,
}

impl From<CallbackAck> for ProviderAck {
    fn from(ack: CallbackAck) -> Self {
        Self {
            rsp_code: "00",
            message: "Confirm Success",
            result: Some(ack),
        }
    }
}

async fn handle(
    state: &AppState,
    params: BTreeMap<String, String>,
) -> Result<Json<ProviderAck>, ServiceError> {
    let ack = state.services.gateway.handle_callback(&params).await?;
    Ok(Json(ProviderAck::from(ack)))
}

/// GET /api/v1/payments/callback
pub async fn callback_query(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<ProviderAck>, ServiceError> {
    handle(&state, params).await
}

/// POST /api/v1/payments/callback
pub async fn callback_form(
    State(state): State<AppState>,
    Form(params): Form<BTreeMap<String, String>>,
) -> Result<Json<ProviderAck>, ServiceError> {
    handle(&state, params).await
}
