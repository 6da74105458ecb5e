pub mod health;
pub mod orders;
pub mod payments;
pub mod wallets;
pub mod warehouse;
pub mod withdrawals;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::errors::ServiceError;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Header the upstream auth layer sets to the authenticated user's id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller. The core never looks the user up by itself; the
/// id is passed explicitly into every service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(|user_id| AuthUser { user_id })
            .ok_or_else(|| {
                ServiceError::Unauthorized(format!("missing or invalid {} header", USER_ID_HEADER))
            })
    }
}

/// Operator endpoints are reserved for the platform account.
pub(crate) fn require_operator(state: &AppState, user: &AuthUser) -> Result<(), ServiceError> {
    if user.user_id != state.config.platform_user_id {
        return Err(ServiceError::Unauthorized(
            "operator access required".to_string(),
        ));
    }
    Ok(())
}
