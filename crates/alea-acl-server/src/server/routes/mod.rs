//! HTTP routes over the ACL engine
//!
//! The caller's identity arrives in the `X-User-Id` header, set by the
//! authenticating proxy in front of this service.

use alea_acl::AclError;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::warn;

pub mod acl;
pub mod resource_actions;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// Convert AclError to HTTP response
pub fn acl_error_to_response(err: AclError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, error_code) = match &err {
        AclError::Denied(_) => (StatusCode::FORBIDDEN, "permission_denied"),
        AclError::AclNotFound(_) => (StatusCode::NOT_FOUND, "acl_not_found"),
        AclError::MembershipNotFound(_) => (StatusCode::NOT_FOUND, "membership_not_found"),
        AclError::ResourceActionNotFound { .. } => {
            (StatusCode::NOT_FOUND, "resource_action_not_found")
        }
        AclError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
        AclError::InvalidAcl(_) => (StatusCode::BAD_REQUEST, "invalid_acl"),
        AclError::InvalidResource(_) => (StatusCode::BAD_REQUEST, "invalid_resource"),
        AclError::InvalidMembership(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_membership"),
        AclError::InvalidAction { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_action"),
        AclError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        AclError::Cache(_) => (StatusCode::SERVICE_UNAVAILABLE, "cache_unavailable"),
    };

    (
        status,
        Json(ErrorResponse::new(error_code, &err.to_string())),
    )
}

/// The calling user, or a 401 response
#[allow(clippy::result_large_err)]
pub fn actor_from_headers(headers: &HeaderMap) -> Result<String, Response> {
    let actor = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match actor {
        Some(actor) => Ok(actor.to_string()),
        None => {
            warn!("Request without {} header", USER_ID_HEADER);
            Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new(
                    "unauthenticated",
                    "missing X-User-Id header",
                )),
            )
                .into_response())
        }
    }
}
