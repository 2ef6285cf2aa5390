//! Resource-action binding routes
//!
//! - GET /v1/resource-actions - List bindings
//! - POST /v1/resource-actions - Bind a (resource, action) pair to an ACL
//! - DELETE /v1/resource-actions - Remove a binding

use super::{acl_error_to_response, actor_from_headers};
use crate::server::AppState;
use alea_acl::ResourceAction;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/resource-actions",
            get(list_handler)
                .post(upsert_handler)
                .delete(delete_handler),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub resource_actions: Vec<ResourceAction>,
}

/// Request body for deleting a binding
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub resource_id: String,
    pub action_id: String,
}

/// GET /v1/resource-actions
#[instrument(skip(state))]
pub async fn list_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.store().list_resource_actions().await {
        Ok(resource_actions) => {
            (StatusCode::OK, Json(ListResponse { resource_actions })).into_response()
        }
        Err(e) => {
            error!("Failed to list resource actions: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// POST /v1/resource-actions
///
/// Creates the binding or rebinds the pair to another ACL.
#[instrument(skip(state, headers))]
pub async fn upsert_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(binding): Json<ResourceAction>,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    if let Err(e) = state
        .engine
        .authorize_resource_action_change(&actor, &binding.resource_id)
        .await
    {
        warn!("Binding change refused: {}", e);
        return acl_error_to_response(e).into_response();
    }

    match state.engine.upsert_resource_action(&binding).await {
        Ok(()) => {
            info!("Bound {} by {}", binding, actor);
            (StatusCode::OK, Json(binding)).into_response()
        }
        Err(e) => {
            error!("Failed to bind resource action: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// DELETE /v1/resource-actions
#[instrument(skip(state, headers))]
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DeleteRequest>,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    if let Err(e) = state
        .engine
        .authorize_resource_action_change(&actor, &request.resource_id)
        .await
    {
        warn!("Binding removal refused: {}", e);
        return acl_error_to_response(e).into_response();
    }

    match state
        .engine
        .delete_resource_action(&request.resource_id, &request.action_id)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("Failed to delete resource action: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}
