//! ACL API Routes
//!
//! - GET /v1/acl - List ACL ids
//! - POST /v1/acl - Create an ACL
//! - GET /v1/acl/:id - ACL definition and direct members
//! - PUT /v1/acl/:id - Update an ACL definition
//! - DELETE /v1/acl/:id - Delete an ACL
//! - GET /v1/acl/:id/members - Flattened user members
//! - POST /v1/acl/:id/members - Add or remove a direct member
//! - GET /v1/acl/:id/members/:user - Membership check
//! - POST /v1/acl/check - Resource access check for the caller
//! - POST /v1/acl/check-any - Access check over templated resources
//! - POST /v1/acl/recompute - Rebuild the whole cache

use super::{acl_error_to_response, actor_from_headers};
use crate::server::AppState;
use alea_acl::{AclUpdate, Member, NewAcl, ResourceActionParams};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Create the ACL router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/acl", get(list_handler).post(create_handler))
        .route("/v1/acl/check", post(check_handler))
        .route("/v1/acl/check-any", post(check_any_handler))
        .route("/v1/acl/recompute", post(recompute_handler))
        .route(
            "/v1/acl/:id",
            get(details_handler)
                .put(update_handler)
                .delete(delete_handler),
        )
        .route(
            "/v1/acl/:id/members",
            get(members_handler).post(membership_handler),
        )
        .route("/v1/acl/:id/members/:user", get(is_member_handler))
        .with_state(state)
}

// === Request/Response Types ===

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IsMemberResponse {
    pub is_member: bool,
}

#[derive(Debug, Serialize)]
pub struct MembersResponse {
    pub members: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub acl_ids: Vec<String>,
}

/// Request body for a resource access check
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub resource_id: String,
    pub action_id: String,
}

/// Request body for a check over templated resources
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAnyRequest {
    pub resource_actions: Vec<ResourceActionParams>,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
}

/// Request body for adding or removing a direct member
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRequest {
    pub member_id: String,
    #[serde(default)]
    pub is_acl_member: bool,
    pub to_be_added: bool,
}

impl MembershipRequest {
    fn member(&self) -> Member {
        if self.is_acl_member {
            Member::Acl(self.member_id.clone())
        } else {
            Member::User(self.member_id.clone())
        }
    }
}

// === Handlers ===

/// GET /v1/acl/:id/members/:user
///
/// Callers may ask about themselves, or about anyone in an ACL they can view.
#[instrument(skip(state, headers))]
pub async fn is_member_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((acl_id, user_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    match state
        .engine
        .check_membership_as(&actor, &acl_id, &user_id)
        .await
    {
        Ok(is_member) => (StatusCode::OK, Json(IsMemberResponse { is_member })).into_response(),
        Err(e) => {
            error!("Membership check failed: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// POST /v1/acl/check
///
/// Whether the caller may perform the action on the resource.
#[instrument(skip(state, headers))]
pub async fn check_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CheckRequest>,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    match state
        .engine
        .check_resource_access(&request.resource_id, &request.action_id, &actor)
        .await
    {
        Ok(allowed) => {
            debug!(allowed, "Resource access check");
            (StatusCode::OK, Json(CheckResponse { allowed })).into_response()
        }
        Err(e) => {
            error!("Resource access check failed: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// POST /v1/acl/check-any
///
/// Whether the caller is authorized for at least one templated resource.
#[instrument(skip(state, headers, request))]
pub async fn check_any_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CheckAnyRequest>,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    match state
        .engine
        .is_authorized_for_any(&actor, &request.resource_actions)
        .await
    {
        Ok(allowed) => (StatusCode::OK, Json(CheckResponse { allowed })).into_response(),
        Err(e) => {
            warn!("Rejected check-any request: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// GET /v1/acl
#[instrument(skip(state))]
pub async fn list_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.store().list_acl_ids().await {
        Ok(acl_ids) => (StatusCode::OK, Json(ListResponse { acl_ids })).into_response(),
        Err(e) => {
            error!("Failed to list ACLs: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// GET /v1/acl/:id
#[instrument(skip(state, headers))]
pub async fn details_handler(
    State(state): State<Arc<AppState>>,
    Path(acl_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    match state.engine.acl_details(&actor, &acl_id).await {
        Ok(details) => (StatusCode::OK, Json(details)).into_response(),
        Err(e) => {
            warn!("ACL details refused: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// GET /v1/acl/:id/members
///
/// Flattened user members, visible to whoever may view the ACL.
#[instrument(skip(state, headers))]
pub async fn members_handler(
    State(state): State<Arc<AppState>>,
    Path(acl_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    if let Err(e) = state.engine.acl_details(&actor, &acl_id).await {
        warn!("Member listing refused: {}", e);
        return acl_error_to_response(e).into_response();
    }

    match state.engine.flattened_members(&acl_id).await {
        Ok(members) => (StatusCode::OK, Json(MembersResponse { members })).into_response(),
        Err(e) => {
            error!("Failed to flatten members: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// POST /v1/acl
#[instrument(skip(state, headers, request), fields(acl_id = %request.id))]
pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<NewAcl>,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    if let Err(e) = state.engine.authorize_acl_create(&actor, &request).await {
        warn!("ACL creation refused: {}", e);
        return acl_error_to_response(e).into_response();
    }

    match state.engine.create_acl(&request).await {
        Ok(acl) => {
            info!("ACL created by {}", actor);
            (StatusCode::CREATED, Json(acl)).into_response()
        }
        Err(e) => {
            error!("Failed to create ACL: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// PUT /v1/acl/:id
#[instrument(skip(state, headers, update))]
pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Path(acl_id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<AclUpdate>,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    if let Err(e) = state.engine.authorize_acl_update(&actor, &acl_id).await {
        warn!("ACL update refused: {}", e);
        return acl_error_to_response(e).into_response();
    }

    match state.engine.update_acl(&acl_id, &update).await {
        Ok(acl) => (StatusCode::OK, Json(acl)).into_response(),
        Err(e) => {
            error!("Failed to update ACL: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// DELETE /v1/acl/:id
#[instrument(skip(state, headers))]
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(acl_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    if let Err(e) = state.engine.authorize_acl_update(&actor, &acl_id).await {
        warn!("ACL deletion refused: {}", e);
        return acl_error_to_response(e).into_response();
    }

    match state.engine.delete_acl(&acl_id).await {
        Ok(()) => {
            info!("ACL deleted by {}", actor);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            error!("Failed to delete ACL: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

/// POST /v1/acl/:id/members
#[instrument(skip(state, headers, request))]
pub async fn membership_handler(
    State(state): State<Arc<AppState>>,
    Path(acl_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<MembershipRequest>,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };
    let member = request.member();

    if let Err(e) = state
        .engine
        .authorize_membership_change(&actor, &acl_id, &member, request.to_be_added)
        .await
    {
        warn!("Membership change refused: {}", e);
        return acl_error_to_response(e).into_response();
    }

    if request.to_be_added {
        match state.engine.add_member(&acl_id, &member).await {
            Ok(edge) => (StatusCode::CREATED, Json(edge)).into_response(),
            Err(e) => {
                error!("Failed to add member: {}", e);
                acl_error_to_response(e).into_response()
            }
        }
    } else {
        match state.engine.remove_member(&acl_id, &member).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => {
                error!("Failed to remove member: {}", e);
                acl_error_to_response(e).into_response()
            }
        }
    }
}

/// POST /v1/acl/recompute
#[instrument(skip(state, headers))]
pub async fn recompute_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(response) => return response,
    };

    if let Err(e) = state.engine.authorize_recompute(&actor).await {
        warn!("Recompute refused: {}", e);
        return acl_error_to_response(e).into_response();
    }

    match state.engine.recompute_all().await {
        Ok(report) => {
            info!(acls = report.acls, "Recompute requested by {}", actor);
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => {
            error!("Recompute failed: {}", e);
            acl_error_to_response(e).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::create_test_state;
    use alea_acl::SYS_ADMIN_ACL;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn request(method: &str, uri: &str, actor: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json");
        if let Some(actor) = actor {
            builder = builder.header("X-User-Id", actor);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_check_membership() {
        let app = router(create_test_state().await);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/acl",
                Some("alice"),
                r#"{
                    "id": "staff",
                    "updaterACLId": "staff",
                    "memberUserIds": ["alice"]
                }"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = json_body(response).await;
        assert_eq!(json["id"], "staff");
        assert_eq!(json["updaterACLId"], "staff");

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/acl/staff/members/alice", Some("alice"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["isMember"], true);

        let response = app
            .oneshot(request("GET", "/v1/acl/staff/members/bob", Some("alice"), ""))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["isMember"], false);
    }

    #[tokio::test]
    async fn test_missing_user_header_is_unauthorized() {
        let app = router(create_test_state().await);

        let response = app
            .oneshot(request(
                "POST",
                "/v1/acl/check",
                None,
                r#"{"resourceId": "/r", "actionId": "READ"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_membership_check_respects_visibility() {
        let state = create_test_state().await;
        state
            .engine
            .create_acl(&NewAcl::new("council", "council").with_user("carol"))
            .await
            .unwrap();
        state
            .engine
            .create_acl(&NewAcl::new("lounge", "council").open().with_user("dave"))
            .await
            .unwrap();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/acl/council/members/carol", None, ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/acl/council/members/carol", Some("mallory"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Asking about oneself is always allowed
        let response = app
            .clone()
            .oneshot(request("GET", "/v1/acl/council/members/mallory", Some("mallory"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["isMember"], false);

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/acl/lounge/members/dave", Some("mallory"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["isMember"], true);

        let response = app
            .oneshot(request("GET", "/v1/acl/nowhere/members/dave", Some("mallory"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_requires_updater_membership() {
        let state = create_test_state().await;
        state
            .engine
            .create_acl(&NewAcl::new("owners", "owners").with_user("alice"))
            .await
            .unwrap();
        state
            .engine
            .create_acl(&NewAcl::new("readers", "owners"))
            .await
            .unwrap();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                "/v1/acl/readers",
                Some("mallory"),
                r#"{"isOpen": true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["error"], "permission_denied");

        let response = app
            .oneshot(request(
                "PUT",
                "/v1/acl/readers",
                Some("alice"),
                r#"{"isOpen": true, "description": "Course readers"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["isOpen"], true);
        assert_eq!(json["description"], "Course readers");
    }

    #[tokio::test]
    async fn test_self_join_open_acl_and_leave() {
        let state = create_test_state().await;
        state
            .engine
            .create_acl(&NewAcl::new("club", "club").open())
            .await
            .unwrap();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/acl/club/members",
                Some("bob"),
                r#"{"memberId": "bob", "isAclMember": false, "toBeAdded": true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(state.engine.is_member_of_acl("club", "bob").await);

        // Joining on someone else's behalf is an updater's job
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/v1/acl/club/members",
                Some("bob"),
                r#"{"memberId": "carol", "isAclMember": false, "toBeAdded": true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(request(
                "POST",
                "/v1/acl/club/members",
                Some("bob"),
                r#"{"memberId": "bob", "isAclMember": false, "toBeAdded": false}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!state.engine.is_member_of_acl("club", "bob").await);
    }

    #[tokio::test]
    async fn test_details_and_flattened_members() {
        let state = create_test_state().await;
        state
            .engine
            .create_acl(&NewAcl::new("inner", "inner").with_user("u1"))
            .await
            .unwrap();
        state
            .engine
            .create_acl(&NewAcl::new("outer", "outer").with_acl("inner").with_user("u2"))
            .await
            .unwrap();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/acl/outer", Some("u1"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["id"], "outer");
        assert_eq!(json["members"].as_array().unwrap().len(), 2);

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/acl/outer/members", Some("u2"), ""))
            .await
            .unwrap();
        assert_eq!(
            json_body(response).await["members"],
            serde_json::json!(["u1", "u2"])
        );

        let response = app
            .clone()
            .oneshot(request("GET", "/v1/acl/outer", Some("stranger"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(request("GET", "/v1/acl/missing", Some("u1"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_check_any_rejects_invalid_action() {
        let app = router(create_test_state().await);

        let response = app
            .oneshot(request(
                "POST",
                "/v1/acl/check-any",
                Some("alice"),
                r#"{"resourceActions": [
                    {"name": "JOB_PORTAL", "action": "TAKE"}
                ]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["error"], "invalid_action");
    }

    #[tokio::test]
    async fn test_recompute_is_restricted_to_sys_admins() {
        let state = create_test_state().await;
        state
            .engine
            .create_acl(&NewAcl::new(SYS_ADMIN_ACL, SYS_ADMIN_ACL).with_user("root"))
            .await
            .unwrap();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(request("POST", "/v1/acl/recompute", Some("alice"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(request("POST", "/v1/acl/recompute", Some("root"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["acls"], 1);
    }

    #[tokio::test]
    async fn test_delete_acl() {
        let state = create_test_state().await;
        state
            .engine
            .create_acl(&NewAcl::new("temp", "temp").with_user("alice"))
            .await
            .unwrap();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(request("DELETE", "/v1/acl/temp", Some("alice"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!state.engine.is_member_of_acl("temp", "alice").await);

        let response = app
            .oneshot(request("DELETE", "/v1/acl/temp", Some("alice"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
