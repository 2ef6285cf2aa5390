use alea_acl::{AclEngine, Database};
use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

mod routes;

/// Server application state
pub struct AppState {
    /// Authorization engine shared by every handler
    pub engine: AclEngine,
    /// Backing database, kept for health checks
    pub db: Arc<Database>,
}

impl AppState {
    pub fn new(engine: AclEngine, db: Arc<Database>) -> Self {
        Self { engine, db }
    }
}

/// Start the HTTP server
pub async fn start(addr: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let app = create_router(state);

    info!("Starting Axum HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .merge(routes::acl::router(state.clone()))
        .merge(routes::resource_actions::router(state))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

/// Database and cache reachability (for load balancers)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match state.db.health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!("Health check: database error: {}", e);
            false
        }
    };

    let cache = match state.engine.cache().ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Health check: cache error: {}", e);
            false
        }
    };

    let healthy = database && cache;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "service": "alea-acl-server",
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
            "cache": cache,
            "cacheBackend": state.engine.cache().backend_name(),
        })),
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(test_support::create_test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["status"], "healthy");
        assert_eq!(json["database"], true);
        assert_eq!(json["cache"], true);
    }
}
