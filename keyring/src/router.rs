//! HTTP router for the keyring service

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use keyring_keystore::{secrets_router, KeystoreState};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the main application router
pub fn create_router(state: Arc<KeystoreState>) -> Router {
    Router::new()
        // Health check endpoint
        .route("/health", get(health_check))
        .merge(secrets_router(state))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"running"}"#,
    )
}
