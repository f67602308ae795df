//! WebAPI - HTTP surface
//!
//! ## Responsibilities
//!
//! - Route assembly under the `/api/smartly` prefix
//! - HMAC middleware on the protected surface
//! - Health endpoint

mod auth_layer;
mod camera;
mod control;
mod history;
mod sync;
mod webrtc;

pub use auth_layer::require_auth;

use crate::state::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

/// Health check endpoint (unauthenticated; not part of the bridge API)
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let go2rtc_ok = state.go2rtc.health_check().await;

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": state.credentials().instance_id.clone(),
        "go2rtc_connected": go2rtc_ok,
    }))
}

/// Create API router
pub fn create_router(state: AppState) -> Router {
    // every route here goes through the HMAC gate
    let protected = Router::new()
        .route("/api/smartly/control", post(control::control))
        .route("/api/smartly/sync/structure", get(sync::structure))
        .route("/api/smartly/sync/states", get(sync::states))
        .route("/api/smartly/history/batch", post(history::batch))
        .route("/api/smartly/history/statistics", post(history::statistics))
        .route("/api/smartly/history/:entity_id", get(history::single))
        .route("/api/smartly/camera/list", get(camera::list))
        .route("/api/smartly/camera/config", post(camera::config))
        .route("/api/smartly/camera/:entity_id/snapshot", get(camera::snapshot))
        .route("/api/smartly/camera/:entity_id/stream", get(camera::stream))
        .route("/api/smartly/camera/:entity_id/stream/hls", get(camera::hls))
        .route("/api/smartly/camera/:entity_id/webrtc", post(webrtc::token))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // the token is the capability for the SDP exchange, the session id for
    // ICE and hangup; no HMAC re-authentication on these
    let signalling = Router::new()
        .route(
            "/api/smartly/camera/:entity_id/webrtc/offer",
            post(webrtc::offer),
        )
        .route(
            "/api/smartly/camera/:entity_id/webrtc/ice",
            post(webrtc::ice),
        )
        .route(
            "/api/smartly/camera/:entity_id/webrtc/hangup",
            post(webrtc::hangup),
        );

    Router::new()
        .route("/healthz", get(health_check))
        .merge(protected)
        .merge(signalling)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
