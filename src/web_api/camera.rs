//! Camera handlers: list, snapshot, MJPEG stream, HLS control and the
//! camera registry.

use crate::acl::is_entity_allowed;
use crate::audit::{log_control, log_deny};
use crate::auth::AuthedClient;
use crate::camera::{CameraConfig, SnapshotOutcome};
use crate::error::{Error, Result};
use crate::state::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

fn require_camera_id(entity_id: &str) -> Result<()> {
    if entity_id.starts_with("camera.") {
        Ok(())
    } else {
        Err(Error::InvalidRequest("invalid_entity_id"))
    }
}

async fn require_allowed_camera(
    state: &AppState,
    client: &AuthedClient,
    entity_id: &str,
    service: &str,
) -> Result<()> {
    require_camera_id(entity_id)?;
    let entry = state.hub.entity(entity_id).await?;
    if entry.is_none() {
        return Err(Error::NotFound("camera_not_found"));
    }
    if !is_entity_allowed(entry.as_ref()) {
        log_deny(
            &client.client_id,
            entity_id,
            service,
            "entity_not_allowed",
            None,
            Some(client.source_ip),
        );
        return Err(Error::Forbidden("entity_not_allowed"));
    }
    Ok(())
}

// ---- list ---------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    capabilities: Option<bool>,
}

/// GET /api/smartly/camera/list
pub async fn list(
    State(state): State<AppState>,
    Extension(_client): Extension<AuthedClient>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>> {
    let include_capabilities = params.capabilities.unwrap_or(false);

    let cameras: Vec<String> = state
        .hub
        .entities()
        .await?
        .into_iter()
        .filter(|entry| is_entity_allowed(Some(entry)))
        .map(|entry| entry.entity_id)
        .filter(|id| id.starts_with("camera."))
        .collect();

    let mut rows = Vec::with_capacity(cameras.len());
    for entity_id in &cameras {
        let Some(snapshot) = state.hub.state(entity_id).await? else {
            continue;
        };

        let mut row = json!({
            "entity_id": entity_id,
            "name": snapshot.attributes.get("friendly_name").cloned()
                .unwrap_or_else(|| json!(entity_id)),
            "state": snapshot.state,
            "is_streaming": state.camera.hls_session(entity_id).await.is_some(),
            "brand": snapshot.attributes.get("brand").cloned().unwrap_or(Value::Null),
            "model": snapshot.attributes.get("model_name").cloned().unwrap_or(Value::Null),
        });

        if include_capabilities {
            let info = state.camera.hls_info(entity_id).await?;
            row["capabilities"] = info["capabilities"].clone();
            row["endpoints"] = info["endpoints"].clone();
        }
        rows.push(row);
    }

    Ok(Json(json!({
        "cameras": rows,
        "count": rows.len(),
        "cache_stats": state.camera.cache_stats().await,
        "hls_stats": state.camera.hls_stats().await,
    })))
}

// ---- snapshot -----------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotParams {
    refresh: Option<bool>,
}

/// GET /api/smartly/camera/{entity_id}/snapshot
pub async fn snapshot(
    State(state): State<AppState>,
    Extension(client): Extension<AuthedClient>,
    Path(entity_id): Path<String>,
    Query(params): Query<SnapshotParams>,
    headers: HeaderMap,
) -> Result<Response> {
    require_allowed_camera(&state, &client, &entity_id, "camera_snapshot").await?;

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    let force_refresh = params.refresh.unwrap_or(false);

    let outcome = state
        .camera
        .get_snapshot(&entity_id, force_refresh, if_none_match)
        .await?;

    match outcome {
        SnapshotOutcome::NotModified => Ok(Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .body(Body::empty())
            .unwrap()),
        SnapshotOutcome::Image(image) => {
            log_control(
                &client.client_id,
                &entity_id,
                "camera_snapshot",
                "success",
                None,
                Some(client.source_ip),
            );
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, image.content_type)
                .header(header::ETAG, image.etag)
                .header(
                    header::CACHE_CONTROL,
                    format!("private, max-age={}", state.camera.cache_ttl_secs()),
                )
                .header("X-Snapshot-Timestamp", image.captured_at.to_rfc3339())
                .body(Body::from(image.bytes))
                .unwrap())
        }
    }
}

// ---- MJPEG stream -------------------------------------------------------

/// GET /api/smartly/camera/{entity_id}/stream
///
/// The upstream multipart body is forwarded verbatim. Compression stays
/// off and the connection closes when the stream ends; re-framing the
/// multipart boundaries as HTTP chunks breaks downstream parsers.
pub async fn stream(
    State(state): State<AppState>,
    Extension(client): Extension<AuthedClient>,
    Path(entity_id): Path<String>,
) -> Result<Response> {
    require_allowed_camera(&state, &client, &entity_id, "camera_stream").await?;

    let body_stream = state.camera.mjpeg_stream(&entity_id).await?;

    log_control(
        &client.client_id,
        &entity_id,
        "camera_stream",
        "started",
        None,
        Some(client.source_ip),
    );

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace;boundary=frame",
        )
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .header(header::CONNECTION, "close")
        .body(Body::from_stream(body_stream))
        .unwrap())
}

// ---- HLS ----------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct HlsParams {
    action: Option<String>,
}

/// GET /api/smartly/camera/{entity_id}/stream/hls
pub async fn hls(
    State(state): State<AppState>,
    Extension(client): Extension<AuthedClient>,
    Path(entity_id): Path<String>,
    Query(params): Query<HlsParams>,
) -> Result<Json<Value>> {
    require_allowed_camera(&state, &client, &entity_id, "camera_hls").await?;

    match params.action.as_deref().unwrap_or("start") {
        "start" | "" => {
            let info = state.camera.start_hls(&entity_id).await?;
            log_control(
                &client.client_id,
                &entity_id,
                "camera_hls_start",
                "success",
                None,
                Some(client.source_ip),
            );
            Ok(Json(info))
        }
        "stop" => {
            if !state.camera.stop_hls(&entity_id).await {
                return Err(Error::NotFound("session_not_found"));
            }
            log_control(
                &client.client_id,
                &entity_id,
                "camera_hls_stop",
                "success",
                None,
                Some(client.source_ip),
            );
            Ok(Json(json!({ "success": true, "action": "stopped" })))
        }
        "info" => Ok(Json(state.camera.hls_info(&entity_id).await?)),
        "stats" => Ok(Json(state.camera.hls_stats().await)),
        _ => Err(Error::InvalidRequest("invalid_action")),
    }
}

// ---- registry -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ConfigRequest {
    action: Option<String>,
    entity_id: Option<String>,
    #[serde(flatten)]
    rest: Value,
}

/// POST /api/smartly/camera/config
pub async fn config(
    State(state): State<AppState>,
    Extension(client): Extension<AuthedClient>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: ConfigRequest =
        serde_json::from_slice(&body).map_err(|_| Error::InvalidRequest("invalid_json"))?;

    let Some(action) = request.action else {
        return Err(Error::InvalidRequest("missing_required_fields"));
    };

    match action.as_str() {
        "register" => {
            let Some(entity_id) = request.entity_id else {
                return Err(Error::InvalidRequest("missing_required_fields"));
            };
            require_camera_id(&entity_id)?;

            let mut config: CameraConfig = serde_json::from_value(request.rest)
                .map_err(|_| Error::InvalidRequest("invalid_service_data"))?;
            config.entity_id = entity_id.clone();
            state.camera.register_camera(config).await;

            log_control(
                &client.client_id,
                &entity_id,
                "camera_register",
                "success",
                None,
                Some(client.source_ip),
            );
            Ok(Json(json!({
                "success": true, "action": "registered", "entity_id": entity_id,
            })))
        }
        "unregister" => {
            let Some(entity_id) = request.entity_id else {
                return Err(Error::InvalidRequest("missing_required_fields"));
            };
            state.camera.unregister_camera(&entity_id).await;
            Ok(Json(json!({
                "success": true, "action": "unregistered", "entity_id": entity_id,
            })))
        }
        "clear_cache" => {
            let cleared = state.camera.clear_cache(request.entity_id.as_deref()).await;
            Ok(Json(json!({
                "success": true, "action": "cache_cleared", "cleared_count": cleared,
            })))
        }
        "list" => {
            let cameras = state.camera.list_registered().await;
            Ok(Json(json!({ "count": cameras.len(), "cameras": cameras })))
        }
        _ => Err(Error::InvalidRequest("invalid_action")),
    }
}
