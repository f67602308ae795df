//! WebRTC signalling handlers.
//!
//! Token issuance requires HMAC authentication; the SDP exchange consumes
//! the token; ICE and hangup are authenticated by the session id alone.

use crate::acl::is_entity_allowed;
use crate::audit::{log_control, log_deny};
use crate::auth::AuthedClient;
use crate::error::{Error, Result};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
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

/// POST /api/smartly/camera/{entity_id}/webrtc (HMAC-protected)
pub async fn token(
    State(state): State<AppState>,
    Extension(client): Extension<AuthedClient>,
    Path(entity_id): Path<String>,
) -> Result<Json<Value>> {
    require_camera_id(&entity_id)?;

    let entry = state.hub.entity(&entity_id).await?;
    if !is_entity_allowed(entry.as_ref()) {
        log_deny(
            &client.client_id,
            &entity_id,
            "webrtc_token",
            "entity_not_allowed",
            None,
            Some(client.source_ip),
        );
        return Err(Error::Forbidden("entity_not_allowed"));
    }
    if state.hub.state(&entity_id).await?.is_none() {
        return Err(Error::NotFound("entity_not_found"));
    }

    let token = state.webrtc.issue_token(&entity_id, &client.client_id).await;

    log_control(
        &client.client_id,
        &entity_id,
        "webrtc_token",
        "success",
        None,
        Some(client.source_ip),
    );

    let expires_at = token.expires_at.timestamp();
    let expires_in = token.remaining_seconds();

    Ok(Json(json!({
        "token": token.token,
        "entity_id": entity_id,
        "expires_at": expires_at,
        "expires_in": expires_in,
        "offer_endpoint": format!("/api/smartly/camera/{entity_id}/webrtc/offer"),
        "ice_endpoint": format!("/api/smartly/camera/{entity_id}/webrtc/ice"),
        "hangup_endpoint": format!("/api/smartly/camera/{entity_id}/webrtc/hangup"),
        "ice_servers": state.webrtc.ice_servers(),
    })))
}

#[derive(Debug, Deserialize)]
struct OfferRequest {
    token: Option<String>,
    sdp: Option<String>,
    #[serde(rename = "type", default)]
    sdp_type: Option<String>,
}

/// POST /api/smartly/camera/{entity_id}/webrtc/offer (token-protected)
pub async fn offer(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    require_camera_id(&entity_id)?;

    let request: OfferRequest =
        serde_json::from_slice(&body).map_err(|_| Error::InvalidRequest("invalid_json"))?;

    let (Some(token_str), Some(sdp)) = (request.token, request.sdp) else {
        return Err(Error::InvalidRequest("missing_required_fields"));
    };
    if request.sdp_type.as_deref().unwrap_or("offer") != "offer" {
        return Err(Error::InvalidRequest("invalid_service_data"));
    }

    let token = match state.webrtc.consume_token(&token_str, &entity_id).await {
        Ok(token) => token,
        Err(err) => {
            log_deny(
                "unknown",
                &entity_id,
                "webrtc_offer",
                err.kind(),
                None,
                None,
            );
            return Err(err);
        }
    };

    let stream_source = state
        .hub
        .camera_stream_source(&entity_id)
        .await?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::upstream(
                "stream_source_not_found",
                format!("camera {entity_id} has no stream source"),
            )
        })?;

    let answer = state
        .go2rtc
        .exchange_offer(&entity_id, &stream_source, &sdp)
        .await?;

    let session = state
        .webrtc
        .create_session(&entity_id, &token.client_id)
        .await;

    log_control(
        &token.client_id,
        &entity_id,
        "webrtc_offer",
        "success",
        None,
        None,
    );

    Ok(Json(json!({
        "type": "answer",
        "sdp": answer,
        "session_id": session.session_id,
    })))
}

#[derive(Debug, Deserialize)]
struct IceRequest {
    session_id: Option<String>,
    candidate: Option<Value>,
}

/// POST /api/smartly/camera/{entity_id}/webrtc/ice (session-protected)
pub async fn ice(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    require_camera_id(&entity_id)?;

    let request: IceRequest =
        serde_json::from_slice(&body).map_err(|_| Error::InvalidRequest("invalid_json"))?;
    let Some(session_id) = request.session_id else {
        return Err(Error::InvalidRequest("missing_required_fields"));
    };

    state.webrtc.touch_session(&session_id, &entity_id).await?;

    if let Some(candidate) = &request.candidate {
        state.go2rtc.add_candidate(&entity_id, candidate).await?;
    }

    Ok(Json(json!({ "status": "accepted", "candidates": [] })))
}

#[derive(Debug, Deserialize)]
struct HangupRequest {
    session_id: Option<String>,
}

/// POST /api/smartly/camera/{entity_id}/webrtc/hangup (session-protected)
pub async fn hangup(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    require_camera_id(&entity_id)?;

    let request: HangupRequest =
        serde_json::from_slice(&body).map_err(|_| Error::InvalidRequest("invalid_json"))?;
    let Some(session_id) = request.session_id else {
        return Err(Error::InvalidRequest("missing_required_fields"));
    };

    let session = state.webrtc.remove_session(&session_id, &entity_id).await?;
    state.go2rtc.close_stream(&entity_id).await;

    log_control(
        &session.client_id,
        &entity_id,
        "webrtc_hangup",
        "success",
        None,
        None,
    );

    Ok(Json(json!({ "status": "closed" })))
}
