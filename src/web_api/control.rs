//! Control handler: invoke a hub service on one entity.

use crate::acl::{entity_domain, is_entity_allowed, is_service_allowed, is_valid_entity_id};
use crate::audit::{log_control, log_deny, Actor};
use crate::auth::AuthedClient;
use crate::error::{Error, Result};
use crate::formatting::{decimal_places, format_numeric_attributes, format_state_value};
use crate::hub::StateSnapshot;
use crate::state::AppState;
use axum::{body::Bytes, extract::State, Extension, Json};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// A short pause after the service call so the new state has propagated.
const STATE_SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct ControlRequest {
    entity_id: Option<String>,
    action: Option<String>,
    #[serde(default)]
    service_data: Option<Value>,
    #[serde(default)]
    actor: Option<Actor>,
}

fn formatted_state(snapshot: &StateSnapshot) -> (Value, Map<String, Value>) {
    let device_class = snapshot
        .attributes
        .get("device_class")
        .and_then(Value::as_str)
        .unwrap_or("");
    let unit = snapshot
        .attributes
        .get("unit_of_measurement")
        .and_then(Value::as_str)
        .unwrap_or("");
    let places = decimal_places(device_class, unit);
    (
        format_state_value(&snapshot.state, places),
        format_numeric_attributes(&snapshot.attributes),
    )
}

pub async fn control(
    State(state): State<AppState>,
    Extension(client): Extension<AuthedClient>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: ControlRequest =
        serde_json::from_slice(&body).map_err(|_| Error::InvalidRequest("invalid_json"))?;

    let (Some(entity_id), Some(action)) = (request.entity_id, request.action) else {
        return Err(Error::InvalidRequest("missing_required_fields"));
    };
    let actor = request.actor;

    if !is_valid_entity_id(&entity_id) {
        return Err(Error::InvalidRequest("invalid_entity_id"));
    }

    let entry = state.hub.entity(&entity_id).await?;
    if entry.is_none() {
        return Err(Error::NotFound("entity_not_found"));
    }

    if !is_entity_allowed(entry.as_ref()) {
        log_deny(
            &client.client_id,
            &entity_id,
            &action,
            "entity_not_allowed",
            actor.as_ref(),
            Some(client.source_ip),
        );
        return Err(Error::Forbidden("entity_not_allowed"));
    }

    let domain = entity_domain(&entity_id).to_string();
    if !is_service_allowed(&domain, &action) {
        log_deny(
            &client.client_id,
            &entity_id,
            &action,
            "service_not_allowed",
            actor.as_ref(),
            Some(client.source_ip),
        );
        return Err(Error::Forbidden("service_not_allowed"));
    }

    // service_data passes through opaque, but it must be an object so the
    // entity id cannot be clobbered by a scalar payload
    let mut payload = Map::new();
    payload.insert("entity_id".to_string(), Value::String(entity_id.clone()));
    match request.service_data {
        Some(Value::Object(extra)) => {
            for (key, value) in extra {
                if key != "entity_id" {
                    payload.insert(key, value);
                }
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => return Err(Error::InvalidRequest("invalid_service_data")),
    }

    if let Err(err) = state
        .hub
        .call_service(&domain, &action, Value::Object(payload))
        .await
    {
        tracing::error!(entity_id = %entity_id, action = %action, error = %err, "service call failed");
        log_control(
            &client.client_id,
            &entity_id,
            &action,
            "error",
            actor.as_ref(),
            Some(client.source_ip),
        );
        return Err(Error::upstream("service_call_failed", err.to_string()));
    }

    tokio::time::sleep(STATE_SETTLE_DELAY).await;

    log_control(
        &client.client_id,
        &entity_id,
        &action,
        "success",
        actor.as_ref(),
        Some(client.source_ip),
    );

    let new_state = state.hub.state(&entity_id).await?;
    let (state_value, attributes) = match &new_state {
        Some(snapshot) => {
            let (value, attrs) = formatted_state(snapshot);
            (value, Some(attrs))
        }
        None => (Value::Null, None),
    };

    Ok(Json(json!({
        "success": true,
        "entity_id": entity_id,
        "action": action,
        "new_state": state_value,
        "new_attributes": attributes,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
