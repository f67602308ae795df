//! Sync handlers: topology tree and flat current state.

use crate::acl::{build_structure, is_entity_allowed, resolve_icon};
use crate::auth::AuthedClient;
use crate::error::Result;
use crate::formatting::{decimal_places, format_numeric_attributes, format_state_value};
use crate::hub::EntityEntry;
use crate::state::AppState;
use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};

async fn allowed_entities(state: &AppState) -> Result<Vec<EntityEntry>> {
    Ok(state
        .hub
        .entities()
        .await?
        .into_iter()
        .filter(|entry| is_entity_allowed(Some(entry)))
        .collect())
}

/// GET /api/smartly/sync/structure
pub async fn structure(
    State(state): State<AppState>,
    Extension(_client): Extension<AuthedClient>,
) -> Result<Json<Value>> {
    let allowed = allowed_entities(&state).await?;
    let structure = build_structure(state.hub.as_ref(), &allowed).await?;
    Ok(Json(serde_json::to_value(structure)?))
}

/// GET /api/smartly/sync/states
pub async fn states(
    State(state): State<AppState>,
    Extension(_client): Extension<AuthedClient>,
) -> Result<Json<Value>> {
    let allowed = allowed_entities(&state).await?;

    let mut rows = Vec::with_capacity(allowed.len());
    for entry in &allowed {
        let Some(snapshot) = state.hub.state(&entry.entity_id).await? else {
            continue;
        };

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

        rows.push(json!({
            "entity_id": entry.entity_id.clone(),
            "state": format_state_value(&snapshot.state, places),
            "attributes": format_numeric_attributes(&snapshot.attributes),
            "last_changed": snapshot.last_changed,
            "last_updated": snapshot.last_updated,
            "icon": resolve_icon(entry),
        }));
    }

    Ok(Json(json!({
        "count": rows.len(),
        "states": rows,
    })))
}
