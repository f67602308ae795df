//! History handlers: bounded time-range queries, cursor pagination,
//! batch queries and recorder statistics.
//!
//! Results are ordered newest-first by `(last_updated, last_changed)`.
//! The first entry of each history array carries `attributes`; later
//! entries repeat them only when the value type changes. Consumers must
//! treat a missing `attributes` key as "unchanged since the last emission
//! that carried it".

use crate::acl::{entity_domain, is_entity_allowed};
use crate::audit::log_deny;
use crate::auth::AuthedClient;
use crate::error::{Error, Result};
use crate::formatting::{
    decimal_places, format_numeric_attributes, format_state_value, infer_precision_key,
    is_numeric_state, DEFAULT_DECIMAL_PLACES,
};
use crate::hub::{HistoryState, StatisticsPeriod};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Extension, Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

const DEFAULT_WINDOW_HOURS: i64 = 24;
const MAX_WINDOW_DAYS: i64 = 30;
const DEFAULT_LIMIT: usize = 1000;
const MAX_ENTITIES_BATCH: usize = 50;
const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 1000;

/// Ordering key: newest-first by `(last_updated, last_changed)`.
type SortKey = (DateTime<Utc>, DateTime<Utc>);

fn sort_key(state: &HistoryState) -> SortKey {
    (state.last_updated, state.last_changed)
}

// ---- cursor codec -------------------------------------------------------

fn encode_cursor(key: SortKey) -> String {
    let payload = json!({ "ts": key.0, "lc": key.1 });
    URL_SAFE_NO_PAD.encode(payload.to_string())
}

fn decode_cursor(raw: &str) -> Option<SortKey> {
    let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    let ts = value.get("ts")?.as_str()?.parse::<DateTime<Utc>>().ok()?;
    let lc = value.get("lc")?.as_str()?.parse::<DateTime<Utc>>().ok()?;
    Some((ts, lc))
}

fn parse_datetime(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

// ---- pagination ---------------------------------------------------------

/// Slice one page out of a newest-first list. Continuation starts
/// strictly after the cursor key.
fn paginate(
    states: &[HistoryState],
    cursor: Option<SortKey>,
    page_size: usize,
) -> (Vec<HistoryState>, bool, Option<SortKey>) {
    let remaining: Vec<&HistoryState> = match cursor {
        Some(key) => states.iter().filter(|s| sort_key(s) < key).collect(),
        None => states.iter().collect(),
    };

    let has_more = remaining.len() > page_size;
    let page: Vec<HistoryState> = remaining.into_iter().take(page_size).cloned().collect();
    let next_cursor = if has_more {
        page.last().map(sort_key)
    } else {
        None
    };
    (page, has_more, next_cursor)
}

// ---- metadata & visualization -------------------------------------------

fn visualization_config(device_class: Option<&str>, domain: &str, is_numeric: bool) -> Value {
    if let Some(dc) = device_class {
        let by_class = match dc {
            "current" => Some(json!({
                "type": "chart", "chart_type": "line", "color": "#FFA726",
                "show_points": true, "interpolation": "linear",
            })),
            "voltage" => Some(json!({
                "type": "chart", "chart_type": "line", "color": "#FFCA28",
                "show_points": true, "interpolation": "linear",
            })),
            "power" => Some(json!({
                "type": "chart", "chart_type": "line", "color": "#EF5350",
                "show_points": true, "interpolation": "linear",
            })),
            "energy" => Some(json!({
                "type": "chart", "chart_type": "area", "color": "#AB47BC",
                "show_points": false, "interpolation": "linear",
            })),
            "temperature" => Some(json!({
                "type": "chart", "chart_type": "line", "color": "#FF7043",
                "show_points": true, "interpolation": "linear",
            })),
            "humidity" => Some(json!({
                "type": "chart", "chart_type": "line", "color": "#29B6F6",
                "show_points": true, "interpolation": "linear",
            })),
            "battery" => Some(json!({
                "type": "chart", "chart_type": "line", "color": "#9CCC65",
                "show_points": true, "interpolation": "linear",
            })),
            "pressure" => Some(json!({
                "type": "chart", "chart_type": "line", "color": "#26A69A",
                "show_points": true, "interpolation": "linear",
            })),
            "illuminance" => Some(json!({
                "type": "chart", "chart_type": "line", "color": "#FFEE58",
                "show_points": true, "interpolation": "linear",
            })),
            "power_factor" => Some(json!({
                "type": "gauge", "min": 0, "max": 1, "color": "#7E57C2",
            })),
            "motion" | "door" | "window" | "occupancy" | "opening" | "presence" => Some(json!({
                "type": "timeline", "on_color": "#66BB6A", "off_color": "#BDBDBD",
            })),
            _ => None,
        };
        if let Some(config) = by_class {
            return config;
        }
    }

    match domain {
        "switch" | "light" | "lock" | "cover" | "binary_sensor" | "automation" | "script"
        | "scene" | "fan" => json!({
            "type": "timeline", "on_color": "#66BB6A", "off_color": "#BDBDBD",
        }),
        _ if is_numeric => json!({
            "type": "chart", "chart_type": "line", "color": "#607D8B",
            "show_points": true, "interpolation": "linear",
        }),
        _ => json!({
            "type": "timeline", "on_color": "#66BB6A", "off_color": "#BDBDBD",
        }),
    }
}

/// Resolve the attribute set metadata is derived from. `device_class`
/// falls back in three stages: first state with attributes, any history
/// entry, the entity's current state.
fn resolve_metadata_attrs(
    page: &[HistoryState],
    all: &[HistoryState],
    current: Option<&Map<String, Value>>,
) -> Map<String, Value> {
    let candidates: Vec<&Map<String, Value>> = page
        .iter()
        .filter_map(|s| s.attributes.as_ref())
        .chain(all.iter().filter_map(|s| s.attributes.as_ref()))
        .chain(current.into_iter())
        .collect();

    let mut base = candidates
        .iter()
        .find(|m| !m.is_empty())
        .map(|m| (*m).clone())
        .unwrap_or_default();

    if !base.contains_key("device_class") {
        if let Some(with_class) = candidates.iter().find(|m| m.contains_key("device_class")) {
            if let Some(device_class) = with_class.get("device_class") {
                base.insert("device_class".to_string(), device_class.clone());
            }
        }
    }
    base
}

fn build_metadata(entity_id: &str, attrs: &Map<String, Value>, sample_state: Option<&str>) -> Value {
    let domain = {
        let d = entity_domain(entity_id);
        if d.is_empty() { "sensor" } else { d }
    };
    let device_class = attrs.get("device_class").and_then(Value::as_str);
    let unit = attrs
        .get("unit_of_measurement")
        .and_then(Value::as_str)
        .unwrap_or("");
    let friendly_name = attrs
        .get("friendly_name")
        .and_then(Value::as_str)
        .unwrap_or(entity_id);
    let is_numeric = sample_state.map(is_numeric_state).unwrap_or(false);

    let places = if is_numeric {
        Some(resolve_decimal_places(entity_id, device_class, unit))
    } else {
        None
    };

    json!({
        "domain": domain,
        "device_class": device_class,
        "unit_of_measurement": unit,
        "friendly_name": friendly_name,
        "is_numeric": is_numeric,
        "decimal_places": places,
        "visualization": visualization_config(device_class, domain, is_numeric),
    })
}

fn resolve_decimal_places(entity_id: &str, device_class: Option<&str>, unit: &str) -> u32 {
    device_class
        .and_then(|dc| decimal_places(dc, unit))
        .or_else(|| infer_precision_key(entity_id).and_then(|key| decimal_places(key, unit)))
        .unwrap_or(DEFAULT_DECIMAL_PLACES)
}

// ---- entry formatting ---------------------------------------------------

/// Render history entries with the attribute economy applied: the first
/// entry carries attributes, later ones only when the value type flips.
fn format_entries(states: &[HistoryState], places: Option<u32>) -> Vec<Value> {
    let mut out = Vec::with_capacity(states.len());
    let mut prev_numeric: Option<bool> = None;

    for state in states {
        let numeric = is_numeric_state(&state.state);
        let include_attrs = prev_numeric.map(|p| p != numeric).unwrap_or(true);
        prev_numeric = Some(numeric);

        let mut entry = json!({
            "state": format_state_value(&state.state, places),
            "last_changed": state.last_changed,
            "last_updated": state.last_updated,
        });
        if include_attrs {
            let attrs = state
                .attributes
                .as_ref()
                .map(format_numeric_attributes)
                .unwrap_or_default();
            entry["attributes"] = Value::Object(attrs);
        }
        out.push(entry);
    }
    out
}

/// Pad a newest-first series so it spans the full query window: carry the
/// newest value forward to `end`, and for numeric series anchor the
/// oldest known value at `start`.
fn pad_time_bounds(
    mut entries: Vec<Value>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    is_numeric: bool,
) -> Vec<Value> {
    if entries.is_empty() {
        return entries;
    }

    let newest_time = entries[0]
        .get("last_changed")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<DateTime<Utc>>().ok());
    if let Some(t) = newest_time {
        if t < end {
            let state = entries[0]["state"].clone();
            entries.insert(
                0,
                json!({ "state": state, "last_changed": end, "last_updated": end }),
            );
        }
    }

    if is_numeric {
        let oldest = entries.last().cloned();
        if let Some(oldest) = oldest {
            let oldest_time = oldest
                .get("last_changed")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<DateTime<Utc>>().ok());
            if let Some(t) = oldest_time {
                if t > start {
                    let fill = oldest
                        .get("state")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    entries.push(json!({
                        "state": fill, "last_changed": start, "last_updated": start,
                    }));
                }
            }
        }
    }

    entries
}

// ---- shared request plumbing --------------------------------------------

#[derive(Debug)]
struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

fn validate_time_range(
    start_raw: Option<&str>,
    end_raw: Option<&str>,
) -> Result<TimeRange> {
    let now = Utc::now();
    let end = parse_datetime(end_raw).unwrap_or(now);
    let start =
        parse_datetime(start_raw).unwrap_or(end - ChronoDuration::hours(DEFAULT_WINDOW_HOURS));

    if end <= start {
        return Err(Error::InvalidRequest("invalid_time_range"));
    }
    if end - start > ChronoDuration::days(MAX_WINDOW_DAYS) {
        return Err(Error::InvalidRequest("invalid_time_range"));
    }
    Ok(TimeRange { start, end })
}

fn effective_limit(range: &TimeRange, requested: Option<usize>) -> Option<usize> {
    if range.end - range.start <= ChronoDuration::hours(DEFAULT_WINDOW_HOURS) {
        None
    } else {
        Some(requested.unwrap_or(DEFAULT_LIMIT).min(DEFAULT_LIMIT))
    }
}

/// Entity gate shared by the history endpoints: unknown entity is 404,
/// known-but-unlabeled is 403.
async fn require_allowed_entity(
    state: &AppState,
    client: &AuthedClient,
    entity_id: &str,
    service: &str,
) -> Result<()> {
    let entry = state.hub.entity(entity_id).await?;
    if entry.is_none() {
        return Err(Error::NotFound("entity_not_found"));
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

// ---- single entity ------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<usize>,
    significant_changes_only: Option<bool>,
    cursor: Option<String>,
    page_size: Option<usize>,
}

/// GET /api/smartly/history/{entity_id}
pub async fn single(
    State(state): State<AppState>,
    Extension(client): Extension<AuthedClient>,
    Path(entity_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>> {
    require_allowed_entity(&state, &client, &entity_id, "history").await?;

    let range = validate_time_range(params.start_time.as_deref(), params.end_time.as_deref())?;

    let cursor = match &params.cursor {
        Some(raw) => Some(decode_cursor(raw).ok_or(Error::InvalidRequest("invalid_cursor"))?),
        None => None,
    };
    let use_pagination = cursor.is_some() || params.page_size.is_some();
    let page_size = params
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let significant_only = params.significant_changes_only.unwrap_or(true);

    let ids = vec![entity_id.clone()];
    let mut states = state
        .hub
        .significant_states(&ids, range.start, range.end, significant_only)
        .await?
        .remove(&entity_id)
        .unwrap_or_default();
    states.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));

    let current = state.hub.state(&entity_id).await?;
    let metadata_attrs = resolve_metadata_attrs(
        &states,
        &states,
        current.as_ref().map(|s| &s.attributes),
    );
    let sample_state = states
        .first()
        .map(|s| s.state.as_str())
        .or(current.as_ref().map(|s| s.state.as_str()));
    let metadata = build_metadata(&entity_id, &metadata_attrs, sample_state);

    let places = metadata
        .get("decimal_places")
        .and_then(Value::as_u64)
        .map(|p| p as u32);
    let is_numeric = metadata
        .get("is_numeric")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut response = json!({
        "entity_id": entity_id,
        "start_time": range.start,
        "end_time": range.end,
        "metadata": metadata,
    });

    if use_pagination {
        let (page, has_more, next_cursor) = paginate(&states, cursor, page_size);
        let entries = format_entries(&page, places);
        response["history"] = Value::Array(entries.clone());
        response["count"] = json!(entries.len());
        response["page_size"] = json!(page_size);
        response["has_more"] = json!(has_more);
        if let Some(key) = next_cursor {
            response["next_cursor"] = json!(encode_cursor(key));
        }
    } else {
        let limit = effective_limit(&range, params.limit);
        let truncated = limit.map(|l| states.len() > l).unwrap_or(false);
        let trimmed: Vec<HistoryState> = match limit {
            Some(l) => states.into_iter().take(l).collect(),
            None => states,
        };
        let entries = pad_time_bounds(
            format_entries(&trimmed, places),
            range.start,
            range.end,
            is_numeric,
        );
        response["count"] = json!(entries.len());
        response["history"] = Value::Array(entries);
        response["truncated"] = json!(truncated);
    }

    Ok(Json(response))
}

// ---- batch --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BatchRequest {
    entity_ids: Option<Vec<String>>,
    start_time: Option<String>,
    end_time: Option<String>,
    limit: Option<usize>,
    significant_changes_only: Option<bool>,
}

/// POST /api/smartly/history/batch
pub async fn batch(
    State(state): State<AppState>,
    Extension(client): Extension<AuthedClient>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: BatchRequest =
        serde_json::from_slice(&body).map_err(|_| Error::InvalidRequest("invalid_json"))?;

    let entity_ids = match request.entity_ids {
        Some(ids) if !ids.is_empty() => ids,
        _ => return Err(Error::InvalidRequest("missing_required_fields")),
    };
    if entity_ids.len() > MAX_ENTITIES_BATCH {
        return Err(Error::InvalidRequest("too_many_entities"));
    }

    let mut allowed = Vec::new();
    let mut denied = Vec::new();
    for entity_id in &entity_ids {
        let entry = state.hub.entity(entity_id).await?;
        if is_entity_allowed(entry.as_ref()) {
            allowed.push(entity_id.clone());
        } else {
            denied.push(entity_id.clone());
            log_deny(
                &client.client_id,
                entity_id,
                "history_batch",
                "entity_not_allowed",
                None,
                Some(client.source_ip),
            );
        }
    }
    if allowed.is_empty() {
        return Err(Error::Forbidden("acl_denied"));
    }

    let range = validate_time_range(request.start_time.as_deref(), request.end_time.as_deref())?;
    let limit = effective_limit(&range, request.limit);
    let significant_only = request.significant_changes_only.unwrap_or(true);

    let mut all_states = state
        .hub
        .significant_states(&allowed, range.start, range.end, significant_only)
        .await?;

    let mut history = Map::new();
    let mut counts = Map::new();
    let mut truncated = Map::new();
    let mut metadata_map = Map::new();

    for entity_id in &allowed {
        let mut states = all_states.remove(entity_id).unwrap_or_default();
        states.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));

        let current = state.hub.state(entity_id).await?;
        let attrs =
            resolve_metadata_attrs(&states, &states, current.as_ref().map(|s| &s.attributes));
        let sample = states
            .first()
            .map(|s| s.state.as_str())
            .or(current.as_ref().map(|s| s.state.as_str()));
        let metadata = build_metadata(entity_id, &attrs, sample);

        let places = metadata
            .get("decimal_places")
            .and_then(Value::as_u64)
            .map(|p| p as u32);
        let is_numeric = metadata
            .get("is_numeric")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let was_truncated = limit.map(|l| states.len() > l).unwrap_or(false);
        let trimmed: Vec<HistoryState> = match limit {
            Some(l) => states.into_iter().take(l).collect(),
            None => states,
        };
        let entries = pad_time_bounds(
            format_entries(&trimmed, places),
            range.start,
            range.end,
            is_numeric,
        );

        counts.insert(entity_id.clone(), json!(entries.len()));
        truncated.insert(entity_id.clone(), json!(was_truncated));
        history.insert(entity_id.clone(), Value::Array(entries));
        metadata_map.insert(entity_id.clone(), metadata);
    }

    Ok(Json(json!({
        "history": history,
        "count": counts,
        "truncated": truncated,
        "metadata": metadata_map,
        "denied_entities": denied,
        "start_time": range.start,
        "end_time": range.end,
    })))
}

// ---- statistics ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatisticsRequest {
    entity_id: Option<String>,
    period: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
}

/// POST /api/smartly/history/statistics
pub async fn statistics(
    State(state): State<AppState>,
    Extension(client): Extension<AuthedClient>,
    body: Bytes,
) -> Result<Json<Value>> {
    let request: StatisticsRequest =
        serde_json::from_slice(&body).map_err(|_| Error::InvalidRequest("invalid_json"))?;

    let Some(entity_id) = request.entity_id else {
        return Err(Error::InvalidRequest("missing_required_fields"));
    };

    require_allowed_entity(&state, &client, &entity_id, "statistics").await?;

    let period = StatisticsPeriod::parse(request.period.as_deref().unwrap_or("hour"))
        .ok_or(Error::InvalidRequest("invalid_period"))?;
    let range = validate_time_range(request.start_time.as_deref(), request.end_time.as_deref())?;

    let rows = state
        .hub
        .statistics_during_period(&entity_id, range.start, range.end, period)
        .await?;
    let count = rows.len();

    Ok(Json(json!({
        "entity_id": entity_id,
        "period": period.as_str(),
        "statistics": rows,
        "count": count,
        "start_time": range.start,
        "end_time": range.end,
    })))
}
