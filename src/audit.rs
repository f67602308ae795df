//! Audit logging.
//!
//! One structured line per control outcome and per deny, emitted through
//! the host logger. Every handler and the push pipeline go through here so
//! the records stay uniform.

use serde::Deserialize;
use std::net::IpAddr;

/// Optional platform-side actor forwarded with control requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Actor {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

fn actor_fields(actor: Option<&Actor>) -> (String, String) {
    match actor {
        Some(a) => (
            a.user_id.clone().unwrap_or_else(|| "unknown".into()),
            a.role.clone().unwrap_or_else(|| "unknown".into()),
        ),
        None => ("-".into(), "-".into()),
    }
}

/// Log a control action outcome.
pub fn log_control(
    client_id: &str,
    entity_id: &str,
    service: &str,
    result: &str,
    actor: Option<&Actor>,
    source_ip: Option<IpAddr>,
) {
    let (actor_user, actor_role) = actor_fields(actor);
    tracing::info!(
        target: "smartly_bridge::audit",
        client_id,
        entity_id,
        service,
        result,
        actor_user = %actor_user,
        actor_role = %actor_role,
        source_ip = %source_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into()),
        "CONTROL"
    );
}

/// Log a denied action.
pub fn log_deny(
    client_id: &str,
    entity_id: &str,
    service: &str,
    reason: &str,
    actor: Option<&Actor>,
    source_ip: Option<IpAddr>,
) {
    let (actor_user, actor_role) = actor_fields(actor);
    tracing::warn!(
        target: "smartly_bridge::audit",
        client_id,
        entity_id,
        service,
        reason,
        actor_user = %actor_user,
        actor_role = %actor_role,
        source_ip = %source_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into()),
        "DENY"
    );
}

/// Log a successful push to the platform webhook.
pub fn log_push_success(instance_id: &str, event_count: usize) {
    tracing::debug!(
        target: "smartly_bridge::audit",
        instance_id,
        event_count,
        "PUSH_SUCCESS"
    );
}

/// Log a dropped push batch.
pub fn log_push_fail(instance_id: &str, event_count: usize, reason: &str) {
    tracing::error!(
        target: "smartly_bridge::audit",
        instance_id,
        event_count,
        reason,
        "PUSH_FAIL"
    );
}

/// Log a bridge lifecycle event.
pub fn log_lifecycle(event: &str, details: &str) {
    tracing::info!(target: "smartly_bridge::audit", event, details, "LIFECYCLE");
}
