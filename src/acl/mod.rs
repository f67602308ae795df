//! Access control: the entity allow-list and the service allow-list.
//!
//! Entities are controllable only when their registry entry carries the
//! `smartly` label, exact match. Services are gated by a static
//! domain→action table. A deny anywhere short-circuits.

mod structure;

pub use structure::{build_structure, StructureResponse};

use crate::hub::EntityEntry;

/// Registry label that marks an entity as platform-controllable.
pub const PLATFORM_CONTROL_LABEL: &str = "smartly";

/// Static per-domain action allow-list.
const ALLOWED_SERVICES: &[(&str, &[&str])] = &[
    ("switch", &["turn_on", "turn_off", "toggle"]),
    ("light", &["turn_on", "turn_off", "toggle"]),
    (
        "cover",
        &["open_cover", "close_cover", "stop_cover", "set_cover_position"],
    ),
    ("climate", &["set_temperature", "set_hvac_mode", "set_fan_mode"]),
    ("fan", &["turn_on", "turn_off", "set_percentage", "set_preset_mode"]),
    ("lock", &["lock", "unlock"]),
    ("scene", &["turn_on"]),
    ("script", &["turn_on", "turn_off"]),
    ("automation", &["trigger", "turn_on", "turn_off"]),
    (
        "camera",
        &[
            "enable_motion_detection",
            "disable_motion_detection",
            "record",
            "snapshot",
        ],
    ),
];

/// Default icons by domain, used when the registry has none.
const DOMAIN_ICONS: &[(&str, &str)] = &[
    ("switch", "mdi:toggle-switch"),
    ("light", "mdi:lightbulb"),
    ("cover", "mdi:window-shutter"),
    ("climate", "mdi:thermostat"),
    ("fan", "mdi:fan"),
    ("lock", "mdi:lock"),
    ("scene", "mdi:palette"),
    ("script", "mdi:script-text"),
    ("automation", "mdi:robot"),
    ("camera", "mdi:cctv"),
    ("sensor", "mdi:eye"),
    ("binary_sensor", "mdi:checkbox-blank-circle-outline"),
];

/// Whether a registry entry is allowed for platform control.
pub fn is_entity_allowed(entry: Option<&EntityEntry>) -> bool {
    entry
        .map(|e| e.labels.iter().any(|l| l == PLATFORM_CONTROL_LABEL))
        .unwrap_or(false)
}

/// Whether `(domain, action)` is in the static allow-list.
pub fn is_service_allowed(domain: &str, action: &str) -> bool {
    ALLOWED_SERVICES
        .iter()
        .find(|(d, _)| *d == domain)
        .map(|(_, actions)| actions.contains(&action))
        .unwrap_or(false)
}

/// The domain segment of an entity id.
pub fn entity_domain(entity_id: &str) -> &str {
    entity_id.split('.').next().unwrap_or("")
}

/// `domain.object` shape check: both segments non-empty, `[a-z0-9_]` only.
pub fn is_valid_entity_id(entity_id: &str) -> bool {
    let mut parts = entity_id.splitn(2, '.');
    let (Some(domain), Some(object)) = (parts.next(), parts.next()) else {
        return false;
    };
    let ok = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    ok(domain) && ok(object)
}

/// Icon resolution: user icon, then registry original icon, then the
/// domain default map, then nothing.
pub fn resolve_icon(entry: &EntityEntry) -> Option<String> {
    entry
        .icon
        .clone()
        .or_else(|| entry.original_icon.clone())
        .or_else(|| {
            let domain = entity_domain(&entry.entity_id);
            DOMAIN_ICONS
                .iter()
                .find(|(d, _)| *d == domain)
                .map(|(_, icon)| (*icon).to_string())
        })
}
