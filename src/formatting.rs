//! Numeric display formatting.
//!
//! Sensor values are rounded to a precision keyed by `(device_class, unit)`
//! so the platform receives display-ready numbers. Anything the table does
//! not know falls back to two decimals when numeric, raw string otherwise.

use serde_json::{Map, Value};

/// Decimal places keyed by `(device_class, unit_of_measurement)`.
/// Checked before the base table.
const UNIT_PRECISION: &[((&str, &str), u32)] = &[
    (("current", "mA"), 1),
    (("current", "A"), 2),
    (("voltage", "V"), 2),
    (("voltage", "mV"), 0),
    (("power", "W"), 2),
    (("power", "kW"), 3),
    (("energy", "Wh"), 0),
    (("energy", "kWh"), 2),
    (("temperature", "°C"), 1),
    (("temperature", "°F"), 1),
    (("battery", "%"), 0),
    (("humidity", "%"), 0),
    (("frequency", "Hz"), 1),
    (("pressure", "hPa"), 1),
];

/// Decimal places keyed by device class alone.
const BASE_PRECISION: &[(&str, u32)] = &[
    ("current", 2),
    ("voltage", 2),
    ("power", 2),
    ("energy", 2),
    ("temperature", 1),
    ("humidity", 0),
    ("battery", 0),
    ("pressure", 1),
    ("power_factor", 2),
    ("frequency", 1),
    ("illuminance", 0),
];

/// Default precision applied to numeric values with no table entry.
pub const DEFAULT_DECIMAL_PLACES: u32 = 2;

/// States that are never treated as numeric.
const NON_NUMERIC_STATES: &[&str] = &["", "unknown", "unavailable"];

/// Resolve decimal places for a device class / unit pair.
pub fn decimal_places(key: &str, unit: &str) -> Option<u32> {
    if !key.is_empty() && !unit.is_empty() {
        if let Some((_, places)) = UNIT_PRECISION.iter().find(|((k, u), _)| *k == key && *u == unit)
        {
            return Some(*places);
        }
    }
    BASE_PRECISION
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, places)| *places)
}

/// Infer a device-class key from an entity's object id, e.g.
/// `sensor.garage_current` resolves through `current`.
pub fn infer_precision_key(entity_id: &str) -> Option<&'static str> {
    let object = entity_id.rsplit('.').next().unwrap_or(entity_id).to_ascii_lowercase();
    BASE_PRECISION
        .iter()
        .map(|(k, _)| *k)
        .find(|k| object.contains(k))
}

pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Whether a raw state string represents a number.
pub fn is_numeric_state(state: &str) -> bool {
    !NON_NUMERIC_STATES.contains(&state) && state.parse::<f64>().is_ok()
}

/// Format a raw state string: numbers become rounded JSON numbers,
/// everything else stays a string.
pub fn format_state_value(state: &str, places: Option<u32>) -> Value {
    if NON_NUMERIC_STATES.contains(&state) {
        return Value::String(state.to_string());
    }
    match state.parse::<f64>() {
        Ok(num) => {
            let rounded = round_to(num, places.unwrap_or(DEFAULT_DECIMAL_PLACES));
            serde_json::Number::from_f64(rounded)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(state.to_string()))
        }
        Err(_) => Value::String(state.to_string()),
    }
}

/// Round the well-known numeric attributes in place, using the entity's
/// unit to pick precision. Unknown attributes pass through untouched.
pub fn format_numeric_attributes(attributes: &Map<String, Value>) -> Map<String, Value> {
    let unit = attributes
        .get("unit_of_measurement")
        .and_then(Value::as_str)
        .unwrap_or("");

    let mut formatted = attributes.clone();
    for (key, _) in BASE_PRECISION {
        if let Some(value) = formatted.get(*key) {
            if let Some(num) = value.as_f64() {
                if let Some(places) = decimal_places(key, unit) {
                    if let Some(rounded) = serde_json::Number::from_f64(round_to(num, places)) {
                        formatted.insert((*key).to_string(), Value::Number(rounded));
                    }
                }
            }
        }
    }
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_table_wins_over_base() {
        assert_eq!(decimal_places("current", "mA"), Some(1));
        assert_eq!(decimal_places("current", ""), Some(2));
        assert_eq!(decimal_places("voltage", "V"), Some(2));
        assert_eq!(decimal_places("temperature", "°C"), Some(1));
        assert_eq!(decimal_places("battery", "%"), Some(0));
        assert_eq!(decimal_places("unknown_class", "X"), None);
    }

    #[test]
    fn state_value_formatting() {
        assert_eq!(format_state_value("23.456", Some(1)), json!(23.5));
        assert_eq!(format_state_value("23.456", None), json!(23.46));
        assert_eq!(format_state_value("on", None), json!("on"));
        assert_eq!(format_state_value("unavailable", Some(2)), json!("unavailable"));
        assert_eq!(format_state_value("", None), json!(""));
    }

    #[test]
    fn numeric_state_detection() {
        assert!(is_numeric_state("3.14"));
        assert!(is_numeric_state("-7"));
        assert!(!is_numeric_state("open"));
        assert!(!is_numeric_state("unknown"));
    }

    #[test]
    fn attributes_are_rounded_by_unit() {
        let attrs = json!({
            "unit_of_measurement": "mA",
            "current": 12.3456,
            "voltage": 229.947,
            "friendly_name": "Plug"
        });
        let formatted = format_numeric_attributes(attrs.as_object().unwrap());
        assert_eq!(formatted["current"], json!(12.3));
        // voltage has no (voltage, mA) entry so the base table applies
        assert_eq!(formatted["voltage"], json!(229.95));
        assert_eq!(formatted["friendly_name"], json!("Plug"));
    }

    #[test]
    fn precision_key_inference() {
        assert_eq!(infer_precision_key("sensor.garage_current"), Some("current"));
        assert_eq!(infer_precision_key("sensor.outdoor_temperature"), Some("temperature"));
        assert_eq!(infer_precision_key("sensor.door_contact"), None);
    }
}
