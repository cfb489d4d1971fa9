//! Home Assistant REST shapes used by the bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `ClimateEntityFeature.TARGET_TEMPERATURE_RANGE`
pub const FEATURE_TARGET_TEMPERATURE_RANGE: u64 = 2;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub last_changed: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl EntityState {
    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        match self.attributes.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Numeric state; `unknown`/`unavailable` yield `None`.
    pub fn state_f64(&self) -> Option<f64> {
        self.state.trim().parse().ok()
    }

    pub fn is_on(&self) -> bool {
        self.state.eq_ignore_ascii_case("on")
    }

    pub fn unit_of_measurement(&self) -> Option<&str> {
        self.attr_str("unit_of_measurement")
    }

    pub fn supports_target_range(&self) -> bool {
        self.attributes
            .get("supported_features")
            .and_then(Value::as_u64)
            .map(|f| f & FEATURE_TARGET_TEMPERATURE_RANGE == FEATURE_TARGET_TEMPERATURE_RANGE)
            .unwrap_or(false)
    }

    /// Current target; the low bound when the entity uses a range.
    pub fn target_temperature(&self) -> Option<f64> {
        if self.supports_target_range() {
            self.attr_f64("target_temp_low")
        } else {
            self.attr_f64("temperature")
        }
    }
}

/// Body for `POST /api/states/{entity_id}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateUpdate {
    pub state: String,
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    pub fn parse(unit: &str) -> Option<Self> {
        match unit.trim() {
            "°C" | "C" | "celsius" => Some(TemperatureUnit::Celsius),
            "°F" | "F" | "fahrenheit" => Some(TemperatureUnit::Fahrenheit),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "°C",
            TemperatureUnit::Fahrenheit => "°F",
        }
    }

    pub fn to_celsius(&self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
        }
    }

    pub fn from_celsius(&self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Fahrenheit => value * 9.0 / 5.0 + 32.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitSystem {
    pub temperature: String,
}

/// Subset of `GET /api/config`.
#[derive(Debug, Clone, Deserialize)]
pub struct HaConfig {
    pub unit_system: UnitSystem,
    #[serde(default)]
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn climate(attrs: Value) -> EntityState {
        serde_json::from_value(json!({
            "entity_id": "climate.heat_pump",
            "state": "heat",
            "attributes": attrs,
            "last_changed": "2024-06-08T10:00:00+00:00",
            "last_updated": "2024-06-08T10:00:00.123456+00:00"
        }))
        .unwrap()
    }

    #[test]
    fn target_temperature_respects_range_support() {
        let single = climate(json!({"supported_features": 1, "temperature": 21.0, "target_temp_low": 18.0}));
        assert_eq!(single.target_temperature(), Some(21.0));

        let ranged = climate(json!({"supported_features": 3, "temperature": 21.0, "target_temp_low": 18.0}));
        assert!(ranged.supports_target_range());
        assert_eq!(ranged.target_temperature(), Some(18.0));
    }

    #[test]
    fn fahrenheit_conversions_are_inverse() {
        let f = TemperatureUnit::Fahrenheit;
        assert!((f.to_celsius(68.0) - 20.0).abs() < 1e-9);
        assert!((f.from_celsius(20.0) - 68.0).abs() < 1e-9);
        assert_eq!(TemperatureUnit::Celsius.to_celsius(21.5), 21.5);
        assert_eq!(TemperatureUnit::parse("°F"), Some(TemperatureUnit::Fahrenheit));
        assert_eq!(TemperatureUnit::parse("K"), None);
    }

    #[test]
    fn numeric_helpers_tolerate_strings() {
        let s = climate(json!({"current_temperature": "19.5"}));
        assert_eq!(s.attr_f64("current_temperature"), Some(19.5));
        assert_eq!(s.state_f64(), None);
    }
}
