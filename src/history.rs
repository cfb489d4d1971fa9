//! Conversion of Home Assistant state history into backend readings.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::models::homeassistant::{EntityState, TemperatureUnit};
use crate::models::profile::{HistoryColumn, HistoryReading};

/// Attributes that carry the reading itself and never count as constant.
const VARYING_ATTRIBUTES: [&str; 5] = [
    "current_temperature",
    "temperature",
    "target_temp_low",
    "target_temp_high",
    "hvac_action",
];

/// Readings for `column` plus the attributes shared by every state.
///
/// Climate states read `current_temperature` (converted from `unit`), the
/// target and the hvac mode; sensor states read their numeric state.
pub fn states_to_readings(
    column: HistoryColumn,
    states: &[EntityState],
    unit: TemperatureUnit,
) -> (Vec<HistoryReading>, Map<String, Value>) {
    let readings = states
        .iter()
        .map(|s| match column {
            HistoryColumn::ClimateEntity => HistoryReading {
                timestamp: s.last_updated,
                value: s.attr_f64("current_temperature").map(|t| unit.to_celsius(t)),
                target_temperature: s.target_temperature().map(|t| unit.to_celsius(t)),
                hvac_mode: Some(s.state.clone()),
            },
            HistoryColumn::HeatPumpPower => HistoryReading {
                timestamp: s.last_updated,
                value: s.state_f64().and_then(|v| power_to_kw(v, s.unit_of_measurement())),
                target_temperature: None,
                hvac_mode: None,
            },
            HistoryColumn::ExternalTemperature => HistoryReading {
                timestamp: s.last_updated,
                value: s.state_f64().map(|v| sensor_to_celsius(v, s.unit_of_measurement())),
                target_temperature: None,
                hvac_mode: None,
            },
        })
        .collect();
    (readings, constant_attributes(states))
}

/// Attributes whose value is identical in every state.
pub fn constant_attributes(states: &[EntityState]) -> Map<String, Value> {
    let Some((first, rest)) = states.split_first() else {
        return Map::new();
    };
    first
        .attributes
        .iter()
        .filter(|(k, _)| !VARYING_ATTRIBUTES.contains(&k.as_str()))
        .filter(|(k, v)| rest.iter().all(|s| s.attributes.get(k.as_str()) == Some(*v)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// W and kW are accepted; anything else is unusable.
pub fn power_to_kw(value: f64, unit: Option<&str>) -> Option<f64> {
    match unit {
        Some("W") => Some(value / 1000.0),
        Some("kW") => Some(value),
        _ => None,
    }
}

/// Sensors without a recognised unit are taken as Celsius.
pub fn sensor_to_celsius(value: f64, unit: Option<&str>) -> f64 {
    unit.and_then(TemperatureUnit::parse)
        .unwrap_or(TemperatureUnit::Celsius)
        .to_celsius(value)
}

/// First and last `last_updated` of a history, if any.
pub fn date_bounds(states: &[EntityState]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let oldest = states.iter().map(|s| s.last_updated).min()?;
    let newest = states.iter().map(|s| s.last_updated).max()?;
    Some((oldest, newest))
}
