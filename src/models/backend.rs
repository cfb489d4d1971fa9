//! Wire models for the OptiSpark backend.
//!
//! Field names follow the backend's camelCase JSON. Optional fields default to
//! `None` so partially populated responses still decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// =====================
// Shared enums
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkingMode {
    Heating,
    Cooling,
    Stopped,
    HeatAndCool,
}

impl WorkingMode {
    /// Lenient parse used for mode strings coming from Home Assistant
    /// (`"HEATING"`, `"heat_and_cool"`, `"Heating"` all work).
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "heating" | "heat" => Some(WorkingMode::Heating),
            "cooling" | "cool" => Some(WorkingMode::Cooling),
            "stopped" | "off" => Some(WorkingMode::Stopped),
            "heatandcool" | "heatcool" | "auto" => Some(WorkingMode::HeatAndCool),
            _ => None,
        }
    }
}

impl fmt::Display for WorkingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkingMode::Heating => "Heating",
            WorkingMode::Cooling => "Cooling",
            WorkingMode::Stopped => "Stopped",
            WorkingMode::HeatAndCool => "HeatAndCool",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermostatControlStatus {
    Schedule,
    Manual,
    Boost,
}

impl fmt::Display for ThermostatControlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThermostatControlStatus::Schedule => "schedule",
            ThermostatControlStatus::Manual => "manual",
            ThermostatControlStatus::Boost => "boost",
        };
        f.write_str(s)
    }
}

// =====================
// Value objects
// =====================

/// Set point and raw mode string sent when forcing manual control.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlInfo {
    pub set_point: f64,
    pub mode: String,
}

impl fmt::Display for ControlInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.set_point, self.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub address: String,
    pub city: String,
    pub postcode: String,
    pub country: String,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}, {}", self.address, self.city, self.postcode, self.country)
    }
}

// =====================
// Auth
// =====================

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub user_hash: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub has_locations: bool,
    #[serde(default)]
    pub has_devices: bool,
}

// =====================
// Location
// =====================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationAddress {
    pub address: String,
    pub zipcode: String,
    pub city: String,
    pub country: String,
}

impl From<&Address> for LocationAddress {
    fn from(value: &Address) -> Self {
        LocationAddress {
            address: value.address.clone(),
            zipcode: value.postcode.clone(),
            city: value.city.clone(),
            country: value.country.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRequest {
    pub name: String,
    pub address: LocationAddress,
    pub tariff_id: i64,
    pub tariff_params: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationResponse {
    pub id: i64,
    pub name: String,
    pub address: LocationAddress,
    pub tariff_id: Option<i64>,
    #[serde(default)]
    pub tariff_params: Value,
    pub thermostat_id: i64,
}

// =====================
// Device
// =====================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub name: String,
    pub location_id: i64,
    pub manufacturer: String,
    #[serde(rename = "modelname")]
    pub model_name: String,
    pub version: String,
    pub integration_type: String,
    pub integration_params: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub id: i64,
    pub name: String,
    pub location_id: i64,
    pub manufacturer: Option<String>,
    #[serde(rename = "modelname")]
    pub model_name: Option<String>,
    pub version: Option<String>,
    pub integration_type: Option<String>,
    #[serde(default)]
    pub integration_params: Value,
}

/// A live reading of the heat pump pushed to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDataRequest {
    pub internal_temp: f64,
    pub humidity: Option<f64>,
    pub power: Option<f64>,
    pub mode: WorkingMode,
    pub heat_set_point: Option<f64>,
    pub cool_set_point: Option<f64>,
}

// =====================
// Thermostat
// =====================

#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatControlRequest {
    pub mode: WorkingMode,
    pub heat_set_point: Option<f64>,
    pub cool_set_point: Option<f64>,
}

impl ThermostatControlRequest {
    /// Manual control holding `set_point` for both directions.
    pub fn manual(mode: WorkingMode, set_point: f64) -> Self {
        ThermostatControlRequest {
            mode,
            heat_set_point: Some(set_point),
            cool_set_point: Some(set_point),
        }
    }
}

// Only the set points relevant to the mode go on the wire.
impl Serialize for ThermostatControlRequest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let (heat, cool) = match self.mode {
            WorkingMode::Heating => (self.heat_set_point, None),
            WorkingMode::Cooling => (None, self.cool_set_point),
            WorkingMode::HeatAndCool => match (self.heat_set_point, self.cool_set_point) {
                (Some(h), Some(c)) => (Some(h), Some(c)),
                _ => (None, None),
            },
            WorkingMode::Stopped => (None, None),
        };

        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("mode", &self.mode)?;
        if let Some(h) = heat {
            map.serialize_entry("heatSetPoint", &h)?;
        }
        if let Some(c) = cool {
            map.serialize_entry("coolSetPoint", &c)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThermostatControlResponse {
    pub thermostat_id: i64,
    pub status: ThermostatControlStatus,
    pub mode: WorkingMode,
    #[serde(default)]
    pub heat_set_point: Option<f64>,
    #[serde(default)]
    pub cool_set_point: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThermostatPrediction {
    pub date: DateTime<Utc>,
    pub mode: WorkingMode,
    pub set_point: f64,
    pub external_temperature: Option<f64>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HvacMode {
    Heat,
    Cool,
    Auto,
    Off,
}

impl HvacMode {
    /// The Home Assistant `hvac_mode` string.
    pub fn as_str(&self) -> &'static str {
        match self {
            HvacMode::Heat => "heat",
            HvacMode::Cool => "cool",
            HvacMode::Auto => "auto",
            HvacMode::Off => "off",
        }
    }
}

impl From<WorkingMode> for HvacMode {
    fn from(mode: WorkingMode) -> Self {
        match mode {
            WorkingMode::Heating => HvacMode::Heat,
            WorkingMode::Cooling => HvacMode::Cool,
            WorkingMode::HeatAndCool => HvacMode::Auto,
            WorkingMode::Stopped => HvacMode::Off,
        }
    }
}

pub const DEFAULT_TARGET_TEMP_C: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ThermostatInfo {
    pub id: i64,
    pub target_temp_high: f64,
    pub target_temp_low: f64,
    pub hvac_mode: HvacMode,
}

impl From<&ThermostatControlResponse> for ThermostatInfo {
    fn from(control: &ThermostatControlResponse) -> Self {
        ThermostatInfo {
            id: control.thermostat_id,
            target_temp_high: control.heat_set_point.unwrap_or(DEFAULT_TARGET_TEMP_C),
            target_temp_low: control.cool_set_point.unwrap_or(DEFAULT_TARGET_TEMP_C),
            hvac_mode: control.mode.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn working_mode_parses_loose_spellings() {
        assert_eq!(WorkingMode::parse("HEATING"), Some(WorkingMode::Heating));
        assert_eq!(WorkingMode::parse("heat_and_cool"), Some(WorkingMode::HeatAndCool));
        assert_eq!(WorkingMode::parse("Cooling"), Some(WorkingMode::Cooling));
        assert_eq!(WorkingMode::parse("dry"), None);
    }

    #[test]
    fn control_request_only_sends_relevant_set_points() {
        let heating = ThermostatControlRequest::manual(WorkingMode::Heating, 21.0);
        assert_eq!(
            serde_json::to_value(&heating).unwrap(),
            json!({"mode": "Heating", "heatSetPoint": 21.0})
        );

        let cooling = ThermostatControlRequest::manual(WorkingMode::Cooling, 24.0);
        assert_eq!(
            serde_json::to_value(&cooling).unwrap(),
            json!({"mode": "Cooling", "coolSetPoint": 24.0})
        );

        let both = ThermostatControlRequest {
            mode: WorkingMode::HeatAndCool,
            heat_set_point: Some(19.0),
            cool_set_point: None,
        };
        assert_eq!(serde_json::to_value(&both).unwrap(), json!({"mode": "HeatAndCool"}));

        let stopped = ThermostatControlRequest::manual(WorkingMode::Stopped, 20.0);
        assert_eq!(serde_json::to_value(&stopped).unwrap(), json!({"mode": "Stopped"}));
    }

    #[test]
    fn thermostat_info_defaults_missing_set_points() {
        let control: ThermostatControlResponse = serde_json::from_value(json!({
            "thermostatId": 7,
            "status": "schedule",
            "mode": "HeatAndCool",
            "heatSetPoint": 22.5
        }))
        .unwrap();

        let info = ThermostatInfo::from(&control);
        assert_eq!(info.id, 7);
        assert_eq!(info.target_temp_high, 22.5);
        assert_eq!(info.target_temp_low, DEFAULT_TARGET_TEMP_C);
        assert_eq!(info.hvac_mode, HvacMode::Auto);
    }

    #[test]
    fn location_request_nests_address() {
        let address = Address {
            address: "1 Main St".into(),
            city: "Aberdeen".into(),
            postcode: "AB11 6LU".into(),
            country: "GB".into(),
        };
        let req = LocationRequest {
            name: "home".into(),
            address: LocationAddress::from(&address),
            tariff_id: 1,
            tariff_params: json!({}),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["address"]["zipcode"], "AB11 6LU");
        assert_eq!(v["tariffId"], 1);
    }
}
