//! Runtime configuration.
//!
//! Two sources: process environment (Home Assistant access, monitored
//! entities, account details, cadence) and a JSON file describing the backend
//! (base URL, endpoint templates, TLS verification). Both are loaded once at
//! startup and handed to the collaborators that need them.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::backend::Address;

pub const DEFAULT_HA_BASE_URL: &str = "http://localhost:8123";
pub const DEFAULT_BACKEND_CONFIG: &str = "config/config.json";
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_HISTORY_DAYS: i64 = 7;
pub const DEFAULT_HISTORY_LOOKBACK_DAYS: i64 = 365;
pub const DEFAULT_MAX_UPLOAD_HISTORY_READINGS: usize = 5000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_HOURS_FROM_NOW: u32 = 24;

#[derive(Debug, Clone)]
pub struct Config {
    pub ha_base_url: String,
    /// Long-lived Home Assistant access token.
    pub ha_token: String,
    pub backend_config_path: PathBuf,
    pub user_hash: String,
    pub climate_entity_id: String,
    pub heat_pump_power_entity_id: Option<String>,
    pub external_temp_entity_id: Option<String>,
    /// Switch/input_boolean gating the whole integration. Always enabled when unset.
    pub enable_switch_entity_id: Option<String>,
    /// input_number carrying the user's desired set point.
    pub set_point_entity_id: Option<String>,
    pub address: Address,
    pub tariff: String,
    pub update_interval: Duration,
    /// Days of history uploaded on first run.
    pub history_days: i64,
    /// How far back Home Assistant history is queried.
    pub history_lookback_days: i64,
    /// Per-entity cap on readings uploaded in one call.
    pub max_upload_history_readings: usize,
}

fn required(name: &str) -> Result<String, String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(format!("Missing required environment variable {}", name)),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match optional(name) {
        Some(v) => v
            .parse::<T>()
            .map_err(|_| format!("{} has an invalid value: {}", name, v)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let update_secs: u64 = parsed("UPDATE_INTERVAL_SECS", DEFAULT_UPDATE_INTERVAL_SECS)?;
        if update_secs == 0 {
            return Err("UPDATE_INTERVAL_SECS must be greater than zero".to_string());
        }
        let max_upload: usize = parsed("MAX_UPLOAD_HISTORY_READINGS", DEFAULT_MAX_UPLOAD_HISTORY_READINGS)?;
        if max_upload == 0 {
            return Err("MAX_UPLOAD_HISTORY_READINGS must be greater than zero".to_string());
        }

        Ok(Config {
            ha_base_url: optional("HA_BASE_URL").unwrap_or_else(|| DEFAULT_HA_BASE_URL.to_string()),
            ha_token: required("HA_TOKEN")?,
            backend_config_path: PathBuf::from(
                optional("OPTISPARK_CONFIG").unwrap_or_else(|| DEFAULT_BACKEND_CONFIG.to_string()),
            ),
            user_hash: required("OPTISPARK_USER_HASH")?,
            climate_entity_id: required("CLIMATE_ENTITY_ID")?,
            heat_pump_power_entity_id: optional("HEAT_PUMP_POWER_ENTITY_ID"),
            external_temp_entity_id: optional("EXTERNAL_TEMP_ENTITY_ID"),
            enable_switch_entity_id: optional("ENABLE_SWITCH_ENTITY_ID"),
            set_point_entity_id: optional("SET_POINT_ENTITY_ID"),
            address: Address {
                address: optional("OPTISPARK_ADDRESS").unwrap_or_default(),
                city: optional("OPTISPARK_CITY").unwrap_or_default(),
                postcode: optional("OPTISPARK_POSTCODE").unwrap_or_default(),
                country: optional("OPTISPARK_COUNTRY").unwrap_or_default(),
            },
            tariff: optional("OPTISPARK_TARIFF").unwrap_or_default(),
            update_interval: Duration::from_secs(update_secs),
            history_days: parsed("HISTORY_DAYS", DEFAULT_HISTORY_DAYS)?,
            history_lookback_days: parsed("HISTORY_LOOKBACK_DAYS", DEFAULT_HISTORY_LOOKBACK_DAYS)?,
            max_upload_history_readings: max_upload,
        })
    }
}

// =====================
// Backend configuration file
// =====================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub backend: BackendEndpoints,
    #[serde(default = "default_hours_from_now")]
    pub hours_from_now: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendEndpoints {
    pub base_url: String,
    #[serde(rename = "verifySSL", default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub auth: AuthEndpoints,
    #[serde(default)]
    pub location: LocationEndpoints,
    #[serde(default)]
    pub device: DeviceEndpoints,
    #[serde(default)]
    pub thermostat: ThermostatEndpoints,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthEndpoints {
    pub login: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        AuthEndpoints {
            login: "/auth/ha_login".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationEndpoints {
    pub base: String,
}

impl Default for LocationEndpoints {
    fn default() -> Self {
        LocationEndpoints {
            base: "/locations".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceEndpoints {
    pub base: String,
    /// Live reading upload; `{device_id}` is substituted.
    pub data: String,
}

impl Default for DeviceEndpoints {
    fn default() -> Self {
        DeviceEndpoints {
            base: "/devices".to_string(),
            data: "/devices/{device_id}/data".to_string(),
        }
    }
}

/// Thermostat scoped templates; `{thermostat_id}` is substituted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThermostatEndpoints {
    pub control: String,
    pub manual: String,
    pub graph: String,
    pub data_dates: String,
    pub history: String,
    pub profile: String,
}

impl Default for ThermostatEndpoints {
    fn default() -> Self {
        ThermostatEndpoints {
            control: "/thermostats/{thermostat_id}/control".to_string(),
            manual: "/thermostats/{thermostat_id}/control/manual".to_string(),
            graph: "/thermostats/{thermostat_id}/graph".to_string(),
            data_dates: "/thermostats/{thermostat_id}/history/dates".to_string(),
            history: "/thermostats/{thermostat_id}/history".to_string(),
            profile: "/thermostats/{thermostat_id}/profile".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_hours_from_now() -> u32 {
    DEFAULT_HOURS_FROM_NOW
}

impl BackendConfig {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read backend config {}: {}", path.display(), e))?;
        Self::from_json(&raw).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn from_json(raw: &str) -> Result<Self, String> {
        let de = &mut serde_json::Deserializer::from_str(raw);
        let cfg: BackendConfig =
            serde_path_to_error::deserialize(de).map_err(|e| format!("invalid backend config at {}: {}", e.path(), e.inner()))?;
        if cfg.backend.base_url.trim().is_empty() {
            return Err("backend.baseUrl must not be empty".to_string());
        }
        Ok(cfg)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.backend.timeout_secs)
    }
}
