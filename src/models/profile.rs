//! Optimisation profile, its request payload ("lambda args") and the history
//! bookkeeping exchanged with the backend.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::models::backend::ControlInfo;

pub const DEFAULT_SET_POINT_C: f64 = 20.0;
pub const DEFAULT_TEMP_RANGE_C: f64 = 2.0;
pub const DEFAULT_HEAT_PUMP_MODE: &str = "HEATING";
pub const DEFAULT_POSTCODE: &str = "AB11 6LU";

/// History column names the backend stores readings under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryColumn {
    ClimateEntity,
    HeatPumpPower,
    ExternalTemperature,
}

impl HistoryColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryColumn::ClimateEntity => "climate_entity",
            HistoryColumn::HeatPumpPower => "heat_pump_power",
            HistoryColumn::ExternalTemperature => "external_temperature",
        }
    }
}

impl fmt::Display for HistoryColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `|current - set_point| > range`
pub fn is_outside_range(current: f64, set_point: f64, range: f64) -> bool {
    (current - set_point).abs() > range
}

/// Request payload for the profile endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LambdaArgs {
    #[serde(rename = "temp_set_point")]
    pub set_point: f64,
    pub temp_range: f64,
    pub postcode: String,
    pub user_hash: String,
    pub initial_internal_temp: Option<f64>,
    pub outside_range: bool,
    pub heat_pump_mode_raw: String,
    /// Current heat pump power draw in kW.
    #[serde(rename = "optimised_power")]
    pub power_kw: Option<f64>,
    pub home_assistant_version: String,
    pub address: String,
    pub city: String,
    pub temp_changed: bool,
}

impl LambdaArgs {
    pub fn new(user_hash: impl Into<String>, postcode: Option<String>, address: String, city: String) -> Self {
        LambdaArgs {
            set_point: DEFAULT_SET_POINT_C,
            temp_range: DEFAULT_TEMP_RANGE_C,
            postcode: postcode
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_POSTCODE.to_string()),
            user_hash: user_hash.into(),
            initial_internal_temp: None,
            outside_range: false,
            heat_pump_mode_raw: DEFAULT_HEAT_PUMP_MODE.to_string(),
            power_kw: None,
            home_assistant_version: String::new(),
            address,
            city,
            temp_changed: false,
        }
    }

    /// Record the latest device readings and recompute `outside_range`.
    pub fn observe(&mut self, internal_temp: f64, power_kw: Option<f64>) {
        self.initial_internal_temp = Some(internal_temp);
        self.power_kw = power_kw;
        self.outside_range = is_outside_range(internal_temp, self.set_point, self.temp_range);
    }

    pub fn control_info(&self) -> ControlInfo {
        ControlInfo {
            set_point: self.set_point,
            mode: self.heat_pump_mode_raw.clone(),
        }
    }
}

/// Backend optimisation output: parallel arrays indexed by `timestamp`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Profile {
    pub timestamp: Vec<DateTime<Utc>>,
    pub electricity_price: Vec<f64>,
    pub base_power: Vec<f64>,
    pub optimised_power: Vec<f64>,
    #[serde(default)]
    pub optimised_internal_temp: Vec<f64>,
    #[serde(default)]
    pub external_temp: Vec<Option<f64>>,
    pub temp_controls: Vec<f64>,
    pub base_cost: f64,
    pub optimised_cost: f64,
    #[serde(default)]
    pub projected_percent_savings: f64,
}

impl Profile {
    /// Checks that every time-based series lines up with `timestamp`.
    pub fn validate(&self) -> Result<(), String> {
        if self.timestamp.is_empty() {
            return Err("profile has no timestamps".to_string());
        }
        let n = self.timestamp.len();
        let series = [
            ("electricity_price", self.electricity_price.len()),
            ("base_power", self.base_power.len()),
            ("optimised_power", self.optimised_power.len()),
            ("temp_controls", self.temp_controls.len()),
        ];
        for (name, len) in series {
            if len != n {
                return Err(format!("profile series {} has {} values, expected {}", name, len, n));
            }
        }
        Ok(())
    }

    pub fn compute_savings(&mut self) {
        self.projected_percent_savings = if self.optimised_cost == 0.0 {
            // heating inactive
            100.0
        } else {
            self.base_cost / self.optimised_cost * 100.0 - 100.0
        };
    }

    /// Last timestamp in the series.
    pub fn horizon(&self) -> Option<DateTime<Utc>> {
        self.timestamp.iter().max().copied()
    }

    pub fn sample_at(&self, now: DateTime<Utc>) -> Option<ProfileSample> {
        let idx = closest_past_index(&self.timestamp, now)?;
        Some(ProfileSample {
            timestamp: self.timestamp[idx],
            base_power: *self.base_power.get(idx)?,
            electricity_price: *self.electricity_price.get(idx)?,
            temp_controls: *self.temp_controls.get(idx)?,
            optimised_power: *self.optimised_power.get(idx)?,
            base_cost: self.base_cost,
            optimised_cost: self.optimised_cost,
            projected_percent_savings: self.projected_percent_savings,
        })
    }
}

/// The slice of a [`Profile`] that applies right now.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSample {
    pub timestamp: DateTime<Utc>,
    pub base_power: f64,
    pub electricity_price: f64,
    pub temp_controls: f64,
    pub optimised_power: f64,
    pub base_cost: f64,
    pub optimised_cost: f64,
    pub projected_percent_savings: f64,
}

/// Index of the largest timestamp not after `now`.
pub fn closest_past_index(timestamps: &[DateTime<Utc>], now: DateTime<Utc>) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, ts) in timestamps.iter().enumerate() {
        if *ts > now {
            continue;
        }
        match best {
            Some(b) if timestamps[b] >= *ts => {}
            _ => best = Some(idx),
        }
    }
    best
}

/// Oldest and newest stored sample per history column.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DataDates {
    #[serde(default, deserialize_with = "de_date_map")]
    pub oldest_dates: BTreeMap<HistoryColumn, Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "de_date_map")]
    pub newest_dates: BTreeMap<HistoryColumn, Option<DateTime<Utc>>>,
}

impl DataDates {
    pub fn oldest(&self, column: HistoryColumn) -> Option<DateTime<Utc>> {
        self.oldest_dates.get(&column).copied().flatten()
    }

    pub fn newest(&self, column: HistoryColumn) -> Option<DateTime<Utc>> {
        self.newest_dates.get(&column).copied().flatten()
    }
}

/// Backend dates may come without an offset; those are UTC.
fn parse_utc_lenient(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("invalid datetime: {}", s))
}

fn de_date_map<'de, D>(deserializer: D) -> Result<BTreeMap<HistoryColumn, Option<DateTime<Utc>>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<HistoryColumn, Option<String>>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(column, value)| {
            let parsed = value
                .as_deref()
                .map(parse_utc_lenient)
                .transpose()
                .map_err(serde::de::Error::custom)?;
            Ok((column, parsed))
        })
        .collect()
}

/// One historical reading of a monitored entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryReading {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hvac_mode: Option<String>,
}

/// Body of a history upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryUpload {
    pub user_hash: String,
    pub climate_entity_id: String,
    pub postcode: String,
    pub tariff: String,
    pub histories: BTreeMap<HistoryColumn, Vec<HistoryReading>>,
    pub constant_attributes: BTreeMap<HistoryColumn, Map<String, Value>>,
    pub upload_only: bool,
}

impl HistoryUpload {
    pub fn reading_count(&self) -> usize {
        self.histories.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 8, h, m, 0).unwrap()
    }

    fn load_profile_fixture() -> Profile {
        let json = std::fs::read_to_string("tests/data/profile.json").expect("fixture present");
        serde_json::from_str(&json).expect("parse profile")
    }

    #[test]
    fn closest_past_picks_largest_not_after_now() {
        let ts = vec![t(10, 0), t(10, 30), t(11, 0), t(11, 30)];
        assert_eq!(closest_past_index(&ts, t(11, 10)), Some(2));
        assert_eq!(closest_past_index(&ts, t(11, 0)), Some(2));
        assert_eq!(closest_past_index(&ts, t(23, 0)), Some(3));
        assert_eq!(closest_past_index(&ts, t(9, 59)), None);
    }

    #[test]
    fn closest_past_handles_unsorted_series() {
        let ts = vec![t(11, 0), t(10, 0), t(12, 0), t(10, 30)];
        assert_eq!(closest_past_index(&ts, t(11, 45)), Some(0));
    }

    #[test]
    fn outside_range_uses_strict_tolerance() {
        assert!(is_outside_range(23.0, 20.0, 2.0));
        assert!(!is_outside_range(22.0, 20.0, 2.0));
        assert!(is_outside_range(17.5, 20.0, 2.0));
    }

    #[test]
    fn observe_flags_outside_range() {
        let mut args = LambdaArgs::new("hash", None, "1 Main St".into(), "Aberdeen".into());
        assert_eq!(args.postcode, DEFAULT_POSTCODE);
        args.observe(23.0, Some(1.2));
        assert!(args.outside_range);
        assert_eq!(args.initial_internal_temp, Some(23.0));
        args.observe(21.0, None);
        assert!(!args.outside_range);
    }

    #[test]
    fn profile_fixture_samples_current_slot() {
        let profile = load_profile_fixture();
        profile.validate().expect("fixture is consistent");
        let first = profile.timestamp[0];
        let sample = profile.sample_at(first + Duration::minutes(45)).expect("sample");
        assert_eq!(sample.timestamp, profile.timestamp[1]);
        assert_eq!(sample.temp_controls, profile.temp_controls[1]);
        assert_eq!(sample.electricity_price, profile.electricity_price[1]);
        assert!(profile.sample_at(first - Duration::seconds(1)).is_none());
    }

    #[test]
    fn validate_rejects_ragged_series() {
        let mut profile = load_profile_fixture();
        profile.temp_controls.pop();
        assert!(profile.validate().is_err());
    }

    #[test]
    fn savings_are_full_when_heating_idle() {
        let mut profile = load_profile_fixture();
        profile.optimised_cost = 0.0;
        profile.compute_savings();
        assert_eq!(profile.projected_percent_savings, 100.0);

        profile.base_cost = 3.0;
        profile.optimised_cost = 2.0;
        profile.compute_savings();
        assert!((profile.projected_percent_savings - 50.0).abs() < 1e-9);
    }

    #[test]
    fn data_dates_accept_naive_and_null() {
        let dates: DataDates = serde_json::from_str(
            r#"{
                "oldest_dates": {"climate_entity": "2024-06-01T00:00:00", "heat_pump_power": null},
                "newest_dates": {"climate_entity": "2024-06-08T12:00:00+00:00"}
            }"#,
        )
        .unwrap();
        assert_eq!(
            dates.oldest(HistoryColumn::ClimateEntity),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(dates.oldest(HistoryColumn::HeatPumpPower), None);
        assert_eq!(dates.newest(HistoryColumn::ClimateEntity), Some(t(12, 0)));
        assert_eq!(dates.newest(HistoryColumn::ExternalTemperature), None);
    }
}
