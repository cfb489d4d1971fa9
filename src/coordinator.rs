//! Fixed-interval control loop.
//!
//! Each tick reads Home Assistant, asks the update handler for the value
//! scheduled for now, writes it to the climate entity and publishes the
//! result as `sensor.optispark_*` states.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{Map, Value, json};
use std::thread;
use std::time::{Duration, Instant};

use crate::client::{ApiError, BackendClient};
use crate::handler::{BackendUpdateHandler, ProfileBackend, StateHistory, UpdateError};
use crate::history::power_to_kw;
use crate::homeassistant::{HaError, HomeAssistantClient};
use crate::models::backend::{ControlInfo, DeviceDataRequest, WorkingMode};
use crate::models::homeassistant::{EntityState, TemperatureUnit};
use crate::models::profile::{LambdaArgs, ProfileSample};

pub const SENSOR_PREFIX: &str = "sensor.optispark_";
const STATE_UNAVAILABLE: &str = "unavailable";
/// Smallest target change worth a service call.
const TARGET_TOLERANCE: f64 = 0.05;

/// Home Assistant operations the coordinator needs on top of history.
pub trait HomeAssistant: StateHistory {
    fn get_state(&self, entity_id: &str) -> Result<EntityState, HaError>;
    fn set_state(&self, entity_id: &str, state: String, attributes: Map<String, Value>) -> Result<(), HaError>;
    fn set_climate_temperature(&self, climate: &EntityState, temperature: f64) -> Result<(), HaError>;
}

impl HomeAssistant for HomeAssistantClient {
    fn get_state(&self, entity_id: &str) -> Result<EntityState, HaError> {
        HomeAssistantClient::get_state(self, entity_id)
    }

    fn set_state(&self, entity_id: &str, state: String, attributes: Map<String, Value>) -> Result<(), HaError> {
        HomeAssistantClient::set_state(self, entity_id, state, attributes)
    }

    fn set_climate_temperature(&self, climate: &EntityState, temperature: f64) -> Result<(), HaError> {
        HomeAssistantClient::set_climate_temperature(self, climate, temperature)
    }
}

/// Backend operations the coordinator calls directly.
pub trait ControlBackend: ProfileBackend {
    fn set_manual(&self, info: &ControlInfo) -> Result<(), ApiError>;
    fn upload_device_data(&self, data: &DeviceDataRequest) -> Result<(), ApiError>;
}

impl ControlBackend for BackendClient {
    fn set_manual(&self, info: &ControlInfo) -> Result<(), ApiError> {
        BackendClient::set_manual(self, info).map(|_| ())
    }

    fn upload_device_data(&self, data: &DeviceDataRequest) -> Result<(), ApiError> {
        BackendClient::upload_device_data(self, data)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub climate_entity_id: String,
    pub heat_pump_power_entity_id: Option<String>,
    pub enable_switch_entity_id: Option<String>,
    pub set_point_entity_id: Option<String>,
    pub interval: Duration,
}

/// Result of the last successful tick.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorData {
    pub sample: ProfileSample,
    pub internal_temp: f64,
    pub power_kw: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

pub struct Coordinator<'a, B: ControlBackend, H: HomeAssistant> {
    backend: &'a B,
    ha: &'a H,
    handler: BackendUpdateHandler<'a, B, H>,
    settings: CoordinatorSettings,
    unit: TemperatureUnit,
    args: LambdaArgs,
    available: bool,
    data: Option<CoordinatorData>,
}

impl<'a, B: ControlBackend, H: HomeAssistant> Coordinator<'a, B, H> {
    pub fn new(
        backend: &'a B,
        ha: &'a H,
        handler: BackendUpdateHandler<'a, B, H>,
        settings: CoordinatorSettings,
        unit: TemperatureUnit,
        args: LambdaArgs,
    ) -> Self {
        Coordinator {
            backend,
            ha,
            handler,
            settings,
            unit,
            args,
            available: false,
            data: None,
        }
    }

    pub fn data(&self) -> Option<&CoordinatorData> {
        self.data.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn args(&self) -> &LambdaArgs {
        &self.args
    }

    /// Ticks until an authentication error. Other failures are logged and
    /// the previous data stays published.
    pub fn run_loop(&mut self) -> Result<(), String> {
        info!(
            "Starting control loop for {} every {}s",
            self.settings.climate_entity_id,
            self.settings.interval.as_secs()
        );
        loop {
            let tick_start = Instant::now();

            match self.tick(Utc::now()) {
                Ok(Some(data)) => debug!(
                    "Tick ok: target {:.1} C, price {:.2}, savings {:.1}%",
                    data.sample.temp_controls, data.sample.electricity_price, data.sample.projected_percent_savings
                ),
                Ok(None) => debug!("Tick skipped; integration disabled"),
                Err(e) if e.is_authentication() => {
                    return Err(format!("Re-authentication required: {}", e));
                }
                Err(e) => error!("Update failed: {}", e),
            }

            // Maintain steady cadence
            let elapsed = tick_start.elapsed();
            if elapsed < self.settings.interval {
                thread::sleep(self.settings.interval - elapsed);
            }
        }
    }

    /// One update. Returns the data now published, `None` while disabled and
    /// nothing was ever computed.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Option<&CoordinatorData>, UpdateError> {
        if !self.enabled()? {
            if self.available {
                info!("Integration disabled; marking sensors unavailable");
                self.mark_unavailable();
                self.available = false;
            }
            return Ok(self.data.as_ref());
        }

        self.apply_user_set_point()?;

        let climate = self.ha.get_state(&self.settings.climate_entity_id)?;
        let internal_temp = self.internal_temp(&climate)?;
        let power_kw = self.heat_pump_power()?;
        self.args.observe(internal_temp, power_kw);

        let sample = self.handler.update(&self.args, now)?;
        self.write_target(&climate, sample.temp_controls)?;
        self.push_device_reading(&climate, internal_temp, power_kw, sample.temp_controls);
        self.publish(&sample)?;

        self.args.temp_changed = false;
        self.available = true;
        self.data = Some(CoordinatorData {
            sample,
            internal_temp,
            power_kw,
            updated_at: now,
        });
        Ok(self.data.as_ref())
    }

    fn enabled(&self) -> Result<bool, UpdateError> {
        match &self.settings.enable_switch_entity_id {
            Some(id) => Ok(self.ha.get_state(id)?.is_on()),
            None => Ok(true),
        }
    }

    /// A changed set-point entity is a user request: the backend goes to
    /// manual at the new value and the profile is recalculated.
    fn apply_user_set_point(&mut self) -> Result<(), UpdateError> {
        let Some(id) = &self.settings.set_point_entity_id else {
            return Ok(());
        };
        let state = self.ha.get_state(id)?;
        let Some(value) = state.state_f64() else {
            debug!("{} has no numeric state ({})", id, state.state);
            return Ok(());
        };
        let unit = state
            .unit_of_measurement()
            .and_then(TemperatureUnit::parse)
            .unwrap_or(self.unit);
        let set_point = unit.to_celsius(value);
        if (set_point - self.args.set_point).abs() < f64::EPSILON {
            return Ok(());
        }

        info!("Set point changed {:.1} -> {:.1} C", self.args.set_point, set_point);
        // committed only once the backend accepted it, so a failure retries next tick
        let info = ControlInfo {
            set_point,
            mode: self.args.heat_pump_mode_raw.clone(),
        };
        self.backend.set_manual(&info)?;
        self.args.set_point = set_point;
        self.args.temp_changed = true;
        self.handler.request_recalculation();
        Ok(())
    }

    fn internal_temp(&self, climate: &EntityState) -> Result<f64, UpdateError> {
        climate
            .attr_f64("current_temperature")
            .map(|t| self.unit.to_celsius(t))
            .ok_or_else(|| {
                UpdateError::HomeAssistant(HaError::InvalidState(format!(
                    "{} has no current_temperature",
                    climate.entity_id
                )))
            })
    }

    fn heat_pump_power(&self) -> Result<Option<f64>, UpdateError> {
        let Some(id) = &self.settings.heat_pump_power_entity_id else {
            return Ok(None);
        };
        let state = self.ha.get_state(id)?;
        let Some(value) = state.state_f64() else {
            debug!("{} has no numeric state ({})", id, state.state);
            return Ok(None);
        };
        power_to_kw(value, state.unit_of_measurement()).map(Some).ok_or_else(|| {
            UpdateError::Unit(format!(
                "{} reports power in {:?}; expected W or kW",
                id,
                state.unit_of_measurement()
            ))
        })
    }

    fn write_target(&self, climate: &EntityState, target_c: f64) -> Result<(), UpdateError> {
        let target = self.unit.from_celsius(target_c);
        let current = climate.target_temperature();
        if current.is_some_and(|c| (c - target).abs() < TARGET_TOLERANCE) {
            return Ok(());
        }
        debug!(
            "Setting {} target {:?} -> {:.1}{}",
            climate.entity_id,
            current,
            target,
            self.unit.symbol()
        );
        self.ha.set_climate_temperature(climate, target)?;
        Ok(())
    }

    fn push_device_reading(&self, climate: &EntityState, internal_temp: f64, power_kw: Option<f64>, target_c: f64) {
        let reading = DeviceDataRequest {
            internal_temp,
            humidity: climate.attr_f64("current_humidity"),
            power: power_kw,
            mode: WorkingMode::parse(&self.args.heat_pump_mode_raw).unwrap_or(WorkingMode::Heating),
            heat_set_point: Some(target_c),
            cool_set_point: None,
        };
        if let Err(e) = self.backend.upload_device_data(&reading) {
            warn!("Device reading upload failed: {}", e);
        }
    }

    fn sensors(&self, sample: &ProfileSample) -> Vec<(&'static str, f64, Map<String, Value>)> {
        fn attrs(name: &str, unit: &str, device_class: Option<&str>) -> Map<String, Value> {
            let mut m = Map::new();
            m.insert("friendly_name".into(), json!(name));
            m.insert("unit_of_measurement".into(), json!(unit));
            if let Some(dc) = device_class {
                m.insert("device_class".into(), json!(dc));
            }
            m
        }

        vec![
            (
                "target_temperature",
                self.unit.from_celsius(sample.temp_controls),
                attrs("OptiSpark target temperature", self.unit.symbol(), Some("temperature")),
            ),
            (
                "electricity_price",
                sample.electricity_price,
                attrs("OptiSpark electricity price", "p/kWh", None),
            ),
            (
                "base_power",
                sample.base_power,
                attrs("OptiSpark base power", "kW", Some("power")),
            ),
            (
                "optimised_power",
                sample.optimised_power,
                attrs("OptiSpark optimised power", "kW", Some("power")),
            ),
            (
                "projected_savings",
                sample.projected_percent_savings,
                attrs("OptiSpark projected savings", "%", None),
            ),
        ]
    }

    fn publish(&self, sample: &ProfileSample) -> Result<(), UpdateError> {
        for (key, value, attributes) in self.sensors(sample) {
            let entity_id = format!("{}{}", SENSOR_PREFIX, key);
            self.ha.set_state(&entity_id, format!("{:.2}", value), attributes)?;
        }
        Ok(())
    }

    fn mark_unavailable(&self) {
        let Some(data) = &self.data else { return };
        for (key, _, attributes) in self.sensors(&data.sample) {
            let entity_id = format!("{}{}", SENSOR_PREFIX, key);
            if let Err(e) = self.ha.set_state(&entity_id, STATE_UNAVAILABLE.to_string(), attributes) {
                warn!("Could not mark {} unavailable: {}", entity_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::{FakeBackend, FakeHistory, now, settings, state};
    use crate::models::profile::{DataDates, HistoryUpload, Profile};
    use chrono::Duration as ChronoDuration;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeHa {
        history: FakeHistory,
        current: RefCell<HashMap<String, EntityState>>,
        published: RefCell<Vec<(String, String)>>,
        climate_writes: RefCell<Vec<f64>>,
    }

    impl FakeHa {
        fn put(&self, s: EntityState) {
            self.current.borrow_mut().insert(s.entity_id.clone(), s);
        }

        fn last_published(&self, entity_id: &str) -> Option<String> {
            self.published
                .borrow()
                .iter()
                .rev()
                .find(|(id, _)| id == entity_id)
                .map(|(_, s)| s.clone())
        }
    }

    impl StateHistory for FakeHa {
        fn state_changes(
            &self,
            entity_id: &str,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> Result<Vec<EntityState>, HaError> {
            self.history.state_changes(entity_id, since, until)
        }
    }

    impl HomeAssistant for FakeHa {
        fn get_state(&self, entity_id: &str) -> Result<EntityState, HaError> {
            self.current
                .borrow()
                .get(entity_id)
                .cloned()
                .ok_or_else(|| HaError::EntityNotFound(entity_id.to_string()))
        }

        fn set_state(&self, entity_id: &str, state: String, _attributes: Map<String, Value>) -> Result<(), HaError> {
            self.published.borrow_mut().push((entity_id.to_string(), state));
            Ok(())
        }

        fn set_climate_temperature(&self, _climate: &EntityState, temperature: f64) -> Result<(), HaError> {
            self.climate_writes.borrow_mut().push(temperature);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeControl {
        inner: FakeBackend,
        manual_requests: RefCell<Vec<ControlInfo>>,
        fail_next_manual: Cell<bool>,
        readings: RefCell<Vec<DeviceDataRequest>>,
        reject_token: bool,
    }

    impl ProfileBackend for FakeControl {
        fn check_and_set_manual(&self, info: &ControlInfo) -> Result<bool, ApiError> {
            if self.reject_token {
                return Err(ApiError::Authentication("401".into()));
            }
            self.inner.check_and_set_manual(info)
        }

        fn get_data_dates(&self) -> Result<DataDates, ApiError> {
            self.inner.get_data_dates()
        }

        fn upload_history(&self, upload: &HistoryUpload) -> Result<DataDates, ApiError> {
            self.inner.upload_history(upload)
        }

        fn get_profile(&self, args: &LambdaArgs) -> Result<Profile, ApiError> {
            self.inner.get_profile(args)
        }
    }

    impl ControlBackend for FakeControl {
        fn set_manual(&self, info: &ControlInfo) -> Result<(), ApiError> {
            if self.fail_next_manual.replace(false) {
                return Err(ApiError::Timeout("create thermostat manual control".into()));
            }
            self.manual_requests.borrow_mut().push(info.clone());
            Ok(())
        }

        fn upload_device_data(&self, data: &DeviceDataRequest) -> Result<(), ApiError> {
            self.readings.borrow_mut().push(data.clone());
            Err(ApiError::Device("device data rejected".into()))
        }
    }

    fn climate(current: f64, target: f64) -> EntityState {
        let mut s = state("climate.heat_pump", "20", now());
        s.attributes.insert("current_temperature".into(), json!(current));
        s.attributes.insert("temperature".into(), json!(target));
        s
    }

    fn coordinator_settings() -> CoordinatorSettings {
        CoordinatorSettings {
            climate_entity_id: "climate.heat_pump".into(),
            heat_pump_power_entity_id: Some("sensor.heat_pump_power".into()),
            enable_switch_entity_id: Some("input_boolean.optispark".into()),
            set_point_entity_id: Some("input_number.optispark_set_point".into()),
            interval: Duration::from_secs(60),
        }
    }

    fn seed(ha: &FakeHa, switch: &str, set_point: &str) {
        for h in 1..=3 {
            let at = now() - ChronoDuration::hours(h);
            ha.history.push(state("climate.heat_pump", "20.5", at));
            ha.history.push(state("sensor.heat_pump_power", "900", at));
        }
        ha.put(climate(20.5, 21.0));
        ha.put(state("sensor.heat_pump_power", "1500", now()));
        ha.put(state("input_boolean.optispark", switch, now()));
        ha.put(state("input_number.optispark_set_point", set_point, now()));
    }

    fn build<'a>(backend: &'a FakeControl, ha: &'a FakeHa, unit: TemperatureUnit) -> Coordinator<'a, FakeControl, FakeHa> {
        let mut s = settings(100);
        s.temperature_unit = unit;
        let handler = BackendUpdateHandler::new(backend, ha, s);
        let args = LambdaArgs::new("hash", None, String::new(), String::new());
        Coordinator::new(backend, ha, handler, coordinator_settings(), unit, args)
    }

    #[test]
    fn tick_writes_target_and_publishes_sensors() {
        let backend = FakeControl::default();
        let ha = FakeHa::default();
        seed(&ha, "on", "20");

        let mut coordinator = build(&backend, &ha, TemperatureUnit::Celsius);
        let data = coordinator.tick(now()).unwrap().cloned().unwrap();

        assert_eq!(data.sample.temp_controls, 19.0);
        assert_eq!(data.power_kw, Some(1.5));
        assert_eq!(*ha.climate_writes.borrow(), vec![19.0]);
        assert_eq!(ha.last_published("sensor.optispark_target_temperature").as_deref(), Some("19.00"));
        assert_eq!(ha.last_published("sensor.optispark_projected_savings").as_deref(), Some("25.00"));
        assert!(coordinator.is_available());
        // the failed device upload does not fail the tick
        assert_eq!(backend.readings.borrow().len(), 1);
        // set point entity matches the default: no manual request
        assert!(backend.manual_requests.borrow().is_empty());
    }

    #[test]
    fn unchanged_target_is_not_rewritten() {
        let backend = FakeControl::default();
        let ha = FakeHa::default();
        seed(&ha, "on", "20");
        ha.put(climate(20.5, 19.0));

        let mut coordinator = build(&backend, &ha, TemperatureUnit::Celsius);
        coordinator.tick(now()).unwrap();
        assert!(ha.climate_writes.borrow().is_empty());
    }

    #[test]
    fn fahrenheit_targets_are_converted() {
        let backend = FakeControl::default();
        let ha = FakeHa::default();
        seed(&ha, "on", "68");
        ha.put(climate(68.9, 70.0));

        let mut coordinator = build(&backend, &ha, TemperatureUnit::Fahrenheit);
        let data = coordinator.tick(now()).unwrap().cloned().unwrap();

        assert!((data.internal_temp - 20.5).abs() < 1e-9);
        let writes = ha.climate_writes.borrow();
        assert_eq!(writes.len(), 1);
        assert!((writes[0] - 66.2).abs() < 1e-9);
    }

    #[test]
    fn set_point_change_requests_manual_and_recalculation() {
        let backend = FakeControl::default();
        let ha = FakeHa::default();
        seed(&ha, "on", "20");

        let mut coordinator = build(&backend, &ha, TemperatureUnit::Celsius);
        coordinator.tick(now()).unwrap();
        assert_eq!(*backend.inner.profile_calls.borrow(), 1);

        ha.put(state("input_number.optispark_set_point", "21.5", now()));
        coordinator.tick(now()).unwrap();

        let requests = backend.manual_requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].set_point, 21.5);
        assert_eq!(coordinator.args().set_point, 21.5);
        assert_eq!(*backend.inner.profile_calls.borrow(), 2);
    }

    #[test]
    fn failed_set_point_push_is_retried() {
        let backend = FakeControl::default();
        let ha = FakeHa::default();
        seed(&ha, "on", "20");

        let mut coordinator = build(&backend, &ha, TemperatureUnit::Celsius);
        coordinator.tick(now()).unwrap();

        ha.put(state("input_number.optispark_set_point", "22", now()));
        backend.fail_next_manual.set(true);
        let err = coordinator.tick(now()).unwrap_err();
        assert!(matches!(err, UpdateError::Api(ApiError::Timeout(_))));
        assert_eq!(coordinator.args().set_point, 20.0);
        assert!(backend.manual_requests.borrow().is_empty());

        coordinator.tick(now()).unwrap();
        let requests = backend.manual_requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].set_point, 22.0);
        assert_eq!(coordinator.args().set_point, 22.0);
        assert_eq!(*backend.inner.profile_calls.borrow(), 2);
    }

    #[test]
    fn disabling_marks_sensors_unavailable_once() {
        let backend = FakeControl::default();
        let ha = FakeHa::default();
        seed(&ha, "on", "20");

        let mut coordinator = build(&backend, &ha, TemperatureUnit::Celsius);
        coordinator.tick(now()).unwrap();
        let published = ha.published.borrow().len();

        ha.put(state("input_boolean.optispark", "off", now()));
        let kept = coordinator.tick(now()).unwrap().cloned();
        assert!(kept.is_some());
        assert!(!coordinator.is_available());
        assert_eq!(
            ha.last_published("sensor.optispark_target_temperature").as_deref(),
            Some(STATE_UNAVAILABLE)
        );
        let after_disable = ha.published.borrow().len();
        assert_eq!(after_disable, published + 5);

        coordinator.tick(now()).unwrap();
        assert_eq!(ha.published.borrow().len(), after_disable);
    }

    #[test]
    fn unknown_power_unit_fails_the_tick() {
        let backend = FakeControl::default();
        let ha = FakeHa::default();
        seed(&ha, "on", "20");
        let mut power = state("sensor.heat_pump_power", "3", now());
        power.attributes.insert("unit_of_measurement".into(), json!("MW"));
        ha.put(power);

        let mut coordinator = build(&backend, &ha, TemperatureUnit::Celsius);
        let err = coordinator.tick(now()).unwrap_err();
        assert!(matches!(err, UpdateError::Unit(_)));
        assert!(coordinator.data().is_none());
    }

    #[test]
    fn rejected_token_is_an_authentication_failure() {
        let backend = FakeControl {
            reject_token: true,
            ..Default::default()
        };
        let ha = FakeHa::default();
        seed(&ha, "on", "20");

        let mut coordinator = build(&backend, &ha, TemperatureUnit::Celsius);
        let err = coordinator.tick(now()).unwrap_err();
        assert!(err.is_authentication());
    }
}
