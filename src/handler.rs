//! Per-tick backend bookkeeping: profile refresh, history backfill and the
//! choice of the scheduled value for "now".
//!
//! Each tick either refreshes the optimisation profile (when it expired or a
//! recalculation was requested) or uploads one batch of history older than
//! anything the backend stores. Before a refresh, every monitored entity whose
//! newest local reading is newer than the backend's newest is uploaded in
//! capped batches until the backend has caught up.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::client::{ApiError, BackendClient};
use crate::history::{date_bounds, states_to_readings};
use crate::homeassistant::{HaError, HomeAssistantClient};
use crate::models::backend::ControlInfo;
use crate::models::homeassistant::{EntityState, TemperatureUnit};
use crate::models::profile::{DataDates, HistoryColumn, HistoryReading, HistoryUpload, LambdaArgs, Profile, ProfileSample};

/// Added to the last profile timestamp to get the refresh deadline.
pub const PROFILE_EXPIRY_GRACE_MINUTES: i64 = 90;

/// Backend operations the handler depends on.
pub trait ProfileBackend {
    fn check_and_set_manual(&self, info: &ControlInfo) -> Result<bool, ApiError>;
    fn get_data_dates(&self) -> Result<DataDates, ApiError>;
    fn upload_history(&self, upload: &HistoryUpload) -> Result<DataDates, ApiError>;
    fn get_profile(&self, args: &LambdaArgs) -> Result<Profile, ApiError>;
}

impl ProfileBackend for BackendClient {
    fn check_and_set_manual(&self, info: &ControlInfo) -> Result<bool, ApiError> {
        BackendClient::check_and_set_manual(self, info)
    }

    fn get_data_dates(&self) -> Result<DataDates, ApiError> {
        BackendClient::get_data_dates(self)
    }

    fn upload_history(&self, upload: &HistoryUpload) -> Result<DataDates, ApiError> {
        BackendClient::upload_history(self, upload)
    }

    fn get_profile(&self, args: &LambdaArgs) -> Result<Profile, ApiError> {
        BackendClient::get_profile(self, args)
    }
}

/// Source of locally recorded state changes.
pub trait StateHistory {
    fn state_changes(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<EntityState>, HaError>;
}

impl StateHistory for HomeAssistantClient {
    fn state_changes(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<EntityState>, HaError> {
        self.get_history(entity_id, since, until)
    }
}

#[derive(Debug)]
pub enum UpdateError {
    Api(ApiError),
    HomeAssistant(HaError),
    /// No profile has been fetched yet.
    EmptyProfile,
    /// Every profile timestamp lies after the given instant.
    NoCurrentSample(DateTime<Utc>),
    Invariant(String),
    Unit(String),
}

impl core::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UpdateError::Api(e) => write!(f, "backend: {}", e),
            UpdateError::HomeAssistant(e) => write!(f, "home assistant: {}", e),
            UpdateError::EmptyProfile => write!(f, "no optimisation profile available"),
            UpdateError::NoCurrentSample(now) => write!(f, "profile has no sample at or before {}", now),
            UpdateError::Invariant(s) => write!(f, "{}", s),
            UpdateError::Unit(s) => write!(f, "unit error: {}", s),
        }
    }
}

impl std::error::Error for UpdateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpdateError::Api(e) => Some(e),
            UpdateError::HomeAssistant(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ApiError> for UpdateError {
    fn from(value: ApiError) -> Self {
        UpdateError::Api(value)
    }
}

impl From<HaError> for UpdateError {
    fn from(value: HaError) -> Self {
        UpdateError::HomeAssistant(value)
    }
}

impl UpdateError {
    /// Errors that need new credentials rather than another attempt.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            UpdateError::Api(ApiError::Authentication(_)) | UpdateError::HomeAssistant(HaError::Auth)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredEntity {
    pub entity_id: String,
    pub column: HistoryColumn,
}

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub user_hash: String,
    pub climate_entity_id: String,
    pub heat_pump_power_entity_id: Option<String>,
    pub external_temp_entity_id: Option<String>,
    pub postcode: String,
    pub tariff: String,
    pub history_days: i64,
    pub history_lookback_days: i64,
    pub max_upload_history_readings: usize,
    pub temperature_unit: TemperatureUnit,
}

/// States newer than `after`, oldest first, at most `max`.
pub fn missing_new_states(states: &[EntityState], after: DateTime<Utc>, max: usize) -> Vec<&EntityState> {
    states.iter().filter(|s| s.last_updated > after).take(max).collect()
}

/// States older than `before`, keeping the `max` most recent of them.
pub fn missing_old_states(states: &[EntityState], before: DateTime<Utc>, max: usize) -> Vec<&EntityState> {
    let older: Vec<&EntityState> = states.iter().filter(|s| s.last_updated < before).collect();
    let skip = older.len().saturating_sub(max);
    older.into_iter().skip(skip).collect()
}

/// Next batch of new history for one entity, oldest first. With nothing on
/// the backend the first-run window applies; an entity idle for longer than
/// the window sends its most recent readings so the backend gets a start.
pub fn new_history_batch(
    states: &[EntityState],
    backend_newest: Option<DateTime<Utc>>,
    first_run_cutoff: DateTime<Utc>,
    max: usize,
) -> Vec<&EntityState> {
    if let Some(after) = backend_newest {
        return missing_new_states(states, after, max);
    }
    let recent = missing_new_states(states, first_run_cutoff, max);
    if !recent.is_empty() {
        return recent;
    }
    let skip = states.len().saturating_sub(max);
    states.iter().skip(skip).collect()
}

/// Entities whose backend copy lags the local history. `None` on the backend
/// side means nothing was ever uploaded; entities without any local history
/// have nothing to send.
pub fn entities_missing(entities: &[MonitoredEntity], backend: &DataDates, local: &DataDates) -> Vec<MonitoredEntity> {
    entities
        .iter()
        .filter(|e| match (backend.newest(e.column), local.newest(e.column)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(b), Some(l)) => b < l,
        })
        .cloned()
        .collect()
}

pub struct BackendUpdateHandler<'a, B: ProfileBackend, H: StateHistory> {
    backend: &'a B,
    history: &'a H,
    settings: HandlerSettings,
    entities: Vec<MonitoredEntity>,
    expire_time: DateTime<Utc>,
    manual_update: bool,
    history_upload_complete: bool,
    outside_range_flag: bool,
    profile: Option<Profile>,
    backend_dates: DataDates,
    local_dates: DataDates,
}

impl<'a, B: ProfileBackend, H: StateHistory> BackendUpdateHandler<'a, B, H> {
    pub fn new(backend: &'a B, history: &'a H, settings: HandlerSettings) -> Self {
        // optional entities only take part when configured
        let mut entities = vec![MonitoredEntity {
            entity_id: settings.climate_entity_id.clone(),
            column: HistoryColumn::ClimateEntity,
        }];
        if let Some(id) = &settings.heat_pump_power_entity_id {
            entities.push(MonitoredEntity {
                entity_id: id.clone(),
                column: HistoryColumn::HeatPumpPower,
            });
        }
        if let Some(id) = &settings.external_temp_entity_id {
            entities.push(MonitoredEntity {
                entity_id: id.clone(),
                column: HistoryColumn::ExternalTemperature,
            });
        }
        debug!("Monitoring {} entit(ies) for user {}", entities.len(), settings.user_hash);

        BackendUpdateHandler {
            backend,
            history,
            settings,
            entities,
            expire_time: DateTime::<Utc>::MIN_UTC,
            manual_update: false,
            history_upload_complete: false,
            outside_range_flag: false,
            profile: None,
            backend_dates: DataDates::default(),
            local_dates: DataDates::default(),
        }
    }

    /// Forces a profile recalculation on the next tick.
    pub fn request_recalculation(&mut self) {
        self.manual_update = true;
    }

    pub fn expire_time(&self) -> DateTime<Utc> {
        self.expire_time
    }

    pub fn history_upload_complete(&self) -> bool {
        self.history_upload_complete
    }

    /// Runs one tick and returns the profile sample for `now`.
    pub fn update(&mut self, args: &LambdaArgs, now: DateTime<Utc>) -> Result<ProfileSample, UpdateError> {
        if !self.backend.check_and_set_manual(&args.control_info())? {
            warn!("Backend thermostat did not switch to manual control");
        }

        if now > self.expire_time || self.manual_update {
            self.refresh_profile(args, now)?;
        } else if !self.history_upload_complete {
            self.upload_old_history(now)?;
        }
        self.select(args, now)
    }

    fn local_states(&self, entity: &MonitoredEntity, now: DateTime<Utc>) -> Result<Vec<EntityState>, UpdateError> {
        let since = now - Duration::days(self.settings.history_lookback_days);
        let mut states = self.history.state_changes(&entity.entity_id, since, now)?;
        states.sort_by_key(|s| s.last_updated);
        Ok(states)
    }

    fn update_local_dates(&mut self, now: DateTime<Utc>) -> Result<(), UpdateError> {
        let mut dates = DataDates::default();
        for entity in &self.entities {
            let bounds = date_bounds(&self.local_states(entity, now)?);
            dates.oldest_dates.insert(entity.column, bounds.map(|b| b.0));
            dates.newest_dates.insert(entity.column, bounds.map(|b| b.1));
        }
        self.local_dates = dates;
        Ok(())
    }

    /// Entities with local readings the backend does not have yet.
    pub fn entities_missing_from_backend(&self) -> Vec<MonitoredEntity> {
        entities_missing(&self.entities, &self.backend_dates, &self.local_dates)
    }

    fn build_upload(
        &self,
        histories: BTreeMap<HistoryColumn, Vec<HistoryReading>>,
        constant_attributes: BTreeMap<HistoryColumn, Map<String, Value>>,
    ) -> HistoryUpload {
        HistoryUpload {
            user_hash: self.settings.user_hash.clone(),
            climate_entity_id: self.settings.climate_entity_id.clone(),
            postcode: self.settings.postcode.clone(),
            tariff: self.settings.tariff.clone(),
            histories,
            constant_attributes,
            upload_only: true,
        }
    }

    fn upload_new_history(&mut self, missing: &[MonitoredEntity], now: DateTime<Utc>) -> Result<(), UpdateError> {
        let mut histories = BTreeMap::new();
        let mut constants = BTreeMap::new();
        let first_run_cutoff = now - Duration::days(self.settings.history_days);

        for entity in missing {
            let states = self.local_states(entity, now)?;
            let backend_newest = self.backend_dates.newest(entity.column);
            let batch: Vec<EntityState> = new_history_batch(
                &states,
                backend_newest,
                first_run_cutoff,
                self.settings.max_upload_history_readings,
            )
            .into_iter()
            .cloned()
            .collect();
            if batch.is_empty() {
                debug!("({}) nothing newer than {:?}", entity.column, backend_newest);
                continue;
            }
            debug!(
                "({}) uploading {} new reading(s) {} .. {}",
                entity.column,
                batch.len(),
                batch[0].last_updated,
                batch[batch.len() - 1].last_updated
            );
            let (readings, attrs) = states_to_readings(entity.column, &batch, self.settings.temperature_unit);
            histories.insert(entity.column, readings);
            constants.insert(entity.column, attrs);
        }

        if histories.is_empty() {
            return Err(UpdateError::Invariant(
                "history flagged as missing but there is nothing new to upload".to_string(),
            ));
        }
        let upload = self.build_upload(histories, constants);
        self.backend_dates = self.backend.upload_history(&upload)?;
        Ok(())
    }

    /// Uploads one batch of readings older than anything on the backend.
    /// Marks the backfill complete, and asks for a recalculation, once there
    /// is nothing left.
    fn upload_old_history(&mut self, now: DateTime<Utc>) -> Result<(), UpdateError> {
        let mut histories = BTreeMap::new();
        let mut constants = BTreeMap::new();

        for entity in &self.entities {
            let Some(before) = self.backend_dates.oldest(entity.column) else {
                continue;
            };
            let states = self.local_states(entity, now)?;
            let batch: Vec<EntityState> = missing_old_states(&states, before, self.settings.max_upload_history_readings)
                .into_iter()
                .cloned()
                .collect();
            if batch.is_empty() {
                debug!("({}) old history upload complete", entity.column);
                continue;
            }
            debug!("({}) uploading {} old reading(s) before {}", entity.column, batch.len(), before);
            let (readings, attrs) = states_to_readings(entity.column, &batch, self.settings.temperature_unit);
            histories.insert(entity.column, readings);
            constants.insert(entity.column, attrs);
        }

        if histories.is_empty() {
            info!("History upload complete; recalculating heating profile");
            self.history_upload_complete = true;
            self.manual_update = true;
            return Ok(());
        }
        let upload = self.build_upload(histories, constants);
        self.backend_dates = self.backend.upload_history(&upload)?;
        Ok(())
    }

    fn refresh_profile(&mut self, args: &LambdaArgs, now: DateTime<Utc>) -> Result<(), UpdateError> {
        debug!("Refreshing heating profile (expired at {})", self.expire_time);
        self.backend_dates = self.backend.get_data_dates()?;
        self.update_local_dates(now)?;

        let mut round = 0;
        loop {
            let missing = self.entities_missing_from_backend();
            if missing.is_empty() {
                break;
            }
            round += 1;
            debug!("Uploading new history: round {}", round);
            let before = self.backend_dates.clone();
            self.upload_new_history(&missing, now)?;
            if self.backend_dates == before {
                return Err(UpdateError::Invariant(format!(
                    "backend dates did not advance after uploading history (round {})",
                    round
                )));
            }
        }

        let profile = self.backend.get_profile(args)?;
        let horizon = profile.horizon().ok_or(UpdateError::EmptyProfile)?;
        self.expire_time = horizon + Duration::minutes(PROFILE_EXPIRY_GRACE_MINUTES);
        info!(
            "Heating profile refreshed: {} slot(s), expires {}",
            profile.timestamp.len(),
            self.expire_time
        );
        self.profile = Some(profile);
        self.manual_update = false;
        Ok(())
    }

    fn select(&mut self, args: &LambdaArgs, now: DateTime<Utc>) -> Result<ProfileSample, UpdateError> {
        let profile = self.profile.as_ref().ok_or(UpdateError::EmptyProfile)?;
        let mut sample = profile.sample_at(now).ok_or(UpdateError::NoCurrentSample(now))?;

        if args.outside_range {
            debug!(
                "Internal temperature {:?} is outside {} of the set point; holding {}",
                args.initial_internal_temp, args.temp_range, args.set_point
            );
            sample.temp_controls = args.set_point;
            self.outside_range_flag = true;
        } else if self.outside_range_flag {
            info!("Temperature range reached; recalculating heating profile");
            self.manual_update = true;
            self.outside_range_flag = false;
        }
        Ok(sample)
    }
}
