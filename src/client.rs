//! HTTP client for the OptiSpark backend.
//!
//! - Blocking client using `ureq` (no async), one agent shared by all services.
//! - `Transport` owns status-code checking and JSON decoding; the REST calls
//!   themselves live in `crate::services::{auth, location, device, thermostat}`.
//! - `BackendClient` owns the session and exposes what the update handler and
//!   the coordinator need.
//!
//! Authentication
//! - Logs in lazily with the user hash. The JWT `exp` claim is checked before
//!   every call; an expired or unreadable token triggers a fresh login.
//! - After login the account is onboarded: a location and a device are created
//!   when the backend reports none.
//! - Any 401/403 drops the token so the following call logs in again. Nothing
//!   is retried within a call.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use http::StatusCode;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::cell::RefCell;
use std::sync::Arc;

use crate::config::BackendConfig;
use crate::models::backend::*;
use crate::models::profile::{DataDates, HistoryUpload, LambdaArgs, Profile};
use crate::services::{auth, device, location, thermostat};

pub const INTEGRATION_NAME: &str = "home_assistant";
pub const TARIFF_ID: i64 = 1;
pub const TARIFF_PRODUCT_CODE: &str = "AGILE-FLEX-22-11-25";
const TOKEN_EXPIRY_LEEWAY_SECS: i64 = 30;

#[derive(Debug)]
pub enum ApiError {
    Authentication(String),
    Communication(String),
    Timeout(String),
    Location(String),
    Device(String),
    Thermostat(String),
    Profile(String),
}

impl core::fmt::Display for ApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ApiError::Authentication(s) => write!(f, "authentication error: {}", s),
            ApiError::Communication(s) => write!(f, "communication error: {}", s),
            ApiError::Timeout(s) => write!(f, "timeout: {}", s),
            ApiError::Location(s) => write!(f, "location error: {}", s),
            ApiError::Device(s) => write!(f, "device error: {}", s),
            ApiError::Thermostat(s) => write!(f, "thermostat error: {}", s),
            ApiError::Profile(s) => write!(f, "profile error: {}", s),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    fn from_transport(what: &str, err: ureq::Error) -> Self {
        match err {
            e @ ureq::Error::Timeout(_) => ApiError::Timeout(format!("{}: {}", what, e)),
            other => ApiError::Communication(format!("{}: {}", what, other)),
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ApiError::Authentication(_))
    }
}

/// Builds a domain error from a message (`ApiError::Location`, ...).
pub type ErrorKind = fn(String) -> ApiError;

/// Shared HTTP plumbing for the backend services.
#[derive(Clone)]
pub struct Transport {
    agent: ureq::Agent,
    cfg: Arc<BackendConfig>,
}

impl Transport {
    pub fn new(cfg: BackendConfig) -> Self {
        let tls = ureq::tls::TlsConfig::builder()
            .disable_verification(!cfg.backend.verify_ssl)
            .build();
        let agent_cfg = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(cfg.timeout()))
            .tls_config(tls)
            .build();
        if !cfg.backend.verify_ssl {
            warn!("TLS certificate verification is disabled for {}", cfg.backend.base_url);
        }
        Transport {
            agent: ureq::Agent::new_with_config(agent_cfg),
            cfg: Arc::new(cfg),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.cfg
    }

    /// Joins `path` onto the base URL and fills `{name}` placeholders.
    pub fn url(&self, path: &str, params: &[(&str, String)]) -> String {
        let base = self.cfg.backend.base_url.trim_end_matches('/');
        let mut url = if path.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, path.trim_start_matches('/'))
        };
        for (name, value) in params {
            url = url.replace(&format!("{{{}}}", name), value);
        }
        url
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        what: &str,
        url: &str,
        token: &str,
        query: &[(&str, String)],
        expected: StatusCode,
        kind: ErrorKind,
    ) -> Result<T, ApiError> {
        debug!("GET {} ({})", url, what);
        let mut req = self
            .agent
            .get(url)
            .header("Accept", "application/json")
            .header("Authorization", format!("Bearer {}", token));
        for (k, v) in query {
            req = req.query(*k, v);
        }
        Self::handle(what, req.call(), expected, kind)
    }

    pub fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        what: &str,
        url: &str,
        token: Option<&str>,
        body: &B,
        expected: StatusCode,
        kind: ErrorKind,
    ) -> Result<T, ApiError> {
        debug!("POST {} ({})", url, what);
        let mut req = self
            .agent
            .post(url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        Self::handle(what, req.send_json(body), expected, kind)
    }

    fn handle<T: DeserializeOwned>(
        what: &str,
        result: Result<http::Response<ureq::Body>, ureq::Error>,
        expected: StatusCode,
        kind: ErrorKind,
    ) -> Result<T, ApiError> {
        let mut resp = result.map_err(|e| ApiError::from_transport(what, e))?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Authentication(format!(
                "{}: invalid credentials (http {})",
                what,
                status.as_u16()
            )));
        }
        if status == StatusCode::BAD_GATEWAY {
            return Err(ApiError::Communication(format!("{}: 502 Bad Gateway - check payload", what)));
        }

        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| ApiError::from_transport(what, e))?;
        if status != expected {
            return Err(kind(format!("{} failed: http {}: {}", what, status.as_u16(), body)));
        }
        decode(&body).map_err(|e| kind(format!("{}: {}", what, e)))
    }
}

/// Decodes a JSON body, reporting the path of the first mismatch. Empty
/// bodies decode as `null`.
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, String> {
    let body = if body.trim().is_empty() { "null" } else { body };
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|e| format!("json error at {}: {}", e.path(), e.inner()))
}

/// True when the JWT's `exp` claim is at or before `now` (with leeway), or
/// the token cannot be read.
pub fn token_expired(token: &str, now: DateTime<Utc>) -> bool {
    #[derive(serde::Deserialize)]
    struct Claims {
        exp: Option<i64>,
    }

    let Some(payload) = token.split('.').nth(1) else {
        return true;
    };
    let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) else {
        return true;
    };
    let Ok(claims) = serde_json::from_slice::<Claims>(&bytes) else {
        return true;
    };
    match claims.exp.and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0)) {
        Some(exp) => exp <= now + Duration::seconds(TOKEN_EXPIRY_LEEWAY_SECS),
        // tokens without expiry never go stale on their own
        None => false,
    }
}

#[derive(Debug, Default)]
struct Session {
    token: Option<String>,
    has_locations: bool,
    has_devices: bool,
    thermostat_id: Option<i64>,
    device_id: Option<i64>,
}

pub struct BackendClient {
    transport: Transport,
    user_hash: String,
    address: Address,
    session: RefCell<Session>,
}

impl BackendClient {
    pub fn new(transport: Transport, user_hash: impl Into<String>, address: Address) -> Self {
        BackendClient {
            transport,
            user_hash: user_hash.into(),
            address,
            session: RefCell::new(Session::default()),
        }
    }

    /// Current bearer token, logging in and onboarding as needed.
    fn bearer(&self) -> Result<String, ApiError> {
        let mut s = self.session.borrow_mut();
        let needs_login = match &s.token {
            None => true,
            Some(t) => token_expired(t, Utc::now()),
        };
        if needs_login {
            if s.token.is_some() {
                info!("Backend token expired; logging in again");
            }
            let login = auth::login(&self.transport, &self.user_hash)?;
            debug!("Logged in (token type {})", login.token_type);
            s.token = Some(login.access_token);
            s.has_locations = login.has_locations;
            s.has_devices = login.has_devices;
        }
        let token = s.token.clone().ok_or_else(|| ApiError::Authentication("no token after login".into()))?;

        let mut created: Option<LocationResponse> = None;
        if !s.has_locations {
            info!("No location registered; creating one for {}", self.address);
            let request = LocationRequest {
                name: "home".to_string(),
                address: LocationAddress::from(&self.address),
                tariff_id: TARIFF_ID,
                tariff_params: json!({
                    "product_code": TARIFF_PRODUCT_CODE,
                    "tariff_code": format!("E-1R-{}-C", TARIFF_PRODUCT_CODE),
                }),
            };
            let location = location::add_location(&self.transport, &token, &request)?;
            s.has_locations = true;
            s.thermostat_id = Some(location.thermostat_id);
            created = Some(location);
        }
        if !s.has_devices {
            let location = match created {
                Some(l) => l,
                None => location::get_locations(&self.transport, &token)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ApiError::Location("account has no locations".into()))?,
            };
            info!("No device registered; creating heat pump device on location {}", location.id);
            let request = DeviceRequest {
                name: "Heat Pump".to_string(),
                location_id: location.id,
                manufacturer: "ha".to_string(),
                model_name: "ha_model".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                integration_type: INTEGRATION_NAME.to_string(),
                integration_params: json!({}),
            };
            let created_device = device::add_device(&self.transport, &token, &request)?;
            s.has_devices = true;
            s.device_id = Some(created_device.id);
        }
        Ok(token)
    }

    /// Runs `f` with a valid token; authentication failures drop the token.
    fn authed<T>(&self, f: impl FnOnce(&str) -> Result<T, ApiError>) -> Result<T, ApiError> {
        let token = match self.bearer() {
            Ok(t) => t,
            Err(e) => {
                if e.is_authentication() {
                    self.session.borrow_mut().token = None;
                }
                return Err(e);
            }
        };
        let result = f(&token);
        if let Err(e) = &result
            && e.is_authentication()
        {
            warn!("Backend rejected token: {}", e);
            self.session.borrow_mut().token = None;
        }
        result
    }

    fn thermostat_id(&self) -> Result<i64, ApiError> {
        if let Some(id) = self.session.borrow().thermostat_id {
            return Ok(id);
        }
        let locations = self.authed(|token| location::get_locations(&self.transport, token))?;
        let id = locations
            .first()
            .map(|l| l.thermostat_id)
            .ok_or_else(|| ApiError::Location("account has no locations".into()))?;
        self.session.borrow_mut().thermostat_id = Some(id);
        Ok(id)
    }

    fn device_id(&self) -> Result<i64, ApiError> {
        if let Some(id) = self.session.borrow().device_id {
            return Ok(id);
        }
        let devices = self.authed(|token| device::get_devices(&self.transport, token))?;
        let id = devices
            .first()
            .map(|d| d.id)
            .ok_or_else(|| ApiError::Device("account has no devices".into()))?;
        self.session.borrow_mut().device_id = Some(id);
        Ok(id)
    }

    pub fn get_thermostat_control(&self) -> Result<ThermostatControlResponse, ApiError> {
        let id = self.thermostat_id()?;
        self.authed(|token| thermostat::get_control(&self.transport, token, id))
    }

    pub fn get_thermostat_info(&self) -> Result<ThermostatInfo, ApiError> {
        self.get_thermostat_control().map(|c| ThermostatInfo::from(&c))
    }

    /// Forces manual control with the given set point and mode.
    pub fn set_manual(&self, info: &ControlInfo) -> Result<ThermostatControlResponse, ApiError> {
        let id = self.thermostat_id()?;
        let mode = WorkingMode::parse(&info.mode)
            .ok_or_else(|| ApiError::Thermostat(format!("unknown working mode {:?}", info.mode)))?;
        let request = ThermostatControlRequest::manual(mode, info.set_point);
        self.authed(|token| thermostat::create_manual(&self.transport, token, id, &request))
    }

    /// Ensures the thermostat runs in manual mode. Returns whether it does
    /// after the call.
    pub fn check_and_set_manual(&self, info: &ControlInfo) -> Result<bool, ApiError> {
        let control = self.get_thermostat_control()?;
        if control.status == ThermostatControlStatus::Manual {
            return Ok(true);
        }
        debug!("Control in {} status, requesting manual ({})", control.status, info);
        let manual = self.set_manual(info)?;
        debug!(
            "Created control: {} - {} - {:?} / {:?}",
            manual.status, manual.mode, manual.heat_set_point, manual.cool_set_point
        );
        Ok(manual.status == ThermostatControlStatus::Manual)
    }

    pub fn get_data_dates(&self) -> Result<DataDates, ApiError> {
        let id = self.thermostat_id()?;
        self.authed(|token| thermostat::get_data_dates(&self.transport, token, id))
    }

    /// Uploads history without recalculating the profile; returns the dates
    /// the backend holds afterwards.
    pub fn upload_history(&self, upload: &HistoryUpload) -> Result<DataDates, ApiError> {
        let id = self.thermostat_id()?;
        self.authed(|token| thermostat::upload_history(&self.transport, token, id, upload))
    }

    pub fn get_profile(&self, args: &LambdaArgs) -> Result<Profile, ApiError> {
        let id = self.thermostat_id()?;
        let mut profile = self.authed(|token| thermostat::get_profile(&self.transport, token, id, args))?;
        profile.validate().map_err(ApiError::Profile)?;
        profile.compute_savings();
        Ok(profile)
    }

    pub fn get_predictions(&self) -> Result<Vec<ThermostatPrediction>, ApiError> {
        let id = self.thermostat_id()?;
        let hours = self.transport.config().hours_from_now;
        self.authed(|token| thermostat::get_graph(&self.transport, token, id, hours))
    }

    pub fn upload_device_data(&self, data: &DeviceDataRequest) -> Result<(), ApiError> {
        let id = self.device_id()?;
        self.authed(|token| device::upload_data(&self.transport, token, id, data))
    }
}
