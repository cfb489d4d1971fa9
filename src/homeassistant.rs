//! Home Assistant REST client (states, history, services, config).
//!
//! Blocking `ureq` agent authenticated with a long-lived access token.

use chrono::{DateTime, SecondsFormat, Utc};
use http::StatusCode;
use log::{debug, trace};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::time::Duration;

use crate::models::homeassistant::{EntityState, HaConfig, StateUpdate, TemperatureUnit};

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
pub enum HaError {
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
    EntityNotFound(String),
    Auth,
    InvalidState(String),
}

impl core::fmt::Display for HaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HaError::Transport(s) => write!(f, "transport error: {}", s),
            HaError::Http { status, message } => write!(f, "http {}: {}", status, message),
            HaError::Json(e) => write!(f, "json error: {}", e),
            HaError::EntityNotFound(id) => write!(f, "entity not found: {}", id),
            HaError::Auth => write!(f, "home assistant rejected the access token"),
            HaError::InvalidState(s) => write!(f, "invalid state: {}", s),
        }
    }
}

impl std::error::Error for HaError {}

impl From<ureq::Error> for HaError {
    fn from(value: ureq::Error) -> Self {
        HaError::Transport(value.to_string())
    }
}

pub struct HomeAssistantClient {
    agent: ureq::Agent,
    base_url: String,
    token: String,
}

impl HomeAssistantClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let cfg = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
            .build();
        HomeAssistantClient {
            agent: ureq::Agent::new_with_config(cfg),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn read<T: DeserializeOwned>(
        subject: &str,
        result: Result<http::Response<ureq::Body>, ureq::Error>,
    ) -> Result<T, HaError> {
        let mut resp = result?;
        let status = resp.status();
        let body = resp.body_mut().read_to_string()?;
        match status {
            s if s.is_success() => {
                let body = if body.trim().is_empty() { "null" } else { body.as_str() };
                serde_json::from_str(body).map_err(|e| HaError::Json(format!("{}: {}", subject, e)))
            }
            StatusCode::NOT_FOUND => Err(HaError::EntityNotFound(subject.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HaError::Auth),
            s => Err(HaError::Http {
                status: s.as_u16(),
                message: body,
            }),
        }
    }

    fn get<T: DeserializeOwned>(&self, subject: &str, path: &str, query: &[(&str, String)]) -> Result<T, HaError> {
        let mut req = self
            .agent
            .get(&self.url(path))
            .header("Authorization", self.bearer())
            .header("Accept", "application/json");
        for (k, v) in query {
            req = req.query(*k, v);
        }
        Self::read(subject, req.call())
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, subject: &str, path: &str, body: &B) -> Result<T, HaError> {
        let req = self
            .agent
            .post(&self.url(path))
            .header("Authorization", self.bearer())
            .header("Content-Type", "application/json");
        Self::read(subject, req.send_json(body))
    }

    pub fn get_config(&self) -> Result<HaConfig, HaError> {
        self.get("config", "/api/config", &[])
    }

    /// Temperature unit of the Home Assistant unit system; climate
    /// attributes are expressed in it.
    pub fn temperature_unit(&self) -> Result<(TemperatureUnit, String), HaError> {
        let cfg = self.get_config()?;
        let unit = TemperatureUnit::parse(&cfg.unit_system.temperature).ok_or_else(|| {
            HaError::InvalidState(format!("unsupported temperature unit {}", cfg.unit_system.temperature))
        })?;
        Ok((unit, cfg.version))
    }

    pub fn get_state(&self, entity_id: &str) -> Result<EntityState, HaError> {
        let state: EntityState = self.get(entity_id, &format!("/api/states/{}", entity_id), &[])?;
        trace!("{} = {:?}", entity_id, state.state);
        Ok(state)
    }

    /// Creates or replaces the state of an entity owned by the bridge.
    pub fn set_state(&self, entity_id: &str, state: impl Into<String>, attributes: Map<String, Value>) -> Result<(), HaError> {
        let update = StateUpdate {
            state: state.into(),
            attributes,
        };
        let _: Value = self.post(entity_id, &format!("/api/states/{}", entity_id), &update)?;
        Ok(())
    }

    /// State changes of one entity between `start` and `end`, oldest first.
    pub fn get_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EntityState>, HaError> {
        let start_str = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let query = [
            ("filter_entity_id", entity_id.to_string()),
            ("end_time", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ];
        let mut history: Vec<Vec<EntityState>> =
            self.get(entity_id, &format!("/api/history/period/{}", start_str), &query)?;
        let mut states = if history.is_empty() { Vec::new() } else { history.swap_remove(0) };
        states.sort_by_key(|s| s.last_updated);
        debug!("History for {}: {} state(s) since {}", entity_id, states.len(), start_str);
        Ok(states)
    }

    pub fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<(), HaError> {
        debug!("Calling service {}.{} with {}", domain, service, data);
        let _: Value = self.post(
            &format!("{}.{}", domain, service),
            &format!("/api/services/{}/{}", domain, service),
            &data,
        )?;
        Ok(())
    }

    /// `climate.set_temperature`; ranged entities get the low bound and keep
    /// their current high bound.
    pub fn set_climate_temperature(&self, climate: &EntityState, temperature: f64) -> Result<(), HaError> {
        let data = if climate.supports_target_range() {
            json!({
                "entity_id": climate.entity_id,
                "target_temp_low": temperature,
                "target_temp_high": climate.attr_f64("target_temp_high"),
            })
        } else {
            json!({
                "entity_id": climate.entity_id,
                "temperature": temperature,
            })
        };
        self.call_service("climate", "set_temperature", data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn state_json(entity_id: &str, state: &str, attrs: Value, at: &str) -> Value {
        json!({
            "entity_id": entity_id,
            "state": state,
            "attributes": attrs,
            "last_changed": at,
            "last_updated": at
        })
    }

    #[test]
    fn get_state_success() {
        let mut server = Server::new();
        let mock = server
            .mock("GET", "/api/states/sensor.heat_pump_power")
            .match_header("authorization", "Bearer test_token")
            .with_status(200)
            .with_body(
                state_json(
                    "sensor.heat_pump_power",
                    "1250",
                    json!({"unit_of_measurement": "W"}),
                    "2024-06-08T10:00:00+00:00",
                )
                .to_string(),
            )
            .create();

        let client = HomeAssistantClient::new(server.url(), "test_token");
        let state = client.get_state("sensor.heat_pump_power").unwrap();
        assert_eq!(state.state_f64(), Some(1250.0));
        assert_eq!(state.unit_of_measurement(), Some("W"));
        mock.assert();
    }

    #[test]
    fn get_state_not_found() {
        let mut server = Server::new();
        server.mock("GET", "/api/states/sensor.missing").with_status(404).create();
        let client = HomeAssistantClient::new(server.url(), "test_token");
        assert!(matches!(client.get_state("sensor.missing"), Err(HaError::EntityNotFound(_))));
    }

    #[test]
    fn history_is_sorted_and_unwrapped() {
        let mut server = Server::new();
        let mock = server
            .mock("GET", "/api/history/period/2024-06-01T00:00:00Z")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("filter_entity_id".into(), "sensor.outside".into()),
                Matcher::UrlEncoded("end_time".into(), "2024-06-08T00:00:00Z".into()),
            ]))
            .with_status(200)
            .with_body(
                json!([[
                    state_json("sensor.outside", "12.5", json!({}), "2024-06-02T10:00:00+00:00"),
                    state_json("sensor.outside", "11.0", json!({}), "2024-06-01T10:00:00+00:00")
                ]])
                .to_string(),
            )
            .create();

        let client = HomeAssistantClient::new(server.url(), "t");
        let start = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let end = DateTime::parse_from_rfc3339("2024-06-08T00:00:00Z").unwrap().with_timezone(&Utc);
        let states = client.get_history("sensor.outside", start, end).unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].state, "11.0");
        mock.assert();
    }

    #[test]
    fn ranged_climate_sets_low_bound() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/api/services/climate/set_temperature")
            .match_body(Matcher::Json(json!({
                "entity_id": "climate.heat_pump",
                "target_temp_low": 19.0,
                "target_temp_high": 24.0
            })))
            .with_status(200)
            .with_body("[]")
            .create();

        let climate: EntityState = serde_json::from_value(state_json(
            "climate.heat_pump",
            "heat_cool",
            json!({"supported_features": 2, "target_temp_low": 20.0, "target_temp_high": 24.0}),
            "2024-06-08T10:00:00+00:00",
        ))
        .unwrap();
        let client = HomeAssistantClient::new(server.url(), "t");
        client.set_climate_temperature(&climate, 19.0).unwrap();
        mock.assert();
    }

    #[test]
    fn unit_system_is_read_from_config() {
        let mut server = Server::new();
        server
            .mock("GET", "/api/config")
            .with_status(200)
            .with_body(json!({"unit_system": {"temperature": "°F"}, "version": "2024.6.1"}).to_string())
            .create();
        let client = HomeAssistantClient::new(server.url(), "t");
        let (unit, version) = client.temperature_unit().unwrap();
        assert_eq!(unit, TemperatureUnit::Fahrenheit);
        assert_eq!(version, "2024.6.1");
    }

    #[test]
    fn rejected_token_is_auth_error() {
        let mut server = Server::new();
        server.mock("GET", "/api/config").with_status(401).create();
        let client = HomeAssistantClient::new(server.url(), "bad");
        assert!(matches!(client.get_config(), Err(HaError::Auth)));
    }
}
