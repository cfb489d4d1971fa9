//! Thermostat control, prediction graph, history upload and profile calls.

use http::StatusCode;
use serde::Serialize;

use crate::client::{ApiError, Transport};
use crate::models::backend::{ThermostatControlRequest, ThermostatControlResponse, ThermostatPrediction};
use crate::models::profile::{DataDates, HistoryUpload, LambdaArgs, Profile};

fn thermostat_url(transport: &Transport, template: &str, thermostat_id: i64) -> String {
    transport.url(template, &[("thermostat_id", thermostat_id.to_string())])
}

pub fn get_control(
    transport: &Transport,
    token: &str,
    thermostat_id: i64,
) -> Result<ThermostatControlResponse, ApiError> {
    let url = thermostat_url(transport, &transport.config().backend.thermostat.control, thermostat_id);
    transport.get_json(
        "get thermostat control",
        &url,
        token,
        &[],
        StatusCode::OK,
        ApiError::Thermostat,
    )
}

pub fn create_manual(
    transport: &Transport,
    token: &str,
    thermostat_id: i64,
    request: &ThermostatControlRequest,
) -> Result<ThermostatControlResponse, ApiError> {
    let url = thermostat_url(transport, &transport.config().backend.thermostat.manual, thermostat_id);
    transport.post_json(
        "create thermostat manual control",
        &url,
        Some(token),
        request,
        StatusCode::CREATED,
        ApiError::Thermostat,
    )
}

pub fn get_graph(
    transport: &Transport,
    token: &str,
    thermostat_id: i64,
    hours_from_now: u32,
) -> Result<Vec<ThermostatPrediction>, ApiError> {
    let url = thermostat_url(transport, &transport.config().backend.thermostat.graph, thermostat_id);
    transport.get_json(
        "get thermostat graph",
        &url,
        token,
        &[("hours_from_now", hours_from_now.to_string())],
        StatusCode::OK,
        ApiError::Thermostat,
    )
}

pub fn get_data_dates(transport: &Transport, token: &str, thermostat_id: i64) -> Result<DataDates, ApiError> {
    let url = thermostat_url(transport, &transport.config().backend.thermostat.data_dates, thermostat_id);
    transport.get_json("get data dates", &url, token, &[], StatusCode::OK, ApiError::Thermostat)
}

pub fn upload_history(
    transport: &Transport,
    token: &str,
    thermostat_id: i64,
    upload: &HistoryUpload,
) -> Result<DataDates, ApiError> {
    let url = thermostat_url(transport, &transport.config().backend.thermostat.history, thermostat_id);
    transport.post_json(
        "upload history",
        &url,
        Some(token),
        upload,
        StatusCode::OK,
        ApiError::Thermostat,
    )
}

#[derive(Serialize)]
struct ProfileRequest<'a> {
    #[serde(flatten)]
    args: &'a LambdaArgs,
    get_profile_only: bool,
}

pub fn get_profile(
    transport: &Transport,
    token: &str,
    thermostat_id: i64,
    args: &LambdaArgs,
) -> Result<Profile, ApiError> {
    let url = thermostat_url(transport, &transport.config().backend.thermostat.profile, thermostat_id);
    let body = ProfileRequest {
        args,
        get_profile_only: true,
    };
    transport.post_json("get profile", &url, Some(token), &body, StatusCode::OK, ApiError::Profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::transport_for;
    use chrono::{TimeZone, Utc};
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[test]
    fn graph_sends_hours_and_decodes_predictions() {
        let mut server = Server::new();
        let mock = server
            .mock("GET", "/thermostats/5/graph")
            .match_query(Matcher::UrlEncoded("hours_from_now".into(), "24".into()))
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_body(
                json!([
                    {"date": "2024-06-08T10:00:00.000Z", "mode": "Heating", "setPoint": 20.5, "externalTemperature": 11.0},
                    {"date": "2024-06-08T10:30:00.000Z", "mode": "Heating", "setPoint": 21.0, "externalTemperature": null}
                ])
                .to_string(),
            )
            .create();

        let t = transport_for(&server);
        let graph = get_graph(&t, "tok", 5, 24).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph[0].date, Utc.with_ymd_and_hms(2024, 6, 8, 10, 0, 0).unwrap());
        assert_eq!(graph[1].external_temperature, None);
        mock.assert();
    }

    #[test]
    fn manual_control_expects_created() {
        let mut server = Server::new();
        server
            .mock("POST", "/thermostats/5/control/manual")
            .with_status(200)
            .with_body("{}")
            .create();

        let t = transport_for(&server);
        let req = ThermostatControlRequest::manual(crate::models::backend::WorkingMode::Heating, 20.0);
        let err = create_manual(&t, "tok", 5, &req).unwrap_err();
        assert!(matches!(err, ApiError::Thermostat(_)), "{}", err);
    }

    #[test]
    fn malformed_control_reports_json_path() {
        let mut server = Server::new();
        server
            .mock("GET", "/thermostats/5/control")
            .with_status(200)
            .with_body(r#"{"thermostatId": 5, "status": "paused", "mode": "Heating"}"#)
            .create();

        let t = transport_for(&server);
        match get_control(&t, "tok", 5) {
            Err(ApiError::Thermostat(msg)) => assert!(msg.contains("status"), "{}", msg),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
