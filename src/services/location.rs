use http::StatusCode;
use log::warn;
use serde_json::Value;

use crate::client::{ApiError, Transport};
use crate::models::backend::{LocationRequest, LocationResponse};

pub fn add_location(
    transport: &Transport,
    token: &str,
    request: &LocationRequest,
) -> Result<LocationResponse, ApiError> {
    let url = transport.url(&transport.config().backend.location.base, &[]);
    transport.post_json(
        "add location",
        &url,
        Some(token),
        request,
        StatusCode::CREATED,
        ApiError::Location,
    )
}

/// Lists the account's locations. Elements that do not decode are skipped.
pub fn get_locations(transport: &Transport, token: &str) -> Result<Vec<LocationResponse>, ApiError> {
    let url = transport.url(&transport.config().backend.location.base, &[]);
    let raw: Vec<Value> = transport.get_json("get locations", &url, token, &[], StatusCode::OK, ApiError::Location)?;
    Ok(raw
        .into_iter()
        .filter_map(|v| match serde_json::from_value::<LocationResponse>(v) {
            Ok(l) => Some(l),
            Err(e) => {
                warn!("Skipping malformed location: {}", e);
                None
            }
        })
        .collect())
}
