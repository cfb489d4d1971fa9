use http::StatusCode;
use serde_json::Value;

use crate::client::{ApiError, Transport};
use crate::models::backend::{DeviceDataRequest, DeviceRequest, DeviceResponse};

pub fn add_device(transport: &Transport, token: &str, request: &DeviceRequest) -> Result<DeviceResponse, ApiError> {
    let url = transport.url(&transport.config().backend.device.base, &[]);
    transport.post_json("add device", &url, Some(token), request, StatusCode::CREATED, ApiError::Device)
}

pub fn get_devices(transport: &Transport, token: &str) -> Result<Vec<DeviceResponse>, ApiError> {
    let url = transport.url(&transport.config().backend.device.base, &[]);
    transport.get_json("get devices", &url, token, &[], StatusCode::OK, ApiError::Device)
}

/// Pushes one live reading for `device_id`.
pub fn upload_data(
    transport: &Transport,
    token: &str,
    device_id: i64,
    data: &DeviceDataRequest,
) -> Result<(), ApiError> {
    let url = transport.url(
        &transport.config().backend.device.data,
        &[("device_id", device_id.to_string())],
    );
    let _: Value = transport.post_json(
        "upload device data",
        &url,
        Some(token),
        data,
        StatusCode::CREATED,
        ApiError::Device,
    )?;
    Ok(())
}
