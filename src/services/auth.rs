use http::StatusCode;

use crate::client::{ApiError, Transport};
use crate::models::backend::{LoginRequest, LoginResponse};

/// Exchanges the user hash for a bearer token.
pub fn login(transport: &Transport, user_hash: &str) -> Result<LoginResponse, ApiError> {
    let url = transport.url(&transport.config().backend.auth.login, &[]);
    transport.post_json(
        "login",
        &url,
        None,
        &LoginRequest { user_hash },
        StatusCode::OK,
        ApiError::Authentication,
    )
}
