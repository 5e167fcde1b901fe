pub mod files;
pub mod upload;

use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::models::Claims;
use crate::AppState;

pub(crate) type AuthError = (StatusCode, Json<serde_json::Value>);

/// Extract and verify the bearer token, yielding the caller's user id.
pub(crate) fn authorize_bearer(headers: &HeaderMap, state: &AppState) -> Result<i64, AuthError> {
    let token = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "No token" })),
        ))?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| {
        (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "error": "Invalid token" })),
        )
    })?;

    Ok(data.claims.user_id)
}
