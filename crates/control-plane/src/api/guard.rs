//! Admin auth guard — `AdminGuard` axum extractor.
//!
//! Handlers opt in by adding `_guard: AdminGuard` to their parameter
//! list; a missing or wrong `X-Admin-Token` header turns into 401
//! before the handler body runs.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use nw_protocol::ErrorBody;

use crate::state::AppState;

/// Enforces the `X-Admin-Token` header.
///
/// The provided token is hashed to a fixed-length digest and compared
/// in constant time, so neither the token's content nor its length
/// leaks through timing.
pub struct AdminGuard;

#[async_trait]
impl FromRequestParts<AppState> for AdminGuard {
    type Rejection = (StatusCode, Json<ErrorBody>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get("x-admin-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let provided_hash = Sha256::digest(provided.as_bytes());
        if !bool::from(provided_hash.ct_eq(state.admin_token_hash.as_slice())) {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "invalid admin token".into(),
                    error_code: "unauthorized".into(),
                }),
            ));
        }
        Ok(AdminGuard)
    }
}
