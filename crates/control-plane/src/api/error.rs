//! Translation of domain errors into HTTP responses.
//!
//! Every error body is `{"error": "...", "error_code": "..."}` with the
//! stable code from [`nw_domain::Error::code`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use nw_domain::Error;
use nw_protocol::ErrorBody;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Wrapper giving domain errors an `IntoResponse` impl.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Invalid(_) | Error::ReferentialViolation(_) => StatusCode::BAD_REQUEST,
            Error::Disconnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::PoolExhausted
            | Error::Io(_)
            | Error::Json(_)
            | Error::Http(_)
            | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            error_code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// 403 with a stable `forbidden` code; the error taxonomy has no
/// dedicated variant because only the agent-config gate produces it.
pub fn forbidden(message: impl Into<String>) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorBody { error: message.into(), error_code: "forbidden".into() }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: Error) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn taxonomy_maps_to_expected_status_codes() {
        assert_eq!(status_of(Error::Unauthorized("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(Error::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(Error::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_of(Error::Invalid("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(Error::ReferentialViolation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(Error::PoolExhausted), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            status_of(Error::Disconnected("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(Error::Timeout("x".into())), StatusCode::GATEWAY_TIMEOUT);
    }
}
