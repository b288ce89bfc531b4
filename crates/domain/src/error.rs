/// Shared error type used across all NetWarden crates.
///
/// API layers translate these into HTTP status codes; the stable
/// [`code`](Error::code) string travels in error response bodies so
/// clients can match on it without parsing messages.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("referential violation: {0}")]
    ReferentialViolation(String),

    #[error("overlay IP pool exhausted")]
    PoolExhausted,

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Http(_) => "http_error",
            Error::Unauthorized(_) => "unauthorized",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Invalid(_) => "invalid",
            Error::ReferentialViolation(_) => "referential_violation",
            Error::PoolExhausted => "pool_exhausted",
            Error::Disconnected(_) => "disconnected",
            Error::Timeout(_) => "timeout",
            Error::Config(_) => "config_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
