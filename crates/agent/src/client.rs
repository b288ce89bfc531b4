//! HTTP client for the control plane's agent endpoints.

use std::time::Duration;

use nw_domain::{Error, Result};
use nw_protocol::{
    AgentConfig, ErrorBody, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse,
};

/// Blocking-free client over reqwest; one instance per agent process.
pub struct ControlPlaneClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(ControlPlaneClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse> {
        let url = format!("{}/api/v1/agent/register", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn get_config(&self, hostname: &str) -> Result<AgentConfig> {
        let url = format!("{}/api/v1/agent/config", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("hostname", hostname)])
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Self::parse(response).await
    }

    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let url = format!("{}/api/v1/agent/heartbeat", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Self::parse(response).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Error::Http(format!("decoding response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(error_from_status(status.as_u16(), &body))
    }
}

/// Map an HTTP error response back to the domain taxonomy, preferring
/// the server's `error_code` when the body parses.
fn error_from_status(status: u16, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| format!("HTTP {status}"));

    match status {
        401 | 403 => Error::Unauthorized(message),
        404 => Error::NotFound(message),
        409 => Error::Conflict(message),
        400 => Error::Invalid(message),
        503 => Error::Disconnected(message),
        504 => Error::Timeout(message),
        _ => Error::Http(format!("HTTP {status}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = ControlPlaneClient::new("http://cp.internal:8001/").unwrap();
        assert_eq!(client.base_url(), "http://cp.internal:8001");
    }

    #[test]
    fn error_mapping_prefers_server_body() {
        let body = r#"{"error":"node status is pending","error_code":"forbidden"}"#;
        let err = error_from_status(403, body);
        assert!(matches!(err, Error::Unauthorized(m) if m.contains("pending")));

        let err = error_from_status(409, "not json");
        assert!(matches!(err, Error::Conflict(m) if m.contains("409")));

        let err = error_from_status(500, "{}");
        assert!(matches!(err, Error::Http(_)));
    }
}
