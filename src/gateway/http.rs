//! HTTP transport for live external calls.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::error::GatewayError;
use super::types::TransportRequest;

// =============================================================================
// TRAIT
// =============================================================================

/// Performs one live call described by a [`TransportRequest`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &TransportRequest) -> Result<Value, GatewayError>;
}

// =============================================================================
// REQWEST TRANSPORT
// =============================================================================

/// Maximum allowed response body (4MB).
const MAX_RESPONSE_LEN: usize = 4 * 1_024 * 1_024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> Result<Self, GatewayError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Timeout applied when a request does not carry its own.
    pub fn with_timeout(default_timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            default_timeout,
        })
    }

    fn build(&self, request: &TransportRequest) -> (reqwest::RequestBuilder, Duration) {
        let timeout = request
            .timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let builder = match request {
            TransportRequest::HttpJson {
                url,
                method,
                headers,
                body,
                ..
            } => {
                let mut builder = self.client.request(method.as_reqwest(), url);
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                // Headers first: `json` only sets Content-Type when absent.
                if let Some(body) = body {
                    builder = builder.json(body);
                }
                builder
            }
            TransportRequest::HttpForm {
                url, method, form, ..
            } => self.client.request(method.as_reqwest(), url).form(form),
        };

        (builder.timeout(timeout), timeout)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest) -> Result<Value, GatewayError> {
        let (builder, timeout) = self.build(request);

        let mut response = builder.send().await.map_err(|e| classify(e, timeout))?;
        let status = response.status();

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(e, timeout))? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(GatewayError::Decode(format!(
                    "response too large: {new_len} bytes"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).trim().to_string();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(format!("invalid JSON: {e}")))
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(timeout)
    } else {
        GatewayError::Http(err)
    }
}
