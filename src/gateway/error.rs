//! Error types for the external call gateway.

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::call_log::CallLogError;

/// Errors that can occur when performing or replaying an external call.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// REPLAY_ONLY and no record exists for the key.
    #[error("replay miss for key={key}")]
    ReplayMiss { key: String },

    /// REPLAY_ONLY and the recorded call had failed.
    #[error("replay error for key={key}")]
    ReplayError { key: String },

    /// Non-success transport status. Body is kept verbatim.
    #[error("external call failed: {status} {body}")]
    Status { status: u16, body: String },

    /// Request exceeded its timeout.
    #[error("external call timed out after {0:?}")]
    Timeout(Duration),

    /// Response body was too large or not valid JSON.
    #[error("invalid response: {0}")]
    Decode(String),

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("call log error: {0}")]
    Log(#[from] CallLogError),

    /// Configuration error (bad client setup, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Errors raised by replay, as opposed to a live attempt.
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::ReplayMiss { .. } | Self::ReplayError { .. })
    }

    /// Short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ReplayMiss { .. } => "replay_miss",
            Self::ReplayError { .. } => "replay_error",
            Self::Status { .. } => "http_status",
            Self::Timeout(_) => "timeout",
            Self::Decode(_) => "decode_error",
            Self::Http(_) => "http_error",
            Self::Log(_) => "call_log_error",
            Self::Config(_) => "config_error",
        }
    }

    /// HTTP status, when the failure came from a response.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Shape stored under `error` in a failed call log record.
    pub fn to_log_payload(&self) -> Value {
        let mut payload = json!({
            "name": self.code(),
            "message": self.to_string(),
        });
        if let Some(status) = self.http_status() {
            payload["status"] = json!(status);
        }
        payload
    }
}
