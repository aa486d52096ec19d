//! Core types for the external call gateway.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_CACHE_SCHEMA: &str = "v1";

// =============================================================================
// TRANSPORT
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        }
    }
}

/// Transport-level description of one external call.
///
/// Persisted verbatim in the call log next to the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportRequest {
    /// JSON body, caller-supplied headers.
    HttpJson {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// URL-encoded form body.
    HttpForm {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        form: BTreeMap<String, String>,
        #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl TransportRequest {
    pub fn json_post(url: impl Into<String>, body: Value) -> Self {
        TransportRequest::HttpJson {
            url: url.into(),
            method: HttpMethod::Post,
            headers: BTreeMap::new(),
            body: Some(body),
            timeout_ms: None,
        }
    }

    pub fn form_post(url: impl Into<String>, form: BTreeMap<String, String>) -> Self {
        TransportRequest::HttpForm {
            url: url.into(),
            method: HttpMethod::Post,
            form,
            timeout_ms: None,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            TransportRequest::HttpJson { url, .. } | TransportRequest::HttpForm { url, .. } => url,
        }
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            TransportRequest::HttpJson { timeout_ms, .. }
            | TransportRequest::HttpForm { timeout_ms, .. } => *timeout_ms,
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        match &mut self {
            TransportRequest::HttpJson { timeout_ms, .. }
            | TransportRequest::HttpForm { timeout_ms, .. } => *timeout_ms = Some(ms),
        }
        self
    }

    /// Adds a header. Form requests carry no custom headers, so this is a no-op for them.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportRequest::HttpJson { headers, .. } = &mut self {
            headers.insert(name.into(), value.into());
        }
        self
    }
}

// =============================================================================
// CALL REQUEST
// =============================================================================

/// Fields of a call that matter for caching, declared by the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub value: Map<String, Value>,
}

impl CacheIdentity {
    pub fn schema(&self) -> &str {
        self.schema.as_deref().unwrap_or(DEFAULT_CACHE_SCHEMA)
    }
}

/// What a plugin hands to `PluginCtx::call_external`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalCallRequest {
    pub operation: String,
    pub input: String,
    pub request: TransportRequest,
    pub cache_identity: Option<CacheIdentity>,
}

impl ExternalCallRequest {
    pub fn new(
        operation: impl Into<String>,
        input: impl Into<String>,
        request: TransportRequest,
    ) -> Self {
        Self {
            operation: operation.into(),
            input: input.into(),
            request,
            cache_identity: None,
        }
    }

    pub fn with_identity(mut self, schema: impl Into<String>, value: Map<String, Value>) -> Self {
        self.cache_identity = Some(CacheIdentity {
            schema: Some(schema.into()),
            value,
        });
        self
    }
}

// =============================================================================
// REPLAY POLICY
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayPolicy {
    /// Always call live; never read the log.
    Live,
    /// Only serve from the log; never call live.
    ReplayOnly,
    /// Serve `ok` hits from the log, call live otherwise.
    #[default]
    ReplayThenLive,
}

impl ReplayPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayPolicy::Live => "LIVE",
            ReplayPolicy::ReplayOnly => "REPLAY_ONLY",
            ReplayPolicy::ReplayThenLive => "REPLAY_THEN_LIVE",
        }
    }
}

impl fmt::Display for ReplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplayPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "LIVE" => Ok(ReplayPolicy::Live),
            "REPLAY_ONLY" => Ok(ReplayPolicy::ReplayOnly),
            "REPLAY_THEN_LIVE" => Ok(ReplayPolicy::ReplayThenLive),
            other => Err(format!(
                "unknown replay policy {other:?} (expected LIVE, REPLAY_ONLY or REPLAY_THEN_LIVE)"
            )),
        }
    }
}

/// Where a call's response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSource {
    Replay,
    Live,
}

#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub key: String,
    pub response: Value,
    pub source: CallSource,
}
