//! External call gateway: cache keys, replay policy, and call logging.
//!
//! Plugins never reach the network directly. Each call goes through
//! [`CallGateway::call`], which derives a deterministic key, consults the
//! bank's call log according to the [`ReplayPolicy`], and records every live
//! attempt (success or failure) so it can be replayed later.

pub mod error;
pub mod http;
pub mod key;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::call_log::{ApiCallLog, CallLog, CallStatus};

pub use error::GatewayError;
pub use http::{HttpTransport, Transport};
pub use key::{canonical_json, feature_key, identity_key, sha256_hex};
pub use types::*;

/// Per-feature context a call is made under.
#[derive(Clone)]
pub struct CallScope {
    pub provider: String,
    pub feature_id: String,
    pub options: Arc<Map<String, Value>>,
    pub rate_gate: Option<Arc<RateGate>>,
}

impl CallScope {
    pub fn new(
        provider: impl Into<String>,
        feature_id: impl Into<String>,
        options: Arc<Map<String, Value>>,
    ) -> Self {
        Self {
            provider: provider.into(),
            feature_id: feature_id.into(),
            options,
            rate_gate: None,
        }
    }

    pub fn with_rate_gate(mut self, gate: Option<Arc<RateGate>>) -> Self {
        self.rate_gate = gate;
        self
    }

    /// Log key for `request` under this scope.
    pub fn key_for(&self, request: &ExternalCallRequest) -> String {
        match &request.cache_identity {
            Some(identity) => identity_key(&self.provider, &request.operation, identity),
            None => feature_key(
                &self.feature_id,
                &request.operation,
                &self.options,
                &request.input,
            ),
        }
    }
}

pub struct CallGateway {
    log: Arc<dyn CallLog>,
    transport: Arc<dyn Transport>,
    policy: ReplayPolicy,
}

impl CallGateway {
    pub fn new(log: Arc<dyn CallLog>, transport: Arc<dyn Transport>, policy: ReplayPolicy) -> Self {
        Self {
            log,
            transport,
            policy,
        }
    }

    pub fn policy(&self) -> ReplayPolicy {
        self.policy
    }

    pub async fn call(
        &self,
        scope: &CallScope,
        request: &ExternalCallRequest,
    ) -> Result<CallOutcome, GatewayError> {
        let key = scope.key_for(request);

        if self.policy != ReplayPolicy::Live {
            match self.log.get(&key).await? {
                Some(record) if record.status == CallStatus::Ok => {
                    debug!(key = %key, operation = %request.operation, "replayed external call");
                    return Ok(CallOutcome {
                        key,
                        response: record.response.unwrap_or(Value::Null),
                        source: CallSource::Replay,
                    });
                }
                Some(_) if self.policy == ReplayPolicy::ReplayOnly => {
                    return Err(GatewayError::ReplayError { key });
                }
                None if self.policy == ReplayPolicy::ReplayOnly => {
                    return Err(GatewayError::ReplayMiss { key });
                }
                _ => {}
            }
        }

        if let Some(gate) = &scope.rate_gate {
            gate.acquire().await;
        }

        let started = std::time::Instant::now();
        let result = self.transport.send(&request.request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut record = ApiCallLog {
            key: key.clone(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            provider: Some(scope.provider.clone()),
            input: request.input.clone(),
            operation: Some(request.operation.clone()),
            cache_schema: request
                .cache_identity
                .as_ref()
                .map(|identity| identity.schema().to_string()),
            cache_identity: request
                .cache_identity
                .as_ref()
                .map(|identity| Value::Object(identity.value.clone())),
            status: CallStatus::Ok,
            request: serde_json::to_value(&request.request).ok(),
            response: None,
            error: None,
            duration_ms,
        };

        match result {
            Ok(response) => {
                record.response = Some(response.clone());
                self.log.put(record).await?;
                debug!(key = %key, operation = %request.operation, duration_ms, "live external call");
                Ok(CallOutcome {
                    key,
                    response,
                    source: CallSource::Live,
                })
            }
            Err(err) => {
                record.status = CallStatus::Error;
                record.error = Some(err.to_log_payload());
                self.log.put(record).await?;
                debug!(key = %key, operation = %request.operation, code = err.code(), "external call failed");
                Err(err)
            }
        }
    }
}

// =============================================================================
// RATE GATE
// =============================================================================

/// Spaces live calls at least `interval` apart.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateGate {
    /// `None` when `max_rpm` is zero (unlimited).
    pub fn per_minute(max_rpm: u32) -> Option<Self> {
        if max_rpm == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs(60) / max_rpm,
            next_slot: Mutex::new(None),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = match *next_slot {
            Some(at) if at > now => {
                sleep_until(at).await;
                at
            }
            _ => now,
        };
        *next_slot = Some(slot + self.interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_log::MemoryCallLog;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _request: &TransportRequest) -> Result<Value, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(GatewayError::Status {
                    status: 500,
                    body: "boom".into(),
                })
            } else {
                Ok(json!({"response": "live"}))
            }
        }
    }

    fn scope() -> CallScope {
        CallScope::new("prov", "prov-1", Arc::new(Map::new()))
    }

    fn request() -> ExternalCallRequest {
        ExternalCallRequest::new(
            "op",
            "ačiū",
            TransportRequest::json_post("http://unused", json!({})),
        )
    }

    #[tokio::test]
    async fn failed_live_call_is_logged_and_replays_as_error() {
        let log = Arc::new(MemoryCallLog::new());
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let live = CallGateway::new(log.clone(), transport.clone(), ReplayPolicy::ReplayThenLive);
        let err = live.call(&scope(), &request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Status { status: 500, .. }));

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CallStatus::Error);
        assert_eq!(records[0].error.as_ref().unwrap()["status"], 500);

        let replay = CallGateway::new(log.clone(), transport.clone(), ReplayPolicy::ReplayOnly);
        let err = replay.call(&scope(), &request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ReplayError { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replay_then_live_retries_logged_errors_live() {
        let log = Arc::new(MemoryCallLog::new());
        let failing = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let _ = CallGateway::new(log.clone(), failing, ReplayPolicy::Live)
            .call(&scope(), &request())
            .await;

        let healthy = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let gateway = CallGateway::new(log.clone(), healthy.clone(), ReplayPolicy::ReplayThenLive);
        let outcome = gateway.call(&scope(), &request()).await.unwrap();
        assert_eq!(outcome.source, CallSource::Live);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_gate_spaces_acquisitions() {
        let gate = RateGate::per_minute(60).unwrap();
        assert_eq!(gate.interval(), Duration::from_secs(1));
        let start = Instant::now();
        gate.acquire().await;
        gate.acquire().await;
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(RateGate::per_minute(0).is_none());
    }
}
