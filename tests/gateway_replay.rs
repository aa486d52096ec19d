use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use feature_bank::call_log::{CallLog, CallStatus, JsonlCallLog, MemoryCallLog};
use feature_bank::gateway::{
    CallGateway, CallScope, CallSource, ExternalCallRequest, GatewayError, HttpTransport,
    ReplayPolicy, TransportRequest,
};
use serde_json::{json, Map};
use tempfile::tempdir;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn scope() -> CallScope {
    let mut options = Map::new();
    options.insert("targetLanguage".into(), json!("en"));
    CallScope::new("translategemma", "translategemma-1", Arc::new(options))
}

fn generate_request(server: &MockServer, input: &str) -> ExternalCallRequest {
    let mut identity = Map::new();
    identity.insert("model".into(), json!("m"));
    identity.insert("promptHash".into(), json!(input));
    ExternalCallRequest::new(
        "ollama.generate",
        input,
        TransportRequest::json_post(
            format!("{}/api/generate", server.uri()),
            json!({"model": "m", "prompt": input, "stream": false}),
        )
        .with_header("X-Trace", "1"),
    )
    .with_identity("v1", identity)
}

fn transport() -> Arc<HttpTransport> {
    Arc::new(HttpTransport::with_timeout(Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn live_call_is_logged_and_replayed_without_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(header("X-Trace", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "thanks"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let log = Arc::new(JsonlCallLog::open(dir.path().join("api-calls.log.jsonl")).unwrap());
    let request = generate_request(&server, "ačiū");

    let live = CallGateway::new(log.clone(), transport(), ReplayPolicy::ReplayThenLive);
    let first = live.call(&scope(), &request).await.unwrap();
    assert_eq!(first.source, CallSource::Live);
    assert_eq!(first.response, json!({"response": "thanks"}));

    let record = log.get(&first.key).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ok);
    assert_eq!(record.provider.as_deref(), Some("translategemma"));
    assert_eq!(record.cache_schema.as_deref(), Some("v1"));
    assert!(record.ts.ends_with('Z'));
    assert_eq!(record.request.as_ref().unwrap()["transport"], "http_json");

    let replay = CallGateway::new(log.clone(), transport(), ReplayPolicy::ReplayOnly);
    let second = replay.call(&scope(), &request).await.unwrap();
    assert_eq!(second.source, CallSource::Replay);
    assert_eq!(second.key, first.key);
    assert_eq!(second.response, first.response);
}

#[tokio::test]
async fn failed_status_is_persisted_and_distinct_under_replay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded\n"))
        .mount(&server)
        .await;

    let log = Arc::new(MemoryCallLog::new());
    let request = generate_request(&server, "labas");

    let live = CallGateway::new(log.clone(), transport(), ReplayPolicy::Live);
    let err = live.call(&scope(), &request).await.unwrap_err();
    match &err {
        GatewayError::Status { status, body } => {
            assert_eq!(*status, 503);
            assert_eq!(body, "overloaded");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, CallStatus::Error);
    assert_eq!(records[0].error.as_ref().unwrap()["status"], 503);
    assert!(records[0].response.is_none());

    let replay = CallGateway::new(log.clone(), transport(), ReplayPolicy::ReplayOnly);
    let err = replay.call(&scope(), &request).await.unwrap_err();
    assert!(matches!(err, GatewayError::ReplayError { ref key } if *key == records[0].key));

    // REPLAY_THEN_LIVE retries a logged failure live.
    let resume = CallGateway::new(log.clone(), transport(), ReplayPolicy::ReplayThenLive);
    assert!(resume.call(&scope(), &request).await.is_err());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert_eq!(log.records().len(), 2);
}

#[tokio::test]
async fn replay_only_miss_names_the_key_and_stays_offline() {
    let server = MockServer::start().await;
    let log = Arc::new(MemoryCallLog::new());
    let request = generate_request(&server, "nėra");
    let expected_key = scope().key_for(&request);

    let gateway = CallGateway::new(log.clone(), transport(), ReplayPolicy::ReplayOnly);
    let err = gateway.call(&scope(), &request).await.unwrap_err();
    assert!(err.is_replay());
    assert_eq!(err.to_string(), format!("replay miss for key={expected_key}"));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(log.records().is_empty());
}

#[tokio::test]
async fn form_requests_are_urlencoded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ajax-call"))
        .and(body_string_contains("action=text_accents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 200, "message": false})))
        .expect(1)
        .mount(&server)
        .await;

    let mut form = BTreeMap::new();
    form.insert("action".to_string(), "text_accents".to_string());
    form.insert("body".to_string(), "ačiū".to_string());
    let request = ExternalCallRequest::new(
        "vdu_kirciuoklis.text_accents",
        "ačiū",
        TransportRequest::form_post(format!("{}/ajax-call", server.uri()), form),
    );

    let gateway = CallGateway::new(Arc::new(MemoryCallLog::new()), transport(), ReplayPolicy::Live);
    let outcome = gateway.call(&scope(), &request).await.unwrap();
    assert_eq!(outcome.response["code"], 200);
}

#[tokio::test]
async fn per_request_timeout_is_reported_as_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"response": "late"}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let request = ExternalCallRequest::new(
        "ollama.generate",
        "x",
        TransportRequest::json_post(format!("{}/api/generate", server.uri()), json!({}))
            .with_timeout_ms(50),
    );
    let log = Arc::new(MemoryCallLog::new());
    let gateway = CallGateway::new(log.clone(), transport(), ReplayPolicy::Live);
    let err = gateway.call(&scope(), &request).await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout(_)), "got {err:?}");
    assert_eq!(log.records()[0].error.as_ref().unwrap()["name"], "timeout");
}

#[tokio::test]
async fn live_policy_bypasses_logged_success_and_appends() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"n": 1})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"n": 2})))
        .mount(&server)
        .await;

    let log = Arc::new(MemoryCallLog::new());
    let request = generate_request(&server, "ačiū");

    let resume = CallGateway::new(log.clone(), transport(), ReplayPolicy::ReplayThenLive);
    let first = resume.call(&scope(), &request).await.unwrap();
    assert_eq!(first.response, json!({"n": 1}));

    let live = CallGateway::new(log.clone(), transport(), ReplayPolicy::Live);
    let second = live.call(&scope(), &request).await.unwrap();
    assert_eq!(second.source, CallSource::Live);
    assert_eq!(second.key, first.key);
    assert_eq!(second.response, json!({"n": 2}));

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
    assert_eq!(log.records().len(), 2);
    let latest = log.get(&first.key).await.unwrap().unwrap();
    assert_eq!(latest.response, Some(json!({"n": 2})));
}
