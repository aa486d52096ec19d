use std::sync::Arc;
use std::time::Duration;

use feature_bank::bank::{FeatureOutput, TranslationOutput};
use feature_bank::call_log::MemoryCallLog;
use feature_bank::gateway::{CallGateway, CallScope, HttpTransport, ReplayPolicy};
use feature_bank::plugin::{
    Plugin, PluginCtx, PluginError, TranslateGemma, TranslateGemmaConfig, VduKirciuoklis,
    VduKirciuoklisConfig,
};
use serde_json::{json, Map, Value};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn gateway() -> CallGateway {
    CallGateway::new(
        Arc::new(MemoryCallLog::new()),
        Arc::new(HttpTransport::with_timeout(Duration::from_secs(5)).unwrap()),
        ReplayPolicy::ReplayThenLive,
    )
}

#[tokio::test]
async fn translategemma_full_mode_returns_detailed_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(header("X-Api-Key", "secret"))
        .and(body_string_contains("\"stream\":false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "  thanks\n"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = TranslateGemmaConfig {
        base_url: format!("{}/", server.uri()),
        ..TranslateGemmaConfig::default()
    };
    config.headers.insert("X-Api-Key".into(), "secret".into());
    let plugin = TranslateGemma::new(config);

    let options = object(json!({
        "sourceLanguage": "lt-LT",
        "targetLanguage": "en",
        "outputMode": "full"
    }));
    let gateway = gateway();
    let scope = CallScope::new("translategemma", "translategemma-1", Arc::new(options.clone()));
    let ctx = PluginCtx::new(&gateway, &scope);

    let output = plugin.run("ačiū", &options, &ctx).await.unwrap();
    assert_eq!(
        output,
        FeatureOutput::Translation(TranslationOutput::Detailed {
            translated_text: "thanks".into(),
            alternatives: Some(Vec::new()),
        })
    );
    assert_eq!(ctx.call_stats().live, 1);

    // Same prompt on a second context is served from the log.
    let ctx = PluginCtx::new(&gateway, &scope);
    plugin.run("ačiū", &options, &ctx).await.unwrap();
    assert_eq!(ctx.call_stats().replayed, 1);
}

#[tokio::test]
async fn translategemma_blank_response_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "   "})))
        .mount(&server)
        .await;

    let plugin = TranslateGemma::new(TranslateGemmaConfig {
        base_url: server.uri(),
        ..TranslateGemmaConfig::default()
    });
    let options = object(json!({"sourceLanguage": "lt", "targetLanguage": "en"}));
    let gateway = gateway();
    let scope = CallScope::new("translategemma", "translategemma-1", Arc::new(options.clone()));
    let ctx = PluginCtx::new(&gateway, &scope);

    let err = plugin.run("ačiū", &options, &ctx).await.unwrap_err();
    assert!(matches!(err, PluginError::Failed(_)), "got {err:?}");
}

#[tokio::test]
async fn vdu_without_words_has_no_result() {
    let server = MockServer::start().await;
    let separators_only = json!({"textParts": [{"string": "?!", "type": "SEPARATOR"}]});
    Mock::given(method("POST"))
        .and(path("/ajax-call"))
        .and(body_string_contains("nonce=test-nonce"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "message": separators_only.to_string()
        })))
        .mount(&server)
        .await;

    let plugin = VduKirciuoklis::new(VduKirciuoklisConfig {
        endpoint: format!("{}/ajax-call", server.uri()),
        nonce: "test-nonce".into(),
        item_concurrency: None,
    });
    let options = Map::new();
    let gateway = gateway();
    let scope = CallScope::new("vdu_kirciuoklis", "vdu-kirciuoklis-1", Arc::new(options.clone()));
    let ctx = PluginCtx::new(&gateway, &scope);

    let err = plugin.run("?!", &options, &ctx).await.unwrap_err();
    assert!(matches!(err, PluginError::NoResult), "got {err:?}");
}

#[tokio::test]
async fn vdu_api_failure_code_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 403, "message": false})))
        .mount(&server)
        .await;

    let plugin = VduKirciuoklis::new(VduKirciuoklisConfig {
        endpoint: format!("{}/ajax-call", server.uri()),
        ..VduKirciuoklisConfig::default()
    });
    let options = Map::new();
    let gateway = gateway();
    let scope = CallScope::new("vdu_kirciuoklis", "vdu-kirciuoklis-1", Arc::new(options.clone()));
    let ctx = PluginCtx::new(&gateway, &scope);

    let err = plugin.run("labas", &options, &ctx).await.unwrap_err();
    assert_eq!(err.to_string(), "VDU API error (403)");
}
