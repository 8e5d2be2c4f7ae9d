//! HTTP transport contract tests.
//!
//! These verify the JSON wire format, auth header, status classification and
//! retry behaviour of the HTTP backend against a local mock server.

use concierge::audio::wav::encode_pcm16;
use concierge::config::ExchangeConfig;
use concierge::error::{VoiceError, error_kinds};
use concierge::exchange::{
    AudioRef, ExchangeClient, ExchangeCompletion, ExchangePayload, ExchangeTransport,
    HttpTransport, RequestMetadata, RetryPolicy, SessionId,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> ExchangeConfig {
    ExchangeConfig {
        endpoint: format!("{}/v1/converse", server.uri()),
        api_token: Some("test-token".into()),
        request_timeout_ms: 5_000,
        attempt_timeout_ms: 500,
        ..ExchangeConfig::default()
    }
}

fn metadata() -> RequestMetadata {
    RequestMetadata {
        model_id: "amazon.nova-sonic-v1:0".into(),
        system_prompt: "You are a concierge.".into(),
        sample_rate: 16_000,
        include_audio: true,
        include_text: true,
    }
}

async fn exchange(
    server: &MockServer,
    payload: ExchangePayload,
) -> (ExchangeCompletion, Arc<HttpTransport>) {
    let transport = Arc::new(HttpTransport::new(&config_for(server)).expect("transport"));
    let (tx, mut rx) = mpsc::channel(4);
    let mut client = ExchangeClient::new(
        Arc::clone(&transport) as Arc<dyn ExchangeTransport>,
        RetryPolicy::default().without_jitter(),
        Duration::from_secs(5),
        tx,
    )
    .with_attempt_timeout(Duration::from_millis(500));
    let session = SessionId::new();
    client.send(session, payload, metadata()).expect("send");
    let completion = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("completion in time")
        .expect("channel open");
    assert!(client.accept(&completion));
    (completion, transport)
}

#[tokio::test]
async fn text_request_uses_camel_case_body_and_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "modelId": "amazon.nova-sonic-v1:0",
            "systemPrompt": "You are a concierge.",
            "inputText": "Any sushi nearby?",
            "sampleRate": 16000,
            "attempt": 1,
            "responseConfig": {"includeAudio": true, "includeText": true}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "outputText": "Try Umi, two blocks north."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (completion, _) = exchange(&server, ExchangePayload::Text("Any sushi nearby?".into())).await;
    assert_eq!(completion.attempts, 1);
    let response = completion.outcome.expect("success");
    assert_eq!(
        response.response_text.as_deref(),
        Some("Try Umi, two blocks north.")
    );
    assert!(response.response_audio.is_none());
}

#[tokio::test]
async fn audio_payload_and_reply_are_base64() {
    let server = MockServer::start().await;
    let utterance = encode_pcm16(&[0.25; 320], 16_000, 1).unwrap();
    let reply = encode_pcm16(&[0.5; 160], 16_000, 1).unwrap();

    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .and(body_partial_json(json!({
            "inputAudio": BASE64.encode(&utterance)
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputText": "Here you go",
            "outputAudio": BASE64.encode(&reply)
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (completion, _) = exchange(
        &server,
        ExchangePayload::Audio {
            wav: utterance,
            sample_rate: 16_000,
        },
    )
    .await;
    let response = completion.outcome.expect("success");
    assert_eq!(response.response_audio, Some(AudioRef::Inline(reply)));
}

#[tokio::test]
async fn transient_status_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "message": "warming up"
        })))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .and(body_partial_json(json!({ "attempt": 3 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputText": "third time lucky"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (completion, _) = exchange(&server, ExchangePayload::Text("hello".into())).await;
    assert_eq!(completion.attempts, 3);
    assert!(completion.outcome.is_ok());
}

#[tokio::test]
async fn stalled_attempt_is_retried_within_request_lifetime() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "outputText": "slow" }))
                .set_delay(Duration::from_secs(3)),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .and(body_partial_json(json!({ "attempt": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputText": "fast"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (completion, _) = exchange(&server, ExchangePayload::Text("hello".into())).await;
    assert_eq!(completion.attempts, 2);
    let response = completion.outcome.expect("second attempt succeeds");
    assert_eq!(response.response_text.as_deref(), Some("fast"));
}

#[tokio::test]
async fn unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "bad token"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (completion, _) = exchange(&server, ExchangePayload::Text("hello".into())).await;
    assert_eq!(completion.attempts, 1);
    let err = completion.outcome.expect_err("401 fails");
    assert_eq!(err.kind(), error_kinds::NON_RETRYABLE_EXCHANGE);
    assert!(err.to_string().contains("bad token"));
}

#[tokio::test]
async fn error_status_in_ok_body_is_not_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "error",
            "message": "guardrail blocked the request",
            "outputText": "should not be spoken"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (completion, _) = exchange(&server, ExchangePayload::Text("hello".into())).await;
    assert_eq!(completion.attempts, 1);
    let err = completion.outcome.expect_err("error status fails");
    assert_eq!(err.kind(), error_kinds::NON_RETRYABLE_EXCHANGE);
    assert!(err.to_string().contains("guardrail"));
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_transient_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let (completion, _) = exchange(&server, ExchangePayload::Text("hello".into())).await;
    assert_eq!(completion.attempts, 3);
    assert!(matches!(
        completion.outcome,
        Err(VoiceError::TransientExchange {
            status: Some(429),
            ..
        })
    ));
}

#[tokio::test]
async fn remote_audio_url_is_fetched_with_auth() {
    let server = MockServer::start().await;
    let audio_url = format!("{}/audio/reply.wav", server.uri());
    let wav = encode_pcm16(&[0.1; 160], 16_000, 1).unwrap();

    Mock::given(method("POST"))
        .and(path("/v1/converse"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputText": "one moment",
            "outputAudioUrl": audio_url
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/audio/reply.wav"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(wav.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let (completion, transport) = exchange(&server, ExchangePayload::Text("hi".into())).await;
    let response = completion.outcome.expect("success");
    let Some(AudioRef::Remote(url)) = response.response_audio else {
        panic!("expected remote audio reference");
    };
    assert_eq!(transport.fetch_audio(&url).await.unwrap(), wav);
}
