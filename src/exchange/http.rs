//! JSON-over-HTTPS transport.
//!
//! Each attempt is one `POST {endpoint}`. Audio travels as base64 WAV in
//! `inputAudio`; the reply carries `outputText` and either inline base64
//! `outputAudio` or an `outputAudioUrl` fetched separately.

use crate::config::ExchangeConfig;
use crate::error::{Result, VoiceError};
use crate::exchange::transport::ExchangeTransport;
use crate::exchange::types::{
    AudioRef, ExchangePayload, ExchangeRequest, ExchangeResponse, RequestId, SessionId,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    session_id: SessionId,
    request_id: RequestId,
    attempt: u32,
    model_id: &'a str,
    system_prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio: Option<String>,
    sample_rate: u32,
    response_config: WireResponseConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireResponseConfig {
    include_audio: bool,
    include_text: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    request_id: Option<RequestId>,
    status: Option<String>,
    output_text: Option<String>,
    output_audio: Option<String>,
    output_audio_url: Option<String>,
    message: Option<String>,
}

/// Body statuses that count as success. An absent status does too.
const SUCCESS_STATUSES: &[&str] = &["ok", "success", "completed"];
/// Body statuses the backend uses for temporary refusals.
const TRANSIENT_STATUSES: &[&str] = &["busy", "throttled", "unavailable", "retry"];

/// Map a non-success body `status` onto the exchange error path.
fn check_wire_status(status: Option<&str>, message: Option<&str>) -> Result<()> {
    let Some(status) = status else {
        return Ok(());
    };
    let normalized = status.trim().to_ascii_lowercase();
    if SUCCESS_STATUSES.contains(&normalized.as_str()) {
        return Ok(());
    }
    let message = format!(
        "backend reported status {status:?}: {}",
        message.unwrap_or("no message")
    );
    if TRANSIENT_STATUSES.contains(&normalized.as_str()) {
        Err(VoiceError::TransientExchange {
            status: None,
            message,
        })
    } else {
        Err(VoiceError::NonRetryableExchange {
            status: None,
            message,
        })
    }
}

/// Backend reached over HTTP(S).
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpTransport {
    /// Build a transport for `config.endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.attempt_timeout())
            .build()
            .map_err(|e| VoiceError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_token: config.api_token.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn build_wire_request(request: &ExchangeRequest) -> WireRequest<'_> {
    let (input_text, input_audio) = match request.payload.as_ref() {
        ExchangePayload::Text(text) => (Some(text.as_str()), None),
        ExchangePayload::Audio { wav, .. } => (None, Some(BASE64.encode(wav))),
    };
    let meta = &request.metadata;
    WireRequest {
        session_id: request.session_id,
        request_id: request.request_id,
        attempt: request.attempt,
        model_id: &meta.model_id,
        system_prompt: &meta.system_prompt,
        input_text,
        input_audio,
        sample_rate: meta.sample_rate,
        response_config: WireResponseConfig {
            include_audio: meta.include_audio,
            include_text: meta.include_text,
        },
    }
}

fn parse_wire_response(expected: RequestId, wire: WireResponse) -> Result<ExchangeResponse> {
    check_wire_status(wire.status.as_deref(), wire.message.as_deref())?;
    if let Some(echoed) = wire.request_id {
        if echoed != expected {
            return Err(VoiceError::NonRetryableExchange {
                status: None,
                message: format!("response is for request {echoed}, expected {expected}"),
            });
        }
    }
    let response_audio = match (wire.output_audio, wire.output_audio_url) {
        (Some(b64), _) if !b64.is_empty() => {
            let bytes = BASE64
                .decode(b64.as_bytes())
                .map_err(|e| VoiceError::NonRetryableExchange {
                    status: None,
                    message: format!("outputAudio is not valid base64: {e}"),
                })?;
            Some(AudioRef::Inline(bytes))
        }
        (_, Some(url)) if !url.is_empty() => Some(AudioRef::Remote(url)),
        _ => None,
    };
    Ok(ExchangeResponse {
        request_id: expected,
        status: wire.status.unwrap_or_else(|| "ok".to_owned()),
        response_text: wire.output_text.filter(|t| !t.is_empty()),
        response_audio,
    })
}

/// Classify a transport-level reqwest failure.
fn map_send_error(e: &reqwest::Error) -> VoiceError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        VoiceError::TransientExchange {
            status: None,
            message: format!("connection error: {e}"),
        }
    } else {
        VoiceError::NonRetryableExchange {
            status: None,
            message: e.to_string(),
        }
    }
}

/// Pull a readable message out of an error body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.pointer("/error/message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                "no response body".to_string()
            } else {
                body.chars().take(500).collect()
            }
        })
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "failed to read body".into());
    tracing::error!(status = %status, body = %body, "backend returned error");
    Err(VoiceError::from_status(
        status.as_u16(),
        extract_error_message(&body),
    ))
}

#[async_trait]
impl ExchangeTransport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, request: &ExchangeRequest) -> Result<ExchangeResponse> {
        let body = build_wire_request(request);
        tracing::debug!(
            request_id = %request.request_id,
            attempt = request.attempt,
            payload = request.payload.kind(),
            "posting exchange request"
        );

        let response = self
            .authorize(self.client.post(&self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        let response = check_status(response).await?;

        let wire: WireResponse =
            response
                .json()
                .await
                .map_err(|e| VoiceError::NonRetryableExchange {
                    status: None,
                    message: format!("malformed response body: {e}"),
                })?;
        parse_wire_response(request.request_id, wire)
    }

    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(|e| map_send_error(&e))?;
        Ok(bytes.to_vec())
    }
}
