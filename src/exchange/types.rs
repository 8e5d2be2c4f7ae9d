//! Identifiers and payloads exchanged with the conversational backend.

use crate::audio::frame::Utterance;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// One guest conversation. Generated on session start, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One logical request. Retries reuse the id with a higher attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the guest said.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangePayload {
    /// A detected utterance as 16-bit PCM WAV.
    Audio { wav: Vec<u8>, sample_rate: u32 },
    /// Typed input.
    Text(String),
}

impl ExchangePayload {
    /// Encode an utterance for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the utterance is empty or cannot be encoded.
    pub fn from_utterance(utterance: &Utterance) -> Result<Self> {
        Ok(Self::Audio {
            wav: utterance.to_wav()?,
            sample_rate: utterance.sample_rate(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "audio",
            Self::Text(_) => "text",
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Audio { .. } => None,
        }
    }
}

/// Per-request options forwarded to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMetadata {
    pub model_id: String,
    pub system_prompt: String,
    /// Sample rate of audio payloads and of the requested response audio.
    pub sample_rate: u32,
    pub include_audio: bool,
    pub include_text: bool,
}

/// One attempt of a logical request.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub session_id: SessionId,
    pub request_id: RequestId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub payload: Arc<ExchangePayload>,
    pub metadata: Arc<RequestMetadata>,
}

/// Where response audio lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioRef {
    /// Encoded audio bytes (WAV or raw PCM16).
    Inline(Vec<u8>),
    /// Audio to fetch from the backend.
    Remote(String),
}

/// Backend reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeResponse {
    pub request_id: RequestId,
    pub status: String,
    pub response_text: Option<String>,
    pub response_audio: Option<AudioRef>,
}

impl ExchangeResponse {
    /// A text-only reply.
    pub fn text(request_id: RequestId, text: impl Into<String>) -> Self {
        Self {
            request_id,
            status: "ok".to_owned(),
            response_text: Some(text.into()),
            response_audio: None,
        }
    }

    pub fn with_audio(mut self, audio: AudioRef) -> Self {
        self.response_audio = Some(audio);
        self
    }
}
