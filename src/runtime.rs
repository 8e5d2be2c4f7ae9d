//! Runtime events emitted by the pipeline for the host.
//!
//! Events are small and cloneable so the coordinator can broadcast them
//! without blocking; slow subscribers lag and lose the oldest events.

use crate::exchange::{RequestId, SessionId};
use crate::pipeline::conversation::ConversationState;
use serde_json::json;

/// What the pipeline is doing right now.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    SessionStarted {
        session_id: SessionId,
    },
    SessionEnded {
        session_id: SessionId,
    },
    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },
    /// The VAD produced an utterance that was dispatched or held.
    UtteranceDetected {
        frames: usize,
        duration_ms: u64,
    },
    /// Backend reply text.
    ResponseText {
        request_id: RequestId,
        text: String,
    },
    PlaybackStarted,
    PlaybackDrained,
    /// A failure surfaced to the host.
    Error {
        kind: &'static str,
        message: String,
    },
    /// RMS of the audio being rendered.
    AudioLevel {
        rms: f32,
    },
}

impl RuntimeEvent {
    /// Stable dotted event name used on the host wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session.started",
            Self::SessionEnded { .. } => "session.ended",
            Self::StateChanged { .. } => "conversation.state_changed",
            Self::UtteranceDetected { .. } => "conversation.utterance_detected",
            Self::ResponseText { .. } => "conversation.response_text",
            Self::PlaybackStarted => "playback.started",
            Self::PlaybackDrained => "playback.drained",
            Self::Error { .. } => "pipeline.error",
            Self::AudioLevel { .. } => "playback.level",
        }
    }

    /// JSON payload for the host wire.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::SessionStarted { session_id } | Self::SessionEnded { session_id } => {
                json!({ "session_id": session_id })
            }
            Self::StateChanged { from, to } => {
                json!({ "from": from.as_str(), "to": to.as_str() })
            }
            Self::UtteranceDetected {
                frames,
                duration_ms,
            } => json!({ "frames": frames, "duration_ms": duration_ms }),
            Self::ResponseText { request_id, text } => {
                json!({ "request_id": request_id, "text": text })
            }
            Self::PlaybackStarted | Self::PlaybackDrained => json!({}),
            Self::Error { kind, message } => json!({ "kind": kind, "message": message }),
            Self::AudioLevel { rms } => json!({ "rms": rms }),
        }
    }
}
