//! Concierge: real-time voice pipeline for a guest-facing concierge.
//!
//! Microphone → ring buffer → VAD → conversational backend → speaker
//!
//! # Architecture
//!
//! - **Capture**: device callbacks write fixed-size frames into a bounded
//!   ring buffer from their own thread
//! - **VAD**: energy detector with hangover turns frames into utterances
//! - **Exchange**: each utterance becomes one request with bounded retry,
//!   backoff and cancellation
//! - **Conversation**: a single coordinator task runs the
//!   Idle/Listening/AwaitingResponse/Speaking state machine
//! - **Playback**: a render thread plays decoded response audio and reports
//!   when it has drained
//! - **Host**: a versioned newline-delimited JSON bridge exposes sessions
//!   and events to a native shell

pub mod audio;
pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod host;
pub mod pipeline;
pub mod runtime;
pub mod vad;

pub use config::ConciergeConfig;
pub use context::{ConciergeContext, RestaurantSummary};
pub use error::{Result, VoiceError};
pub use pipeline::{ConciergeHandle, ConversationState};
pub use runtime::RuntimeEvent;
