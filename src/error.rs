//! Error types for the concierge voice pipeline.

use std::time::Duration;

/// Stable error kind identifiers surfaced to the host through `onError`.
///
/// These strings are part of the host contract and do not change.
pub mod error_kinds {
    pub const DEVICE_UNAVAILABLE: &str = "device_unavailable";
    pub const CAPTURE_UNDERRUN: &str = "capture_underrun";
    pub const OVERFLOW: &str = "overflow";
    pub const REQUEST_IN_FLIGHT: &str = "request_in_flight";
    pub const NOT_LISTENING: &str = "not_listening";
    pub const TRANSIENT_EXCHANGE: &str = "transient_exchange_failure";
    pub const NON_RETRYABLE_EXCHANGE: &str = "non_retryable_exchange_failure";
    pub const TIMEOUT: &str = "timeout";
    pub const AUDIO: &str = "audio";
    pub const CONFIG: &str = "config";
    pub const CHANNEL: &str = "channel";
    pub const IO: &str = "io";
}

/// Which direction of the audio path a device error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDirection {
    Input,
    Output,
}

impl std::fmt::Display for DeviceDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Top-level error type for the voice pipeline.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// A capture or playback device could not be opened or was lost.
    #[error("{direction} device unavailable: {message}")]
    DeviceUnavailable {
        direction: DeviceDirection,
        message: String,
    },

    /// Capture frames were dropped (scheduling jitter or a full ring).
    #[error("capture underrun: {dropped_frames} frame(s) dropped")]
    CaptureUnderrun { dropped_frames: u64 },

    /// The ring buffer is full and the overflow policy rejects writes.
    #[error("ring buffer overflow: {requested} samples requested, {free} free")]
    Overflow { requested: usize, free: usize },

    /// A request is already outstanding for this session.
    #[error("request {request_id} already in flight for session {session_id}")]
    RequestInFlight {
        session_id: String,
        request_id: String,
    },

    /// Input was offered while no session is Listening and nothing is in
    /// flight (Idle or Speaking).
    #[error("not listening: conversation is {state}")]
    NotListening { state: String },

    /// A transient exchange failure (timeout, connect error, 5xx, 429).
    #[error("transient exchange failure{}: {message}", fmt_status(.status))]
    TransientExchange { status: Option<u16>, message: String },

    /// A non-retryable exchange failure (malformed request, auth rejection).
    #[error("exchange failed{}: {message}", fmt_status(.status))]
    NonRetryableExchange { status: Option<u16>, message: String },

    /// A request or the awaiting-response state exceeded its ceiling.
    #[error("timed out after {}ms: {what}", .elapsed.as_millis())]
    Timeout { what: String, elapsed: Duration },

    /// Audio encoding/decoding error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl VoiceError {
    /// Shorthand for an input or output device failure.
    pub fn device(direction: DeviceDirection, message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            direction,
            message: message.into(),
        }
    }

    /// Returns the stable kind string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceUnavailable { .. } => error_kinds::DEVICE_UNAVAILABLE,
            Self::CaptureUnderrun { .. } => error_kinds::CAPTURE_UNDERRUN,
            Self::Overflow { .. } => error_kinds::OVERFLOW,
            Self::RequestInFlight { .. } => error_kinds::REQUEST_IN_FLIGHT,
            Self::NotListening { .. } => error_kinds::NOT_LISTENING,
            Self::TransientExchange { .. } => error_kinds::TRANSIENT_EXCHANGE,
            Self::NonRetryableExchange { .. } => error_kinds::NON_RETRYABLE_EXCHANGE,
            Self::Timeout { .. } => error_kinds::TIMEOUT,
            Self::Audio(_) => error_kinds::AUDIO,
            Self::Config(_) => error_kinds::CONFIG,
            Self::Channel(_) => error_kinds::CHANNEL,
            Self::Io(_) => error_kinds::IO,
        }
    }

    /// Returns true if the exchange client should retry after this error.
    ///
    /// Only [`VoiceError::TransientExchange`] is retried. Timeouts are not:
    /// the request lifetime timeout covers all attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExchange { .. })
    }

    /// Classify an HTTP status code returned by the backend.
    ///
    /// 5xx and 429 are transient; every other non-success is not.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || (500..600).contains(&status) {
            Self::TransientExchange {
                status: Some(status),
                message,
            }
        } else {
            Self::NonRetryableExchange {
                status: Some(status),
                message,
            }
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(VoiceError::from_status(500, "boom").is_retryable());
        assert!(VoiceError::from_status(503, "busy").is_retryable());
        assert!(VoiceError::from_status(429, "slow down").is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        for status in [400, 401, 403, 404, 422] {
            let err = VoiceError::from_status(status, "nope");
            assert!(!err.is_retryable(), "status {status} should not retry");
            assert_eq!(err.kind(), error_kinds::NON_RETRYABLE_EXCHANGE);
        }
    }

    #[test]
    fn timeout_is_not_retryable() {
        let err = VoiceError::Timeout {
            what: "request".into(),
            elapsed: Duration::from_secs(1),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), error_kinds::TIMEOUT);
    }

    #[test]
    fn display_includes_status() {
        let err = VoiceError::from_status(502, "bad gateway");
        assert_eq!(
            err.to_string(),
            "transient exchange failure (HTTP 502): bad gateway"
        );
        let err = VoiceError::device(DeviceDirection::Input, "no default input device");
        assert_eq!(
            err.to_string(),
            "input device unavailable: no default input device"
        );
    }
}
