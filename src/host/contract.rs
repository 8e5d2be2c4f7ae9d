//! Versioned host command/event envelopes for the concierge bridge.

use crate::context::RestaurantSummary;
use crate::runtime::RuntimeEvent;
use serde::{Deserialize, Serialize};

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Error kinds raised by the contract layer itself. Pipeline failures use
/// [`crate::error::error_kinds`].
pub mod contract_error_kinds {
    pub const UNSUPPORTED_VERSION: &str = "unsupported_version";
    pub const INVALID_ENVELOPE: &str = "invalid_envelope";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const PARSE_ERROR: &str = "parse_error";
}

/// Commands accepted from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "host.ping")]
    HostPing,
    #[serde(rename = "session.start")]
    SessionStart,
    #[serde(rename = "session.end")]
    SessionEnd,
    #[serde(rename = "session.status")]
    SessionStatus,
    #[serde(rename = "conversation.inject_text")]
    ConversationInjectText,
    #[serde(rename = "context.set")]
    ContextSet,
    #[serde(rename = "preferences.update")]
    PreferencesUpdate,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostPing => "host.ping",
            Self::SessionStart => "session.start",
            Self::SessionEnd => "session.end",
            Self::SessionStatus => "session.status",
            Self::ConversationInjectText => "conversation.inject_text",
            Self::ContextSet => "context.set",
            Self::PreferencesUpdate => "preferences.update",
        }
    }

    /// Parse a command name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host.ping" => Some(Self::HostPing),
            "session.start" => Some(Self::SessionStart),
            "session.end" => Some(Self::SessionEnd),
            "session.status" => Some(Self::SessionStatus),
            "conversation.inject_text" => Some(Self::ConversationInjectText),
            "context.set" => Some(Self::ContextSet),
            "preferences.update" => Some(Self::PreferencesUpdate),
            _ => None,
        }
    }
}

/// Payload of `conversation.inject_text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectTextPayload {
    pub text: String,
}

/// Payload of `context.set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetContextPayload {
    pub location: String,
    #[serde(default)]
    pub restaurants: Vec<RestaurantSummary>,
}

/// Payload of `preferences.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferencesPayload {
    pub preferences: Vec<String>,
}

/// A versioned response envelope from pipeline -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    /// Stable kind string for `error`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ResponseEnvelope {
    /// Build a successful response envelope.
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
            error_kind: None,
        }
    }

    /// Build an error response envelope.
    #[must_use]
    pub fn error(
        request_id: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
            error_kind: Some(kind.into()),
        }
    }
}

/// A versioned command envelope from host -> pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Build a v1 command envelope.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::new(
                ContractErrorKind::UnsupportedVersion,
                format!(
                    "unsupported contract version {}; expected {}",
                    self.v, EVENT_VERSION
                ),
            ));
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::new(
                ContractErrorKind::InvalidEnvelope,
                "request_id cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Decode the payload into a command-specific type.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ContractError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ContractError::new(
                ContractErrorKind::InvalidPayload,
                format!("invalid {} payload: {e}", self.command.as_str()),
            )
        })
    }
}

/// A versioned event envelope from pipeline -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build a v1 event envelope.
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: event_id.into(),
            event: event.into(),
            payload,
        }
    }
}

impl From<&RuntimeEvent> for EventEnvelope {
    fn from(event: &RuntimeEvent) -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            event.name(),
            event.payload(),
        )
    }
}

/// Contract validation error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
    InvalidPayload,
}

impl ContractErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedVersion => contract_error_kinds::UNSUPPORTED_VERSION,
            Self::InvalidEnvelope => contract_error_kinds::INVALID_ENVELOPE,
            Self::InvalidPayload => contract_error_kinds::INVALID_PAYLOAD,
        }
    }
}

/// Contract validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {message}", kind.as_str())]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}
