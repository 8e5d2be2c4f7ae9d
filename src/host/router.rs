//! Routes host command envelopes onto a [`ConciergeHandle`].

use crate::error::VoiceError;
use crate::host::contract::{
    CommandEnvelope, CommandName, ContractError, EVENT_VERSION, InjectTextPayload,
    PreferencesPayload, ResponseEnvelope, SetContextPayload,
};
use crate::pipeline::ConciergeHandle;
use serde_json::json;

type Outcome = std::result::Result<serde_json::Value, VoiceError>;

/// Answers host commands against a running pipeline.
#[derive(Clone)]
pub struct HostRouter {
    handle: ConciergeHandle,
}

impl HostRouter {
    pub fn new(handle: ConciergeHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &ConciergeHandle {
        &self.handle
    }

    /// Route one envelope. Failures become error responses.
    pub async fn route(&self, envelope: &CommandEnvelope) -> ResponseEnvelope {
        let request_id = envelope.request_id.clone();
        if let Err(e) = envelope.validate() {
            tracing::warn!(request_id = %request_id, error = %e, "rejecting host command");
            return contract_error(request_id, &e);
        }
        tracing::debug!(
            request_id = %request_id,
            command = envelope.command.as_str(),
            "host command"
        );

        let outcome = match envelope.command {
            CommandName::HostPing => Ok(json!({
                "pong": true,
                "contract_version": EVENT_VERSION,
            })),
            CommandName::SessionStart => self.session_start().await,
            CommandName::SessionEnd => self.session_end().await,
            CommandName::SessionStatus => self.session_status().await,
            CommandName::ConversationInjectText => {
                match envelope.payload_as::<InjectTextPayload>() {
                    Ok(payload) => self.inject_text(payload).await,
                    Err(e) => return contract_error(request_id, &e),
                }
            }
            CommandName::ContextSet => match envelope.payload_as::<SetContextPayload>() {
                Ok(payload) => self.set_context(payload).await,
                Err(e) => return contract_error(request_id, &e),
            },
            CommandName::PreferencesUpdate => match envelope.payload_as::<PreferencesPayload>() {
                Ok(payload) => self.update_preferences(payload).await,
                Err(e) => return contract_error(request_id, &e),
            },
        };

        match outcome {
            Ok(payload) => ResponseEnvelope::ok(request_id, payload),
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    command = envelope.command.as_str(),
                    kind = e.kind(),
                    error = %e,
                    "host command failed"
                );
                ResponseEnvelope::error(request_id, e.kind(), e.to_string())
            }
        }
    }

    async fn session_start(&self) -> Outcome {
        let session_id = self.handle.start_session().await?;
        Ok(json!({ "session_id": session_id }))
    }

    async fn session_end(&self) -> Outcome {
        let ended = self.handle.end_session().await?;
        Ok(json!({ "ended": ended.is_some(), "session_id": ended }))
    }

    async fn session_status(&self) -> Outcome {
        let status = self.handle.status().await?;
        serde_json::to_value(status).map_err(|e| VoiceError::Channel(e.to_string()))
    }

    async fn inject_text(&self, payload: InjectTextPayload) -> Outcome {
        if payload.text.trim().is_empty() {
            return Ok(json!({ "accepted": false }));
        }
        let request_id = self.handle.inject_text(payload.text).await?;
        Ok(json!({ "accepted": true, "request_id": request_id }))
    }

    async fn set_context(&self, payload: SetContextPayload) -> Outcome {
        let count = payload.restaurants.len();
        self.handle
            .set_context(payload.location, payload.restaurants)
            .await?;
        Ok(json!({ "restaurants": count }))
    }

    async fn update_preferences(&self, payload: PreferencesPayload) -> Outcome {
        let count = payload.preferences.len();
        self.handle.update_preferences(payload.preferences).await?;
        Ok(json!({ "preferences": count }))
    }
}

fn contract_error(request_id: String, e: &ContractError) -> ResponseEnvelope {
    ResponseEnvelope::error(request_id, e.kind.as_str(), e.message.clone())
}
