//! Messages passed into the coordinator task.

use crate::audio::capture::CaptureStatsSnapshot;
use crate::audio::playback::PlaybackTicket;
use crate::context::RestaurantSummary;
use crate::error::Result;
use crate::exchange::{RequestId, SessionId};
use crate::pipeline::conversation::ConversationState;
use serde::Serialize;
use tokio::sync::oneshot;

/// Host commands, each answered on its own reply channel.
#[derive(Debug)]
pub enum Command {
    StartSession {
        reply: oneshot::Sender<Result<SessionId>>,
    },
    /// Replies with the id of the session that ended, if one was active.
    EndSession {
        reply: oneshot::Sender<Option<SessionId>>,
    },
    InjectText {
        text: String,
        reply: oneshot::Sender<Result<RequestId>>,
    },
    SetContext {
        location: String,
        restaurants: Vec<RestaurantSummary>,
        reply: oneshot::Sender<()>,
    },
    UpdatePreferences {
        preferences: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<PipelineStatus>,
    },
}

/// Result of downloading remote response audio.
#[derive(Debug)]
pub struct AudioFetch {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub ticket: PlaybackTicket,
    pub result: Result<Vec<u8>>,
}

/// Snapshot returned by `session.status`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: ConversationState,
    pub session_id: Option<SessionId>,
    pub outstanding_request: Option<RequestId>,
    pub held_utterances: usize,
    pub backend: &'static str,
    pub session: Option<SessionCounters>,
}

/// Per-session counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionCounters {
    pub capture: CaptureStatsSnapshot,
    pub utterances_emitted: u64,
    pub utterances_discarded: u64,
    pub utterances_dropped: u64,
    pub frames_suppressed: u64,
    pub responses: u64,
    pub errors: u64,
}
