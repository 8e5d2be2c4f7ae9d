//! Conversation pipeline: state machine, coordinator task and host handle.

pub mod conversation;
pub mod coordinator;
pub mod messages;

pub use conversation::{AudioDevices, ConversationState};
pub use coordinator::{ConciergeHandle, PipelineCoordinator, spawn, spawn_with_transport};
pub use messages::{PipelineStatus, SessionCounters};
