//! Pipeline coordinator task and the host-facing handle.
//!
//! The coordinator is a single tokio task owning the exchange client and at
//! most one [`ConversationSession`]. Host commands, exchange completions,
//! remote audio fetches and session inputs are all multiplexed in one loop,
//! so every state transition happens on this task.

use crate::config::ConciergeConfig;
use crate::context::{ContextHandle, RestaurantSummary};
use crate::error::{Result, VoiceError};
use crate::exchange::{
    ExchangeClient, ExchangeCompletion, ExchangeTransport, RequestId, RetryPolicy, SessionId,
    build_transport,
};
use crate::pipeline::conversation::{
    AudioDevices, Backend, ConversationSession, ConversationState, SessionInput,
};
use crate::pipeline::messages::{AudioFetch, Command, PipelineStatus};
use crate::runtime::RuntimeEvent;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Host command queue depth.
const COMMAND_CHANNEL_SIZE: usize = 32;
/// Exchange completion queue depth; at most one request is in flight per
/// session, so this only absorbs stale completions.
const COMPLETION_CHANNEL_SIZE: usize = 8;

/// Start the pipeline with the transport selected by `config.exchange`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the transport cannot
/// be built.
pub fn spawn(config: ConciergeConfig, devices: AudioDevices) -> Result<ConciergeHandle> {
    config.validate()?;
    let context = ContextHandle::new(config.context.clone());
    let transport = build_transport(&config.exchange, &context)?;
    spawn_with_transport(config, devices, context, transport)
}

/// Start the pipeline against an explicit transport.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn spawn_with_transport(
    config: ConciergeConfig,
    devices: AudioDevices,
    context: ContextHandle,
    transport: Arc<dyn ExchangeTransport>,
) -> Result<ConciergeHandle> {
    config.validate()?;
    let (command_tx, commands) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let (completion_tx, completions) = mpsc::channel(COMPLETION_CHANNEL_SIZE);
    let (fetched_tx, fetched) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(config.conversation.runtime_event_capacity.max(1));
    let cancel = CancellationToken::new();

    let client = ExchangeClient::new(
        transport,
        RetryPolicy::from(&config.exchange.retry),
        config.exchange.request_timeout(),
        completion_tx,
    )
    .with_attempt_timeout(config.exchange.attempt_timeout());
    let backend = Backend::new(client, context, &config, fetched_tx);
    let coordinator = PipelineCoordinator {
        cancel: cancel.clone(),
        inbound: Inbound {
            commands,
            completions,
            fetched,
        },
        state: CoordinatorState {
            config,
            devices,
            backend,
            session: None,
            events: events.clone(),
        },
    };
    let task = tokio::spawn(coordinator.run());

    Ok(ConciergeHandle {
        commands: command_tx,
        events,
        cancel,
        task: Arc::new(Mutex::new(Some(task))),
    })
}

struct Inbound {
    commands: mpsc::Receiver<Command>,
    completions: mpsc::Receiver<ExchangeCompletion>,
    fetched: mpsc::UnboundedReceiver<AudioFetch>,
}

struct CoordinatorState {
    config: ConciergeConfig,
    devices: AudioDevices,
    backend: Backend,
    session: Option<ConversationSession>,
    events: broadcast::Sender<RuntimeEvent>,
}

/// Owns the conversation and drives it from every inbound source.
pub struct PipelineCoordinator {
    cancel: CancellationToken,
    inbound: Inbound,
    state: CoordinatorState,
}

impl PipelineCoordinator {
    /// Run until cancelled or every handle is dropped. An active session is
    /// ended on the way out.
    pub async fn run(self) {
        let Self {
            cancel,
            mut inbound,
            mut state,
        } = self;
        info!(backend = state.backend.client().transport().name(), "concierge pipeline running");

        enum Input {
            Command(Command),
            Completion(ExchangeCompletion),
            Fetched(AudioFetch),
            Session(SessionInput),
        }

        loop {
            let input = {
                let session = state.session.as_mut();
                let session_input = async move {
                    match session {
                        Some(session) => session.next_input().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    cmd = inbound.commands.recv() => match cmd {
                        Some(cmd) => Input::Command(cmd),
                        None => break,
                    },
                    Some(completion) = inbound.completions.recv() => Input::Completion(completion),
                    Some(fetch) = inbound.fetched.recv() => Input::Fetched(fetch),
                    input = session_input => Input::Session(input),
                }
            };

            match input {
                Input::Command(cmd) => state.handle_command(cmd).await,
                Input::Completion(completion) => state.handle_completion(completion),
                Input::Fetched(fetch) => {
                    if let Some(session) = state.session.as_mut() {
                        session.on_audio_fetched(fetch, &mut state.backend);
                    }
                }
                Input::Session(input) => state.handle_session_input(input).await,
            }
            state.pump();
        }

        state.end_session().await;
        state.backend.client_mut().cancel_all();
        info!("concierge pipeline stopped");
    }
}

impl CoordinatorState {
    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartSession { reply } => {
                let _ = reply.send(self.start_session().await);
            }
            Command::EndSession { reply } => {
                let _ = reply.send(self.end_session().await);
            }
            Command::InjectText { text, reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => session.inject_text(text, &mut self.backend),
                    None => Err(VoiceError::NotListening {
                        state: ConversationState::Idle.to_string(),
                    }),
                };
                let _ = reply.send(result);
            }
            Command::SetContext {
                location,
                restaurants,
                reply,
            } => {
                self.backend
                    .context()
                    .update(|ctx| ctx.set_restaurants(location, restaurants));
                let _ = reply.send(());
            }
            Command::UpdatePreferences { preferences, reply } => {
                info!(count = preferences.len(), "preferences updated");
                self.backend
                    .context()
                    .update(|ctx| ctx.set_preferences(preferences));
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn start_session(&mut self) -> Result<SessionId> {
        if let Some(session) = &self.session {
            info!(session_id = %session.id(), "session already active");
            return Ok(session.id());
        }
        let config = self.config.clone();
        let devices = self.devices.clone();
        let events = self.events.clone();
        // Device startup waits on the capture and render threads.
        let opened = tokio::task::spawn_blocking(move || {
            ConversationSession::open(&config, &devices, events)
        })
        .await
        .unwrap_or_else(|e| Err(VoiceError::Channel(format!("session startup failed: {e}"))));
        match opened {
            Ok(session) => {
                let id = session.id();
                self.session = Some(session);
                Ok(id)
            }
            Err(e) => {
                error!(kind = e.kind(), error = %e, "failed to start session");
                let _ = self.events.send(RuntimeEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn end_session(&mut self) -> Option<SessionId> {
        let session = self.session.take()?;
        let id = session.id();
        if let Err(e) = session.close(&mut self.backend).await {
            warn!(session_id = %id, error = %e, "device error while ending session");
        }
        Some(id)
    }

    fn handle_completion(&mut self, completion: ExchangeCompletion) {
        match self.session.as_mut() {
            Some(session) => session.on_completion(completion, &mut self.backend),
            None => {
                // Session already ended; release the slot if it is still held.
                let _ = self.backend.client_mut().accept(&completion);
            }
        }
    }

    async fn handle_session_input(&mut self, input: SessionInput) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.handle_input(input, &mut self.backend) {
            warn!(session_id = %session.id(), "capture device lost, ending session");
            self.end_session().await;
        }
    }

    fn pump(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.pump_frames(&mut self.backend);
        }
    }

    fn status(&self) -> PipelineStatus {
        let backend = self.backend.client().transport().name();
        match &self.session {
            Some(session) => PipelineStatus {
                state: session.state(),
                session_id: Some(session.id()),
                outstanding_request: session.outstanding(),
                held_utterances: session.held_utterances(),
                backend,
                session: Some(session.counters()),
            },
            None => PipelineStatus {
                state: ConversationState::Idle,
                session_id: None,
                outstanding_request: None,
                held_utterances: 0,
                backend,
                session: None,
            },
        }
    }
}

/// Cloneable handle to a running pipeline.
#[derive(Clone)]
pub struct ConciergeHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<RuntimeEvent>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConciergeHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| VoiceError::Channel("pipeline is not running".into()))?;
        rx.await
            .map_err(|_| VoiceError::Channel("pipeline dropped the reply".into()))
    }

    /// Open devices and start listening. Returns the active session's id if
    /// one is already running.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::DeviceUnavailable`] if a device cannot be opened.
    pub async fn start_session(&self) -> Result<SessionId> {
        self.request(|reply| Command::StartSession { reply }).await?
    }

    /// End the active session. Returns `None` if there was none.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pipeline has stopped.
    pub async fn end_session(&self) -> Result<Option<SessionId>> {
        self.request(|reply| Command::EndSession { reply }).await
    }

    /// Send typed guest input.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::RequestInFlight`] while a response is
    /// outstanding and [`VoiceError::NotListening`] with no session or while
    /// speaking.
    pub async fn inject_text(&self, text: impl Into<String>) -> Result<RequestId> {
        let text = text.into();
        self.request(|reply| Command::InjectText { text, reply })
            .await?
    }

    /// Replace the location and nearby restaurants used in the prompt.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pipeline has stopped.
    pub async fn set_context(
        &self,
        location: impl Into<String>,
        restaurants: Vec<RestaurantSummary>,
    ) -> Result<()> {
        let location = location.into();
        self.request(|reply| Command::SetContext {
            location,
            restaurants,
            reply,
        })
        .await
    }

    /// Replace the guest's preferences.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pipeline has stopped.
    pub async fn update_preferences(&self, preferences: Vec<String>) -> Result<()> {
        self.request(|reply| Command::UpdatePreferences { preferences, reply })
            .await
    }

    /// # Errors
    ///
    /// Returns an error only if the pipeline has stopped.
    pub async fn status(&self) -> Result<PipelineStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Stop the coordinator, ending any session, and wait for it to exit.
    /// Later calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Channel`] if the coordinator task panicked.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.await
                .map_err(|e| VoiceError::Channel(format!("coordinator task failed: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::virtual_device::{VirtualCaptureDevice, VirtualPlaybackDevice};
    use crate::error::error_kinds;
    use crate::exchange::{ScriptStep, ScriptedTransport};
    use std::time::Duration;

    fn handle_with(capture: VirtualCaptureDevice, transport: ScriptedTransport) -> ConciergeHandle {
        let devices = AudioDevices {
            capture: Arc::new(capture),
            playback: Arc::new(VirtualPlaybackDevice::new()),
        };
        spawn_with_transport(
            ConciergeConfig::default(),
            devices,
            ContextHandle::default(),
            Arc::new(transport),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_is_idempotent_and_end_while_idle_is_silent() {
        let handle = handle_with(VirtualCaptureDevice::new(), ScriptedTransport::default());
        let mut events = handle.subscribe();

        assert_eq!(handle.end_session().await.unwrap(), None);
        let first = handle.start_session().await.unwrap();
        let second = handle.start_session().await.unwrap();
        assert_eq!(first, second);

        assert_eq!(handle.end_session().await.unwrap(), Some(first));
        assert_eq!(handle.end_session().await.unwrap(), None);
        handle.shutdown().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.name());
        }
        assert_eq!(
            seen,
            vec![
                "session.started",
                "conversation.state_changed",
                "conversation.state_changed",
                "session.ended",
            ]
        );
    }

    #[tokio::test]
    async fn device_failure_is_reported_and_leaves_pipeline_idle() {
        let handle = handle_with(
            VirtualCaptureDevice::failing("no microphone"),
            ScriptedTransport::default(),
        );
        let err = handle.start_session().await.unwrap_err();
        assert_eq!(err.kind(), error_kinds::DEVICE_UNAVAILABLE);
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, ConversationState::Idle);
        assert!(status.session_id.is_none());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn inject_text_without_session_is_rejected() {
        let handle = handle_with(VirtualCaptureDevice::new(), ScriptedTransport::default());
        let err = handle.inject_text("hello").await.unwrap_err();
        assert_eq!(err.kind(), error_kinds::NOT_LISTENING);
        assert_eq!(err.to_string(), "not listening: conversation is idle");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn injected_text_round_trips_through_the_backend() {
        let transport = ScriptedTransport::new([ScriptStep::text("Try Luigi's")]);
        let handle = handle_with(VirtualCaptureDevice::new(), transport.clone());
        let mut events = handle.subscribe();

        handle
            .set_context("Union Square", Vec::new())
            .await
            .unwrap();
        handle
            .update_preferences(vec!["vegetarian".into()])
            .await
            .unwrap();
        handle.start_session().await.unwrap();
        let request_id = handle.inject_text("Where should I eat?").await.unwrap();

        let text = loop {
            match events.recv().await.unwrap() {
                RuntimeEvent::ResponseText { request_id: id, text } => {
                    assert_eq!(id, request_id);
                    break text;
                }
                _ => continue,
            }
        };
        assert_eq!(text, "Try Luigi's");

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.text(), Some("Where should I eat?"));
        assert!(sent[0].metadata.system_prompt.contains("Union Square"));
        assert!(sent[0].metadata.system_prompt.contains("vegetarian"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn late_reply_after_end_produces_no_response() {
        let transport =
            ScriptedTransport::new([ScriptStep::delayed(Duration::from_millis(200), "too late")]);
        let capture = VirtualCaptureDevice::new();
        let mic = capture.mic();
        let handle = handle_with(capture, transport.clone());
        let mut events = handle.subscribe();

        handle.start_session().await.unwrap();
        handle.inject_text("Any tables left?").await.unwrap();
        handle.end_session().await.unwrap();
        assert!(!mic.is_open());

        // Well past the scripted reply delay.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, ConversationState::Idle);
        assert!(status.outstanding_request.is_none());
        assert_eq!(transport.requests().len(), 1);

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(
                    event,
                    RuntimeEvent::ResponseText { .. }
                        | RuntimeEvent::PlaybackStarted
                        | RuntimeEvent::PlaybackDrained
                ),
                "unexpected {event:?}"
            );
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_ends_active_session() {
        let capture = VirtualCaptureDevice::new();
        let mic = capture.mic();
        let handle = handle_with(capture, ScriptedTransport::default());
        handle.start_session().await.unwrap();
        assert!(mic.is_open());

        handle.shutdown().await.unwrap();
        assert!(!mic.is_open());
        assert!(handle.status().await.is_err());
    }
}
