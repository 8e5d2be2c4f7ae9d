//! Conversation state machine for one guest session.
//!
//! A [`ConversationSession`] owns the session's devices (capture source,
//! ring consumer, playback sink) and its VAD. The coordinator feeds it
//! inputs one at a time; every transition and surfaced error is broadcast as
//! a [`RuntimeEvent`].

use crate::audio::capture::{CaptureEvent, CaptureSource};
use crate::audio::device::{CaptureDevice, PlaybackDevice};
use crate::audio::frame::{AudioFrame, Utterance};
use crate::audio::playback::{AudioSegment, PlaybackEvent, PlaybackSink, PlaybackTicket};
use crate::audio::ring_buffer::{AudioRingBuffer, RingConsumer};
use crate::audio::wav::decode_audio;
use crate::config::ConciergeConfig;
use crate::context::ContextHandle;
use crate::error::{DeviceDirection, Result, VoiceError};
use crate::exchange::{
    AudioRef, ExchangeClient, ExchangeCompletion, ExchangePayload, ExchangeResponse, RequestId,
    RequestMetadata, SessionId,
};
use crate::pipeline::messages::{AudioFetch, SessionCounters};
use crate::runtime::RuntimeEvent;
use crate::vad::{VadEvent, VoiceActivityDetector};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Conversation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// No session.
    Idle,
    /// Capture active, VAD armed.
    Listening,
    /// A request is outstanding.
    AwaitingResponse,
    /// Response audio is rendering; capture frames are discarded.
    Speaking,
}

impl ConversationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::AwaitingResponse => "awaiting_response",
            Self::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device backends used to open each session.
#[derive(Clone)]
pub struct AudioDevices {
    pub capture: Arc<dyn CaptureDevice>,
    pub playback: Arc<dyn PlaybackDevice>,
}

impl AudioDevices {
    /// System microphone and speakers.
    pub fn system() -> Self {
        Self {
            capture: Arc::new(crate::audio::cpal_backend::CpalCaptureDevice),
            playback: Arc::new(crate::audio::cpal_backend::CpalPlaybackDevice),
        }
    }
}

/// The exchange side shared by every session.
pub struct Backend {
    client: ExchangeClient,
    context: ContextHandle,
    model_id: String,
    output_sample_rate: u32,
    include_audio: bool,
    include_text: bool,
    fetched: mpsc::UnboundedSender<AudioFetch>,
}

impl Backend {
    pub fn new(
        client: ExchangeClient,
        context: ContextHandle,
        config: &ConciergeConfig,
        fetched: mpsc::UnboundedSender<AudioFetch>,
    ) -> Self {
        Self {
            client,
            context,
            model_id: config.exchange.model_id.clone(),
            output_sample_rate: config.audio.output_sample_rate,
            include_audio: config.exchange.include_audio,
            include_text: config.exchange.include_text,
            fetched,
        }
    }

    pub fn client(&self) -> &ExchangeClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut ExchangeClient {
        &mut self.client
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    fn metadata(&self, sample_rate: u32) -> RequestMetadata {
        RequestMetadata {
            model_id: self.model_id.clone(),
            system_prompt: self.context.system_prompt(),
            sample_rate,
            include_audio: self.include_audio,
            include_text: self.include_text,
        }
    }

    fn fetch_remote_audio(
        &self,
        session_id: SessionId,
        request_id: RequestId,
        ticket: PlaybackTicket,
        url: String,
    ) {
        let transport = Arc::clone(self.client.transport());
        let tx = self.fetched.clone();
        tokio::spawn(async move {
            debug!(%url, "fetching response audio");
            let result = transport.fetch_audio(&url).await;
            let _ = tx.send(AudioFetch {
                session_id,
                request_id,
                ticket,
                result,
            });
        });
    }
}

/// What happened to an utterance offered to [`HeldUtterances`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldAction {
    Held,
    DroppedOldest,
    DroppedIncoming,
}

/// Utterances completed while a response is outstanding.
struct HeldUtterances {
    max_pending: usize,
    pending: VecDeque<Utterance>,
}

impl HeldUtterances {
    fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            pending: VecDeque::new(),
        }
    }

    fn hold(&mut self, utterance: Utterance) -> HoldAction {
        if self.max_pending == 0 {
            return HoldAction::DroppedIncoming;
        }
        if self.pending.len() < self.max_pending {
            self.pending.push_back(utterance);
            return HoldAction::Held;
        }
        let _ = self.pending.pop_front();
        self.pending.push_back(utterance);
        HoldAction::DroppedOldest
    }

    fn pop(&mut self) -> Option<Utterance> {
        self.pending.pop_front()
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}

/// Inputs a session waits on between coordinator commands.
#[derive(Debug)]
pub enum SessionInput {
    /// The ring has new samples.
    Frames,
    Capture(CaptureEvent),
    Playback(PlaybackEvent),
    /// The awaiting-response ceiling elapsed.
    Deadline,
}

/// One active conversation.
pub struct ConversationSession {
    id: SessionId,
    state: ConversationState,
    vad: VoiceActivityDetector,
    frames: RingConsumer,
    frame_samples: usize,
    capture_sample_rate: u32,
    capture: CaptureSource,
    capture_events: mpsc::Receiver<CaptureEvent>,
    playback: PlaybackSink,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    held: HeldUtterances,
    outstanding: Option<RequestId>,
    awaiting_since: Option<Instant>,
    awaiting_timeout: Duration,
    output_sample_rate: u32,
    counters: SessionCounters,
    events: broadcast::Sender<RuntimeEvent>,
}

impl ConversationSession {
    /// Open devices and enter Listening under a fresh session id.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::DeviceUnavailable`] if either device cannot be
    /// opened; nothing stays open in that case.
    pub fn open(
        config: &ConciergeConfig,
        devices: &AudioDevices,
        events: broadcast::Sender<RuntimeEvent>,
    ) -> Result<Self> {
        let id = SessionId::new();
        let audio = &config.audio;
        let ring = AudioRingBuffer::new(
            config.ring_buffer.capacity_samples(audio),
            config.ring_buffer.overflow,
            audio.sample_rate,
            audio.channels,
        )?;
        let (producer, frames) = ring.split();

        let (playback_tx, playback_events) = mpsc::unbounded_channel();
        let playback = PlaybackSink::open(
            Arc::clone(&devices.playback),
            audio.playback_device_config(),
            playback_tx,
        )?;

        let (capture_tx, capture_events) = mpsc::channel(config.conversation.event_queue_size);
        let mut capture =
            CaptureSource::new(Arc::clone(&devices.capture), audio.capture_device_config());
        // On failure `playback` drops here and closes its device.
        capture.start(producer, capture_tx)?;

        info!(session_id = %id, "session started");
        let mut session = Self {
            id,
            state: ConversationState::Idle,
            vad: VoiceActivityDetector::from_config(&config.vad, audio.frame_size_ms),
            frames,
            frame_samples: audio.frame_samples(),
            capture_sample_rate: audio.sample_rate,
            capture,
            capture_events,
            playback,
            playback_events,
            held: HeldUtterances::new(config.conversation.max_held_utterances),
            outstanding: None,
            awaiting_since: None,
            awaiting_timeout: config.conversation.awaiting_response_timeout(),
            output_sample_rate: audio.output_sample_rate,
            counters: SessionCounters::default(),
            events,
        };
        session.emit(RuntimeEvent::SessionStarted { session_id: id });
        session.transition(ConversationState::Listening);
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn outstanding(&self) -> Option<RequestId> {
        self.outstanding
    }

    pub fn held_utterances(&self) -> usize {
        self.held.len()
    }

    pub fn counters(&self) -> SessionCounters {
        SessionCounters {
            capture: self.capture.stats(),
            utterances_emitted: self.vad.emitted(),
            utterances_discarded: self.vad.discarded(),
            ..self.counters.clone()
        }
    }

    /// When the awaiting-response ceiling expires, if awaiting.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.state, self.awaiting_since) {
            (ConversationState::AwaitingResponse, Some(since)) => {
                Some(since + self.awaiting_timeout)
            }
            _ => None,
        }
    }

    /// Wait for the next device, playback or timer input.
    pub async fn next_input(&mut self) -> SessionInput {
        let deadline = self.deadline();
        tokio::select! {
            Some(event) = self.playback_events.recv() => SessionInput::Playback(event),
            Some(event) = self.capture_events.recv() => SessionInput::Capture(event),
            () = self.frames.readable() => SessionInput::Frames,
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => SessionInput::Deadline,
        }
    }

    /// Route one input. Returns true if the session can no longer run.
    pub fn handle_input(&mut self, input: SessionInput, backend: &mut Backend) -> bool {
        match input {
            SessionInput::Frames => {}
            SessionInput::Capture(event) => {
                if self.on_capture_event(event) {
                    return true;
                }
            }
            SessionInput::Playback(event) => self.on_playback_event(event, backend),
            SessionInput::Deadline => self.check_deadline(backend),
        }
        self.pump_frames(backend);
        false
    }

    /// Drain every whole frame currently buffered in the ring.
    pub fn pump_frames(&mut self, backend: &mut Backend) {
        while let Some(frame) = self.frames.read_frame(self.frame_samples) {
            self.on_frame(frame, backend);
        }
    }

    fn on_frame(&mut self, frame: AudioFrame, backend: &mut Backend) {
        match self.state {
            ConversationState::Speaking => {
                self.counters.frames_suppressed += 1;
            }
            ConversationState::Idle => {}
            ConversationState::Listening | ConversationState::AwaitingResponse => {
                match self.vad.process_frame(frame) {
                    Some(VadEvent::UtteranceReady(utterance)) => {
                        self.on_utterance(utterance, backend);
                    }
                    Some(VadEvent::UtteranceDiscarded { frames }) => {
                        debug!(frames, "discarded short utterance");
                    }
                    Some(VadEvent::SpeechStarted) => debug!("guest started speaking"),
                    None => {}
                }
            }
        }
    }

    fn on_utterance(&mut self, utterance: Utterance, backend: &mut Backend) {
        self.emit(RuntimeEvent::UtteranceDetected {
            frames: utterance.frame_count(),
            duration_ms: utterance.duration().as_millis() as u64,
        });
        if self.state == ConversationState::Listening {
            self.dispatch_utterance(utterance, backend);
            return;
        }
        match self.held.hold(utterance) {
            HoldAction::Held => debug!(held = self.held.len(), "holding utterance"),
            HoldAction::DroppedOldest => {
                self.counters.utterances_dropped += 1;
                warn!("held utterance queue full, dropped oldest");
            }
            HoldAction::DroppedIncoming => {
                self.counters.utterances_dropped += 1;
                warn!("utterance dropped while awaiting response");
            }
        }
    }

    fn dispatch_utterance(&mut self, utterance: Utterance, backend: &mut Backend) {
        match ExchangePayload::from_utterance(&utterance) {
            Ok(payload) => {
                let _ = self.dispatch(payload, utterance.sample_rate(), backend);
            }
            Err(e) => self.surface(&e),
        }
    }

    fn dispatch(
        &mut self,
        payload: ExchangePayload,
        sample_rate: u32,
        backend: &mut Backend,
    ) -> Result<RequestId> {
        let metadata = backend.metadata(sample_rate);
        match backend.client.send(self.id, payload, metadata) {
            Ok(pending) => {
                self.outstanding = Some(pending.request_id);
                self.awaiting_since = Some(Instant::now());
                self.transition(ConversationState::AwaitingResponse);
                Ok(pending.request_id)
            }
            Err(e) => {
                self.surface(&e);
                Err(e)
            }
        }
    }

    /// Send typed input as if it were a detected utterance.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::RequestInFlight`] while a response is
    /// outstanding, [`VoiceError::NotListening`] in any other non-Listening
    /// state.
    pub fn inject_text(&mut self, text: String, backend: &mut Backend) -> Result<RequestId> {
        if let Some(request_id) = self.outstanding {
            return Err(VoiceError::RequestInFlight {
                session_id: self.id.to_string(),
                request_id: request_id.to_string(),
            });
        }
        if self.state != ConversationState::Listening {
            return Err(VoiceError::NotListening {
                state: self.state.to_string(),
            });
        }
        info!(session_id = %self.id, chars = text.len(), "text input");
        self.dispatch(ExchangePayload::Text(text), self.capture_sample_rate, backend)
    }

    /// Resolve the outstanding request.
    pub fn on_completion(&mut self, completion: ExchangeCompletion, backend: &mut Backend) {
        if !backend.client.accept(&completion) || completion.session_id != self.id {
            return;
        }
        if self.outstanding != Some(completion.request_id) {
            warn!(request_id = %completion.request_id, "completion for unknown request");
            return;
        }
        self.outstanding = None;
        self.awaiting_since = None;

        match completion.outcome {
            Ok(response) => self.on_response(response, backend),
            Err(e) => {
                self.surface(&e);
                self.resume_listening(backend);
            }
        }
    }

    fn on_response(&mut self, response: ExchangeResponse, backend: &mut Backend) {
        self.counters.responses += 1;
        if let Some(text) = &response.response_text {
            self.emit(RuntimeEvent::ResponseText {
                request_id: response.request_id,
                text: text.clone(),
            });
        }
        match response.response_audio {
            None => self.resume_listening(backend),
            Some(AudioRef::Inline(bytes)) => match decode_audio(&bytes, self.output_sample_rate) {
                Ok(decoded) if !decoded.samples.is_empty() => {
                    self.playback
                        .enqueue(AudioSegment::new(decoded.samples, decoded.sample_rate));
                    self.transition(ConversationState::Speaking);
                }
                Ok(_) => self.resume_listening(backend),
                Err(e) => {
                    self.surface(&e);
                    self.resume_listening(backend);
                }
            },
            Some(AudioRef::Remote(url)) => {
                let ticket = self.playback.reserve();
                backend.fetch_remote_audio(self.id, response.request_id, ticket, url);
                self.transition(ConversationState::Speaking);
            }
        }
    }

    /// Fill or abandon the playback slot reserved for remote audio.
    pub fn on_audio_fetched(&mut self, fetch: AudioFetch, backend: &mut Backend) {
        if fetch.session_id != self.id {
            return;
        }
        let output_rate = self.output_sample_rate;
        match fetch
            .result
            .and_then(|bytes| decode_audio(&bytes, output_rate))
        {
            Ok(decoded) => {
                let segment = AudioSegment::new(decoded.samples, decoded.sample_rate);
                if !self.playback.fill(fetch.ticket, segment) {
                    debug!(request_id = %fetch.request_id, "playback slot already released");
                }
            }
            Err(e) => {
                self.playback.abandon(fetch.ticket);
                self.surface(&e);
                // Nothing started, so no Drained will arrive for this slot.
                if self.state == ConversationState::Speaking && !self.playback.is_active() {
                    self.resume_listening(backend);
                }
            }
        }
    }

    pub fn on_playback_event(&mut self, event: PlaybackEvent, backend: &mut Backend) {
        match event {
            PlaybackEvent::Started => self.emit(RuntimeEvent::PlaybackStarted),
            PlaybackEvent::Level { rms } => self.emit(RuntimeEvent::AudioLevel { rms }),
            PlaybackEvent::SegmentFinished => debug!("playback segment finished"),
            PlaybackEvent::Failed { message } => {
                self.surface(&VoiceError::device(DeviceDirection::Output, message));
            }
            PlaybackEvent::Drained => {
                self.emit(RuntimeEvent::PlaybackDrained);
                if self.state == ConversationState::Speaking {
                    self.resume_listening(backend);
                }
            }
        }
    }

    /// Returns true if the capture device is gone.
    pub fn on_capture_event(&mut self, event: CaptureEvent) -> bool {
        match event {
            CaptureEvent::Underrun { dropped_frames } => {
                // Already counted in the capture stats; recoverable, so not surfaced.
                let err = VoiceError::CaptureUnderrun { dropped_frames };
                debug!(kind = err.kind(), "{err}");
                false
            }
            CaptureEvent::DeviceLost { message } => {
                self.surface(&VoiceError::device(DeviceDirection::Input, message));
                true
            }
        }
    }

    /// Enforce the awaiting-response ceiling.
    pub fn check_deadline(&mut self, backend: &mut Backend) {
        let Some(deadline) = self.deadline() else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }
        if let Some(request_id) = backend.client.cancel(self.id) {
            warn!(request_id = %request_id, "no response within ceiling, cancelled");
        }
        self.outstanding = None;
        self.awaiting_since = None;
        self.surface(&VoiceError::Timeout {
            what: "awaiting response".into(),
            elapsed: self.awaiting_timeout,
        });
        self.resume_listening(backend);
    }

    fn resume_listening(&mut self, backend: &mut Backend) {
        self.transition(ConversationState::Listening);
        while self.state == ConversationState::Listening {
            let Some(utterance) = self.held.pop() else {
                break;
            };
            info!("dispatching held utterance");
            self.dispatch_utterance(utterance, backend);
        }
    }

    /// End the session: cancel the request, stop both devices and drop all
    /// buffered audio.
    ///
    /// # Errors
    ///
    /// Returns the first device error hit while stopping; the session is
    /// torn down regardless.
    pub async fn close(mut self, backend: &mut Backend) -> Result<()> {
        backend.client.cancel(self.id);
        self.outstanding = None;
        self.awaiting_since = None;

        let id = self.id;
        let from = self.state;
        let events = self.events.clone();
        // Joining the device threads blocks.
        let released = tokio::task::spawn_blocking(move || {
            let result = self.release_devices();
            (self, result)
        })
        .await;

        let result = match released {
            Ok((mut session, result)) => {
                session.transition(ConversationState::Idle);
                result
            }
            Err(e) => {
                if from != ConversationState::Idle {
                    let _ = events.send(RuntimeEvent::StateChanged {
                        from,
                        to: ConversationState::Idle,
                    });
                }
                Err(VoiceError::Channel(format!("session teardown failed: {e}")))
            }
        };
        let _ = events.send(RuntimeEvent::SessionEnded { session_id: id });
        info!(session_id = %id, "session ended");
        result
    }

    fn release_devices(&mut self) -> Result<()> {
        let capture_result = self.capture.stop();
        self.frames.clear();
        self.vad.reset();
        let dropped = self.held.clear();
        if dropped > 0 {
            debug!(dropped, "discarding held utterances");
        }
        self.playback.flush();
        let playback_result = self.playback.close();
        capture_result.and(playback_result)
    }

    fn transition(&mut self, to: ConversationState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if to == ConversationState::Speaking {
            // Our own playback must not reach the detector.
            self.vad.reset();
        }
        info!(from = from.as_str(), to = to.as_str(), "conversation state");
        self.emit(RuntimeEvent::StateChanged { from, to });
    }

    fn surface(&mut self, e: &VoiceError) {
        self.counters.errors += 1;
        error!(kind = e.kind(), error = %e, "pipeline error");
        self.emit(RuntimeEvent::Error {
            kind: e.kind(),
            message: e.to_string(),
        });
    }

    fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::virtual_device::{VirtualCaptureDevice, VirtualMic, VirtualPlaybackDevice};
    use crate::audio::wav::encode_pcm16;
    use crate::error::error_kinds;
    use crate::exchange::{RetryPolicy, ScriptStep, ScriptedTransport};

    struct Harness {
        session: ConversationSession,
        backend: Backend,
        mic: VirtualMic,
        completions: mpsc::Receiver<ExchangeCompletion>,
        events: broadcast::Receiver<RuntimeEvent>,
        _fetched: mpsc::UnboundedReceiver<AudioFetch>,
    }

    fn test_config() -> ConciergeConfig {
        let mut config = ConciergeConfig::default();
        config.vad.hangover_on_ms = 60;
        config.vad.hangover_off_ms = 100;
        config.vad.min_utterance_ms = 100;
        config.conversation.awaiting_response_timeout_ms = 5_000;
        config
    }

    fn harness(config: ConciergeConfig, transport: ScriptedTransport) -> Harness {
        let (completion_tx, completions) = mpsc::channel(8);
        let (fetched_tx, fetched) = mpsc::unbounded_channel();
        let client = ExchangeClient::new(
            Arc::new(transport),
            RetryPolicy::default().without_jitter(),
            config.exchange.request_timeout(),
            completion_tx,
        );
        let backend = Backend::new(client, ContextHandle::default(), &config, fetched_tx);
        let capture = VirtualCaptureDevice::new();
        let mic = capture.mic();
        let devices = AudioDevices {
            capture: Arc::new(capture),
            playback: Arc::new(VirtualPlaybackDevice::new()),
        };
        let (events_tx, events) = broadcast::channel(256);
        let session = ConversationSession::open(&config, &devices, events_tx).expect("open");
        Harness {
            session,
            backend,
            mic,
            completions,
            events,
            _fetched: fetched,
        }
    }

    impl Harness {
        fn speak(&mut self, loud: usize, quiet: usize) {
            self.mic.push_frames(loud, 0.2);
            self.mic.push_frames(quiet, 0.0);
            self.session.pump_frames(&mut self.backend);
        }

        async fn complete(&mut self) {
            let completion = self.completions.recv().await.expect("completion");
            self.session.on_completion(completion, &mut self.backend);
        }

        fn drain_events(&mut self) -> Vec<RuntimeEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if !matches!(event, RuntimeEvent::AudioLevel { .. }) {
                    out.push(event);
                }
            }
            out
        }
    }

    fn wav_reply() -> ScriptStep {
        let wav = encode_pcm16(&[0.1; 640], 16_000, 1).unwrap();
        ScriptStep::audio("Here you go", AudioRef::Inline(wav))
    }

    #[tokio::test]
    async fn held_utterances_are_bounded_and_dispatched_after_reply() {
        let mut h = harness(
            test_config(),
            ScriptedTransport::new([ScriptStep::text("one"), ScriptStep::text("two")]),
        );
        h.speak(10, 5);
        assert_eq!(h.session.state(), ConversationState::AwaitingResponse);

        // Two more utterances while awaiting; one slot, so the first is dropped.
        h.speak(10, 5);
        h.speak(10, 5);
        assert_eq!(h.session.held_utterances(), 1);
        assert_eq!(h.session.counters().utterances_dropped, 1);

        h.complete().await;
        // Text-only reply returns to Listening, then the held one goes out.
        assert_eq!(h.session.state(), ConversationState::AwaitingResponse);
        assert_eq!(h.session.held_utterances(), 0);
        h.complete().await;
        assert_eq!(h.session.state(), ConversationState::Listening);
    }

    #[tokio::test]
    async fn text_injection_requires_listening() {
        let mut h = harness(
            test_config(),
            ScriptedTransport::new([ScriptStep::text("hello"), ScriptStep::text("again")]),
        );
        let first = h.session.inject_text("hi".into(), &mut h.backend).unwrap();
        assert_eq!(h.session.outstanding(), Some(first));

        let err = h
            .session
            .inject_text("hi again".into(), &mut h.backend)
            .unwrap_err();
        assert_eq!(err.kind(), error_kinds::REQUEST_IN_FLIGHT);

        h.complete().await;
        assert_eq!(h.session.state(), ConversationState::Listening);
        assert!(h.session.inject_text("ok".into(), &mut h.backend).is_ok());

        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            RuntimeEvent::ResponseText { text, .. } if text == "hello"
        )));
    }

    #[tokio::test]
    async fn frames_are_suppressed_while_speaking() {
        let mut h = harness(test_config(), ScriptedTransport::new([wav_reply()]));
        h.speak(10, 5);
        h.complete().await;
        assert_eq!(h.session.state(), ConversationState::Speaking);

        h.speak(20, 0);
        assert_eq!(h.session.counters().frames_suppressed, 20);
        let err = h
            .session
            .inject_text("still there?".into(), &mut h.backend)
            .unwrap_err();
        assert_eq!(err.kind(), error_kinds::NOT_LISTENING);

        // Wait for the render thread to drain.
        loop {
            let event = h.session.playback_events.recv().await.unwrap();
            let drained = event == PlaybackEvent::Drained;
            h.session.on_playback_event(event, &mut h.backend);
            if drained {
                break;
            }
        }
        assert_eq!(h.session.state(), ConversationState::Listening);
        // The suppressed frames never started an utterance.
        assert_eq!(h.session.vad.buffered_frames(), 0);
    }

    #[tokio::test]
    async fn failure_surfaces_error_and_resumes_listening() {
        let mut h = harness(test_config(), ScriptedTransport::new([ScriptStep::status(403)]));
        h.speak(10, 5);
        h.complete().await;
        assert_eq!(h.session.state(), ConversationState::Listening);
        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            RuntimeEvent::Error { kind, .. } if *kind == error_kinds::NON_RETRYABLE_EXCHANGE
        )));
    }

    #[tokio::test]
    async fn undecodable_audio_returns_to_listening() {
        let mut h = harness(
            test_config(),
            ScriptedTransport::new([ScriptStep::audio("hm", AudioRef::Inline(vec![1, 2, 3]))]),
        );
        h.speak(10, 5);
        h.complete().await;
        assert_eq!(h.session.state(), ConversationState::Listening);
        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            RuntimeEvent::Error { kind, .. } if *kind == error_kinds::AUDIO
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn awaiting_ceiling_cancels_and_times_out() {
        let mut h = harness(test_config(), ScriptedTransport::new([ScriptStep::Hang]));
        h.speak(10, 5);
        let deadline = h.session.deadline().expect("deadline while awaiting");

        tokio::time::sleep_until(deadline).await;
        h.session.check_deadline(&mut h.backend);
        assert_eq!(h.session.state(), ConversationState::Listening);
        assert!(h.backend.client().in_flight(h.session.id()).is_none());
        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            RuntimeEvent::Error { kind, .. } if *kind == error_kinds::TIMEOUT
        )));
    }

    #[tokio::test]
    async fn capture_loss_ends_the_session() {
        let mut h = harness(test_config(), ScriptedTransport::default());
        assert!(h.mic.lose_device("unplugged"));
        let input = h.session.next_input().await;
        assert!(h.session.handle_input(input, &mut h.backend));
    }

    #[tokio::test]
    async fn reply_racing_session_end_is_discarded() {
        let mut h = harness(
            test_config(),
            ScriptedTransport::new([ScriptStep::delayed(Duration::from_millis(50), "too late")]),
        );
        h.session.inject_text("table for two".into(), &mut h.backend).unwrap();
        // The reply is already queued when the session ends.
        let completion = h.completions.recv().await.expect("completion");
        h.drain_events();

        let Harness {
            session,
            mut backend,
            mut events,
            ..
        } = h;
        session.close(&mut backend).await.unwrap();
        assert!(!backend.client_mut().accept(&completion));

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(
                    event,
                    RuntimeEvent::ResponseText { .. } | RuntimeEvent::PlaybackStarted
                ),
                "unexpected {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn close_cancels_and_emits_idle() {
        let mut h = harness(test_config(), ScriptedTransport::new([ScriptStep::Hang]));
        h.speak(10, 5);
        let id = h.session.id();
        h.drain_events();

        let Harness {
            session,
            mut backend,
            mut events,
            mic,
            ..
        } = h;
        session.close(&mut backend).await.unwrap();
        assert!(backend.client().in_flight(id).is_none());
        assert!(!mic.is_open());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                RuntimeEvent::StateChanged {
                    from: ConversationState::AwaitingResponse,
                    to: ConversationState::Idle,
                },
                RuntimeEvent::SessionEnded { session_id: id },
            ]
        );
    }
}
