//! In-process backends: the keyword concierge and a scripted test double.

use crate::context::{ConciergeContext, ContextHandle};
use crate::error::{Result, VoiceError};
use crate::exchange::transport::ExchangeTransport;
use crate::exchange::types::{
    AudioRef, ExchangePayload, ExchangeRequest, ExchangeResponse,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Development backend with canned concierge replies.
///
/// Replies are chosen by keyword from typed input, use the current
/// restaurant context, and never include audio.
pub struct MockTransport {
    context: ContextHandle,
    latency: Duration,
}

impl MockTransport {
    pub fn new(context: ContextHandle, latency: Duration) -> Self {
        Self { context, latency }
    }
}

fn has_word(input: &str, word: &str) -> bool {
    input
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}

/// Pick a concierge reply for `input` (already lowercased).
pub fn concierge_reply(input: &str, context: &ConciergeContext) -> String {
    let top = context.restaurants.first();

    if input.contains("italian") {
        let italian = context
            .restaurants
            .iter()
            .find(|r| r.serves("italian"))
            .or(top);
        return match italian {
            Some(r) => format!(
                "I found several great Italian restaurants nearby! The top recommendation is {}, \
                 which has a {:.1}-star rating and serves authentic Italian cuisine. Would you \
                 like to hear more details about this restaurant or see other options?",
                r.name, r.rating
            ),
            None => "I'd be happy to help you find Italian restaurants! Let me search for \
                     Italian restaurants in your area. One moment please..."
                .to_owned(),
        };
    }
    if input.contains("restaurant") || input.contains("food") || has_word(input, "eat") {
        return if context.restaurants.is_empty() {
            "I'd be delighted to help you find a great restaurant! What type of cuisine are you \
             interested in, and do you have any preferences for price range or distance?"
                .to_owned()
        } else {
            format!(
                "I have information about {} restaurants in your area. What type of cuisine are \
                 you in the mood for today? I can recommend options based on Italian, Asian, \
                 American, or other cuisines.",
                context.restaurants.len()
            )
        };
    }
    if has_word(input, "hello") || has_word(input, "hi") {
        return "Hello! I'm your restaurant concierge assistant. I'm here to help you discover \
                amazing dining experiences in your area. What kind of restaurant are you looking \
                for today?"
            .to_owned();
    }
    if has_word(input, "hours") || has_word(input, "open") {
        return match top {
            Some(r) => format!(
                "Let me check the operating hours for you. {} is currently open and serves until \
                 10 PM tonight. Would you like me to check the hours for other restaurants as well?",
                r.name
            ),
            None => "I can help you check restaurant hours! Which restaurant would you like to \
                     know about?"
                .to_owned(),
        };
    }
    "I understand you're looking for restaurant information. Could you tell me more \
     specifically what you'd like to know? I can help with finding restaurants by cuisine type, \
     checking hours, reading reviews, or getting directions."
        .to_owned()
}

#[async_trait]
impl ExchangeTransport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send(&self, request: &ExchangeRequest) -> Result<ExchangeResponse> {
        tokio::time::sleep(self.latency).await;
        let input = match request.payload.as_ref() {
            ExchangePayload::Text(text) => text.to_lowercase(),
            // No recognizer in the loop; spoken input gets the general reply.
            ExchangePayload::Audio { .. } => String::new(),
        };
        let reply = concierge_reply(&input, &self.context.snapshot());
        tracing::info!(request_id = %request.request_id, "mock response: {reply}");
        Ok(ExchangeResponse::text(request.request_id, reply))
    }

    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>> {
        Err(VoiceError::NonRetryableExchange {
            status: None,
            message: format!("mock backend has no audio at {url}"),
        })
    }
}

/// One scripted backend reaction.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Succeed after `delay`.
    Reply {
        delay: Duration,
        text: Option<String>,
        audio: Option<AudioRef>,
    },
    /// Fail with this HTTP status after `delay`.
    Status { delay: Duration, status: u16 },
    /// Never answer.
    Hang,
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Reply {
            delay: Duration::ZERO,
            text: Some(text.into()),
            audio: None,
        }
    }

    /// Text reply that arrives after `delay`.
    pub fn delayed(delay: Duration, text: impl Into<String>) -> Self {
        Self::Reply {
            delay,
            text: Some(text.into()),
            audio: None,
        }
    }

    pub fn audio(text: impl Into<String>, audio: AudioRef) -> Self {
        Self::Reply {
            delay: Duration::ZERO,
            text: Some(text.into()),
            audio: Some(audio),
        }
    }

    pub fn status(status: u16) -> Self {
        Self::Status {
            delay: Duration::ZERO,
            status,
        }
    }
}

#[derive(Default)]
struct ScriptState {
    steps: VecDeque<ScriptStep>,
    seen: Vec<ExchangeRequest>,
    remote_audio: HashMap<String, Vec<u8>>,
}

/// Transport that plays back a fixed list of reactions, one per attempt,
/// and records every request it receives.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        let transport = Self::default();
        lock(&transport.state).steps.extend(steps);
        transport
    }

    pub fn push(&self, step: ScriptStep) {
        lock(&self.state).steps.push_back(step);
    }

    /// Serve `bytes` for [`AudioRef::Remote`] `url`.
    pub fn with_remote_audio(self, url: impl Into<String>, bytes: Vec<u8>) -> Self {
        lock(&self.state).remote_audio.insert(url.into(), bytes);
        self
    }

    /// Every attempt received so far.
    pub fn requests(&self) -> Vec<ExchangeRequest> {
        lock(&self.state).seen.clone()
    }
}

#[async_trait]
impl ExchangeTransport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, request: &ExchangeRequest) -> Result<ExchangeResponse> {
        let step = {
            let mut state = lock(&self.state);
            state.seen.push(request.clone());
            state.steps.pop_front()
        };
        match step {
            Some(ScriptStep::Reply { delay, text, audio }) => {
                tokio::time::sleep(delay).await;
                Ok(ExchangeResponse {
                    request_id: request.request_id,
                    status: "ok".to_owned(),
                    response_text: text,
                    response_audio: audio,
                })
            }
            Some(ScriptStep::Status { delay, status }) => {
                tokio::time::sleep(delay).await;
                Err(VoiceError::from_status(status, "scripted failure"))
            }
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => Err(VoiceError::NonRetryableExchange {
                status: None,
                message: "script exhausted".into(),
            }),
        }
    }

    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>> {
        lock(&self.state)
            .remote_audio
            .get(url)
            .cloned()
            .ok_or_else(|| VoiceError::from_status(404, format!("no scripted audio at {url}")))
    }
}
