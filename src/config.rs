//! Configuration types for the concierge voice pipeline.

use crate::audio::device::DeviceConfig;
use crate::audio::ring_buffer::OverflowPolicy;
use crate::context::ConciergeContext;
use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding [`ExchangeConfig::endpoint`].
pub const ENV_ENDPOINT: &str = "CONCIERGE_ENDPOINT";
/// Environment variable overriding [`ExchangeConfig::api_token`].
pub const ENV_API_TOKEN: &str = "CONCIERGE_API_TOKEN";
/// Environment variable overriding [`ExchangeConfig::backend`] (`mock` or `http`).
pub const ENV_BACKEND: &str = "CONCIERGE_BACKEND";

/// Top-level configuration for the concierge pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConciergeConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Capture ring buffer sizing and overflow behaviour.
    pub ring_buffer: RingBufferConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Conversational backend settings.
    pub exchange: ExchangeConfig,
    /// Conversation state machine settings.
    pub conversation: ConversationConfig,
    /// Location, guest preferences and nearby restaurants for the prompt.
    pub context: ConciergeContext,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Number of capture channels delivered to the pipeline (1 = mono).
    pub channels: u16,
    /// Bits per sample on the wire (16-bit PCM).
    pub bit_depth: u16,
    /// Length of one capture frame in milliseconds.
    pub frame_size_ms: u32,
    /// Playback sample rate in Hz. Raw PCM response audio is assumed to be
    /// at this rate.
    pub output_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bit_depth: 16,
            frame_size_ms: 20,
            output_sample_rate: 16_000,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Number of samples in one capture frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize / 1000) * self.channels as usize
    }

    /// Device parameters for the capture direction.
    pub fn capture_device_config(&self) -> DeviceConfig {
        DeviceConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_depth: self.bit_depth,
            frame_size_ms: self.frame_size_ms,
            device_name: self.input_device.clone(),
        }
    }

    /// Device parameters for the playback direction.
    pub fn playback_device_config(&self) -> DeviceConfig {
        DeviceConfig {
            sample_rate: self.output_sample_rate,
            channels: 1,
            bit_depth: self.bit_depth,
            frame_size_ms: self.frame_size_ms,
            device_name: self.output_device.clone(),
        }
    }
}

/// Capture ring buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingBufferConfig {
    /// Capacity expressed as milliseconds of capture audio.
    pub capacity_ms: u32,
    /// What happens when the producer outruns the consumer.
    ///
    /// `reject` (default) drops the incoming frame and counts it; nothing
    /// already buffered is lost. `overwrite_oldest` keeps the newest audio
    /// and silently discards unread samples, which can cut the start of an
    /// utterance when the coordinator falls behind.
    pub overflow: OverflowPolicy,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            capacity_ms: 2_000,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl RingBufferConfig {
    /// Capacity in samples for the given capture format, rounded up to a
    /// whole number of frames so overwrites always drop whole frames.
    pub fn capacity_samples(&self, audio: &AudioConfig) -> usize {
        let raw =
            audio.sample_rate as usize * audio.channels as usize * self.capacity_ms as usize / 1000;
        let frame = audio.frame_samples();
        if frame == 0 {
            return raw;
        }
        raw.div_ceil(frame) * frame
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy above which a frame counts as speech (attack threshold).
    ///
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive
    ///   - 0.01:  normal sensitivity (default)
    ///   - 0.02:  noisy environments
    pub threshold: f32,
    /// RMS energy below which a frame counts as silence while speaking
    /// (release threshold). Must not exceed `threshold`.
    pub floor: f32,
    /// Speech must persist this long before an utterance starts.
    pub hangover_on_ms: u32,
    /// Silence must persist this long before an utterance ends.
    pub hangover_off_ms: u32,
    /// Utterances are force-finalized at this duration.
    pub max_utterance_ms: u32,
    /// Utterances shorter than this are discarded.
    pub min_utterance_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            floor: 0.006,
            hangover_on_ms: 60,
            hangover_off_ms: 1_000,
            max_utterance_ms: 30_000,
            min_utterance_ms: 200,
        }
    }
}

/// Which conversational backend the exchange client talks to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeBackend {
    /// In-process scripted concierge replies (no network).
    #[default]
    Mock,
    /// JSON over HTTPS to `endpoint`.
    Http,
}

impl ExchangeBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(Self::Mock),
            "http" | "https" | "remote" => Some(Self::Http),
            _ => None,
        }
    }
}

/// Retry behaviour for transient exchange failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Growth factor between consecutive retry delays.
    pub backoff_multiplier: f64,
    /// Upper bound on any single retry delay.
    pub max_delay_ms: u64,
    /// Random extra delay as a fraction of the computed delay (0 disables).
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 2_000,
            jitter_ratio: 0.1,
        }
    }
}

/// Conversational backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Backend selection.
    pub backend: ExchangeBackend,
    /// Full URL requests are POSTed to (HTTP backend).
    pub endpoint: String,
    /// Bearer token sent with each request, if any.
    pub api_token: Option<String>,
    /// Model identifier forwarded in request metadata.
    pub model_id: String,
    /// Lifetime of one logical request, including retries and backoff.
    pub request_timeout_ms: u64,
    /// Timeout of a single attempt. An attempt that outlives it is retried.
    pub attempt_timeout_ms: u64,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Ask the backend for synthesized audio.
    pub include_audio: bool,
    /// Ask the backend for response text.
    pub include_text: bool,
    /// Simulated processing latency of the mock backend.
    pub mock_latency_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            backend: ExchangeBackend::Mock,
            endpoint: "http://127.0.0.1:8080/v1/converse".to_owned(),
            api_token: None,
            model_id: "amazon.nova-sonic-v1:0".to_owned(),
            request_timeout_ms: 15_000,
            attempt_timeout_ms: 5_000,
            retry: RetryConfig::default(),
            include_audio: true,
            include_text: true,
            mock_latency_ms: 2_000,
        }
    }
}

impl ExchangeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Conversation state machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Ceiling on the Awaiting Response state, independent of the request
    /// timeout.
    pub awaiting_response_timeout_ms: u64,
    /// Utterances completed while a response is outstanding are held up to
    /// this count (oldest dropped first). 0 discards them.
    pub max_held_utterances: usize,
    /// Capacity of the coordinator's inbound event queue.
    pub event_queue_size: usize,
    /// Capacity of the host runtime-event broadcast.
    pub runtime_event_capacity: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            awaiting_response_timeout_ms: 20_000,
            max_held_utterances: 1,
            event_queue_size: 64,
            runtime_event_capacity: 128,
        }
    }
}

impl ConversationConfig {
    pub fn awaiting_response_timeout(&self) -> Duration {
        Duration::from_millis(self.awaiting_response_timeout_ms)
    }
}

impl ConciergeConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/concierge/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("concierge").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("concierge")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/concierge-config/config.toml")
        }
    }

    /// Load the default config file if it exists, otherwise use defaults,
    /// then apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is invalid or validation fails.
    pub fn load() -> Result<Self> {
        let path = Self::default_config_path();
        let mut config = if path.exists() {
            tracing::info!(path = %path.display(), "loading config");
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override endpoint, token and backend from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var(ENV_ENDPOINT) {
            if !endpoint.trim().is_empty() {
                self.exchange.endpoint = endpoint;
            }
        }
        if let Ok(token) = std::env::var(ENV_API_TOKEN) {
            if !token.trim().is_empty() {
                self.exchange.api_token = Some(token);
            }
        }
        if let Ok(raw) = std::env::var(ENV_BACKEND) {
            match ExchangeBackend::parse(&raw) {
                Some(backend) => self.exchange.backend = backend,
                None => tracing::warn!(value = %raw, "ignoring unknown {ENV_BACKEND}"),
            }
        }
    }

    /// Check cross-field constraints that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.sample_rate == 0 || audio.output_sample_rate == 0 {
            return Err(VoiceError::Config("sample rates must be non-zero".into()));
        }
        if audio.channels == 0 {
            return Err(VoiceError::Config("channels must be non-zero".into()));
        }
        if audio.bit_depth != 16 {
            return Err(VoiceError::Config(format!(
                "unsupported bit depth {}; only 16-bit PCM is supported",
                audio.bit_depth
            )));
        }
        if audio.frame_samples() == 0 {
            return Err(VoiceError::Config(
                "frame_size_ms yields an empty frame".into(),
            ));
        }
        if self.ring_buffer.capacity_samples(audio) < audio.frame_samples() {
            return Err(VoiceError::Config(
                "ring buffer must hold at least one frame".into(),
            ));
        }
        let vad = &self.vad;
        if vad.floor > vad.threshold {
            return Err(VoiceError::Config(format!(
                "vad.floor ({}) must not exceed vad.threshold ({})",
                vad.floor, vad.threshold
            )));
        }
        if vad.max_utterance_ms < audio.frame_size_ms {
            return Err(VoiceError::Config(
                "vad.max_utterance_ms must cover at least one frame".into(),
            ));
        }
        let exchange = &self.exchange;
        if exchange.retry.max_attempts == 0 {
            return Err(VoiceError::Config(
                "exchange.retry.max_attempts must be at least 1".into(),
            ));
        }
        if exchange.retry.backoff_multiplier < 1.0 {
            return Err(VoiceError::Config(
                "exchange.retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if exchange.attempt_timeout_ms == 0
            || exchange.attempt_timeout_ms > exchange.request_timeout_ms
        {
            return Err(VoiceError::Config(format!(
                "exchange.attempt_timeout_ms ({}) must be non-zero and within request_timeout_ms ({})",
                exchange.attempt_timeout_ms, exchange.request_timeout_ms
            )));
        }
        if exchange.backend == ExchangeBackend::Http && exchange.endpoint.trim().is_empty() {
            return Err(VoiceError::Config(
                "exchange.endpoint is required for the http backend".into(),
            ));
        }
        if self.conversation.event_queue_size == 0 {
            return Err(VoiceError::Config(
                "conversation.event_queue_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ConciergeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.frame_samples(), 320);
        assert_eq!(config.ring_buffer.capacity_samples(&config.audio), 32_000);
        assert_eq!(config.ring_buffer.overflow, OverflowPolicy::Reject);
        assert_eq!(config.exchange.backend, ExchangeBackend::Mock);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ConciergeConfig::default();
        config.audio.sample_rate = 24_000;
        config.vad.hangover_off_ms = 400;
        config.exchange.backend = ExchangeBackend::Http;
        config.ring_buffer.overflow = OverflowPolicy::OverwriteOldest;
        config.context.location = "Lisbon".to_owned();

        config.save_to_file(&path).expect("save");
        let loaded = ConciergeConfig::from_file(&path).expect("load");
        assert_eq!(loaded.audio.sample_rate, 24_000);
        assert_eq!(loaded.vad.hangover_off_ms, 400);
        assert_eq!(loaded.exchange.backend, ExchangeBackend::Http);
        assert_eq!(loaded.ring_buffer.overflow, OverflowPolicy::OverwriteOldest);
        assert_eq!(loaded.context.location, "Lisbon");
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
[vad]
threshold = 0.02

[exchange]
backend = "http"
endpoint = "https://concierge.example/v1/converse"
"#;
        let config: ConciergeConfig = toml::from_str(toml_str).expect("parse");
        assert!((config.vad.threshold - 0.02).abs() < f32::EPSILON);
        assert_eq!(config.vad.hangover_on_ms, 60);
        assert_eq!(config.exchange.backend, ExchangeBackend::Http);
        assert_eq!(config.exchange.retry.max_attempts, 3);
        assert_eq!(config.audio.sample_rate, 16_000);
    }

    #[test]
    fn overflow_policy_serializes_snake_case() {
        let toml_str = "[ring_buffer]\noverflow = \"overwrite_oldest\"\n";
        let config: ConciergeConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.ring_buffer.overflow, OverflowPolicy::OverwriteOldest);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result =
            ConciergeConfig::from_file(std::path::Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn floor_above_threshold_is_rejected() {
        let mut config = ConciergeConfig::default();
        config.vad.floor = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("vad.floor"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = ConciergeConfig::default();
        config.exchange.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ring_capacity_is_whole_frames() {
        let mut config = ConciergeConfig::default();
        config.ring_buffer.capacity_ms = 1_001;
        let frame = config.audio.frame_samples();
        let capacity = config.ring_buffer.capacity_samples(&config.audio);
        assert_eq!(capacity % frame, 0);
        assert!(capacity >= 16_016);
        assert!(capacity < 16_016 + frame);
    }

    #[test]
    fn attempt_timeout_must_fit_in_request_timeout() {
        let mut config = ConciergeConfig::default();
        config.exchange.attempt_timeout_ms = config.exchange.request_timeout_ms + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("attempt_timeout_ms"));
    }

    #[test]
    fn unsupported_bit_depth_is_rejected() {
        let mut config = ConciergeConfig::default();
        config.audio.bit_depth = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_parse_accepts_aliases() {
        assert_eq!(ExchangeBackend::parse("HTTP"), Some(ExchangeBackend::Http));
        assert_eq!(ExchangeBackend::parse(" mock "), Some(ExchangeBackend::Mock));
        assert_eq!(ExchangeBackend::parse("grpc"), None);
    }
}
