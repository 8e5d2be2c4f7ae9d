//! Transport seam between the exchange client and a backend.

use crate::error::Result;
use crate::exchange::types::{ExchangeRequest, ExchangeResponse};
use async_trait::async_trait;

/// A conversational backend.
///
/// Implementations perform exactly one attempt per call; retry and timeout
/// policy belong to [`crate::exchange::ExchangeClient`].
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Send one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::VoiceError::TransientExchange`] for failures
    /// worth retrying and [`crate::error::VoiceError::NonRetryableExchange`]
    /// otherwise.
    async fn send(&self, request: &ExchangeRequest) -> Result<ExchangeResponse>;

    /// Download response audio referenced by URL.
    ///
    /// # Errors
    ///
    /// Returns an exchange error if the audio cannot be fetched.
    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>>;
}
