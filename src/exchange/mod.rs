//! Exchange with the conversational backend.
//!
//! [`ExchangeClient`] owns retry, timeout and single-flight rules; a
//! [`ExchangeTransport`] performs one attempt against a concrete backend.

pub mod client;
pub mod http;
pub mod mock;
pub mod retry;
pub mod transport;
pub mod types;

pub use client::{ExchangeClient, ExchangeCompletion, PendingRequest};
pub use http::HttpTransport;
pub use mock::{MockTransport, ScriptStep, ScriptedTransport};
pub use retry::RetryPolicy;
pub use transport::ExchangeTransport;
pub use types::{
    AudioRef, ExchangePayload, ExchangeRequest, ExchangeResponse, RequestId, RequestMetadata,
    SessionId,
};

use crate::config::{ExchangeBackend, ExchangeConfig};
use crate::context::ContextHandle;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Build the transport selected by `config.backend`.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be constructed.
pub fn build_transport(
    config: &ExchangeConfig,
    context: &ContextHandle,
) -> Result<Arc<dyn ExchangeTransport>> {
    match config.backend {
        ExchangeBackend::Mock => {
            tracing::info!(latency_ms = config.mock_latency_ms, "using mock concierge backend");
            Ok(Arc::new(MockTransport::new(
                context.clone(),
                Duration::from_millis(config.mock_latency_ms),
            )))
        }
        ExchangeBackend::Http => {
            tracing::info!(endpoint = %config.endpoint, "using HTTP concierge backend");
            Ok(Arc::new(HttpTransport::new(config)?))
        }
    }
}
