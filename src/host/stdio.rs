//! Newline-delimited JSON bridge between a host process and the pipeline.
//!
//! Reads `CommandEnvelope` lines, routes them through [`HostRouter`], and
//! writes `ResponseEnvelope` and `EventEnvelope` lines. When run over
//! stdin/stdout, stdout is reserved for the protocol and all diagnostics go
//! to stderr.

use crate::error::{Result, VoiceError};
use crate::host::contract::{
    CommandEnvelope, EventEnvelope, ResponseEnvelope, contract_error_kinds,
};
use crate::host::router::HostRouter;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;

/// Run the bridge over the process's stdin and stdout until stdin closes.
///
/// # Errors
///
/// Returns an error if stdin or stdout fails.
pub async fn run_stdio_bridge(router: HostRouter) -> Result<()> {
    run_bridge(router, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the bridge over an arbitrary line reader and writer.
///
/// Two tasks operate concurrently:
///
/// 1. **Reader** (this task) -- parses each line, routes it, and writes the
///    response.
/// 2. **Event forwarder** -- writes every pipeline [`crate::RuntimeEvent`]
///    as an event envelope.
///
/// Both share the writer so lines never interleave. The bridge returns when
/// the input reaches EOF; the pipeline itself is left running.
///
/// # Errors
///
/// Returns an error if reading or writing fails.
pub async fn run_bridge<R, W>(router: HostRouter, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));

    let event_writer = Arc::clone(&writer);
    let mut events = router.handle().subscribe();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let envelope = EventEnvelope::from(&event);
                    match serde_json::to_string(&envelope) {
                        Ok(json) => {
                            let mut w = event_writer.lock().await;
                            if let Err(e) = write_line(&mut *w, &json).await {
                                tracing::warn!(
                                    error = %e,
                                    "failed to write event envelope; stopping event forwarder"
                                );
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to serialize event envelope; skipping");
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
                }
                Err(RecvError::Closed) => {
                    tracing::info!("runtime event channel closed; stopping event forwarder");
                    break;
                }
            }
        }
    });

    let result = run_reader(&router, reader, &writer).await;
    forwarder.abort();
    let _ = forwarder.await;
    result
}

async fn run_reader<R, W>(router: &HostRouter, reader: R, writer: &Mutex<W>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| VoiceError::Channel(format!("failed to read host input: {e}")))?;
        if bytes_read == 0 {
            tracing::info!("host input closed (EOF); stopping bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<CommandEnvelope>(trimmed) {
            Ok(envelope) => router.route(&envelope).await,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse command envelope");
                ResponseEnvelope::error(
                    "parse-error",
                    contract_error_kinds::PARSE_ERROR,
                    format!("failed to parse command envelope: {e}"),
                )
            }
        };

        let json = serde_json::to_string(&response)
            .map_err(|e| VoiceError::Channel(format!("failed to serialize response: {e}")))?;
        let mut w = writer.lock().await;
        write_line(&mut *w, &json).await?;
    }
    Ok(())
}

/// Write one JSON line and flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| VoiceError::Channel(format!("failed to write host output: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| VoiceError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| VoiceError::Channel(format!("failed to flush host output: {e}")))?;
    Ok(())
}
