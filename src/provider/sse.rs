//! Shared SSE (Server-Sent Events) plumbing for HTTP providers.

use super::traits::ProviderError;
use futures::StreamExt;
use reqwest_eventsource::{Error as SseError, Event, EventSource};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A parsed SSE event with event type and data.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Drives an EventSource, sending parsed events through a channel.
///
/// Returns `Ok(())` when the server closes the stream normally (or the
/// receiver went away), `Err(Cancelled)` on cancellation, and a classified
/// [`ProviderError`] on transport failures.
pub async fn drive_sse(
    mut es: EventSource,
    tx: mpsc::UnboundedSender<SseEvent>,
    cancel: CancellationToken,
) -> Result<(), ProviderError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                es.close();
                return Err(ProviderError::Cancelled);
            }
            event = es.next() => {
                match event {
                    None => return Ok(()),
                    Some(Ok(Event::Open)) => {
                        debug!("SSE connection opened");
                    }
                    Some(Ok(Event::Message(msg))) => {
                        if tx.send(SseEvent {
                            event: msg.event,
                            data: msg.data,
                        }).is_err() {
                            es.close();
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => {
                        es.close();
                        return match e {
                            SseError::StreamEnded => Ok(()),
                            other => Err(classify(other)),
                        };
                    }
                }
            }
        }
    }
}

fn classify(error: SseError) -> ProviderError {
    match error {
        SseError::InvalidStatusCode(status, _) => match status.as_u16() {
            401 | 403 => ProviderError::Auth(format!("HTTP {status}")),
            429 => ProviderError::RateLimited {
                retry_after_ms: None,
            },
            500..=599 => ProviderError::Network(format!("HTTP {status}")),
            _ => ProviderError::Api(format!("HTTP {status}")),
        },
        SseError::Transport(e) => ProviderError::Network(e.to_string()),
        other => ProviderError::Network(other.to_string()),
    }
}
