//! Streaming assembly of one assistant message.
//!
//! Consumes the transport's event sequence for a single response and keeps
//! the conversation history in step: the partial message is appended on
//! `Start` and replaced on every delta, so the last history entry is always
//! the newest snapshot. Lifecycle events are forwarded to the run's event
//! stream as they happen.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::event_stream::AgentEventStream;
use crate::provider::StreamEvent;
use crate::types::*;

pub const ABORT_ERROR_MESSAGE: &str = "Request was aborted";

/// Drive one assistant response to completion.
///
/// Returns the final message, which is also the last entry of `history` on
/// return. Cancellation between events yields an `Aborted` message that
/// preserves whatever partial content had streamed.
pub async fn assemble_response(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<StreamEvent>,
    history: &mut Vec<AgentMessage>,
    events: &AgentEventStream,
    cancel: &CancellationToken,
    model: &str,
    provider: &str,
) -> AssistantMessage {
    let mut partial: Option<AssistantMessage> = None;
    let mut added_partial = false;

    loop {
        // Biased: events already buffered are delivered before cancellation
        // is observed, so an abort racing a terminal event stays lossless.
        let event = tokio::select! {
            biased;
            event = rx.recv() => event,
            _ = cancel.cancelled() => {
                let message = aborted_message(partial.take(), model, provider);
                finish(history, events, message.clone(), added_partial);
                return message;
            }
        };

        let Some(event) = event else {
            if cancel.is_cancelled() {
                // Provider noticed the abort and hung up without a terminal.
                let message = aborted_message(partial.take(), model, provider);
                finish(history, events, message.clone(), added_partial);
                return message;
            }
            // The transport dropped its sender without a terminal event.
            warn!("provider stream ended without done/error");
            let mut message = partial
                .take()
                .unwrap_or_else(|| AssistantMessage::empty(model, provider));
            message.stop_reason = StopReason::Error;
            message.error_message = Some("Provider stream ended unexpectedly".into());
            finish(history, events, message.clone(), added_partial);
            return message;
        };

        match event {
            StreamEvent::Start { partial: p } => {
                partial = Some(p.clone());
                history.push(p.clone().into());
                added_partial = true;
                events.push(AgentEvent::MessageStart { message: p.into() });
            }
            StreamEvent::Done { message } | StreamEvent::Error { message, .. } => {
                finish(history, events, message.clone(), added_partial);
                return message;
            }
            other => {
                let p = other.partial().clone();
                if added_partial {
                    let len = history.len();
                    history[len - 1] = p.clone().into();
                } else {
                    // Transport skipped `Start`; treat the first delta as one.
                    history.push(p.clone().into());
                    added_partial = true;
                    events.push(AgentEvent::MessageStart {
                        message: p.clone().into(),
                    });
                }
                partial = Some(p.clone());
                events.push(AgentEvent::MessageUpdate {
                    message: p.into(),
                    event: other,
                });
            }
        }
    }
}

fn aborted_message(
    partial: Option<AssistantMessage>,
    model: &str,
    provider: &str,
) -> AssistantMessage {
    let mut message = partial.unwrap_or_else(|| AssistantMessage::empty(model, provider));
    message.stop_reason = StopReason::Aborted;
    message.error_message = Some(ABORT_ERROR_MESSAGE.into());
    message
}

/// Replace (or append) the final message in history and emit the end events.
fn finish(
    history: &mut Vec<AgentMessage>,
    events: &AgentEventStream,
    message: AssistantMessage,
    added_partial: bool,
) {
    if added_partial {
        let len = history.len();
        history[len - 1] = message.clone().into();
    } else {
        history.push(message.clone().into());
        events.push(AgentEvent::MessageStart {
            message: message.clone().into(),
        });
    }
    events.push(AgentEvent::MessageEnd {
        message: message.into(),
    });
}
