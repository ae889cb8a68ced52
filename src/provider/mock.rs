//! Mock provider for testing. No real API calls.
//!
//! Responses are scripted. Each one is played back as a realistic event
//! sequence (`Start`, deltas carrying the growing partial message, then a
//! terminal `Done`/`Error`), so loop and assembler behavior under streaming
//! is exercised for real. An optional delay between events opens a window
//! for abort and steering tests.

use super::traits::*;
use crate::types::*;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A mock response: plain text, tool calls, a stream error, or a fully
/// scripted assistant message (terminal event follows its `stop_reason`).
#[derive(Debug, Clone)]
pub enum MockResponse {
    Text(String),
    ToolCalls(Vec<MockToolCall>),
    Error(String),
    Message(AssistantMessage),
}

#[derive(Debug, Clone)]
pub struct MockToolCall {
    /// Generated when `None`.
    pub id: Option<String>,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl MockToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            arguments,
        }
    }
}

/// Mock LLM provider for tests. Supply a sequence of responses.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    event_delay: Option<Duration>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            event_delay: None,
        }
    }

    /// Convenience: provider that always returns the same text
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![MockResponse::Text(text.into())])
    }

    /// Convenience: sequence of text responses
    pub fn texts(texts: Vec<impl Into<String>>) -> Self {
        Self::new(
            texts
                .into_iter()
                .map(|t| MockResponse::Text(t.into()))
                .collect(),
        )
    }

    /// Sleep between stream events, giving tests a window to abort.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }
}

#[async_trait]
impl StreamProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, ProviderError> {
        let response = {
            let mut responses = self.responses.lock().unwrap();
            responses
                .pop_front()
                .unwrap_or_else(|| MockResponse::Text("(no more mock responses)".into()))
        };

        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let model = if request.model.is_empty() {
            "mock-model".to_string()
        } else {
            request.model.clone()
        };
        let delay = self.event_delay;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let emit = |event: StreamEvent| tx.send(event).is_ok();
            let pause = |cancel: CancellationToken| async move {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        _ = cancel.cancelled() => true,
                    }
                } else {
                    cancel.is_cancelled()
                }
            };

            let mut partial = AssistantMessage::empty(&model, "mock");
            if !emit(StreamEvent::Start {
                partial: partial.clone(),
            }) {
                return;
            }

            match response {
                MockResponse::Text(text) => {
                    if pause(cancel.clone()).await {
                        return;
                    }
                    partial.content = vec![Content::text(&text)];
                    if !emit(StreamEvent::TextDelta {
                        content_index: 0,
                        delta: text,
                        partial: partial.clone(),
                    }) {
                        return;
                    }
                    if pause(cancel.clone()).await {
                        return;
                    }
                    emit(StreamEvent::Done { message: partial });
                }
                MockResponse::ToolCalls(calls) => {
                    for (index, call) in calls.into_iter().enumerate() {
                        if pause(cancel.clone()).await {
                            return;
                        }
                        let id = call
                            .id
                            .unwrap_or_else(|| format!("tool_{}", Uuid::new_v4().simple()));
                        partial.content.push(Content::ToolCall {
                            id: id.clone(),
                            name: call.name.clone(),
                            arguments: serde_json::Value::Object(Default::default()),
                            intent: None,
                        });
                        if !emit(StreamEvent::ToolCallStart {
                            content_index: index,
                            id,
                            name: call.name,
                            partial: partial.clone(),
                        }) {
                            return;
                        }
                        if let Some(Content::ToolCall { arguments, .. }) =
                            partial.content.last_mut()
                        {
                            *arguments = call.arguments;
                        }
                        if !emit(StreamEvent::ToolCallEnd {
                            content_index: index,
                            partial: partial.clone(),
                        }) {
                            return;
                        }
                    }
                    if pause(cancel.clone()).await {
                        return;
                    }
                    partial.stop_reason = StopReason::ToolUse;
                    emit(StreamEvent::Done { message: partial });
                }
                MockResponse::Error(error) => {
                    if pause(cancel.clone()).await {
                        return;
                    }
                    partial.stop_reason = StopReason::Error;
                    partial.error_message = Some(error.clone());
                    emit(StreamEvent::Error {
                        error,
                        message: partial,
                    });
                }
                MockResponse::Message(message) => {
                    if pause(cancel.clone()).await {
                        return;
                    }
                    if message.stop_reason == StopReason::Error {
                        emit(StreamEvent::Error {
                            error: message
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "error".into()),
                            message,
                        });
                    } else {
                        emit(StreamEvent::Done { message });
                    }
                }
            }
        });

        Ok(rx)
    }
}
