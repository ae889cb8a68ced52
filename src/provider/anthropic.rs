//! Anthropic Claude provider (Messages API with streaming).
//!
//! Maintains the growing partial assistant message and attaches a snapshot
//! to every emitted [`StreamEvent`]. Transient failures before any content
//! has streamed are retried with backoff; `max_retry_delay_ms` caps
//! server-requested delays.

use super::sse::{drive_sse, SseEvent};
use super::traits::*;
use crate::retry::{log_retry, RetryConfig};
use crate::types::*;
use async_trait::async_trait;
use reqwest_eventsource::EventSource;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    base_url: String,
    retry: RetryConfig,
    client: reqwest::Client,
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            retry: RetryConfig::default(),
            client: reqwest::Client::new(),
        }
    }

    /// Point at a different endpoint (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl StreamProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, ProviderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let base_url = self.base_url.clone();
        let retry = self.retry.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut attempt = 0usize;
            loop {
                let failure =
                    match stream_once(&client, &base_url, &request, &tx, &cancel).await {
                        Ok(()) => return,
                        Err(failure) => failure,
                    };

                if matches!(failure.error, ProviderError::Cancelled) {
                    // The assembler observes the abort itself.
                    return;
                }

                // Retry only while nothing has streamed: a half-delivered
                // response cannot be resumed.
                if !failure.emitted && failure.error.is_retryable() && attempt < retry.max_retries
                {
                    attempt += 1;
                    let delay = retry.next_delay(
                        attempt,
                        failure.error.retry_after(),
                        request.max_retry_delay_ms,
                    );
                    log_retry(attempt, retry.max_retries, &delay, &failure.error);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = cancel.cancelled() => return,
                    }
                }

                warn!("Anthropic stream failed: {}", failure.error);
                let message = AssistantMessage::errored(
                    &request.model,
                    "anthropic",
                    failure.error.to_string(),
                );
                let _ = tx.send(StreamEvent::Error {
                    error: failure.error.to_string(),
                    message,
                });
                return;
            }
        });

        Ok(rx)
    }
}

struct StreamFailure {
    error: ProviderError,
    /// Whether any stream event already reached the consumer.
    emitted: bool,
}

async fn stream_once(
    client: &reqwest::Client,
    base_url: &str,
    request: &StreamRequest,
    tx: &mpsc::UnboundedSender<StreamEvent>,
    cancel: &CancellationToken,
) -> Result<(), StreamFailure> {
    let body = build_request_body(request);
    debug!("Anthropic request: model={}", request.model);

    let http = client
        .post(format!("{base_url}/v1/messages"))
        .header("x-api-key", &request.api_key)
        .header("anthropic-version", API_VERSION)
        .header("content-type", "application/json")
        .json(&body);

    let es = EventSource::new(http).map_err(|e| StreamFailure {
        error: ProviderError::Network(e.to_string()),
        emitted: false,
    })?;

    let (sse_tx, mut sse_rx) = mpsc::unbounded_channel();
    let driver = tokio::spawn(drive_sse(es, sse_tx, cancel.clone()));

    let mut assembly = Assembly::new(&request.model);
    let mut emitted = false;

    while let Some(sse) = sse_rx.recv().await {
        match assembly.apply(&sse) {
            Ok(events) => {
                for event in events {
                    let done = event.is_terminal();
                    if tx.send(event).is_err() {
                        driver.abort();
                        return Ok(());
                    }
                    emitted = true;
                    if done {
                        return Ok(());
                    }
                }
            }
            Err(error) => {
                driver.abort();
                return Err(StreamFailure { error, emitted });
            }
        }
    }

    match driver.await {
        // Server closed without message_stop: finish with what we have.
        Ok(Ok(())) => {
            let _ = tx.send(assembly.finish());
            Ok(())
        }
        Ok(Err(error)) => Err(StreamFailure { error, emitted }),
        Err(join) => Err(StreamFailure {
            error: ProviderError::Other(join.to_string()),
            emitted,
        }),
    }
}

// ---------------------------------------------------------------------------
// Incremental assembly of the partial message
// ---------------------------------------------------------------------------

struct Assembly {
    message: AssistantMessage,
    tool_json: HashMap<usize, String>,
}

impl Assembly {
    fn new(model: &str) -> Self {
        Self {
            message: AssistantMessage::empty(model, "anthropic"),
            tool_json: HashMap::new(),
        }
    }

    /// Apply one SSE event, returning the stream events it produces.
    fn apply(&mut self, sse: &SseEvent) -> Result<Vec<StreamEvent>, ProviderError> {
        match sse.event.as_str() {
            "message_start" => {
                if let Ok(data) = serde_json::from_str::<MessageStart>(&sse.data) {
                    self.message.usage.input = data.message.usage.input_tokens;
                    self.message.usage.cache_read = data.message.usage.cache_read_input_tokens;
                    self.message.usage.cache_write =
                        data.message.usage.cache_creation_input_tokens;
                }
                Ok(vec![StreamEvent::Start {
                    partial: self.message.clone(),
                }])
            }
            "content_block_start" => {
                let data: ContentBlockStart = parse(&sse.data)?;
                let index = data.index as usize;
                match data.content_block {
                    ContentBlock::Text { text } => {
                        self.set_block(index, Content::Text { text });
                        Ok(vec![StreamEvent::TextStart {
                            content_index: index,
                            partial: self.message.clone(),
                        }])
                    }
                    ContentBlock::Thinking { thinking } => {
                        self.set_block(
                            index,
                            Content::Thinking {
                                thinking,
                                signature: None,
                            },
                        );
                        Ok(vec![StreamEvent::ThinkingStart {
                            content_index: index,
                            partial: self.message.clone(),
                        }])
                    }
                    ContentBlock::ToolUse { id, name } => {
                        self.set_block(
                            index,
                            Content::ToolCall {
                                id: id.clone(),
                                name: name.clone(),
                                arguments: serde_json::Value::Object(Default::default()),
                                intent: None,
                            },
                        );
                        Ok(vec![StreamEvent::ToolCallStart {
                            content_index: index,
                            id,
                            name,
                            partial: self.message.clone(),
                        }])
                    }
                }
            }
            "content_block_delta" => {
                let data: ContentBlockDelta = parse(&sse.data)?;
                let index = data.index as usize;
                match data.delta {
                    Delta::TextDelta { text } => {
                        if let Some(Content::Text { text: t }) = self.message.content.get_mut(index)
                        {
                            t.push_str(&text);
                        }
                        Ok(vec![StreamEvent::TextDelta {
                            content_index: index,
                            delta: text,
                            partial: self.message.clone(),
                        }])
                    }
                    Delta::ThinkingDelta { thinking } => {
                        if let Some(Content::Thinking { thinking: t, .. }) =
                            self.message.content.get_mut(index)
                        {
                            t.push_str(&thinking);
                        }
                        Ok(vec![StreamEvent::ThinkingDelta {
                            content_index: index,
                            delta: thinking,
                            partial: self.message.clone(),
                        }])
                    }
                    Delta::InputJsonDelta { partial_json } => {
                        self.tool_json.entry(index).or_default().push_str(&partial_json);
                        Ok(vec![StreamEvent::ToolCallDelta {
                            content_index: index,
                            delta: partial_json,
                            partial: self.message.clone(),
                        }])
                    }
                    Delta::SignatureDelta { signature } => {
                        if let Some(Content::Thinking { signature: s, .. }) =
                            self.message.content.get_mut(index)
                        {
                            *s = Some(signature);
                        }
                        Ok(vec![])
                    }
                }
            }
            "content_block_stop" => {
                let data: serde_json::Value = parse(&sse.data)?;
                let index = data["index"].as_u64().unwrap_or(0) as usize;
                let event = match self.message.content.get_mut(index) {
                    Some(Content::ToolCall { arguments, .. }) => {
                        if let Some(json) = self.tool_json.remove(&index) {
                            if let Ok(parsed) = serde_json::from_str(&json) {
                                *arguments = parsed;
                            }
                        }
                        Some(StreamEvent::ToolCallEnd {
                            content_index: index,
                            partial: self.message.clone(),
                        })
                    }
                    Some(Content::Thinking { .. }) => Some(StreamEvent::ThinkingEnd {
                        content_index: index,
                        partial: self.message.clone(),
                    }),
                    Some(Content::Text { .. }) => Some(StreamEvent::TextEnd {
                        content_index: index,
                        partial: self.message.clone(),
                    }),
                    _ => None,
                };
                Ok(event.into_iter().collect())
            }
            "message_delta" => {
                if let Ok(data) = serde_json::from_str::<MessageDelta>(&sse.data) {
                    self.message.stop_reason = match data.delta.stop_reason.as_deref() {
                        Some("tool_use") => StopReason::ToolUse,
                        Some("max_tokens") => StopReason::Length,
                        _ => StopReason::Stop,
                    };
                    self.message.usage.output = data.usage.output_tokens;
                }
                Ok(vec![])
            }
            "message_stop" => Ok(vec![self.finish()]),
            "ping" => Ok(vec![]),
            "error" => Err(classify_api_error(&sse.data)),
            other => {
                debug!("Unknown Anthropic event: {}", other);
                Ok(vec![])
            }
        }
    }

    fn set_block(&mut self, index: usize, block: Content) {
        while self.message.content.len() < index {
            self.message.content.push(Content::text(""));
        }
        if index < self.message.content.len() {
            self.message.content[index] = block;
        } else {
            self.message.content.push(block);
        }
    }

    fn finish(&mut self) -> StreamEvent {
        let has_tool_calls = self
            .message
            .content
            .iter()
            .any(|c| matches!(c, Content::ToolCall { .. }));
        if has_tool_calls && self.message.stop_reason == StopReason::Stop {
            self.message.stop_reason = StopReason::ToolUse;
        }
        self.message.usage.total_tokens = self.message.usage.input
            + self.message.usage.output
            + self.message.usage.cache_read
            + self.message.usage.cache_write;
        StreamEvent::Done {
            message: self.message.clone(),
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: &str) -> Result<T, ProviderError> {
    serde_json::from_str(data).map_err(|e| ProviderError::Api(format!("malformed event: {e}")))
}

fn classify_api_error(data: &str) -> ProviderError {
    #[derive(Deserialize)]
    struct ApiError {
        error: ApiErrorInner,
    }
    #[derive(Deserialize)]
    struct ApiErrorInner {
        #[serde(rename = "type")]
        kind: String,
        message: String,
    }

    match serde_json::from_str::<ApiError>(data) {
        Ok(e) => match e.error.kind.as_str() {
            "overloaded_error" | "rate_limit_error" => ProviderError::RateLimited {
                retry_after_ms: None,
            },
            "authentication_error" | "permission_error" => ProviderError::Auth(e.error.message),
            _ => ProviderError::Api(e.error.message),
        },
        Err(_) => ProviderError::Api(data.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Request construction
// ---------------------------------------------------------------------------

fn build_request_body(request: &StreamRequest) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::new();

    for msg in &request.messages {
        match msg {
            Message::User(user) => {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": content_to_anthropic(&user.content),
                }));
            }
            Message::Assistant(assistant) => {
                messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": content_to_anthropic(&assistant.content),
                }));
            }
            Message::ToolResult(result) => {
                let text = result
                    .content
                    .iter()
                    .filter_map(|c| match c {
                        Content::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");

                messages.push(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": result.tool_call_id,
                        "content": text,
                        "is_error": result.is_error,
                    }],
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": request.model,
        "max_tokens": request.max_tokens.unwrap_or(8192),
        "stream": true,
        "messages": messages,
    });

    if !request.system_prompt.is_empty() {
        body["system"] = serde_json::json!(request.system_prompt);
    }

    if !request.tools.is_empty() {
        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }

    if let Some(choice) = &request.tool_choice {
        body["tool_choice"] = match choice {
            ToolChoice::Auto => serde_json::json!({"type": "auto"}),
            ToolChoice::None => serde_json::json!({"type": "none"}),
            ToolChoice::Required => serde_json::json!({"type": "any"}),
            ToolChoice::Tool(name) => serde_json::json!({"type": "tool", "name": name}),
        };
    }

    if request.thinking_level != ThinkingLevel::Off {
        let budget = match request.thinking_level {
            ThinkingLevel::Minimal => 128,
            ThinkingLevel::Low => 512,
            ThinkingLevel::Medium => 2048,
            ThinkingLevel::High => 8192,
            ThinkingLevel::Off => 0,
        };
        body["thinking"] = serde_json::json!({
            "type": "enabled",
            "budget_tokens": budget,
        });
    }

    if let Some(temperature) = request.sampling.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(top_p) = request.sampling.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }
    if let Some(top_k) = request.sampling.top_k {
        body["top_k"] = serde_json::json!(top_k);
    }
    // min_p, presence_penalty, repetition_penalty: not supported by this API.

    if let Some(session_id) = &request.session_id {
        body["metadata"] = serde_json::json!({"user_id": session_id});
    }

    body
}

fn content_to_anthropic(content: &[Content]) -> Vec<serde_json::Value> {
    content
        .iter()
        .map(|c| match c {
            Content::Text { text } => serde_json::json!({"type": "text", "text": text}),
            Content::Image { data, mime_type } => serde_json::json!({
                "type": "image",
                "source": {"type": "base64", "media_type": mime_type, "data": data},
            }),
            Content::Thinking {
                thinking,
                signature,
            } => serde_json::json!({
                "type": "thinking",
                "thinking": thinking,
                "signature": signature.as_deref().unwrap_or(""),
            }),
            Content::ToolCall {
                id,
                name,
                arguments,
                ..
            } => serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": arguments,
            }),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Anthropic SSE event types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MessageStart {
    message: MessageInfo,
}

#[derive(Deserialize)]
struct MessageInfo {
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    index: u64,
    content_block: ContentBlock,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    index: u64,
    delta: Delta,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(rename = "signature_delta")]
    SignatureDelta { signature: String },
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}
