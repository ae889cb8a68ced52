use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events emitted during LLM streaming.
///
/// Every incremental event carries the full up-to-date partial assistant
/// message, so consumers never have to re-assemble content themselves.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Stream started with an (usually empty) partial assistant message.
    Start { partial: AssistantMessage },
    TextStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    TextDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    TextEnd {
        content_index: usize,
        partial: AssistantMessage,
    },
    ThinkingStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    ThinkingDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ThinkingEnd {
        content_index: usize,
        partial: AssistantMessage,
    },
    ToolCallStart {
        content_index: usize,
        id: String,
        name: String,
        partial: AssistantMessage,
    },
    ToolCallDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    ToolCallEnd {
        content_index: usize,
        partial: AssistantMessage,
    },
    /// Stream completed; `message` is the final assembled assistant message.
    Done { message: AssistantMessage },
    /// Stream failed; `message` has `stop_reason = Error` and the error text.
    Error {
        error: String,
        message: AssistantMessage,
    },
}

impl StreamEvent {
    /// The partial (or final) assistant message this event describes.
    pub fn partial(&self) -> &AssistantMessage {
        match self {
            Self::Start { partial }
            | Self::TextStart { partial, .. }
            | Self::TextDelta { partial, .. }
            | Self::TextEnd { partial, .. }
            | Self::ThinkingStart { partial, .. }
            | Self::ThinkingDelta { partial, .. }
            | Self::ThinkingEnd { partial, .. }
            | Self::ToolCallStart { partial, .. }
            | Self::ToolCallDelta { partial, .. }
            | Self::ToolCallEnd { partial, .. } => partial,
            Self::Done { message } => message,
            Self::Error { message, .. } => message,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// Sampling knobs passed through to the provider. Providers ignore the ones
/// their API does not support.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub min_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub repetition_penalty: Option<f32>,
}

/// Constrains which tool (if any) the model must call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

/// Tool definition sent to the LLM (schema only, no execute fn)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One streaming LLM call.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub thinking_level: ThinkingLevel,
    pub api_key: String,
    pub max_tokens: Option<u32>,
    pub sampling: SamplingParams,
    /// Opaque session identifier for provider-side caching.
    pub session_id: Option<String>,
    /// Opaque provider session state, passed back verbatim.
    pub provider_session_state: Option<serde_json::Value>,
    /// Upper bound on server-requested retry delays.
    pub max_retry_delay_ms: Option<u64>,
}

/// The core transport trait. Implement this for each LLM backend.
///
/// `stream` returns a receiver of [`StreamEvent`]s and MUST terminate the
/// sequence with `Done` or `Error` carrying the final assembled message.
/// Provider-specific history normalization (e.g. dropping thinking blocks)
/// happens here, on the way out, never in the agent's in-memory history.
#[async_trait]
pub trait StreamProvider: Send + Sync {
    /// Provider identity recorded on assistant messages.
    fn name(&self) -> &str;

    /// Start a streaming completion.
    async fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error: {0}")]
    Api(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("Cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}
