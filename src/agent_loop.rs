//! The core agent loop: prompt → LLM stream → tool execution → repeat.
//!
//! - [`agent_loop`] starts a run with new prompt messages
//! - [`agent_loop_continue`] resumes a run from existing history
//!
//! Both spawn the run onto the tokio runtime and return an
//! [`AgentEventStream`] immediately; the stream ends with the messages the
//! run produced. The [`Agent`](crate::agent::Agent) facade wraps these with
//! queue and lifecycle management.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::assembler::assemble_response;
use crate::event_stream::AgentEventStream;
use crate::provider::{
    SamplingParams, StreamProvider, StreamRequest, ToolChoice, ToolDefinition,
};
use crate::scheduler::{execute_tool_batch, InterruptMode, ToolBatchOptions};
use crate::types::*;
use crate::validation::{inject_intent_property, split_intent};

/// Type alias for convert_to_llm callback.
pub type ConvertToLlmFn = Arc<dyn Fn(&[AgentMessage]) -> Vec<Message> + Send + Sync>;
/// Type alias for transform_context callback. Must not mutate its input in
/// place — it receives a clone and returns the context to send.
pub type TransformContextFn = Arc<
    dyn Fn(Vec<AgentMessage>, CancellationToken) -> BoxFuture<'static, Vec<AgentMessage>>
        + Send
        + Sync,
>;
/// Type alias for steering/follow-up message sources. Should be quick; if a
/// source suspends, the run suspends with it.
pub type GetMessagesFn = Arc<dyn Fn() -> BoxFuture<'static, Vec<AgentMessage>> + Send + Sync>;
/// Type alias for per-call argument transformers (e.g. deobfuscation).
pub type TransformArgsFn =
    Arc<dyn Fn(&ToolCallInfo, serde_json::Value) -> serde_json::Value + Send + Sync>;
/// Type alias for the tool-context resolver, late-bound per call.
pub type ResolveContextFn = Arc<dyn Fn(&ToolCallInfo) -> ToolContext + Send + Sync>;
/// Type alias for dynamic tool-choice resolution, read at each turn.
pub type GetToolChoiceFn = Arc<dyn Fn() -> Option<ToolChoice> + Send + Sync>;

/// Settings the loop re-reads at every turn boundary, so setters on the
/// facade take effect mid-run without reconfiguring a batch in flight.
#[derive(Clone)]
pub struct AgentSettings {
    pub system_prompt: String,
    pub model: String,
    pub api_key: String,
    pub thinking_level: ThinkingLevel,
    pub max_tokens: Option<u32>,
    pub sampling: SamplingParams,
    pub tool_choice: Option<ToolChoice>,
    pub session_id: Option<String>,
    pub provider_session_state: Option<serde_json::Value>,
    pub max_retry_delay_ms: Option<u64>,
    pub tools: Vec<Arc<dyn AgentTool>>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model: String::new(),
            api_key: String::new(),
            thinking_level: ThinkingLevel::Off,
            max_tokens: None,
            sampling: SamplingParams::default(),
            tool_choice: None,
            session_id: None,
            provider_session_state: None,
            max_retry_delay_ms: None,
            tools: Vec::new(),
        }
    }
}

/// Configuration for the agent loop.
#[derive(Clone)]
pub struct AgentLoopConfig {
    pub provider: Arc<dyn StreamProvider>,
    pub settings: Arc<Mutex<AgentSettings>>,

    /// Steering polling cadence inside a tool batch.
    pub interrupt_mode: InterruptMode,
    /// Inject the reserved `_i` property into tool schemas and lift it onto
    /// each call's `intent`.
    pub intent_tracing: bool,

    /// Convert AgentMessage[] → Message[] before each LLM call.
    /// Default: keep only LLM-compatible messages.
    pub convert_to_llm: Option<ConvertToLlmFn>,
    /// Transform context before convert_to_llm (pruning, compaction).
    pub transform_context: Option<TransformContextFn>,
    /// Get steering messages (user interruptions mid-run).
    pub get_steering_messages: Option<GetMessagesFn>,
    /// Get follow-up messages (queued work after the agent would stop).
    pub get_follow_up_messages: Option<GetMessagesFn>,
    /// Dynamic tool choice, consulted before each LLM call.
    pub get_tool_choice: Option<GetToolChoiceFn>,
    /// Transform validated tool arguments before execution.
    pub transform_tool_args: Option<TransformArgsFn>,
    /// Resolve a per-call context value passed to each `execute`.
    pub resolve_tool_context: Option<ResolveContextFn>,
}

impl AgentLoopConfig {
    pub fn new(provider: Arc<dyn StreamProvider>, settings: AgentSettings) -> Self {
        Self {
            provider,
            settings: Arc::new(Mutex::new(settings)),
            interrupt_mode: InterruptMode::default(),
            intent_tracing: false,
            convert_to_llm: None,
            transform_context: None,
            get_steering_messages: None,
            get_follow_up_messages: None,
            get_tool_choice: None,
            transform_tool_args: None,
            resolve_tool_context: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentLoopError {
    #[error("Cannot continue: no messages in context")]
    EmptyHistory,
}

/// Default convert_to_llm: keep only user/assistant/toolResult messages.
fn default_convert_to_llm(messages: &[AgentMessage]) -> Vec<Message> {
    messages.iter().filter_map(|m| m.as_llm().cloned()).collect()
}

/// Start an agent loop with new prompt messages.
///
/// The prompts are appended to the history and announced on the stream
/// before the first LLM call.
pub fn agent_loop(
    prompts: Vec<AgentMessage>,
    mut messages: Vec<AgentMessage>,
    config: AgentLoopConfig,
    cancel: CancellationToken,
) -> AgentEventStream {
    let stream = AgentEventStream::new();

    let events = stream.clone();
    tokio::spawn(async move {
        let mut new_messages: Vec<AgentMessage> = prompts.clone();
        messages.extend(prompts.clone());

        events.push(AgentEvent::AgentStart);
        events.push(AgentEvent::TurnStart);
        for prompt in &prompts {
            events.push(AgentEvent::MessageStart {
                message: prompt.clone(),
            });
            events.push(AgentEvent::MessageEnd {
                message: prompt.clone(),
            });
        }

        run_loop(&mut messages, &mut new_messages, &config, &events, &cancel).await;

        events.push(AgentEvent::AgentEnd {
            messages: new_messages.clone(),
        });
        events.end(new_messages);
    });

    stream
}

/// Continue an agent loop from existing history without a new prompt (after
/// a transient error, or to consume queued steering/follow-up input).
///
/// The last history message must not be an assistant message unless queued
/// input will be injected — the facade checks that; this function only
/// rejects an empty history.
pub fn agent_loop_continue(
    mut messages: Vec<AgentMessage>,
    config: AgentLoopConfig,
    cancel: CancellationToken,
) -> Result<AgentEventStream, AgentLoopError> {
    if messages.is_empty() {
        return Err(AgentLoopError::EmptyHistory);
    }

    let stream = AgentEventStream::new();

    let events = stream.clone();
    tokio::spawn(async move {
        let mut new_messages: Vec<AgentMessage> = Vec::new();

        events.push(AgentEvent::AgentStart);
        events.push(AgentEvent::TurnStart);

        run_loop(&mut messages, &mut new_messages, &config, &events, &cancel).await;

        events.push(AgentEvent::AgentEnd {
            messages: new_messages.clone(),
        });
        events.end(new_messages);
    });

    Ok(stream)
}

/// Main loop logic shared by agent_loop and agent_loop_continue.
///
/// Outer loop: continues when follow-up messages arrive after the agent
/// would stop. Inner loop: one turn per iteration while tool calls remain
/// or pending messages exist.
async fn run_loop(
    history: &mut Vec<AgentMessage>,
    new_messages: &mut Vec<AgentMessage>,
    config: &AgentLoopConfig,
    events: &AgentEventStream,
    cancel: &CancellationToken,
) {
    let mut first_turn = true;

    // Check for steering messages queued before the run started.
    let mut pending: Vec<AgentMessage> = match &config.get_steering_messages {
        Some(get) => get().await,
        None => Vec::new(),
    };

    // A continued run whose history ends in an assistant message has nothing
    // for the model to answer; queued follow-up input fills that role.
    if pending.is_empty() && history.last().map(|m| m.role()) == Some("assistant") {
        if let Some(get) = &config.get_follow_up_messages {
            pending = get().await;
        }
    }

    // Outer loop: follow-ups after the agent would stop.
    loop {
        let mut has_more_tool_calls = true;
        let mut steering_after_tools: Option<Vec<AgentMessage>> = None;

        // Inner loop: runs at least once, then continues while there are
        // tool calls or pending messages.
        while has_more_tool_calls || !pending.is_empty() {
            if cancel.is_cancelled() {
                return;
            }

            if !first_turn {
                events.push(AgentEvent::TurnStart);
            } else {
                first_turn = false;
            }

            // Splice in pending steering / follow-up messages.
            for message in pending.drain(..) {
                events.push(AgentEvent::MessageStart {
                    message: message.clone(),
                });
                events.push(AgentEvent::MessageEnd {
                    message: message.clone(),
                });
                history.push(message.clone());
                new_messages.push(message);
            }

            // Settings snapshot: setters take effect here, at the turn
            // boundary, never mid-batch.
            let settings = config.settings.lock().unwrap().clone();

            let mut assistant =
                stream_assistant_response(history, &settings, config, events, cancel).await;

            if config.intent_tracing {
                lift_intents(&mut assistant);
                let len = history.len();
                history[len - 1] = assistant.clone().into();
            }
            new_messages.push(assistant.clone().into());

            // A failed or aborted stream ends the run, but only after
            // pairing any emitted tool calls with placeholder results.
            if assistant.stop_reason == StopReason::Error
                || assistant.stop_reason == StopReason::Aborted
            {
                let placeholders = synthesize_tool_results(&assistant, events);
                for result in &placeholders {
                    history.push(result.clone().into());
                    new_messages.push(result.clone().into());
                }
                events.push(AgentEvent::TurnEnd {
                    message: assistant.into(),
                    tool_results: placeholders,
                });
                return;
            }

            let tool_calls = assistant.tool_calls();
            has_more_tool_calls = !tool_calls.is_empty();

            let mut tool_results: Vec<ToolResultMessage> = Vec::new();
            if has_more_tool_calls {
                let options = ToolBatchOptions {
                    interrupt_mode: config.interrupt_mode,
                    get_steering_messages: config.get_steering_messages.clone(),
                    transform_tool_args: config.transform_tool_args.clone(),
                    resolve_tool_context: config.resolve_tool_context.clone(),
                };
                let outcome =
                    execute_tool_batch(&settings.tools, &tool_calls, events, cancel, &options)
                        .await;
                tool_results = outcome.tool_results;
                steering_after_tools = outcome.steering_messages;

                for result in &tool_results {
                    history.push(result.clone().into());
                    new_messages.push(result.clone().into());
                }
            }

            events.push(AgentEvent::TurnEnd {
                message: assistant.into(),
                tool_results,
            });

            // Steering that interrupted the batch feeds the next turn.
            if let Some(steering) = steering_after_tools.take() {
                if !steering.is_empty() {
                    pending = steering;
                    continue;
                }
            }

            pending = match &config.get_steering_messages {
                Some(get) => get().await,
                None => Vec::new(),
            };
        }

        // The agent would stop here. Check for follow-ups.
        let follow_ups = match &config.get_follow_up_messages {
            Some(get) => get().await,
            None => Vec::new(),
        };

        if !follow_ups.is_empty() {
            pending = follow_ups;
            continue;
        }

        break;
    }
}

/// Stream one assistant response, appending it to history via the assembler.
async fn stream_assistant_response(
    history: &mut Vec<AgentMessage>,
    settings: &AgentSettings,
    config: &AgentLoopConfig,
    events: &AgentEventStream,
    cancel: &CancellationToken,
) -> AssistantMessage {
    // Apply the context transform (never in place).
    let context = match &config.transform_context {
        Some(transform) => transform(history.clone(), cancel.clone()).await,
        None => history.clone(),
    };

    let llm_messages = match &config.convert_to_llm {
        Some(convert) => convert(&context),
        None => default_convert_to_llm(&context),
    };

    let tool_definitions: Vec<ToolDefinition> = settings
        .tools
        .iter()
        .map(|t| {
            let parameters = if config.intent_tracing {
                inject_intent_property(&t.parameters_schema())
            } else {
                t.parameters_schema()
            };
            ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters,
            }
        })
        .collect();

    let tool_choice = match &config.get_tool_choice {
        Some(get) => get(),
        None => settings.tool_choice.clone(),
    };

    let request = StreamRequest {
        model: settings.model.clone(),
        system_prompt: settings.system_prompt.clone(),
        messages: llm_messages,
        tools: tool_definitions,
        tool_choice,
        thinking_level: settings.thinking_level,
        api_key: settings.api_key.clone(),
        max_tokens: settings.max_tokens,
        sampling: settings.sampling.clone(),
        session_id: settings.session_id.clone(),
        provider_session_state: settings.provider_session_state.clone(),
        max_retry_delay_ms: settings.max_retry_delay_ms,
    };

    let provider = config.provider.clone();
    match provider.stream(request, cancel.child_token()).await {
        Ok(rx) => {
            assemble_response(rx, history, events, cancel, &settings.model, provider.name())
                .await
        }
        Err(e) => {
            warn!("provider refused to stream: {e}");
            let message =
                AssistantMessage::errored(&settings.model, provider.name(), e.to_string());
            history.push(message.clone().into());
            events.push(AgentEvent::MessageStart {
                message: message.clone().into(),
            });
            events.push(AgentEvent::MessageEnd {
                message: message.clone().into(),
            });
            message
        }
    }
}

/// Move each tool call's `_i` argument onto its `intent` field.
fn lift_intents(message: &mut AssistantMessage) {
    for content in &mut message.content {
        if let Content::ToolCall {
            arguments, intent, ..
        } = content
        {
            let (cleaned, lifted) = split_intent(arguments.take());
            *arguments = cleaned;
            if intent.is_none() {
                *intent = lifted;
            }
        }
    }
}

/// Placeholder tool results for an errored or aborted turn, keeping every
/// emitted tool call paired with a result.
fn synthesize_tool_results(
    assistant: &AssistantMessage,
    events: &AgentEventStream,
) -> Vec<ToolResultMessage> {
    let text = match assistant.stop_reason {
        StopReason::Error => format!(
            "Tool execution failed due to an error: {}",
            assistant
                .error_message
                .as_deref()
                .unwrap_or("unknown error")
        ),
        _ => "Tool execution was aborted.".to_string(),
    };

    assistant
        .tool_calls()
        .into_iter()
        .map(|call| {
            let result = ToolResultMessage {
                tool_call_id: call.id,
                tool_name: call.name,
                content: vec![Content::text(text.clone())],
                details: None,
                is_error: true,
                timestamp: now_ms(),
            };
            events.push(AgentEvent::MessageStart {
                message: result.clone().into(),
            });
            events.push(AgentEvent::MessageEnd {
                message: result.clone().into(),
            });
            result
        })
        .collect()
}
