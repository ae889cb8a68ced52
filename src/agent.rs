//! Stateful Agent — wraps the agent loop with history, steering/follow-up
//! queues, listeners, and abort support.
//!
//! The agent owns all mutable state behind an `Arc`, so a run spawned by
//! `prompt` keeps going while the caller steers, aborts, or reconfigures it.
//! There is no process-wide state: any number of agents coexist.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::{
    agent_loop, agent_loop_continue, AgentLoopConfig, AgentSettings, ConvertToLlmFn,
    GetMessagesFn, GetToolChoiceFn, ResolveContextFn, TransformArgsFn, TransformContextFn,
};
use crate::event_stream::AgentEventStream;
use crate::provider::{SamplingParams, StreamProvider, ToolChoice};
use crate::scheduler::InterruptMode;
use crate::types::*;

/// Queue mode for steering and follow-up messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Deliver one message per drain
    OneAtATime,
    /// Deliver all queued messages at once
    All,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent is already streaming. Use steer() or follow_up().")]
    Busy,
    #[error("Cannot continue: no messages in history")]
    EmptyHistory,
    #[error("Cannot continue from an assistant message with no queued input")]
    NothingToContinue,
}

type ListenerFn = Arc<dyn Fn(&AgentEvent) + Send + Sync>;
type ListenerRegistry = Mutex<Vec<(u64, ListenerFn)>>;

struct AgentInner {
    provider: Arc<dyn StreamProvider>,
    settings: Arc<Mutex<AgentSettings>>,
    messages: Mutex<Vec<AgentMessage>>,

    steering_queue: Mutex<VecDeque<AgentMessage>>,
    follow_up_queue: Mutex<VecDeque<AgentMessage>>,
    steering_mode: Mutex<QueueMode>,
    follow_up_mode: Mutex<QueueMode>,
    interrupt_mode: Mutex<InterruptMode>,
    intent_tracing: AtomicBool,

    listeners: Arc<ListenerRegistry>,
    next_listener_id: AtomicU64,

    cancel: Mutex<Option<CancellationToken>>,
    is_streaming: AtomicBool,

    convert_to_llm: Mutex<Option<ConvertToLlmFn>>,
    transform_context: Mutex<Option<TransformContextFn>>,
    get_tool_choice: Mutex<Option<GetToolChoiceFn>>,
    transform_tool_args: Mutex<Option<TransformArgsFn>>,
    resolve_tool_context: Mutex<Option<ResolveContextFn>>,
}

/// The main Agent. Owns state, tools, and provider.
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(provider: impl StreamProvider + 'static) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                provider: Arc::new(provider),
                settings: Arc::new(Mutex::new(AgentSettings::default())),
                messages: Mutex::new(Vec::new()),
                steering_queue: Mutex::new(VecDeque::new()),
                follow_up_queue: Mutex::new(VecDeque::new()),
                steering_mode: Mutex::new(QueueMode::OneAtATime),
                follow_up_mode: Mutex::new(QueueMode::OneAtATime),
                interrupt_mode: Mutex::new(InterruptMode::Immediate),
                intent_tracing: AtomicBool::new(false),
                listeners: Arc::new(Mutex::new(Vec::new())),
                next_listener_id: AtomicU64::new(0),
                cancel: Mutex::new(None),
                is_streaming: AtomicBool::new(false),
                convert_to_llm: Mutex::new(None),
                transform_context: Mutex::new(None),
                get_tool_choice: Mutex::new(None),
                transform_tool_args: Mutex::new(None),
                resolve_tool_context: Mutex::new(None),
            }),
        }
    }

    // -- Builder-style setters --

    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Self {
        self.set_system_prompt(prompt);
        self
    }

    pub fn with_model(self, model: impl Into<String>) -> Self {
        self.set_model(model);
        self
    }

    pub fn with_api_key(self, key: impl Into<String>) -> Self {
        self.inner.settings.lock().unwrap().api_key = key.into();
        self
    }

    pub fn with_thinking(self, level: ThinkingLevel) -> Self {
        self.set_thinking_level(level);
        self
    }

    pub fn with_tools(self, tools: Vec<Arc<dyn AgentTool>>) -> Self {
        self.set_tools(tools);
        self
    }

    pub fn with_max_tokens(self, max: u32) -> Self {
        self.inner.settings.lock().unwrap().max_tokens = Some(max);
        self
    }

    pub fn with_sampling(self, sampling: SamplingParams) -> Self {
        self.set_sampling(sampling);
        self
    }

    pub fn with_intent_tracing(self, enabled: bool) -> Self {
        self.set_intent_tracing(enabled);
        self
    }

    pub fn with_interrupt_mode(self, mode: InterruptMode) -> Self {
        self.set_interrupt_mode(mode);
        self
    }

    pub fn with_messages(self, messages: Vec<AgentMessage>) -> Self {
        *self.inner.messages.lock().unwrap() = messages;
        self
    }

    pub fn with_convert_to_llm(
        self,
        f: impl Fn(&[AgentMessage]) -> Vec<Message> + Send + Sync + 'static,
    ) -> Self {
        *self.inner.convert_to_llm.lock().unwrap() = Some(Arc::new(f));
        self
    }

    pub fn with_transform_context(
        self,
        f: impl Fn(Vec<AgentMessage>, CancellationToken) -> futures::future::BoxFuture<'static, Vec<AgentMessage>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        *self.inner.transform_context.lock().unwrap() = Some(Arc::new(f));
        self
    }

    pub fn with_tool_choice_fn(
        self,
        f: impl Fn() -> Option<ToolChoice> + Send + Sync + 'static,
    ) -> Self {
        *self.inner.get_tool_choice.lock().unwrap() = Some(Arc::new(f));
        self
    }

    pub fn with_transform_tool_args(
        self,
        f: impl Fn(&ToolCallInfo, serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        *self.inner.transform_tool_args.lock().unwrap() = Some(Arc::new(f));
        self
    }

    pub fn with_tool_context_resolver(
        self,
        f: impl Fn(&ToolCallInfo) -> ToolContext + Send + Sync + 'static,
    ) -> Self {
        *self.inner.resolve_tool_context.lock().unwrap() = Some(Arc::new(f));
        self
    }

    // -- Setters (take effect at the next turn boundary while streaming) --

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.inner.settings.lock().unwrap().system_prompt = prompt.into();
    }

    pub fn set_model(&self, model: impl Into<String>) {
        self.inner.settings.lock().unwrap().model = model.into();
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        self.inner.settings.lock().unwrap().thinking_level = level;
    }

    pub fn set_tools(&self, tools: Vec<Arc<dyn AgentTool>>) {
        self.inner.settings.lock().unwrap().tools = tools;
    }

    pub fn set_sampling(&self, sampling: SamplingParams) {
        self.inner.settings.lock().unwrap().sampling = sampling;
    }

    pub fn set_tool_choice(&self, choice: Option<ToolChoice>) {
        self.inner.settings.lock().unwrap().tool_choice = choice;
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        self.inner.settings.lock().unwrap().session_id = session_id;
    }

    pub fn set_provider_session_state(&self, state: Option<serde_json::Value>) {
        self.inner.settings.lock().unwrap().provider_session_state = state;
    }

    pub fn set_max_retry_delay_ms(&self, delay: Option<u64>) {
        self.inner.settings.lock().unwrap().max_retry_delay_ms = delay;
    }

    pub fn set_steering_mode(&self, mode: QueueMode) {
        *self.inner.steering_mode.lock().unwrap() = mode;
    }

    pub fn set_follow_up_mode(&self, mode: QueueMode) {
        *self.inner.follow_up_mode.lock().unwrap() = mode;
    }

    pub fn set_interrupt_mode(&self, mode: InterruptMode) {
        *self.inner.interrupt_mode.lock().unwrap() = mode;
    }

    pub fn set_intent_tracing(&self, enabled: bool) {
        self.inner.intent_tracing.store(enabled, Ordering::SeqCst);
    }

    // -- State access --

    pub fn messages(&self) -> Vec<AgentMessage> {
        self.inner.messages.lock().unwrap().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.is_streaming.load(Ordering::SeqCst)
    }

    pub fn clear_messages(&self) {
        self.inner.messages.lock().unwrap().clear();
    }

    pub fn append_message(&self, msg: AgentMessage) {
        self.inner.messages.lock().unwrap().push(msg);
    }

    pub fn replace_messages(&self, msgs: Vec<AgentMessage>) {
        *self.inner.messages.lock().unwrap() = msgs;
    }

    pub fn save_messages(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&*self.inner.messages.lock().unwrap())
    }

    pub fn restore_messages(&self, json: &str) -> Result<(), serde_json::Error> {
        let msgs: Vec<AgentMessage> = serde_json::from_str(json)?;
        *self.inner.messages.lock().unwrap() = msgs;
        Ok(())
    }

    // -- Queue management --

    /// Queue a steering message (interrupts the agent mid-tool-batch).
    pub fn steer(&self, msg: AgentMessage) {
        self.inner.steering_queue.lock().unwrap().push_back(msg);
    }

    /// Queue a follow-up message (processed after the agent would stop).
    pub fn follow_up(&self, msg: AgentMessage) {
        self.inner.follow_up_queue.lock().unwrap().push_back(msg);
    }

    pub fn clear_steering_queue(&self) {
        self.inner.steering_queue.lock().unwrap().clear();
    }

    pub fn clear_follow_up_queue(&self) {
        self.inner.follow_up_queue.lock().unwrap().clear();
    }

    pub fn clear_all_queues(&self) {
        self.clear_steering_queue();
        self.clear_follow_up_queue();
    }

    fn queued_input_available(&self) -> bool {
        !self.inner.steering_queue.lock().unwrap().is_empty()
            || !self.inner.follow_up_queue.lock().unwrap().is_empty()
    }

    // -- Listeners --

    /// Register an event listener invoked for every event of every run.
    pub fn subscribe(
        &self,
        f: impl Fn(&AgentEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(f)));
        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.inner.listeners),
        }
    }

    /// Re-inject an externally produced event (e.g. replayed over the wire)
    /// into this agent's listeners, as if a local run had emitted it.
    pub fn emit_external_event(&self, event: AgentEvent) {
        for (_, listener) in self.inner.listeners.lock().unwrap().iter() {
            listener(&event);
        }
    }

    // -- Control --

    /// Signal the current run's cancel token. Idempotent; a no-op when idle.
    pub fn abort(&self) {
        if let Some(cancel) = self.inner.cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
    }

    pub fn reset(&self) {
        self.clear_messages();
        self.clear_all_queues();
    }

    // -- Prompting --

    /// Send a text prompt. Returns the run's event stream.
    pub fn prompt(&self, text: impl Into<String>) -> Result<AgentEventStream, AgentError> {
        self.prompt_messages(vec![Message::user(text).into()])
    }

    /// Send a text prompt with attached base64 images.
    pub fn prompt_with_images(
        &self,
        text: impl Into<String>,
        images: Vec<(String, String)>,
    ) -> Result<AgentEventStream, AgentError> {
        self.prompt_messages(vec![Message::user_with_images(text, images).into()])
    }

    /// Send messages as a prompt. Fails with [`AgentError::Busy`] while a
    /// run is already streaming.
    pub fn prompt_messages(
        &self,
        messages: Vec<AgentMessage>,
    ) -> Result<AgentEventStream, AgentError> {
        if self.inner.is_streaming.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Busy);
        }

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().unwrap() = Some(cancel.clone());

        let history = self.inner.messages.lock().unwrap().clone();
        let stream = agent_loop(messages, history, self.build_config(), cancel);
        self.attach_run(&stream);
        Ok(stream)
    }

    /// Restart the loop against the current history — after a transient
    /// error, or to consume steering/follow-up input queued while idle.
    pub fn continue_run(&self) -> Result<AgentEventStream, AgentError> {
        if self.inner.is_streaming.swap(true, Ordering::SeqCst) {
            return Err(AgentError::Busy);
        }

        let history = self.inner.messages.lock().unwrap().clone();
        let release = |err| {
            self.inner.is_streaming.store(false, Ordering::SeqCst);
            Err(err)
        };
        if history.is_empty() {
            return release(AgentError::EmptyHistory);
        }
        if history.last().map(|m| m.role()) == Some("assistant")
            && !self.queued_input_available()
        {
            return release(AgentError::NothingToContinue);
        }

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().unwrap() = Some(cancel.clone());

        let stream = match agent_loop_continue(history, self.build_config(), cancel) {
            Ok(stream) => stream,
            Err(_) => return release(AgentError::EmptyHistory),
        };
        self.attach_run(&stream);
        Ok(stream)
    }

    // -- Internal --

    /// Forward run events to listeners and reconcile state when it ends.
    fn attach_run(&self, stream: &AgentEventStream) {
        let listeners = self.inner.listeners.clone();
        stream.on_event(move |event| {
            for (_, listener) in listeners.lock().unwrap().iter() {
                listener(event);
            }
        });

        let inner = self.inner.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            let new_messages = stream.result().await;
            inner.messages.lock().unwrap().extend(new_messages);
            *inner.cancel.lock().unwrap() = None;
            inner.is_streaming.store(false, Ordering::SeqCst);
        });
    }

    fn build_config(&self) -> AgentLoopConfig {
        let steering: GetMessagesFn = {
            let inner = self.inner.clone();
            Arc::new(move || {
                let drained = drain_queue(
                    &inner.steering_queue,
                    *inner.steering_mode.lock().unwrap(),
                );
                futures::future::ready(drained).boxed()
            })
        };
        let follow_up: GetMessagesFn = {
            let inner = self.inner.clone();
            Arc::new(move || {
                let drained = drain_queue(
                    &inner.follow_up_queue,
                    *inner.follow_up_mode.lock().unwrap(),
                );
                futures::future::ready(drained).boxed()
            })
        };

        AgentLoopConfig {
            provider: self.inner.provider.clone(),
            settings: self.inner.settings.clone(),
            interrupt_mode: *self.inner.interrupt_mode.lock().unwrap(),
            intent_tracing: self.inner.intent_tracing.load(Ordering::SeqCst),
            convert_to_llm: self.inner.convert_to_llm.lock().unwrap().clone(),
            transform_context: self.inner.transform_context.lock().unwrap().clone(),
            get_steering_messages: Some(steering),
            get_follow_up_messages: Some(follow_up),
            get_tool_choice: self.inner.get_tool_choice.lock().unwrap().clone(),
            transform_tool_args: self.inner.transform_tool_args.lock().unwrap().clone(),
            resolve_tool_context: self.inner.resolve_tool_context.lock().unwrap().clone(),
        }
    }
}

/// Atomic snapshot drain: concurrent pushes either make this drain or the
/// next one, never a torn one.
fn drain_queue(
    queue: &Mutex<VecDeque<AgentMessage>>,
    mode: QueueMode,
) -> Vec<AgentMessage> {
    let mut queue = queue.lock().unwrap();
    match mode {
        QueueMode::OneAtATime => queue.pop_front().into_iter().collect(),
        QueueMode::All => queue.drain(..).collect(),
    }
}

/// Handle returned by [`Agent::subscribe`]; detaches the listener.
pub struct ListenerHandle {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}
