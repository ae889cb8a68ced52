//! Concurrent tool execution for one batch of tool calls.
//!
//! Tools run as spawned subtasks under a shared/exclusive discipline: shared
//! tools in a contiguous group overlap, an exclusive tool is a barrier. A
//! steering message arriving mid-batch interrupts it: in-flight tools are
//! cancelled, not-yet-started tools never start, and every call still gets a
//! tool result so the tool-use/tool-result pairing survives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent_loop::{GetMessagesFn, ResolveContextFn, TransformArgsFn};
use crate::event_stream::AgentEventStream;
use crate::types::*;
use crate::validation::validate_tool_arguments;

pub const SKIPPED_TEXT: &str = "Skipped due to queued user message.";

/// When the scheduler polls the steering source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMode {
    /// Poll after every tool completion; steering interrupts the batch.
    #[default]
    Immediate,
    /// Never poll mid-batch; steering is picked up at the turn boundary.
    Wait,
}

/// What `execute_tool_batch` hands back to the turn loop.
pub struct ToolBatchOutcome {
    /// One result per call, in the calls' declaration order.
    pub tool_results: Vec<ToolResultMessage>,
    /// Steering messages that interrupted the batch, to splice into the
    /// next turn.
    pub steering_messages: Option<Vec<AgentMessage>>,
}

pub struct ToolBatchOptions {
    pub interrupt_mode: InterruptMode,
    pub get_steering_messages: Option<GetMessagesFn>,
    pub transform_tool_args: Option<TransformArgsFn>,
    pub resolve_tool_context: Option<ResolveContextFn>,
}

impl Default for ToolBatchOptions {
    fn default() -> Self {
        Self {
            interrupt_mode: InterruptMode::Immediate,
            get_steering_messages: None,
            transform_tool_args: None,
            resolve_tool_context: None,
        }
    }
}

/// A completion handle another task can await, any number of times.
type Gate = Shared<BoxFuture<'static, ()>>;

fn open_gate() -> Gate {
    future::ready(()).boxed().shared()
}

enum TaskOutcome {
    /// Ran to completion before any interrupt; start/end events emitted.
    Done { output: ToolOutput, is_error: bool },
    /// Never ran, or its result was discarded because the interrupt fired
    /// first. `started` says whether a start event was emitted.
    Skipped { started: bool },
}

/// Execute every tool call of one assistant message and materialize one
/// `ToolResultMessage` per call.
pub async fn execute_tool_batch(
    tools: &[Arc<dyn AgentTool>],
    calls: &[ToolCallInfo],
    events: &AgentEventStream,
    run_cancel: &CancellationToken,
    options: &ToolBatchOptions,
) -> ToolBatchOutcome {
    let interrupt = Arc::new(AtomicBool::new(false));
    // Child of the run token: fires on run abort or steering interrupt.
    let batch_cancel = run_cancel.child_token();

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<(usize, TaskOutcome)>();

    // Wire up the shared/exclusive gates and spawn one task per call.
    let mut last_exclusive = open_gate();
    let mut shared_in_flight: Vec<Gate> = Vec::new();

    for (index, call) in calls.iter().enumerate() {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done_gate: Gate = done_rx.map(|_| ()).boxed().shared();

        let tool = tools.iter().find(|t| t.name() == call.name).cloned();
        let concurrency = tool
            .as_ref()
            .map(|t| t.concurrency())
            .unwrap_or_default();

        let entry_gate: Gate = match concurrency {
            ToolConcurrency::Shared => {
                shared_in_flight.push(done_gate.clone());
                last_exclusive.clone()
            }
            ToolConcurrency::Exclusive => {
                let mut waits = vec![last_exclusive.clone()];
                waits.append(&mut shared_in_flight);
                last_exclusive = done_gate.clone();
                future::join_all(waits).map(|_| ()).boxed().shared()
            }
        };

        tokio::spawn(run_tool_task(
            index,
            call.clone(),
            tool,
            entry_gate,
            done_tx,
            outcome_tx.clone(),
            events.clone(),
            interrupt.clone(),
            batch_cancel.clone(),
            options.transform_tool_args.clone(),
            options.resolve_tool_context.clone(),
        ));
    }
    drop(outcome_tx);

    // Collect completions; in Immediate mode poll steering after each one.
    let mut outcomes: Vec<Option<TaskOutcome>> = calls.iter().map(|_| None).collect();
    let mut steering_messages: Option<Vec<AgentMessage>> = None;

    while let Some((index, outcome)) = outcome_rx.recv().await {
        outcomes[index] = Some(outcome);

        if steering_messages.is_none() && options.interrupt_mode == InterruptMode::Immediate {
            if let Some(get_steering) = &options.get_steering_messages {
                let messages = get_steering().await;
                if !messages.is_empty() {
                    debug!("steering arrived, interrupting tool batch");
                    interrupt.store(true, Ordering::SeqCst);
                    batch_cancel.cancel();
                    steering_messages = Some(messages);
                }
            }
        }
    }

    // Materialize results in declaration order: remaining end events first,
    // then the tool-result message events.
    let mut tool_results: Vec<ToolResultMessage> = Vec::with_capacity(calls.len());
    for (index, call) in calls.iter().enumerate() {
        let outcome = outcomes[index]
            .take()
            .unwrap_or(TaskOutcome::Skipped { started: false });

        let (output, is_error) = match outcome {
            TaskOutcome::Done { output, is_error } => (output, is_error),
            TaskOutcome::Skipped { started } => {
                let placeholder = ToolOutput::text(SKIPPED_TEXT);
                if !started {
                    events.push(AgentEvent::ToolExecutionStart {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        args: call.arguments.clone(),
                        intent: call.intent.clone(),
                    });
                }
                events.push(AgentEvent::ToolExecutionEnd {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    result: placeholder.clone(),
                    is_error: true,
                });
                (placeholder, true)
            }
        };

        tool_results.push(ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: output.content,
            details: output.details,
            is_error,
            timestamp: now_ms(),
        });
    }

    for result in &tool_results {
        events.push(AgentEvent::MessageStart {
            message: result.clone().into(),
        });
        events.push(AgentEvent::MessageEnd {
            message: result.clone().into(),
        });
    }

    ToolBatchOutcome {
        tool_results,
        steering_messages,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_tool_task(
    index: usize,
    call: ToolCallInfo,
    tool: Option<Arc<dyn AgentTool>>,
    entry_gate: Gate,
    done_tx: oneshot::Sender<()>,
    outcome_tx: mpsc::UnboundedSender<(usize, TaskOutcome)>,
    events: AgentEventStream,
    interrupt: Arc<AtomicBool>,
    batch_cancel: CancellationToken,
    transform_args: Option<TransformArgsFn>,
    resolve_context: Option<ResolveContextFn>,
) {
    entry_gate.await;

    if interrupt.load(Ordering::SeqCst) {
        let _ = done_tx.send(());
        let _ = outcome_tx.send((index, TaskOutcome::Skipped { started: false }));
        return;
    }

    events.push(AgentEvent::ToolExecutionStart {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        args: call.arguments.clone(),
        intent: call.intent.clone(),
    });

    let (output, is_error) = run_tool(
        &call,
        tool,
        &events,
        &interrupt,
        &batch_cancel,
        transform_args,
        resolve_context,
    )
    .await;

    let outcome = if interrupt.load(Ordering::SeqCst) {
        // Interrupt fired while this tool ran: discard the result. The end
        // event comes later, with the skipped placeholder.
        TaskOutcome::Skipped { started: true }
    } else {
        events.push(AgentEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: output.clone(),
            is_error,
        });
        TaskOutcome::Done { output, is_error }
    };

    // Release dependents only after this tool's end event is out, so no
    // later start can precede it in the stream.
    let _ = done_tx.send(());
    let _ = outcome_tx.send((index, outcome));
}

async fn run_tool(
    call: &ToolCallInfo,
    tool: Option<Arc<dyn AgentTool>>,
    events: &AgentEventStream,
    interrupt: &Arc<AtomicBool>,
    batch_cancel: &CancellationToken,
    transform_args: Option<TransformArgsFn>,
    resolve_context: Option<ResolveContextFn>,
) -> (ToolOutput, bool) {
    let Some(tool) = tool else {
        return (
            ToolOutput::text(format!("Tool {} not found", call.name)),
            true,
        );
    };

    let mut args = call.arguments.clone();

    if let Err(message) = validate_tool_arguments(&tool.parameters_schema(), &args) {
        if tool.lenient_arg_validation() {
            debug!(tool = %call.name, "lenient validation, passing raw args: {message}");
        } else {
            return (
                ToolOutput::text(ToolError::InvalidArgs(message).to_string()),
                true,
            );
        }
    }

    if let Some(transform) = transform_args {
        args = transform(call, args);
    }

    let context = resolve_context.map(|resolve| resolve(call));

    // Non-abortable tools get a token that never fires.
    let cancel = if tool.non_abortable() {
        CancellationToken::new()
    } else {
        batch_cancel.child_token()
    };

    let on_progress: ProgressFn = {
        let events = events.clone();
        let interrupt = interrupt.clone();
        let tool_call_id = call.id.clone();
        let tool_name = call.name.clone();
        Arc::new(move |partial: ToolOutput| {
            if interrupt.load(Ordering::SeqCst) {
                return;
            }
            events.push(AgentEvent::ToolExecutionUpdate {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                partial,
            });
        })
    };

    match tool
        .execute(&call.id, args, cancel, Some(on_progress), context)
        .await
    {
        Ok(output) => (output, false),
        Err(e) => {
            warn!(tool = %call.name, "tool failed: {e}");
            (ToolOutput::text(e.to_string()), true)
        }
    }
}
