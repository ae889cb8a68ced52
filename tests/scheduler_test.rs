//! Tests for the shared/exclusive tool scheduler.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tiller::agent_loop::GetMessagesFn;
use tiller::event_stream::AgentEventStream;
use tiller::scheduler::{execute_tool_batch, InterruptMode, ToolBatchOptions, SKIPPED_TEXT};
use tiller::*;

type ExecutionLog = Arc<Mutex<Vec<(String, &'static str, Instant)>>>;

/// A scriptable tool: sleeps for `duration`, logs start/end, honors
/// cancellation unless non-abortable.
struct TestTool {
    name: String,
    concurrency: ToolConcurrency,
    duration: Duration,
    non_abortable: bool,
    lenient: bool,
    fail: bool,
    progress_updates: usize,
    late_progress: usize,
    log: ExecutionLog,
    on_complete: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl TestTool {
    fn new(name: &str, log: &ExecutionLog) -> Self {
        Self {
            name: name.into(),
            concurrency: ToolConcurrency::Shared,
            duration: Duration::from_millis(10),
            non_abortable: false,
            lenient: false,
            fail: false,
            progress_updates: 0,
            late_progress: 0,
            log: log.clone(),
            on_complete: None,
        }
    }

    fn exclusive(mut self) -> Self {
        self.concurrency = ToolConcurrency::Exclusive;
        self
    }

    fn lasting(mut self, ms: u64) -> Self {
        self.duration = Duration::from_millis(ms);
        self
    }

    fn non_abortable(mut self) -> Self {
        self.non_abortable = true;
        self
    }

    fn lenient(mut self) -> Self {
        self.lenient = true;
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn with_progress(mut self, updates: usize) -> Self {
        self.progress_updates = updates;
        self
    }

    /// Emit progress after the sleep, i.e. after an interrupt had a chance
    /// to fire.
    fn with_late_progress(mut self, updates: usize) -> Self {
        self.late_progress = updates;
        self
    }

    fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }
}

#[async_trait::async_trait]
impl AgentTool for TestTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn label(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"x": {"type": "number"}}
        })
    }
    fn concurrency(&self) -> ToolConcurrency {
        self.concurrency
    }
    fn non_abortable(&self) -> bool {
        self.non_abortable
    }
    fn lenient_arg_validation(&self) -> bool {
        self.lenient
    }
    async fn execute(
        &self,
        _id: &str,
        _args: serde_json::Value,
        cancel: CancellationToken,
        on_progress: Option<ProgressFn>,
        _context: Option<ToolContext>,
    ) -> Result<ToolOutput, ToolError> {
        self.log
            .lock()
            .unwrap()
            .push((self.name.clone(), "start", Instant::now()));

        if let Some(on_progress) = &on_progress {
            for i in 0..self.progress_updates {
                on_progress(ToolOutput::text(format!("step {i}")));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = cancel.cancelled() => {
                self.log
                    .lock()
                    .unwrap()
                    .push((self.name.clone(), "cancelled", Instant::now()));
                return Err(ToolError::Cancelled);
            }
        }

        if let Some(on_progress) = &on_progress {
            for i in 0..self.late_progress {
                on_progress(ToolOutput::text(format!("late step {i}")));
            }
        }

        self.log
            .lock()
            .unwrap()
            .push((self.name.clone(), "end", Instant::now()));
        if let Some(f) = &self.on_complete {
            f();
        }

        if self.fail {
            Err(ToolError::Failed("tool blew up".into()))
        } else {
            Ok(ToolOutput::text(format!("{} ok", self.name)))
        }
    }
}

fn call(id: &str, name: &str) -> ToolCallInfo {
    ToolCallInfo {
        id: id.into(),
        name: name.into(),
        arguments: serde_json::json!({}),
        intent: None,
    }
}

fn log_time(log: &ExecutionLog, name: &str, what: &str) -> Instant {
    log.lock()
        .unwrap()
        .iter()
        .find(|(n, w, _)| n == name && *w == what)
        .map(|(_, _, t)| *t)
        .unwrap_or_else(|| panic!("no `{what}` entry for {name}"))
}

fn steering_from(queue: &Arc<Mutex<Vec<AgentMessage>>>) -> GetMessagesFn {
    let queue = queue.clone();
    Arc::new(move || {
        let drained: Vec<AgentMessage> = queue.lock().unwrap().drain(..).collect();
        futures::future::ready(drained).boxed()
    })
}

async fn run_batch(
    tools: Vec<Arc<dyn AgentTool>>,
    calls: Vec<ToolCallInfo>,
    options: ToolBatchOptions,
) -> (Vec<ToolResultMessage>, Option<Vec<AgentMessage>>, Vec<AgentEvent>) {
    let events = AgentEventStream::new();
    let mut rx = events.subscribe();
    let outcome = execute_tool_batch(
        &tools,
        &calls,
        &events,
        &CancellationToken::new(),
        &options,
    )
    .await;
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    (outcome.tool_results, outcome.steering_messages, seen)
}

#[tokio::test]
async fn exclusive_is_a_barrier_between_shared_groups() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let tools: Vec<Arc<dyn AgentTool>> = vec![
        Arc::new(TestTool::new("a", &log).lasting(60)),
        Arc::new(TestTool::new("b", &log).lasting(120)),
        Arc::new(TestTool::new("c", &log).lasting(30).exclusive()),
        Arc::new(TestTool::new("d", &log).lasting(10)),
    ];
    let calls = vec![call("1", "a"), call("2", "b"), call("3", "c"), call("4", "d")];

    let (results, steering, events) =
        run_batch(tools, calls, ToolBatchOptions::default()).await;

    assert!(steering.is_none());
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| !r.is_error));
    // Results come back in declaration order regardless of finish order.
    let ids: Vec<_> = results.iter().map(|r| r.tool_call_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3", "4"]);

    // b outlives a; c waits for both; d waits for c.
    let end_a = log_time(&log, "a", "end");
    let end_b = log_time(&log, "b", "end");
    let start_c = log_time(&log, "c", "start");
    let end_c = log_time(&log, "c", "end");
    let start_d = log_time(&log, "d", "start");
    assert!(start_c >= end_a, "exclusive started before shared finished");
    assert!(start_c >= end_b, "exclusive started before shared finished");
    assert!(start_d >= end_c, "shared after exclusive started too early");

    // a and b really overlapped.
    let start_b = log_time(&log, "b", "start");
    assert!(start_b < end_a, "shared tools did not overlap");

    // Event-stream ordering mirrors execution: no start appears between the
    // exclusive tool's start and end, and all ends precede the first
    // toolResult message.
    let index_of = |pred: &dyn Fn(&AgentEvent) -> bool| {
        events.iter().position(|e| pred(e)).expect("event present")
    };
    let c_start = index_of(&|e| {
        matches!(e, AgentEvent::ToolExecutionStart { tool_call_id, .. } if tool_call_id == "3")
    });
    let c_end = index_of(&|e| {
        matches!(e, AgentEvent::ToolExecutionEnd { tool_call_id, .. } if tool_call_id == "3")
    });
    for (i, event) in events.iter().enumerate() {
        if let AgentEvent::ToolExecutionStart { tool_call_id, .. } = event {
            assert!(
                !(i > c_start && i < c_end) || tool_call_id == "3",
                "tool {tool_call_id} started inside the exclusive window"
            );
        }
    }
    let last_end = events
        .iter()
        .rposition(|e| matches!(e, AgentEvent::ToolExecutionEnd { .. }))
        .unwrap();
    let first_result_message = index_of(&|e| {
        matches!(e, AgentEvent::MessageStart { message } if message.role() == "toolResult")
    });
    assert!(last_end < first_result_message);
}

#[tokio::test]
async fn steering_interrupts_cancels_and_skips() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let steering_queue: Arc<Mutex<Vec<AgentMessage>>> = Arc::new(Mutex::new(Vec::new()));

    let queue = steering_queue.clone();
    let tools: Vec<Arc<dyn AgentTool>> = vec![
        Arc::new(TestTool::new("a", &log).lasting(20).on_complete(move || {
            queue.lock().unwrap().push(Message::user("stop").into());
        })),
        Arc::new(TestTool::new("b", &log).lasting(500)),
        Arc::new(TestTool::new("c", &log).lasting(10).exclusive()),
    ];
    let calls = vec![call("1", "a"), call("2", "b"), call("3", "c")];

    let options = ToolBatchOptions {
        get_steering_messages: Some(steering_from(&steering_queue)),
        ..Default::default()
    };
    let (results, steering, events) = run_batch(tools, calls, options).await;

    // a kept its real result; b and c got the skipped placeholder.
    assert!(!results[0].is_error);
    for result in &results[1..] {
        assert!(result.is_error);
        match &result.content[0] {
            Content::Text { text } => assert_eq!(text, SKIPPED_TEXT),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    // The steering message comes back for the next turn.
    let steering = steering.expect("steering captured");
    assert_eq!(steering.len(), 1);

    // b was cancelled in flight; c never ran.
    let log = log.lock().unwrap();
    assert!(log.iter().any(|(n, w, _)| n == "b" && *w == "cancelled"));
    assert!(!log.iter().any(|(n, _, _)| n == "c"));

    // Every call still has exactly one start and one end event.
    for id in ["1", "2", "3"] {
        let starts = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolExecutionStart { tool_call_id, .. } if tool_call_id == id))
            .count();
        let ends = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolExecutionEnd { tool_call_id, .. } if tool_call_id == id))
            .count();
        assert_eq!((starts, ends), (1, 1), "unpaired events for call {id}");
    }
}

#[tokio::test]
async fn wait_mode_never_interrupts() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let steering_queue: Arc<Mutex<Vec<AgentMessage>>> =
        Arc::new(Mutex::new(vec![Message::user("later").into()]));

    let tools: Vec<Arc<dyn AgentTool>> = vec![
        Arc::new(TestTool::new("a", &log).lasting(10)),
        Arc::new(TestTool::new("b", &log).lasting(10)),
    ];
    let calls = vec![call("1", "a"), call("2", "b")];

    let options = ToolBatchOptions {
        interrupt_mode: InterruptMode::Wait,
        get_steering_messages: Some(steering_from(&steering_queue)),
        ..Default::default()
    };
    let (results, steering, _) = run_batch(tools, calls, options).await;

    // Both ran; the queued steering stays for the turn boundary.
    assert!(results.iter().all(|r| !r.is_error));
    assert!(steering.is_none());
    assert_eq!(steering_queue.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn non_abortable_tool_runs_to_completion_but_is_skipped() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let steering_queue: Arc<Mutex<Vec<AgentMessage>>> = Arc::new(Mutex::new(Vec::new()));

    let queue = steering_queue.clone();
    let tools: Vec<Arc<dyn AgentTool>> = vec![
        Arc::new(TestTool::new("fast", &log).lasting(10).on_complete(move || {
            queue.lock().unwrap().push(Message::user("stop").into());
        })),
        Arc::new(
            TestTool::new("stubborn", &log)
                .lasting(100)
                .non_abortable()
                .with_late_progress(2),
        ),
    ];
    let calls = vec![call("1", "fast"), call("2", "stubborn")];

    let options = ToolBatchOptions {
        get_steering_messages: Some(steering_from(&steering_queue)),
        ..Default::default()
    };
    let (results, steering, events) = run_batch(tools, calls, options).await;

    assert!(steering.is_some());
    // The non-abortable tool finished (no cancellation entry) ...
    let log = log.lock().unwrap();
    assert!(log.iter().any(|(n, w, _)| n == "stubborn" && *w == "end"));
    assert!(!log.iter().any(|(n, w, _)| n == "stubborn" && *w == "cancelled"));
    // ... but its result was discarded in favor of the placeholder.
    assert!(results[1].is_error);

    // Progress emitted after the interrupt never reaches the stream.
    assert!(!events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolExecutionUpdate { .. })));
}

#[tokio::test]
async fn progress_updates_are_forwarded() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let tools: Vec<Arc<dyn AgentTool>> =
        vec![Arc::new(TestTool::new("p", &log).with_progress(3))];
    let calls = vec![call("1", "p")];

    let (_, _, events) = run_batch(tools, calls, ToolBatchOptions::default()).await;

    let updates = events
        .iter()
        .filter(|e| matches!(e, AgentEvent::ToolExecutionUpdate { .. }))
        .count();
    assert_eq!(updates, 3);
}

#[tokio::test]
async fn unknown_tool_yields_error_result() {
    let (results, _, events) = run_batch(
        Vec::new(),
        vec![call("1", "nope")],
        ToolBatchOptions::default(),
    )
    .await;

    assert!(results[0].is_error);
    match &results[0].content[0] {
        Content::Text { text } => assert_eq!(text, "Tool nope not found"),
        other => panic!("unexpected content: {other:?}"),
    }
    // Even the unknown tool gets paired start/end events.
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolExecutionStart { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolExecutionEnd { is_error: true, .. })));
}

#[tokio::test]
async fn invalid_arguments_fail_unless_lenient() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let tools: Vec<Arc<dyn AgentTool>> = vec![
        Arc::new(TestTool::new("strict", &log)),
        Arc::new(TestTool::new("loose", &log).lenient()),
    ];
    let mut bad_strict = call("1", "strict");
    bad_strict.arguments = serde_json::json!({"x": "not a number"});
    let mut bad_loose = call("2", "loose");
    bad_loose.arguments = serde_json::json!({"x": "not a number"});

    let (results, _, _) = run_batch(
        tools,
        vec![bad_strict, bad_loose],
        ToolBatchOptions::default(),
    )
    .await;

    assert!(results[0].is_error);
    match &results[0].content[0] {
        Content::Text { text } => assert!(text.contains("Invalid arguments")),
        other => panic!("unexpected content: {other:?}"),
    }
    // The lenient tool executed with the raw arguments.
    assert!(!results[1].is_error);
    assert!(log.lock().unwrap().iter().any(|(n, w, _)| n == "loose" && *w == "end"));
    assert!(!log.lock().unwrap().iter().any(|(n, _, _)| n == "strict"));
}

#[tokio::test]
async fn one_failing_tool_does_not_cancel_siblings() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let tools: Vec<Arc<dyn AgentTool>> = vec![
        Arc::new(TestTool::new("bad", &log).failing()),
        Arc::new(TestTool::new("good", &log).lasting(30)),
    ];
    let calls = vec![call("1", "bad"), call("2", "good")];

    let (results, _, _) = run_batch(tools, calls, ToolBatchOptions::default()).await;

    assert!(results[0].is_error);
    match &results[0].content[0] {
        Content::Text { text } => assert_eq!(text, "tool blew up"),
        other => panic!("unexpected content: {other:?}"),
    }
    assert!(!results[1].is_error);
}

#[tokio::test]
async fn run_abort_cancels_tools_but_keeps_error_results() {
    let log: ExecutionLog = Arc::new(Mutex::new(Vec::new()));
    let tools: Vec<Arc<dyn AgentTool>> =
        vec![Arc::new(TestTool::new("slow", &log).lasting(10_000))];
    let calls = vec![call("1", "slow")];

    let events = AgentEventStream::new();
    let run_cancel = CancellationToken::new();
    let abort = run_cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        abort.cancel();
    });

    let outcome = execute_tool_batch(
        &tools,
        &calls,
        &events,
        &run_cancel,
        &ToolBatchOptions::default(),
    )
    .await;

    // A run-wide abort is not a steering interrupt: the cancelled tool's
    // own error result survives, keeping the pairing intact.
    assert_eq!(outcome.tool_results.len(), 1);
    assert!(outcome.tool_results[0].is_error);
    assert!(outcome.steering_messages.is_none());
    match &outcome.tool_results[0].content[0] {
        Content::Text { text } => assert_eq!(text, "Cancelled"),
        other => panic!("unexpected content: {other:?}"),
    }
}
