//! Tests for the Agent facade: busy handling, abort, queues, listeners.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tiller::provider::{MockProvider, MockResponse, MockToolCall};
use tiller::*;

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn roles(messages: &[AgentMessage]) -> Vec<&str> {
    messages.iter().map(|m| m.role()).collect()
}

struct SleepTool {
    ms: u64,
}

#[async_trait::async_trait]
impl AgentTool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }
    fn label(&self) -> &str {
        "Sleep"
    }
    fn description(&self) -> &str {
        "Sleep for a while"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
    async fn execute(
        &self,
        _id: &str,
        _args: serde_json::Value,
        cancel: CancellationToken,
        _on_progress: Option<ProgressFn>,
        _context: Option<ToolContext>,
    ) -> Result<ToolOutput, ToolError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.ms)) => Ok(ToolOutput::text("slept")),
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
        }
    }
}

#[tokio::test]
async fn prompt_while_streaming_is_busy() {
    let provider = MockProvider::text("slow answer").with_event_delay(Duration::from_millis(40));
    let agent = Agent::new(provider).with_model("mock");

    let stream = agent.prompt("hi").expect("first prompt starts");
    assert!(agent.is_streaming());
    assert!(matches!(agent.prompt("again"), Err(AgentError::Busy)));

    stream.result().await;
    wait_for(|| !agent.is_streaming()).await;

    // Idle again: a new prompt is accepted.
    let stream = agent.prompt("now it works").expect("second prompt starts");
    stream.result().await;
    wait_for(|| !agent.is_streaming()).await;
    assert_eq!(agent.messages().len(), 4);
}

#[tokio::test]
async fn abort_is_idempotent() {
    let provider = MockProvider::text("never finishes").with_event_delay(Duration::from_millis(200));
    let agent = Agent::new(provider).with_model("mock");

    let stream = agent.prompt("hi").expect("prompt starts");
    tokio::time::sleep(Duration::from_millis(20)).await;
    agent.abort();
    agent.abort();

    let new_messages = stream.result().await;
    let assistant = new_messages
        .iter()
        .find_map(|m| m.as_assistant())
        .expect("aborted assistant message");
    assert_eq!(assistant.stop_reason, StopReason::Aborted);

    wait_for(|| !agent.is_streaming()).await;
    // Aborting an idle agent is a no-op.
    agent.abort();
    assert!(!agent.is_streaming());
}

#[tokio::test]
async fn continue_with_empty_history_fails_and_releases() {
    let agent = Agent::new(MockProvider::text("unused")).with_model("mock");
    assert!(matches!(
        agent.continue_run(),
        Err(AgentError::EmptyHistory)
    ));
    // The failed call must not leave the agent marked busy.
    assert!(!agent.is_streaming());
}

#[tokio::test]
async fn continue_after_assistant_needs_queued_input() {
    let agent = Agent::new(MockProvider::texts(vec!["first", "second"])).with_model("mock");

    agent.prompt("hi").unwrap().result().await;
    wait_for(|| !agent.is_streaming()).await;
    assert_eq!(roles(&agent.messages()), vec!["user", "assistant"]);

    // Last message is an assistant message and nothing is queued.
    assert!(matches!(
        agent.continue_run(),
        Err(AgentError::NothingToContinue)
    ));
    assert!(!agent.is_streaming());

    // A queued steering message makes continue legal; it gets consumed.
    agent.steer(Message::user("also do this").into());
    agent.continue_run().expect("continue consumes steering").result().await;
    wait_for(|| !agent.is_streaming()).await;
    assert_eq!(
        roles(&agent.messages()),
        vec!["user", "assistant", "user", "assistant"]
    );
}

#[tokio::test]
async fn continue_consumes_queued_follow_up() {
    let agent = Agent::new(MockProvider::texts(vec!["first", "second"])).with_model("mock");

    agent.prompt("hi").unwrap().result().await;
    wait_for(|| !agent.is_streaming()).await;

    agent.follow_up(Message::user("later task").into());
    agent
        .continue_run()
        .expect("continue consumes follow-up")
        .result()
        .await;
    wait_for(|| !agent.is_streaming()).await;
    assert_eq!(
        roles(&agent.messages()),
        vec!["user", "assistant", "user", "assistant"]
    );
}

#[tokio::test]
async fn follow_up_mode_all_drains_the_queue_at_once() {
    let agent = Agent::new(MockProvider::texts(vec!["one", "two"])).with_model("mock");
    agent.set_follow_up_mode(QueueMode::All);

    agent.follow_up(Message::user("then this").into());
    agent.follow_up(Message::user("and this").into());

    agent.prompt("start").unwrap().result().await;
    wait_for(|| !agent.is_streaming()).await;

    // Both follow-ups were spliced into a single extra round.
    assert_eq!(
        roles(&agent.messages()),
        vec!["user", "assistant", "user", "user", "assistant"]
    );
}

#[tokio::test]
async fn steering_mid_run_splices_into_next_turn() {
    let provider = MockProvider::new(vec![
        MockResponse::ToolCalls(vec![MockToolCall::with_id(
            "t1",
            "sleep",
            serde_json::json!({}),
        )]),
        MockResponse::Text("done after steering".into()),
    ]);
    let agent = Agent::new(provider)
        .with_model("mock")
        .with_tools(vec![Arc::new(SleepTool { ms: 150 })]);

    let stream = agent.prompt("start work").unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    agent.steer(Message::user("change course").into());

    stream.result().await;
    wait_for(|| !agent.is_streaming()).await;

    let messages = agent.messages();
    assert_eq!(
        roles(&messages),
        vec!["user", "assistant", "toolResult", "user", "assistant"]
    );
    // The spliced user message is the steering text.
    match messages[3].as_llm().unwrap() {
        Message::User(user) => match &user.content[0] {
            Content::Text { text } => assert_eq!(text, "change course"),
            other => panic!("unexpected content: {other:?}"),
        },
        other => panic!("expected user, got {}", other.role()),
    }
}

#[tokio::test]
async fn listeners_observe_runs_and_replay() {
    let agent = Agent::new(MockProvider::text("hi there")).with_model("mock");

    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let seen = seen.clone();
        agent.subscribe(move |event| {
            let kind = match event {
                AgentEvent::AgentStart => "start",
                AgentEvent::AgentEnd { .. } => "end",
                _ => "other",
            };
            seen.lock().unwrap().push(kind);
        })
    };

    agent.prompt("hello").unwrap().result().await;
    wait_for(|| !agent.is_streaming()).await;

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&"start"));
        assert_eq!(seen.last(), Some(&"end"));
    }

    // External replay reaches listeners like a local run would.
    let before = seen.lock().unwrap().len();
    agent.emit_external_event(AgentEvent::AgentStart);
    assert_eq!(seen.lock().unwrap().len(), before + 1);

    // Unsubscribed listeners hear nothing further.
    handle.unsubscribe();
    agent.emit_external_event(AgentEvent::AgentStart);
    assert_eq!(seen.lock().unwrap().len(), before + 1);
}

#[tokio::test]
async fn history_save_restore_round_trip() {
    let agent = Agent::new(MockProvider::text("remembered")).with_model("mock");
    agent.prompt("remember me").unwrap().result().await;
    wait_for(|| !agent.is_streaming()).await;

    let saved = agent.save_messages().unwrap();

    let restored = Agent::new(MockProvider::text("unused")).with_model("mock");
    restored.restore_messages(&saved).unwrap();
    assert_eq!(roles(&restored.messages()), roles(&agent.messages()));
}

#[tokio::test]
async fn reset_clears_history_and_queues() {
    let agent = Agent::new(MockProvider::text("hi")).with_model("mock");
    agent.prompt("hello").unwrap().result().await;
    wait_for(|| !agent.is_streaming()).await;

    agent.steer(Message::user("queued").into());
    agent.follow_up(Message::user("queued too").into());
    agent.reset();

    assert!(agent.messages().is_empty());
    // Nothing queued: continuing is illegal again.
    assert!(matches!(agent.continue_run(), Err(AgentError::EmptyHistory)));
}
