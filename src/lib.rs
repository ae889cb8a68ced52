pub mod agent;
pub mod agent_loop;
pub mod assembler;
pub mod event_stream;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod types;
pub mod validation;

pub use agent::{Agent, AgentError, ListenerHandle, QueueMode};
pub use agent_loop::{agent_loop, agent_loop_continue, AgentLoopConfig, AgentSettings};
pub use event_stream::{AgentEventStream, EventStream};
pub use retry::RetryConfig;
pub use scheduler::InterruptMode;
pub use types::*;
