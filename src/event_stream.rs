//! Ordered, terminable event channel for agent runs.
//!
//! One producer (the run task), any number of consumers. Consumers either
//! `subscribe()` for a channel of cloned events or register an `on_event`
//! callback. The stream ends exactly once with a result payload: for agent
//! runs, the list of messages the run produced.

use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::types::{AgentEvent, AgentMessage};

/// The event stream every agent run returns.
pub type AgentEventStream = EventStream<AgentEvent, Vec<AgentMessage>>;

pub struct EventStream<E, R> {
    inner: Arc<Inner<E, R>>,
}

struct Inner<E, R> {
    state: Mutex<State<E, R>>,
    ended: Notify,
}

struct State<E, R> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
    listeners: Vec<(u64, Arc<dyn Fn(&E) + Send + Sync>)>,
    next_listener_id: u64,
    result: Option<R>,
    is_ended: bool,
}

impl<E, R> Clone for EventStream<E, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E, R> Default for EventStream<E, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, R> EventStream<E, R> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    subscribers: Vec::new(),
                    listeners: Vec::new(),
                    next_listener_id: 0,
                    result: None,
                    is_ended: false,
                }),
                ended: Notify::new(),
            }),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state.lock().unwrap().is_ended
    }

    /// Register a callback invoked synchronously for every pushed event.
    /// Returns an id usable with [`remove_listener`](Self::remove_listener).
    pub fn on_event(&self, f: impl Fn(&E) + Send + Sync + 'static) -> u64 {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.push((id, Arc::new(f)));
        id
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }
}

impl<E: Clone, R> EventStream<E, R> {
    /// Push one event to every subscriber and listener.
    ///
    /// Delivery order equals push order: the whole fan-out happens under one
    /// lock, so no consumer can observe events out of order. Pushes after
    /// `end` are discarded.
    pub fn push(&self, event: E) {
        let state = self.inner.state.lock().unwrap();
        if state.is_ended {
            return;
        }
        for (_, listener) in &state.listeners {
            listener(&event);
        }
        for sub in &state.subscribers {
            let _ = sub.send(event.clone());
        }
    }

    /// Subscribe to all events pushed from now on. Buffering is unbounded;
    /// a run emits finitely many events and none may be dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().unwrap();
        if !state.is_ended {
            state.subscribers.push(tx);
        }
        rx
    }

    /// A `futures::Stream` over a fresh subscription.
    pub fn into_stream(&self) -> UnboundedReceiverStream<E> {
        UnboundedReceiverStream::new(self.subscribe())
    }
}

impl<E, R: Clone> EventStream<E, R> {
    /// Terminate the stream with a result. Subscriber channels close;
    /// `result()` wakes. Idempotent — later calls are ignored.
    pub fn end(&self, result: R) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.is_ended {
                return;
            }
            state.is_ended = true;
            state.result = Some(result);
            state.subscribers.clear();
            state.listeners.clear();
        }
        self.inner.ended.notify_waiters();
    }

    /// Wait for the stream to end and return its result payload.
    pub async fn result(&self) -> R {
        loop {
            let notified = self.inner.ended.notified();
            {
                let state = self.inner.state.lock().unwrap();
                if let Some(result) = &state.result {
                    return result.clone();
                }
            }
            notified.await;
        }
    }
}
