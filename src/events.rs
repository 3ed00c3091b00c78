//! A small typed event bus: non-blocking callbacks registered once at setup,
//! replacing a subscriber-list pattern. Handlers run on the acquisition
//! thread's call stack and must not block — the bus itself enforces nothing
//! here beyond documenting the contract; a slow handler simply delays the
//! next loop iteration.

use std::sync::{Arc, Mutex};

/// Lifecycle events fired by [`crate::controller::Controller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The acquisition thread has started running.
    Started,
    /// One `process_interval` iteration completed.
    ProcessIteration,
    /// The Epoch ran to completion and was handed to the persistor.
    CompletedEpoch,
    /// The Epoch was cancelled or faulted; the persistor was not invoked.
    DiscardedEpoch,
    /// The bridge returned to `Ready` after `stop`/`cancel`.
    Stopped,
}

type Handler = Box<dyn Fn(Event) + Send + Sync>;

/// Registry of non-blocking event handlers. No dynamic add/remove once
/// acquisition has started — handlers are registered at setup and the bus is shared
/// read-only (behind `Arc`) from then on.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Vec<Handler>>,
}

impl EventBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self { handlers: Mutex::new(Vec::new()) }
    }

    /// Register a handler. Call only before `run_epoch` starts.
    pub fn subscribe(&self, handler: impl Fn(Event) + Send + Sync + 'static) {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).push(Box::new(handler));
    }

    /// Fire `event` to every registered handler, in registration order.
    pub fn fire(&self, event: Event) {
        for handler in self.handlers.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            handler(event);
        }
    }
}

/// Convenience handle for tests: records every event fired, in order.
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    /// Attach a recording handler to `bus`, returning a handle to read back
    /// what fired.
    pub fn attach(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        bus.subscribe(move |event| sink_events.lock().unwrap_or_else(|e| e.into_inner()).push(event));
        Self { events }
    }

    /// Snapshot of everything fired so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
