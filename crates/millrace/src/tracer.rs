//! Render tracing.
//!
//! A [`RenderTracer`] observes scheduling events during a render: task
//! spawns, external calls, lock transitions, journaled commands, and poison
//! creation. The default is [`NoopTracer`]; [`StderrTracer`] prints events
//! for debugging and [`RecordingTracer`] collects them for tests asserting
//! ordering properties.

use crate::schedule::CallId;

/// One observable runtime event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A statement task was spawned at the given template line.
    TaskSpawned { label: String, line: u32 },
    /// An external call was issued to the host.
    ExternalCall { call_id: CallId, path: Vec<String> },
    /// A sequence lock was acquired.
    LockAcquired { key: String },
    /// A sequence lock was released.
    LockReleased { key: String },
    /// A handler command was journaled.
    CommandJournaled { handler: String, method: String },
    /// A runtime failure became poison.
    PoisonCreated { message: String },
    /// The render settled (before final flush).
    RenderSettled,
}

/// Observer of render events. Implementations must be cheap; tracing runs
/// inline with evaluation.
pub trait RenderTracer {
    fn event(&mut self, event: TraceEvent);
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl RenderTracer for NoopTracer {
    fn event(&mut self, _event: TraceEvent) {}
}

/// Prints every event to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrTracer;

impl RenderTracer for StderrTracer {
    fn event(&mut self, event: TraceEvent) {
        eprintln!("[millrace] {event:?}");
    }
}

/// Records events in order for later inspection.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// The lock keys in acquisition order, a common ordering assertion.
    #[must_use]
    pub fn acquired_keys(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::LockAcquired { key } => Some(key.clone()),
                _ => None,
            })
            .collect()
    }
}

impl RenderTracer for RecordingTracer {
    fn event(&mut self, event: TraceEvent) {
        self.events.push(event);
    }
}
