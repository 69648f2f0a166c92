//! Progress event delivery.
//!
//! This module defines the event stream the core emits while a job runs and
//! the sink abstraction through which front-ends (CLI, GUI, ...) receive it,
//! so rendering stays entirely outside the library.

use crate::catalog::ChipInfo;
use crate::error::ErrorKind;
use std::sync::Arc;

/// One structured event derived from the flashing tool's output stream.
///
/// Events are delivered in the exact order the underlying output lines were
/// produced; the terminal event of every job is `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Transfer progress, 0..=100.
    Percent(u8),
    /// The tool identified the attached chip.
    ChipDetected(ChipInfo),
    /// Informational line that matched no other shape; raw text preserved.
    Message(String),
    /// The subprocess exited; `true` iff it reported success.
    Completed(bool),
    /// A recognized (or unclassifiable) failure signature, with the raw
    /// diagnostic line.
    Failed { kind: ErrorKind, detail: String },
}

impl ProgressEvent {
    /// Whether this event ends the job's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Completed(_) | ProgressEvent::Failed { .. })
    }
}

/// Receives every [`ProgressEvent`] of a running operation, in order.
///
/// Implement this to render progress; the sink is called from the worker
/// draining the subprocess, so implementations should return quickly.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Default sink that discards all events.
#[derive(Debug, Default)]
pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn on_event(&self, _event: &ProgressEvent) {}
}

pub type ProgressSinkArc = Arc<dyn ProgressSink>;

pub fn no_op_progress_sink() -> ProgressSinkArc {
    Arc::new(NoOpProgressSink)
}
