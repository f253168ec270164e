//! Outcome hooks injected into the engine at construction.
//!
//! Hooks run on the worker task right after the outcome has been persisted, so
//! they observe the unlocked object. They must not block for long: a worker
//! permit is held while they run.

use crate::models::ProcessableObject;

/// Observer notified of terminal processing outcomes
pub trait ProcessingObserver: Send + Sync + 'static {
    /// The object reached a COMPLETED-phase status
    fn after_success(&self, _object: &ProcessableObject) {}

    /// The object reached a FAILED-phase status.
    ///
    /// `cause` is the error of the last attempt, or `None` when `process()`
    /// itself returned a failed status.
    fn after_permanent_failure(&self, _object: &ProcessableObject, _cause: Option<&anyhow::Error>) {}
}

/// Observer that ignores every outcome
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProcessingObserver for NoopObserver {}
