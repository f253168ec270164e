//! Scripted processor over a two-step delivery pipeline.
//!
//! ```text
//! new --claim--> rendering --success--> rendered --claim--> sending --success--> sent
//!  ^                 |                     ^                   |
//!  +------retry------+                     +-------retry-------+
//! ```
//!
//! `failed` is the terminal failure status.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ProcessingError, Result};
use crate::models::ProcessableObject;
use crate::orchestration::{ObjectProcessor, ProcessingObserver, ProcessingResult};
use crate::state_machine::{Status, StatusModel};

pub const DELIVERY_OBJECT_TYPE: &str = "delivery";

/// Status model of the delivery pipeline
pub fn delivery_status_model() -> Result<StatusModel> {
    StatusModel::builder()
        .status(Status::pending("new"))
        .status(Status::processing("rendering"))
        .status(Status::pending("rendered"))
        .status(Status::processing("sending"))
        .status(Status::completed("sent"))
        .status(Status::failed("failed"))
        .claim_transition("new", "rendering")
        .claim_transition("rendered", "sending")
        .success_transition("rendering", "rendered")
        .success_transition("sending", "sent")
        .retry_transition("rendering", "new")
        .retry_transition("sending", "rendered")
        .default_failure_status("failed")
        .build()
}

/// What `process()` does on each call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Follow the success transition of the current status
    Succeed,
    /// Fail every call
    AlwaysFail,
    /// Fail the first `n` calls across all objects, then succeed
    FailTimes(u32),
}

/// Deterministic processor for engine tests and benchmarks
#[derive(Debug)]
pub struct ScriptedProcessor {
    object_type: String,
    model: StatusModel,
    script: Script,
    work_duration: Duration,
    step_delay: Option<Duration>,
    max_attempts: Option<i32>,
    calls: AtomicU32,
    failures_left: AtomicU32,
    running: AtomicUsize,
    peak_concurrency: AtomicUsize,
    processed: Mutex<Vec<(Uuid, String)>>,
}

impl ScriptedProcessor {
    pub fn new(script: Script) -> Result<Self> {
        let failures = match script {
            Script::FailTimes(n) => n,
            _ => 0,
        };
        Ok(Self {
            object_type: DELIVERY_OBJECT_TYPE.to_string(),
            model: delivery_status_model()?,
            script,
            work_duration: Duration::ZERO,
            step_delay: None,
            max_attempts: None,
            calls: AtomicU32::new(0),
            failures_left: AtomicU32::new(failures),
            running: AtomicUsize::new(0),
            peak_concurrency: AtomicUsize::new(0),
            processed: Mutex::new(Vec::new()),
        })
    }

    pub fn with_object_type(mut self, object_type: impl Into<String>) -> Self {
        self.object_type = object_type.into();
        self
    }

    /// Time each `process()` call takes
    pub fn with_work_duration(mut self, work_duration: Duration) -> Self {
        self.work_duration = work_duration;
        self
    }

    /// Explicit delay returned with every intermediate (pending) result
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of `process()` calls observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_concurrency.load(Ordering::SeqCst)
    }

    /// `(object id, processing status)` of every call, in call order
    pub fn processed(&self) -> Vec<(Uuid, String)> {
        self.processed.lock().clone()
    }

    fn should_fail(&self) -> bool {
        match self.script {
            Script::Succeed => false,
            Script::AlwaysFail => true,
            Script::FailTimes(_) => self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok(),
        }
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectProcessor for ScriptedProcessor {
    fn object_type(&self) -> &str {
        &self.object_type
    }

    fn status_model(&self) -> &StatusModel {
        &self.model
    }

    fn max_processing_attempts(&self) -> Option<i32> {
        self.max_attempts
    }

    async fn process(&self, object: &ProcessableObject) -> anyhow::Result<ProcessingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = RunningGuard(&self.running);
        self.peak_concurrency.fetch_max(now_running, Ordering::SeqCst);
        self.processed
            .lock()
            .push((object.id, object.status.code().to_string()));

        if !self.work_duration.is_zero() {
            tokio::time::sleep(self.work_duration).await;
        }

        if self.should_fail() {
            anyhow::bail!(
                "scripted failure for {} in '{}'",
                object.id,
                object.status.code()
            );
        }

        let next = self
            .model
            .success_transition(&object.status)
            .cloned()
            .ok_or_else(|| ProcessingError::UnknownStatus(object.status.code().to_string()))?;

        Ok(match self.step_delay {
            Some(delay) if next.is_pending() => ProcessingResult::after(next, delay),
            _ => ProcessingResult::new(next),
        })
    }
}

/// Observer counting hook invocations
#[derive(Debug, Default)]
pub struct CountingObserver {
    successes: AtomicUsize,
    permanent_failures: AtomicUsize,
    last_failure: Mutex<Option<String>>,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn permanent_failures(&self) -> usize {
        self.permanent_failures.load(Ordering::SeqCst)
    }

    pub fn last_failure(&self) -> Option<String> {
        self.last_failure.lock().clone()
    }
}

impl ProcessingObserver for CountingObserver {
    fn after_success(&self, _object: &ProcessableObject) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn after_permanent_failure(&self, _object: &ProcessableObject, cause: Option<&anyhow::Error>) {
        self.permanent_failures.fetch_add(1, Ordering::SeqCst);
        *self.last_failure.lock() = cause.map(|e| e.to_string());
    }
}
