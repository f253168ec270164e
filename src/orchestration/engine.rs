//! # Background Processing Engine
//!
//! Drives processable objects of one type through their status model with a
//! bounded worker pool.
//!
//! ## Cycle
//!
//! Every claimed object goes through exactly one cycle:
//!
//! 1. **Claim**: atomic store update into the processing status, lock held
//! 2. **Dispatch**: queued until a worker permit is available
//! 3. **Process**: `ObjectProcessor::process` runs without interruption
//! 4. **Unlock**: the outcome (success, retry or permanent failure) is persisted
//!    and the lock released on every exit path, panics included
//!
//! ## Backpressure
//!
//! `process_objects()` only claims while `queued + active` is below
//! `processing_thread_count + maximum_queue_length`. A queue slot is reserved
//! before each claim, so a claimed object is always visible to
//! [`BackgroundProcessingEngine::has_queued_or_active_objects`].
//!
//! ## Lifecycle
//!
//! `start()` spawns the poll loop and the stale-lock sweep. `stop()` halts
//! claiming, stops both loops and waits for dispatched work to drain; in-flight
//! `process()` calls are never cancelled.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ProcessingError, Result};
use crate::logging::log_processing_outcome;
use crate::models::{timestamp_now, ProcessableObject};
use crate::state_machine::{ProcessingPhase, Status};
use crate::store::{ProcessableObjectStore, UnlockOutcome};

use super::metrics::{EngineMetrics, EngineStatus};
use super::object_processor::{ObjectProcessor, ProcessingResult, ProcessorBinding};
use super::observer::{NoopObserver, ProcessingObserver};
use super::retry::{BackoffPolicy, RetryDecision};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Counter slot held for as long as an object is queued or active
struct SlotGuard(Arc<AtomicUsize>);

impl SlotGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Engine driving one [`ObjectProcessor`] against one [`ProcessableObjectStore`]
pub struct BackgroundProcessingEngine<P, S> {
    inner: Arc<EngineInner<P, S>>,
    loops: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

struct EngineInner<P, S> {
    id: Uuid,
    binding: ProcessorBinding<P, S>,
    config: EngineConfig,
    observer: parking_lot::RwLock<Arc<dyn ProcessingObserver>>,
    workers: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    running: AtomicBool,
    stopping: AtomicBool,
    shutdown_notify: Notify,
    // A single poll path claims at any time
    poll_cycle: AsyncMutex<()>,
    metrics: EngineMetrics,
}

impl<P, S> BackgroundProcessingEngine<P, S>
where
    P: ObjectProcessor,
    S: ProcessableObjectStore,
{
    /// Create an engine; fails when the configuration is invalid
    pub fn new(processor: Arc<P>, store: Arc<S>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let id = Uuid::new_v4();
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "engine".to_string());
        let lock_owner = format!("{host}-{id}");
        let binding = ProcessorBinding::new(
            processor,
            store,
            lock_owner,
            config.max_processing_attempts,
            BackoffPolicy::from_config(&config.backoff),
        );

        info!(
            engine_id = %id,
            object_type = %binding.processor().object_type(),
            processing_thread_count = config.processing_thread_count,
            maximum_queue_length = config.maximum_queue_length,
            "Created background processing engine"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                id,
                workers: Arc::new(Semaphore::new(config.processing_thread_count)),
                binding,
                config,
                observer: parking_lot::RwLock::new(Arc::new(NoopObserver)),
                queued: Arc::new(AtomicUsize::new(0)),
                active: Arc::new(AtomicUsize::new(0)),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                poll_cycle: AsyncMutex::new(()),
                metrics: EngineMetrics::default(),
            }),
            loops: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Install the hooks notified of success and permanent failure
    pub fn with_observer(self, observer: Arc<dyn ProcessingObserver>) -> Self {
        *self.inner.observer.write() = observer;
        self
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn lock_owner(&self) -> &str {
        self.inner.binding.lock_owner()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn binding(&self) -> &ProcessorBinding<P, S> {
        &self.inner.binding
    }

    pub fn processor(&self) -> &Arc<P> {
        self.inner.binding.processor()
    }

    pub fn store(&self) -> &Arc<S> {
        self.inner.binding.store()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// True while any claimed object is queued for a worker or being processed
    pub fn has_queued_or_active_objects(&self) -> bool {
        self.inner.in_flight() > 0
    }

    /// Claim and dispatch objects until capacity is reached or none are claimable.
    ///
    /// Returns how many objects were dispatched. A claim error is returned to the
    /// caller after the objects dispatched so far have been handed to workers.
    pub async fn process_objects(&self) -> Result<usize> {
        self.inner.process_objects().await
    }

    /// Revert processing locks older than `lock_timeout` to their pending predecessor
    pub async fn reset_stale_locks(&self, lock_timeout: Duration) -> Result<u64> {
        self.inner.reset_stale_locks(lock_timeout).await
    }

    /// Spawn the poll loop and the stale-lock sweep
    #[instrument(skip(self), fields(engine_id = %self.inner.id))]
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(ProcessingError::InvalidState(
                "Processing engine is already running".to_string(),
            ));
        }
        self.inner.stopping.store(false, Ordering::Release);

        info!(
            "🚀 ENGINE: Starting {} engine",
            self.inner.binding.processor().object_type()
        );

        let poll = tokio::spawn(Arc::clone(&self.inner).run_poll_loop());
        let sweep = tokio::spawn(Arc::clone(&self.inner).run_sweep_loop());
        self.loops.lock().extend([poll, sweep]);

        Ok(())
    }

    /// Halt claiming, stop the loops and wait up to `timeout` for in-flight work
    #[instrument(skip(self), fields(engine_id = %self.inner.id))]
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        self.inner.stopping.store(true, Ordering::Release);
        let was_running = self.inner.running.swap(false, Ordering::AcqRel);
        self.inner.shutdown_notify.notify_waiters();

        let handles: Vec<_> = self.loops.lock().drain(..).collect();
        for handle in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Engine loop ended abnormally"),
                Err(_) => {
                    return Err(ProcessingError::Timeout(
                        "Engine loops did not stop within the shutdown timeout".to_string(),
                    ));
                }
            }
        }

        while self.inner.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.inner.in_flight();
                warn!(remaining, "Shutdown timeout reached with work in flight");
                return Err(ProcessingError::Timeout(format!(
                    "{remaining} objects still queued or active after {timeout:?}"
                )));
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if was_running {
            info!(
                "🛑 ENGINE: Stopped {} engine",
                self.inner.binding.processor().object_type()
            );
        }
        Ok(())
    }

    /// `stop()` bounded by the configured `shutdown_timeout_ms`
    pub async fn shutdown(&self) -> Result<()> {
        self.stop(self.inner.config.shutdown_timeout()).await
    }

    pub fn status(&self) -> EngineStatus {
        let inner = &self.inner;
        EngineStatus {
            engine_id: inner.id,
            object_type: inner.binding.processor().object_type().to_string(),
            lock_owner: inner.binding.lock_owner().to_string(),
            running: inner.running.load(Ordering::Acquire),
            capacity: inner.config.capacity(),
            queued: inner.queued.load(Ordering::SeqCst),
            active: inner.active.load(Ordering::SeqCst),
            metrics: inner.metrics.snapshot(),
        }
    }
}

impl<P, S> Drop for BackgroundProcessingEngine<P, S> {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.shutdown_notify.notify_waiters();
        for handle in self.loops.get_mut().drain(..) {
            handle.abort();
        }
    }
}

impl<P, S> std::fmt::Debug for BackgroundProcessingEngine<P, S>
where
    P: ObjectProcessor,
    S: ProcessableObjectStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundProcessingEngine")
            .field("id", &self.inner.id)
            .field("object_type", &self.inner.binding.processor().object_type())
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl<P, S> EngineInner<P, S>
where
    P: ObjectProcessor,
    S: ProcessableObjectStore,
{
    // queued is read first: a worker moving from queued to active bumps active
    // before releasing its queue slot, so this never under-counts.
    fn in_flight(&self) -> usize {
        let queued = self.queued.load(Ordering::SeqCst);
        queued + self.active.load(Ordering::SeqCst)
    }

    fn should_claim(&self) -> bool {
        !self.stopping.load(Ordering::Acquire)
    }

    #[instrument(skip(self), fields(engine_id = %self.id))]
    async fn process_objects(self: &Arc<Self>) -> Result<usize> {
        let _cycle = self.poll_cycle.lock().await;
        let capacity = self.config.capacity();
        let mut dispatched = 0;

        while self.should_claim() {
            if self.in_flight() >= capacity {
                debug!(capacity, "Engine at capacity; deferring further claims");
                break;
            }

            let slot = SlotGuard::acquire(&self.queued);
            let claimed = match self.binding.claim_next_processable_object().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    EngineMetrics::increment(&self.metrics.claim_errors);
                    return Err(e);
                }
            };
            let Some(object) = claimed else {
                break;
            };
            EngineMetrics::increment(&self.metrics.claimed);

            if !self.should_claim() {
                self.rollback_claim(&object).await;
                break;
            }

            self.dispatch(object, slot);
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(dispatched, in_flight = self.in_flight(), "Dispatched claimed objects");
        }
        Ok(dispatched)
    }

    fn dispatch(self: &Arc<Self>, object: ProcessableObject, queued_slot: SlotGuard) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match Arc::clone(&engine.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    engine.rollback_claim(&object).await;
                    drop(queued_slot);
                    return;
                }
            };
            let _active_slot = SlotGuard::acquire(&engine.active);
            drop(queued_slot);

            engine.run_cycle(object).await;
        });
    }

    /// Return a claimed but unprocessed object to its pending predecessor
    async fn rollback_claim(&self, object: &ProcessableObject) {
        let model = self.binding.processor().status_model();
        let Some(pending) = model.pending_predecessor(&object.status).cloned() else {
            error!(
                object_id = %object.id,
                status = %object.status,
                "No pending predecessor to roll claim back to; leaving lock for the sweep"
            );
            return;
        };

        match self
            .binding
            .unlock_processable_object(object, &pending, Duration::ZERO, None, false)
            .await
        {
            Ok(_) => debug!(object_id = %object.id, status = %pending, "Rolled back undispatched claim"),
            Err(e) => {
                EngineMetrics::increment(&self.metrics.unlock_failures);
                error!(object_id = %object.id, error = %e, "Failed to roll back undispatched claim");
            }
        }
    }

    async fn run_cycle(&self, object: ProcessableObject) {
        let processor = self.binding.processor();
        let started = Instant::now();

        let result = AssertUnwindSafe(processor.process(&object))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "process() panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });
        let duration = started.elapsed();

        let applied = match result {
            Ok(result) => self.apply_result(&object, result, duration).await,
            Err(cause) => self.apply_failure(&object, cause, duration).await,
        };

        if let Err(e) = applied {
            EngineMetrics::increment(&self.metrics.unlock_failures);
            error!(
                object_id = %object.id,
                status = %object.status,
                lock_owner = %self.binding.lock_owner(),
                error = %e,
                "Failed to persist processing outcome; object stays locked until the stale-lock sweep"
            );
        }
    }

    async fn apply_result(
        &self,
        object: &ProcessableObject,
        result: ProcessingResult,
        duration: Duration,
    ) -> Result<()> {
        let processor = self.binding.processor();
        let model = processor.status_model();

        // The model's own instance carries the authoritative phase
        let Ok(returned) = model.status(result.status.code()).cloned() else {
            let cause = anyhow::anyhow!(
                "process() returned unknown status '{}'",
                result.status.code()
            );
            return self.apply_failure(object, cause, duration).await;
        };

        let next_status = match returned.phase() {
            ProcessingPhase::Processing => {
                let Some(pending) = model
                    .pending_predecessor(&returned)
                    .or_else(|| model.pending_predecessor(&object.status))
                    .cloned()
                else {
                    let cause = anyhow::anyhow!(
                        "no pending predecessor for returned status '{}'",
                        returned.code()
                    );
                    return self.apply_failure(object, cause, duration).await;
                };
                debug!(
                    object_id = %object.id,
                    returned = %returned,
                    normalised = %pending,
                    "Processing status returned; normalised to its pending predecessor"
                );
                pending
            }
            _ => returned,
        };

        match next_status.phase() {
            ProcessingPhase::Failed => {
                let unlocked = self
                    .unlock(object, &next_status, duration, None, false)
                    .await?;
                if let Some(updated) = unlocked {
                    self.record_permanent_failure(&updated, None);
                }
            }
            ProcessingPhase::Completed => {
                let reset = processor.reset_attempts_on_success(&object.status, &next_status);
                let unlocked = self
                    .unlock(object, &next_status, duration, None, reset)
                    .await?;
                if let Some(updated) = unlocked {
                    EngineMetrics::increment(&self.metrics.succeeded);
                    log_processing_outcome(
                        "completed",
                        updated.id,
                        &updated.object_type,
                        updated.status.code(),
                        updated.processing_attempts,
                        None,
                    );
                    let observer = Arc::clone(&*self.observer.read());
                    observer.after_success(&updated);
                }
            }
            ProcessingPhase::Pending | ProcessingPhase::Processing => {
                let reset = processor.reset_attempts_on_success(&object.status, &next_status);
                let next_processed = result.next_processed(timestamp_now());
                let unlocked = self
                    .unlock(object, &next_status, duration, next_processed, reset)
                    .await?;
                if let Some(updated) = unlocked {
                    EngineMetrics::increment(&self.metrics.advanced);
                    debug!(
                        object_id = %updated.id,
                        status = %updated.status,
                        next_processed = ?updated.next_processed,
                        "Object advanced to next step"
                    );
                }
            }
        }

        Ok(())
    }

    async fn apply_failure(
        &self,
        object: &ProcessableObject,
        cause: anyhow::Error,
        duration: Duration,
    ) -> Result<()> {
        let max_attempts = self.binding.max_processing_attempts();

        if object.processing_attempts < max_attempts {
            if let Some(decision) = self.retry_decision(object, &cause) {
                let next_processed = decision.next_processed(timestamp_now());
                let unlocked = self
                    .unlock(object, &decision.target_status, duration, next_processed, false)
                    .await?;
                if let Some(updated) = unlocked {
                    EngineMetrics::increment(&self.metrics.retried);
                    warn!(
                        object_id = %updated.id,
                        status = %updated.status,
                        attempts = updated.processing_attempts,
                        max_attempts,
                        next_processed = ?updated.next_processed,
                        error = %cause,
                        "Processing attempt failed; scheduled retry"
                    );
                }
                return Ok(());
            }
        }

        let failed = self.failure_status(object, &cause);
        let unlocked = self.unlock(object, &failed, duration, None, false).await?;
        if let Some(updated) = unlocked {
            self.record_permanent_failure(&updated, Some(&cause));
        }
        Ok(())
    }

    /// The processor's retry decision, provided it targets a pending status of the model
    fn retry_decision(&self, object: &ProcessableObject, cause: &anyhow::Error) -> Option<RetryDecision> {
        let processor = self.binding.processor();
        let decision = match processor.determine_retry_handling(
            object,
            &object.status,
            cause,
            self.binding.backoff(),
        ) {
            Ok(decision) => decision,
            Err(e) => {
                error!(object_id = %object.id, error = %e, "Retry handling failed; failing object");
                return None;
            }
        };

        match processor.status_model().status(decision.target_status.code()) {
            Ok(target) if target.is_pending() => Some(RetryDecision {
                target_status: target.clone(),
                delay: decision.delay,
            }),
            _ => {
                error!(
                    object_id = %object.id,
                    target = %decision.target_status,
                    "Retry target is not a pending status of the model; failing object"
                );
                None
            }
        }
    }

    /// The processor's failure status, or the model default when it is not a FAILED status
    fn failure_status(&self, object: &ProcessableObject, cause: &anyhow::Error) -> Status {
        let model = self.binding.processor().status_model();
        let requested = self
            .binding
            .processor()
            .determine_failure_status(object, &object.status, cause);

        match model.status(requested.code()) {
            Ok(status) if status.phase() == ProcessingPhase::Failed => status.clone(),
            _ => {
                error!(
                    object_id = %object.id,
                    requested = %requested,
                    "Failure status is not a FAILED status of the model; using the default"
                );
                model.default_failure_status().clone()
            }
        }
    }

    fn record_permanent_failure(&self, object: &ProcessableObject, cause: Option<&anyhow::Error>) {
        EngineMetrics::increment(&self.metrics.permanently_failed);
        let details = cause.map(|e| format!("{e:#}"));
        error!(
            object_id = %object.id,
            status = %object.status,
            attempts = object.processing_attempts,
            error = details.as_deref().unwrap_or("failed status returned by processor"),
            "Processing failed permanently"
        );
        log_processing_outcome(
            "failed",
            object.id,
            &object.object_type,
            object.status.code(),
            object.processing_attempts,
            details.as_deref(),
        );
        let observer = Arc::clone(&*self.observer.read());
        observer.after_permanent_failure(object, cause);
    }

    /// Unlock the claim on `object`; `None` when the claim had already been closed
    async fn unlock(
        &self,
        object: &ProcessableObject,
        new_status: &Status,
        duration: Duration,
        next_processed: Option<chrono::DateTime<chrono::Utc>>,
        reset_attempts: bool,
    ) -> Result<Option<ProcessableObject>> {
        match self
            .binding
            .unlock_processable_object(object, new_status, duration, next_processed, reset_attempts)
            .await?
        {
            UnlockOutcome::Unlocked(updated) => Ok(Some(updated)),
            UnlockOutcome::AlreadyUnlocked => {
                warn!(
                    object_id = %object.id,
                    status = %new_status,
                    "Claim was closed before its outcome could be persisted (stale-lock sweep?); outcome dropped"
                );
                Ok(None)
            }
        }
    }

    async fn reset_stale_locks(&self, lock_timeout: Duration) -> Result<u64> {
        let reverted = self.binding.reset_stale_locks(lock_timeout).await?;
        if reverted > 0 {
            EngineMetrics::add(&self.metrics.stale_locks_reset, reverted);
            warn!(
                engine_id = %self.id,
                reverted,
                lock_timeout_seconds = lock_timeout.as_secs(),
                "Reverted stale processing locks"
            );
        }
        Ok(reverted)
    }

    async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.polling_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // Registered before the flag check so a concurrent stop() is never missed
            let shutdown = self.shutdown_notify.notified();
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_objects().await {
                        error!(engine_id = %self.id, error = %e, "Poll cycle failed");
                    }
                }
                _ = shutdown => {
                    debug!("Shutdown notification received by poll loop");
                    break;
                }
            }
        }
        debug!(engine_id = %self.id, "Poll loop ended");
    }

    async fn run_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.stale_lock_sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let lock_timeout = self.config.lock_timeout();

        loop {
            // Registered before the flag check so a concurrent stop() is never missed
            let shutdown = self.shutdown_notify.notified();
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reset_stale_locks(lock_timeout).await {
                        error!(engine_id = %self.id, error = %e, "Stale-lock sweep failed");
                    }
                }
                _ = shutdown => {
                    debug!("Shutdown notification received by sweep loop");
                    break;
                }
            }
        }
        debug!(engine_id = %self.id, "Sweep loop ended");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
