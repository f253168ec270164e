//! # Orchestration
//!
//! The claim / process / retry / unlock machinery.
//!
//! ## Core Components
//!
//! - **ObjectProcessor**: per-domain strategy performing one unit of work per claim
//! - **ProcessorBinding**: a processor bound to its store; claim and unlock
//! - **BackgroundProcessingEngine**: poll loop, bounded worker pool, outcome
//!   application and stale-lock sweep
//! - **RetryDecision / BackoffPolicy**: when and where a failed attempt returns
//! - **ProcessingObserver**: success and permanent-failure hooks
//! - **EngineMetrics**: counters behind `EngineStatus`

pub mod engine;
pub mod metrics;
pub mod object_processor;
pub mod observer;
pub mod retry;

pub use engine::BackgroundProcessingEngine;
pub use metrics::{EngineMetrics, EngineStatus, MetricsSnapshot};
pub use object_processor::{ObjectProcessor, ProcessingResult, ProcessorBinding};
pub use observer::{NoopObserver, ProcessingObserver};
pub use retry::{BackoffPolicy, RetryDecision, RetryDelay};
