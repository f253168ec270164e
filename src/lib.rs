#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Processing Engine
//!
//! Background engine that drives long-lived, multi-step units of work
//! ("processable objects") through a finite set of named statuses.
//!
//! ## Overview
//!
//! Each domain supplies an [`ObjectProcessor`]: a status model plus one
//! `process()` step. The engine claims due objects from a shared store, runs
//! them on a bounded worker pool, and persists every outcome:
//!
//! - **success** moves the object along its pipeline or into a completed status
//! - **transient failure** schedules a retry (immediate or delayed) while attempts remain
//! - **permanent failure** moves the object into a terminal failed status
//!
//! Exclusive ownership of an object comes from the store's atomic claim. Locks
//! orphaned by crashed workers are reverted by a periodic stale-lock sweep, which
//! makes `process()` at-least-once.
//!
//! ## Module Organization
//!
//! - [`state_machine`] - statuses, processing phases and transition tables
//! - [`models`] - the processable object record
//! - [`orchestration`] - processor contract, retry decisions and the engine
//! - [`store`] - in-memory and PostgreSQL object stores
//! - [`database`] - PostgreSQL pool and migrations
//! - [`config`] - layered engine configuration
//! - [`error`] - structured error handling
//! - [`logging`] - structured `tracing` setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use processing_engine::config::EngineConfig;
//! use processing_engine::store::InMemoryObjectStore;
//! use processing_engine::test_helpers::{Script, ScriptedProcessor};
//! use processing_engine::BackgroundProcessingEngine;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let processor = Arc::new(ScriptedProcessor::new(Script::Succeed)?);
//! let store = Arc::new(InMemoryObjectStore::new());
//! let engine = BackgroundProcessingEngine::new(processor, store, EngineConfig::default())?;
//!
//! engine.start().await?;
//! // ... producers insert objects into the store ...
//! engine.stop(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                       # Unit and in-memory integration tests
//! cargo test --features test-db    # PostgreSQL store suites (needs DATABASE_URL)
//! ```

pub mod config;
#[cfg(feature = "postgres")]
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod store;
pub mod test_helpers;

pub use config::{BackoffConfig, ConfigManager, DatabaseConfig, EngineConfig};
pub use error::{ProcessingError, Result};
pub use models::{NewProcessableObject, ProcessableObject};
pub use orchestration::{
    BackgroundProcessingEngine, EngineStatus, ObjectProcessor, ProcessingObserver,
    ProcessingResult, ProcessorBinding, RetryDecision, RetryDelay,
};
pub use state_machine::{ProcessingPhase, Status, StatusModel};
pub use store::{InMemoryObjectStore, ProcessableObjectStore, UnlockOutcome};
#[cfg(feature = "postgres")]
pub use store::PostgresObjectStore;
