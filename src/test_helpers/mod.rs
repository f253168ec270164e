//! Test Helpers Module - Engine Testing Infrastructure
//!
//! Shared utilities for unit tests, the `tests/` integration suites and the
//! benchmarks: a scripted processor over a small delivery pipeline, a counting
//! observer, and deterministic "wait until idle" helpers built on
//! `has_queued_or_active_objects()`.

pub mod scripted_processor;
pub mod test_utils;

pub use scripted_processor::{
    delivery_status_model, CountingObserver, Script, ScriptedProcessor, DELIVERY_OBJECT_TYPE,
};
pub use test_utils::{
    drive_until_idle, get_test_database_url, test_engine_config, wait_for_processing,
    wait_until_idle,
};
