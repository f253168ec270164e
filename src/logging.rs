//! # Structured Logging Module
//!
//! Environment-aware structured logging for the processing engine. A
//! human-readable console layer on stderr is always installed; a JSON layer on
//! stdout is added when `PROCESSING_LOG_FORMAT=json`, for log shippers.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};
use uuid::Uuid;

use crate::config::ConfigManager;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let json_output = std::env::var("PROCESSING_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        // A global subscriber may already be installed by the embedding application
        if tracing_subscriber::registry()
            .with(output_layers(&environment, json_output))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json_output = json_output,
            "Structured logging initialized"
        );
    });
}

/// Console layer on stderr, plus a JSON layer on stdout when requested
fn output_layers(environment: &str, json_output: bool) -> Vec<BoxedLayer> {
    let mut layers = vec![fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_filter(env_filter(environment))
        .boxed()];

    if json_output {
        layers.push(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_current_span(true)
                .with_filter(env_filter(environment))
                .boxed(),
        );
    }
    layers
}

/// `RUST_LOG` when set, otherwise the environment's default level
fn env_filter(environment: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(get_log_level(environment)))
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log structured data for one processing outcome
pub fn log_processing_outcome(
    outcome: &str,
    object_id: Uuid,
    object_type: &str,
    status: &str,
    attempts: i32,
    details: Option<&str>,
) {
    tracing::info!(
        outcome = %outcome,
        object_id = %object_id,
        object_type = %object_type,
        status = %status,
        attempts = attempts,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "PROCESSING_OUTCOME"
    );
}
