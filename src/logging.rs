//! # Structured Logging Module
//!
//! Environment-aware structured logging for the engine's async drive loops.
//! Console output is human readable by default and switches to JSON when
//! `ACTIVITY_ENGINE_LOG_FORMAT=json`.

use std::process;
use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("RUST_LOG")
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));

        let layer = if use_json_format() {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Embedding applications may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("ACTIVITY_ENGINE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" | "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

fn use_json_format() -> bool {
    std::env::var("ACTIVITY_ENGINE_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log structured data for task lifecycle operations
pub fn log_task_operation(
    operation: &str,
    task_id: Uuid,
    task_name: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        task_name = task_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TASK_OPERATION"
    );
}

/// Log structured data for bucket claim/completion operations
pub fn log_bucket_operation(
    operation: &str,
    task_id: Uuid,
    activity_path: &str,
    sequence_number: u64,
    node_id: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        activity_path = %activity_path,
        sequence_number = sequence_number,
        node_id = %node_id,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🪣 BUCKET_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
