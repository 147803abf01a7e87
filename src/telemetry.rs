//! Tracing subscriber installation and metric descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

/// Register descriptions for every metric the crate emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "rescore_resource_load_total",
            Unit::Count,
            "Loader invocations started by cached resources."
        );
        describe_counter!(
            "rescore_resource_load_joined_total",
            Unit::Count,
            "Load requests served by joining a load already in flight."
        );
        describe_counter!(
            "rescore_resource_load_error_total",
            Unit::Count,
            "Loader invocations that settled with an error."
        );
        describe_histogram!(
            "rescore_resource_load_ms",
            Unit::Milliseconds,
            "Loader invocation latency in milliseconds."
        );
        describe_counter!(
            "rescore_task_cancelled_total",
            Unit::Count,
            "Tasks cancelled before they settled."
        );
        describe_gauge!(
            "rescore_scheduler_queue_len",
            Unit::Count,
            "Tasks waiting for their id's lane in a task scheduler."
        );
    });
}
