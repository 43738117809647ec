use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "isrgate_cache_hit_total",
            Unit::Count,
            "Artifacts served from the cache, labelled by HIT/STALE/ERROR state."
        );
        describe_counter!(
            "isrgate_cache_miss_total",
            Unit::Count,
            "Cache lookups that fell through to the render pipeline, labelled by reason."
        );
        describe_counter!(
            "isrgate_cache_bypass_total",
            Unit::Count,
            "Requests that skipped the cache because of a bypass header."
        );
        describe_counter!(
            "isrgate_revalidation_enqueued_total",
            Unit::Count,
            "Revalidation messages accepted by the queue."
        );
        describe_counter!(
            "isrgate_revalidation_failed_total",
            Unit::Count,
            "Revalidation messages that could not be enqueued or delivered."
        );
        describe_gauge!(
            "isrgate_revalidation_queue_len",
            Unit::Count,
            "Current number of pending revalidation messages."
        );
        describe_histogram!(
            "isrgate_revalidation_consume_ms",
            Unit::Milliseconds,
            "Revalidation batch latency in milliseconds."
        );
    });
}
