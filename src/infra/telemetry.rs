use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber and describe the exported metrics.
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
            "trellis_cache_hit_total",
            Unit::Count,
            "Total number of cache lookups that found a live entry."
        );
        describe_counter!(
            "trellis_cache_miss_total",
            Unit::Count,
            "Total number of cache lookups that found nothing."
        );
        describe_counter!(
            "trellis_cache_set_total",
            Unit::Count,
            "Total number of cache writes."
        );
        describe_counter!(
            "trellis_cache_evict_total",
            Unit::Count,
            "Total number of cache evictions due to capacity."
        );
        describe_counter!(
            "trellis_cache_error_total",
            Unit::Count,
            "Total number of failed cache operations, excluding misses."
        );
        describe_counter!(
            "trellis_cache_invalidations_total",
            Unit::Count,
            "Total number of post-write cache invalidations."
        );
        describe_counter!(
            "trellis_crud_reads_total",
            Unit::Count,
            "Total number of list and get operations."
        );
        describe_counter!(
            "trellis_crud_writes_total",
            Unit::Count,
            "Total number of records created, updated or deleted."
        );
        describe_histogram!(
            "trellis_http_request_ms",
            Unit::Milliseconds,
            "HTTP request latency in milliseconds."
        );
    });
}
