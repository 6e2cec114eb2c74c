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
            "repcache_cache_hit_total",
            Unit::Count,
            "Total number of fresh cache hits served."
        );
        describe_counter!(
            "repcache_cache_miss_total",
            Unit::Count,
            "Total number of lookups that fell through to origin."
        );
        describe_counter!(
            "repcache_cache_stale_total",
            Unit::Count,
            "Total number of stale copies served after a backend failure."
        );
        describe_counter!(
            "repcache_cache_bypass_total",
            Unit::Count,
            "Total number of requests that skipped the cache on request."
        );
        describe_counter!(
            "repcache_cache_backend_error_total",
            Unit::Count,
            "Total number of failed backend operations, by backend."
        );
        describe_counter!(
            "repcache_cache_write_total",
            Unit::Count,
            "Total number of detached write-backs, by outcome."
        );
        describe_counter!(
            "repcache_memory_evict_total",
            Unit::Count,
            "Total number of in-process entries evicted at capacity."
        );
        describe_gauge!(
            "repcache_backend_disabled",
            Unit::Count,
            "1 once a backend's breaker has opened for this process."
        );
        describe_histogram!(
            "repcache_lookup_ms",
            Unit::Milliseconds,
            "Cache lookup latency in milliseconds, timeouts included."
        );
    });
}
