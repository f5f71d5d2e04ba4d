//! Prometheus metrics for the controller.
//!
//! Metrics cover:
//! - Controllership (active controller count, current controller state)
//! - Cluster health (offline partitions, preferred-replica imbalance)
//! - Cluster size (global topic and partition counts)
//! - Event-loop performance (per-event-state processing time)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "castellan"
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors are handled gracefully - if a
//! metric fails to register, a fallback no-op metric is used instead of
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for controller metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("castellan".to_string()), None).unwrap_or_else(|_| Registry::new())
});

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Controllership
// =============================================================================

define_gauge!(
    ACTIVE_CONTROLLER_COUNT,
    "active_controller_count",
    "1 while this broker holds the controllership, 0 otherwise"
);

define_gauge!(
    CONTROLLER_STATE,
    "controller_state",
    "Numeric tag of the event state the controller is currently processing"
);

// =============================================================================
// Cluster Health
// =============================================================================

define_gauge!(
    OFFLINE_PARTITIONS_COUNT,
    "offline_partitions_count",
    "Partitions that currently have no live leader"
);

define_gauge!(
    PREFERRED_REPLICA_IMBALANCE_COUNT,
    "preferred_replica_imbalance_count",
    "Partitions whose current leader is not the preferred replica"
);

define_counter!(
    UNCLEAN_LEADER_ELECTIONS_TOTAL,
    "unclean_leader_elections_total",
    "Leader elections that picked a replica outside the ISR"
);

// =============================================================================
// Cluster Size
// =============================================================================

define_gauge!(
    GLOBAL_TOPIC_COUNT,
    "global_topic_count",
    "Topics known to the controller"
);

define_gauge!(
    GLOBAL_PARTITION_COUNT,
    "global_partition_count",
    "Partitions known to the controller"
);

// =============================================================================
// Event Loop
// =============================================================================

define_histogram_vec!(
    EVENT_PROCESSING_SECONDS,
    "event_processing_seconds",
    "Time spent processing controller events, by event state",
    ["state"],
    [0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
);

// =============================================================================
// Registration Helpers
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(opts!(name, help))
        .unwrap_or_else(|_| IntGauge::new("fallback_gauge", "fallback").unwrap());
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "Failed to register gauge");
    }
    gauge
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(opts!(name, help))
        .unwrap_or_else(|_| IntCounter::new("fallback_counter", "fallback").unwrap());
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register counter");
    }
    counter
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .unwrap_or_else(|_| {
            HistogramVec::new(HistogramOpts::new("fallback_histogram", "fallback"), &["l"]).unwrap()
        });
    if let Err(e) = registry.register(Box::new(histogram.clone())) {
        warn!(metric = name, error = %e, "Failed to register histogram");
    }
    histogram
}

/// Render all controller metrics in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
