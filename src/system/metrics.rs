//! Metrics collection for Massive Tree
//!
//! Prometheus counters for orchestrator operations, deadlines and
//! migrations, kept in a crate-local registry so embedding applications can
//! expose them next to their own.

use crate::core::error::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Histogram, HistogramVec, IntCounter, IntCounterVec, Registry,
};
use std::time::Instant;

/// Crate metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Outcome label for successful operations
pub const OUTCOME_OK: &str = "ok";

/// Outcome label for failed operations
pub const OUTCOME_ERROR: &str = "error";

/// Centralized metrics for the orchestrator
pub struct Metrics {
    /// Operations by name and outcome
    pub operations: IntCounterVec,
    /// Deadline expiries by operation name
    pub timeouts: IntCounterVec,
    /// Reads answered by an adapter other than the primary
    pub read_fallbacks: IntCounter,
    /// Writes that failed on a non-primary adapter
    pub replica_failures: IntCounter,
    /// Leaves copied by migrations
    pub migrated_leaves: IntCounter,
    /// Leaves that failed to migrate
    pub migration_errors: IntCounter,
    /// Operation duration in seconds by operation name
    pub operation_duration: HistogramVec,
}

impl Metrics {
    /// Register every metric in `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        Ok(Self {
            operations: register_int_counter_vec_with_registry!(
                "mt_operations_total",
                "Orchestrator operations by name and outcome",
                &["operation", "outcome"],
                registry
            )?,
            timeouts: register_int_counter_vec_with_registry!(
                "mt_timeouts_total",
                "Operations abandoned at their deadline",
                &["operation"],
                registry
            )?,
            read_fallbacks: register_int_counter_with_registry!(
                "mt_read_fallbacks_total",
                "Reads served by a non-primary adapter",
                registry
            )?,
            replica_failures: register_int_counter_with_registry!(
                "mt_replica_failures_total",
                "Writes that failed on a non-primary adapter",
                registry
            )?,
            migrated_leaves: register_int_counter_with_registry!(
                "mt_migrated_leaves_total",
                "Leaves copied by migrations",
                registry
            )?,
            migration_errors: register_int_counter_with_registry!(
                "mt_migration_errors_total",
                "Leaves that failed to migrate",
                registry
            )?,
            operation_duration: register_histogram_vec_with_registry!(
                "mt_operation_duration_seconds",
                "Duration of orchestrator operations in seconds",
                &["operation"],
                vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
                registry
            )?,
        })
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Metrics {
        static INSTANCE: Lazy<Metrics> =
            Lazy::new(|| Metrics::new(&REGISTRY).expect("Failed to initialize metrics"));
        &INSTANCE
    }

    /// Count one finished operation
    pub fn record(&self, operation: &str, ok: bool) {
        let outcome = if ok { OUTCOME_OK } else { OUTCOME_ERROR };
        self.operations.with_label_values(&[operation, outcome]).inc();
    }

    /// Start timing `operation`
    pub fn timer(&self, operation: &str) -> Timer {
        Timer::start(self.operation_duration.with_label_values(&[operation]))
    }
}

/// Timer for measuring operation duration with automatic histogram recording
pub struct Timer {
    /// Start time of the operation
    start: Instant,
    /// Histogram to record the duration when finished
    histogram: Histogram,
}

impl Timer {
    /// Start a new timer
    pub fn start(histogram: Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    /// Record the elapsed time and consume the timer
    pub fn finish(self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Get the registry holding the crate's metrics
pub fn registry() -> &'static Registry {
    // Make sure everything is registered before anyone gathers
    let _ = Metrics::global();
    &REGISTRY
}

/// Collect all metrics in the Prometheus text exposition format
pub fn gather() -> String {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = registry().gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_text_export() {
        let metrics = Metrics::global();
        metrics.record("get", true);
        metrics.timeouts.with_label_values(&["set"]).inc();
        metrics.timer("get").finish();

        let text = gather();
        assert!(text.contains("mt_operations_total"));
        assert!(text.contains("operation=\"get\""));
        assert!(text.contains("mt_timeouts_total"));
        assert!(text.contains("mt_operation_duration_seconds"));
    }

    #[test]
    fn test_isolated_registry() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        metrics.migrated_leaves.inc_by(3);
        assert_eq!(metrics.migrated_leaves.get(), 3);
        // Registering the same names twice in one registry fails
        assert!(Metrics::new(&registry).is_err());
    }
}
