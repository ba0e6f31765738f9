//! Prometheus metrics for the experiment engine
//!
//! Exposes operational counters for monitoring and alerting:
//! - assignment outcomes and event volume
//! - lifecycle transitions
//! - analysis outcomes and latency
//! - storage operations
//!
//! NOTE: test ids, participant ids and identities never appear in labels.
//! Label values come from closed enums only, keeping cardinality bounded.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Allocation Metrics
    // ============================================================================

    /// Assignment decisions by result: "included", "excluded", "existing"
    pub static ref ASSIGNMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shodh_exp_assignments_total", "Total assignment decisions"),
        &["result"]
    ).expect("valid metric definition");

    // ============================================================================
    // Event Metrics
    // ============================================================================

    /// Recorded events by type (custom names collapse to "custom")
    pub static ref EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shodh_exp_events_total", "Total recorded events"),
        &["event_type"]
    ).expect("valid metric definition");

    /// First conversions (the ones that move rollups)
    pub static ref CONVERSIONS_TOTAL: IntCounter = IntCounter::new(
        "shodh_exp_conversions_total",
        "Total first-time participant conversions"
    ).expect("valid metric definition");

    // ============================================================================
    // Lifecycle Metrics
    // ============================================================================

    pub static ref TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shodh_exp_transitions_total", "Total lifecycle transitions"),
        &["to"]
    ).expect("valid metric definition");

    // ============================================================================
    // Analysis Metrics
    // ============================================================================

    /// Analyses by outcome: "completed", "insufficient_sample", "too_few_variants", "error"
    pub static ref ANALYSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shodh_exp_analyses_total", "Total analyses run"),
        &["outcome"]
    ).expect("valid metric definition");

    pub static ref ANALYSIS_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "shodh_exp_analysis_duration_seconds",
            "Analysis duration including rollup load and snapshot write"
        )
        .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1])
    ).expect("valid metric definition");

    // ============================================================================
    // Storage Metrics
    // ============================================================================

    /// Store commits by operation and result ("ok" / "error")
    pub static ref STORE_OPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shodh_exp_store_ops_total", "Total experiment store operations"),
        &["op", "result"]
    ).expect("valid metric definition");
}

/// Register all metrics with the global registry
pub fn register_metrics() -> Result<(), prometheus::Error> {
    METRICS_REGISTRY.register(Box::new(ASSIGNMENTS_TOTAL.clone()))?;

    METRICS_REGISTRY.register(Box::new(EVENTS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(CONVERSIONS_TOTAL.clone()))?;

    METRICS_REGISTRY.register(Box::new(TRANSITIONS_TOTAL.clone()))?;

    METRICS_REGISTRY.register(Box::new(ANALYSES_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(ANALYSIS_DURATION.clone()))?;

    METRICS_REGISTRY.register(Box::new(STORE_OPS_TOTAL.clone()))?;

    Ok(())
}

pub fn record_assignment(result: &str) {
    ASSIGNMENTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_event(event_type: &str, first_conversion: bool) {
    EVENTS_TOTAL.with_label_values(&[event_type]).inc();
    if first_conversion {
        CONVERSIONS_TOTAL.inc();
    }
}

pub fn record_transition(to: &str) {
    TRANSITIONS_TOTAL.with_label_values(&[to]).inc();
}

pub fn record_analysis(outcome: &str) {
    ANALYSES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_store_op(op: &str, ok: bool) {
    STORE_OPS_TOTAL
        .with_label_values(&[op, if ok { "ok" } else { "error" }])
        .inc();
}

/// Helper to time operations with histogram (RAII pattern)
/// Usage: let _timer = Timer::new(ANALYSIS_DURATION.clone());
pub struct Timer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl Timer {
    /// Create timer that records duration to histogram on drop
    pub fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = ASSIGNMENTS_TOTAL.with_label_values(&["excluded"]).get();
        record_assignment("excluded");
        assert_eq!(
            ASSIGNMENTS_TOTAL.with_label_values(&["excluded"]).get(),
            before + 1
        );

        let conversions = CONVERSIONS_TOTAL.get();
        record_event("conversion", true);
        record_event("conversion", false);
        assert_eq!(CONVERSIONS_TOTAL.get(), conversions + 1);
    }

    #[test]
    fn test_registry_exposes_all_families() {
        register_metrics().unwrap();
        record_transition("running");
        record_store_op("insert_test", true);

        let names: Vec<String> = METRICS_REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"shodh_exp_transitions_total".to_string()));
        assert!(names.contains(&"shodh_exp_store_ops_total".to_string()));
        assert!(register_metrics().is_err());
    }

    #[test]
    fn test_timer_observes_on_drop() {
        let before = ANALYSIS_DURATION.get_sample_count();
        {
            let _timer = Timer::new(ANALYSIS_DURATION.clone());
        }
        assert!(ANALYSIS_DURATION.get_sample_count() >= before + 1);
    }
}
