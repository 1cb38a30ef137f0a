//! Observability infrastructure for the pipeline observer
//!
//! Provides:
//! - Prometheus self-metrics (tick latency, tick errors, snapshot publishes, view sizes)
//! - Structured JSON logging of notable events with tracing

use crate::models::{Insight, ReadinessState, RunKey};
use crate::store::ViewKind;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for tick durations (in seconds)
const TICK_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ObserverMetricsInner> = OnceLock::new();

struct ObserverMetricsInner {
    tick_duration_seconds: HistogramVec,
    tick_errors: IntCounterVec,
    snapshots_published: IntCounterVec,
    series_tracked: IntGauge,
    exposition_lines_skipped: IntCounter,
    traces_tracked: IntGauge,
    cost_records_tracked: IntGauge,
    insights_current: IntGauge,
}

impl ObserverMetricsInner {
    fn new() -> Self {
        Self {
            tick_duration_seconds: register_histogram_vec!(
                "pipeline_observer_tick_duration_seconds",
                "Time spent in one collector tick",
                &["collector"],
                TICK_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),

            tick_errors: register_int_counter_vec!(
                "pipeline_observer_tick_errors_total",
                "Collector ticks that failed and kept the previous snapshot",
                &["collector"]
            )
            .expect("Failed to register tick_errors"),

            snapshots_published: register_int_counter_vec!(
                "pipeline_observer_snapshots_published_total",
                "Snapshots published into the aggregation store",
                &["view"]
            )
            .expect("Failed to register snapshots_published"),

            series_tracked: register_int_gauge!(
                "pipeline_observer_series_tracked",
                "Metric series currently retained"
            )
            .expect("Failed to register series_tracked"),

            exposition_lines_skipped: register_int_counter!(
                "pipeline_observer_exposition_lines_skipped_total",
                "Malformed exposition lines skipped while scraping"
            )
            .expect("Failed to register exposition_lines_skipped"),

            traces_tracked: register_int_gauge!(
                "pipeline_observer_traces_tracked",
                "Traces in the current trace snapshot"
            )
            .expect("Failed to register traces_tracked"),

            cost_records_tracked: register_int_gauge!(
                "pipeline_observer_cost_records_tracked",
                "Cost records in the current cost snapshot"
            )
            .expect("Failed to register cost_records_tracked"),

            insights_current: register_int_gauge!(
                "pipeline_observer_insights_current",
                "Insights in the current insight snapshot"
            )
            .expect("Failed to register insights_current"),
        }
    }
}

/// Observer metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ObserverMetrics {
    _private: (),
}

impl Default for ObserverMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ObserverMetricsInner {
        GLOBAL_METRICS.get_or_init(ObserverMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, collector: &str, duration_secs: f64) {
        self.inner()
            .tick_duration_seconds
            .with_label_values(&[collector])
            .observe(duration_secs);
    }

    pub fn inc_tick_errors(&self, collector: &str) {
        self.inner().tick_errors.with_label_values(&[collector]).inc();
    }

    pub fn inc_snapshots_published(&self, view: ViewKind) {
        self.inner()
            .snapshots_published
            .with_label_values(&[&view.to_string()])
            .inc();
    }

    pub fn set_series_tracked(&self, count: usize) {
        self.inner().series_tracked.set(count as i64);
    }

    pub fn add_exposition_lines_skipped(&self, count: usize) {
        self.inner().exposition_lines_skipped.inc_by(count as u64);
    }

    pub fn set_traces_tracked(&self, count: usize) {
        self.inner().traces_tracked.set(count as i64);
    }

    pub fn set_cost_records_tracked(&self, count: usize) {
        self.inner().cost_records_tracked.set(count as i64);
    }

    pub fn set_insights_current(&self, count: usize) {
        self.inner().insights_current.set(count as i64);
    }
}

/// Structured logger for observer events
///
/// Provides consistent JSON-formatted logging for lifecycle changes,
/// frozen runs and generated insights.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log observer startup
    pub fn log_startup(&self, version: &str, collectors: &[&str]) {
        info!(
            event = "observer_started",
            instance = %self.instance,
            version = %version,
            collectors = ?collectors,
            "Pipeline observer started"
        );
    }

    /// Log observer shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "observer_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Pipeline observer shutting down"
        );
    }

    /// Log a collector that was not started because of a configuration error
    pub fn log_collector_disabled(&self, collector: &str, reason: &str) {
        error!(
            event = "collector_disabled",
            instance = %self.instance,
            collector = %collector,
            reason = %reason,
            "Collector disabled at startup"
        );
    }

    /// Log a run whose view entry will no longer change
    pub fn log_run_frozen(&self, view: ViewKind, run: &RunKey) {
        info!(
            event = "run_frozen",
            instance = %self.instance,
            view = %view,
            namespace = %run.namespace,
            run = %run.name,
            "Run reached terminal state, view entry frozen"
        );
    }

    /// Log a newly generated insight
    pub fn log_insight(&self, insight: &Insight) {
        info!(
            event = "insight_generated",
            instance = %self.instance,
            category = ?insight.category,
            severity = %insight.severity,
            sources = ?insight.sources,
            "{}",
            insight.message
        );
    }

    /// Log a control-plane component changing readiness
    pub fn log_control_plane_transition(
        &self,
        component: &str,
        previous: Option<ReadinessState>,
        current: ReadinessState,
    ) {
        if current == ReadinessState::Healthy {
            info!(
                event = "control_plane_transition",
                instance = %self.instance,
                component = %component,
                previous = ?previous,
                current = ?current,
                "Control-plane component readiness changed"
            );
        } else {
            warn!(
                event = "control_plane_transition",
                instance = %self.instance,
                component = %component,
                previous = ?previous,
                current = ?current,
                "Control-plane component readiness changed"
            );
        }
    }
}
