//! Insights derived from the metrics and cost views
//!
//! [`generate`] is a pure function: the same metrics and cost snapshots
//! always produce the same insights, stamped with the newest input
//! timestamp rather than the wall clock.

mod rules;
mod stats;

pub use rules::{cost_outliers, duration_regressions, idle_requests, right_sizing, RIGHT_SIZING_HEADROOM};
pub use stats::{mean, median};

use crate::collector::{async_trait, Collector, TickOutcome};
use crate::cost::CostSnapshot;
use crate::error::CollectorError;
use crate::health::components;
use crate::metrics::MetricsSnapshot;
use crate::models::{Insight, InsightCategory, Severity};
use crate::observability::{ObserverMetrics, StructuredLogger};
use crate::store::AggregationStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Thresholds of the insight rules
#[derive(Debug, Clone)]
pub struct InsightsConfig {
    /// A run is an outlier above this multiple of its namespace mean
    pub cost_outlier_multiplier: f64,
    /// Other finished runs needed before a namespace mean is trusted
    pub min_runs_for_baseline: usize,
    /// A duration regresses above this multiple of its historical median
    pub regression_multiplier: f64,
    /// Earlier observations needed before a duration series is judged
    pub min_history_samples: usize,
    /// Duration metrics examined for regressions, exported as gauges or histograms
    pub duration_metrics: Vec<String>,
    /// Used/requested CPU below this ratio counts as waste
    pub waste_utilization_ratio: f64,
    /// Runs requesting less CPU time than this are never flagged
    pub min_requested_cpu_seconds: f64,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self {
            cost_outlier_multiplier: 2.0,
            min_runs_for_baseline: 3,
            regression_multiplier: 1.5,
            min_history_samples: 5,
            duration_metrics: vec![
                "tekton_pipelines_controller_taskrun_duration_seconds".to_string(),
                "tekton_pipelines_controller_pipelinerun_duration_seconds".to_string(),
            ],
            waste_utilization_ratio: 0.2,
            min_requested_cpu_seconds: 60.0,
        }
    }
}

/// The published insight view
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsightSnapshot {
    pub generated_at: Option<DateTime<Utc>>,
    pub insights: Vec<Insight>,
}

impl InsightSnapshot {
    /// Insights of a category at or above a severity
    pub fn filter(
        &self,
        category: Option<InsightCategory>,
        min_severity: Option<Severity>,
    ) -> Vec<&Insight> {
        self.insights
            .iter()
            .filter(|i| category.map_or(true, |c| i.category == c))
            .filter(|i| min_severity.map_or(true, |s| i.severity >= s))
            .collect()
    }
}

/// Run every rule over the given snapshots
pub fn generate(
    metrics: Option<&MetricsSnapshot>,
    cost: Option<&CostSnapshot>,
    config: &InsightsConfig,
) -> InsightSnapshot {
    let mut insights = Vec::new();
    if let Some(cost) = cost {
        insights.extend(cost_outliers(cost, config));
    }
    if let Some(metrics) = metrics {
        insights.extend(duration_regressions(metrics, config));
    }
    if let Some(cost) = cost {
        insights.extend(idle_requests(cost, config));
        insights.extend(right_sizing(cost, config));
    }

    let generated_at = metrics
        .and_then(|m| m.scraped_at)
        .max(cost.and_then(|c| c.computed_at));
    for insight in &mut insights {
        insight.generated_at = generated_at;
    }

    insights.sort_by(|a, b| {
        a.category
            .cmp(&b.category)
            .then_with(|| b.severity.cmp(&a.severity))
            .then_with(|| a.sources.cmp(&b.sources))
            .then_with(|| a.message.cmp(&b.message))
    });

    InsightSnapshot {
        generated_at,
        insights,
    }
}

/// Periodically regenerates insights from the published views
pub struct InsightsEngine {
    store: Arc<AggregationStore>,
    config: InsightsConfig,
    reported: HashSet<(InsightCategory, String)>,
    metrics: ObserverMetrics,
    logger: StructuredLogger,
}

impl InsightsEngine {
    pub fn new(store: Arc<AggregationStore>, config: InsightsConfig) -> Self {
        Self {
            store,
            config,
            reported: HashSet::new(),
            metrics: ObserverMetrics::new(),
            logger: StructuredLogger::new(components::INSIGHTS_ENGINE),
        }
    }

    fn evaluate(&mut self) -> TickOutcome<InsightSnapshot> {
        let metrics = self.store.read::<MetricsSnapshot>();
        let cost = self.store.read::<CostSnapshot>();
        if metrics.is_none() && cost.is_none() {
            return TickOutcome::Retain;
        }

        let snapshot = generate(
            metrics.as_ref().map(|p| &p.snapshot),
            cost.as_ref().map(|p| &p.snapshot),
            &self.config,
        );

        // Log each insight once while it persists
        let current: HashSet<(InsightCategory, String)> = snapshot
            .insights
            .iter()
            .map(|i| (i.category, i.sources.join(",")))
            .collect();
        for insight in &snapshot.insights {
            if !self.reported.contains(&(insight.category, insight.sources.join(","))) {
                self.logger.log_insight(insight);
            }
        }
        self.reported = current;
        self.metrics.set_insights_current(snapshot.insights.len());

        TickOutcome::Publish(snapshot)
    }
}

#[async_trait]
impl Collector for InsightsEngine {
    type Snapshot = InsightSnapshot;

    fn name(&self) -> &'static str {
        components::INSIGHTS_ENGINE
    }

    async fn tick(&mut self) -> Result<TickOutcome<InsightSnapshot>, CollectorError> {
        Ok(self.evaluate())
    }
}
