//! Insight rules
//!
//! Every rule is a pure function of the published snapshots. Only frozen
//! cost records take part in the cost based rules, since the cost of a run
//! still in progress is partial.

use super::stats::{mean, median};
use super::InsightsConfig;
use crate::cost::CostSnapshot;
use crate::metrics::{MetricsSnapshot, SeriesView};
use crate::models::{CostRecord, Insight, InsightCategory, Severity};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Headroom applied on top of observed usage when right-sizing requests
pub const RIGHT_SIZING_HEADROOM: f64 = 1.25;

fn finished(cost: &CostSnapshot) -> impl Iterator<Item = &CostRecord> {
    cost.records.values().filter(|r| r.frozen)
}

/// Runs costing well above the mean of their namespace's other runs
pub fn cost_outliers(cost: &CostSnapshot, config: &InsightsConfig) -> Vec<Insight> {
    let mut by_namespace: BTreeMap<&str, Vec<&CostRecord>> = BTreeMap::new();
    for record in finished(cost) {
        by_namespace
            .entry(record.key.namespace.as_str())
            .or_default()
            .push(record);
    }

    let mut insights = Vec::new();
    for records in by_namespace.values() {
        for record in records {
            let others: Vec<f64> = records
                .iter()
                .filter(|r| r.key != record.key)
                .map(|r| r.total_cost)
                .collect();
            if others.len() < config.min_runs_for_baseline {
                continue;
            }
            let Some(baseline) = mean(&others).filter(|m| *m > 0.0) else {
                continue;
            };

            let ratio = record.total_cost / baseline;
            if ratio <= config.cost_outlier_multiplier {
                continue;
            }
            let severity = if ratio > 2.0 * config.cost_outlier_multiplier {
                Severity::Critical
            } else {
                Severity::Warning
            };

            insights.push(Insight {
                category: InsightCategory::CostAnomaly,
                severity,
                message: format!(
                    "Run {} cost {:.4}, {:.1}x the mean of {:.4} over {} other runs in namespace {}",
                    record.key,
                    record.total_cost,
                    ratio,
                    baseline,
                    others.len(),
                    record.key.namespace
                ),
                sources: vec![record.key.to_string()],
                generated_at: None,
            });
        }
    }

    insights
}

/// Latest duration well above the median of the earlier ones.
///
/// A duration metric is exported either as a gauge holding the last
/// value or as a histogram. Gauge history keeps one entry per change of
/// value, so repeated scrapes of the same run count once. Histogram
/// history is the mean duration of the runs completed between two
/// consecutive scrapes, taken from the `_sum` and `_count` deltas.
pub fn duration_regressions(metrics: &MetricsSnapshot, config: &InsightsConfig) -> Vec<Insight> {
    let mut insights = Vec::new();
    for name in &config.duration_metrics {
        for series in metrics.series.iter().filter(|s| &s.name == name) {
            insights.extend(duration_regression(series, name, &gauge_durations(series), config));
        }

        let sum_name = format!("{}_sum", name);
        let count_name = format!("{}_count", name);
        for sum in metrics.series.iter().filter(|s| s.name == sum_name) {
            let Some(count) = metrics
                .series
                .iter()
                .find(|s| s.name == count_name && s.labels == sum.labels)
            else {
                continue;
            };
            let durations = histogram_durations(sum, count);
            insights.extend(duration_regression(sum, name, &durations, config));
        }
    }
    insights
}

fn gauge_durations(series: &SeriesView) -> Vec<f64> {
    let mut values: Vec<f64> = series.points.iter().map(|p| p.value).collect();
    values.dedup();
    values
}

fn histogram_durations(sum: &SeriesView, count: &SeriesView) -> Vec<f64> {
    let counts: BTreeMap<DateTime<Utc>, f64> = count
        .points
        .iter()
        .map(|p| (p.timestamp, p.value))
        .collect();
    let paired: Vec<(f64, f64)> = sum
        .points
        .iter()
        .filter_map(|p| counts.get(&p.timestamp).map(|c| (p.value, *c)))
        .collect();

    // Intervals without completions or across a counter reset yield nothing
    paired
        .windows(2)
        .filter_map(|w| {
            let delta_sum = w[1].0 - w[0].0;
            let delta_count = w[1].1 - w[0].1;
            (delta_count > 0.0 && delta_sum >= 0.0).then(|| delta_sum / delta_count)
        })
        .collect()
}

fn duration_regression(
    series: &SeriesView,
    metric: &str,
    durations: &[f64],
    config: &InsightsConfig,
) -> Option<Insight> {
    let (latest, earlier) = durations.split_last()?;
    if earlier.len() < config.min_history_samples {
        return None;
    }

    let p50 = median(earlier).filter(|m| *m > 0.0)?;
    let ratio = latest / p50;
    if ratio <= config.regression_multiplier {
        return None;
    }

    let subject = subject_of(series, metric);
    let severity = if ratio > 2.0 * config.regression_multiplier {
        Severity::Critical
    } else {
        Severity::Warning
    };

    Some(Insight {
        category: InsightCategory::PerformanceRegression,
        severity,
        message: format!(
            "{} took {:.1}s, {:.1}x its median of {:.1}s over {} earlier observations",
            subject,
            latest,
            ratio,
            p50,
            earlier.len()
        ),
        sources: vec![subject],
        generated_at: None,
    })
}

/// Human-readable identity of a duration series
fn subject_of(series: &SeriesView, metric: &str) -> String {
    let label = |key: &str| series.labels.get(key).map(String::as_str);
    match (label("namespace"), label("pipeline"), label("task")) {
        (Some(ns), Some(p), Some(t)) => format!("Task {}/{}/{}", ns, p, t),
        (None, Some(p), Some(t)) => format!("Task {}/{}", p, t),
        (Some(ns), Some(p), None) => format!("Pipeline {}/{}", ns, p),
        (None, Some(p), None) => format!("Pipeline {}", p),
        _ => {
            let labels: Vec<String> = series
                .labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{}{{{}}}", metric, labels.join(","))
        }
    }
}

fn is_wasteful(record: &CostRecord, config: &InsightsConfig) -> bool {
    record.requested_cpu_seconds >= config.min_requested_cpu_seconds
        && record.cpu_seconds / record.requested_cpu_seconds < config.waste_utilization_ratio
}

/// Runs that used a small fraction of the CPU they requested
pub fn idle_requests(cost: &CostSnapshot, config: &InsightsConfig) -> Vec<Insight> {
    finished(cost)
        .filter(|r| is_wasteful(r, config))
        .map(|record| Insight {
            category: InsightCategory::ResourceWaste,
            severity: Severity::Warning,
            message: format!(
                "Run {} used {:.0}% of its requested CPU ({:.0} of {:.0} CPU-seconds)",
                record.key,
                100.0 * record.cpu_seconds / record.requested_cpu_seconds,
                record.cpu_seconds,
                record.requested_cpu_seconds
            ),
            sources: vec![record.key.to_string()],
            generated_at: None,
        })
        .collect()
}

/// CPU request suggestions for pipelines that repeatedly over-request
pub fn right_sizing(cost: &CostSnapshot, config: &InsightsConfig) -> Vec<Insight> {
    let mut by_pipeline: BTreeMap<(&str, &str), Vec<&CostRecord>> = BTreeMap::new();
    for record in finished(cost).filter(|r| is_wasteful(r, config) && r.task_seconds > 0.0) {
        by_pipeline
            .entry((record.key.namespace.as_str(), record.pipeline.as_str()))
            .or_default()
            .push(record);
    }

    by_pipeline
        .into_iter()
        .filter(|(_, runs)| runs.len() >= 2)
        .filter_map(|((namespace, pipeline), runs)| {
            let used: Vec<f64> = runs.iter().map(|r| r.cpu_seconds / r.task_seconds).collect();
            let requested: Vec<f64> = runs
                .iter()
                .map(|r| r.requested_cpu_seconds / r.task_seconds)
                .collect();
            let used = mean(&used)?;
            let requested = mean(&requested)?;
            let suggested = used * RIGHT_SIZING_HEADROOM;

            let mut sources: Vec<String> = runs.iter().map(|r| r.key.to_string()).collect();
            sources.sort();

            Some(Insight {
                category: InsightCategory::Recommendation,
                severity: Severity::Info,
                message: format!(
                    "Pipeline {}/{} averaged {:.3} used of {:.3} requested CPU cores over {} runs; consider requesting {:.3} cores",
                    namespace,
                    pipeline,
                    used,
                    requested,
                    runs.len(),
                    suggested
                ),
                sources,
                generated_at: None,
            })
        })
        .collect()
}
