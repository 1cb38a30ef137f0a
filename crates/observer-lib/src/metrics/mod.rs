//! Metrics collection from the execution engine's metrics endpoint
//!
//! Each tick scrapes a text-exposition body, appends the samples to a
//! bounded window per series and publishes an immutable view of every
//! series with its rolling aggregates. A failed scrape or an empty body
//! leaves the previously published view in place.

mod exposition;
mod series;
mod source;

pub use exposition::{parse_exposition, ParsedScrape};
pub use series::MetricSeries;
pub use source::{HttpMetricsSource, MetricsSource, DEFAULT_SCRAPE_TIMEOUT};

use crate::collector::{async_trait, Collector, TickOutcome};
use crate::error::CollectorError;
use crate::health::components;
use crate::models::Labels;
use crate::observability::ObserverMetrics;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Configuration of the metrics collector
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Samples older than this relative to the newest one are evicted
    pub retention: Duration,
    /// Hard cap on samples kept per series
    pub max_samples_per_series: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention: Duration::hours(1),
            max_samples_per_series: 720,
        }
    }
}

/// Identity of a series
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SeriesKey {
    pub name: String,
    pub labels: Labels,
}

/// One retained observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Immutable view of one series with its rolling aggregates
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesView {
    pub name: String,
    pub labels: Labels,
    pub points: Vec<Point>,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub latest: f64,
}

impl SeriesView {
    fn from_series(key: &SeriesKey, series: &MetricSeries) -> Option<Self> {
        let points: Vec<Point> = series
            .iter()
            .map(|s| Point {
                timestamp: s.timestamp,
                value: s.value,
            })
            .collect();
        let latest = points.last()?.value;

        let (min, max, sum) = points.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), p| (min.min(p.value), max.max(p.value), sum + p.value),
        );

        Some(Self {
            name: key.name.clone(),
            labels: key.labels.clone(),
            count: points.len(),
            mean: sum / points.len() as f64,
            points,
            min,
            max,
            latest,
        })
    }

    /// Whether every `(label, value)` matcher is present on the series
    pub fn matches(&self, matchers: &[(&str, &str)]) -> bool {
        matchers
            .iter()
            .all(|(k, v)| self.labels.get(*k).map(String::as_str) == Some(*v))
    }

    /// Per-second increase between the two newest points of a counter.
    /// `None` on a counter reset or with fewer than two points.
    pub fn counter_rate(&self) -> Option<f64> {
        let [.., prev, last] = self.points.as_slice() else {
            return None;
        };
        let elapsed = (last.timestamp - prev.timestamp).num_milliseconds() as f64 / 1000.0;
        let delta = last.value - prev.value;
        if elapsed <= 0.0 || delta < 0.0 {
            return None;
        }
        Some(delta / elapsed)
    }
}

/// The published metrics view
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub scraped_at: Option<DateTime<Utc>>,
    pub sample_count: usize,
    pub skipped_lines: usize,
    /// Sorted by name, then labels
    pub series: Vec<SeriesView>,
}

impl MetricsSnapshot {
    /// Series with the given name carrying all matchers
    pub fn find<'a>(
        &'a self,
        name: &'a str,
        matchers: &'a [(&'a str, &'a str)],
    ) -> impl Iterator<Item = &'a SeriesView> {
        self.series
            .iter()
            .filter(move |s| s.name == name && s.matches(matchers))
    }

    /// First series with the given name carrying all matchers
    pub fn find_one(&self, name: &str, matchers: &[(&str, &str)]) -> Option<&SeriesView> {
        self.series
            .iter()
            .find(|s| s.name == name && s.matches(matchers))
    }

    /// Every series labelled with a pipeline
    pub fn for_pipeline<'a>(&'a self, pipeline: &'a str) -> impl Iterator<Item = &'a SeriesView> {
        self.series
            .iter()
            .filter(move |s| s.labels.get("pipeline").map(String::as_str) == Some(pipeline))
    }

    /// Every series labelled with a pipeline's task
    pub fn for_task<'a>(
        &'a self,
        pipeline: &'a str,
        task: &'a str,
    ) -> impl Iterator<Item = &'a SeriesView> {
        self.for_pipeline(pipeline)
            .filter(move |s| s.labels.get("task").map(String::as_str) == Some(task))
    }
}

/// Scrapes the metrics endpoint and maintains per-series windows
pub struct MetricsCollector {
    source: Arc<dyn MetricsSource>,
    config: MetricsConfig,
    series: HashMap<SeriesKey, MetricSeries>,
    metrics: ObserverMetrics,
}

impl MetricsCollector {
    pub fn new(source: Arc<dyn MetricsSource>, config: MetricsConfig) -> Self {
        Self {
            source,
            config,
            series: HashMap::new(),
            metrics: ObserverMetrics::new(),
        }
    }

    /// Probe the endpoint once; an unreachable endpoint at startup is a
    /// configuration error for this collector
    pub async fn verify_endpoint(&self) -> Result<(), CollectorError> {
        self.source.fetch().await.map(|_| ()).map_err(|e| {
            CollectorError::Config(format!(
                "metrics endpoint {} unreachable at startup: {}",
                self.source.describe(),
                e
            ))
        })
    }

    /// Run one scrape as of `now`
    pub async fn tick_at(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome<MetricsSnapshot>, CollectorError> {
        let body = self.source.fetch().await?;
        if body.trim().is_empty() {
            debug!(source = %self.source.describe(), "Metrics endpoint returned an empty body");
            return Ok(TickOutcome::Retain);
        }

        let parsed = parse_exposition(&body, now);
        if parsed.skipped_lines > 0 {
            debug!(skipped = parsed.skipped_lines, "Skipped malformed exposition lines");
            self.metrics.add_exposition_lines_skipped(parsed.skipped_lines);
        }
        if parsed.non_finite_samples > 0 {
            debug!(dropped = parsed.non_finite_samples, "Dropped non-finite samples");
        }
        if parsed.samples.is_empty() {
            return Ok(TickOutcome::Retain);
        }

        let sample_count = parsed.samples.len();
        for sample in parsed.samples {
            let key = SeriesKey {
                name: sample.name.clone(),
                labels: sample.labels.clone(),
            };
            self.series
                .entry(key)
                .or_insert_with(|| {
                    MetricSeries::new(self.config.retention, self.config.max_samples_per_series)
                })
                .push(sample);
        }

        // Series that stopped reporting age out entirely
        let cutoff = now - self.config.retention;
        self.series
            .retain(|_, s| s.latest_timestamp().map(|t| t >= cutoff).unwrap_or(false));
        self.metrics.set_series_tracked(self.series.len());

        Ok(TickOutcome::Publish(self.snapshot(now, sample_count, parsed.skipped_lines)))
    }

    fn snapshot(&self, now: DateTime<Utc>, sample_count: usize, skipped_lines: usize) -> MetricsSnapshot {
        let mut keys: Vec<&SeriesKey> = self.series.keys().collect();
        keys.sort();

        MetricsSnapshot {
            scraped_at: Some(now),
            sample_count,
            skipped_lines,
            series: keys
                .into_iter()
                .filter_map(|k| SeriesView::from_series(k, &self.series[k]))
                .collect(),
        }
    }
}

#[async_trait]
impl Collector for MetricsCollector {
    type Snapshot = MetricsSnapshot;

    fn name(&self) -> &'static str {
        components::METRICS_COLLECTOR
    }

    async fn tick(&mut self) -> Result<TickOutcome<MetricsSnapshot>, CollectorError> {
        self.tick_at(Utc::now()).await
    }
}
