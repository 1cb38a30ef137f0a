//! Cost accounting per pipeline run
//!
//! Each tick charges every active run for the window since the last
//! successful tick: usage rate at tick time multiplied by the window length
//! and the configured unit prices. A failed tick does not advance the
//! window, so the next successful tick covers the gap. A rate that changes
//! inside a window is approximated by its value when the tick runs.
//!
//! A run observed in a terminal state gets one final charge, clamped to its
//! completion time, and is frozen afterwards.

use crate::cluster::ClusterStateReader;
use crate::collector::{async_trait, Collector, TickOutcome};
use crate::error::CollectorError;
use crate::health::components;
use crate::metrics::MetricsSnapshot;
use crate::models::{ClusterSnapshot, CostRecord, PipelineRunInfo, RateTable, RunKey};
use crate::observability::{ObserverMetrics, StructuredLogger};
use crate::retention::AbsenceTracker;
use crate::store::{AggregationStore, ViewKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Bytes per GB used by the memory and storage rates (binary gigabyte)
pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

const SECONDS_PER_HOUR: f64 = 3600.0;

impl RateTable {
    /// Build a rate table, rejecting negative or non-finite prices
    pub fn new(cpu_hour: f64, memory_gb_hour: f64, storage_gb_hour: f64) -> Result<Self, CollectorError> {
        for (name, rate) in [
            ("cpu_hour_rate", cpu_hour),
            ("memory_gb_hour_rate", memory_gb_hour),
            ("storage_gb_hour_rate", storage_gb_hour),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(CollectorError::Config(format!(
                    "{} must be a non-negative number, got {}",
                    name, rate
                )));
            }
        }

        Ok(Self {
            cpu_hour,
            memory_gb_hour,
            storage_gb_hour,
        })
    }
}

/// Configuration of the cost collector
#[derive(Debug, Clone)]
pub struct CostConfig {
    pub rates: RateTable,
    /// Counter of consumed CPU seconds, labelled by `namespace` and `pod`
    pub cpu_usage_metric: String,
    /// Gauge of memory in use, labelled by `namespace` and `pod`
    pub memory_usage_metric: String,
    /// How long a record survives after its run disappears from the cluster
    pub run_retention: Duration,
}

impl CostConfig {
    pub fn new(rates: RateTable) -> Self {
        Self {
            rates,
            cpu_usage_metric: "container_cpu_usage_seconds_total".to_string(),
            memory_usage_metric: "container_memory_working_set_bytes".to_string(),
            run_retention: Duration::hours(24),
        }
    }
}

/// Resource consumption over one window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub task_seconds: f64,
    pub cpu_seconds: f64,
    pub memory_byte_seconds: f64,
    pub storage_byte_seconds: f64,
    pub requested_cpu_seconds: f64,
    pub requested_memory_byte_seconds: f64,
}

impl CostRecord {
    fn open(run: &PipelineRunInfo, rates: RateTable, now: DateTime<Utc>) -> Self {
        Self {
            key: run.key.clone(),
            pipeline: run.pipeline.clone(),
            status: run.status,
            started_at: run.start_time,
            task_seconds: 0.0,
            cpu_seconds: 0.0,
            memory_byte_seconds: 0.0,
            storage_byte_seconds: 0.0,
            requested_cpu_seconds: 0.0,
            requested_memory_byte_seconds: 0.0,
            cpu_cost: 0.0,
            memory_cost: 0.0,
            storage_cost: 0.0,
            total_cost: 0.0,
            rates,
            first_seen: now,
            last_updated: now,
            frozen: false,
        }
    }

    /// Add a window's usage and reprice the record
    fn charge(&mut self, usage: Usage) {
        self.task_seconds += usage.task_seconds;
        self.cpu_seconds += usage.cpu_seconds;
        self.memory_byte_seconds += usage.memory_byte_seconds;
        self.storage_byte_seconds += usage.storage_byte_seconds;
        self.requested_cpu_seconds += usage.requested_cpu_seconds;
        self.requested_memory_byte_seconds += usage.requested_memory_byte_seconds;

        self.cpu_cost = self.cpu_seconds / SECONDS_PER_HOUR * self.rates.cpu_hour;
        self.memory_cost =
            self.memory_byte_seconds / BYTES_PER_GB / SECONDS_PER_HOUR * self.rates.memory_gb_hour;
        self.storage_cost = self.storage_byte_seconds / BYTES_PER_GB / SECONDS_PER_HOUR
            * self.rates.storage_gb_hour;
        self.total_cost = self.cpu_cost + self.memory_cost + self.storage_cost;
    }
}

/// Filter for aggregate cost queries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CostQuery {
    pub namespace: Option<String>,
    /// Inclusive lower bound on run start
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on run start
    pub to: Option<DateTime<Utc>>,
}

impl CostQuery {
    pub fn matches(&self, record: &CostRecord) -> bool {
        if let Some(ns) = &self.namespace {
            if &record.key.namespace != ns {
                return false;
            }
        }
        if self.from.is_none() && self.to.is_none() {
            return true;
        }
        let Some(started) = record.started_at else {
            return false;
        };
        self.from.map(|from| started >= from).unwrap_or(true)
            && self.to.map(|to| started < to).unwrap_or(true)
    }
}

/// Sum over matching cost records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostSummary {
    pub run_count: usize,
    pub cpu_cost: f64,
    pub memory_cost: f64,
    pub storage_cost: f64,
    pub total_cost: f64,
}

/// The published cost view
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostSnapshot {
    pub computed_at: Option<DateTime<Utc>>,
    /// Keyed by `namespace/name`
    pub records: BTreeMap<String, CostRecord>,
}

impl CostSnapshot {
    /// Cost of a single run
    pub fn run(&self, key: &RunKey) -> Option<&CostRecord> {
        self.records.get(&key.to_string())
    }

    /// Sum over every record matching the query
    pub fn aggregate(&self, query: &CostQuery) -> CostSummary {
        self.records
            .values()
            .filter(|r| query.matches(r))
            .fold(CostSummary::default(), |mut sum, r| {
                sum.run_count += 1;
                sum.cpu_cost += r.cpu_cost;
                sum.memory_cost += r.memory_cost;
                sum.storage_cost += r.storage_cost;
                sum.total_cost += r.total_cost;
                sum
            })
    }
}

/// Accumulates cost per pipeline run
pub struct CostCollector {
    reader: Arc<dyn ClusterStateReader>,
    store: Arc<AggregationStore>,
    config: CostConfig,
    records: BTreeMap<String, CostRecord>,
    absence: AbsenceTracker,
    last_tick: Option<DateTime<Utc>>,
    metrics: ObserverMetrics,
    logger: StructuredLogger,
}

impl CostCollector {
    pub fn new(
        reader: Arc<dyn ClusterStateReader>,
        store: Arc<AggregationStore>,
        config: CostConfig,
    ) -> Self {
        Self {
            reader,
            store,
            absence: AbsenceTracker::new(config.run_retention),
            config,
            records: BTreeMap::new(),
            last_tick: None,
            metrics: ObserverMetrics::new(),
            logger: StructuredLogger::new(components::COST_COLLECTOR),
        }
    }

    /// Run one accounting pass as of `now`
    pub async fn tick_at(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome<CostSnapshot>, CollectorError> {
        let cluster = self.reader.snapshot().await?;
        let metrics = self.store.read::<MetricsSnapshot>();
        let metrics = metrics.as_ref().map(|p| &p.snapshot);

        let mut present = HashSet::new();
        for run in &cluster.pipeline_runs {
            let id = run.key.to_string();
            present.insert(id.clone());

            if self.records.get(&id).map(|r| r.frozen).unwrap_or(false) {
                continue;
            }
            let Some(run_start) = run.start_time else {
                continue;
            };

            let window_start = self.last_tick.unwrap_or(run_start).max(run_start);
            let window_end = if run.status.is_terminal() {
                run.completion_time.unwrap_or(now).min(now)
            } else {
                now
            };
            let usage = window_usage(&cluster, run, metrics, &self.config, window_start, window_end);

            let rates = self.config.rates;
            let record = self
                .records
                .entry(id)
                .or_insert_with(|| CostRecord::open(run, rates, now));
            record.charge(usage);
            record.status = run.status;
            record.last_updated = now;

            if run.status.is_terminal() {
                record.frozen = true;
                self.logger.log_run_frozen(ViewKind::Cost, &run.key);
            }
        }

        self.collect_garbage(&present, now);
        self.last_tick = Some(now);
        self.metrics.set_cost_records_tracked(self.records.len());

        Ok(TickOutcome::Publish(CostSnapshot {
            computed_at: Some(now),
            records: self.records.clone(),
        }))
    }

    /// Evict records whose run has been gone for the retention window
    fn collect_garbage(&mut self, present: &HashSet<String>, now: DateTime<Utc>) {
        for id in self.absence.sweep(self.records.keys(), present, now) {
            debug!(run = %id, "Evicting cost record of deleted run");
            self.records.remove(&id);
        }
    }
}

/// Usage of one run between `start` and `end`
fn window_usage(
    cluster: &ClusterSnapshot,
    run: &PipelineRunInfo,
    metrics: Option<&MetricsSnapshot>,
    config: &CostConfig,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Usage {
    let mut usage = Usage::default();
    if end <= start {
        return usage;
    }

    usage.storage_byte_seconds = run.storage_request_bytes * seconds_between(start, end);

    for task in cluster.task_runs_for(&run.key) {
        let Some(task_start) = task.start_time else {
            continue;
        };
        let task_end = task.completion_time.unwrap_or(end);
        let overlap = seconds_between(task_start.max(start), task_end.min(end));
        if overlap <= 0.0 {
            continue;
        }

        let observed = task.pod_name.as_deref().and_then(|pod| {
            let matchers = [("namespace", task.namespace.as_str()), ("pod", pod)];
            let metrics = metrics?;
            let cpu = metrics
                .find_one(&config.cpu_usage_metric, &matchers)
                .and_then(|s| s.counter_rate());
            let memory = metrics
                .find_one(&config.memory_usage_metric, &matchers)
                .map(|s| s.latest);
            Some((cpu, memory))
        });
        let (cpu_cores, memory_bytes) = match observed {
            Some((cpu, memory)) => (
                cpu.unwrap_or(task.requests.cpu_cores),
                memory.unwrap_or(task.requests.memory_bytes),
            ),
            None => (task.requests.cpu_cores, task.requests.memory_bytes),
        };

        usage.task_seconds += overlap;
        usage.cpu_seconds += cpu_cores * overlap;
        usage.memory_byte_seconds += memory_bytes * overlap;
        usage.requested_cpu_seconds += task.requests.cpu_cores * overlap;
        usage.requested_memory_byte_seconds += task.requests.memory_bytes * overlap;
    }

    usage
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    ((end - start).num_milliseconds() as f64 / 1000.0).max(0.0)
}

#[async_trait]
impl Collector for CostCollector {
    type Snapshot = CostSnapshot;

    fn name(&self) -> &'static str {
        components::COST_COLLECTOR
    }

    async fn tick(&mut self) -> Result<TickOutcome<CostSnapshot>, CollectorError> {
        self.tick_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricsCollector, MetricsConfig};
    use crate::models::{ResourceRequests, RunStatus};
    use crate::testing::{at, pipeline_run, task_run, MockClusterReader, ScriptedSource};

    fn rates(cpu: f64, memory: f64, storage: f64) -> RateTable {
        RateTable::new(cpu, memory, storage).unwrap()
    }

    fn collector(reader: Arc<MockClusterReader>, rates: RateTable) -> CostCollector {
        CostCollector::new(reader, Arc::new(AggregationStore::new()), CostConfig::new(rates))
    }

    fn published(outcome: TickOutcome<CostSnapshot>) -> CostSnapshot {
        match outcome {
            TickOutcome::Publish(snapshot) => snapshot,
            TickOutcome::Retain => panic!("expected a snapshot"),
        }
    }

    fn one_core_task(run: &str, start: i64, end: Option<i64>) -> crate::models::TaskRunInfo {
        let mut task = task_run("ci", run, "compile", start, end);
        task.requests = ResourceRequests {
            cpu_cores: 1.0,
            memory_bytes: 0.0,
        };
        task
    }

    #[test]
    fn test_rate_table_validation() {
        assert!(RateTable::new(0.05, 0.0, 0.0).is_ok());
        assert!(RateTable::new(-0.01, 0.0, 0.0).is_err());
        assert!(RateTable::new(0.05, f64::NAN, 0.0).is_err());
        assert!(RateTable::new(0.05, 0.0, f64::INFINITY).is_err());
    }

    #[tokio::test]
    async fn test_two_cpu_hours_at_five_cents() {
        let reader = Arc::new(MockClusterReader::default());
        reader.set_runs(
            vec![pipeline_run("ci", "build-123", RunStatus::Succeeded, 0, Some(7200))],
            vec![one_core_task("build-123", 0, Some(7200))],
        );

        let mut collector = collector(reader, rates(0.05, 0.01, 0.01));
        let snapshot = published(collector.tick_at(at(7300)).await.unwrap());
        let record = snapshot.run(&RunKey::new("ci", "build-123")).unwrap();

        assert_eq!(record.cpu_seconds, 7200.0);
        assert_eq!(record.cpu_cost, 0.1);
        assert_eq!(record.memory_cost, 0.0);
        assert_eq!(record.storage_cost, 0.0);
        assert_eq!(record.total_cost, 0.1);
        assert_eq!(record.total_cost, record.cpu_cost + record.memory_cost + record.storage_cost);
        assert!(record.frozen);
    }

    #[tokio::test]
    async fn test_running_cost_is_monotonic_and_total_is_exact_sum() {
        let reader = Arc::new(MockClusterReader::default());
        let mut run = pipeline_run("ci", "build-1", RunStatus::Running, 0, None);
        run.storage_request_bytes = BYTES_PER_GB;
        let mut task = one_core_task("build-1", 0, None);
        task.requests.memory_bytes = 512.0 * 1024.0 * 1024.0;
        reader.set_runs(vec![run], vec![task]);

        let mut collector = collector(reader, rates(0.031611, 0.004237, 0.000137));
        let key = RunKey::new("ci", "build-1");

        let mut previous = 0.0;
        for secs in [30, 60, 95, 120] {
            let snapshot = published(collector.tick_at(at(secs)).await.unwrap());
            let record = snapshot.run(&key).unwrap();
            assert!(record.total_cost >= previous);
            assert_eq!(
                record.total_cost,
                record.cpu_cost + record.memory_cost + record.storage_cost
            );
            assert!(!record.frozen);
            previous = record.total_cost;
        }
    }

    #[tokio::test]
    async fn test_failed_tick_window_is_covered_by_next_tick() {
        let reader = Arc::new(MockClusterReader::default());
        reader.set_runs(
            vec![pipeline_run("ci", "build-1", RunStatus::Running, 0, None)],
            vec![one_core_task("build-1", 0, None)],
        );
        let mut collector = collector(Arc::clone(&reader), rates(0.05, 0.0, 0.0));

        collector.tick_at(at(30)).await.unwrap();
        reader.fail_next(1);
        assert!(collector.tick_at(at(60)).await.is_err());
        let snapshot = published(collector.tick_at(at(90)).await.unwrap());

        let record = snapshot.run(&RunKey::new("ci", "build-1")).unwrap();
        assert_eq!(record.cpu_seconds, 90.0);
    }

    #[tokio::test]
    async fn test_terminal_run_is_reconciled_once_then_frozen() {
        let reader = Arc::new(MockClusterReader::default());
        reader.set_runs(
            vec![pipeline_run("ci", "build-1", RunStatus::Running, 0, None)],
            vec![one_core_task("build-1", 0, None)],
        );
        let mut collector = collector(Arc::clone(&reader), rates(0.05, 0.0, 0.0));
        collector.tick_at(at(60)).await.unwrap();

        // Finished at 75s; observed at 90s
        reader.set_runs(
            vec![pipeline_run("ci", "build-1", RunStatus::Succeeded, 0, Some(75))],
            vec![one_core_task("build-1", 0, Some(75))],
        );
        let key = RunKey::new("ci", "build-1");
        let reconciled = published(collector.tick_at(at(90)).await.unwrap());
        let record = reconciled.run(&key).unwrap().clone();
        assert_eq!(record.cpu_seconds, 75.0);
        assert!(record.frozen);
        assert_eq!(record.status, RunStatus::Succeeded);

        let later = published(collector.tick_at(at(300)).await.unwrap());
        assert_eq!(later.run(&key).unwrap(), &record);
    }

    #[tokio::test]
    async fn test_observed_usage_preferred_over_requests() {
        let store = Arc::new(AggregationStore::new());
        let metrics_writer = store.writer::<MetricsSnapshot>().unwrap();
        let mut metrics = MetricsCollector::new(
            Arc::new(ScriptedSource::new(vec![
                Ok("container_cpu_usage_seconds_total{namespace=\"ci\",pod=\"build-1-compile-pod\"} 10\n"),
                Ok("container_cpu_usage_seconds_total{namespace=\"ci\",pod=\"build-1-compile-pod\"} 25\n"),
            ])),
            MetricsConfig::default(),
        );
        metrics.tick_at(at(0)).await.unwrap();
        if let TickOutcome::Publish(snapshot) = metrics.tick_at(at(60)).await.unwrap() {
            metrics_writer.publish(snapshot);
        }

        let reader = Arc::new(MockClusterReader::default());
        reader.set_runs(
            vec![pipeline_run("ci", "build-1", RunStatus::Running, 0, None)],
            vec![one_core_task("build-1", 0, None)],
        );
        let mut collector =
            CostCollector::new(reader, store, CostConfig::new(rates(0.05, 0.0, 0.0)));

        let snapshot = published(collector.tick_at(at(100)).await.unwrap());
        let record = snapshot.run(&RunKey::new("ci", "build-1")).unwrap();
        // 0.25 cores observed against 1 core requested
        assert_eq!(record.cpu_seconds, 25.0);
        assert_eq!(record.requested_cpu_seconds, 100.0);
    }

    #[tokio::test]
    async fn test_deleted_runs_evicted_after_retention() {
        let reader = Arc::new(MockClusterReader::default());
        reader.set_runs(
            vec![pipeline_run("ci", "build-1", RunStatus::Succeeded, 0, Some(10))],
            vec![],
        );
        let mut config = CostConfig::new(rates(0.05, 0.0, 0.0));
        config.run_retention = Duration::seconds(100);
        let mut collector = CostCollector::new(
            Arc::clone(&reader) as Arc<dyn ClusterStateReader>,
            Arc::new(AggregationStore::new()),
            config,
        );
        collector.tick_at(at(20)).await.unwrap();

        reader.set_runs(vec![], vec![]);
        let snapshot = published(collector.tick_at(at(50)).await.unwrap());
        assert_eq!(snapshot.records.len(), 1);

        let snapshot = published(collector.tick_at(at(160)).await.unwrap());
        assert!(snapshot.records.is_empty());
    }

    #[test]
    fn test_aggregate_by_namespace_and_time_range() {
        let mut snapshot = CostSnapshot::default();
        for (ns, name, start, cost) in [
            ("ci", "a", 0, 1.0),
            ("ci", "b", 100, 2.0),
            ("prod", "c", 100, 4.0),
        ] {
            let run = pipeline_run(ns, name, RunStatus::Succeeded, start, Some(start + 10));
            let mut record = CostRecord::open(&run, rates(1.0, 0.0, 0.0), at(0));
            record.charge(Usage {
                cpu_seconds: cost * 3600.0,
                ..Default::default()
            });
            snapshot.records.insert(run.key.to_string(), record);
        }

        let all = snapshot.aggregate(&CostQuery::default());
        assert_eq!(all.run_count, 3);
        assert_eq!(all.total_cost, 7.0);

        let ci = snapshot.aggregate(&CostQuery {
            namespace: Some("ci".into()),
            ..Default::default()
        });
        assert_eq!(ci.run_count, 2);
        assert_eq!(ci.cpu_cost, 3.0);

        let late = snapshot.aggregate(&CostQuery {
            namespace: None,
            from: Some(at(50)),
            to: Some(at(200)),
        });
        assert_eq!(late.run_count, 2);
        assert_eq!(late.total_cost, 6.0);
    }
}
