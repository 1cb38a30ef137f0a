//! Execution traces of pipeline runs
//!
//! A trace is rebuilt from cluster state on every tick while its run is
//! active. The first tick that sees the run terminal builds it one last
//! time and freezes it; frozen traces are served as-is until the run has
//! been gone from the cluster for the retention window.

use crate::cluster::ClusterStateReader;
use crate::collector::{async_trait, Collector, TickOutcome};
use crate::error::CollectorError;
use crate::health::components;
use crate::models::{DependencySource, PipelineRunInfo, Span, TaskRunInfo, Trace};
use crate::observability::{ObserverMetrics, StructuredLogger};
use crate::retention::AbsenceTracker;
use crate::store::ViewKind;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// The published trace view
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceSnapshot {
    pub built_at: Option<DateTime<Utc>>,
    /// Most recent start first
    pub traces: Vec<Trace>,
}

impl TraceSnapshot {
    pub fn list(&self) -> &[Trace] {
        &self.traces
    }

    /// Trace by id (`namespace/name`)
    pub fn get(&self, id: &str) -> Option<&Trace> {
        self.traces.iter().find(|t| t.id == id)
    }
}

/// Assemble the trace of one run from its task runs as of `now`.
/// Returns `None` for a run with nothing to place on a timeline yet.
pub fn build_trace<'a>(
    run: &PipelineRunInfo,
    task_runs: impl IntoIterator<Item = &'a TaskRunInfo>,
    now: DateTime<Utc>,
) -> Option<Trace> {
    let trace_id = run.key.to_string();
    let terminal_end = if run.status.is_terminal() {
        run.completion_time
    } else {
        None
    };

    let mut spans: Vec<Span> = task_runs
        .into_iter()
        .filter_map(|tr| {
            let start = tr.start_time?;
            if matches!(tr.completion_time, Some(end) if end < start) {
                return None;
            }
            Some((tr, start))
        })
        .map(|(tr, start)| {
            let start = run.start_time.map_or(start, |s| start.max(s));
            let start = terminal_end.map_or(start, |limit| start.min(limit));
            let end = match (tr.completion_time, terminal_end) {
                (Some(end), Some(limit)) => Some(end.min(limit).max(start)),
                (None, Some(limit)) => Some(limit.max(start)),
                (end, None) => end,
            };
            Span {
                id: tr.name.clone(),
                trace_id: trace_id.clone(),
                name: tr.task_name().to_string(),
                status: tr.status,
                start_time: start,
                end_time: end,
                duration_ms: millis_between(start, end.unwrap_or(now)),
                depends_on: Vec::new(),
            }
        })
        .collect();
    spans.sort_by(|a, b| (a.start_time, &a.id).cmp(&(b.start_time, &b.id)));

    let start_time = run
        .start_time
        .or_else(|| spans.first().map(|s| s.start_time))?;

    let dependency_source = match &run.declared_dependencies {
        Some(declared) => {
            link_declared(&mut spans, declared);
            DependencySource::Declared
        }
        None => {
            link_by_timing(&mut spans);
            DependencySource::Timing
        }
    };

    // A running trace ends where its latest span does, open spans ending now
    let end = terminal_end.unwrap_or_else(|| {
        spans
            .iter()
            .map(|s| s.end_time.unwrap_or(now))
            .max()
            .unwrap_or(start_time)
    });

    Some(Trace {
        id: trace_id,
        uid: run.uid.clone(),
        pipeline: run.pipeline.clone(),
        namespace: run.key.namespace.clone(),
        status: run.status,
        start_time,
        end_time: terminal_end,
        duration_ms: millis_between(start_time, end),
        dependency_source,
        spans,
    })
}

/// Translate `runAfter` edges between pipeline tasks into span ids
fn link_declared(spans: &mut [Span], declared: &BTreeMap<String, Vec<String>>) {
    let ids_by_task: BTreeMap<String, Vec<String>> =
        spans.iter().fold(BTreeMap::new(), |mut acc, s| {
            acc.entry(s.name.clone()).or_default().push(s.id.clone());
            acc
        });

    for span in spans.iter_mut() {
        let Some(parents) = declared.get(&span.name) else {
            continue;
        };
        span.depends_on = parents
            .iter()
            .filter_map(|task| ids_by_task.get(task))
            .flatten()
            .cloned()
            .collect();
        span.depends_on.sort();
    }
}

/// A span depends on the spans that finished last at or before its start
fn link_by_timing(spans: &mut [Span]) {
    let finished: Vec<(String, DateTime<Utc>)> = spans
        .iter()
        .filter_map(|s| s.end_time.map(|end| (s.id.clone(), end)))
        .collect();

    for span in spans.iter_mut() {
        let latest = finished
            .iter()
            .filter(|(id, end)| *id != span.id && *end <= span.start_time)
            .map(|(_, end)| *end)
            .max();
        let Some(latest) = latest else {
            continue;
        };
        span.depends_on = finished
            .iter()
            .filter(|(id, end)| *id != span.id && *end == latest)
            .map(|(id, _)| id.clone())
            .collect();
        span.depends_on.sort();
    }
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}

/// Builds the trace view from cluster state
pub struct TraceCollector {
    reader: Arc<dyn ClusterStateReader>,
    frozen: BTreeMap<String, Trace>,
    absence: AbsenceTracker,
    metrics: ObserverMetrics,
    logger: StructuredLogger,
}

impl TraceCollector {
    pub fn new(reader: Arc<dyn ClusterStateReader>, run_retention: Duration) -> Self {
        Self {
            reader,
            frozen: BTreeMap::new(),
            absence: AbsenceTracker::new(run_retention),
            metrics: ObserverMetrics::new(),
            logger: StructuredLogger::new(components::TRACE_COLLECTOR),
        }
    }

    /// Rebuild every trace as of `now`
    pub async fn tick_at(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome<TraceSnapshot>, CollectorError> {
        let cluster = self.reader.snapshot().await?;

        let mut present = HashSet::new();
        let mut active = Vec::new();
        for run in &cluster.pipeline_runs {
            let id = run.key.to_string();
            present.insert(id.clone());
            if self.frozen.contains_key(&id) {
                continue;
            }

            let Some(trace) = build_trace(run, cluster.task_runs_for(&run.key), now) else {
                continue;
            };
            if run.status.is_terminal() {
                self.logger.log_run_frozen(ViewKind::Trace, &run.key);
                self.frozen.insert(id, trace);
            } else {
                active.push(trace);
            }
        }

        for id in self.absence.sweep(self.frozen.keys(), &present, now) {
            debug!(run = %id, "Evicting trace of deleted run");
            self.frozen.remove(&id);
        }

        let mut traces: Vec<Trace> = self.frozen.values().cloned().chain(active).collect();
        traces.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.id.cmp(&b.id)));
        self.metrics.set_traces_tracked(traces.len());

        Ok(TickOutcome::Publish(TraceSnapshot {
            built_at: Some(now),
            traces,
        }))
    }
}

#[async_trait]
impl Collector for TraceCollector {
    type Snapshot = TraceSnapshot;

    fn name(&self) -> &'static str {
        components::TRACE_COLLECTOR
    }

    async fn tick(&mut self) -> Result<TickOutcome<TraceSnapshot>, CollectorError> {
        self.tick_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use crate::testing::{at, pipeline_run, task_run, MockClusterReader};

    fn published(outcome: TickOutcome<TraceSnapshot>) -> TraceSnapshot {
        match outcome {
            TickOutcome::Publish(snapshot) => snapshot,
            TickOutcome::Retain => panic!("expected a snapshot"),
        }
    }

    #[test]
    fn test_build_123_scenario() {
        let run = pipeline_run("ci", "build-123", RunStatus::Succeeded, 0, Some(20));
        let tasks = vec![
            task_run("ci", "build-123", "test", 5, Some(20)),
            task_run("ci", "build-123", "clone", 0, Some(5)),
        ];

        let trace = build_trace(&run, &tasks, at(60)).unwrap();
        assert_eq!(trace.id, "ci/build-123");
        assert_eq!(trace.status, RunStatus::Succeeded);
        assert_eq!(trace.duration(), Duration::seconds(20));
        assert_eq!(trace.dependency_source, DependencySource::Timing);

        let names: Vec<&str> = trace.spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["clone", "test"]);
        assert!(trace.spans[0].depends_on.is_empty());
        assert_eq!(trace.spans[1].depends_on, vec!["build-123-clone".to_string()]);
        assert_eq!(trace.spans[1].duration(), Duration::seconds(15));
    }

    #[test]
    fn test_declared_dependencies_take_precedence() {
        let mut run = pipeline_run("ci", "build-1", RunStatus::Running, 0, None);
        // lint ran after clone finished but only declares fetch
        run.declared_dependencies = Some(BTreeMap::from([
            ("clone".to_string(), vec![]),
            ("fetch".to_string(), vec![]),
            ("lint".to_string(), vec!["fetch".to_string()]),
        ]));
        let tasks = vec![
            task_run("ci", "build-1", "clone", 0, Some(5)),
            task_run("ci", "build-1", "fetch", 0, Some(3)),
            task_run("ci", "build-1", "lint", 6, None),
        ];

        let trace = build_trace(&run, &tasks, at(10)).unwrap();
        assert_eq!(trace.dependency_source, DependencySource::Declared);
        let lint = trace.spans.iter().find(|s| s.name == "lint").unwrap();
        assert_eq!(lint.depends_on, vec!["build-1-fetch".to_string()]);
        assert_eq!(lint.end_time, None);
        assert_eq!(lint.duration_ms, 4000);
        assert_eq!(trace.end_time, None);
        assert_eq!(trace.duration_ms, 10_000);
    }

    #[test]
    fn test_span_ordering_is_deterministic() {
        let run = pipeline_run("ci", "fan", RunStatus::Running, 0, None);
        let tasks = vec![
            task_run("ci", "fan", "c", 2, None),
            task_run("ci", "fan", "b", 2, None),
            task_run("ci", "fan", "a", 1, None),
        ];

        let first = build_trace(&run, &tasks, at(5)).unwrap();
        let reversed: Vec<_> = tasks.iter().rev().collect();
        let second = build_trace(&run, reversed, at(5)).unwrap();

        let ids: Vec<&str> = first.spans.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["fan-a", "fan-b", "fan-c"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unstarted_and_inverted_task_runs_are_omitted() {
        let run = pipeline_run("ci", "build-1", RunStatus::Running, 0, None);
        let mut pending = task_run("ci", "build-1", "pending", 0, None);
        pending.start_time = None;
        let mut inverted = task_run("ci", "build-1", "inverted", 10, None);
        inverted.completion_time = Some(at(5));
        let ok = task_run("ci", "build-1", "ok", 0, Some(3));

        let trace = build_trace(&run, &[pending, inverted, ok], at(20)).unwrap();
        assert_eq!(trace.spans.len(), 1);
        assert_eq!(trace.spans[0].name, "ok");
    }

    #[test]
    fn test_terminal_spans_clamped_to_run_window() {
        let run = pipeline_run("ci", "build-1", RunStatus::Failed, 0, Some(30));
        let tasks = vec![task_run("ci", "build-1", "hung", 10, None)];

        let trace = build_trace(&run, &tasks, at(500)).unwrap();
        assert_eq!(trace.spans[0].end_time, Some(at(30)));
        assert_eq!(trace.spans[0].duration_ms, 20_000);
        assert_eq!(trace.duration_ms, 30_000);
    }

    #[test]
    fn test_running_trace_ends_at_latest_span() {
        let run = pipeline_run("ci", "build-123", RunStatus::Running, 0, None);
        let tasks = vec![
            task_run("ci", "build-123", "clone", 0, Some(5)),
            task_run("ci", "build-123", "test", 5, Some(20)),
        ];

        let trace = build_trace(&run, &tasks, at(60)).unwrap();
        assert_eq!(trace.end_time, None);
        assert_eq!(trace.duration_ms, 20_000);

        // No spans yet: nothing has elapsed on the timeline
        let empty = build_trace(&run, &Vec::<TaskRunInfo>::new(), at(60)).unwrap();
        assert_eq!(empty.duration_ms, 0);
    }

    #[test]
    fn test_span_starting_after_completion_stays_in_window() {
        let run = pipeline_run("ci", "build-1", RunStatus::Failed, 0, Some(30));
        let tasks = vec![
            task_run("ci", "build-1", "clone", 0, Some(10)),
            task_run("ci", "build-1", "late", 40, Some(50)),
        ];

        let trace = build_trace(&run, &tasks, at(60)).unwrap();
        let trace_end = trace.end_time.unwrap();
        for span in &trace.spans {
            assert!(span.start_time >= trace.start_time && span.start_time <= trace_end);
            let end = span.end_time.unwrap();
            assert!(end >= span.start_time && end <= trace_end);
        }
        let late = trace.spans.iter().find(|s| s.name == "late").unwrap();
        assert_eq!(late.start_time, at(30));
        assert_eq!(late.duration_ms, 0);
    }

    #[tokio::test]
    async fn test_terminal_trace_frozen_and_sorted_recent_first() {
        let reader = Arc::new(MockClusterReader::default());
        reader.set_runs(
            vec![
                pipeline_run("ci", "old", RunStatus::Succeeded, 0, Some(10)),
                pipeline_run("ci", "new", RunStatus::Running, 50, None),
            ],
            vec![
                task_run("ci", "old", "clone", 0, Some(10)),
                task_run("ci", "new", "clone", 50, None),
            ],
        );
        let mut collector = TraceCollector::new(reader.clone(), Duration::hours(1));

        let first = published(collector.tick_at(at(60)).await.unwrap());
        let ids: Vec<&str> = first.list().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["ci/new", "ci/old"]);
        let frozen = first.get("ci/old").unwrap().clone();

        // Late mutations of a finished run are ignored
        reader.set_runs(
            vec![
                pipeline_run("ci", "old", RunStatus::Succeeded, 0, Some(10)),
                pipeline_run("ci", "new", RunStatus::Running, 50, None),
            ],
            vec![
                task_run("ci", "old", "clone", 0, Some(10)),
                task_run("ci", "old", "extra", 2, Some(4)),
                task_run("ci", "new", "clone", 50, None),
            ],
        );
        let second = published(collector.tick_at(at(90)).await.unwrap());
        assert_eq!(second.get("ci/old").unwrap(), &frozen);
        assert_eq!(second.get("ci/new").unwrap().duration_ms, 40_000);
    }

    #[tokio::test]
    async fn test_frozen_trace_evicted_after_retention() {
        let reader = Arc::new(MockClusterReader::default());
        reader.set_runs(
            vec![pipeline_run("ci", "old", RunStatus::Succeeded, 0, Some(10))],
            vec![task_run("ci", "old", "clone", 0, Some(10))],
        );
        let mut collector = TraceCollector::new(reader.clone(), Duration::seconds(60));
        collector.tick_at(at(20)).await.unwrap();

        reader.set_runs(vec![], vec![]);
        let kept = published(collector.tick_at(at(30)).await.unwrap());
        assert!(kept.get("ci/old").is_some());

        let gone = published(collector.tick_at(at(100)).await.unwrap());
        assert!(gone.list().is_empty());
    }

    #[tokio::test]
    async fn test_reader_failure_surfaces_retryable_error() {
        let reader = Arc::new(MockClusterReader::default());
        reader.fail_next(1);
        let mut collector = TraceCollector::new(reader, Duration::hours(1));
        let err = collector.tick_at(at(0)).await.err().unwrap();
        assert!(err.is_retryable());
    }
}
