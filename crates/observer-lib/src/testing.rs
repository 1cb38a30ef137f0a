//! In-memory doubles shared by the unit tests

use crate::cluster::ClusterStateReader;
use crate::error::{ClusterError, CollectorError};
use crate::metrics::MetricsSource;
use crate::models::{
    ClusterEvent, ClusterSnapshot, DeploymentReadiness, PipelineRunInfo, ResourceRequests, RunKey,
    RunStatus, TaskRunInfo,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Fixed test epoch plus `secs`
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
}

/// A pipeline run of the `build` pipeline started at `start` seconds
pub fn pipeline_run(
    namespace: &str,
    name: &str,
    status: RunStatus,
    start: i64,
    end: Option<i64>,
) -> PipelineRunInfo {
    PipelineRunInfo {
        key: RunKey::new(namespace, name),
        uid: format!("uid-{}", name),
        pipeline: "build".to_string(),
        status,
        start_time: Some(at(start)),
        completion_time: end.map(at),
        declared_dependencies: None,
        storage_request_bytes: 0.0,
    }
}

/// A task run owned by `run`, executing pipeline task `task`
pub fn task_run(namespace: &str, run: &str, task: &str, start: i64, end: Option<i64>) -> TaskRunInfo {
    TaskRunInfo {
        namespace: namespace.to_string(),
        name: format!("{}-{}", run, task),
        pipeline_run: Some(run.to_string()),
        pipeline_task: Some(task.to_string()),
        status: if end.is_some() {
            RunStatus::Succeeded
        } else {
            RunStatus::Running
        },
        start_time: Some(at(start)),
        completion_time: end.map(at),
        pod_name: Some(format!("{}-{}-pod", run, task)),
        requests: ResourceRequests::default(),
    }
}

/// Returns scripted scrape bodies in order, then empty bodies
pub struct ScriptedSource {
    responses: Mutex<VecDeque<Result<String, String>>>,
}

impl ScriptedSource {
    pub fn new(responses: Vec<Result<&str, &str>>) -> Self {
        Self {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl MetricsSource for ScriptedSource {
    async fn fetch(&self) -> Result<String, CollectorError> {
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(body)) => Ok(body),
            Some(Err(reason)) => Err(CollectorError::Upstream(reason)),
            None => Ok(String::new()),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Cluster reader backed by mutable in-memory state
#[derive(Default)]
pub struct MockClusterReader {
    snapshot: Mutex<ClusterSnapshot>,
    failures: AtomicUsize,
    deployments: Mutex<HashMap<String, Option<DeploymentReadiness>>>,
    events: Mutex<Vec<ClusterEvent>>,
}

impl MockClusterReader {
    pub fn set_runs(&self, pipeline_runs: Vec<PipelineRunInfo>, task_runs: Vec<TaskRunInfo>) {
        *self.snapshot.lock().unwrap() = ClusterSnapshot {
            pipeline_runs,
            task_runs,
        };
    }

    /// Make the next `n` snapshot reads fail
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_deployment(&self, name: &str, desired: i32, ready: i32) {
        self.deployments.lock().unwrap().insert(
            name.to_string(),
            Some(DeploymentReadiness {
                desired_replicas: desired,
                ready_replicas: ready,
            }),
        );
    }

    /// Make reads of a deployment fail
    pub fn break_deployment(&self, name: &str) {
        self.deployments
            .lock()
            .unwrap()
            .insert(name.to_string(), None);
    }

    pub fn push_event(&self, object_name: &str, reason: &str, message: &str, secs: i64) {
        self.events.lock().unwrap().push(ClusterEvent {
            namespace: "tekton-pipelines".to_string(),
            object_name: object_name.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Some(at(secs)),
        });
    }

    fn unreachable() -> ClusterError {
        ClusterError::Api(kube::Error::Service("connection refused".into()))
    }
}

#[async_trait]
impl ClusterStateReader for MockClusterReader {
    async fn snapshot(&self) -> Result<ClusterSnapshot, ClusterError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::unreachable());
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn deployment_readiness(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<DeploymentReadiness, ClusterError> {
        match self.deployments.lock().unwrap().get(name) {
            Some(Some(readiness)) => Ok(*readiness),
            _ => Err(Self::unreachable()),
        }
    }

    async fn warning_events(&self, namespace: &str) -> Result<Vec<ClusterEvent>, ClusterError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.namespace == namespace)
            .cloned()
            .collect())
    }
}

/// A frozen cost record of a `build` pipeline run
pub fn cost_record(namespace: &str, name: &str, total_cost: f64) -> crate::models::CostRecord {
    crate::models::CostRecord {
        key: RunKey::new(namespace, name),
        pipeline: "build".to_string(),
        status: RunStatus::Succeeded,
        started_at: Some(at(0)),
        task_seconds: 0.0,
        cpu_seconds: 0.0,
        memory_byte_seconds: 0.0,
        storage_byte_seconds: 0.0,
        requested_cpu_seconds: 0.0,
        requested_memory_byte_seconds: 0.0,
        cpu_cost: total_cost,
        memory_cost: 0.0,
        storage_cost: 0.0,
        total_cost,
        rates: crate::models::RateTable {
            cpu_hour: 0.05,
            memory_gb_hour: 0.0,
            storage_gb_hour: 0.0,
        },
        first_seen: at(0),
        last_updated: at(0),
        frozen: true,
    }
}
