//! Core data models for the pipeline observer

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label set attached to a metric sample
pub type Labels = BTreeMap<String, String>;

/// A single parsed metric observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub labels: Labels,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Execution status shared by pipeline runs, task runs and spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Running,
    Unknown,
}

impl RunStatus {
    /// Terminal runs no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Identity of a pipeline run: namespace plus name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub namespace: String,
    pub name: String,
}

impl RunKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resource requests summed over a pod's containers
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequests {
    pub cpu_cores: f64,
    pub memory_bytes: f64,
}

/// A pipeline run as read from the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunInfo {
    pub key: RunKey,
    pub uid: String,
    pub pipeline: String,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    /// Declared `runAfter` edges keyed by pipeline task name
    pub declared_dependencies: Option<BTreeMap<String, Vec<String>>>,
    /// Storage requested by workspace volume claim templates
    pub storage_request_bytes: f64,
}

/// A task run as read from the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunInfo {
    pub namespace: String,
    pub name: String,
    pub pipeline_run: Option<String>,
    pub pipeline_task: Option<String>,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub pod_name: Option<String>,
    pub requests: ResourceRequests,
}

impl TaskRunInfo {
    /// Name used for this task inside its pipeline
    pub fn task_name(&self) -> &str {
        self.pipeline_task.as_deref().unwrap_or(&self.name)
    }
}

/// Everything the run-oriented collectors need from one cluster read
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub pipeline_runs: Vec<PipelineRunInfo>,
    pub task_runs: Vec<TaskRunInfo>,
}

impl ClusterSnapshot {
    /// Task runs owned by a pipeline run
    pub fn task_runs_for<'a>(&'a self, run: &'a RunKey) -> impl Iterator<Item = &'a TaskRunInfo> {
        self.task_runs.iter().filter(move |tr| {
            tr.namespace == run.namespace && tr.pipeline_run.as_deref() == Some(run.name.as_str())
        })
    }
}

/// Per-unit prices used to turn usage into cost
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateTable {
    pub cpu_hour: f64,
    pub memory_gb_hour: f64,
    pub storage_gb_hour: f64,
}

/// Accumulated cost of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub key: RunKey,
    pub pipeline: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Wall-clock seconds summed over the run's task pods
    pub task_seconds: f64,
    pub cpu_seconds: f64,
    pub memory_byte_seconds: f64,
    pub storage_byte_seconds: f64,
    pub requested_cpu_seconds: f64,
    pub requested_memory_byte_seconds: f64,
    pub cpu_cost: f64,
    pub memory_cost: f64,
    pub storage_cost: f64,
    pub total_cost: f64,
    pub rates: RateTable,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub frozen: bool,
}

/// Edge source used when assembling a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencySource {
    Declared,
    Timing,
}

/// Execution window of one task run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub trace_id: String,
    pub name: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub depends_on: Vec<String>,
}

impl Span {
    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms)
    }
}

/// Reconstructed execution of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub uid: String,
    pub pipeline: String,
    pub namespace: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub dependency_source: DependencySource,
    pub spans: Vec<Span>,
}

impl Trace {
    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms)
    }
}

/// Insight classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    CostAnomaly,
    PerformanceRegression,
    ResourceWaste,
    Recommendation,
}

impl std::str::FromStr for InsightCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cost_anomaly" => Ok(InsightCategory::CostAnomaly),
            "performance_regression" => Ok(InsightCategory::PerformanceRegression),
            "resource_waste" => Ok(InsightCategory::ResourceWaste),
            "recommendation" => Ok(InsightCategory::Recommendation),
            other => Err(format!("unknown insight category: {}", other)),
        }
    }
}

/// Insight severity, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A derived observation about runs or tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub category: InsightCategory,
    pub severity: Severity,
    pub message: String,
    pub sources: Vec<String>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// Readiness of a control-plane component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    Healthy,
    Degraded,
    Unreachable,
}

/// Replica counts of a control-plane deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReadiness {
    pub desired_replicas: i32,
    pub ready_replicas: i32,
}

/// Last observed health of a control-plane component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneStatus {
    pub component: String,
    pub state: ReadinessState,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A warning event recorded against a cluster object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub namespace: String,
    pub object_name: String,
    pub reason: String,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}
