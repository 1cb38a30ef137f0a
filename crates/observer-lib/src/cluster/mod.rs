//! Read-only access to cluster state
//!
//! The collectors see the cluster only through [`ClusterStateReader`].
//! The production implementation talks to the Kubernetes API; tests use
//! in-memory readers. Tekton objects are decoded from their JSON form so
//! that the decoders can be exercised without a cluster.

mod decode;
mod kubernetes;

pub use decode::{decode_pipeline_run, decode_task_run, parse_quantity};
pub use kubernetes::KubeClusterReader;

use crate::error::ClusterError;
use crate::models::{ClusterEvent, ClusterSnapshot, DeploymentReadiness};
use async_trait::async_trait;

/// Label Tekton puts on task runs and pods naming the owning pipeline run
pub const PIPELINE_RUN_LABEL: &str = "tekton.dev/pipelineRun";
/// Label naming the pipeline task a task run executes
pub const PIPELINE_TASK_LABEL: &str = "tekton.dev/pipelineTask";
/// Label naming the pipeline a run was created from
pub const PIPELINE_LABEL: &str = "tekton.dev/pipeline";
/// Label Tekton puts on task run pods
pub const TASK_RUN_LABEL: &str = "tekton.dev/taskRun";

/// Query interface over pipeline runs, task runs and control-plane health
#[async_trait]
pub trait ClusterStateReader: Send + Sync {
    /// Current pipeline runs and task runs across all namespaces
    async fn snapshot(&self) -> Result<ClusterSnapshot, ClusterError>;

    /// Desired and ready replicas of a deployment
    async fn deployment_readiness(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentReadiness, ClusterError>;

    /// Warning events recorded in a namespace
    async fn warning_events(&self, namespace: &str) -> Result<Vec<ClusterEvent>, ClusterError>;
}
