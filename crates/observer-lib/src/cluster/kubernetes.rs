//! Cluster state reader backed by the Kubernetes API

use super::{decode_pipeline_run, decode_task_run, parse_quantity, ClusterStateReader, TASK_RUN_LABEL};
use crate::error::ClusterError;
use crate::models::{
    ClusterEvent, ClusterSnapshot, DeploymentReadiness, ResourceRequests,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::Client;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Reads Tekton runs, pods, deployments and events through a kube client
#[derive(Clone)]
pub struct KubeClusterReader {
    client: Client,
    pipeline_runs: ApiResource,
    task_runs: ApiResource,
}

impl KubeClusterReader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            pipeline_runs: ApiResource::from_gvk(&GroupVersionKind::gvk(
                "tekton.dev",
                "v1",
                "PipelineRun",
            )),
            task_runs: ApiResource::from_gvk(&GroupVersionKind::gvk(
                "tekton.dev",
                "v1",
                "TaskRun",
            )),
        }
    }

    async fn list_dynamic(&self, resource: &ApiResource) -> Result<Vec<Value>, ClusterError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), resource);
        let list = api.list(&ListParams::default()).await?;

        list.items
            .into_iter()
            .map(|obj| {
                serde_json::to_value(obj).map_err(|e| ClusterError::Decode {
                    kind: "DynamicObject",
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Requests of every task run pod keyed by (namespace, pod name)
    async fn task_pod_requests(
        &self,
    ) -> Result<HashMap<(String, String), ResourceRequests>, ClusterError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default().labels(TASK_RUN_LABEL)).await?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| {
                let namespace = pod.metadata.namespace.clone()?;
                let name = pod.metadata.name.clone()?;
                Some(((namespace, name), pod_requests(&pod)))
            })
            .collect())
    }
}

fn pod_requests(pod: &Pod) -> ResourceRequests {
    let mut requests = ResourceRequests::default();
    let Some(spec) = pod.spec.as_ref() else {
        return requests;
    };

    for container in &spec.containers {
        let Some(declared) = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
        else {
            continue;
        };
        if let Some(cpu) = declared.get("cpu").and_then(|q| parse_quantity(&q.0)) {
            requests.cpu_cores += cpu;
        }
        if let Some(memory) = declared.get("memory").and_then(|q| parse_quantity(&q.0)) {
            requests.memory_bytes += memory;
        }
    }

    requests
}

#[async_trait]
impl ClusterStateReader for KubeClusterReader {
    async fn snapshot(&self) -> Result<ClusterSnapshot, ClusterError> {
        let mut snapshot = ClusterSnapshot::default();

        for obj in self.list_dynamic(&self.pipeline_runs).await? {
            match decode_pipeline_run(&obj) {
                Ok(run) => snapshot.pipeline_runs.push(run),
                Err(e) => debug!(error = %e, "Skipping malformed pipeline run"),
            }
        }

        let pod_requests = self.task_pod_requests().await?;
        for obj in self.list_dynamic(&self.task_runs).await? {
            match decode_task_run(&obj) {
                Ok(mut task) => {
                    // Pod requests include injected sidecars, prefer them over step specs
                    if let Some(pod) = &task.pod_name {
                        if let Some(requests) =
                            pod_requests.get(&(task.namespace.clone(), pod.clone()))
                        {
                            task.requests = *requests;
                        }
                    }
                    snapshot.task_runs.push(task);
                }
                Err(e) => debug!(error = %e, "Skipping malformed task run"),
            }
        }

        Ok(snapshot)
    }

    async fn deployment_readiness(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentReadiness, ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = deployments.get(name).await?;

        Ok(DeploymentReadiness {
            desired_replicas: deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1),
            ready_replicas: deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        })
    }

    async fn warning_events(&self, namespace: &str) -> Result<Vec<ClusterEvent>, ClusterError> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let list = events
            .list(&ListParams::default().fields("type=Warning"))
            .await?;

        Ok(list
            .items
            .into_iter()
            .map(|event| ClusterEvent {
                namespace: namespace.to_string(),
                object_name: event.involved_object.name.unwrap_or_default(),
                reason: event.reason.unwrap_or_default(),
                message: event.message.unwrap_or_default(),
                timestamp: event
                    .last_timestamp
                    .map(|t| t.0)
                    .or_else(|| event.event_time.map(|t| t.0)),
            })
            .collect())
    }
}
