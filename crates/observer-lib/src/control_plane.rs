//! Readiness of the execution engine's own components
//!
//! Each configured deployment is checked on its own: a failed read marks
//! only that component unreachable.

use crate::cluster::ClusterStateReader;
use crate::collector::{async_trait, Collector, TickOutcome};
use crate::error::CollectorError;
use crate::health::components;
use crate::models::{ClusterEvent, ControlPlaneStatus, DeploymentReadiness, ReadinessState};
use crate::observability::StructuredLogger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Which deployments make up the control plane
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub namespace: String,
    pub components: Vec<String>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            namespace: "tekton-pipelines".to_string(),
            components: vec![
                "tekton-pipelines-controller".to_string(),
                "tekton-pipelines-webhook".to_string(),
            ],
        }
    }
}

/// The published control-plane view
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControlPlaneSnapshot {
    pub components: Vec<ControlPlaneStatus>,
}

impl ControlPlaneSnapshot {
    pub fn component(&self, name: &str) -> Option<&ControlPlaneStatus> {
        self.components.iter().find(|c| c.component == name)
    }
}

/// Map replica counts to a readiness state
pub fn classify(readiness: DeploymentReadiness) -> ReadinessState {
    if readiness.ready_replicas <= 0 {
        ReadinessState::Unreachable
    } else if readiness.ready_replicas >= readiness.desired_replicas {
        ReadinessState::Healthy
    } else {
        ReadinessState::Degraded
    }
}

/// Newest warning event recorded against a component or its pods
fn newest_event<'a>(events: &'a [ClusterEvent], component: &str) -> Option<&'a ClusterEvent> {
    events
        .iter()
        .filter(|e| e.object_name.starts_with(component))
        .max_by_key(|e| e.timestamp)
}

/// Polls control-plane deployments
pub struct ControlPlaneCollector {
    reader: Arc<dyn ClusterStateReader>,
    config: ControlPlaneConfig,
    previous: HashMap<String, ReadinessState>,
    logger: StructuredLogger,
}

impl ControlPlaneCollector {
    pub fn new(reader: Arc<dyn ClusterStateReader>, config: ControlPlaneConfig) -> Self {
        Self {
            reader,
            config,
            previous: HashMap::new(),
            logger: StructuredLogger::new(components::CONTROL_PLANE_COLLECTOR),
        }
    }

    /// Check every component as of `now`
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> ControlPlaneSnapshot {
        let mut statuses = Vec::with_capacity(self.config.components.len());
        let mut events: Option<Vec<ClusterEvent>> = None;

        for component in &self.config.components {
            let read = self
                .reader
                .deployment_readiness(&self.config.namespace, component)
                .await;

            let (state, readiness, read_error) = match read {
                Ok(readiness) => (classify(readiness), readiness, None),
                Err(e) => {
                    debug!(component = %component, error = %e, "Failed to read control-plane deployment");
                    (ReadinessState::Unreachable, DeploymentReadiness::default(), Some(e.to_string()))
                }
            };

            let error = if state == ReadinessState::Healthy {
                None
            } else {
                if events.is_none() {
                    events = Some(self.warning_events().await);
                }
                let detail = events
                    .as_deref()
                    .and_then(|ev| newest_event(ev, component))
                    .map(|e| format!("{}: {}", e.reason, e.message));
                detail.or(read_error).or_else(|| {
                    Some(format!(
                        "{}/{} replicas ready",
                        readiness.ready_replicas, readiness.desired_replicas
                    ))
                })
            };

            let previous = self.previous.insert(component.clone(), state);
            if previous != Some(state) {
                self.logger
                    .log_control_plane_transition(component, previous, state);
            }

            statuses.push(ControlPlaneStatus {
                component: component.clone(),
                state,
                desired_replicas: readiness.desired_replicas,
                ready_replicas: readiness.ready_replicas,
                last_checked: now,
                error,
            });
        }

        ControlPlaneSnapshot {
            components: statuses,
        }
    }

    async fn warning_events(&self) -> Vec<ClusterEvent> {
        match self.reader.warning_events(&self.config.namespace).await {
            Ok(events) => events,
            Err(e) => {
                debug!(error = %e, "Failed to list control-plane warning events");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Collector for ControlPlaneCollector {
    type Snapshot = ControlPlaneSnapshot;

    fn name(&self) -> &'static str {
        components::CONTROL_PLANE_COLLECTOR
    }

    async fn tick(&mut self) -> Result<TickOutcome<ControlPlaneSnapshot>, CollectorError> {
        Ok(TickOutcome::Publish(self.tick_at(Utc::now()).await))
    }
}
