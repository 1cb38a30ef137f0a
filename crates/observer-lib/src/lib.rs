//! Observer library for Tekton pipelines
//!
//! This crate provides the core functionality for:
//! - Metrics scraping from the pipeline controller
//! - Per-run cost accounting
//! - Execution trace reconstruction
//! - Rule-based insights over metrics and cost
//! - Control-plane readiness checks
//! - The aggregation store that serves every view to readers
//! - Health checks and observability

pub mod cluster;
pub mod collector;
pub mod control_plane;
pub mod cost;
pub mod error;
pub mod health;
pub mod insights;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod retention;
pub mod store;
pub mod trace;

#[cfg(test)]
mod testing;

pub use error::{ClusterError, CollectorError, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ObserverMetrics, StructuredLogger};
pub use store::{AggregationStore, Published, SnapshotWriter, ViewKind, ViewSnapshot, ViewStatus};
