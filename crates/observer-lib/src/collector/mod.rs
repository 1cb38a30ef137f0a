//! Periodic collectors
//!
//! Every view is produced by a collector that implements [`Collector`].
//! A single driver, [`CollectorLoop`], runs any collector on its own timer,
//! publishes successful ticks into the aggregation store and keeps the
//! previous snapshot when a tick fails.

mod r#loop;

pub use r#loop::{CollectorHandle, CollectorLoop, LoopConfig, LoopHandle, Supervisor, TickReport};

use crate::error::CollectorError;
use crate::store::ViewSnapshot;

pub use async_trait::async_trait;

/// Result of a successful tick
#[derive(Debug)]
pub enum TickOutcome<S> {
    /// Replace the published snapshot
    Publish(S),
    /// Nothing new; keep whatever is published
    Retain,
}

/// One periodic producer of a view snapshot
#[async_trait]
pub trait Collector: Send + 'static {
    type Snapshot: ViewSnapshot;

    /// Stable name used in logs, health and metrics
    fn name(&self) -> &'static str;

    /// Run one collection cycle
    async fn tick(&mut self) -> Result<TickOutcome<Self::Snapshot>, CollectorError>;
}
