//! Aggregation store
//!
//! Holds the latest snapshot published by each collector. Every view kind
//! has its own lock-free slot; publishing swaps in a new immutable
//! snapshot, so readers always observe either the previous or the new
//! snapshot in full. A typed writer handle can be claimed once per kind,
//! which keeps each view single-writer.

use crate::control_plane::ControlPlaneSnapshot;
use crate::cost::CostSnapshot;
use crate::error::StoreError;
use crate::insights::InsightSnapshot;
use crate::metrics::MetricsSnapshot;
use crate::trace::TraceSnapshot;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The derived views served to readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Metrics,
    Cost,
    Trace,
    Insights,
    ControlPlane,
}

impl ViewKind {
    pub const ALL: [ViewKind; 5] = [
        ViewKind::Metrics,
        ViewKind::Cost,
        ViewKind::Trace,
        ViewKind::Insights,
        ViewKind::ControlPlane,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewKind::Metrics => write!(f, "metrics"),
            ViewKind::Cost => write!(f, "cost"),
            ViewKind::Trace => write!(f, "trace"),
            ViewKind::Insights => write!(f, "insights"),
            ViewKind::ControlPlane => write!(f, "control_plane"),
        }
    }
}

/// A committed snapshot with its publish time
#[derive(Debug, Serialize)]
pub struct Published<T> {
    pub published_at: DateTime<Utc>,
    pub snapshot: T,
}

/// A snapshot type stored in exactly one slot of the store
pub trait ViewSnapshot: Send + Sync + Sized + 'static {
    const KIND: ViewKind;

    fn slot(store: &AggregationStore) -> &ArcSwapOption<Published<Self>>;
}

/// Publish time of one view, `None` until its first publish
#[derive(Debug, Clone, Serialize)]
pub struct ViewStatus {
    pub kind: ViewKind,
    pub published_at: Option<DateTime<Utc>>,
}

/// Process-wide store of the latest snapshot per view kind
pub struct AggregationStore {
    metrics: ArcSwapOption<Published<MetricsSnapshot>>,
    cost: ArcSwapOption<Published<CostSnapshot>>,
    trace: ArcSwapOption<Published<TraceSnapshot>>,
    insights: ArcSwapOption<Published<InsightSnapshot>>,
    control_plane: ArcSwapOption<Published<ControlPlaneSnapshot>>,
    claimed: [AtomicBool; 5],
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationStore {
    pub fn new() -> Self {
        Self {
            metrics: ArcSwapOption::empty(),
            cost: ArcSwapOption::empty(),
            trace: ArcSwapOption::empty(),
            insights: ArcSwapOption::empty(),
            control_plane: ArcSwapOption::empty(),
            claimed: Default::default(),
        }
    }

    /// Claim the single writer handle for a view kind
    pub fn writer<T: ViewSnapshot>(
        self: &Arc<Self>,
    ) -> Result<SnapshotWriter<T>, StoreError> {
        let flag = &self.claimed[T::KIND.index()];
        if flag.swap(true, Ordering::AcqRel) {
            return Err(StoreError::WriterAlreadyClaimed(T::KIND));
        }

        Ok(SnapshotWriter {
            store: Arc::clone(self),
            _view: PhantomData,
        })
    }

    /// Latest committed snapshot, or `None` if the view is not yet available
    pub fn read<T: ViewSnapshot>(&self) -> Option<Arc<Published<T>>> {
        T::slot(self).load_full()
    }

    /// Publish times of every view
    pub fn status(&self) -> Vec<ViewStatus> {
        ViewKind::ALL
            .iter()
            .map(|&kind| ViewStatus {
                kind,
                published_at: self.published_at(kind),
            })
            .collect()
    }

    fn published_at(&self, kind: ViewKind) -> Option<DateTime<Utc>> {
        fn at<T>(slot: &ArcSwapOption<Published<T>>) -> Option<DateTime<Utc>> {
            slot.load().as_ref().map(|p| p.published_at)
        }

        match kind {
            ViewKind::Metrics => at(&self.metrics),
            ViewKind::Cost => at(&self.cost),
            ViewKind::Trace => at(&self.trace),
            ViewKind::Insights => at(&self.insights),
            ViewKind::ControlPlane => at(&self.control_plane),
        }
    }
}

/// Exclusive publishing handle for one view kind
pub struct SnapshotWriter<T> {
    store: Arc<AggregationStore>,
    _view: PhantomData<fn() -> T>,
}

impl<T: ViewSnapshot> SnapshotWriter<T> {
    /// Atomically replace the view's snapshot
    pub fn publish(&self, snapshot: T) -> DateTime<Utc> {
        let published_at = Utc::now();
        T::slot(&self.store).store(Some(Arc::new(Published {
            published_at,
            snapshot,
        })));
        published_at
    }

    pub fn kind(&self) -> ViewKind {
        T::KIND
    }

    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }
}

impl ViewSnapshot for MetricsSnapshot {
    const KIND: ViewKind = ViewKind::Metrics;

    fn slot(store: &AggregationStore) -> &ArcSwapOption<Published<Self>> {
        &store.metrics
    }
}

impl ViewSnapshot for CostSnapshot {
    const KIND: ViewKind = ViewKind::Cost;

    fn slot(store: &AggregationStore) -> &ArcSwapOption<Published<Self>> {
        &store.cost
    }
}

impl ViewSnapshot for TraceSnapshot {
    const KIND: ViewKind = ViewKind::Trace;

    fn slot(store: &AggregationStore) -> &ArcSwapOption<Published<Self>> {
        &store.trace
    }
}

impl ViewSnapshot for InsightSnapshot {
    const KIND: ViewKind = ViewKind::Insights;

    fn slot(store: &AggregationStore) -> &ArcSwapOption<Published<Self>> {
        &store.insights
    }
}

impl ViewSnapshot for ControlPlaneSnapshot {
    const KIND: ViewKind = ViewKind::ControlPlane;

    fn slot(store: &AggregationStore) -> &ArcSwapOption<Published<Self>> {
        &store.control_plane
    }
}
