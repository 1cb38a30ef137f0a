//! Collector loop driver
//!
//! Runs a collector on a fixed interval with jitter. Ticks of one collector
//! never overlap; a slow tick delays the next one instead of bursting.
//! Shutdown is observed between ticks, so an in-flight tick always
//! completes and never leaves a half-published view behind.

use super::{Collector, TickOutcome};
use crate::health::HealthRegistry;
use crate::observability::ObserverMetrics;
use crate::store::{AggregationStore, Published, SnapshotWriter, ViewSnapshot};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing configuration of one collector loop
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Base tick interval
    pub interval: Duration,
    /// Maximum jitter added to the interval
    pub jitter: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            jitter: Duration::from_millis(500),
        }
    }
}

impl LoopConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    Published,
    Retained,
    Failed,
}

/// Drives one collector and owns the writer for its view
pub struct CollectorLoop<C: Collector> {
    collector: C,
    writer: SnapshotWriter<C::Snapshot>,
    config: LoopConfig,
    health: Option<HealthRegistry>,
    metrics: ObserverMetrics,
}

impl<C: Collector> CollectorLoop<C> {
    pub fn new(collector: C, writer: SnapshotWriter<C::Snapshot>, config: LoopConfig) -> Self {
        Self {
            collector,
            writer,
            config,
            health: None,
            metrics: ObserverMetrics::new(),
        }
    }

    /// Report tick outcomes to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Spawn the loop on the runtime
    pub fn start(self) -> CollectorHandle<C::Snapshot> {
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let name = self.collector.name();
        let store = Arc::clone(self.writer.store());
        let task = tokio::spawn(self.run(stop_rx));

        CollectorHandle {
            inner: LoopHandle {
                name,
                stop_tx,
                task,
            },
            store,
            _view: PhantomData,
        }
    }

    /// Run until a stop signal arrives
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            collector = self.collector.name(),
            interval_secs = self.config.interval.as_secs(),
            "Starting collector loop"
        );

        let period = self.config.interval + rand_jitter(self.config.jitter);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(collector = self.collector.name(), "Shutting down collector loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
            }
        }
    }

    /// Run a single tick and publish its result
    pub async fn run_tick(&mut self) -> TickReport {
        let name = self.collector.name();
        let start = Instant::now();
        let result = self.collector.tick().await;
        let elapsed = start.elapsed();
        self.metrics.observe_tick_latency(name, elapsed.as_secs_f64());

        let report = match result {
            Ok(TickOutcome::Publish(snapshot)) => {
                self.writer.publish(snapshot);
                self.metrics.inc_snapshots_published(self.writer.kind());
                TickReport::Published
            }
            Ok(TickOutcome::Retain) => TickReport::Retained,
            Err(e) => {
                self.metrics.inc_tick_errors(name);
                warn!(
                    collector = name,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Collector tick failed, keeping previous snapshot"
                );
                if let Some(health) = &self.health {
                    health.record_failure(name, e.to_string()).await;
                }
                TickReport::Failed
            }
        };

        if report != TickReport::Failed {
            if let Some(health) = &self.health {
                health.record_success(name).await;
            }
        }

        debug!(
            collector = name,
            elapsed_ms = elapsed.as_millis() as u64,
            report = ?report,
            "Collector tick complete"
        );

        report
    }
}

/// Generate a jitter between zero and `max`
fn rand_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    Duration::from_millis(now % max_ms)
}

/// Type-erased handle used to stop a running loop
pub struct LoopHandle {
    name: &'static str,
    stop_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the loop to stop after its in-flight tick
    pub fn signal(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Wait for the loop to exit, aborting it at the deadline.
    /// Returns whether it stopped on its own.
    pub async fn join(mut self, deadline: Instant) -> bool {
        match tokio::time::timeout_at(deadline, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                warn!(collector = self.name, "Collector did not stop in time, aborting");
                self.task.abort();
                false
            }
        }
    }
}

/// Handle to a running collector
pub struct CollectorHandle<S> {
    inner: LoopHandle,
    store: Arc<AggregationStore>,
    _view: PhantomData<fn() -> S>,
}

impl<S: ViewSnapshot> CollectorHandle<S> {
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Latest snapshot this collector published
    pub fn current_snapshot(&self) -> Option<Arc<Published<S>>> {
        self.store.read::<S>()
    }

    /// Stop the collector, waiting at most `grace`
    pub async fn stop(self, grace: Duration) -> bool {
        self.inner.signal();
        self.inner.join(Instant::now() + grace).await
    }
}

impl<S> From<CollectorHandle<S>> for LoopHandle {
    fn from(handle: CollectorHandle<S>) -> Self {
        handle.inner
    }
}

/// Owns every running loop and stops them together
#[derive(Default)]
pub struct Supervisor {
    loops: Vec<LoopHandle>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handle: impl Into<LoopHandle>) {
        self.loops.push(handle.into());
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.loops.iter().map(|l| l.name).collect()
    }

    /// Signal every loop, then wait for all of them within one grace period
    pub async fn shutdown(self, grace: Duration) -> usize {
        for handle in &self.loops {
            handle.signal();
        }

        let deadline = Instant::now() + grace;
        let mut aborted = 0;
        for handle in self.loops {
            if !handle.join(deadline).await {
                aborted += 1;
            }
        }

        info!(aborted, "All collector loops stopped");
        aborted
    }
}
