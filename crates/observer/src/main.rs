//! Pipeline Observer - watches Tekton pipeline execution
//!
//! This binary runs inside the cluster, scraping controller metrics,
//! accounting run cost, reconstructing traces and serving the results.

use anyhow::{Context, Result};
use observer_lib::{
    cluster::{ClusterStateReader, KubeClusterReader},
    collector::{Collector, CollectorLoop, LoopConfig, Supervisor},
    control_plane::ControlPlaneCollector,
    cost::CostCollector,
    health::{components, HealthRegistry},
    insights::{InsightsConfig, InsightsEngine},
    metrics::{HttpMetricsSource, MetricsCollector, DEFAULT_SCRAPE_TIMEOUT},
    observability::{ObserverMetrics, StructuredLogger},
    trace::TraceCollector,
    AggregationStore,
};
use pipeline_observer::{api, config::ObserverConfig};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const OBSERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Claim the view's writer and spawn the collector's loop, or report the
/// collector unhealthy when it could not be built
async fn start_or_disable<C: Collector>(
    supervisor: &mut Supervisor,
    store: &Arc<AggregationStore>,
    health: &HealthRegistry,
    logger: &StructuredLogger,
    name: &'static str,
    built: Result<(C, LoopConfig)>,
) -> Result<()> {
    let (collector, loop_config) = match built {
        Ok(built) => built,
        Err(e) => {
            let reason = format!("{:#}", e);
            logger.log_collector_disabled(name, &reason);
            health.set_unhealthy(name, reason).await;
            return Ok(());
        }
    };

    let writer = store
        .writer::<C::Snapshot>()
        .with_context(|| format!("failed to claim store writer for {}", name))?;

    health.register(name).await;
    let handle = CollectorLoop::new(collector, writer, loop_config)
        .with_health(health.clone())
        .start();
    supervisor.add(handle);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pipeline-observer");

    let config = ObserverConfig::load().context("failed to load configuration")?;
    info!(
        instance = %config.instance,
        metrics_endpoint = %config.metrics_endpoint,
        "Observer configured"
    );

    let health_registry = HealthRegistry::new();
    let logger = StructuredLogger::new(&config.instance);
    let _metrics = ObserverMetrics::new();
    let store = Arc::new(AggregationStore::new());

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let reader: Arc<dyn ClusterStateReader> = Arc::new(KubeClusterReader::new(client));

    let mut supervisor = Supervisor::new();

    // A collector that cannot be built is disabled; the others still run
    let metrics = async {
        let loop_config = config.loop_config(components::METRICS_COLLECTOR)?;
        let source = HttpMetricsSource::new(&config.metrics_endpoint, DEFAULT_SCRAPE_TIMEOUT)?;
        let collector = MetricsCollector::new(Arc::new(source), config.metrics_config()?);
        collector.verify_endpoint().await?;
        anyhow::Ok((collector, loop_config))
    }
    .await;
    start_or_disable(
        &mut supervisor,
        &store,
        &health_registry,
        &logger,
        components::METRICS_COLLECTOR,
        metrics,
    )
    .await?;

    if config.cost_enabled {
        let cost = config.cost_config().map_err(anyhow::Error::from).and_then(|cost_config| {
            let loop_config = config.loop_config(components::COST_COLLECTOR)?;
            let collector = CostCollector::new(Arc::clone(&reader), Arc::clone(&store), cost_config);
            Ok((collector, loop_config))
        });
        start_or_disable(
            &mut supervisor,
            &store,
            &health_registry,
            &logger,
            components::COST_COLLECTOR,
            cost,
        )
        .await?;
    }

    let trace = config.run_retention().map_err(anyhow::Error::from).and_then(|retention| {
        let loop_config = config.loop_config(components::TRACE_COLLECTOR)?;
        Ok((TraceCollector::new(Arc::clone(&reader), retention), loop_config))
    });
    start_or_disable(
        &mut supervisor,
        &store,
        &health_registry,
        &logger,
        components::TRACE_COLLECTOR,
        trace,
    )
    .await?;

    if config.insights_enabled {
        let insights = config
            .loop_config(components::INSIGHTS_ENGINE)
            .map(|loop_config| {
                let engine = InsightsEngine::new(Arc::clone(&store), InsightsConfig::default());
                (engine, loop_config)
            })
            .map_err(anyhow::Error::from);
        start_or_disable(
            &mut supervisor,
            &store,
            &health_registry,
            &logger,
            components::INSIGHTS_ENGINE,
            insights,
        )
        .await?;
    }

    let control_plane = config
        .control_plane_config()
        .map_err(anyhow::Error::from)
        .and_then(|cp_config| {
            let loop_config = config.loop_config(components::CONTROL_PLANE_COLLECTOR)?;
            Ok((ControlPlaneCollector::new(Arc::clone(&reader), cp_config), loop_config))
        });
    start_or_disable(
        &mut supervisor,
        &store,
        &health_registry,
        &logger,
        components::CONTROL_PLANE_COLLECTOR,
        control_plane,
    )
    .await?;

    logger.log_startup(OBSERVER_VERSION, &supervisor.names());

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), Arc::clone(&store)));

    // Mark observer as ready once every enabled collector is running
    health_registry.set_ready(true).await;

    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        result = &mut api_handle => {
            match result {
                Ok(Ok(())) => logger.log_shutdown("API server exited"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
        }
    }

    health_registry.set_ready(false).await;
    let aborted = supervisor.shutdown(config.shutdown_grace()).await;
    api_handle.abort();
    info!(aborted, "Shutdown complete");

    Ok(())
}
