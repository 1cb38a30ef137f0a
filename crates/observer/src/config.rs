//! Observer configuration

use observer_lib::collector::LoopConfig;
use observer_lib::control_plane::ControlPlaneConfig;
use observer_lib::cost::CostConfig;
use observer_lib::health::components;
use observer_lib::metrics::MetricsConfig;
use observer_lib::RateTable;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the optional configuration file
pub const CONFIG_PATH_ENV: &str = "OBSERVER_CONFIG";

/// Prefix of environment overrides, e.g. `OBSERVER_API_PORT`
pub const ENV_PREFIX: &str = "OBSERVER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Observer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObserverConfig {
    /// Instance name used in structured logs
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for views, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Text-exposition endpoint of the pipeline controller
    #[serde(default = "default_metrics_endpoint")]
    pub metrics_endpoint: String,

    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Sample retention per metric series
    #[serde(default = "default_metrics_retention")]
    pub metrics_retention_secs: u64,

    #[serde(default = "default_true")]
    pub cost_enabled: bool,

    #[serde(default = "default_cost_interval")]
    pub cost_interval_secs: u64,

    /// Price of one CPU core for one hour
    #[serde(default = "default_cpu_hour_rate")]
    pub cpu_hour_rate: f64,

    /// Price of one GB of memory for one hour
    #[serde(default = "default_memory_gb_hour_rate")]
    pub memory_gb_hour_rate: f64,

    /// Price of one GB of requested storage for one hour
    #[serde(default = "default_storage_gb_hour_rate")]
    pub storage_gb_hour_rate: f64,

    #[serde(default = "default_trace_interval")]
    pub trace_interval_secs: u64,

    #[serde(default = "default_true")]
    pub insights_enabled: bool,

    #[serde(default = "default_insights_interval")]
    pub insights_interval_secs: u64,

    #[serde(default = "default_control_plane_interval")]
    pub control_plane_interval_secs: u64,

    #[serde(default = "default_control_plane_namespace")]
    pub control_plane_namespace: String,

    /// Comma separated deployment names
    #[serde(default = "default_control_plane_components")]
    pub control_plane_components: String,

    /// How long cost records and traces outlive their deleted run
    #[serde(default = "default_run_retention")]
    pub run_retention_secs: u64,

    /// Time collectors get to finish their in-flight tick at shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "pipeline-observer".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_metrics_endpoint() -> String {
    "http://tekton-pipelines-controller.tekton-pipelines:9090/metrics".to_string()
}

fn default_metrics_interval() -> u64 {
    15
}

fn default_metrics_retention() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_cost_interval() -> u64 {
    30
}

fn default_cpu_hour_rate() -> f64 {
    0.031611
}

fn default_memory_gb_hour_rate() -> f64 {
    0.004237
}

fn default_storage_gb_hour_rate() -> f64 {
    0.000137
}

fn default_trace_interval() -> u64 {
    10
}

fn default_insights_interval() -> u64 {
    60
}

fn default_control_plane_interval() -> u64 {
    30
}

fn default_control_plane_namespace() -> String {
    "tekton-pipelines".to_string()
}

fn default_control_plane_components() -> String {
    "tekton-pipelines-controller,tekton-pipelines-webhook".to_string()
}

fn default_run_retention() -> u64 {
    86400
}

fn default_shutdown_grace() -> u64 {
    10
}

impl ObserverConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("observer.toml"));
        Self::load_from(&path)
    }

    /// Load from `path` (if present) overlaid by `OBSERVER_*` variables.
    /// Values are checked per collector when it is built, so one bad
    /// setting only keeps its own collector from starting.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn components(&self) -> Vec<String> {
        self.control_plane_components
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Loop timing of the named collector
    pub fn loop_config(&self, collector: &str) -> Result<LoopConfig, ConfigError> {
        let (option, secs) = match collector {
            components::METRICS_COLLECTOR => ("metrics_interval_secs", self.metrics_interval_secs),
            components::COST_COLLECTOR => ("cost_interval_secs", self.cost_interval_secs),
            components::TRACE_COLLECTOR => ("trace_interval_secs", self.trace_interval_secs),
            components::INSIGHTS_ENGINE => ("insights_interval_secs", self.insights_interval_secs),
            components::CONTROL_PLANE_COLLECTOR => {
                ("control_plane_interval_secs", self.control_plane_interval_secs)
            }
            other => {
                return Err(ConfigError::Invalid(format!("unknown collector {}", other)));
            }
        };
        let secs = positive(option, secs)?;
        Ok(LoopConfig::every(Duration::from_secs(secs)))
    }

    pub fn metrics_config(&self) -> Result<MetricsConfig, ConfigError> {
        let interval = positive("metrics_interval_secs", self.metrics_interval_secs)?;
        let retention_secs = positive("metrics_retention_secs", self.metrics_retention_secs)?;
        // Room for every scrape in the window plus slack for jitter
        let per_window = (retention_secs / interval) as usize;

        Ok(MetricsConfig {
            retention: chrono::Duration::seconds(retention_secs as i64),
            max_samples_per_series: per_window + 2,
        })
    }

    /// Cost settings; fails on an invalid rate
    pub fn cost_config(&self) -> Result<CostConfig, ConfigError> {
        let rates = RateTable::new(
            self.cpu_hour_rate,
            self.memory_gb_hour_rate,
            self.storage_gb_hour_rate,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut config = CostConfig::new(rates);
        config.run_retention = self.run_retention()?;
        Ok(config)
    }

    pub fn control_plane_config(&self) -> Result<ControlPlaneConfig, ConfigError> {
        let components = self.components();
        if components.is_empty() {
            return Err(ConfigError::Invalid(
                "control_plane_components must name at least one deployment".to_string(),
            ));
        }

        Ok(ControlPlaneConfig {
            namespace: self.control_plane_namespace.clone(),
            components,
        })
    }

    pub fn run_retention(&self) -> Result<chrono::Duration, ConfigError> {
        let secs = positive("run_retention_secs", self.run_retention_secs)?;
        Ok(chrono::Duration::seconds(secs as i64))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn positive(option: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{} must be greater than zero", option)));
    }
    Ok(value)
}
