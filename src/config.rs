use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sampler::EventKind;

/// Top-level configuration for the tieroor agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Hardware events to sample. Default: all loads and all stores.
    #[serde(default = "default_events")]
    pub events: Vec<EventKind>,

    /// Ring buffer data pages per (event, CPU) pair, power of two. Default: 8.
    #[serde(default = "default_buffer_pages")]
    pub buffer_pages: usize,

    /// Hardware sample period (one record every N qualifying accesses).
    /// Default: 10007.
    #[serde(default = "default_sample_period")]
    pub sample_period: u64,

    /// Maximum records drained from one buffer per sampling pass. Default: 32.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How often tier counts are reported and reset. Default: 1s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// Number of memory node ids that belong to the Near (fast) tier.
    /// Node ids below this value classify as Near, all others as Far.
    /// Required: depends on the deployed NUMA topology.
    pub near_node_threshold: u32,

    /// Begin sampling immediately instead of waiting for a control "on".
    #[serde(default)]
    pub enable_on_start: bool,

    /// Control surface configuration.
    #[serde(default)]
    pub control: ControlConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Control surface listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Listen address. Default: "127.0.0.1:8085".
    #[serde(default = "default_control_addr")]
    pub addr: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: "127.0.0.1:9464".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_events() -> Vec<EventKind> {
    vec![EventKind::AllLoads, EventKind::AllStores]
}

fn default_buffer_pages() -> usize {
    8
}

fn default_sample_period() -> u64 {
    10007
}

fn default_batch_size() -> usize {
    32
}

fn default_report_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_control_addr() -> String {
    "127.0.0.1:8085".to_string()
}

fn default_health_addr() -> String {
    "127.0.0.1:9464".to_string()
}

// --- Default trait impls ---

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            addr: default_control_addr(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.events.is_empty() {
            bail!("events must not be empty");
        }

        let mut seen = Vec::with_capacity(self.events.len());
        for event in &self.events {
            if seen.contains(event) {
                bail!("duplicate event in events: {}", event.as_str());
            }
            seen.push(*event);
        }

        if self.buffer_pages == 0 || !self.buffer_pages.is_power_of_two() {
            bail!(
                "buffer_pages must be a nonzero power of two, got {}",
                self.buffer_pages
            );
        }

        if self.sample_period == 0 {
            bail!("sample_period must be positive");
        }

        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }

        if self.report_interval.is_zero() {
            bail!("report_interval must be positive");
        }

        if self.near_node_threshold == 0 {
            bail!("near_node_threshold must be at least 1");
        }

        Ok(())
    }
}
