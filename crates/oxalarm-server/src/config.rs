use anyhow::Context;
use oxalarm_core::{EngineConfig, RouterConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TOML file with `[[strategies]]` tables, re-read on every reload.
    pub rules_path: String,
    #[serde(default = "default_shards")]
    pub shards: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_window_retention_secs")]
    pub window_retention_secs: u64,
    #[serde(default = "default_min_window")]
    pub min_window: usize,
    /// A series is treated as silent after `step_secs * no_data_factor`.
    #[serde(default = "default_no_data_factor")]
    pub no_data_factor: u32,
    /// 0 disables the periodic NO_DATA sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_cas_retries")]
    pub cas_retries: u32,
    /// Append emitted events as JSON lines to this file.
    #[serde(default)]
    pub events_path: Option<String>,
    #[serde(default = "default_machine_id")]
    pub machine_id: i32,
    #[serde(default = "default_node_id")]
    pub node_id: i32,
}

fn default_shards() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

/// One year.
pub const MAX_WINDOW_RETENTION_SECS: u64 = 365 * 86_400;

fn default_window_retention_secs() -> u64 {
    3600
}

fn default_min_window() -> usize {
    10
}

fn default_no_data_factor() -> u32 {
    3
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_cas_retries() -> u32 {
    3
}

fn default_machine_id() -> i32 {
    1
}

fn default_node_id() -> i32 {
    1
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("failed to read config {path}"))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("invalid config {path}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.shards == 0 {
            anyhow::bail!("shards must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if self.no_data_factor == 0 {
            anyhow::bail!("no_data_factor must be at least 1");
        }
        if !(1..=MAX_WINDOW_RETENTION_SECS).contains(&self.window_retention_secs) {
            anyhow::bail!("window_retention_secs must be between 1 and {MAX_WINDOW_RETENTION_SECS}");
        }
        Ok(())
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            shards: self.shards,
            queue_capacity: self.queue_capacity,
            engine: EngineConfig {
                min_window: self.min_window,
                window_retention_secs: self.window_retention_secs,
                no_data_factor: self.no_data_factor,
                cas_retries: self.cas_retries,
            },
        }
    }
}
