use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use libsupervisor::{CapabilityCatalog, SupervisorSettings, WorkerLaunch};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    // ip:port of the control api
    #[serde(default = "default_addr")]
    pub addr: String,
    // json file holding the user records
    pub users_file: PathBuf,
    // configs/ and logs/ live here; resolved by rootpath when unset
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub worker: WorkerLaunch,
    #[serde(default)]
    pub capabilities: CapabilityCatalog,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub resume_on_boot: bool,
    #[serde(default = "default_exit_channel_capacity")]
    pub exit_channel_capacity: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub graceful_stop_ms: u64,
    pub forced_stop_ms: u64,
    pub spawn_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let defaults = SupervisorSettings::default();
        TimeoutConfig {
            graceful_stop_ms: defaults.graceful_stop_timeout.as_millis() as u64,
            forced_stop_ms: defaults.forced_stop_timeout.as_millis() as u64,
            spawn_ms: defaults.spawn_timeout.as_millis() as u64,
        }
    }
}

fn default_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_exit_channel_capacity() -> usize {
    SupervisorSettings::default().exit_channel_capacity
}

impl Config {
    /// Supervisor settings for a resolved state directory. Worker logs default
    /// to `<state_dir>/logs`.
    pub fn supervisor_settings(&self, state_dir: &Path) -> SupervisorSettings {
        let mut launch = self.worker.clone();
        if launch.log_dir.is_none() {
            launch.log_dir = Some(state_dir.join("logs"));
        }
        SupervisorSettings {
            launch,
            graceful_stop_timeout: Duration::from_millis(self.timeouts.graceful_stop_ms),
            forced_stop_timeout: Duration::from_millis(self.timeouts.forced_stop_ms),
            spawn_timeout: Duration::from_millis(self.timeouts.spawn_ms),
            exit_channel_capacity: self.exit_channel_capacity,
            resume_on_boot: self.resume_on_boot,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
