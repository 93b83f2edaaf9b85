//! Configuration resolution for `ScoreGen`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/scoregen/settings.json`)
//! 3. Project config (`.scoregen/settings.json`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! File layers are merged key by key, so a project file only needs to name
//! the settings it changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::is_valid_command_name;

/// Complete `ScoreGen` bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker: WorkerConfig,
    pub respawn: RespawnConfig,
    pub requests: RequestConfig,
    /// Extra commands declared on top of the built-in ones.
    pub commands: Vec<CommandConfig>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            respawn: RespawnConfig::default(),
            requests: RequestConfig::default(),
            commands: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

/// How the worker executable is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub bin: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Extra environment variables, added to the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Seconds to wait after closing stdin before killing the worker.
    pub terminate_timeout_secs: u64,
    /// Buffered output chunks per subscriber before it starts lagging.
    pub output_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("ScoreGen"),
            args: Vec::new(),
            working_directory: None,
            env: BTreeMap::new(),
            terminate_timeout_secs: 5,
            output_capacity: 256,
        }
    }
}

impl WorkerConfig {
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Crash-recovery backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RespawnConfig {
    /// Delay before the first respawn after a crash.
    pub initial_delay_ms: u64,
    /// Upper bound for the doubled delay.
    pub max_delay_ms: u64,
    /// A worker that lived this long resets the backoff.
    pub stable_after_ms: u64,
}

impl Default for RespawnConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            stable_after_ms: 10_000,
        }
    }
}

/// Request dispatch defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub default_timeout_secs: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
        }
    }
}

impl RequestConfig {
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// A command declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub name: String,
    #[serde(default)]
    pub success: String,
    #[serde(default)]
    pub failure: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Complete on framed lines instead of sentinel text.
    #[serde(default)]
    pub framed: bool,
}

impl Config {
    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.worker.bin.as_os_str().is_empty() {
            return Err(Error::Config("worker.bin must not be empty".into()));
        }
        if self.requests.default_timeout_secs == 0 {
            return Err(Error::Config(
                "requests.default_timeout_secs must be positive".into(),
            ));
        }
        if self.worker.output_capacity == 0 {
            return Err(Error::Config("worker.output_capacity must be positive".into()));
        }
        for cmd in &self.commands {
            if !is_valid_command_name(&cmd.name) {
                return Err(Error::Config(format!(
                    "command name {:?} must be a bare token",
                    cmd.name
                )));
            }
            if !cmd.framed && (cmd.success.is_empty() || cmd.failure.is_empty()) {
                return Err(Error::Config(format!(
                    "command {} needs both success and failure sentinels",
                    cmd.name
                )));
            }
            if !cmd.framed && cmd.success == cmd.failure {
                return Err(Error::Config(format!(
                    "command {} uses the same text for success and failure",
                    cmd.name
                )));
            }
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path();
    let mut config = load_layers(global.as_deref(), project_dir)?;
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("scoregen").join("settings.json"))
}

/// Project config file path inside `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".scoregen").join("settings.json")
}

/// Merge defaults, the global file and the project file (files are optional).
pub fn load_layers(global_path: Option<&Path>, project_dir: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(path) = global_path
        && path.exists()
    {
        merge_value(&mut merged, load_config_file(path)?);
        debug!(path = %path.display(), "Loaded global config");
    }

    if let Some(dir) = project_dir {
        let path = project_config_path(dir);
        if path.exists() {
            merge_value(&mut merged, load_config_file(&path)?);
            debug!(path = %path.display(), "Loaded project config");
        }
    }

    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Objects merge recursively; any other overlay value replaces the base.
fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `SCOREGEN_*` overrides read through `lookup`.
pub fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("SCOREGEN_WORKER_BIN") {
        config.worker.bin = PathBuf::from(val);
    }
    if let Some(val) = lookup("SCOREGEN_REQUEST_TIMEOUT_SECS")
        && let Ok(n) = val.parse()
    {
        config.requests.default_timeout_secs = n;
    }
    if let Some(val) = lookup("SCOREGEN_RESPAWN_DELAY_MS")
        && let Ok(n) = val.parse()
    {
        config.respawn.initial_delay_ms = n;
    }
    if let Some(val) = lookup("SCOREGEN_LOG_LEVEL") {
        config.log_level = val;
    }
}
