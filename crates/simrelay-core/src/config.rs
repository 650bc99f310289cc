//! Configuration resolution for simrelay.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/simrelay/settings.json)
//! 3. Project config (.simrelay/settings.json) or an explicit file
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files may be partial: they are merged key by key onto the layers below.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decoder::DEFAULT_MAX_LINE_BYTES;
use crate::error::{Error, Result};

/// Complete simrelay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub hub: HubConfig,
    pub targets: TargetList,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            log_level: "info".to_string(),
        }
    }
}

/// How the external compute process is invoked and supervised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable to spawn.
    pub program: PathBuf,
    /// Arguments placed before the target identifier (e.g. the script path).
    pub args: Vec<String>,
    /// Arguments appended after all parameters.
    pub flags: Vec<String>,
    /// Parameters applied when a start request does not override them.
    pub default_parameters: BTreeMap<String, String>,
    /// Working directory for the child; inherits ours when unset.
    pub working_directory: Option<PathBuf>,
    /// Grace period after the interrupt before the child is killed.
    /// `0` waits forever.
    pub terminate_timeout_secs: u64,
    /// Largest unterminated output line buffered before it is flushed.
    pub max_line_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["python-engine/main.py".to_string()],
            flags: vec!["--use_custom_fdt".to_string()],
            default_parameters: BTreeMap::new(),
            working_directory: None,
            terminate_timeout_secs: 10,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// Broadcast hub sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HubConfig {
    /// Events queued per subscriber before it is considered too slow.
    pub subscriber_buffer: usize,
    /// Capacity of the supervisor → hub channel.
    pub forwarder_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            forwarder_capacity: 128,
        }
    }
}

/// A selectable workload offered to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub value: String,
    pub label: String,
}

impl Target {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Ordered list of selectable targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct TargetList(pub Vec<Target>);

impl Default for TargetList {
    fn default() -> Self {
        let bearings = [
            ("Bearing1_2", "Artigo B1 (C1)"),
            ("Bearing1_3", "Artigo B2 (C1)"),
            ("Bearing2_1", "Artigo B3 (C2)"),
            ("Bearing2_2", "Artigo B4 (C2)"),
            ("Bearing3_3", "Artigo B5 (C3)"),
            ("Bearing3_4", "Artigo B6 (C3)"),
        ];
        Self(
            bearings
                .into_iter()
                .map(|(name, display)| Target::new(name, format!("{display} ({name})")))
                .collect(),
        )
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` replaces the project file lookup and must exist.
pub fn load_config(project_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_values(&mut merged, load_config_file(&global_path)?);
    }

    if let Some(path) = explicit {
        merge_values(&mut merged, load_config_file(path)?);
    } else if let Some(dir) = project_dir {
        let project_path = dir.join(".simrelay").join("settings.json");
        if project_path.exists() {
            merge_values(&mut merged, load_config_file(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("simrelay").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

/// Recursively merge `overlay` onto `base`. Objects merge per key; any
/// other value replaces what was there.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `SIMRELAY_*` overrides read through `lookup`.
pub fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(val) = lookup("SIMRELAY_ADDR") {
        config.server.addr = val
            .parse()
            .map_err(|e| Error::Config(format!("SIMRELAY_ADDR={val}: {e}")))?;
    }
    if let Some(val) = lookup("SIMRELAY_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Some(val) = lookup("SIMRELAY_PROGRAM") {
        config.engine.program = PathBuf::from(val);
    }
    if let Some(val) = lookup("SIMRELAY_TERMINATE_TIMEOUT") {
        config.engine.terminate_timeout_secs = val
            .parse()
            .map_err(|e| Error::Config(format!("SIMRELAY_TERMINATE_TIMEOUT={val}: {e}")))?;
    }
    if let Some(val) = lookup("SIMRELAY_BASE_PATH") {
        config
            .engine
            .default_parameters
            .insert("base_path".to_string(), val);
    }
    Ok(())
}
