use std::path::{Path, PathBuf};
use std::time::Duration;

use bridge_observability::LoggingConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;

use crate::error::{Result, SyncError};

pub const DEFAULT_DEBOUNCE_MS: u64 = 200;
pub const DEFAULT_INIT_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_LOCAL_ID_PREFIX: &str = "local-error-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minimum spacing between authoritative refetches of one session.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Window in which a repeated `initialize` for the same tab is ignored.
    #[serde(default = "default_init_debounce_ms")]
    pub init_debounce_ms: u64,
    #[serde(default = "default_local_id_prefix")]
    pub local_id_prefix: String,
    #[serde(default = "default_task_tool_names")]
    pub task_tool_names: Vec<String>,
    #[serde(default = "default_diagnostic_log_lines")]
    pub diagnostic_log_lines: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_init_debounce_ms() -> u64 {
    DEFAULT_INIT_DEBOUNCE_MS
}

fn default_local_id_prefix() -> String {
    DEFAULT_LOCAL_ID_PREFIX.to_string()
}

fn default_task_tool_names() -> Vec<String> {
    vec!["task".to_string()]
}

fn default_diagnostic_log_lines() -> usize {
    50
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            init_debounce_ms: default_init_debounce_ms(),
            local_id_prefix: default_local_id_prefix(),
            task_tool_names: default_task_tool_names(),
            diagnostic_log_lines: default_diagnostic_log_lines(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn init_debounce(&self) -> Duration {
        Duration::from_millis(self.init_debounce_ms)
    }

    pub fn is_task_tool(&self, tool_name: &str) -> bool {
        let tool_name = tool_name.trim();
        self.task_tool_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(tool_name))
    }
}

/// Builds a [`SyncConfig`] from defaults, an optional JSON file, environment
/// variables and runtime overrides, later layers winning.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    runtime: Option<Value>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_runtime_overrides(mut self, overrides: Value) -> Self {
        self.runtime = Some(overrides);
        self
    }

    /// `BRIDGE_SYNC_CONFIG`, else `<config dir>/tandem/bridge-sync.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BRIDGE_SYNC_CONFIG") {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::config_dir().map(|dir| dir.join("tandem").join("bridge-sync.json"))
    }

    pub async fn load(&self) -> Result<SyncConfig> {
        let file = match self.path.clone().or_else(Self::default_path) {
            Some(path) => read_json_file(&path).await?,
            None => empty_object(),
        };
        let env = env_layer(|key| std::env::var(key).ok());
        self.merge_layers(file, env)
    }

    fn merge_layers(&self, file: Value, env: Value) -> Result<SyncConfig> {
        let mut merged = serde_json::to_value(SyncConfig::default())?;
        deep_merge(&mut merged, &file);
        deep_merge(&mut merged, &env);
        if let Some(runtime) = &self.runtime {
            deep_merge(&mut merged, runtime);
        }
        serde_json::from_value(merged).map_err(|e| SyncError::InvalidConfig(e.to_string()))
    }
}

async fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!("Ignoring unreadable sync config {:?}: {}", path, e);
            Ok(empty_object())
        }
    }
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(ms) = lookup("BRIDGE_SYNC_DEBOUNCE_MS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "debounce_ms": ms }));
    }
    if let Some(ms) =
        lookup("BRIDGE_SYNC_INIT_DEBOUNCE_MS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "init_debounce_ms": ms }));
    }
    if let Some(level) = lookup("BRIDGE_SYNC_LOG_LEVEL") {
        if !level.trim().is_empty() {
            deep_merge(&mut root, &json!({ "logging": { "level": level.trim() } }));
        }
    }
    if let Some(dir) = lookup("BRIDGE_SYNC_LOG_DIR") {
        if !dir.trim().is_empty() {
            deep_merge(&mut root, &json!({ "logging": { "logs_dir": dir.trim() } }));
        }
    }

    root
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
