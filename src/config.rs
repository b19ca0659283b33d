//! Bridge configuration (`luabridge.toml`).

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{BridgeError, Result};
use crate::value::{Key, Map, Value};

/// Settings for a bridged runtime instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Open the standard libraries at start
    pub open_libs: bool,
    /// Name of the global object scripts use to reach the host
    pub global_name: String,
    /// Log level for the stderr logger (error, warn, info, debug, trace, off)
    pub log_level: String,
    /// Extra globals, copied into the runtime as plain data
    pub globals: toml::Table,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            open_libs: true,
            global_name: "host".to_string(),
            log_level: "warn".to_string(),
            globals: toml::Table::new(),
        }
    }
}

impl BridgeConfig {
    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| BridgeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| BridgeError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parsed log level; unknown names fall back to `warn`.
    pub fn level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Warn)
    }

    /// Configured globals as host values, in name order.
    pub fn global_values(&self) -> Vec<(String, Value)> {
        self.globals
            .iter()
            .map(|(name, value)| (name.clone(), from_toml(value)))
            .collect()
    }
}

/// Convert a TOML value. Datetimes become their text form.
pub fn from_toml(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(n) => Value::Int(*n),
        toml::Value::Float(n) => Value::Float(*n),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::array(items.iter().map(from_toml).collect()),
        toml::Value::Table(table) => Value::map(
            table
                .iter()
                .map(|(k, v)| (Key::from(k.as_str()), from_toml(v)))
                .collect::<Map>(),
        ),
    }
}
