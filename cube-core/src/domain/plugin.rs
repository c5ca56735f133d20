//! Plugin domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::parameter::{ParameterKind, ParameterValue};

/// Plugin type
///
/// - `fs` plugins have no predecessor and create a new feed
/// - `ds` plugins process the output of a single predecessor
/// - `ts` plugins combine the outputs of several instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Fs,
    Ds,
    Ts,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Fs => "fs",
            PluginType::Ds => "ds",
            PluginType::Ts => "ts",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fs" => Ok(PluginType::Fs),
            "ds" => Ok(PluginType::Ds),
            "ts" => Ok(PluginType::Ts),
            other => Err(format!("unknown plugin type: {}", other)),
        }
    }
}

/// How a parameter is rendered on the plugin's command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParameterAction {
    /// `--flag value`
    #[default]
    Store,
    /// `--flag` when the value is true
    StoreTrue,
    /// `--flag` when the value is false
    StoreFalse,
}

/// Declared plugin parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginParameter {
    pub id: Uuid,
    pub name: String,
    pub flag: String,
    pub kind: ParameterKind,
    #[serde(default)]
    pub action: ParameterAction,
    pub optional: bool,
    pub default: Option<ParameterValue>,
    #[serde(default)]
    pub help: String,
}

/// Registered plugin
///
/// Plugins are registered by an administrative import step and are
/// read-only for the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub plugin_type: PluginType,
    pub dock_image: String,
    pub selfpath: String,
    pub selfexec: String,
    pub execshell: String,
    pub min_cpu_limit: i32,
    pub max_cpu_limit: i32,
    pub min_memory_limit: i32,
    pub max_memory_limit: i32,
    pub min_number_of_workers: i32,
    pub max_number_of_workers: i32,
    pub min_gpu_limit: i32,
    pub max_gpu_limit: i32,
    pub parameters: Vec<PluginParameter>,
    /// Names of the compute resources this plugin is registered with, in
    /// order of preference
    pub compute_resources: Vec<String>,
}

impl Plugin {
    /// Look up a declared parameter by name
    pub fn parameter(&self, name: &str) -> Option<&PluginParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn supports_compute_resource(&self, name: &str) -> bool {
        self.compute_resources.iter().any(|cr| cr == name)
    }

    pub fn default_compute_resource(&self) -> Option<&str> {
        self.compute_resources.first().map(String::as_str)
    }

    /// Entrypoint used to start the plugin inside its container
    pub fn entrypoint(&self) -> Vec<String> {
        let exec = format!(
            "{}/{}",
            self.selfpath.trim_end_matches('/'),
            self.selfexec
        );
        if self.execshell.is_empty() {
            vec![exec]
        } else {
            vec![self.execshell.clone(), exec]
        }
    }
}
