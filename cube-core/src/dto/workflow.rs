//! Workflow DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to instantiate a pipeline on top of an existing plugin instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkflow {
    pub pipeline_id: Uuid,
    pub previous_plugin_inst_id: Uuid,
    pub title: Option<String>,
    #[serde(default)]
    pub nodes_info: Vec<NodeOverride>,
}

/// Per-piping overrides supplied at instantiation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOverride {
    pub piping_id: Uuid,
    pub compute_resource_name: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub plugin_parameter_defaults: Vec<ParameterOverride>,
}

/// Replacement default for one parameter of a piping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterOverride {
    pub name: String,
    pub default: serde_json::Value,
}
