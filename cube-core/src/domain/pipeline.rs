//! Pipeline domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::parameter::ParameterValue;

/// Immutable, named collection of pipings forming exactly one tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    /// Locked pipelines are only visible to their owner
    pub locked: bool,
    pub description: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Pipeline {
    pub fn is_accessible_by(&self, user: &str) -> bool {
        !self.locked || self.owner == user
    }
}

/// Template node of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Piping {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub plugin_id: Uuid,
    pub previous_id: Option<Uuid>,
    /// Unique within the pipeline
    pub title: String,
    pub defaults: Vec<PipingDefault>,
}

impl Piping {
    /// Static default declared for a plugin parameter, if one was set
    pub fn default_for(&self, param_name: &str) -> Option<&ParameterValue> {
        self.defaults
            .iter()
            .find(|d| d.name == param_name)
            .and_then(|d| d.value.as_ref())
    }
}

/// Default value of one plugin parameter inside a piping.
///
/// A missing value means it must be supplied when the pipeline is instantiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipingDefault {
    pub plugin_param_id: Uuid,
    pub name: String,
    pub value: Option<ParameterValue>,
}
