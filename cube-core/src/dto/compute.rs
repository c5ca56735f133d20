//! Documents exchanged with remote compute resources

use serde::{Deserialize, Serialize};

use crate::domain::plugin::PluginType;

/// Everything a compute resource needs to run one plugin instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub jid: String,
    pub args: Vec<String>,
    /// Comma separated flags of the path-typed parameters
    pub args_path_flags: String,
    pub auid: String,
    pub number_of_workers: i32,
    pub cpu_limit: i32,
    pub memory_limit: i32,
    pub gpu_limit: i32,
    pub image: String,
    pub entrypoint: Vec<String>,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub input_dirs: Vec<String>,
    pub output_dir: String,
}

/// Handle returned by a compute resource for a submitted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub jid: String,
}

/// Execution phase of a remote job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemotePhase {
    NotStarted,
    Started,
    FinishedSuccessfully,
    FinishedWithError,
    Undefined,
}

impl RemotePhase {
    /// Whether the remote job has stopped running
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RemotePhase::FinishedSuccessfully | RemotePhase::FinishedWithError
        )
    }
}

/// Status of a remote job as reported by its compute resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub jid: String,
    pub status: RemotePhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub logs: String,
}
