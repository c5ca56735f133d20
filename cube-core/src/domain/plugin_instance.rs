//! Plugin instance domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::parameter::ParameterValue;

/// Name of the string parameter through which `ts` plugins receive the ids of
/// their parent instances
pub const PLUGIN_INSTANCES_PARAM: &str = "plugininstances";

/// Name of the string parameter holding the `ts` per-parent file filters
pub const FILTER_PARAM: &str = "filter";

/// Lifecycle status of a plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceStatus {
    Created,
    Waiting,
    Scheduled,
    Started,
    RegisteringFiles,
    FinishedSuccessfully,
    FinishedWithError,
    Cancelled,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 8] = [
        InstanceStatus::Created,
        InstanceStatus::Waiting,
        InstanceStatus::Scheduled,
        InstanceStatus::Started,
        InstanceStatus::RegisteringFiles,
        InstanceStatus::FinishedSuccessfully,
        InstanceStatus::FinishedWithError,
        InstanceStatus::Cancelled,
    ];

    pub const NON_TERMINAL: [InstanceStatus; 5] = [
        InstanceStatus::Created,
        InstanceStatus::Waiting,
        InstanceStatus::Scheduled,
        InstanceStatus::Started,
        InstanceStatus::RegisteringFiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Waiting => "waiting",
            InstanceStatus::Scheduled => "scheduled",
            InstanceStatus::Started => "started",
            InstanceStatus::RegisteringFiles => "registeringFiles",
            InstanceStatus::FinishedSuccessfully => "finishedSuccessfully",
            InstanceStatus::FinishedWithError => "finishedWithError",
            InstanceStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::FinishedSuccessfully
                | InstanceStatus::FinishedWithError
                | InstanceStatus::Cancelled
        )
    }

    /// Terminal statuses that make every dependent instance fail
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            InstanceStatus::FinishedWithError | InstanceStatus::Cancelled
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstanceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown plugin instance status: {}", s))
    }
}

/// Whether the instance's job still exists on its compute resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteJobState {
    #[default]
    None,
    Submitted,
    Deleted,
}

impl RemoteJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteJobState::None => "none",
            RemoteJobState::Submitted => "submitted",
            RemoteJobState::Deleted => "deleted",
        }
    }
}

impl FromStr for RemoteJobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RemoteJobState::None),
            "submitted" => Ok(RemoteJobState::Submitted),
            "deleted" => Ok(RemoteJobState::Deleted),
            other => Err(format!("unknown remote job state: {}", other)),
        }
    }
}

/// One execution of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInstance {
    pub id: Uuid,
    pub title: String,
    pub owner: String,
    pub plugin_id: Uuid,
    pub plugin_name: String,
    pub previous_id: Option<Uuid>,
    pub feed_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub compute_resource: String,
    pub status: InstanceStatus,
    pub cpu_limit: i32,
    pub memory_limit: i32,
    pub number_of_workers: i32,
    pub gpu_limit: i32,
    /// Storage prefix the plugin writes its results to
    pub output_path: String,
    /// Last job status reported by the compute resource
    pub summary: serde_json::Value,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub remote_job: RemoteJobState,
    pub created_at: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl PluginInstance {
    /// Identifier of this instance's job on its compute resource
    pub fn job_id(&self, prefix: &str) -> String {
        job_id(prefix, self.id)
    }
}

pub fn job_id(prefix: &str, instance_id: Uuid) -> String {
    format!("{}{}", prefix, instance_id)
}

/// Resolved value of one plugin parameter for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInstance {
    pub plugin_param_id: Uuid,
    pub name: String,
    pub value: ParameterValue,
}

/// Advisory lock held while an instance is in a critical section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInstanceLock {
    pub instance_id: Uuid,
    pub start_date: DateTime<Utc>,
}

impl PluginInstanceLock {
    /// A lock older than `cutoff` belongs to a critical section that crashed
    pub fn is_stuck(&self, cutoff: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.start_date > cutoff
    }
}

/// Parse the comma separated parent ids held by a `ts` instance's
/// `plugininstances` parameter. Blank entries are skipped; any other
/// unparsable entry is returned as the error.
pub fn parse_instance_ids(value: &str) -> Result<Vec<Uuid>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Uuid::parse_str(s).map_err(|_| s.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in InstanceStatus::ALL {
            assert_eq!(status.as_str().parse::<InstanceStatus>(), Ok(status));
            let encoded = serde_json::to_value(status).unwrap();
            assert_eq!(encoded, serde_json::json!(status.as_str()));
        }
    }

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = InstanceStatus::ALL
            .into_iter()
            .filter(InstanceStatus::is_terminal)
            .collect();
        assert_eq!(
            terminal,
            vec![
                InstanceStatus::FinishedSuccessfully,
                InstanceStatus::FinishedWithError,
                InstanceStatus::Cancelled
            ]
        );
        assert!(InstanceStatus::NON_TERMINAL.iter().all(|s| !s.is_terminal()));
    }

    #[test]
    fn test_lock_staleness() {
        let now = Utc::now();
        let lock = PluginInstanceLock {
            instance_id: Uuid::new_v4(),
            start_date: now - chrono::Duration::hours(5),
        };
        assert!(lock.is_stuck(chrono::Duration::hours(4), now));
        assert!(!lock.is_stuck(chrono::Duration::hours(6), now));
    }

    #[test]
    fn test_parse_instance_ids() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            parse_instance_ids(&format!("{}, {},", a, b)),
            Ok(vec![a, b])
        );
        assert_eq!(parse_instance_ids(""), Ok(vec![]));
        assert_eq!(parse_instance_ids("12"), Err("12".to_string()));
    }

    #[test]
    fn test_job_id() {
        let id = Uuid::new_v4();
        assert_eq!(job_id("chris-jid-", id), format!("chris-jid-{}", id));
    }
}
