//! Feed domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tree of plugin instances rooted at an `fs` instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub name: String,
    pub creator: String,
    pub owners: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Feed {
    pub fn is_owned_by(&self, user: &str) -> bool {
        self.creator == user || self.owners.iter().any(|o| o == user)
    }

    /// Storage prefix under which every instance of the feed writes its output
    pub fn storage_prefix(&self) -> String {
        format!("home/{}/feeds/feed_{}", self.creator, self.id)
    }
}
