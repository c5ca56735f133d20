//! Compute resource registry

use std::collections::HashMap;
use std::sync::Arc;

use crate::ComputeClient;
use crate::error::{ClientError, Result};

/// Maps compute resource names to their clients
#[derive(Clone, Default)]
pub struct ComputeRegistry {
    clients: HashMap<String, Arc<dyn ComputeClient>>,
}

impl ComputeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, client: Arc<dyn ComputeClient>) {
        self.clients.insert(name.into(), client);
    }

    pub fn with(mut self, name: impl Into<String>, client: Arc<dyn ComputeClient>) -> Self {
        self.register(name, client);
        self
    }

    /// Client for the named compute resource
    pub fn get(&self, name: &str) -> Result<Arc<dyn ComputeClient>> {
        self.clients
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::UnknownComputeResource(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.clients.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
