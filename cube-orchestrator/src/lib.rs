//! Cube Orchestrator
//!
//! Execution engine for plugin instances.
//!
//! Architecture:
//! - Repositories: persistence behind the [`repository::Store`] trait
//!   (Postgres in production, in memory for tests)
//! - Services: the plugin instance status machine, job submission, workflow
//!   instantiation and deletion
//! - Tasks: the registry of asynchronous tasks, their queues, the worker
//!   pools consuming them and the beat firing the periodic sweepers

pub mod config;
pub mod context;
pub mod db;
pub mod repository;
pub mod service;
pub mod tasks;

#[cfg(test)]
mod test_support;
