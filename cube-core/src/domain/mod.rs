//! Core domain types
//!
//! This module contains the core domain structures used across Cube crates.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (for persistence and scheduling) and the compute client
//! (for job submission).

pub mod feed;
pub mod parameter;
pub mod pipeline;
pub mod plugin;
pub mod plugin_instance;
pub mod workflow;
