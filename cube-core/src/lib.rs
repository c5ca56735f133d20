//! Cube Core
//!
//! Core types and abstractions for the plugin-instance execution engine.
//!
//! This crate contains:
//! - Domain types: plugins, pipelines, plugin instances, workflows and feeds
//! - DTOs: requests accepted by the orchestrator and documents exchanged with
//!   the remote compute service
//! - The pipeline tree builder used to expand a pipeline into instances

pub mod dag;
pub mod domain;
pub mod dto;
