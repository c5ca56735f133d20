//! Data Transfer Objects
//!
//! Requests accepted by the orchestrator and the job documents exchanged with
//! remote compute resources.

pub mod compute;
pub mod workflow;
