//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between the store, storage, compute resources and the
//! task queue, and contain the domain logic.

pub mod execution;
pub mod parameters;
pub mod permissions;
pub mod plugin_instance;
pub mod status;
pub mod workflow;

// Re-export for convenience
pub use execution as execution_service;
pub use plugin_instance as plugin_instance_service;
pub use status as status_service;
pub use workflow as workflow_service;

/// Codes recorded on instances cancelled because of a failure
pub mod error_code {
    /// Job submission failed
    pub const RUN_FAILED: &str = "CODE01";
    /// Status check failed
    pub const CHECK_FAILED: &str = "CODE02";
    /// Output file registration failed
    pub const REGISTRATION_FAILED: &str = "CODE03";
    /// The compute resource reported an undefined job phase
    pub const UNDEFINED_PHASE: &str = "CODE10";
    /// Cancellation failed
    pub const CANCEL_FAILED: &str = "CODE11";
    pub const STUCK_IN_LOCK: &str = "CODE12";
}
