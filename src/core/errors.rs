/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::bpf::BpfError;

/// Controller-level errors
///
/// Load, probe and attach failures are fatal for the handle being built;
/// call-out failures are returned to the caller as-is.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SchedError {
    #[error("Failed to load scheduling object: {0}")]
    #[diagnostic(
        code(sched::load_failed),
        help("Check that the object exists, was built for this kernel, and that the process has CAP_BPF.")
    )]
    Load(String),

    #[error("Resource {name} bound more than once")]
    #[diagnostic(
        code(sched::duplicate_resource),
        help("The object exposes two resources with the same role. Rebuild the scheduling program.")
    )]
    DuplicateResource { name: String },

    #[error("Required resources missing from object: {}", names.join(", "))]
    #[diagnostic(
        code(sched::missing_resources),
        help("The object does not match the controller's named contract.")
    )]
    MissingResources { names: Vec<String> },

    #[error("Failed to attach probe {name}: {reason}")]
    #[diagnostic(code(sched::probe_attach_failed))]
    ProbeAttach { name: String, reason: String },

    #[error("Failed to attach scheduler: {0}")]
    #[diagnostic(
        code(sched::attach_failed),
        help("Another scheduler may already be attached, or the kernel rejected the struct-ops map.")
    )]
    Attach(String),

    #[error("Invalid state transition: {from} -> {to}")]
    #[diagnostic(code(sched::invalid_transition))]
    InvalidTransition { from: String, to: String },

    #[error("Subprogram {name} is not available")]
    #[diagnostic(code(sched::subprogram_unavailable))]
    SubprogramUnavailable { name: String },

    #[error("Invocation of {name} failed: {reason}")]
    #[diagnostic(code(sched::invocation_failed))]
    Invocation { name: String, reason: String },

    #[error("Domain configuration rejected with code {code}")]
    #[diagnostic(
        code(sched::domain_config),
        help("The kernel program rejected the sibling relation. Check level and CPU ids.")
    )]
    DomainConfig { code: u32 },

    #[error("Failed to read state region {name}: {reason}")]
    #[diagnostic(code(sched::state_read))]
    StateRead { name: String, reason: String },

    #[error("Channel error: {0}")]
    #[diagnostic(code(sched::channel))]
    Channel(String),

    #[error("Scheduler handle is closed")]
    #[diagnostic(code(sched::closed))]
    Closed,

    #[error("Failed to lock process memory: {0}")]
    #[diagnostic(
        code(sched::memory_lock),
        help("Raise RLIMIT_MEMLOCK or grant CAP_IPC_LOCK, or set SCHED_MEMLOCK=best_effort.")
    )]
    MemoryLock(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(sched::config))]
    Config(String),
}
