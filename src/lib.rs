/*!
 * Scheduler Control Plane Library
 * Userspace side of a kernel-resident pluggable CPU scheduling policy
 */

pub mod bpf;
pub mod callout;
pub mod channels;
pub mod controller;
pub mod core;
pub mod monitoring;

// Re-exports
pub use bpf::{LoadedObject, ObjectArtifact, ObjectLoader, SimKernel, SimulatedObjectBuilder, SimulationLoader};
pub use callout::{CalloutInvoker, CalloutStats, CpuSelection};
pub use channels::{
    ChannelStats, ChannelTuning, DispatchDecision, DispatchSender, ExitEvent, QueuedTask,
};
pub use controller::{
    ResourceRegistry, SchedulerConfig, SchedulerController, SchedulerHandle, SchedulerState,
    SchedulerStats, StateRegion,
};
pub use crate::core::{BpfError, MemoryResidency, ResidencyPolicy, SchedError, SchedResult};
pub use monitoring::init_tracing;

#[cfg(all(target_os = "linux", feature = "libbpf"))]
pub use bpf::LibbpfLoader;
