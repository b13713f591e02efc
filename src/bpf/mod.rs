/*!
 * BPF Object Module
 * Loader seam between the controller and a compiled scheduling object
 */

mod simulation;
mod traits;
mod types;

#[cfg(all(target_os = "linux", feature = "libbpf"))]
pub mod linux;

pub use simulation::{ProgramHandler, SimKernel, SimulatedObjectBuilder, SimulationLoader};
pub use traits::*;
pub use types::*;

#[cfg(all(target_os = "linux", feature = "libbpf"))]
pub use linux::LibbpfLoader;
