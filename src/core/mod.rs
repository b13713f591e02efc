/*!
 * Core Module
 * Fundamental types, error handling, wire encoding and startup primitives
 */

pub mod codec;
pub mod errors;
pub mod limits;
pub mod memory;
pub mod types;
pub mod worker;

// Re-export for convenience
pub use codec::{CodecError, CodecResult, DomainArg, TaskCpuArg, WireRecord};
pub use errors::*;
pub use memory::{MemoryResidency, ResidencyPolicy};
pub use types::*;
pub use worker::{StopFlag, WorkerGuard};
