/*!
 * Core Types
 * Common types shared between the controller, channels and call-outs
 */

/// Kernel task identifier as seen by the scheduling program
pub type Pid = i32;

/// CPU index as seen by the scheduling program
pub type CpuId = i32;

/// Topology level identifier used by sibling domain configuration
pub type LevelId = i32;

/// Raw file descriptor reported by the object loader
pub type RawFd = i32;

/// Common result type for controller operations
pub type SchedResult<T> = Result<T, super::errors::SchedError>;
