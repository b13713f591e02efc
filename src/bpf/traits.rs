/*!
 * BPF Object Traits
 * Platform-agnostic abstractions over a loaded scheduling object
 */

use super::types::*;
use std::time::Duration;

/// Loads a compiled object and exposes its programs and maps
pub trait ObjectLoader: Send + Sync {
    /// Human readable backend name for logs
    fn backend(&self) -> &'static str;

    /// Load and verify the object
    fn load(&self, artifact: &ObjectArtifact) -> BpfResult<Box<dyn LoadedObject>>;
}

/// A loaded object
///
/// Every operation is keyed by the resource name from the enumeration.
/// Implementations must reject all operations after [`close`](Self::close).
pub trait LoadedObject: Send + Sync {
    /// Enumerate programs
    fn programs(&self) -> Vec<ProgramInfo>;

    /// Enumerate maps
    fn maps(&self) -> Vec<MapInfo>;

    /// Attach a program at its declared attach point
    fn attach_program(&self, name: &str) -> BpfResult<Box<dyn Link>>;

    /// Run a program once with `ctx` as its input context, returning its
    /// return value
    fn run_program(&self, name: &str, ctx: &[u8]) -> BpfResult<u32>;

    /// Bind a kernel-to-userspace ring buffer
    fn ring_buffer(&self, map: &str) -> BpfResult<Box<dyn RingBufferSource>>;

    /// Bind a userspace-to-kernel ring buffer
    fn user_ring_buffer(&self, map: &str) -> BpfResult<Box<dyn UserRingBufferSink>>;

    /// Register a struct-ops map with the kernel
    fn attach_struct_ops(&self, map: &str) -> BpfResult<Box<dyn Link>>;

    /// Look up a single map value
    fn read_map_value(&self, map: &str, key: &[u8]) -> BpfResult<Option<Vec<u8>>>;

    /// Unload the object and release its file descriptors
    fn close(&self) -> BpfResult<()>;
}

/// An active attachment, released by [`detach`](Self::detach) or on drop
pub trait Link: Send {
    fn detach(self: Box<Self>) -> BpfResult<()>;
}

/// A ring buffer binding that can be moved to a poll thread
///
/// Backends whose ring buffer state is not `Send` build it in
/// [`open`](Self::open), which runs on the thread that will poll.
pub trait RingBufferSource: Send {
    fn open(self: Box<Self>) -> BpfResult<Box<dyn RingBufferPoller>>;
}

/// Thread-local poller over a kernel-to-userspace ring buffer
pub trait RingBufferPoller {
    /// Wait up to `timeout` for records and hand each one to `deliver` in
    /// ring order. Returns the number of records delivered.
    fn poll(&mut self, timeout: Duration, deliver: &mut dyn FnMut(Vec<u8>)) -> BpfResult<usize>;
}

/// A user ring buffer binding that can be moved to a flush thread
pub trait UserRingBufferSink: Send {
    fn open(self: Box<Self>) -> BpfResult<Box<dyn UserRingBufferWriter>>;
}

/// Thread-local writer into a userspace-to-kernel ring buffer
pub trait UserRingBufferWriter {
    /// Publish one record. Returns `Ok(false)` if the buffer is full.
    fn try_submit(&mut self, record: &[u8]) -> BpfResult<bool>;
}
