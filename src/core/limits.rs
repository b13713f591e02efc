/*!
 * Control Plane Limits and Constants
 *
 * Centralized location for channel capacities, poll intervals and the
 * named contract shared with the kernel-side scheduling program.
 *
 * - Latency-critical constants are marked with [PERF]
 * - Values that are part of the binary contract with the kernel program are
 *   marked with [ABI]
 */

use std::time::Duration;

// =============================================================================
// CPU SELECTION
// =============================================================================

/// Kernel encoding for "any CPU is acceptable"
/// [ABI] Must match the scheduling program's definition
pub const RL_CPU_ANY: i32 = 1 << 20;

// =============================================================================
// EVENT CHANNELS
// =============================================================================

/// Poll timeout for the queued-task ring buffer
/// [PERF] Short interval, queued tasks sit on the scheduling hot path
pub const QUEUED_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// In-process queue capacity for queued tasks
pub const QUEUED_CHANNEL_CAPACITY: usize = 4096;

/// Poll timeout for the exit-event ring buffer
/// Exit events are informational and low rate
pub const EXIT_POLL_TIMEOUT: Duration = Duration::from_millis(300);

/// In-process queue capacity for exit events
pub const EXIT_CHANNEL_CAPACITY: usize = 256;

/// In-process queue capacity for dispatch decisions
pub const DISPATCH_CHANNEL_CAPACITY: usize = 4096;

/// How long the dispatch flush loop waits for a decision before re-checking
/// its stop flag
pub const DISPATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Backoff between attempts when the kernel-visible dispatch buffer is full
/// [PERF] Kept well below a scheduling slice
pub const DISPATCH_FULL_BACKOFF: Duration = Duration::from_micros(200);

/// Granularity at which a blocked poll loop re-checks its stop flag while the
/// in-process queue is full
pub const BACKPRESSURE_RECHECK: Duration = Duration::from_millis(10);

// =============================================================================
// NAMED CONTRACT
// =============================================================================

/// Default object module name used as the prefix of the state regions
pub const DEFAULT_MODULE_NAME: &str = "main_bpf";

/// Kernel-to-userspace ring buffer carrying queued tasks
pub const QUEUED_MAP: &str = "queued";

/// Userspace-to-kernel ring buffer carrying dispatch decisions
pub const DISPATCHED_MAP: &str = "dispatched";

/// Kernel-to-userspace ring buffer carrying exit events
pub const EXIT_MAP: &str = "exit_rb";

/// CPU selection subprogram
pub const SELECT_CPU_PROG: &str = "rs_select_cpu";

/// Sibling domain configuration subprogram
pub const SIBLING_CPU_PROG: &str = "enable_sibling_cpu";

/// Auxiliary instrumentation probes, attached whenever present
pub const PROBE_PROGS: [&str; 2] = ["kprobe_handle_mm_fault", "kretprobe_handle_mm_fault"];

/// Suffix of the zero-initialized state region
pub const BSS_SUFFIX: &str = ".bss";

/// Suffix of the initialized state region
pub const DATA_SUFFIX: &str = ".data";
