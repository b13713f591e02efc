/*!
 * Channel Types
 * Records exchanged with the kernel program and channel statistics
 */

use crate::core::codec::{CodecResult, TaskCpuArg, WireRecord};
use crate::core::types::{CpuId, Pid};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A task the kernel offers to userspace for placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuedTask {
    pub pid: Pid,
    pub cpu: CpuId,
    pub flags: u64,
}

impl From<TaskCpuArg> for QueuedTask {
    fn from(arg: TaskCpuArg) -> Self {
        Self {
            pid: arg.pid,
            cpu: arg.cpu,
            flags: arg.flags,
        }
    }
}

impl From<&QueuedTask> for TaskCpuArg {
    fn from(task: &QueuedTask) -> Self {
        Self {
            pid: task.pid,
            cpu: task.cpu,
            flags: task.flags,
        }
    }
}

/// Where and how to run a previously queued task
///
/// The payload is opaque to the controller and must match the layout the
/// kernel program reads from the `dispatched` ring buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchDecision(Vec<u8>);

impl DispatchDecision {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decision in the `{pid, cpu, flags}` layout
    pub fn for_task(pid: Pid, cpu: CpuId, flags: u64) -> CodecResult<Self> {
        TaskCpuArg { pid, cpu, flags }.encode().map(Self)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// A task exit notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEvent(Vec<u8>);

impl ExitEvent {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Decoding of raw ring buffer records into channel items
pub trait EventRecord: Sized + Send + 'static {
    fn from_record(record: Vec<u8>) -> CodecResult<Self>;
}

impl EventRecord for QueuedTask {
    fn from_record(record: Vec<u8>) -> CodecResult<Self> {
        TaskCpuArg::decode(&record).map(QueuedTask::from)
    }
}

impl EventRecord for ExitEvent {
    fn from_record(record: Vec<u8>) -> CodecResult<Self> {
        Ok(ExitEvent(record))
    }
}

/// Poll interval and queue depth of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTuning {
    /// Ring buffer poll timeout (event channels) or flush wait (dispatch)
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// In-process queue capacity
    pub capacity: usize,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Channel statistics snapshot
///
/// For event channels, `received` counts records read from the kernel and
/// `delivered` counts records handed to consumers. For the dispatch channel,
/// `received` counts decisions taken from the policy layer and `delivered`
/// counts decisions published to the kernel. `stalls` counts waits on a full
/// queue or kernel buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub received: u64,
    pub delivered: u64,
    pub malformed: u64,
    pub discarded: u64,
    pub stalls: u64,
    pub queued: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ChannelCounters {
    pub received: AtomicU64,
    pub delivered: AtomicU64,
    pub malformed: AtomicU64,
    pub discarded: AtomicU64,
    pub stalls: AtomicU64,
}

impl ChannelCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queued: usize) -> ChannelStats {
        ChannelStats {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queued_task_from_record() {
        let record = TaskCpuArg {
            pid: 77,
            cpu: 2,
            flags: 0x10,
        }
        .encode()
        .unwrap();
        let task = QueuedTask::from_record(record).unwrap();
        assert_eq!(
            task,
            QueuedTask {
                pid: 77,
                cpu: 2,
                flags: 0x10
            }
        );
    }

    #[test]
    fn test_short_queued_record_rejected() {
        assert!(QueuedTask::from_record(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn test_dispatch_decision_for_task() {
        let decision = DispatchDecision::for_task(9, 1, 0).unwrap();
        assert_eq!(decision.as_bytes().len(), 16);
        assert_eq!(&decision.as_bytes()[..4], &9i32.to_le_bytes());
    }

    #[test]
    fn test_tuning_serializes_millis() {
        let tuning = ChannelTuning {
            interval: Duration::from_millis(50),
            capacity: 4096,
        };
        let json = serde_json::to_string(&tuning).unwrap();
        assert_eq!(json, r#"{"interval":50,"capacity":4096}"#);
        let back: ChannelTuning = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tuning);
    }
}
