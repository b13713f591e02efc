/*!
 * Dispatch Channel
 * Bounded in-process queue flushed into a userspace-to-kernel ring buffer
 *
 * The policy layer writes decisions through a [`DispatchSender`]. A flush
 * thread moves them, in order, into the kernel-visible buffer. A full kernel
 * buffer stalls the flush thread, which fills the in-process queue, which
 * blocks `DispatchSender::send`: that chain is the only backpressure the
 * policy layer sees.
 *
 * Every send attempt holds the read side of the gate. `close` takes the write
 * side before stopping the flush thread, so no decision can enter the queue
 * once the drain has started.
 */

use super::types::{ChannelCounters, ChannelStats, ChannelTuning, DispatchDecision};
use crate::bpf::{UserRingBufferSink, UserRingBufferWriter};
use crate::core::errors::SchedError;
use crate::core::limits::{BACKPRESSURE_RECHECK, DISPATCH_FULL_BACKOFF};
use crate::core::types::SchedResult;
use crate::core::worker::{StopFlag, WorkerGuard};
use flume::{RecvTimeoutError, SendTimeoutError, TrySendError};
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Producer handle for dispatch decisions
#[derive(Clone)]
pub struct DispatchSender {
    tx: flume::Sender<DispatchDecision>,
    gate: Arc<RwLock<bool>>,
}

impl DispatchSender {
    /// Queue a decision, blocking while the queue is full
    pub fn send(&self, decision: DispatchDecision) -> SchedResult<()> {
        let mut pending = decision;
        loop {
            let closed = self.gate.read();
            if *closed {
                return Err(SchedError::Closed);
            }
            match self.tx.send_timeout(pending, BACKPRESSURE_RECHECK) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(decision)) => pending = decision,
                Err(SendTimeoutError::Disconnected(_)) => return Err(SchedError::Closed),
            }
            // Let a pending close take the gate between attempts.
            drop(closed);
        }
    }

    /// Queue a decision without blocking
    ///
    /// Returns the decision back if the queue is full.
    pub fn try_send(&self, decision: DispatchDecision) -> SchedResult<Option<DispatchDecision>> {
        let closed = self.gate.read();
        if *closed {
            return Err(SchedError::Closed);
        }
        match self.tx.try_send(decision) {
            Ok(()) => Ok(None),
            Err(TrySendError::Full(decision)) => Ok(Some(decision)),
            Err(TrySendError::Disconnected(_)) => Err(SchedError::Closed),
        }
    }

    /// Decisions waiting to be flushed
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }
}

/// Userspace-to-kernel decision stream
pub struct DispatchChannel {
    map: String,
    sender: DispatchSender,
    counters: Arc<ChannelCounters>,
    worker: Option<WorkerGuard>,
}

impl DispatchChannel {
    /// Bind `sink` and start the flush thread named `worker`
    pub fn start(
        map: &str,
        worker: &'static str,
        sink: Box<dyn UserRingBufferSink>,
        tuning: ChannelTuning,
    ) -> SchedResult<Self> {
        let (tx, rx) = flume::bounded(tuning.capacity.max(1));
        let counters = Arc::new(ChannelCounters::default());
        let (ready_tx, ready_rx) = flume::bounded(1);

        let loop_counters = counters.clone();
        let loop_map = map.to_string();
        let guard = WorkerGuard::spawn(worker, move |stop| {
            let writer = match sink.open() {
                Ok(writer) => {
                    let _ = ready_tx.send(Ok(()));
                    writer
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            flush_loop(&loop_map, writer, rx, tuning.interval, &loop_counters, &stop);
        })
        .map_err(|e| SchedError::Channel(format!("failed to spawn {}: {}", worker, e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(SchedError::Channel(format!(
                    "failed to open user ring buffer {}: {}",
                    map, reason
                )))
            }
            Err(_) => {
                return Err(SchedError::Channel(format!(
                    "flush thread for {} exited during startup",
                    map
                )))
            }
        }

        info!(map, capacity = tuning.capacity, "Dispatch channel started");
        Ok(Self {
            map: map.to_string(),
            sender: DispatchSender {
                tx,
                gate: Arc::new(RwLock::new(false)),
            },
            counters,
            worker: Some(guard),
        })
    }

    pub fn map(&self) -> &str {
        &self.map
    }

    /// Producer handle for the policy layer
    pub fn sender(&self) -> DispatchSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot(self.sender.backlog())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.is_finished())
            .unwrap_or(false)
    }

    /// Stop accepting decisions and stop the flush thread
    ///
    /// Decisions still queued are discarded and counted. A `send` blocked
    /// on the full queue returns [`SchedError::Closed`]. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        *self.sender.gate.write() = true;
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            let stats = self.stats();
            info!(
                map = %self.map,
                flushed = stats.delivered,
                discarded = stats.discarded,
                "Dispatch channel closed"
            );
        }
    }
}

impl Drop for DispatchChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn flush_loop(
    map: &str,
    mut writer: Box<dyn UserRingBufferWriter>,
    rx: flume::Receiver<DispatchDecision>,
    wait: Duration,
    counters: &ChannelCounters,
    stop: &StopFlag,
) {
    debug!(map, "Flush loop running");
    while !stop.is_set() {
        match rx.recv_timeout(wait) {
            Ok(decision) => {
                ChannelCounters::bump(&counters.received);
                publish(map, writer.as_mut(), &decision, counters, stop);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let abandoned = rx.drain().count();
    if abandoned > 0 {
        counters
            .discarded
            .fetch_add(abandoned as u64, Ordering::Relaxed);
        warn!(map, abandoned, "Dispatch decisions discarded at shutdown");
    }
    debug!(map, "Flush loop exiting");
}

/// Publish one decision, retrying while the kernel buffer is full
fn publish(
    map: &str,
    writer: &mut dyn UserRingBufferWriter,
    decision: &DispatchDecision,
    counters: &ChannelCounters,
    stop: &StopFlag,
) {
    loop {
        match writer.try_submit(decision.as_bytes()) {
            Ok(true) => {
                ChannelCounters::bump(&counters.delivered);
                return;
            }
            Ok(false) => {
                ChannelCounters::bump(&counters.stalls);
                if stop.is_set() {
                    ChannelCounters::bump(&counters.discarded);
                    return;
                }
                std::thread::sleep(DISPATCH_FULL_BACKOFF);
            }
            Err(e) => {
                ChannelCounters::bump(&counters.discarded);
                error!(map, error = %e, "Failed to publish dispatch decision");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::{ObjectArtifact, ObjectLoader, SimulatedObjectBuilder};
    use crate::core::limits::DISPATCHED_MAP;

    fn start(capacity: usize, ring: usize) -> (DispatchChannel, crate::bpf::SimKernel) {
        let (loader, kernel) = SimulatedObjectBuilder::default()
            .ring_capacity(ring)
            .build();
        let object = loader
            .load(&ObjectArtifact::Path("test.bpf.o".into()))
            .unwrap();
        let channel = DispatchChannel::start(
            DISPATCHED_MAP,
            "test-dispatch",
            object.user_ring_buffer(DISPATCHED_MAP).unwrap(),
            ChannelTuning {
                interval: Duration::from_millis(5),
                capacity,
            },
        )
        .unwrap();
        (channel, kernel)
    }

    #[test]
    fn test_flush_preserves_order() {
        let (channel, kernel) = start(16, 16);
        let sender = channel.sender();
        for i in 0..4u8 {
            sender.send(DispatchDecision::from_bytes(vec![i])).unwrap();
        }

        let seen: Vec<u8> = (0..4)
            .map(|_| kernel.recv_dispatched(Duration::from_secs(1)).unwrap()[0])
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_full_kernel_buffer_backs_up_queue() {
        let (channel, kernel) = start(2, 1);
        let sender = channel.sender();

        // One in the kernel ring, one held by the flush loop, two queued.
        for i in 0..4u8 {
            sender.send(DispatchDecision::from_bytes(vec![i])).unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
        let overflow = sender.try_send(DispatchDecision::from_bytes(vec![9])).unwrap();
        assert!(overflow.is_some());
        assert!(channel.stats().stalls > 0);

        let seen: Vec<u8> = (0..4)
            .map(|_| kernel.recv_dispatched(Duration::from_secs(1)).unwrap()[0])
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_close_rejects_blocked_send_and_counts_queue() {
        let (mut channel, kernel) = start(1, 1);
        let sender = channel.sender();

        // Ring holds 0, the stalled flush holds 1, the queue holds 2.
        for i in 0..3u8 {
            sender.send(DispatchDecision::from_bytes(vec![i])).unwrap();
        }
        let blocked = {
            let sender = sender.clone();
            std::thread::spawn(move || sender.send(DispatchDecision::from_bytes(vec![3])))
        };
        std::thread::sleep(Duration::from_millis(30));
        channel.close();

        assert_eq!(blocked.join().unwrap(), Err(SchedError::Closed));
        assert_eq!(
            sender.try_send(DispatchDecision::from_bytes(vec![4])),
            Err(SchedError::Closed)
        );
        let stats = channel.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.discarded, 2);
        assert_eq!(stats.queued, 0);
        assert_eq!(kernel.drain_dispatched(), vec![vec![0]]);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (mut channel, _kernel) = start(4, 4);
        let sender = channel.sender();
        channel.close();
        channel.close();
        assert_eq!(
            sender.send(DispatchDecision::from_bytes(vec![1])),
            Err(SchedError::Closed)
        );
        assert!(!channel.is_running());
    }
}
