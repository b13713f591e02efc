/*!
 * Event Channel
 * Kernel-to-userspace ring buffer drained into a bounded in-process queue
 *
 * A dedicated thread polls the ring buffer with a fixed timeout and pushes
 * each decoded record into the queue. When the queue is full the push blocks
 * the poll loop, so backpressure reaches the kernel ring instead of records
 * being dropped after they were read.
 */

use super::types::{ChannelCounters, ChannelStats, ChannelTuning, EventRecord};
use crate::bpf::{RingBufferPoller, RingBufferSource};
use crate::core::errors::SchedError;
use crate::core::limits::BACKPRESSURE_RECHECK;
use crate::core::types::SchedResult;
use crate::core::worker::{StopFlag, WorkerGuard};
use flume::{SendTimeoutError, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bounded, FIFO stream of records from one kernel ring buffer
pub struct EventChannel<T: EventRecord> {
    map: String,
    rx: flume::Receiver<T>,
    counters: Arc<ChannelCounters>,
    worker: Option<WorkerGuard>,
}

impl<T: EventRecord> EventChannel<T> {
    /// Bind `source` and start polling it on a thread named `worker`
    ///
    /// Returns once the ring buffer has been opened on the poll thread.
    pub fn start(
        map: &str,
        worker: &'static str,
        source: Box<dyn RingBufferSource>,
        tuning: ChannelTuning,
    ) -> SchedResult<Self> {
        let (tx, rx) = flume::bounded(tuning.capacity.max(1));
        let counters = Arc::new(ChannelCounters::default());
        let (ready_tx, ready_rx) = flume::bounded(1);

        let loop_counters = counters.clone();
        let loop_map = map.to_string();
        let guard = WorkerGuard::spawn(worker, move |stop| {
            let poller = match source.open() {
                Ok(poller) => {
                    let _ = ready_tx.send(Ok(()));
                    poller
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            poll_loop(&loop_map, poller, tuning.interval, tx, &loop_counters, &stop);
        })
        .map_err(|e| SchedError::Channel(format!("failed to spawn {}: {}", worker, e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(SchedError::Channel(format!(
                    "failed to open ring buffer {}: {}",
                    map, reason
                )))
            }
            Err(_) => {
                return Err(SchedError::Channel(format!(
                    "poll thread for {} exited during startup",
                    map
                )))
            }
        }

        info!(
            map,
            poll_timeout_ms = tuning.interval.as_millis() as u64,
            capacity = tuning.capacity,
            "Event channel started"
        );
        Ok(Self {
            map: map.to_string(),
            rx,
            counters,
            worker: Some(guard),
        })
    }

    /// Map this channel is bound to
    pub fn map(&self) -> &str {
        &self.map
    }

    /// Consumer end of the in-process queue
    ///
    /// Receivers may be cloned freely; each record is delivered to exactly
    /// one of them.
    pub fn receiver(&self) -> flume::Receiver<T> {
        self.rx.clone()
    }

    #[inline]
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot(self.rx.len())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.is_finished())
            .unwrap_or(false)
    }

    /// Stop the poll thread and release the ring buffer
    ///
    /// Records already queued stay readable. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            let stats = self.stats();
            info!(
                map = %self.map,
                received = stats.received,
                delivered = stats.delivered,
                discarded = stats.discarded,
                "Event channel closed"
            );
        }
    }
}

impl<T: EventRecord> Drop for EventChannel<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn poll_loop<T: EventRecord>(
    map: &str,
    mut poller: Box<dyn RingBufferPoller>,
    timeout: Duration,
    tx: flume::Sender<T>,
    counters: &ChannelCounters,
    stop: &StopFlag,
) {
    debug!(map, "Poll loop running");
    while !stop.is_set() {
        let result = poller.poll(timeout, &mut |record| {
            ChannelCounters::bump(&counters.received);
            match T::from_record(record) {
                Ok(event) => deliver(map, &tx, event, counters, stop),
                Err(e) => {
                    ChannelCounters::bump(&counters.malformed);
                    warn!(map, error = %e, "Malformed ring buffer record");
                }
            }
        });

        if let Err(e) = result {
            error!(map, error = %e, "Ring buffer poll failed");
            std::thread::sleep(timeout);
        }
    }
    debug!(map, "Poll loop exiting");
}

/// Push one record, blocking while the queue is full
///
/// Gives up only once the channel is stopping, and counts the record as
/// discarded when it does.
fn deliver<T>(
    map: &str,
    tx: &flume::Sender<T>,
    event: T,
    counters: &ChannelCounters,
    stop: &StopFlag,
) {
    let mut pending = match tx.try_send(event) {
        Ok(()) => {
            ChannelCounters::bump(&counters.delivered);
            return;
        }
        Err(TrySendError::Full(event)) => event,
        Err(TrySendError::Disconnected(_)) => {
            ChannelCounters::bump(&counters.discarded);
            return;
        }
    };

    ChannelCounters::bump(&counters.stalls);
    loop {
        if stop.is_set() {
            ChannelCounters::bump(&counters.discarded);
            warn!(map, "Channel stopping with a full queue, record discarded");
            return;
        }
        match tx.send_timeout(pending, BACKPRESSURE_RECHECK) {
            Ok(()) => {
                ChannelCounters::bump(&counters.delivered);
                return;
            }
            Err(SendTimeoutError::Timeout(event)) => pending = event,
            Err(SendTimeoutError::Disconnected(_)) => {
                ChannelCounters::bump(&counters.discarded);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::{LoadedObject, ObjectArtifact, ObjectLoader, SimulatedObjectBuilder};
    use crate::channels::types::{ExitEvent, QueuedTask};
    use crate::core::limits::{EXIT_MAP, QUEUED_MAP};

    fn tuning(capacity: usize) -> ChannelTuning {
        ChannelTuning {
            interval: Duration::from_millis(5),
            capacity,
        }
    }

    fn load(builder: SimulatedObjectBuilder) -> (Box<dyn LoadedObject>, crate::bpf::SimKernel) {
        let (loader, kernel) = builder.build();
        let object = loader
            .load(&ObjectArtifact::Path("test.bpf.o".into()))
            .unwrap();
        (object, kernel)
    }

    #[test]
    fn test_fifo_delivery() {
        let (object, kernel) = load(SimulatedObjectBuilder::default());
        let channel: EventChannel<QueuedTask> = EventChannel::start(
            QUEUED_MAP,
            "test-queued",
            object.ring_buffer(QUEUED_MAP).unwrap(),
            tuning(16),
        )
        .unwrap();

        for pid in 1..=5 {
            assert!(kernel.enqueue_task(pid, 0, 0));
        }

        let pids: Vec<i32> = (0..5)
            .map(|_| channel.recv_timeout(Duration::from_secs(1)).unwrap().pid)
            .collect();
        assert_eq!(pids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_malformed_records_counted() {
        let (object, kernel) = load(SimulatedObjectBuilder::default());
        let channel: EventChannel<QueuedTask> = EventChannel::start(
            QUEUED_MAP,
            "test-malformed",
            object.ring_buffer(QUEUED_MAP).unwrap(),
            tuning(16),
        )
        .unwrap();

        assert!(kernel.produce(QUEUED_MAP, vec![0u8; 3]));
        assert!(kernel.enqueue_task(10, 1, 0));

        let task = channel.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(task.pid, 10);
        let stats = channel.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.received, 2);
    }

    #[test]
    fn test_full_queue_blocks_instead_of_dropping() {
        let (object, kernel) = load(SimulatedObjectBuilder::default());
        let channel: EventChannel<ExitEvent> = EventChannel::start(
            EXIT_MAP,
            "test-backpressure",
            object.ring_buffer(EXIT_MAP).unwrap(),
            tuning(2),
        )
        .unwrap();

        for i in 0..6u8 {
            assert!(kernel.emit_exit(&[i]));
        }
        std::thread::sleep(Duration::from_millis(50));

        // Two queued, one held by the blocked poll loop, rest still in the ring.
        let stats = channel.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.discarded, 0);
        assert!(stats.stalls >= 1);
        assert!(kernel.pending(EXIT_MAP) >= 3);

        let seen: Vec<u8> = (0..6)
            .map(|_| channel.recv_timeout(Duration::from_secs(1)).unwrap().as_bytes()[0])
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(channel.stats().discarded, 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (object, _kernel) = load(SimulatedObjectBuilder::default());
        let mut channel: EventChannel<ExitEvent> = EventChannel::start(
            EXIT_MAP,
            "test-close",
            object.ring_buffer(EXIT_MAP).unwrap(),
            tuning(4),
        )
        .unwrap();

        assert!(channel.is_running());
        channel.close();
        channel.close();
        assert!(!channel.is_running());
    }
}
