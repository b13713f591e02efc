/*!
 * Background Worker Guards
 *
 * RAII guards for the channel threads with cooperative cancellation
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error};

/// Cooperative stop signal shared between a guard and its worker
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Named background thread that is stopped and joined on drop
///
/// The worker closure receives a [`StopFlag`] and must observe it at least
/// once per poll interval.
pub struct WorkerGuard {
    name: &'static str,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
    started_at: Instant,
}

impl WorkerGuard {
    /// Spawn a named worker thread
    pub fn spawn<F>(name: &'static str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let stop = StopFlag::new();
        let worker_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(worker_stop))?;

        debug!(worker = name, "Worker started");
        Ok(Self {
            name,
            stop,
            handle: Some(handle),
            started_at: Instant::now(),
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Check if the worker thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    /// Signal the worker and wait for it to exit
    ///
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop.set();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = self.name, "Worker panicked");
            }
            debug!(
                worker = self.name,
                lifetime_ms = self.started_at.elapsed().as_millis() as u64,
                "Worker stopped"
            );
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.stop();
    }
}
