/*!
 * Scheduler Handle
 * Exclusive owner of a loaded scheduling object and everything bound to it
 *
 * # Teardown Order
 * `close` stops the exit channel, then the dispatch channel, then the queued
 * channel, detaches the struct-ops link and the probe links, and finally
 * unloads the object. Release errors are logged and never returned.
 */

use super::registry::ResourceRegistry;
use super::types::{SchedulerState, SchedulerStats, StateRegion};
use crate::bpf::{Link, LoadedObject};
use crate::callout::{CalloutInvoker, CpuSelection};
use crate::channels::{DispatchChannel, DispatchSender, EventChannel, ExitEvent, QueuedTask};
use crate::core::errors::SchedError;
use crate::core::types::{CpuId, LevelId, SchedResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A loaded, optionally attached, scheduling policy
pub struct SchedulerHandle {
    backend: &'static str,
    memory_locked: bool,
    state: SchedulerState,
    attach_attempted: bool,
    closed: Arc<AtomicBool>,
    object: Arc<dyn LoadedObject>,
    registry: ResourceRegistry,
    invoker: Arc<CalloutInvoker>,
    probe_links: Vec<(String, Box<dyn Link>)>,
    struct_ops_link: Option<Box<dyn Link>>,
    queued: Option<EventChannel<QueuedTask>>,
    exits: Option<EventChannel<ExitEvent>>,
    dispatch: Option<DispatchChannel>,
}

impl SchedulerHandle {
    /// Empty handle over a freshly loaded object
    ///
    /// Dropping it before it reaches `Loaded` releases whatever was bound.
    pub(super) fn new(
        backend: &'static str,
        memory_locked: bool,
        object: Arc<dyn LoadedObject>,
        registry: ResourceRegistry,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let invoker = Arc::new(CalloutInvoker::new(
            object.clone(),
            Some(registry.select_cpu().name.as_str()),
            Some(registry.sibling_cpu().name.as_str()),
            closed.clone(),
        ));
        Self {
            backend,
            memory_locked,
            state: SchedulerState::Unloaded,
            attach_attempted: false,
            closed,
            object,
            registry,
            invoker,
            probe_links: Vec::new(),
            struct_ops_link: None,
            queued: None,
            exits: None,
            dispatch: None,
        }
    }

    pub(super) fn object(&self) -> &Arc<dyn LoadedObject> {
        &self.object
    }

    pub(super) fn push_probe(&mut self, name: &str, link: Box<dyn Link>) {
        self.probe_links.push((name.to_string(), link));
    }

    pub(super) fn set_channels(
        &mut self,
        queued: EventChannel<QueuedTask>,
        exits: EventChannel<ExitEvent>,
        dispatch: DispatchChannel,
    ) {
        self.queued = Some(queued);
        self.exits = Some(exits);
        self.dispatch = Some(dispatch);
    }

    pub(super) fn mark_loaded(&mut self) -> SchedResult<()> {
        self.state.transition(SchedulerState::Loaded)
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Make the loaded policy the active scheduler
    ///
    /// Valid once, from `Loaded`. A failed attach leaves the handle `Loaded`
    /// with nothing registered, and every later attempt is rejected with
    /// [`SchedError::InvalidTransition`]; the handle can only be closed.
    pub fn attach(&mut self) -> SchedResult<()> {
        if self.is_closed() {
            return Err(SchedError::Closed);
        }
        if self.attach_attempted || !self.state.can_transition_to(SchedulerState::Attached) {
            return Err(SchedError::InvalidTransition {
                from: self.state.to_string(),
                to: SchedulerState::Attached.to_string(),
            });
        }
        self.attach_attempted = true;

        let map = self.registry.struct_ops().name.clone();
        let link = self
            .object
            .attach_struct_ops(&map)
            .map_err(|e| SchedError::Attach(format!("{}: {}", map, e)))?;

        self.struct_ops_link = Some(link);
        self.state.transition(SchedulerState::Attached)?;
        info!(map = %map, backend = self.backend, "Scheduler attached");
        Ok(())
    }

    /// Tear everything down
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Scheduler already closed");
            return;
        }
        let from = self.state;
        info!(state = %from, "Closing scheduler");

        if let Some(channel) = self.exits.as_mut() {
            channel.close();
        }
        if let Some(channel) = self.dispatch.as_mut() {
            channel.close();
        }
        if let Some(channel) = self.queued.as_mut() {
            channel.close();
        }

        if let Some(link) = self.struct_ops_link.take() {
            match link.detach() {
                Ok(()) => info!("Scheduler detached"),
                Err(e) => warn!(error = %e, "Failed to detach struct-ops link"),
            }
        }
        for (name, link) in self.probe_links.drain(..).rev() {
            if let Err(e) = link.detach() {
                warn!(probe = %name, error = %e, "Failed to detach probe");
            }
        }

        if let Err(e) = self.object.close() {
            warn!(error = %e, "Failed to unload scheduling object");
        }

        self.state = SchedulerState::Closed;
        info!(from = %from, "Scheduler closed");
    }

    /// Ask the kernel program where `task` should run
    pub fn select_cpu(&self, task: &QueuedTask) -> SchedResult<CpuSelection> {
        self.invoker.select_cpu(task)
    }

    /// Declare a sibling relation between two CPUs
    pub fn enable_sibling_cpu(
        &self,
        level_id: LevelId,
        cpu_id: CpuId,
        sibling_cpu_id: CpuId,
    ) -> SchedResult<()> {
        self.invoker.enable_sibling_cpu(level_id, cpu_id, sibling_cpu_id)
    }

    /// Shared invoker for policy threads
    ///
    /// Calls through it fail with [`SchedError::Closed`] once the handle is
    /// closed.
    pub fn invoker(&self) -> Arc<CalloutInvoker> {
        self.invoker.clone()
    }

    /// Consumer end of the queued-task stream
    pub fn queued(&self) -> SchedResult<flume::Receiver<QueuedTask>> {
        self.live(self.queued.as_ref()).map(EventChannel::receiver)
    }

    /// Consumer end of the exit-event stream
    pub fn exits(&self) -> SchedResult<flume::Receiver<ExitEvent>> {
        self.live(self.exits.as_ref()).map(EventChannel::receiver)
    }

    /// Producer end of the dispatch-decision stream
    pub fn dispatcher(&self) -> SchedResult<DispatchSender> {
        self.live(self.dispatch.as_ref()).map(DispatchChannel::sender)
    }

    /// Raw value of a persistent state region
    pub fn state_snapshot(&self, region: StateRegion) -> SchedResult<Option<Vec<u8>>> {
        if self.is_closed() {
            return Err(SchedError::Closed);
        }
        let map = &self.registry.state_region(region).name;
        self.object
            .read_map_value(map, &0u32.to_le_bytes())
            .map_err(|e| SchedError::StateRead {
                name: map.clone(),
                reason: e.to_string(),
            })
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            state: self.state,
            backend: self.backend.to_string(),
            memory_locked: self.memory_locked,
            queued: self
                .queued
                .as_ref()
                .map(EventChannel::stats)
                .unwrap_or_default(),
            exits: self
                .exits
                .as_ref()
                .map(EventChannel::stats)
                .unwrap_or_default(),
            dispatch: self
                .dispatch
                .as_ref()
                .map(DispatchChannel::stats)
                .unwrap_or_default(),
            callouts: self.invoker.stats(),
        }
    }

    fn live<'a, T>(&self, channel: Option<&'a T>) -> SchedResult<&'a T> {
        if self.is_closed() {
            return Err(SchedError::Closed);
        }
        channel.ok_or(SchedError::Closed)
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.close();
    }
}
