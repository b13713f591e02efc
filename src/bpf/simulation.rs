/*!
 * Simulation Object Loader
 * In-memory scheduling object for testing and unsupported platforms
 *
 * Subprograms are Rust closures, ring buffers are bounded in-process queues,
 * and every lifecycle step is appended to a journal so tests can assert on
 * ordering. [`SimKernel`] is the kernel-side view: it produces queued tasks
 * and exit events and consumes dispatch decisions.
 */

use super::traits::*;
use super::types::*;
use crate::core::codec::{TaskCpuArg, WireRecord};
use crate::core::limits::{
    DEFAULT_MODULE_NAME, DISPATCHED_MAP, EXIT_MAP, PROBE_PROGS, QUEUED_MAP, SELECT_CPU_PROG,
    SIBLING_CPU_PROG,
};
use ahash::RandomState;
use dashmap::DashMap;
use flume::{RecvTimeoutError, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default capacity of each simulated kernel ring buffer, in records
const SIM_RING_CAPACITY: usize = 1024;

/// Simulated subprogram body: input context in, return value out
pub type ProgramHandler = Arc<dyn Fn(&[u8]) -> BpfResult<u32> + Send + Sync>;

struct SimRing {
    tx: flume::Sender<Vec<u8>>,
    rx: flume::Receiver<Vec<u8>>,
}

struct SimState {
    programs: Vec<ProgramInfo>,
    maps: Vec<MapInfo>,
    handlers: RwLock<HashMap<String, ProgramHandler>>,
    rings: HashMap<String, SimRing>,
    values: RwLock<HashMap<String, Vec<u8>>>,
    run_counts: DashMap<String, u64, RandomState>,
    failing_attach: RwLock<HashSet<String>>,
    journal: Mutex<Vec<String>>,
    struct_ops_attached: AtomicBool,
    unloaded: AtomicBool,
}

impl SimState {
    fn record(&self, entry: impl Into<String>) {
        self.journal.lock().push(entry.into());
    }

    fn ensure_loaded(&self) -> BpfResult<()> {
        if self.unloaded.load(Ordering::Acquire) {
            return Err(BpfError::Unloaded);
        }
        Ok(())
    }

    fn map(&self, name: &str) -> BpfResult<&MapInfo> {
        self.maps
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| BpfError::MapNotFound {
                name: name.to_string(),
            })
    }

    fn ring(&self, name: &str, expected: MapKind) -> BpfResult<&SimRing> {
        let map = self.map(name)?;
        if map.kind != expected {
            return Err(BpfError::MapError {
                reason: format!("{} is {}, expected {}", name, map.kind, expected),
            });
        }
        self.rings.get(name).ok_or_else(|| BpfError::MapNotFound {
            name: name.to_string(),
        })
    }
}

/// Builder for a simulated object
pub struct SimulatedObjectBuilder {
    programs: Vec<ProgramInfo>,
    maps: Vec<(String, MapKind)>,
    handlers: HashMap<String, ProgramHandler>,
    values: HashMap<String, Vec<u8>>,
    failing_attach: HashSet<String>,
    ring_capacity: usize,
    load_error: Option<String>,
}

impl SimulatedObjectBuilder {
    /// Empty object
    pub fn new() -> Self {
        Self {
            programs: Vec::new(),
            maps: Vec::new(),
            handlers: HashMap::new(),
            values: HashMap::new(),
            failing_attach: HashSet::new(),
            ring_capacity: SIM_RING_CAPACITY,
            load_error: None,
        }
    }

    /// Object exposing every resource the controller recognizes
    ///
    /// The selection subprogram echoes the task's `cpu` field back (so a
    /// negative cpu comes back as "any"), and the sibling subprogram accepts
    /// every relation.
    pub fn scheduler_contract(module: &str) -> Self {
        let mut builder = Self::new()
            .map(&format!("{}.bss", module), MapKind::Array)
            .map(&format!("{}.data", module), MapKind::Array)
            .map(&format!("{}.rodata", module), MapKind::Array)
            .map(QUEUED_MAP, MapKind::RingBuf)
            .map(DISPATCHED_MAP, MapKind::UserRingBuf)
            .map(EXIT_MAP, MapKind::RingBuf)
            .map("sched_ops", MapKind::StructOps)
            .program("rustland_enqueue", ProgramKind::StructOps)
            .program(SELECT_CPU_PROG, ProgramKind::Syscall)
            .program(SIBLING_CPU_PROG, ProgramKind::Syscall);
        for probe in PROBE_PROGS {
            builder = builder.program(probe, ProgramKind::Kprobe);
        }
        builder
            .handler(SELECT_CPU_PROG, |ctx| {
                let arg = TaskCpuArg::decode(ctx).map_err(|e| BpfError::RunFailed {
                    reason: e.to_string(),
                })?;
                Ok(arg.cpu as u32)
            })
            .handler(SIBLING_CPU_PROG, |_| Ok(0))
    }

    pub fn program(mut self, name: &str, kind: ProgramKind) -> Self {
        self.programs.push(ProgramInfo {
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn map(mut self, name: &str, kind: MapKind) -> Self {
        self.maps.push((name.to_string(), kind));
        self
    }

    /// Drop a program or map by name
    pub fn without(mut self, name: &str) -> Self {
        self.programs.retain(|p| p.name != name);
        self.maps.retain(|(n, _)| n != name);
        self
    }

    pub fn handler<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&[u8]) -> BpfResult<u32> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Seed the value stored under key 0 of a map
    pub fn map_value(mut self, name: &str, value: Vec<u8>) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    /// Make attaching `name` (program or struct-ops map) fail
    pub fn failing_attach(mut self, name: &str) -> Self {
        self.failing_attach.insert(name.to_string());
        self
    }

    /// Make the load itself fail
    pub fn failing_load(mut self, reason: &str) -> Self {
        self.load_error = Some(reason.to_string());
        self
    }

    /// Capacity of each kernel ring buffer, in records
    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> (SimulationLoader, SimKernel) {
        let mut rings = HashMap::new();
        let maps = self
            .maps
            .into_iter()
            .enumerate()
            .map(|(idx, (name, kind))| {
                if matches!(kind, MapKind::RingBuf | MapKind::UserRingBuf) {
                    let (tx, rx) = flume::bounded(self.ring_capacity);
                    rings.insert(name.clone(), SimRing { tx, rx });
                }
                MapInfo {
                    name,
                    kind,
                    // fds 0..2 are stdio
                    fd: 3 + idx as i32,
                }
            })
            .collect();

        let state = Arc::new(SimState {
            programs: self.programs,
            maps,
            handlers: RwLock::new(self.handlers),
            rings,
            values: RwLock::new(self.values),
            run_counts: DashMap::with_hasher(RandomState::new()),
            failing_attach: RwLock::new(self.failing_attach),
            journal: Mutex::new(Vec::new()),
            struct_ops_attached: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
        });

        let loader = SimulationLoader {
            state: state.clone(),
            load_error: self.load_error,
            loaded: AtomicBool::new(false),
        };
        (loader, SimKernel { state })
    }
}

impl Default for SimulatedObjectBuilder {
    fn default() -> Self {
        Self::scheduler_contract(DEFAULT_MODULE_NAME)
    }
}

/// Loader handing out a single simulated object
pub struct SimulationLoader {
    state: Arc<SimState>,
    load_error: Option<String>,
    loaded: AtomicBool,
}

impl ObjectLoader for SimulationLoader {
    fn backend(&self) -> &'static str {
        "simulation"
    }

    fn load(&self, artifact: &ObjectArtifact) -> BpfResult<Box<dyn LoadedObject>> {
        if let Some(reason) = &self.load_error {
            return Err(BpfError::LoadFailed {
                reason: reason.clone(),
            });
        }
        if self.loaded.swap(true, Ordering::AcqRel) {
            return Err(BpfError::LoadFailed {
                reason: "simulated object already loaded".to_string(),
            });
        }
        self.state.record(format!("load:{}", artifact.describe()));
        Ok(Box::new(SimObject {
            state: self.state.clone(),
        }))
    }
}

struct SimObject {
    state: Arc<SimState>,
}

impl LoadedObject for SimObject {
    fn programs(&self) -> Vec<ProgramInfo> {
        self.state.programs.clone()
    }

    fn maps(&self) -> Vec<MapInfo> {
        self.state.maps.clone()
    }

    fn attach_program(&self, name: &str) -> BpfResult<Box<dyn Link>> {
        self.state.ensure_loaded()?;
        if !self.state.programs.iter().any(|p| p.name == name) {
            return Err(BpfError::ProgramNotFound {
                name: name.to_string(),
            });
        }
        if self.state.failing_attach.read().contains(name) {
            return Err(BpfError::AttachFailed {
                reason: format!("simulated attach failure for {}", name),
            });
        }
        self.state.record(format!("attach:{}", name));
        Ok(Box::new(SimLink {
            state: self.state.clone(),
            label: name.to_string(),
            struct_ops: false,
            active: true,
        }))
    }

    fn run_program(&self, name: &str, ctx: &[u8]) -> BpfResult<u32> {
        self.state.ensure_loaded()?;
        let handler = self
            .state
            .handlers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BpfError::ProgramNotFound {
                name: name.to_string(),
            })?;
        *self.state.run_counts.entry(name.to_string()).or_insert(0) += 1;
        handler(ctx)
    }

    fn ring_buffer(&self, map: &str) -> BpfResult<Box<dyn RingBufferSource>> {
        self.state.ensure_loaded()?;
        let ring = self.state.ring(map, MapKind::RingBuf)?;
        Ok(Box::new(SimRingSource {
            state: self.state.clone(),
            map: map.to_string(),
            rx: ring.rx.clone(),
        }))
    }

    fn user_ring_buffer(&self, map: &str) -> BpfResult<Box<dyn UserRingBufferSink>> {
        self.state.ensure_loaded()?;
        let ring = self.state.ring(map, MapKind::UserRingBuf)?;
        Ok(Box::new(SimUserRingSink {
            state: self.state.clone(),
            map: map.to_string(),
            tx: ring.tx.clone(),
        }))
    }

    fn attach_struct_ops(&self, map: &str) -> BpfResult<Box<dyn Link>> {
        self.state.ensure_loaded()?;
        let info = self.state.map(map)?;
        if info.kind != MapKind::StructOps {
            return Err(BpfError::AttachFailed {
                reason: format!("{} is not a struct-ops map", map),
            });
        }
        if self.state.failing_attach.read().contains(map) {
            return Err(BpfError::AttachFailed {
                reason: format!("simulated struct-ops attach failure for {}", map),
            });
        }
        if self.state.struct_ops_attached.swap(true, Ordering::AcqRel) {
            return Err(BpfError::AttachFailed {
                reason: "a scheduler is already attached".to_string(),
            });
        }
        self.state.record(format!("struct_ops:{}", map));
        Ok(Box::new(SimLink {
            state: self.state.clone(),
            label: map.to_string(),
            struct_ops: true,
            active: true,
        }))
    }

    fn read_map_value(&self, map: &str, _key: &[u8]) -> BpfResult<Option<Vec<u8>>> {
        self.state.ensure_loaded()?;
        self.state.map(map)?;
        Ok(self.state.values.read().get(map).cloned())
    }

    fn close(&self) -> BpfResult<()> {
        if self.state.unloaded.swap(true, Ordering::AcqRel) {
            return Err(BpfError::Unloaded);
        }
        self.state.record("close");
        Ok(())
    }
}

struct SimLink {
    state: Arc<SimState>,
    label: String,
    struct_ops: bool,
    active: bool,
}

impl SimLink {
    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if self.struct_ops {
            self.state.struct_ops_attached.store(false, Ordering::Release);
        }
        self.state.record(format!("detach:{}", self.label));
    }
}

impl Link for SimLink {
    fn detach(mut self: Box<Self>) -> BpfResult<()> {
        self.release();
        Ok(())
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.release();
    }
}

struct SimRingSource {
    state: Arc<SimState>,
    map: String,
    rx: flume::Receiver<Vec<u8>>,
}

impl RingBufferSource for SimRingSource {
    fn open(self: Box<Self>) -> BpfResult<Box<dyn RingBufferPoller>> {
        self.state.record(format!("open:{}", self.map));
        Ok(Box::new(SimRingPoller {
            state: self.state,
            map: self.map,
            rx: self.rx,
        }))
    }
}

struct SimRingPoller {
    state: Arc<SimState>,
    map: String,
    rx: flume::Receiver<Vec<u8>>,
}

impl RingBufferPoller for SimRingPoller {
    fn poll(&mut self, timeout: Duration, deliver: &mut dyn FnMut(Vec<u8>)) -> BpfResult<usize> {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(record) => record,
            Err(RecvTimeoutError::Timeout) => return Ok(0),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(BpfError::MapError {
                    reason: format!("ring buffer {} disconnected", self.map),
                })
            }
        };
        deliver(first);

        let mut delivered = 1;
        while let Ok(record) = self.rx.try_recv() {
            deliver(record);
            delivered += 1;
        }
        Ok(delivered)
    }
}

impl Drop for SimRingPoller {
    fn drop(&mut self) {
        self.state.record(format!("release:{}", self.map));
    }
}

struct SimUserRingSink {
    state: Arc<SimState>,
    map: String,
    tx: flume::Sender<Vec<u8>>,
}

impl UserRingBufferSink for SimUserRingSink {
    fn open(self: Box<Self>) -> BpfResult<Box<dyn UserRingBufferWriter>> {
        self.state.record(format!("open:{}", self.map));
        Ok(Box::new(SimUserRingWriter {
            state: self.state,
            map: self.map,
            tx: self.tx,
        }))
    }
}

struct SimUserRingWriter {
    state: Arc<SimState>,
    map: String,
    tx: flume::Sender<Vec<u8>>,
}

impl UserRingBufferWriter for SimUserRingWriter {
    fn try_submit(&mut self, record: &[u8]) -> BpfResult<bool> {
        match self.tx.try_send(record.to_vec()) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(BpfError::MapError {
                reason: format!("user ring buffer {} disconnected", self.map),
            }),
        }
    }
}

impl Drop for SimUserRingWriter {
    fn drop(&mut self) {
        self.state.record(format!("release:{}", self.map));
    }
}

/// Kernel-side view of a simulated object
#[derive(Clone)]
pub struct SimKernel {
    state: Arc<SimState>,
}

impl SimKernel {
    /// Produce a raw record on a kernel-to-userspace ring buffer
    ///
    /// Returns false if the ring is full (the kernel would drop the record).
    pub fn produce(&self, map: &str, record: Vec<u8>) -> bool {
        match self.state.rings.get(map) {
            Some(ring) => ring.tx.try_send(record).is_ok(),
            None => false,
        }
    }

    /// Offer a task on the `queued` ring buffer
    pub fn enqueue_task(&self, pid: i32, cpu: i32, flags: u64) -> bool {
        match (TaskCpuArg { pid, cpu, flags }).encode() {
            Ok(record) => self.produce(QUEUED_MAP, record),
            Err(_) => false,
        }
    }

    /// Emit an exit event on the `exit_rb` ring buffer
    pub fn emit_exit(&self, payload: &[u8]) -> bool {
        self.produce(EXIT_MAP, payload.to_vec())
    }

    /// Records waiting in a ring buffer
    pub fn pending(&self, map: &str) -> usize {
        self.state.rings.get(map).map(|r| r.rx.len()).unwrap_or(0)
    }

    /// Consume one dispatch decision, waiting up to `timeout`
    pub fn recv_dispatched(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.state
            .rings
            .get(DISPATCHED_MAP)
            .and_then(|r| r.rx.recv_timeout(timeout).ok())
    }

    /// Consume every dispatch decision currently published
    pub fn drain_dispatched(&self) -> Vec<Vec<u8>> {
        self.state
            .rings
            .get(DISPATCHED_MAP)
            .map(|r| r.rx.try_iter().collect())
            .unwrap_or_default()
    }

    /// Replace a subprogram body
    pub fn set_handler<F>(&self, name: &str, handler: F)
    where
        F: Fn(&[u8]) -> BpfResult<u32> + Send + Sync + 'static,
    {
        self.state
            .handlers
            .write()
            .insert(name.to_string(), Arc::new(handler));
    }

    pub fn set_map_value(&self, map: &str, value: Vec<u8>) {
        self.state.values.write().insert(map.to_string(), value);
    }

    /// Make attaching `name` fail or succeed from now on
    pub fn set_attach_failure(&self, name: &str, failing: bool) {
        let mut set = self.state.failing_attach.write();
        if failing {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Number of times a subprogram was run
    pub fn run_count(&self, name: &str) -> u64 {
        self.state.run_counts.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn is_struct_ops_attached(&self) -> bool {
        self.state.struct_ops_attached.load(Ordering::Acquire)
    }

    pub fn is_unloaded(&self) -> bool {
        self.state.unloaded.load(Ordering::Acquire)
    }

    /// Lifecycle journal, oldest first
    pub fn journal(&self) -> Vec<String> {
        self.state.journal.lock().clone()
    }
}
