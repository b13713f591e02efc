/*!
 * Linux Object Loader
 * Real BPF object loading for Linux using libbpf-rs
 */

use super::traits::*;
use super::types::*;
use libbpf_rs::{
    Link as BpfLink, MapCore, MapFlags, MapHandle, MapType, Object, ObjectBuilder, ProgramInput,
    ProgramType, RingBuffer, RingBufferBuilder, UserRingBuffer,
};
use nix::errno::Errno;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::OsStr;
use std::os::fd::{AsFd, AsRawFd};
use std::rc::Rc;
use std::time::Duration;
use tracing::info;

/// libbpf-backed loader
#[derive(Debug, Clone, Default)]
pub struct LibbpfLoader {
    debug: bool,
}

impl LibbpfLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward libbpf's own debug output
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl ObjectLoader for LibbpfLoader {
    fn backend(&self) -> &'static str {
        "libbpf"
    }

    fn load(&self, artifact: &ObjectArtifact) -> BpfResult<Box<dyn LoadedObject>> {
        let mut builder = ObjectBuilder::default();
        builder.debug(self.debug);

        let open = match artifact {
            ObjectArtifact::Path(path) => builder.open_file(path),
            ObjectArtifact::Bytes(bytes) => builder.open_memory(bytes),
        }
        .map_err(|e| BpfError::LoadFailed {
            reason: e.to_string(),
        })?;
        let object = open.load().map_err(|e| BpfError::LoadFailed {
            reason: e.to_string(),
        })?;

        info!(artifact = %artifact.describe(), "BPF object loaded");
        Ok(Box::new(LibbpfObject::new(object)))
    }
}

/// Owned libbpf object
///
/// libbpf objects carry raw pointers and are not `Send`. Every access goes
/// through the mutex in [`LibbpfObject`], so the object is never touched from
/// two threads at once. That includes test runs: call-outs, map reads and
/// attaches on one object are serialized against each other.
struct OwnedObject(Object);

// SAFETY: access is serialized by `LibbpfObject::inner`.
unsafe impl Send for OwnedObject {}

struct LibbpfObject {
    inner: Mutex<Option<OwnedObject>>,
    programs: Vec<ProgramInfo>,
    maps: Vec<MapInfo>,
}

impl LibbpfObject {
    fn new(object: Object) -> Self {
        let programs = object
            .progs()
            .map(|p| ProgramInfo {
                name: p.name().to_string_lossy().into_owned(),
                kind: program_kind(p.prog_type()),
            })
            .collect();
        let maps = object
            .maps()
            .map(|m| MapInfo {
                name: m.name().to_string_lossy().into_owned(),
                kind: map_kind(m.map_type()),
                fd: m.as_fd().as_raw_fd(),
            })
            .collect();

        Self {
            inner: Mutex::new(Some(OwnedObject(object))),
            programs,
            maps,
        }
    }

    fn with_object<T>(&self, f: impl FnOnce(&mut Object) -> BpfResult<T>) -> BpfResult<T> {
        let mut guard = self.inner.lock();
        let owned = guard.as_mut().ok_or(BpfError::Unloaded)?;
        f(&mut owned.0)
    }

    fn map_handle(&self, name: &str) -> BpfResult<MapHandle> {
        self.with_object(|object| {
            let map = object
                .maps()
                .find(|m| m.name() == OsStr::new(name))
                .ok_or_else(|| BpfError::MapNotFound {
                    name: name.to_string(),
                })?;
            MapHandle::try_from(&map).map_err(|e| BpfError::MapError {
                reason: e.to_string(),
            })
        })
    }
}

fn program_kind(ty: ProgramType) -> ProgramKind {
    match ty {
        ProgramType::Kprobe => ProgramKind::Kprobe,
        ProgramType::StructOps => ProgramKind::StructOps,
        ProgramType::Syscall => ProgramKind::Syscall,
        ProgramType::Tracing => ProgramKind::Tracing,
        _ => ProgramKind::Other,
    }
}

fn map_kind(ty: MapType) -> MapKind {
    match ty {
        MapType::Array => MapKind::Array,
        MapType::Hash => MapKind::Hash,
        MapType::RingBuf => MapKind::RingBuf,
        MapType::UserRingBuf => MapKind::UserRingBuf,
        MapType::StructOps => MapKind::StructOps,
        other => MapKind::Other(other as u32),
    }
}

impl LoadedObject for LibbpfObject {
    fn programs(&self) -> Vec<ProgramInfo> {
        self.programs.clone()
    }

    fn maps(&self) -> Vec<MapInfo> {
        self.maps.clone()
    }

    fn attach_program(&self, name: &str) -> BpfResult<Box<dyn Link>> {
        self.with_object(|object| {
            let prog = object
                .progs_mut()
                .find(|p| p.name() == OsStr::new(name))
                .ok_or_else(|| BpfError::ProgramNotFound {
                    name: name.to_string(),
                })?;
            let link = prog.attach().map_err(|e| BpfError::AttachFailed {
                reason: e.to_string(),
            })?;
            Ok(Box::new(LibbpfLink(link)) as Box<dyn Link>)
        })
    }

    fn run_program(&self, name: &str, ctx: &[u8]) -> BpfResult<u32> {
        self.with_object(|object| {
            let mut prog = object
                .progs_mut()
                .find(|p| p.name() == OsStr::new(name))
                .ok_or_else(|| BpfError::ProgramNotFound {
                    name: name.to_string(),
                })?;
            let mut context = ctx.to_vec();
            let input = ProgramInput {
                context_in: Some(&mut context),
                ..Default::default()
            };
            let output = prog.test_run(input).map_err(|e| BpfError::RunFailed {
                reason: e.to_string(),
            })?;
            Ok(output.return_value)
        })
    }

    fn ring_buffer(&self, map: &str) -> BpfResult<Box<dyn RingBufferSource>> {
        let handle = self.map_handle(map)?;
        Ok(Box::new(LibbpfRingSource { handle }))
    }

    fn user_ring_buffer(&self, map: &str) -> BpfResult<Box<dyn UserRingBufferSink>> {
        let handle = self.map_handle(map)?;
        Ok(Box::new(LibbpfUserRingSink { handle }))
    }

    fn attach_struct_ops(&self, map: &str) -> BpfResult<Box<dyn Link>> {
        self.with_object(|object| {
            let mut target = object
                .maps_mut()
                .find(|m| m.name() == OsStr::new(map))
                .ok_or_else(|| BpfError::MapNotFound {
                    name: map.to_string(),
                })?;
            let link = target
                .attach_struct_ops()
                .map_err(|e| BpfError::AttachFailed {
                    reason: e.to_string(),
                })?;
            Ok(Box::new(LibbpfLink(link)) as Box<dyn Link>)
        })
    }

    fn read_map_value(&self, map: &str, key: &[u8]) -> BpfResult<Option<Vec<u8>>> {
        self.with_object(|object| {
            let target = object
                .maps()
                .find(|m| m.name() == OsStr::new(map))
                .ok_or_else(|| BpfError::MapNotFound {
                    name: map.to_string(),
                })?;
            target
                .lookup(key, MapFlags::ANY)
                .map_err(|e| BpfError::MapError {
                    reason: e.to_string(),
                })
        })
    }

    fn close(&self) -> BpfResult<()> {
        let object = self.inner.lock().take().ok_or(BpfError::Unloaded)?;
        drop(object);
        Ok(())
    }
}

struct LibbpfLink(BpfLink);

// SAFETY: a link only owns a kernel link fd and has no thread affinity.
unsafe impl Send for LibbpfLink {}

impl Link for LibbpfLink {
    fn detach(self: Box<Self>) -> BpfResult<()> {
        self.0.detach().map_err(|e| BpfError::DetachFailed {
            reason: e.to_string(),
        })
    }
}

struct LibbpfRingSource {
    handle: MapHandle,
}

impl RingBufferSource for LibbpfRingSource {
    fn open(self: Box<Self>) -> BpfResult<Box<dyn RingBufferPoller>> {
        let pending = Rc::new(RefCell::new(VecDeque::new()));
        let sink = pending.clone();

        let mut builder = RingBufferBuilder::new();
        builder
            .add(&self.handle, move |data: &[u8]| {
                sink.borrow_mut().push_back(data.to_vec());
                0
            })
            .map_err(|e| BpfError::MapError {
                reason: e.to_string(),
            })?;
        let ring = builder.build().map_err(|e| BpfError::MapError {
            reason: e.to_string(),
        })?;

        Ok(Box::new(LibbpfRingPoller {
            ring,
            pending,
            _handle: self.handle,
        }))
    }
}

struct LibbpfRingPoller {
    ring: RingBuffer<'static>,
    pending: Rc<RefCell<VecDeque<Vec<u8>>>>,
    _handle: MapHandle,
}

impl RingBufferPoller for LibbpfRingPoller {
    fn poll(&mut self, timeout: Duration, deliver: &mut dyn FnMut(Vec<u8>)) -> BpfResult<usize> {
        self.ring.poll(timeout).map_err(|e| BpfError::MapError {
            reason: e.to_string(),
        })?;

        let mut delivered = 0;
        loop {
            // Release the borrow before `deliver`, which may block.
            let next = self.pending.borrow_mut().pop_front();
            match next {
                Some(record) => {
                    deliver(record);
                    delivered += 1;
                }
                None => break,
            }
        }
        Ok(delivered)
    }
}

struct LibbpfUserRingSink {
    handle: MapHandle,
}

impl UserRingBufferSink for LibbpfUserRingSink {
    fn open(self: Box<Self>) -> BpfResult<Box<dyn UserRingBufferWriter>> {
        let ring = UserRingBuffer::new(&self.handle).map_err(|e| BpfError::MapError {
            reason: e.to_string(),
        })?;
        Ok(Box::new(LibbpfUserRingWriter {
            ring,
            _handle: self.handle,
        }))
    }
}

struct LibbpfUserRingWriter {
    ring: UserRingBuffer,
    _handle: MapHandle,
}

impl UserRingBufferWriter for LibbpfUserRingWriter {
    fn try_submit(&mut self, record: &[u8]) -> BpfResult<bool> {
        let mut sample = match self.ring.reserve(record.len()) {
            Ok(sample) => sample,
            Err(e) if is_ring_full(&e) => return Ok(false),
            Err(e) => {
                return Err(BpfError::MapError {
                    reason: e.to_string(),
                })
            }
        };
        sample.as_mut().copy_from_slice(record);
        self.ring.submit(sample).map_err(|e| BpfError::MapError {
            reason: e.to_string(),
        })?;
        Ok(true)
    }
}

/// Whether a failed reserve reported `ENOSPC`
///
/// libbpf-rs keeps the OS error inside its own error type and maps `ENOSPC`
/// to a generic kind, so the code is recovered from the error itself: first
/// from any `io::Error` in the source chain, then from its rendering.
fn is_ring_full(err: &libbpf_rs::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            return io.raw_os_error() == Some(Errno::ENOSPC as i32);
        }
        source = current.source();
    }
    let full = std::io::Error::from_raw_os_error(Errno::ENOSPC as i32).to_string();
    err.to_string().contains(&full)
}
