/*!
 * Call-out Invoker
 * Synchronous single-shot invocation of kernel-resident subprograms
 *
 * # Thread Safety
 * The kernel program does not document its subprograms as reentrant, so
 * invocations of the same subprogram are serialized here. Different
 * subprograms are not serialized by the invoker; whether they actually
 * overlap is up to the backend. The libbpf backend runs every object
 * operation under one lock, so there they execute one at a time.
 */

use super::types::{CalloutStats, CpuSelection, SubprogramStats};
use crate::bpf::{BpfError, LoadedObject};
use crate::channels::QueuedTask;
use crate::core::codec::{DomainArg, TaskCpuArg, WireRecord};
use crate::core::errors::SchedError;
use crate::core::limits::{SELECT_CPU_PROG, SIBLING_CPU_PROG};
use crate::core::types::{CpuId, LevelId, SchedResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct Subprogram {
    name: String,
    serial: Mutex<()>,
    invocations: AtomicU64,
    failures: AtomicU64,
}

impl Subprogram {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            serial: Mutex::new(()),
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> SubprogramStats {
        SubprogramStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Invokes the CPU selection and sibling domain subprograms
pub struct CalloutInvoker {
    object: Arc<dyn LoadedObject>,
    select_cpu: Option<Subprogram>,
    sibling_cpu: Option<Subprogram>,
    closed: Arc<AtomicBool>,
}

impl CalloutInvoker {
    /// Create an invoker over `object`
    ///
    /// `None` marks a subprogram that was not bound; calls to it fail with
    /// [`SchedError::SubprogramUnavailable`] without touching the kernel.
    /// Once `closed` is set every call fails with [`SchedError::Closed`].
    pub fn new(
        object: Arc<dyn LoadedObject>,
        select_cpu: Option<&str>,
        sibling_cpu: Option<&str>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            object,
            select_cpu: select_cpu.map(Subprogram::new),
            sibling_cpu: sibling_cpu.map(Subprogram::new),
            closed,
        }
    }

    /// Ask the kernel program where `task` should run
    ///
    /// Blocks until the subprogram returns. Failures are not retried.
    pub fn select_cpu(&self, task: &QueuedTask) -> SchedResult<CpuSelection> {
        let prog = self.bound(&self.select_cpu, SELECT_CPU_PROG)?;
        let ctx = TaskCpuArg::from(task)
            .encode()
            .map_err(|e| SchedError::Invocation {
                name: prog.name.clone(),
                reason: e.to_string(),
            })?;

        let raw = self.invoke(prog, &ctx)?;
        Ok(CpuSelection::from_raw(u64::from(raw)))
    }

    /// Declare `sibling_cpu_id` a sibling of `cpu_id` at topology level
    /// `level_id`
    pub fn enable_sibling_cpu(
        &self,
        level_id: LevelId,
        cpu_id: CpuId,
        sibling_cpu_id: CpuId,
    ) -> SchedResult<()> {
        let prog = self.bound(&self.sibling_cpu, SIBLING_CPU_PROG)?;
        let ctx = DomainArg {
            level_id,
            cpu_id,
            sibling_cpu_id,
        }
        .encode()
        .map_err(|e| SchedError::Invocation {
            name: prog.name.clone(),
            reason: e.to_string(),
        })?;

        match self.invoke(prog, &ctx)? {
            0 => {
                debug!(level_id, cpu_id, sibling_cpu_id, "Sibling CPU enabled");
                Ok(())
            }
            code => {
                prog.failures.fetch_add(1, Ordering::Relaxed);
                warn!(level_id, cpu_id, sibling_cpu_id, code, "Sibling CPU rejected");
                Err(SchedError::DomainConfig { code })
            }
        }
    }

    /// Whether the owning handle has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CalloutStats {
        CalloutStats {
            select_cpu: self
                .select_cpu
                .as_ref()
                .map(Subprogram::stats)
                .unwrap_or_default(),
            sibling_cpu: self
                .sibling_cpu
                .as_ref()
                .map(Subprogram::stats)
                .unwrap_or_default(),
        }
    }

    fn bound<'a>(&self, slot: &'a Option<Subprogram>, role: &str) -> SchedResult<&'a Subprogram> {
        if self.is_closed() {
            return Err(SchedError::Closed);
        }
        slot.as_ref().ok_or_else(|| SchedError::SubprogramUnavailable {
            name: role.to_string(),
        })
    }

    fn invoke(&self, prog: &Subprogram, ctx: &[u8]) -> SchedResult<u32> {
        let _serial = prog.serial.lock();
        prog.invocations.fetch_add(1, Ordering::Relaxed);

        self.object.run_program(&prog.name, ctx).map_err(|e| {
            prog.failures.fetch_add(1, Ordering::Relaxed);
            match e {
                BpfError::Unloaded => SchedError::Closed,
                other => SchedError::Invocation {
                    name: prog.name.clone(),
                    reason: other.to_string(),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::{ObjectArtifact, ObjectLoader, SimKernel, SimulatedObjectBuilder};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn invoker(bind: bool) -> (CalloutInvoker, SimKernel, Arc<AtomicBool>) {
        let (loader, kernel) = SimulatedObjectBuilder::default().build();
        let object: Arc<dyn LoadedObject> = Arc::from(
            loader
                .load(&ObjectArtifact::Path("test.bpf.o".into()))
                .unwrap(),
        );
        let closed = Arc::new(AtomicBool::new(false));
        let (select, sibling) = if bind {
            (Some(SELECT_CPU_PROG), Some(SIBLING_CPU_PROG))
        } else {
            (None, None)
        };
        (
            CalloutInvoker::new(object, select, sibling, closed.clone()),
            kernel,
            closed,
        )
    }

    #[test]
    fn test_select_cpu_specific() {
        let (invoker, _kernel, _) = invoker(true);
        let task = QueuedTask {
            pid: 100,
            cpu: 3,
            flags: 0,
        };
        assert_eq!(
            invoker.select_cpu(&task).unwrap(),
            CpuSelection::Specific(3)
        );
    }

    #[test]
    fn test_select_cpu_receives_encoded_task() {
        let (invoker, kernel, _) = invoker(true);
        kernel.set_handler(SELECT_CPU_PROG, |ctx| {
            assert_eq!(ctx.len(), 16);
            let arg = TaskCpuArg::decode(ctx).unwrap();
            assert_eq!((arg.pid, arg.cpu, arg.flags), (7, 1, 0xabcd));
            Ok(2)
        });
        let task = QueuedTask {
            pid: 7,
            cpu: 1,
            flags: 0xabcd,
        };
        assert_eq!(
            invoker.select_cpu(&task).unwrap(),
            CpuSelection::Specific(2)
        );
    }

    #[test]
    fn test_select_cpu_invocation_error() {
        let (invoker, kernel, _) = invoker(true);
        kernel.set_handler(SELECT_CPU_PROG, |_| {
            Err(BpfError::RunFailed {
                reason: "EINVAL".to_string(),
            })
        });
        let task = QueuedTask {
            pid: 1,
            cpu: 0,
            flags: 0,
        };
        assert!(matches!(
            invoker.select_cpu(&task),
            Err(SchedError::Invocation { .. })
        ));
        assert_eq!(invoker.stats().select_cpu.failures, 1);
    }

    #[test]
    fn test_unbound_subprograms_have_no_side_effect() {
        let (invoker, kernel, _) = invoker(false);
        let task = QueuedTask {
            pid: 1,
            cpu: 0,
            flags: 0,
        };
        assert_eq!(
            invoker.select_cpu(&task),
            Err(SchedError::SubprogramUnavailable {
                name: SELECT_CPU_PROG.to_string()
            })
        );
        assert_eq!(
            invoker.enable_sibling_cpu(0, 2, 3),
            Err(SchedError::SubprogramUnavailable {
                name: SIBLING_CPU_PROG.to_string()
            })
        );
        assert_eq!(kernel.run_count(SELECT_CPU_PROG), 0);
        assert_eq!(kernel.run_count(SIBLING_CPU_PROG), 0);
    }

    #[test]
    fn test_domain_config_codes() {
        let (invoker, kernel, _) = invoker(true);
        assert_eq!(invoker.enable_sibling_cpu(0, 2, 3), Ok(()));

        kernel.set_handler(SIBLING_CPU_PROG, |_| Ok(7));
        assert_eq!(
            invoker.enable_sibling_cpu(0, 2, 3),
            Err(SchedError::DomainConfig { code: 7 })
        );
    }

    #[test]
    fn test_closed_invoker_rejects_calls() {
        let (invoker, kernel, closed) = invoker(true);
        closed.store(true, Ordering::Release);
        let task = QueuedTask {
            pid: 1,
            cpu: 0,
            flags: 0,
        };
        assert_eq!(invoker.select_cpu(&task), Err(SchedError::Closed));
        assert_eq!(invoker.enable_sibling_cpu(0, 0, 1), Err(SchedError::Closed));
        assert_eq!(kernel.run_count(SELECT_CPU_PROG), 0);
    }

    #[test]
    fn test_same_subprogram_is_serialized() {
        let (invoker, kernel, _) = invoker(true);
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        let (a, o) = (active.clone(), overlap.clone());
        kernel.set_handler(SELECT_CPU_PROG, move |_| {
            if a.fetch_add(1, Ordering::SeqCst) > 0 {
                o.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(2));
            a.fetch_sub(1, Ordering::SeqCst);
            Ok(0)
        });

        let invoker = Arc::new(invoker);
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let invoker = invoker.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        let task = QueuedTask {
                            pid: i,
                            cpu: 0,
                            flags: 0,
                        };
                        invoker.select_cpu(&task).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert!(!overlap.load(Ordering::SeqCst));
        assert_eq!(invoker.stats().select_cpu.invocations, 20);
    }
}
