/*!
 * Resource Registry
 * Typed binding of the loaded object's programs and maps
 *
 * Built once from the loader's enumeration. Every recognized name is bound at
 * most once, and the registry only exists if every required resource is
 * present, so accessors never return an empty slot.
 */

use super::types::StateRegion;
use crate::bpf::{MapInfo, MapKind, ProgramInfo};
use crate::core::errors::SchedError;
use crate::core::limits::{
    BSS_SUFFIX, DATA_SUFFIX, DISPATCHED_MAP, EXIT_MAP, PROBE_PROGS, QUEUED_MAP, SELECT_CPU_PROG,
    SIBLING_CPU_PROG,
};
use crate::core::types::SchedResult;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Label used for the struct-ops attach point, which is matched by kind
const STRUCT_OPS_ROLE: &str = "<struct_ops>";

/// Bound resources of a loaded scheduling object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRegistry {
    module: String,
    bss: MapInfo,
    data: MapInfo,
    queued: MapInfo,
    dispatched: MapInfo,
    exit: MapInfo,
    struct_ops: MapInfo,
    select_cpu: ProgramInfo,
    sibling_cpu: ProgramInfo,
    probes: Vec<ProgramInfo>,
}

impl ResourceRegistry {
    /// Bind `maps` and `programs` against the named contract of `module`
    ///
    /// Unrecognized entries are ignored. A recognized name seen twice, or a
    /// second struct-ops map, is rejected. Missing required entries are
    /// reported together.
    pub fn build(module: &str, maps: &[MapInfo], programs: &[ProgramInfo]) -> SchedResult<Self> {
        let bss_name = format!("{}{}", module, BSS_SUFFIX);
        let data_name = format!("{}{}", module, DATA_SUFFIX);

        let mut bss = Slot::new(&bss_name);
        let mut data = Slot::new(&data_name);
        let mut queued = Slot::new(QUEUED_MAP);
        let mut dispatched = Slot::new(DISPATCHED_MAP);
        let mut exit = Slot::new(EXIT_MAP);
        let mut struct_ops = Slot::new(STRUCT_OPS_ROLE);

        for map in maps {
            let name = map.name.as_str();
            if map.kind == MapKind::StructOps {
                struct_ops.bind(map.clone())?;
            } else if name == bss_name {
                bss.bind(map.clone())?;
            } else if name == data_name {
                data.bind(map.clone())?;
            } else if name == QUEUED_MAP {
                queued.bind(expect_kind(map, MapKind::RingBuf)?)?;
            } else if name == DISPATCHED_MAP {
                dispatched.bind(expect_kind(map, MapKind::UserRingBuf)?)?;
            } else if name == EXIT_MAP {
                exit.bind(expect_kind(map, MapKind::RingBuf)?)?;
            } else {
                debug!(map = name, "Ignoring unrecognized map");
            }
        }

        let mut select_cpu = Slot::new(SELECT_CPU_PROG);
        let mut sibling_cpu = Slot::new(SIBLING_CPU_PROG);
        let mut probes: Vec<ProgramInfo> = Vec::new();

        for prog in programs {
            let name = prog.name.as_str();
            if name == SELECT_CPU_PROG {
                select_cpu.bind(prog.clone())?;
            } else if name == SIBLING_CPU_PROG {
                sibling_cpu.bind(prog.clone())?;
            } else if PROBE_PROGS.contains(&name) {
                if probes.iter().any(|p| p.name == name) {
                    return Err(SchedError::DuplicateResource {
                        name: name.to_string(),
                    });
                }
                probes.push(prog.clone());
            }
        }

        let mut missing = Vec::new();
        let bss = bss.take(&mut missing);
        let data = data.take(&mut missing);
        let queued = queued.take(&mut missing);
        let dispatched = dispatched.take(&mut missing);
        let exit = exit.take(&mut missing);
        let struct_ops = struct_ops.take(&mut missing);
        let select_cpu = select_cpu.take(&mut missing);
        let sibling_cpu = sibling_cpu.take(&mut missing);

        match (
            bss,
            data,
            queued,
            dispatched,
            exit,
            struct_ops,
            select_cpu,
            sibling_cpu,
        ) {
            (
                Some(bss),
                Some(data),
                Some(queued),
                Some(dispatched),
                Some(exit),
                Some(struct_ops),
                Some(select_cpu),
                Some(sibling_cpu),
            ) => Ok(Self {
                module: module.to_string(),
                bss,
                data,
                queued,
                dispatched,
                exit,
                struct_ops,
                select_cpu,
                sibling_cpu,
                probes,
            }),
            _ => Err(SchedError::MissingResources { names: missing }),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn state_region(&self, region: StateRegion) -> &MapInfo {
        match region {
            StateRegion::Bss => &self.bss,
            StateRegion::Data => &self.data,
        }
    }

    pub fn queued(&self) -> &MapInfo {
        &self.queued
    }

    pub fn dispatched(&self) -> &MapInfo {
        &self.dispatched
    }

    pub fn exit(&self) -> &MapInfo {
        &self.exit
    }

    /// Scheduler attach point
    pub fn struct_ops(&self) -> &MapInfo {
        &self.struct_ops
    }

    pub fn select_cpu(&self) -> &ProgramInfo {
        &self.select_cpu
    }

    pub fn sibling_cpu(&self) -> &ProgramInfo {
        &self.sibling_cpu
    }

    /// Probes present in the object, in enumeration order
    pub fn probes(&self) -> &[ProgramInfo] {
        &self.probes
    }
}

struct Slot<T> {
    role: String,
    value: Option<T>,
}

impl<T> Slot<T> {
    fn new(role: &str) -> Self {
        Self {
            role: role.to_string(),
            value: None,
        }
    }

    fn bind(&mut self, value: T) -> SchedResult<()> {
        if self.value.is_some() {
            return Err(SchedError::DuplicateResource {
                name: self.role.clone(),
            });
        }
        self.value = Some(value);
        Ok(())
    }

    fn take(self, missing: &mut Vec<String>) -> Option<T> {
        if self.value.is_none() {
            missing.push(self.role);
        }
        self.value
    }
}

fn expect_kind(map: &MapInfo, expected: MapKind) -> SchedResult<MapInfo> {
    if map.kind != expected {
        return Err(SchedError::Load(format!(
            "map {} has kind {}, expected {}",
            map.name, map.kind, expected
        )));
    }
    Ok(map.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::ProgramKind;
    use pretty_assertions::assert_eq;

    fn map(name: &str, kind: MapKind, fd: i32) -> MapInfo {
        MapInfo {
            name: name.to_string(),
            kind,
            fd,
        }
    }

    fn prog(name: &str, kind: ProgramKind) -> ProgramInfo {
        ProgramInfo {
            name: name.to_string(),
            kind,
        }
    }

    fn contract() -> (Vec<MapInfo>, Vec<ProgramInfo>) {
        let maps = vec![
            map("main_bpf.bss", MapKind::Array, 3),
            map("main_bpf.data", MapKind::Array, 4),
            map("main_bpf.rodata", MapKind::Array, 5),
            map(QUEUED_MAP, MapKind::RingBuf, 6),
            map(DISPATCHED_MAP, MapKind::UserRingBuf, 7),
            map(EXIT_MAP, MapKind::RingBuf, 8),
            map("rustland", MapKind::StructOps, 9),
        ];
        let programs = vec![
            prog(SELECT_CPU_PROG, ProgramKind::Syscall),
            prog(SIBLING_CPU_PROG, ProgramKind::Syscall),
            prog("rustland_enqueue", ProgramKind::StructOps),
            prog(PROBE_PROGS[0], ProgramKind::Kprobe),
        ];
        (maps, programs)
    }

    #[test]
    fn test_complete_contract() {
        let (maps, programs) = contract();
        let registry = ResourceRegistry::build("main_bpf", &maps, &programs).unwrap();
        assert_eq!(registry.struct_ops().name, "rustland");
        assert_eq!(registry.state_region(StateRegion::Bss).fd, 3);
        assert_eq!(registry.state_region(StateRegion::Data).fd, 4);
        assert_eq!(registry.probes().len(), 1);
        assert_eq!(registry.select_cpu().name, SELECT_CPU_PROG);
    }

    #[test]
    fn test_module_name_scopes_state_regions() {
        let (maps, programs) = contract();
        let err = ResourceRegistry::build("other", &maps, &programs).unwrap_err();
        assert_eq!(
            err,
            SchedError::MissingResources {
                names: vec!["other.bss".to_string(), "other.data".to_string()]
            }
        );
    }

    #[test]
    fn test_every_missing_entry_reported() {
        let (mut maps, mut programs) = contract();
        maps.retain(|m| m.name != EXIT_MAP && m.kind != MapKind::StructOps);
        programs.retain(|p| p.name != SELECT_CPU_PROG);

        let err = ResourceRegistry::build("main_bpf", &maps, &programs).unwrap_err();
        assert_eq!(
            err,
            SchedError::MissingResources {
                names: vec![
                    EXIT_MAP.to_string(),
                    STRUCT_OPS_ROLE.to_string(),
                    SELECT_CPU_PROG.to_string(),
                ]
            }
        );
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (mut maps, programs) = contract();
        maps.push(map(QUEUED_MAP, MapKind::RingBuf, 20));
        assert_eq!(
            ResourceRegistry::build("main_bpf", &maps, &programs),
            Err(SchedError::DuplicateResource {
                name: QUEUED_MAP.to_string()
            })
        );
    }

    #[test]
    fn test_second_struct_ops_map_rejected() {
        let (mut maps, programs) = contract();
        maps.push(map("other_ops", MapKind::StructOps, 21));
        assert!(matches!(
            ResourceRegistry::build("main_bpf", &maps, &programs),
            Err(SchedError::DuplicateResource { .. })
        ));
    }

    #[test]
    fn test_duplicate_probe_rejected() {
        let (maps, mut programs) = contract();
        programs.push(prog(PROBE_PROGS[0], ProgramKind::Kprobe));
        assert!(matches!(
            ResourceRegistry::build("main_bpf", &maps, &programs),
            Err(SchedError::DuplicateResource { .. })
        ));
    }

    #[test]
    fn test_wrong_ring_kind_rejected() {
        let (mut maps, programs) = contract();
        for m in maps.iter_mut().filter(|m| m.name == DISPATCHED_MAP) {
            m.kind = MapKind::RingBuf;
        }
        assert!(matches!(
            ResourceRegistry::build("main_bpf", &maps, &programs),
            Err(SchedError::Load(_))
        ));
    }
}
