/*!
 * Call-out Types
 * Decoded results of kernel subprogram invocations
 */

use crate::core::limits::RL_CPU_ANY;
use crate::core::types::CpuId;
use serde::{Deserialize, Serialize};

/// Result of CPU selection
///
/// Decoded once at the call-out boundary. The kernel's "any CPU" signal never
/// travels past this type as a magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "cpu")]
pub enum CpuSelection {
    /// Run on this CPU
    Specific(CpuId),
    /// Any CPU is acceptable
    Any,
}

impl CpuSelection {
    /// Decode a raw subprogram return value
    ///
    /// The kernel signals "any" with a negative value, which reads as a value
    /// above `i32::MAX` once reinterpreted as unsigned.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        if raw > i32::MAX as u64 {
            Self::Any
        } else {
            Self::Specific(raw as CpuId)
        }
    }

    /// Encoding expected by the kernel program in dispatch decisions
    #[inline]
    pub const fn to_kernel(self) -> CpuId {
        match self {
            Self::Specific(cpu) => cpu,
            Self::Any => RL_CPU_ANY,
        }
    }

    /// Whether this selection is usable on a system with `nr_cpus` CPUs
    pub fn is_within(self, nr_cpus: u32) -> bool {
        match self {
            Self::Specific(cpu) => cpu >= 0 && (cpu as u32) < nr_cpus,
            Self::Any => true,
        }
    }
}

/// Call-out counters for one subprogram
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubprogramStats {
    pub invocations: u64,
    pub failures: u64,
}

/// Call-out counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalloutStats {
    pub select_cpu: SubprogramStats,
    pub sibling_cpu: SubprogramStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_signed_max_boundary() {
        assert_eq!(
            CpuSelection::from_raw(2_147_483_647),
            CpuSelection::Specific(i32::MAX)
        );
        assert_eq!(CpuSelection::from_raw(2_147_483_648), CpuSelection::Any);
    }

    #[test]
    fn test_negative_kernel_value_is_any() {
        assert_eq!(CpuSelection::from_raw(u64::from((-1i32) as u32)), CpuSelection::Any);
        assert_eq!(CpuSelection::from_raw(u64::from(u32::MAX)), CpuSelection::Any);
    }

    #[test]
    fn test_to_kernel() {
        assert_eq!(CpuSelection::Any.to_kernel(), 1 << 20);
        assert_eq!(CpuSelection::Specific(3).to_kernel(), 3);
    }

    #[test]
    fn test_is_within() {
        assert!(CpuSelection::Specific(0).is_within(4));
        assert!(!CpuSelection::Specific(4).is_within(4));
        assert!(!CpuSelection::Specific(i32::MAX).is_within(4));
        assert!(CpuSelection::Any.is_within(1));
    }

    proptest! {
        #[test]
        fn prop_large_values_are_any(raw in (1u64 << 31)..=u64::MAX) {
            prop_assert_eq!(CpuSelection::from_raw(raw), CpuSelection::Any);
        }

        #[test]
        fn prop_small_values_are_literal(raw in 0u64..(1u64 << 31)) {
            prop_assert_eq!(CpuSelection::from_raw(raw), CpuSelection::Specific(raw as i32));
        }
    }
}
