/*!
 * Memory Residency
 *
 * Locks all current and future process memory resident before the controller
 * touches the kernel. The CPU selection call-out runs while the kernel waits
 * on a placement decision, so that path must never take a page fault.
 *
 * `MemoryResidency` is a token: `SchedulerController::new` requires one, which
 * makes the lock an ordered, auditable startup step instead of a side effect
 * of module initialization.
 */

use crate::core::errors::SchedError;
use crate::core::types::SchedResult;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How strictly residency is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResidencyPolicy {
    /// Fail startup if memory cannot be locked
    #[default]
    Required,
    /// Try to lock memory, continue with a warning on failure
    BestEffort,
    /// Do not lock memory (simulation and tests)
    Disabled,
}

impl ResidencyPolicy {
    /// Parse from string representation
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "required" | "1" | "true" => Ok(Self::Required),
            "best_effort" | "besteffort" => Ok(Self::BestEffort),
            "disabled" | "0" | "false" => Ok(Self::Disabled),
            _ => Err(format!(
                "Invalid residency policy '{}'. Valid: required, best_effort, disabled",
                s
            )),
        }
    }
}

/// Proof that the residency step ran
#[derive(Debug, Clone, Copy)]
pub struct MemoryResidency {
    policy: ResidencyPolicy,
    locked: bool,
}

impl MemoryResidency {
    /// Lock process memory according to `policy`
    ///
    /// Must run before any kernel interaction.
    pub fn establish(policy: ResidencyPolicy) -> SchedResult<Self> {
        if policy == ResidencyPolicy::Disabled {
            warn!("Memory residency disabled, call-outs may stall on page faults");
            return Ok(Self {
                policy,
                locked: false,
            });
        }

        match lock_all() {
            Ok(()) => {
                info!("Process memory locked resident (current and future)");
                Ok(Self {
                    policy,
                    locked: true,
                })
            }
            Err(reason) if policy == ResidencyPolicy::BestEffort => {
                warn!(error = %reason, "Failed to lock process memory, continuing");
                Ok(Self {
                    policy,
                    locked: false,
                })
            }
            Err(reason) => Err(SchedError::MemoryLock(reason)),
        }
    }

    /// Whether memory is actually locked
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[inline]
    pub fn policy(&self) -> ResidencyPolicy {
        self.policy
    }
}

#[cfg(target_os = "linux")]
fn lock_all() -> Result<(), String> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE).map_err(|e| e.to_string())
}

#[cfg(not(target_os = "linux"))]
fn lock_all() -> Result<(), String> {
    Err("memory locking is only supported on Linux".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_policy_never_locks() {
        let residency = MemoryResidency::establish(ResidencyPolicy::Disabled).unwrap();
        assert!(!residency.is_locked());
        assert_eq!(residency.policy(), ResidencyPolicy::Disabled);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            ResidencyPolicy::parse("best_effort").unwrap(),
            ResidencyPolicy::BestEffort
        );
        assert_eq!(
            ResidencyPolicy::parse("REQUIRED").unwrap(),
            ResidencyPolicy::Required
        );
        assert!(ResidencyPolicy::parse("sometimes").is_err());
    }
}
