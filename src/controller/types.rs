/*!
 * Controller Types
 * Lifecycle state, state regions and statistics
 */

use crate::callout::CalloutStats;
use crate::channels::ChannelStats;
use crate::core::errors::SchedError;
use crate::core::types::SchedResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a scheduler handle
///
/// ```text
/// Unloaded -> Loaded -> Attached -> Closed
///               \_________________/
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Unloaded,
    /// Resources bound and channels running, kernel policy not yet active
    Loaded,
    /// Custom policy is the active scheduler
    Attached,
    /// Torn down; terminal
    Closed,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Attached => "attached",
            Self::Closed => "closed",
        }
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(self, to: SchedulerState) -> bool {
        matches!(
            (self, to),
            (Self::Unloaded, Self::Loaded)
                | (Self::Loaded, Self::Attached)
                | (Self::Loaded, Self::Closed)
                | (Self::Attached, Self::Closed)
        )
    }

    /// Apply a transition, rejecting illegal ones
    pub fn transition(&mut self, to: SchedulerState) -> SchedResult<()> {
        if !self.can_transition_to(to) {
            return Err(SchedError::InvalidTransition {
                from: self.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent state region of the kernel program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateRegion {
    /// Zero-initialized state (`<module>.bss`)
    Bss,
    /// Initialized state (`<module>.data`)
    Data,
}

/// Handle statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub state: SchedulerState,
    pub backend: String,
    pub memory_locked: bool,
    pub queued: ChannelStats,
    pub exits: ChannelStats,
    pub dispatch: ChannelStats,
    pub callouts: CalloutStats,
}
