/*!
 * Controller Configuration
 * Module naming, residency policy and channel tuning
 */

use crate::bpf::ObjectArtifact;
use crate::channels::ChannelTuning;
use crate::core::errors::SchedError;
use crate::core::limits::{
    DEFAULT_MODULE_NAME, DISPATCH_CHANNEL_CAPACITY, DISPATCH_FLUSH_INTERVAL,
    EXIT_CHANNEL_CAPACITY, EXIT_POLL_TIMEOUT, QUEUED_CHANNEL_CAPACITY, QUEUED_POLL_TIMEOUT,
};
use crate::core::memory::ResidencyPolicy;
use crate::core::types::SchedResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Path to the compiled scheduling object
pub const ENV_OBJECT_PATH: &str = "SCHED_OBJECT_PATH";
/// Object module name, prefix of the state regions
pub const ENV_MODULE_NAME: &str = "SCHED_MODULE_NAME";
/// Memory residency policy
pub const ENV_MEMLOCK: &str = "SCHED_MEMLOCK";

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub object_path: Option<PathBuf>,
    pub module_name: String,
    pub residency: ResidencyPolicy,
    pub queued: ChannelTuning,
    pub exit: ChannelTuning,
    pub dispatch: ChannelTuning,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            object_path: None,
            module_name: DEFAULT_MODULE_NAME.to_string(),
            residency: ResidencyPolicy::Required,
            queued: ChannelTuning {
                interval: QUEUED_POLL_TIMEOUT,
                capacity: QUEUED_CHANNEL_CAPACITY,
            },
            exit: ChannelTuning {
                interval: EXIT_POLL_TIMEOUT,
                capacity: EXIT_CHANNEL_CAPACITY,
            },
            dispatch: ChannelTuning {
                interval: DISPATCH_FLUSH_INTERVAL,
                capacity: DISPATCH_CHANNEL_CAPACITY,
            },
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `SCHED_*` environment variables
    pub fn from_env() -> SchedResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> SchedResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_OBJECT_PATH).filter(|v| !v.is_empty()) {
            config.object_path = Some(PathBuf::from(path));
        }
        if let Some(module) = lookup(ENV_MODULE_NAME) {
            if module.is_empty() {
                return Err(SchedError::Config(format!("{} is empty", ENV_MODULE_NAME)));
            }
            config.module_name = module;
        }
        if let Some(policy) = lookup(ENV_MEMLOCK) {
            config.residency = ResidencyPolicy::parse(&policy).map_err(SchedError::Config)?;
        }

        Ok(config)
    }

    /// Use `path` as the object, overriding the environment
    pub fn with_object_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.object_path = Some(path.into());
        self
    }

    /// Artifact to hand the loader
    pub fn artifact(&self) -> SchedResult<ObjectArtifact> {
        self.object_path
            .clone()
            .map(ObjectArtifact::Path)
            .ok_or_else(|| {
                SchedError::Config(format!(
                    "no scheduling object given (pass a path or set {})",
                    ENV_OBJECT_PATH
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| env.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.module_name, "main_bpf");
        assert_eq!(config.queued.capacity, 4096);
        assert_eq!(config.queued.interval.as_millis(), 50);
        assert_eq!(config.exit.capacity, 256);
        assert_eq!(config.exit.interval.as_millis(), 300);
        assert_eq!(config.dispatch.capacity, 4096);
        assert_eq!(config.residency, ResidencyPolicy::Required);
    }

    #[test]
    fn test_overrides() {
        let config = SchedulerConfig::from_lookup(lookup(&[
            (ENV_OBJECT_PATH, "/opt/sched/rustland.bpf.o"),
            (ENV_MODULE_NAME, "rustland"),
            (ENV_MEMLOCK, "best_effort"),
        ]))
        .unwrap();
        assert_eq!(
            config.artifact().unwrap(),
            ObjectArtifact::Path("/opt/sched/rustland.bpf.o".into())
        );
        assert_eq!(config.module_name, "rustland");
        assert_eq!(config.residency, ResidencyPolicy::BestEffort);
    }

    #[test]
    fn test_invalid_policy() {
        let err = SchedulerConfig::from_lookup(lookup(&[(ENV_MEMLOCK, "sometimes")])).unwrap_err();
        assert!(matches!(err, SchedError::Config(_)));
    }

    #[test]
    fn test_missing_object_path() {
        let config = SchedulerConfig::from_lookup(lookup(&[])).unwrap();
        assert!(matches!(config.artifact(), Err(SchedError::Config(_))));
        let config = config.with_object_path("a.bpf.o");
        assert!(config.artifact().is_ok());
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let json = serde_json::to_value(SchedulerConfig::default()).unwrap();
        assert_eq!(json["queued"]["interval"], 50);
        assert_eq!(json["residency"], "required");
    }
}
