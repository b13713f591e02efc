/*!
 * Controller Module
 * Load, attach and close lifecycle of a kernel scheduling policy
 */

mod config;
mod handle;
mod manager;
mod registry;
mod types;

pub use config::{SchedulerConfig, ENV_MEMLOCK, ENV_MODULE_NAME, ENV_OBJECT_PATH};
pub use handle::SchedulerHandle;
pub use manager::SchedulerController;
pub use registry::ResourceRegistry;
pub use types::{SchedulerState, SchedulerStats, StateRegion};
