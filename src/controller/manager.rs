/*!
 * Scheduler Controller
 * Loads a scheduling object, binds its resources and starts its channels
 *
 * A load either produces a fully bound `Loaded` handle or fails with nothing
 * left behind: any probe links, channels or object acquired before the
 * failure are released first.
 */

use super::config::SchedulerConfig;
use super::handle::SchedulerHandle;
use super::registry::ResourceRegistry;
use crate::bpf::{LoadedObject, ObjectArtifact, ObjectLoader};
use crate::channels::{DispatchChannel, EventChannel, ExitEvent, QueuedTask};
use crate::core::errors::SchedError;
use crate::core::memory::MemoryResidency;
use crate::core::types::SchedResult;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Drives loading of scheduling objects through an [`ObjectLoader`]
pub struct SchedulerController {
    loader: Arc<dyn ObjectLoader>,
    config: SchedulerConfig,
    residency: MemoryResidency,
}

impl SchedulerController {
    /// Create a controller
    ///
    /// `residency` is the token from [`MemoryResidency::establish`], which
    /// must run before the controller touches the kernel.
    pub fn new(
        loader: Arc<dyn ObjectLoader>,
        config: SchedulerConfig,
        residency: MemoryResidency,
    ) -> Self {
        info!(
            backend = loader.backend(),
            module = %config.module_name,
            memory_locked = residency.is_locked(),
            "Scheduler controller initialized"
        );
        Self {
            loader,
            config,
            residency,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Load the object named by the configuration
    pub fn load_configured(&self) -> SchedResult<SchedulerHandle> {
        let artifact = self.config.artifact()?;
        self.load(&artifact)
    }

    /// Load `artifact`, bind its resources, attach probes and start channels
    pub fn load(&self, artifact: &ObjectArtifact) -> SchedResult<SchedulerHandle> {
        info!(artifact = %artifact.describe(), backend = self.loader.backend(), "Loading scheduling object");

        let object: Arc<dyn LoadedObject> = Arc::from(self.loader.load(artifact).map_err(|e| {
            error!(error = %e, "Failed to load scheduling object");
            SchedError::Load(e.to_string())
        })?);

        let maps = object.maps();
        let programs = object.programs();
        for map in &maps {
            info!(name = %map.name, kind = %map.kind, fd = map.fd, "Map");
        }

        let registry = match ResourceRegistry::build(&self.config.module_name, &maps, &programs) {
            Ok(registry) => registry,
            Err(e) => {
                error!(error = %e, "Object does not satisfy the scheduler contract");
                if let Err(close_err) = object.close() {
                    warn!(error = %close_err, "Failed to unload rejected object");
                }
                return Err(e);
            }
        };

        // From here on, dropping the handle releases everything bound so far.
        let mut handle = SchedulerHandle::new(
            self.loader.backend(),
            self.residency.is_locked(),
            object,
            registry,
        );

        self.attach_probes(&mut handle)?;
        self.start_channels(&mut handle)?;
        handle.mark_loaded()?;

        info!(
            struct_ops = %handle.registry().struct_ops().name,
            probes = handle.registry().probes().len(),
            "Scheduling object loaded"
        );
        Ok(handle)
    }

    fn attach_probes(&self, handle: &mut SchedulerHandle) -> SchedResult<()> {
        let probes: Vec<String> = handle
            .registry()
            .probes()
            .iter()
            .map(|p| p.name.clone())
            .collect();

        for name in probes {
            let link = handle.object().attach_program(&name).map_err(|e| {
                error!(probe = %name, error = %e, "Failed to attach probe");
                SchedError::ProbeAttach {
                    name: name.clone(),
                    reason: e.to_string(),
                }
            })?;
            info!(probe = %name, "Probe attached");
            handle.push_probe(&name, link);
        }
        Ok(())
    }

    fn start_channels(&self, handle: &mut SchedulerHandle) -> SchedResult<()> {
        let object = handle.object().clone();
        let registry = handle.registry();
        let queued_map = registry.queued().name.clone();
        let exit_map = registry.exit().name.clone();
        let dispatch_map = registry.dispatched().name.clone();

        let source = object.ring_buffer(&queued_map).map_err(|e| {
            SchedError::Channel(format!("failed to bind {}: {}", queued_map, e))
        })?;
        let queued = EventChannel::<QueuedTask>::start(
            &queued_map,
            "sched-queued",
            source,
            self.config.queued,
        )?;

        let source = object
            .ring_buffer(&exit_map)
            .map_err(|e| SchedError::Channel(format!("failed to bind {}: {}", exit_map, e)))?;
        let exits =
            EventChannel::<ExitEvent>::start(&exit_map, "sched-exit", source, self.config.exit)?;

        let sink = object.user_ring_buffer(&dispatch_map).map_err(|e| {
            SchedError::Channel(format!("failed to bind {}: {}", dispatch_map, e))
        })?;
        let dispatch =
            DispatchChannel::start(&dispatch_map, "sched-dispatch", sink, self.config.dispatch)?;

        handle.set_channels(queued, exits, dispatch);
        Ok(())
    }
}
