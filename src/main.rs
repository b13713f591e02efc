/*!
 * schedctl - Main Entry Point
 *
 * Loads a scheduling object, makes it the active scheduler and runs a
 * pass-through placement loop until interrupted:
 * - Each queued task goes to the CPU the kernel program selects
 * - Exit events are logged
 */

use anyhow::Context;
use schedctl::{
    init_tracing, CalloutInvoker, CpuSelection, DispatchDecision, DispatchSender, ExitEvent,
    MemoryResidency, ObjectLoader, QueuedTask, SchedError, SchedulerConfig, SchedulerController,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the placement loop waits for a queued task before re-checking
/// for shutdown
const POLICY_POLL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("schedctl starting...");
    info!("================================================");

    let mut config = SchedulerConfig::from_env().context("invalid configuration")?;
    if let Some(path) = std::env::args_os().nth(1) {
        config = config.with_object_path(path);
    }

    // Must precede any kernel interaction
    info!(policy = ?config.residency, "Establishing memory residency...");
    let residency = MemoryResidency::establish(config.residency)?;

    let loader = select_loader();
    let controller = SchedulerController::new(loader, config, residency);

    info!("Loading scheduling object...");
    let mut handle = controller
        .load_configured()
        .context("failed to load scheduler")?;

    info!("Attaching scheduler...");
    handle.attach().context("failed to attach scheduler")?;

    let queued = handle.queued()?;
    let exits = handle.exits()?;
    let dispatcher = handle.dispatcher()?;
    let invoker = handle.invoker();
    let policy =
        tokio::task::spawn_blocking(move || run_policy(queued, exits, dispatcher, invoker));

    info!("================================================");
    info!("Scheduler active, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    info!("Interrupt received, shutting down...");

    handle.close();
    match serde_json::to_string(&handle.stats()) {
        Ok(stats) => info!(%stats, "Final statistics"),
        Err(e) => warn!(error = %e, "Failed to serialize statistics"),
    }

    match policy.await {
        Ok(dispatched) => info!(dispatched, "Placement loop finished"),
        Err(e) => warn!(error = %e, "Placement loop panicked"),
    }
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "libbpf"))]
fn select_loader() -> Arc<dyn ObjectLoader> {
    Arc::new(schedctl::LibbpfLoader::new())
}

#[cfg(not(all(target_os = "linux", feature = "libbpf")))]
fn select_loader() -> Arc<dyn ObjectLoader> {
    warn!("Built without libbpf support, using the simulation backend (dry run)");
    let (loader, _kernel) = schedctl::SimulatedObjectBuilder::default().build();
    Arc::new(loader)
}

/// Pass-through placement: dispatch every queued task to the selected CPU
///
/// Returns the number of decisions dispatched.
fn run_policy(
    queued: flume::Receiver<QueuedTask>,
    exits: flume::Receiver<ExitEvent>,
    dispatcher: DispatchSender,
    invoker: Arc<CalloutInvoker>,
) -> u64 {
    let mut dispatched = 0u64;

    while !invoker.is_closed() {
        for exit in exits.try_iter() {
            info!(bytes = exit.as_bytes().len(), "Exit event");
        }

        let task = match queued.recv_timeout(POLICY_POLL) {
            Ok(task) => task,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };

        let selection = match invoker.select_cpu(&task) {
            Ok(selection) => selection,
            Err(SchedError::Closed) => break,
            Err(e) => {
                warn!(pid = task.pid, error = %e, "CPU selection failed, dispatching anywhere");
                CpuSelection::Any
            }
        };
        debug!(pid = task.pid, ?selection, "Placing task");

        let decision = match DispatchDecision::for_task(task.pid, selection.to_kernel(), task.flags)
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(pid = task.pid, error = %e, "Failed to encode dispatch decision");
                continue;
            }
        };
        match dispatcher.send(decision) {
            Ok(()) => dispatched += 1,
            Err(SchedError::Closed) => break,
            Err(e) => warn!(pid = task.pid, error = %e, "Failed to dispatch task"),
        }
    }

    dispatched
}
