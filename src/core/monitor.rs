//! Instance monitoring - One supervised task per tracked process
//!
//! Monitor tasks never touch the registry directly. They sample, run the governor and
//! report through a channel; the registry's event loop applies the result.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::governor::{Governor, GovernorVerdict};
use super::instance::InstanceId;
use super::process::ProcessHost;
use super::resource::ResourceUsage;

/// Reports sent from monitor tasks to the registry
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Sample {
        id: InstanceId,
        usage: ResourceUsage,
        verdict: GovernorVerdict,
    },
    /// The process disappeared; the task has exited
    ProcessLost { id: InstanceId },
}

/// Cancellation handle for a running monitor task
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Ask the task to stop at its next wakeup; safe to call more than once
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Everything a monitor task needs besides the instance identity
#[derive(Clone)]
pub struct MonitorContext {
    pub interval: Duration,
    pub host: Arc<dyn ProcessHost>,
    pub governor: Arc<Governor>,
    pub events: mpsc::UnboundedSender<MonitorEvent>,
}

/// Spawn the monitor task for one process
pub fn spawn_monitor(
    id: InstanceId,
    pid: u32,
    protection_enabled: bool,
    ctx: MonitorContext,
) -> MonitorHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + ctx.interval, ctx.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Monitor started for instance {} (PID {})", id, pid);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as cancellation too
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Monitor for instance {} cancelled", id);
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let usage = if ctx.host.is_running(pid) {
                        ctx.host.sample(pid)
                    } else {
                        None
                    };

                    let Some(usage) = usage else {
                        info!("Process {} of instance {} is gone", pid, id);
                        let _ = ctx.events.send(MonitorEvent::ProcessLost { id });
                        break;
                    };

                    trace!("Instance {}: {} CPU, {}", id, usage.cpu_string(), usage.memory_string());
                    let verdict = ctx.governor.inspect(id, pid, &usage, protection_enabled);
                    if ctx.events.send(MonitorEvent::Sample { id, usage, verdict }).is_err() {
                        break;
                    }
                }
            }
        }
    });

    MonitorHandle { shutdown, task }
}
