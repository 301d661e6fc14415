// Dispatcher triggering: a best-effort wake signal fired after enqueue and a
// periodic sweep. Both may overlap; dequeue atomicity keeps them safe.
// On Redis the enqueueing process also publishes on `{prefix}:wake`; a
// listener in every dispatcher process forwards those into its WakeSignal.

use super::priority::JobQueue;
use super::workers::Worker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Fire-and-forget "work is waiting" signal.
#[derive(Clone, Default)]
pub struct WakeSignal {
    notify: Arc<Notify>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never blocks. Repeated wakes before the dispatcher runs coalesce into one.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub sweep_interval: Duration,
    /// Run orphan cleanup every N sweeps, 0 disables it
    pub cleanup_every: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            cleanup_every: 10,
        }
    }
}

/// Drive the worker until `shutdown` flips to true.
pub async fn run_dispatcher(
    worker: Arc<Worker>,
    queue: Arc<JobQueue>,
    wake: WakeSignal,
    settings: DispatcherSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "Dispatcher {} started (sweep every {:?})",
        worker.worker_id(),
        settings.sweep_interval
    );

    let mut sweep = tokio::time::interval(settings.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweeps: u32 = 0;

    loop {
        tokio::select! {
            _ = wake.notified() => {
                debug!("Dispatcher woken");
            }
            _ = sweep.tick() => {
                sweeps = sweeps.wrapping_add(1);
                if settings.cleanup_every > 0 && sweeps % settings.cleanup_every == 0 {
                    match queue.cleanup_all().await {
                        Ok(summary) if summary.total > 0 => {
                            info!("Sweep cleanup removed {} entries", summary.total)
                        }
                        Ok(_) => {}
                        Err(e) => error!("Sweep cleanup failed: {}", e),
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        // Exactly one bounded batch per trigger; leftovers wait for the next one
        if let Err(e) = worker.run_once().await {
            error!("Worker run failed: {}", e);
        }
    }

    info!("Dispatcher {} stopped", worker.worker_id());
}
