//! Background health monitoring loops.

use super::manager::ResourceManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Counts a live monitoring loop for as long as it exists.
///
/// The count is taken when the guard is created, before the task is
/// spawned, and released when the task's future is dropped (normal exit or
/// abort).
pub(crate) struct MonitorGuard {
    live: Arc<AtomicUsize>,
}

impl MonitorGuard {
    pub(crate) fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { live }
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawns the loop for one resource.
///
/// Each iteration sleeps the interval, then checks the resource and
/// recovers it when needed. Both phases stop as soon as shutdown is
/// signalled. The loop also ends once the manager has been dropped.
pub(crate) fn spawn_monitor(
    manager: Weak<ResourceManager>,
    name: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    guard: MonitorGuard,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _guard = guard;
        debug!(resource = %name, ?interval, "Monitor started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                () = tokio::time::sleep(interval) => {}
            }

            let Some(manager) = manager.upgrade() else {
                break;
            };
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = manager.monitor_tick(&name) => {}
            }
        }

        debug!(resource = %name, "Monitor stopped");
    })
}
