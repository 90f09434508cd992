//! Lifecycle supervisor.
//!
//! Runs the session sweep on a fixed interval until told to shut down.
//! The sweep itself never propagates errors; a bad pass is logged by the
//! manager and the next tick runs regardless.

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::session::SessionManager;

/// Spawn the sweep loop. Send `true` on the returned channel's sender
/// side to stop it.
pub fn spawn(manager: SessionManager, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let interval = manager.config().sweep_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a fresh gateway
        // does not sweep before any heartbeat had a chance to arrive.
        ticker.tick().await;

        tracing::info!(interval_secs = interval.as_secs(), "supervisor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    manager.sweep_once().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("supervisor stopped");
    })
}
