//! Telemetry heartbeat
//!
//! A single background task that logs a structured heartbeat on an
//! interval. It deliberately does nothing else: certificate rotation and
//! key loading are boot-time decisions, not timer-driven, so the only
//! periodic work is this liveness beat.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::server::AppState;

/// Spawn the heartbeat task. It exits when the shutdown channel flips to
/// true rather than being killed mid-iteration.
pub fn spawn_heartbeat_task(
    interval: Duration,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Heartbeat task started");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    info!(
                        uptime_secs = state.started_at.elapsed().as_secs(),
                        active_cas = state.certificate_provider.active_cas().len(),
                        node_id = %state.args.node_id,
                        "Heartbeat"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Heartbeat task stopping");
                        return;
                    }
                }
            }
        }
    })
}
