//! Periodic eviction of idle Discord IPC connections on the home side.
//!
//! Every [`REAP_INTERVAL`] each session's bridge retires channels that have
//! seen no traffic for [`IDLE_THRESHOLD`]. Retiring clears the presence the
//! channel left behind before the connection is destroyed.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tunnel::relay::RelayState;

pub const REAP_INTERVAL: Duration = Duration::from_secs(120);
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(300);

/// Run one reaping pass over every session. Returns connections retired.
pub async fn reap(state: &RelayState, threshold: Duration) -> usize {
    let sessions = state.snapshot().await;
    let mut retired = 0;
    for session in &sessions {
        retired += session.bridge.reap_idle(threshold).await;
    }
    if retired > 0 {
        info!(retired, sessions = sessions.len(), "Reaped idle Discord IPC connections");
    } else {
        debug!(sessions = sessions.len(), "No idle Discord IPC connections");
    }
    retired
}

/// Spawn the reaper. Stops when `timers` is cancelled.
pub fn spawn(state: RelayState, timers: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    reap(&state, IDLE_THRESHOLD).await;
                }
                () = timers.cancelled() => break,
            }
        }
    })
}
