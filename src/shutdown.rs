//! Graceful shutdown for both sides.
//!
//! Shutdown runs once, on the first signal or when the main task ends. It
//! always stops the periodic timers first so no heartbeat, reconnect, sweep,
//! or reap fires while resources are being released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::mux::Multiplexer;
use crate::protocol::Envelope;
use crate::tunnel::relay::RelayState;
use crate::tunnel::TunnelLink;
use crate::util::now_ms;

/// How long the remote side waits for `clear_presence_ack`.
pub const CLEAR_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Resolve on SIGINT or SIGTERM (Ctrl-C only on non-Unix platforms).
pub async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

/// Remote-side shutdown: ask home to clear presence, close the tunnel, and
/// tear down the fake endpoints.
#[derive(Clone)]
pub struct RemoteShutdown {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    timers: CancellationToken,
    link: TunnelLink,
    mux: Arc<Multiplexer>,
    done: AtomicBool,
}

impl RemoteShutdown {
    pub fn new(timers: CancellationToken, link: TunnelLink, mux: Arc<Multiplexer>) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                timers,
                link,
                mux,
                done: AtomicBool::new(false),
            }),
        }
    }

    /// Run the shutdown sequence. Returns `false` if it already ran.
    pub async fn run(&self) -> bool {
        let inner = &self.inner;
        if inner.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Shutting down...");
        inner.timers.cancel();

        if inner.link.is_open() {
            info!("Sending clear presence request to server");
            if inner.link.send(Envelope::ClearPresence { timestamp: now_ms() }) {
                match tokio::time::timeout(CLEAR_ACK_TIMEOUT, inner.link.clear_presence_acked()).await {
                    Ok(()) => info!("Server confirmed presence clear"),
                    Err(_) => warn!(
                        "No clear presence acknowledgement within {}ms, continuing",
                        CLEAR_ACK_TIMEOUT.as_millis()
                    ),
                }
            }
            inner.link.close("Client shutting down");
        }

        inner.mux.close_all().await;
        info!("Goodbye");
        true
    }
}

/// Home-side shutdown: clear presence on every session and close them.
#[derive(Clone)]
pub struct HomeShutdown {
    inner: Arc<HomeInner>,
}

struct HomeInner {
    timers: CancellationToken,
    relay: RelayState,
    done: AtomicBool,
}

impl HomeShutdown {
    pub fn new(timers: CancellationToken, relay: RelayState) -> Self {
        Self {
            inner: Arc::new(HomeInner {
                timers,
                relay,
                done: AtomicBool::new(false),
            }),
        }
    }

    /// Run the shutdown sequence. Returns `false` if it already ran.
    pub async fn run(&self) -> bool {
        let inner = &self.inner;
        if inner.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Shutting down...");
        inner.timers.cancel();
        inner.relay.drain_all("Server shutting down").await;
        info!("Goodbye");
        true
    }
}
