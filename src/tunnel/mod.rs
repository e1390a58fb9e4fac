//! The WebSocket tunnel between the remote and home sides.
//!
//! - **Client** (`hashi client`, remote side): one outbound session to the home
//!   machine with connect timeout, heartbeat, and reconnect.
//! - **Relay** (`hashi server`, home side): accepts up to `max_clients`
//!   sessions, enforces liveness, and drives one [`Bridge`](crate::bridge::Bridge)
//!   per session.
//!
//! Both sides queue outgoing frames through a [`TunnelSender`]; a single writer
//! per session drains the queue, so envelopes reach the peer in send order.

pub mod client;
pub mod relay;

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tracing::warn;

use crate::protocol::Envelope;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (used for liveness timeouts).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Try again later (used when the session cap is reached).
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Lifecycle of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// A frame queued for a session's WebSocket writer.
#[derive(Debug)]
pub enum Outbound {
    Envelope(Envelope),
    /// Send a close frame and stop writing.
    Close { code: u16, reason: &'static str },
}

/// Cloneable handle that queues frames on one tunnel session.
///
/// Sends never block; the queue is unbounded like the socket buffer behind it.
/// Once the writer is gone every send reports `false`.
#[derive(Debug, Clone)]
pub struct TunnelSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl TunnelSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an envelope. Returns `false` if the session is gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(Outbound::Envelope(envelope)).is_ok()
    }

    /// Ask the writer to close the WebSocket with `code`.
    pub fn close(&self, code: u16, reason: &'static str) -> bool {
        self.tx.send(Outbound::Close { code, reason }).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Encode an envelope for the wire, logging the (unexpected) failure case.
pub(crate) fn encode_envelope(envelope: &Envelope) -> Option<String> {
    match envelope.encode() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(kind = envelope.kind(), "Failed to encode envelope: {e}");
            None
        }
    }
}

enum Phase {
    Disconnected,
    Connecting,
    Open(TunnelSender),
    Closing,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Self::Disconnected => SessionState::Disconnected,
            Self::Connecting => SessionState::Connecting,
            Self::Open(_) => SessionState::Open,
            Self::Closing => SessionState::Closing,
        }
    }
}

/// The remote side's view of its single tunnel session.
///
/// Shared by the tunnel client (which drives the transitions), the
/// [`Multiplexer`](crate::mux::Multiplexer) (which sends through it while the
/// session is open), and the shutdown coordinator.
#[derive(Clone)]
pub struct TunnelLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    phase: watch::Sender<Phase>,
    clear_ack: Notify,
}

impl Default for TunnelLink {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelLink {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Disconnected);
        Self {
            inner: Arc::new(LinkInner {
                phase,
                clear_ack: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.phase.borrow().state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Wait until the session reaches `state`.
    pub async fn wait_for(&self, state: SessionState) {
        let mut rx = self.inner.phase.subscribe();
        // The sender lives as long as `self`, so this only ends on a match.
        let _ = rx.wait_for(|phase| phase.state() == state).await;
    }

    /// `disconnected -> connecting`. Refuses (returns `false`) from any other
    /// state, which keeps a second connect attempt from starting.
    pub(crate) fn begin_connect(&self) -> bool {
        self.inner.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Disconnected) {
                *phase = Phase::Connecting;
                true
            } else {
                false
            }
        })
    }

    /// `connecting -> open`, publishing the session's sender.
    pub(crate) fn open(&self, sender: TunnelSender) -> bool {
        self.inner.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Connecting) {
                *phase = Phase::Open(sender);
                true
            } else {
                false
            }
        })
    }

    /// `open -> closing`. Sends are refused from here on.
    pub(crate) fn begin_close(&self) {
        self.inner.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Open(_)) {
                *phase = Phase::Closing;
                true
            } else {
                false
            }
        });
    }

    /// Any state `-> disconnected`.
    pub(crate) fn reset(&self) {
        self.inner.phase.send_replace(Phase::Disconnected);
    }

    /// Queue an envelope if the session is open. Data offered while the
    /// tunnel is down is dropped, never buffered for a later session.
    pub fn send(&self, envelope: Envelope) -> bool {
        let sender = match &*self.inner.phase.borrow() {
            Phase::Open(sender) => sender.clone(),
            _ => return false,
        };
        sender.send(envelope)
    }

    /// Close the open session with a normal close frame.
    pub fn close(&self, reason: &'static str) -> bool {
        let sender = match &*self.inner.phase.borrow() {
            Phase::Open(sender) => sender.clone(),
            _ => return false,
        };
        sender.close(CLOSE_NORMAL, reason)
    }

    pub(crate) fn ack_clear_presence(&self) {
        self.inner.clear_ack.notify_one();
    }

    /// Resolves once the home side acknowledges a `clear_presence`.
    pub async fn clear_presence_acked(&self) {
        self.inner.clear_ack.notified().await;
    }
}
