//! Tunnel relay, the home side's WebSocket server.
//!
//! Each remote client that connects gets a [`TunnelSession`] with its own
//! [`Bridge`] to the local Discord IPC endpoints. The relay:
//! 1. Admits at most `max_clients` sessions (extra ones close with 1013)
//! 2. Answers `ping` with `pong` and forwards `ipc_data` into the bridge
//! 3. Sweeps every 15 s: pings live sessions, closes silent ones (1001)
//!
//! New sessions start in a 90 s grace period in which the sweep leaves them
//! alone. The first message ends grace; if none ever arrives a backup timer
//! closes the session at 1.5 × grace.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{encode_envelope, Outbound, TunnelSender, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_TRY_AGAIN_LATER};
use crate::bridge::Bridge;
use crate::ipc::IpcEndpoints;
use crate::protocol::Envelope;
use crate::util::now_ms;

/// Interval between liveness sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);
/// Silence after which a session out of grace is closed.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(45);
/// Grace period granted to new sessions.
pub const GRACE_PERIOD: Duration = Duration::from_secs(90);
/// Backup timer for sessions that never leave grace (1.5 × grace).
pub const GRACE_BACKUP_TIMEOUT: Duration = Duration::from_secs(135);

/// How long teardown waits for the writer to flush its close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// State shared across all relay handlers.
#[derive(Clone)]
pub struct RelayState {
    /// Open sessions keyed by id. Its size is the active session count.
    pub sessions: Arc<RwLock<HashMap<Uuid, Arc<TunnelSession>>>>,
    pub max_clients: usize,
    /// Where the real Discord IPC endpoints live.
    pub endpoints: IpcEndpoints,
    /// Process epoch for lock-free liveness timestamps.
    pub epoch: Instant,
}

/// One remote client connected over the tunnel.
pub struct TunnelSession {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub bridge: Arc<Bridge>,
    tx: TunnelSender,
    /// Last inbound message as ms since relay epoch (lock-free).
    last_seen_ms: AtomicU64,
    in_grace: AtomicBool,
    closed: CancellationToken,
}

/// What a sweep decides for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Still within grace; leave it alone.
    InGrace,
    /// Grace ran out without a message; from now on it is held to the timeout.
    GraceEnded,
    /// Silent for longer than [`LIVENESS_TIMEOUT`].
    TimedOut,
    /// Healthy; send a ping.
    Alive,
}

/// Classify a session from how long it has been silent.
pub fn assess(silence: Duration, in_grace: bool) -> Liveness {
    if in_grace {
        if silence > GRACE_PERIOD {
            Liveness::GraceEnded
        } else {
            Liveness::InGrace
        }
    } else if silence > LIVENESS_TIMEOUT {
        Liveness::TimedOut
    } else {
        Liveness::Alive
    }
}

impl TunnelSession {
    pub(crate) fn new(id: Uuid, peer: SocketAddr, endpoints: IpcEndpoints, tx: TunnelSender, now_ms: u64) -> Self {
        Self {
            id,
            peer,
            bridge: Bridge::new(id.to_string(), endpoints, tx.clone()),
            tx,
            last_seen_ms: AtomicU64::new(now_ms),
            in_grace: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }
    }

    pub fn in_grace(&self) -> bool {
        self.in_grace.load(Ordering::Relaxed)
    }

    /// Record an inbound message: refresh liveness and end grace.
    fn touch(&self, now_ms: u64) {
        self.last_seen_ms.store(now_ms, Ordering::Relaxed);
        if self.in_grace.swap(false, Ordering::Relaxed) {
            info!(session = %self.id, peer = %self.peer, "Client sent first message, leaving grace period");
        }
    }

    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope)
    }

    /// Queue a close frame and stop reading from the session.
    pub fn close(&self, code: u16, reason: &'static str) {
        self.tx.close(code, reason);
        self.closed.cancel();
    }
}

impl RelayState {
    pub fn new(max_clients: usize, endpoints: IpcEndpoints) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_clients,
            endpoints,
            epoch: Instant::now(),
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of all sessions, so callers never hold the map lock across I/O.
    pub async fn snapshot(&self) -> Vec<Arc<TunnelSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// One liveness pass over every session.
    /// Returns the ids of sessions closed for silence.
    pub async fn sweep(&self) -> Vec<Uuid> {
        let now_ms = self.now_ms();
        let mut timed_out = Vec::new();
        for session in self.snapshot().await {
            let silence_ms = now_ms.saturating_sub(session.last_seen_ms.load(Ordering::Relaxed));
            let silence = Duration::from_millis(silence_ms);
            match assess(silence, session.in_grace()) {
                Liveness::InGrace => {}
                Liveness::GraceEnded => {
                    info!(session = %session.id, peer = %session.peer, "Initial connection grace period ended ({}s since last message)", silence.as_secs());
                    session.in_grace.store(false, Ordering::Relaxed);
                }
                Liveness::TimedOut => {
                    warn!(session = %session.id, peer = %session.peer, "No message for {}s, closing connection", silence.as_secs());
                    session.close(CLOSE_GOING_AWAY, "Connection timeout");
                    timed_out.push(session.id);
                }
                Liveness::Alive => {
                    session.send(Envelope::Ping {
                        timestamp: Some(crate::util::now_ms()),
                    });
                }
            }
        }
        timed_out
    }

    /// Clear presence on every session's bridge and close the sessions
    /// (used during shutdown).
    pub async fn drain_all(&self, reason: &'static str) {
        let sessions = self.snapshot().await;
        let cleared = futures::future::join_all(sessions.iter().map(|s| s.bridge.clear_all())).await;
        info!(
            sessions = sessions.len(),
            cleared = cleared.iter().sum::<usize>(),
            "Cleared presence on all sessions"
        );
        for session in &sessions {
            session.close(CLOSE_GOING_AWAY, reason);
        }
    }
}

/// Spawn the periodic liveness sweep. Stops when `timers` is cancelled.
pub fn spawn_sweeper(state: RelayState, timers: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        // The first tick completes immediately; skip it so new sessions get a full interval.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    state.sweep().await;
                }
                () = timers.cancelled() => break,
            }
        }
    })
}

/// Build the relay router. The tunnel lives at `/`.
pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(session_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: RelayState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        relay_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// `GET /`: tunnel WebSocket upgrade.
async fn session_ws(
    State(state): State<RelayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let id = Uuid::new_v4();
    ws.on_upgrade(move |socket| {
        handle_session(socket, state, peer, id)
            .instrument(info_span!("tunnel_session", session = %id, peer = %peer))
    })
}

/// Handle one tunnel session from admission to teardown.
async fn handle_session(socket: WebSocket, state: RelayState, peer: SocketAddr, id: Uuid) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = TunnelSender::channel();
    let session = Arc::new(TunnelSession::new(
        id,
        peer,
        state.endpoints.clone(),
        tx,
        state.now_ms(),
    ));

    // Admission: count and insert under one write lock.
    let admitted = {
        let mut sessions = state.sessions.write().await;
        if sessions.len() >= state.max_clients {
            None
        } else {
            sessions.insert(id, Arc::clone(&session));
            Some(sessions.len())
        }
    };
    let Some(active) = admitted else {
        warn!("Too many clients (limit {}), rejecting {peer}", state.max_clients);
        let _ = ws_sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: "Maximum number of connections reached".into(),
            })))
            .await;
        return;
    };
    info!("Connected from {peer} ({active}/{} active)", state.max_clients);

    // Forward queued envelopes to the WS sink
    let send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Envelope(envelope) => match encode_envelope(&envelope) {
                    Some(text) => Message::Text(text.into()),
                    None => continue,
                },
                Outbound::Close { code, reason } => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let backup_timer = spawn_backup_timer(Arc::clone(&session));

    // Process messages from the client
    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            () = session.closed.cancelled() => break,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text.into(),
                Err(_) => {
                    warn!("Discarding non-UTF-8 binary frame ({} bytes)", data.len());
                    continue;
                }
            },
            Message::Close(frame) => {
                let (code, reason) = frame.map_or((0, String::new()), |f| (f.code, f.reason.as_str().to_owned()));
                info!("Client closed the tunnel (code {code}, reason {reason:?})");
                break;
            }
            _ => continue,
        };
        session.touch(state.now_ms());
        dispatch(&session, text.as_str()).await;
    }

    // Session gone: release Discord state before forgetting it
    backup_timer.abort();
    let remaining = {
        let mut sessions = state.sessions.write().await;
        sessions.remove(&id);
        sessions.len()
    };
    session.bridge.clear_all().await;
    session.tx.close(CLOSE_NORMAL, "");
    let mut send_task = send_task;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }
    info!("Client {peer} disconnected ({remaining}/{} active)", state.max_clients);
}

/// Close `session` if it is still in grace after [`GRACE_BACKUP_TIMEOUT`].
fn spawn_backup_timer(session: Arc<TunnelSession>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(GRACE_BACKUP_TIMEOUT).await;
        if session.in_grace() {
            warn!(session = %session.id, "Initial connection backup timeout triggered");
            session.close(CLOSE_GOING_AWAY, "Initial connection backup timeout");
        }
    })
}

/// Act on one inbound envelope.
async fn dispatch(session: &TunnelSession, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Discarding tunnel message: {e}");
            return;
        }
    };
    match envelope {
        Envelope::Ping { timestamp } => {
            session.send(Envelope::Pong {
                timestamp: now_ms(),
                echo: timestamp,
            });
        }
        Envelope::Pong { .. } => {}
        Envelope::IpcData { channel, data } => {
            session.bridge.forward(channel, data).await;
        }
        Envelope::AppConnected { channel, .. } => {
            info!(channel = %channel, "App connected to client IPC {channel}");
        }
        Envelope::AppDisconnected { channel, .. } => {
            info!(channel = %channel, "App disconnected from client IPC {channel}, clearing presence");
            let success = session.bridge.clear_presence(channel).await;
            session.send(Envelope::AppPresenceCleared {
                channel,
                success,
                timestamp: now_ms(),
            });
        }
        Envelope::ClearPresence { .. } => {
            info!("Received clear presence request from client");
            let cleared = session.bridge.clear_all().await;
            debug!(cleared, "Presence cleared for shutdown request");
            session.send(Envelope::ClearPresenceAck { timestamp: now_ms() });
        }
        other => {
            warn!(kind = other.kind(), "Unexpected message type from client");
        }
    }
}
