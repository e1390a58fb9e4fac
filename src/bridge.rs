//! Home-side bridge from tunnel channels to the real Discord IPC endpoints.
//!
//! One [`Bridge`] exists per tunnel session. The first `ipc_data` on a channel
//! opens a connection to `<base><channel>`; later payloads reuse it. Bytes
//! coming back from Discord go out as `ipc_response`.
//!
//! Connections are retired with a presence clear: the entry is untracked, a
//! `SET_ACTIVITY` frame with a null activity is written and flushed, and the
//! socket is destroyed after a short grace so Discord can act on the frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::frame;
use crate::ipc::{self, IpcEndpoints};
use crate::protocol::{ChannelId, Envelope};
use crate::tunnel::TunnelSender;

/// Delay between flushing the clear frame and destroying the connection.
pub const RETIRE_GRACE: Duration = Duration::from_millis(100);

/// Upper bound on waiting for the clear frame to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 64 * 1024;

enum WriteOp {
    Data(Vec<u8>),
    /// Write and flush, then report whether it made it out.
    Frame(Vec<u8>, oneshot::Sender<bool>),
}

/// A live connection to one Discord IPC endpoint.
struct BridgeConn {
    id: u64,
    tx: mpsc::UnboundedSender<WriteOp>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for BridgeConn {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[derive(Default)]
struct Channels {
    conns: HashMap<ChannelId, BridgeConn>,
    last_used: HashMap<ChannelId, Instant>,
}

impl Channels {
    fn touch(&mut self, channel: ChannelId) {
        self.last_used.insert(channel, Instant::now());
    }

    /// Drop every trace of `channel`, handing back its connection if any.
    fn untrack(&mut self, channel: ChannelId) -> Option<BridgeConn> {
        self.last_used.remove(&channel);
        self.conns.remove(&channel)
    }
}

/// Per-session map of channel → Discord IPC connection.
pub struct Bridge {
    session: String,
    endpoints: IpcEndpoints,
    tunnel: TunnelSender,
    channels: Mutex<Channels>,
    next_conn_id: AtomicU64,
    pid: u32,
}

impl Bridge {
    pub fn new(session: impl Into<String>, endpoints: IpcEndpoints, tunnel: TunnelSender) -> Arc<Self> {
        Arc::new(Self {
            session: session.into(),
            endpoints,
            tunnel,
            channels: Mutex::new(Channels::default()),
            next_conn_id: AtomicU64::new(1),
            pid: std::process::id(),
        })
    }

    /// Write an `ipc_data` payload to the channel's endpoint, connecting first
    /// if needed. A failed connect drops this payload only.
    pub async fn forward(self: &Arc<Self>, channel: ChannelId, data: Vec<u8>) {
        // The lock is held across the connect so a burst of payloads on a new
        // channel can only ever open one connection.
        let mut channels = self.channels.lock().await;
        // A writer that hit an error may not have untracked itself yet.
        if channels.conns.get(&channel).is_some_and(|conn| conn.tx.is_closed()) {
            debug!(session = %self.session, channel = %channel, "Discord IPC {channel} writer gone, reconnecting");
            channels.conns.remove(&channel);
        }
        if !channels.conns.contains_key(&channel) {
            let path = self.endpoints.path(channel);
            match ipc::connect(&path).await {
                Ok(stream) => {
                    info!(session = %self.session, channel = %channel, "Connected to Discord IPC {channel}");
                    let conn = self.spawn_conn(channel, stream);
                    channels.conns.insert(channel, conn);
                }
                Err(e) => {
                    warn!(session = %self.session, channel = %channel, "Failed to connect to Discord IPC {channel} at {path}: {e}");
                    return;
                }
            }
        }
        channels.touch(channel);
        if let Some(conn) = channels.conns.get(&channel) {
            if conn.tx.send(WriteOp::Data(data)).is_err() {
                debug!(session = %self.session, channel = %channel, "Discord IPC {channel} writer gone, payload dropped");
            }
        }
    }

    /// Track an already open stream as `channel`'s connection.
    #[cfg(test)]
    pub(crate) async fn adopt<S>(self: &Arc<Self>, channel: ChannelId, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = self.spawn_conn(channel, stream);
        let mut channels = self.channels.lock().await;
        channels.conns.insert(channel, conn);
        channels.touch(channel);
    }

    fn spawn_conn<S>(self: &Arc<Self>, channel: ChannelId, stream: S) -> BridgeConn
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        BridgeConn {
            id,
            tx,
            reader: tokio::spawn(Arc::clone(self).read_endpoint(channel, id, read_half)),
            writer: tokio::spawn(Arc::clone(self).write_endpoint(channel, id, write_half, rx)),
        }
    }

    /// Discord → tunnel.
    async fn read_endpoint<R>(self: Arc<Self>, channel: ChannelId, id: u64, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    info!(session = %self.session, channel = %channel, "Discord IPC {channel} closed");
                    break;
                }
                Ok(n) => {
                    self.channels.lock().await.touch(channel);
                    self.tunnel.send(Envelope::IpcResponse {
                        channel,
                        data: buf[..n].to_vec(),
                    });
                }
                Err(e) => {
                    warn!(session = %self.session, channel = %channel, "Error on Discord IPC {channel}: {e}");
                    break;
                }
            }
        }

        self.forget(channel, id).await;
    }

    /// Tunnel → Discord for a single connection.
    async fn write_endpoint<W>(
        self: Arc<Self>,
        channel: ChannelId,
        id: u64,
        mut writer: W,
        mut rx: mpsc::UnboundedReceiver<WriteOp>,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some(op) = rx.recv().await {
            match op {
                WriteOp::Data(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        warn!(session = %self.session, channel = %channel, "Write to Discord IPC {channel} failed: {e}");
                        break;
                    }
                }
                WriteOp::Frame(data, ack) => {
                    let result = async {
                        writer.write_all(&data).await?;
                        writer.flush().await
                    }
                    .await;
                    let ok = result.is_ok();
                    let _ = ack.send(ok);
                    if !ok {
                        break;
                    }
                }
            }
        }
        // Closing the queue first lets `forward` spot the dead writer at once.
        drop(rx);
        self.forget(channel, id).await;
    }

    /// Stop tracking connection `id` on `channel` so the next `ipc_data`
    /// reconnects. A newer connection in the slot is left alone, and the idle
    /// timestamp stays for the reaper. Aborts both tasks of that connection,
    /// so callers running inside one of them must not await afterwards.
    async fn forget(&self, channel: ChannelId, id: u64) {
        let stale = {
            let mut channels = self.channels.lock().await;
            match channels.conns.get(&channel) {
                Some(conn) if conn.id == id => channels.conns.remove(&channel),
                _ => None,
            }
        };
        drop(stale);
    }

    /// Clear presence on `channel` and release its connection.
    ///
    /// Returns `true` when the clear frame was flushed. A channel without a
    /// live connection reports `false`.
    pub async fn clear_presence(&self, channel: ChannelId) -> bool {
        let conn = self.channels.lock().await.untrack(channel);
        match conn {
            Some(conn) => self.retire(channel, conn).await,
            None => {
                debug!(session = %self.session, channel = %channel, "No Discord IPC connection on {channel} to clear");
                false
            }
        }
    }

    /// Clear presence on every live connection. Returns how many frames flushed.
    pub async fn clear_all(&self) -> usize {
        let conns: Vec<(ChannelId, BridgeConn)> = {
            let mut channels = self.channels.lock().await;
            channels.last_used.clear();
            channels.conns.drain().collect()
        };
        if conns.is_empty() {
            return 0;
        }
        info!(session = %self.session, connections = conns.len(), "Clearing presence on all Discord IPC connections");
        let results = futures::future::join_all(
            conns
                .into_iter()
                .map(|(channel, conn)| self.retire(channel, conn)),
        )
        .await;
        results.into_iter().filter(|flushed| *flushed).count()
    }

    /// Retire every channel idle for longer than `threshold`.
    pub async fn reap_idle(&self, threshold: Duration) -> usize {
        self.reap_idle_at(Instant::now(), threshold).await
    }

    /// Like [`reap_idle`](Self::reap_idle) with an explicit clock reading.
    /// Returns the number of connections retired; stale entries without a
    /// connection are dropped without touching the network.
    pub async fn reap_idle_at(&self, now: Instant, threshold: Duration) -> usize {
        let idle: Vec<(ChannelId, Option<BridgeConn>)> = {
            let mut channels = self.channels.lock().await;
            let stale: Vec<ChannelId> = channels
                .last_used
                .iter()
                .filter(|(_, used)| now.saturating_duration_since(**used) > threshold)
                .map(|(&channel, _)| channel)
                .collect();
            stale
                .into_iter()
                .map(|channel| (channel, channels.untrack(channel)))
                .collect()
        };

        let mut retired = 0;
        for (channel, conn) in idle {
            match conn {
                Some(conn) => {
                    info!(session = %self.session, channel = %channel, "Reaping idle Discord IPC {channel}");
                    self.retire(channel, conn).await;
                    retired += 1;
                }
                None => debug!(session = %self.session, channel = %channel, "Dropped stale idle entry for {channel}"),
            }
        }
        retired
    }

    /// Channels with a live connection.
    pub async fn live_channels(&self) -> Vec<ChannelId> {
        let mut live: Vec<ChannelId> = self.channels.lock().await.conns.keys().copied().collect();
        live.sort_unstable();
        live
    }

    /// Write the clear frame to an untracked connection, wait for the flush,
    /// give Discord [`RETIRE_GRACE`] to apply it, then destroy the connection.
    async fn retire(&self, channel: ChannelId, conn: BridgeConn) -> bool {
        let nonce = frame::clear_nonce(channel);
        let bytes = frame::clear_activity_frame(self.pid, &nonce);
        let (ack_tx, ack_rx) = oneshot::channel();

        let flushed = if conn.tx.send(WriteOp::Frame(bytes, ack_tx)).is_ok() {
            matches!(tokio::time::timeout(FLUSH_TIMEOUT, ack_rx).await, Ok(Ok(true)))
        } else {
            false
        };

        if flushed {
            info!(session = %self.session, channel = %channel, nonce = %nonce, "Sent presence clear on Discord IPC {channel}");
        } else {
            warn!(session = %self.session, channel = %channel, "Presence clear on Discord IPC {channel} was not flushed");
        }
        tokio::time::sleep(RETIRE_GRACE).await;
        drop(conn);
        flushed
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tunnel::Outbound;
    use tokio::net::{UnixListener, UnixStream};

    struct Fixture {
        _dir: tempfile::TempDir,
        endpoints: IpcEndpoints,
        bridge: Arc<Bridge>,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = IpcEndpoints::with_base(dir.path().join("discord-ipc-").to_string_lossy());
        let (tunnel, rx) = TunnelSender::channel();
        let bridge = Bridge::new("test", endpoints.clone(), tunnel);
        Fixture {
            _dir: dir,
            endpoints,
            bridge,
            rx,
        }
    }

    fn ch(id: u8) -> ChannelId {
        ChannelId::new(id).unwrap()
    }

    async fn accept(listener: &UnixListener) -> UnixStream {
        tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .expect("bridge connected")
            .unwrap()
            .0
    }

    fn assert_clear_frame(channel: ChannelId, pid: u32, frame: &[u8]) {
        let len = i32::from_le_bytes(frame[0..4].try_into().unwrap());
        assert_eq!(usize::try_from(len).unwrap(), frame.len() - 8);
        assert_eq!(i32::from_le_bytes(frame[4..8].try_into().unwrap()), 1);
        let body: serde_json::Value = serde_json::from_slice(&frame[8..]).unwrap();
        assert_eq!(body["cmd"], "SET_ACTIVITY");
        assert_eq!(body["args"]["pid"], pid);
        assert!(body["args"]["activity"].is_null());
        let nonce = body["nonce"].as_str().unwrap();
        assert!(nonce.starts_with(&format!("clear-channel-{channel}-")));
    }

    #[tokio::test]
    async fn forward_connects_once_and_relays_both_ways() {
        let mut fx = fixture();
        let listener = UnixListener::bind(fx.endpoints.path(ch(0))).unwrap();

        fx.bridge.forward(ch(0), b"hand".to_vec()).await;
        fx.bridge.forward(ch(0), b"shake".to_vec()).await;
        let mut discord = accept(&listener).await;

        let mut buf = [0u8; 9];
        discord.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"handshake");
        assert_eq!(fx.bridge.live_channels().await, vec![ch(0)]);

        discord.write_all(b"ready").await.unwrap();
        match fx.rx.recv().await {
            Some(Outbound::Envelope(Envelope::IpcResponse { channel, data })) => {
                assert_eq!(channel, ch(0));
                assert_eq!(data, b"ready");
            }
            other => panic!("unexpected {other:?}"),
        }

        // No second connection was attempted.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn missing_endpoint_drops_payload_and_retries_later() {
        let fx = fixture();
        fx.bridge.forward(ch(3), b"lost".to_vec()).await;
        assert!(fx.bridge.live_channels().await.is_empty());

        let listener = UnixListener::bind(fx.endpoints.path(ch(3))).unwrap();
        fx.bridge.forward(ch(3), b"kept".to_vec()).await;
        let mut discord = accept(&listener).await;
        let mut buf = [0u8; 4];
        discord.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"kept");
    }

    #[tokio::test]
    async fn clear_presence_writes_frame_then_closes() {
        let fx = fixture();
        let listener = UnixListener::bind(fx.endpoints.path(ch(1))).unwrap();
        fx.bridge.forward(ch(1), Vec::new()).await;
        let mut discord = accept(&listener).await;

        assert!(fx.bridge.clear_presence(ch(1)).await);
        assert!(fx.bridge.live_channels().await.is_empty());

        let mut frame = Vec::new();
        discord.read_to_end(&mut frame).await.unwrap();
        assert_clear_frame(ch(1), std::process::id(), &frame);

        assert!(!fx.bridge.clear_presence(ch(1)).await, "already retired");
    }

    #[tokio::test]
    async fn endpoint_close_untracks_connection() {
        let fx = fixture();
        let listener = UnixListener::bind(fx.endpoints.path(ch(2))).unwrap();
        fx.bridge.forward(ch(2), b"x".to_vec()).await;
        drop(accept(&listener).await);

        for _ in 0..50 {
            if fx.bridge.live_channels().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("closed endpoint still tracked");
    }

    #[tokio::test]
    async fn failed_write_untracks_and_next_payload_reconnects() {
        use std::net::Shutdown;

        let fx = fixture();
        let listener = UnixListener::bind(fx.endpoints.path(ch(0))).unwrap();
        fx.bridge.forward(ch(0), b"first".to_vec()).await;
        // Refuse further bytes but keep the socket open, so only writes fail.
        let discord = accept(&listener).await.into_std().unwrap();
        discord.shutdown(Shutdown::Read).unwrap();

        fx.bridge.forward(ch(0), vec![0u8; 256 * 1024]).await;
        let mut untracked = false;
        for _ in 0..50 {
            if fx.bridge.live_channels().await.is_empty() {
                untracked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(untracked, "connection with a dead writer still tracked");

        fx.bridge.forward(ch(0), b"again".to_vec()).await;
        let mut second = accept(&listener).await;
        let mut buf = [0u8; 5];
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
        assert_eq!(fx.bridge.live_channels().await, vec![ch(0)]);
        drop(discord);
    }

    #[tokio::test]
    async fn clear_all_retires_every_channel() {
        let fx = fixture();
        let a = UnixListener::bind(fx.endpoints.path(ch(0))).unwrap();
        let b = UnixListener::bind(fx.endpoints.path(ch(5))).unwrap();
        fx.bridge.forward(ch(0), Vec::new()).await;
        fx.bridge.forward(ch(5), Vec::new()).await;
        let _da = accept(&a).await;
        let _db = accept(&b).await;

        assert_eq!(fx.bridge.clear_all().await, 2);
        assert!(fx.bridge.live_channels().await.is_empty());
        assert_eq!(fx.bridge.clear_all().await, 0);
    }

    #[tokio::test]
    async fn reaper_only_takes_idle_channels() {
        let fx = fixture();
        let listener = UnixListener::bind(fx.endpoints.path(ch(4))).unwrap();
        fx.bridge.forward(ch(4), Vec::new()).await;
        let _discord = accept(&listener).await;

        let threshold = Duration::from_secs(300);
        assert_eq!(fx.bridge.reap_idle(threshold).await, 0);
        assert_eq!(fx.bridge.live_channels().await, vec![ch(4)]);

        let later = Instant::now() + Duration::from_secs(301);
        assert_eq!(fx.bridge.reap_idle_at(later, threshold).await, 1);
        assert!(fx.bridge.live_channels().await.is_empty());
    }
}
