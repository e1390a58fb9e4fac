//! Fake Discord IPC endpoints on the remote side.
//!
//! [`Multiplexer`] listens on every `discord-ipc-<n>` address so local
//! applications connect to it as if Discord were running. Each accepted
//! connection is attached to its channel:
//!
//! - bytes read from the app go out as `ipc_data{channel}` while the tunnel is
//!   open and are dropped otherwise;
//! - `ipc_response{channel}` from the tunnel is written to **every** app
//!   attached to that channel;
//! - attach/detach are announced with `app_connected` / `app_disconnected`.
//!
//! ## Concurrency
//!
//! The channel map is behind one `Mutex`. Each connection has a reader task
//! (app → tunnel) and a writer task fed by an unbounded queue (tunnel → app).
//! Attachment inserts the entry while holding the lock, so a connection that
//! closes immediately can never detach before it was registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ipc::{self, IpcEndpoints, LocalListener};
use crate::protocol::{ChannelId, Envelope};
use crate::tunnel::TunnelLink;
use crate::util::now_ms;

/// Delay before re-creating an endpoint whose listener failed.
pub const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Read buffer per local connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// One application connected to a fake endpoint.
struct LocalConn {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for LocalConn {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Remote-side channel multiplexer.
pub struct Multiplexer {
    endpoints: IpcEndpoints,
    link: TunnelLink,
    channels: Mutex<HashMap<ChannelId, HashMap<u64, LocalConn>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    next_conn_id: AtomicU64,
    closed: AtomicBool,
}

impl Multiplexer {
    pub fn new(endpoints: IpcEndpoints, link: TunnelLink) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            link,
            channels: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Start one listener task per channel.
    pub async fn start(self: &Arc<Self>) {
        let mut listeners = self.listeners.lock().await;
        for channel in ChannelId::all() {
            listeners.push(tokio::spawn(Arc::clone(self).listen(channel)));
        }
    }

    /// Keep an endpoint bound for `channel`, re-creating it after failures.
    async fn listen(self: Arc<Self>, channel: ChannelId) {
        let path = self.endpoints.path(channel);
        loop {
            match LocalListener::bind(&path) {
                Ok(mut listener) => {
                    info!(channel = %channel, "IPC {channel} listening at {path}");
                    loop {
                        match listener.accept().await {
                            Ok(stream) => self.attach(channel, stream).await,
                            Err(e) => {
                                error!(channel = %channel, "Error on fake IPC {channel}: {e}");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(channel = %channel, "Failed to create fake IPC {channel} at {path}: {e}");
                }
            }
            tokio::time::sleep(LISTEN_RETRY_DELAY).await;
        }
    }

    /// Register an accepted connection and start relaying it.
    pub(crate) async fn attach<S>(self: &Arc<Self>, channel: ChannelId, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut channels = self.channels.lock().await;
        info!(channel = %channel, conn = id, "App connected to IPC {channel}");
        // Queued under the lock and before the reader starts, so neither the
        // app's first ipc_data nor its app_disconnected can overtake it.
        self.link.send(Envelope::AppConnected {
            channel,
            timestamp: now_ms(),
        });
        let conn = LocalConn {
            tx,
            reader: tokio::spawn(Arc::clone(self).read_app(channel, id, read_half)),
            writer: tokio::spawn(write_app(channel, write_half, rx)),
        };
        channels.entry(channel).or_default().insert(id, conn);
    }

    /// App → tunnel. Ends with a detach on EOF or read error.
    async fn read_app<R>(self: Arc<Self>, channel: ChannelId, id: u64, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let sent = self.link.send(Envelope::IpcData {
                        channel,
                        data: buf[..n].to_vec(),
                    });
                    if !sent {
                        debug!(channel = %channel, bytes = n, "Tunnel not open, dropped app data");
                    }
                }
                Err(e) => {
                    warn!(channel = %channel, conn = id, "Error on client connection to fake IPC {channel}: {e}");
                    break;
                }
            }
        }
        self.detach(channel, id).await;
    }

    async fn detach(&self, channel: ChannelId, id: u64) {
        let removed = {
            let mut channels = self.channels.lock().await;
            channels
                .get_mut(&channel)
                .and_then(|conns| conns.remove(&id))
        };
        let Some(conn) = removed else { return };

        info!(channel = %channel, conn = id, "App disconnected from IPC {channel}");
        if self.link.is_open() {
            info!(channel = %channel, "Notifying server of app disconnection from IPC {channel}");
            self.link.send(Envelope::AppDisconnected {
                channel,
                timestamp: now_ms(),
            });
        }
        // Aborts the calling reader task, so nothing may await after this.
        drop(conn);
    }

    /// Tunnel → apps: write `data` to every connection attached to `channel`.
    pub async fn deliver(&self, channel: ChannelId, data: &[u8]) -> usize {
        let channels = self.channels.lock().await;
        let Some(conns) = channels.get(&channel) else {
            return 0;
        };
        conns
            .values()
            .filter(|conn| conn.tx.send(data.to_vec()).is_ok())
            .count()
    }

    /// Number of apps currently attached to `channel`.
    pub async fn connection_count(&self, channel: ChannelId) -> usize {
        self.channels
            .lock()
            .await
            .get(&channel)
            .map_or(0, HashMap::len)
    }

    /// Stop every listener, drop every app connection, and remove socket files.
    /// Safe to call more than once; later calls do nothing.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting resource cleanup");
        for listener in self.listeners.lock().await.drain(..) {
            listener.abort();
        }
        for channel in ChannelId::all() {
            let path = self.endpoints.path(channel);
            if let Err(e) = ipc::remove_endpoint(&path) {
                warn!(channel = %channel, "Could not clean up socket at {path}: {e}");
            }
        }
        let conns: Vec<LocalConn> = self
            .channels
            .lock()
            .await
            .drain()
            .flat_map(|(_, conns)| conns.into_values())
            .collect();
        let count = conns.len();
        drop(conns);
        info!(connections = count, "Cleanup completed");
    }
}

/// Tunnel → app for a single connection.
async fn write_app<W>(channel: ChannelId, mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            warn!(channel = %channel, "Write to app on IPC {channel} failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
