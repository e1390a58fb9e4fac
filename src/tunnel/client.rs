//! Tunnel client: outbound WS connection from the remote side to home.
//!
//! Spawned by `hashi client`. Keeps one WebSocket open to the home machine:
//! connect with a 15 s timeout, ping right away and every 10 s, dispatch
//! inbound envelopes, and reconnect after `reconnect_interval` whenever the
//! session ends.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{encode_envelope, Outbound, TunnelLink, TunnelSender};
use crate::config::ClientConfig;
use crate::mux::Multiplexer;
use crate::protocol::Envelope;
use crate::util::now_ms;

/// Interval between client pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Upper bound on establishing the WebSocket.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Spawn the tunnel client task. Runs until `timers` is cancelled.
pub fn spawn(
    config: ClientConfig,
    mux: Arc<Multiplexer>,
    link: TunnelLink,
    timers: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(tunnel_client_loop(config, mux, link, timers))
}

/// Main loop: connect, handle messages, reconnect on failure.
async fn tunnel_client_loop(config: ClientConfig, mux: Arc<Multiplexer>, link: TunnelLink, timers: CancellationToken) {
    let url = config.url();
    let delay = config.reconnect_interval();

    while !timers.is_cancelled() {
        if link.begin_connect() {
            info!("Tunnel: connecting to {url}");
            match connect_and_run(&url, &mux, &link, &timers).await {
                Ok(DisconnectReason::ServerClosed) => {
                    info!("Tunnel: server closed the connection, reconnecting in {}ms", delay.as_millis());
                }
                Ok(DisconnectReason::Local) => {
                    info!("Tunnel: connection closed locally");
                }
                Err(e) => {
                    warn!("Tunnel: connection error: {e}, reconnecting in {}ms", delay.as_millis());
                }
            }
            link.reset();
        } else {
            debug!("Tunnel: connect already in progress, skipping");
        }

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = timers.cancelled() => break,
        }
    }
    debug!("Tunnel: reconnect loop stopped");
}

/// Reason the tunnel connection ended.
enum DisconnectReason {
    /// Close frame or EOF from the home side.
    ServerClosed,
    /// We sent the close ourselves (shutdown).
    Local,
}

/// A single connection attempt: connect, then handle messages until disconnect.
async fn connect_and_run(
    url: &str,
    mux: &Multiplexer,
    link: &TunnelLink,
    timers: &CancellationToken,
) -> Result<DisconnectReason, Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _response) =
        tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| format!("connection timed out after {}s", CONNECT_TIMEOUT.as_secs()))??;
    info!("Tunnel: connected to {url}");
    run_session(ws, mux, link, timers).await
}

/// Drive one established session until either side closes it.
async fn run_session<S>(
    ws: WebSocketStream<S>,
    mux: &Multiplexer,
    link: &TunnelLink,
    timers: &CancellationToken,
) -> Result<DisconnectReason, Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sink, mut ws_stream) = ws.split();

    let (sender, mut outbound) = TunnelSender::channel();
    if !link.open(sender.clone()) {
        return Err("tunnel state changed while connecting".into());
    }

    // The first tick fires immediately, which is the on-open ping.
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                let Some(msg) = msg else {
                    return Ok(DisconnectReason::ServerClosed);
                };
                match msg? {
                    Message::Text(text) => {
                        handle_server_message(mux, link, &sender, text.as_str()).await;
                    }
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_server_message(mux, link, &sender, text).await,
                        Err(_) => warn!("Tunnel: discarding non-UTF-8 binary frame"),
                    },
                    Message::Close(frame) => {
                        if let Some(frame) = frame {
                            info!("Tunnel: server closed (code {}, reason {:?})", u16::from(frame.code), frame.reason.as_str());
                        }
                        return Ok(DisconnectReason::ServerClosed);
                    }
                    _ => {}
                }
            }
            out = outbound.recv() => {
                // `sender` keeps the queue open, so `None` never happens here.
                let Some(out) = out else { return Ok(DisconnectReason::Local) };
                match out {
                    Outbound::Envelope(envelope) => {
                        if let Some(text) = encode_envelope(&envelope) {
                            ws_sink.send(Message::Text(text.into())).await?;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        link.begin_close();
                        let frame = CloseFrame {
                            code: code.into(),
                            reason: reason.into(),
                        };
                        // The peer may already be gone; the close is best-effort.
                        let _ = ws_sink.send(Message::Close(Some(frame))).await;
                        return Ok(DisconnectReason::Local);
                    }
                }
            }
            _ = heartbeat.tick(), if !timers.is_cancelled() => {
                sender.send(Envelope::Ping { timestamp: Some(now_ms()) });
            }
        }
    }
}

/// Handle one envelope from the home side.
async fn handle_server_message(mux: &Multiplexer, link: &TunnelLink, sender: &TunnelSender, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Tunnel: discarding message: {e}");
            return;
        }
    };
    match envelope {
        Envelope::IpcResponse { channel, data } => {
            let delivered = mux.deliver(channel, &data).await;
            if delivered == 0 {
                debug!(channel = %channel, "Tunnel: response for IPC {channel} has no local app");
            }
        }
        Envelope::Ping { timestamp } => {
            sender.send(Envelope::Pong {
                timestamp: now_ms(),
                echo: timestamp,
            });
        }
        Envelope::Pong { .. } => {
            // Heartbeat response, ignore
        }
        Envelope::ClearPresenceAck { .. } => {
            info!("Tunnel: server acknowledged presence clear");
            link.ack_clear_presence();
        }
        Envelope::AppPresenceCleared { channel, success, .. } => {
            info!(channel = %channel, success, "Tunnel: server cleared presence for IPC {channel}");
        }
        other => {
            info!(kind = other.kind(), "Tunnel: unhandled message type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcEndpoints;
    use crate::protocol::ChannelId;
    use crate::tunnel::SessionState;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn setup() -> (Arc<Multiplexer>, TunnelLink, TunnelSender, UnboundedReceiver<Outbound>) {
        let link = TunnelLink::new();
        let mux = Multiplexer::new(IpcEndpoints::with_base("/nonexistent/discord-ipc-"), link.clone());
        let (sender, rx) = TunnelSender::channel();
        (mux, link, sender, rx)
    }

    #[tokio::test]
    async fn ping_is_answered_with_echo() {
        let (mux, link, sender, mut rx) = setup();
        handle_server_message(&mux, &link, &sender, r#"{"type":"ping","timestamp":77}"#).await;
        match rx.try_recv() {
            Ok(Outbound::Envelope(Envelope::Pong { echo, .. })) => assert_eq!(echo, Some(77)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn clear_presence_ack_wakes_waiter() {
        let (mux, link, sender, _rx) = setup();
        handle_server_message(&mux, &link, &sender, r#"{"type":"clear_presence_ack","timestamp":1}"#).await;
        tokio::time::timeout(Duration::from_millis(50), link.clear_presence_acked())
            .await
            .expect("ack delivered");
    }

    #[tokio::test]
    async fn response_reaches_local_app() {
        use tokio::io::AsyncReadExt;

        let (mux, link, sender, _rx) = setup();
        let ch = ChannelId::new(1).unwrap();
        let (mut app, local) = tokio::io::duplex(64);
        mux.attach(ch, local).await;

        handle_server_message(&mux, &link, &sender, r#"{"type":"ipc_response","channel":1,"data":"cG9uZw=="}"#).await;
        let mut buf = [0u8; 4];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn junk_is_ignored() {
        let (mux, link, sender, mut rx) = setup();
        handle_server_message(&mux, &link, &sender, "{").await;
        handle_server_message(&mux, &link, &sender, r#"{"type":"ipc_data","channel":0,"data":""}"#).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unreachable_server_returns_link_to_disconnected() {
        let (mux, link, _sender, _rx) = setup();
        let timers = CancellationToken::new();
        // Nothing listens on port 1.
        let config = ClientConfig {
            main_pc_ip: "127.0.0.1".into(),
            main_pc_port: 1,
            reconnect_interval_ms: 60_000,
        };
        let task = spawn(config, mux, link.clone(), timers.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(link.state(), SessionState::Disconnected);

        timers.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop stops once timers are cancelled")
            .unwrap();
    }

    /// An in-memory WebSocket: (client end, home end).
    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, home) = tokio::io::duplex(64 * 1024);
        (
            WebSocketStream::from_raw_socket(client, Role::Client, None).await,
            WebSocketStream::from_raw_socket(home, Role::Server, None).await,
        )
    }

    async fn next_envelope(home: &mut WebSocketStream<DuplexStream>) -> Envelope {
        let msg = home.next().await.expect("session open").unwrap();
        Envelope::decode(msg.to_text().unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn pings_on_open_and_every_heartbeat() {
        let (mux, link, _sender, _rx) = setup();
        let timers = CancellationToken::new();
        let (client_ws, mut home) = ws_pair().await;
        assert!(link.begin_connect());
        let session = tokio::spawn({
            let link = link.clone();
            async move { matches!(run_session(client_ws, &mux, &link, &timers).await, Ok(DisconnectReason::ServerClosed)) }
        });

        let started = tokio::time::Instant::now();
        let mut ping_times = Vec::new();
        for _ in 0..3 {
            assert!(matches!(next_envelope(&mut home).await, Envelope::Ping { timestamp: Some(_) }));
            ping_times.push(started.elapsed());
        }
        assert!(link.is_open());
        assert!(ping_times[0] < Duration::from_secs(1), "first ping goes out on open");
        for (n, at) in ping_times.iter().enumerate().skip(1) {
            let expected = HEARTBEAT_INTERVAL * u32::try_from(n).unwrap();
            assert!(*at >= expected && *at < expected + Duration::from_secs(1), "ping {n} at {at:?}");
        }

        home.close(None).await.unwrap();
        assert!(session.await.unwrap(), "home close ends the session as server-closed");
    }

    #[tokio::test(start_paused = true)]
    async fn no_heartbeat_once_timers_are_cancelled() {
        let (mux, link, _sender, _rx) = setup();
        let timers = CancellationToken::new();
        let (client_ws, mut home) = ws_pair().await;
        assert!(link.begin_connect());
        tokio::spawn({
            let (link, timers) = (link.clone(), timers.clone());
            async move {
                let _ = run_session(client_ws, &mux, &link, &timers).await;
            }
        });

        assert!(matches!(next_envelope(&mut home).await, Envelope::Ping { .. }));
        timers.cancel();
        let quiet = tokio::time::timeout(HEARTBEAT_INTERVAL * 3, home.next()).await;
        assert!(quiet.is_err(), "no ping after shutdown began");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_hits_connect_timeout() {
        let (mux, link, _sender, _rx) = setup();
        // Accepts TCP but never answers the upgrade.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let timers = CancellationToken::new();

        let started = tokio::time::Instant::now();
        assert!(link.begin_connect());
        let Err(e) = connect_and_run(&url, &mux, &link, &timers).await else {
            panic!("connect should not succeed");
        };
        assert!(e.to_string().contains("timed out"), "{e}");
        assert!(started.elapsed() >= CONNECT_TIMEOUT);
        assert_eq!(link.state(), SessionState::Connecting, "never opened");
        drop(listener);
    }
}
