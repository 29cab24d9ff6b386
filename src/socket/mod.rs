//! Socket.IO signaling client
//!
//! Connects to the signaling server over a WebSocket, relays `call:*` events
//! into the call controller and writes the controller's outbound signals in
//! the order they were sent.

pub mod frame;
pub mod websocket;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::calling::controller::CallHandle;
use crate::calling::signaling::{InboundSignal, OutboundSignal, SignalingError, SignalingTransport};
use frame::Packet;
use websocket::SignalSocket;

/// Used when the server's handshake does not announce ping timing.
const DEFAULT_PING_WINDOW: Duration = Duration::from_secs(45);

const MAX_BACKOFF_SECS: u64 = 64;
/// A session that lasted this long resets the backoff.
const STABLE_SESSION: Duration = Duration::from_secs(60);

/// Build the WebSocket URL for a signaling server base URL.
///
/// `http://host:5000` becomes
/// `ws://host:5000/socket.io/?EIO=4&transport=websocket&userId=<id>`.
pub fn endpoint_url(base: &str, user_id: &str) -> Result<String> {
    let mut url = url::Url::parse(base).with_context(|| format!("Invalid signaling URL {base}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => anyhow::bail!("Unsupported signaling URL scheme {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot use scheme {scheme} for {base}"))?;

    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket")
        .append_pair("userId", user_id);
    Ok(url.into())
}

/// Write side handed to the call controller.
#[derive(Clone)]
pub struct SocketTransport {
    outbound: mpsc::UnboundedSender<OutboundSignal>,
    connected: watch::Receiver<bool>,
}

/// Read side owned by [`run`].
pub struct Outbound {
    rx: mpsc::UnboundedReceiver<OutboundSignal>,
    connected: watch::Sender<bool>,
}

pub fn channel() -> (SocketTransport, Outbound) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (connected_tx, connected_rx) = watch::channel(false);
    (
        SocketTransport {
            outbound: tx,
            connected: connected_rx,
        },
        Outbound {
            rx,
            connected: connected_tx,
        },
    )
}

impl SocketTransport {
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the namespace connect completed at least once.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut connected = self.connected.clone();
        connected
            .wait_for(|c| *c)
            .await
            .context("Signaling client stopped")?;
        Ok(())
    }
}

#[async_trait]
impl SignalingTransport for SocketTransport {
    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Disconnected);
        }
        self.outbound
            .send(signal)
            .map_err(|_| SignalingError::Disconnected)
    }
}

/// Run the signaling connection until the controller drops its transport.
///
/// Reconnects with exponential backoff (1s, 2s, 4s, ... capped at 64s). Signals
/// still queued when the connection drops are discarded; the controller sees
/// later sends fail with [`SignalingError::Disconnected`].
pub async fn run(url: String, mut outbound: Outbound, handle: CallHandle) -> Result<()> {
    let mut backoff = 1u64;

    loop {
        let started = Instant::now();
        let result = run_session(&url, &mut outbound, &handle).await;
        outbound.connected.send_replace(false);

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                if started.elapsed() >= STABLE_SESSION {
                    backoff = 1;
                }
                tracing::warn!("Signaling disconnected: {:#}. Reconnecting in {}s...", e, backoff);
            }
        }

        let sleep = time::sleep(Duration::from_secs(backoff));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                signal = outbound.rx.recv() => match signal {
                    Some(signal) => tracing::warn!(
                        "Dropping {} to {}: signaling disconnected",
                        signal.event_name(),
                        signal.to()
                    ),
                    None => return Ok(()),
                },
            }
        }
        backoff = next_backoff(backoff);
    }
}

fn next_backoff(secs: u64) -> u64 {
    (secs * 2).min(MAX_BACKOFF_SECS)
}

/// One connection: handshake, namespace connect, event loop.
///
/// Returns `Ok` only when the outbound channel closed.
async fn run_session(url: &str, outbound: &mut Outbound, handle: &CallHandle) -> Result<()> {
    let mut ws = SignalSocket::connect(url).await?;

    let open = loop {
        let text = ws
            .recv_frame()
            .await?
            .context("Connection closed before handshake")?;
        match Packet::decode(&text)? {
            Packet::Open(info) => break info,
            other => tracing::debug!("Ignoring frame before handshake: {:?}", other),
        }
    };
    tracing::debug!("Engine.IO session {}", open.sid);

    ws.send_text(frame::CONNECT).await?;
    loop {
        let text = ws
            .recv_frame()
            .await?
            .context("Connection closed before namespace connect")?;
        match Packet::decode(&text)? {
            Packet::Connect => break,
            Packet::ConnectError(data) => anyhow::bail!("Server refused connection: {}", data),
            Packet::Ping => ws.send_text(frame::PONG).await?,
            other => tracing::debug!("Ignoring frame before connect: {:?}", other),
        }
    }

    let ping_window = match open.ping_interval + open.ping_timeout {
        0 => DEFAULT_PING_WINDOW,
        ms => Duration::from_millis(ms),
    };
    outbound.connected.send_replace(true);
    tracing::info!("Signaling connected");

    let deadline = time::sleep(ping_window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            received = ws.recv_frame() => {
                let text = received?.context("WebSocket closed by server")?;
                deadline.as_mut().reset(time::Instant::now() + ping_window);
                handle_frame(&text, &mut ws, handle).await?;
            }
            signal = outbound.rx.recv() => match signal {
                Some(signal) => {
                    let text = frame::encode_event(signal.event_name(), &signal.payload());
                    ws.send_text(&text).await?;
                }
                None => {
                    tracing::debug!("Outbound channel closed, disconnecting");
                    ws.close().await;
                    return Ok(());
                }
            },
            _ = &mut deadline => {
                anyhow::bail!("No ping from server for {}s", ping_window.as_secs());
            }
        }
    }
}

async fn handle_frame(text: &str, ws: &mut SignalSocket, handle: &CallHandle) -> Result<()> {
    let packet = match Packet::decode(text) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!("Ignoring undecodable frame: {}", e);
            return Ok(());
        }
    };

    match packet {
        Packet::Ping => ws.send_text(frame::PONG).await?,
        Packet::Event { name, data, ack } => {
            if let Some(id) = ack {
                ws.send_text(&frame::encode_ack(id)).await?;
            }
            match InboundSignal::parse(&name, data) {
                Ok(Some(signal)) => handle.deliver(signal),
                Ok(None) => tracing::debug!("Ignoring event {}", name),
                Err(e) => tracing::warn!("Dropping event: {}", e),
            }
        }
        Packet::Close | Packet::Disconnect => anyhow::bail!("Server closed the session"),
        Packet::ConnectError(data) => anyhow::bail!("Server error: {}", data),
        Packet::Open(_) | Packet::Connect | Packet::Pong | Packet::Other(_) => {}
    }
    Ok(())
}
