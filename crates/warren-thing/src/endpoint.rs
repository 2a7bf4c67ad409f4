//! The private endpoint: a loopback HTTP/WebSocket listener.
//!
//! This is how anything reaches a Thing. A bridge's attach task dials
//! `ws://127.0.0.1:{port}/ws` through the child's reverse tunnel, and a child
//! asks its parent for a tunnel port with `GET /port/{id}`. The listener
//! speaks just enough HTTP for those two paths: each accepted connection is
//! peeked to decide between a WebSocket upgrade and a plain text response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warren_bridge::Bridge;
use warren_bus::{Bus, Packet, Socket, SocketRef};
use warren_types::Error;

/// The loopback listener serving `/ws` and (in bridge role) `/port/{id}`.
pub struct PrivateEndpoint {
    bus: Arc<Bus>,
    bridge: Option<Arc<Bridge>>,
    listener: TcpListener,
    local_port: u16,
}

impl PrivateEndpoint {
    /// Bind the endpoint on `127.0.0.1:{port}`. Port zero binds an ephemeral
    /// port, reported by [`PrivateEndpoint::local_port`].
    pub async fn bind(
        bus: Arc<Bus>,
        bridge: Option<Arc<Bridge>>,
        port: u16,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| Error::Transport(format!("binding private endpoint on {port}: {e}")))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("private endpoint local addr: {e}")))?
            .port();
        Ok(Self {
            bus,
            bridge,
            listener,
            local_port,
        })
    }

    /// The port actually bound.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Spawn the accept loop, one task per connection, until `shutdown`.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(port = self.local_port, "private endpoint listening");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let bus = Arc::clone(&self.bus);
                            let bridge = self.bridge.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, bus, bridge).await {
                                    debug!(%peer, error = %e, "endpoint connection failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "endpoint accept failed"),
                    },
                }
            }
            debug!(port = self.local_port, "private endpoint stopped");
        })
    }
}

/// Decide what an accepted connection wants. `peek` leaves the request bytes
/// in place, so the WebSocket handshaker still sees the full HTTP request.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    bus: Arc<Bus>,
    bridge: Option<Arc<Bridge>>,
) -> Result<(), Error> {
    let mut buf = [0u8; 1024];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| Error::Transport(format!("peek from {peer}: {e}")))?;
    let preview = String::from_utf8_lossy(&buf[..n]);

    let path = preview
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("")
        .to_string();
    let is_upgrade = preview.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });

    if is_upgrade && path == "/ws" {
        return handle_ws(stream, peer, bus).await;
    }

    if let Some(id) = path.strip_prefix("/port/") {
        if let Some(bridge) = bridge.filter(|_| !id.is_empty()) {
            let assignment = bridge.assign_port(id);
            debug!(id, %assignment, "port allocation");
            return respond(stream, "200 OK", &assignment.to_string()).await;
        }
    }

    respond(stream, "404 Not Found", "not found").await
}

async fn respond(mut stream: TcpStream, status: &str, body: &str) -> Result<(), Error> {
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| Error::Transport(format!("HTTP write: {e}")))?;
    Ok(())
}

/// Upgrade, plug the connection into the bus, and feed its frames into
/// dispatch until it closes. Admission backpressure applies at `plugin`,
/// before the first frame is read.
async fn handle_ws(stream: TcpStream, peer: SocketAddr, bus: Arc<Bus>) -> Result<(), Error> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| Error::Transport(format!("WebSocket handshake from {peer}: {e}")))?;
    let (sink, mut frames) = ws.split();

    let sock_impl = WsSocket::start(format!("ws:{peer}"), sink);
    let closed = sock_impl.closed();
    let sock: SocketRef = sock_impl;
    bus.plugin(Arc::clone(&sock)).await;
    info!(socket = sock.name(), "websocket opened");

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let pkt = Packet::from_frame(&bus, &sock, text.as_str().to_string());
                    bus.receive(&pkt);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(socket = sock.name(), error = %e, "websocket read failed");
                    break;
                }
            },
        }
    }

    bus.unplug(&sock);
    sock.close();
    info!(socket = sock.name(), "websocket closed");
    Ok(())
}

/// Server-side WebSocket as the bus sees it. Outbound frames queue on an
/// unbounded channel drained by a writer task owning the sink half, so a
/// broadcast never waits on a slow peer.
struct WsSocket {
    name: String,
    tx: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    flags: AtomicU32,
}

impl WsSocket {
    fn start(name: String, sink: SplitSink<WebSocketStream<TcpStream>, Message>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let sock = Arc::new(Self {
            name,
            tx,
            closed: closed.clone(),
            flags: AtomicU32::new(0),
        });
        tokio::spawn(write_loop(sink, rx, closed));
        sock
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Socket for WsSocket {
    fn send(&self, pkt: &Packet) -> Result<(), Error> {
        self.tx
            .send(pkt.payload().to_string())
            .map_err(|_| Error::Transport("websocket writer is gone".to_string()))
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Relaxed);
    }
}

/// Drain queued frames until close or a failed write, flushing anything
/// already queued before honoring the cancel, then send a close frame.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        debug!(error = %e, "websocket write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = closed.cancelled() => break,
        }
    }
    let _ = sink.close().await;
}
