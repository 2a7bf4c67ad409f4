//! Bus socket wrapping the write half of an attached child tunnel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use warren_bus::{Packet, Socket, flags};
use warren_ports::handshake::WsStream;
use warren_types::Error;

/// One attached tunnel as the bus sees it.
///
/// Sends are queued on an unbounded channel and drained by a writer task
/// owning the sink half of the split stream, so a bus broadcast never waits
/// on a slow child. `close` cancels the session token shared with the read
/// pump, which is what tears the whole connection down.
pub struct TunnelSocket {
    name: String,
    tx: mpsc::UnboundedSender<String>,
    session: CancellationToken,
    flags: AtomicU32,
}

impl TunnelSocket {
    /// Wrap `sink` and spawn its writer task. The socket carries the tunnel
    /// flag so subscribers can tell tunnel-sourced packets apart.
    pub fn start(
        name: String,
        sink: SplitSink<WsStream, Message>,
        session: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sock = Arc::new(Self {
            name,
            tx,
            session: session.clone(),
            flags: AtomicU32::new(flags::TUNNEL),
        });
        tokio::spawn(write_loop(sink, rx, session));
        sock
    }
}

impl Socket for TunnelSocket {
    fn send(&self, pkt: &Packet) -> Result<(), Error> {
        self.tx
            .send(pkt.payload().to_string())
            .map_err(|_| Error::Transport("tunnel writer is gone".to_string()))
    }

    fn close(&self) {
        self.session.cancel();
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

/// Drain queued frames until the session ends or a write fails, flushing
/// anything already queued before honoring the cancel, then send a close
/// frame.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
    session: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        debug!(error = %e, "tunnel write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = session.cancelled() => break,
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use warren_bus::Bus;
    use warren_types::Msg;

    #[tokio::test]
    async fn queued_sends_reach_the_peer_before_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut got = Vec::new();
            while let Some(Ok(frame)) = ws.next().await {
                match frame {
                    Message::Text(text) => got.push(text.as_str().to_string()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            got
        });

        let (client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();
        let (sink, _read) = client.split();
        let session = CancellationToken::new();
        let sock = TunnelSocket::start("port:9001".to_string(), sink, session.clone());

        let bus = Arc::new(Bus::default());
        let pkt = Packet::with_value(&bus, None, &Msg::new("SpamUpdate")).unwrap();
        sock.send(&pkt).unwrap();
        sock.close();

        let got = server.await.unwrap();
        assert_eq!(got, vec![r#"{"Msg":"SpamUpdate"}"#.to_string()]);
        assert!(session.is_cancelled(), "close must cancel the shared session");
    }

    #[tokio::test]
    async fn carries_the_tunnel_flag() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            std::future::pending::<()>().await;
        });

        let (client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();
        let (sink, _read) = client.split();
        let sock = TunnelSocket::start("port:9001".to_string(), sink, CancellationToken::new());

        assert_eq!(sock.name(), "port:9001");
        assert_ne!(sock.flags() & flags::TUNNEL, 0);
        sock.set_flags(0);
        assert_eq!(sock.flags(), 0);
    }
}
