//! The connect-and-identify exchange against a tunnel endpoint.
//!
//! A newly-detected listener might be anything; it only becomes a child once
//! it has answered `{"Msg":"GetIdentity"}` with a `ReplyIdentity`. Frames
//! carrying any other discriminator while we wait are discarded, and every
//! read is bounded by a fresh [`REPLY_TIMEOUT`].

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use warren_types::{Error, GET_IDENTITY, Msg, MsgIdentity, REPLY_IDENTITY};

/// Client-side WebSocket connection to a tunnel endpoint.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Per-read deadline while waiting for the identity reply. Re-armed for every
/// discarded frame.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Dial the endpoint's private WebSocket on the loopback interface.
pub async fn dial(port: u16) -> Result<WsStream, Error> {
    let url = format!("ws://127.0.0.1:{port}/ws");
    let (stream, _) = connect_async(&url)
        .await
        .map_err(|e| Error::Transport(format!("dialing {url}: {e}")))?;
    Ok(stream)
}

/// Send `GetIdentity` and wait for the `ReplyIdentity` frame.
///
/// Discrimination happens in two steps: a frame whose `Msg` is anything other
/// than `ReplyIdentity` is skipped and the wait continues; a frame that
/// claims to be a `ReplyIdentity` but doesn't carry the identity fields is a
/// handshake failure.
pub async fn identify(stream: &mut WsStream, port: u16) -> Result<MsgIdentity, Error> {
    let request = serde_json::to_string(&Msg::new(GET_IDENTITY))
        .map_err(|e| Error::Serialization(e.to_string()))?;
    stream.send(Message::text(request)).await.map_err(|e| {
        Error::Handshake {
            port,
            reason: format!("sending identity request: {e}"),
        }
    })?;

    loop {
        let frame = tokio::time::timeout(REPLY_TIMEOUT, stream.next())
            .await
            .map_err(|_| Error::Handshake {
                port,
                reason: "no identity reply within deadline".to_string(),
            })?
            .ok_or_else(|| Error::Handshake {
                port,
                reason: "connection closed before identity reply".to_string(),
            })?
            .map_err(|e| Error::Handshake {
                port,
                reason: format!("reading identity reply: {e}"),
            })?;

        let Message::Text(text) = frame else {
            continue;
        };

        let discriminator = serde_json::from_str::<Msg>(text.as_str())
            .map(|m| m.msg)
            .unwrap_or_default();
        if discriminator != REPLY_IDENTITY {
            debug!(port, %discriminator, "skipping frame while waiting for identity");
            continue;
        }

        let identity: MsgIdentity =
            serde_json::from_str(text.as_str()).map_err(|e| Error::Handshake {
                port,
                reason: format!("malformed identity reply: {e}"),
            })?;
        debug!(port, id = %identity.id, model = %identity.model, "identity received");
        return Ok(identity);
    }
}

/// Dial and identify in one step. On identify failure the connection is
/// closed before the error is returned.
pub async fn connect_and_identify(port: u16) -> Result<(WsStream, MsgIdentity), Error> {
    let mut stream = dial(port).await?;
    match identify(&mut stream, port).await {
        Ok(identity) => Ok((stream, identity)),
        Err(e) => {
            let _ = stream.close(None).await;
            Err(e)
        }
    }
}
