//! The seam between the port manager and whoever consumes attached endpoints.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use warren_types::{Error, MsgIdentity};

use crate::handshake::WsStream;

/// A tunnel connection that has completed the identity handshake.
pub struct TunnelConn {
    /// Loopback port the connection was dialed on.
    pub port: u16,
    /// The open WebSocket, positioned just past the identity exchange.
    pub stream: WsStream,
    /// Cancelled when the port manager wants this connection torn down
    /// (listener vanished from a scan, or an explicit disconnect).
    pub closed: CancellationToken,
}

/// Consumer of identified tunnel connections.
///
/// A bridge implements this: it wraps the connection in a bus socket and
/// pumps frames until the peer drops or `conn.closed` fires. `attach` runs
/// for the whole life of the connection; returning hands the port back to
/// the idle state.
#[async_trait]
pub trait Attacher: Send + Sync {
    async fn attach(&self, conn: TunnelConn, identity: MsgIdentity) -> Result<(), Error>;
}
