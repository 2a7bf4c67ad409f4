//! The transport capability a [`Bus`] routes over.
//!
//! Transports (server-side WebSockets, bridge tunnel clients) implement
//! [`Socket`] and are plugged into the bus; the bus itself never learns what
//! carries the frames. A plugged socket's identity is the pointer identity of
//! its [`SocketRef`], so the handle used for `plugin` must be the handle used
//! for `unplug`.
//!
//! [`Bus`]: crate::Bus

use std::sync::Arc;

use warren_types::Error;

use crate::packet::Packet;

/// Well-known bits for [`Socket::flags`].
pub mod flags {
    /// Set on sockets that wrap a bridge tunnel connection.
    pub const TUNNEL: u32 = 1 << 0;
}

/// Anything that can carry packets to a peer and be closed.
///
/// `send` must not block the caller: implementations queue the frame and let
/// a writer task drain it. `close` tears down the transport, which the owning
/// read loop notices; the read loop, not `close`, unplugs the socket.
pub trait Socket: Send + Sync {
    /// Queue the packet's payload for delivery to the peer.
    fn send(&self, pkt: &Packet) -> Result<(), Error>;

    /// Close the underlying transport.
    fn close(&self);

    /// Name for logs, e.g. `port:8081` or `ws:127.0.0.1:51002`.
    fn name(&self) -> &str;

    fn flags(&self) -> u32;

    fn set_flags(&self, flags: u32);
}

/// Shared handle to a socket as the bus sees it.
pub type SocketRef = Arc<dyn Socket>;
