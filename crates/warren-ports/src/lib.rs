//! `warren-ports` – The Tunnel Port Manager
//!
//! Watches a contiguous range of loopback ports for tunnel endpoints brought
//! up by children (`ssh -R` reverse tunnels), performs the
//! GetIdentity/ReplyIdentity handshake against each new listener, and hands
//! identified connections to an [`Attacher`]. Also allocates ports to child
//! identities on demand: round-robin over idle ports with sticky
//! id-to-port assignment.
//!
//! # Modules
//!
//! - [`probe`] – [`ListenerProbe`]: one point-in-time query for listeners in
//!   a port range; [`SsProbe`] shells out to iproute2's `ss`.
//! - [`handshake`] – dial a tunnel endpoint's `/ws` and exchange identities.
//! - [`attach`] – [`Attacher`]: the seam a bridge implements to consume
//!   identified connections.
//! - [`port`] – [`Port`]: one slot of the range, `idle → trying → connected`.
//! - [`pool`] – [`PortPool`]: the whole range, the scan tick, and the
//!   allocator.

pub mod attach;
pub mod handshake;
pub mod pool;
pub mod port;
pub mod probe;

pub use attach::{Attacher, TunnelConn};
pub use pool::PortPool;
pub use port::Port;
pub use probe::{ListenerProbe, SsProbe};
