//! `warren-bridge` – The Child Collector
//!
//! Turns identified tunnel connections into bus-attached children. The
//! [`Bridge`] owns a [`warren_ports::PortPool`] plus a roster of every child
//! that ever completed the identity handshake; each live connection is
//! plugged into the [`warren_bus::Bus`] as a [`TunnelSocket`] and its frames
//! are pumped into dispatch until the connection drops.
//!
//! # Modules
//!
//! - [`bridge`] – [`Bridge`]: the child roster, the attach pump, and the
//!   `GetChildren` responder.
//! - [`socket`] – [`TunnelSocket`]: the bus-facing write half of one attached
//!   tunnel.

pub mod bridge;
pub mod socket;

pub use bridge::{Bridge, Child};
pub use socket::TunnelSocket;
