//! `warren-bus` – The Message Router
//!
//! A bounded publish/subscribe bus connecting transport [`Socket`]s and
//! in-process subscribers. Inbound frames become [`Packet`]s; [`Bus::receive`]
//! dispatches each packet to every handler whose regex pattern matches the
//! packet's `Msg` discriminator, [`Bus::broadcast`] fans a packet out to every
//! other plugged socket, and [`Bus::reply`] unicasts back to the source.
//!
//! # Modules
//!
//! - [`packet`] – [`Packet`]: serialized payload plus weak back-references to
//!   its source socket and owning bus.
//! - [`socket`] – [`Socket`]: the transport capability the bus routes over
//!   (send/close/name/flags) without ever seeing transport details.
//! - [`bus`] – [`Bus`]: the bounded socket set and the regex subscription
//!   table.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use warren_bus::{Bus, Packet};
//! use warren_types::Msg;
//!
//! let bus = Arc::new(Bus::default());
//! let _sub = bus.subscribe("GetIdentity", |pkt| {
//!     println!("identity requested: {}", pkt.payload());
//! });
//!
//! let pkt = Packet::with_value(&bus, None, &Msg::new("GetIdentity")).expect("serialize");
//! bus.receive(&pkt);
//! ```

pub mod bus;
pub mod packet;
pub mod socket;

pub use bus::{Bus, DEFAULT_MAX_SOCKETS, Handler, Subscription};
pub use packet::Packet;
pub use socket::{Socket, SocketRef, flags};
