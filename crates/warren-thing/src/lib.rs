//! `warren-thing` – The Thing Runtime
//!
//! Everything needed to run one device process ("Thing") on a warren tree: a
//! bus with an identity responder, the loopback private endpoint, the tunnel
//! uplink toward a configured mother, and (in bridge role) the port scanner
//! collecting children. The CLI builds a [`Thing`] from a [`config::Config`]
//! and calls [`Thing::run`].
//!
//! # Modules
//!
//! - [`config`] – the TOML file: `[thing]`, optional `[mother]`, optional
//!   `[bridge]`.
//! - [`thing`] – [`Thing`]: identity, bus, role wiring, run/shutdown.
//! - [`endpoint`] – [`PrivateEndpoint`]: loopback `/ws` + `/port/{id}`.
//! - [`uplink`] – [`TunnelUplink`]: allocate-and-`ssh -R` loop.
//! - [`telemetry`] – tracing subscriber + optional OTLP export.

pub mod config;
pub mod endpoint;
pub mod telemetry;
pub mod thing;
pub mod uplink;

pub use config::Config;
pub use endpoint::PrivateEndpoint;
pub use thing::Thing;
pub use uplink::TunnelUplink;
