use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discriminator sent by a bridge to ask a freshly-detected endpoint who it is.
pub const GET_IDENTITY: &str = "GetIdentity";
/// Discriminator of the identity reply ([`MsgIdentity`]).
pub const REPLY_IDENTITY: &str = "ReplyIdentity";
/// Control message injected on the bus when a child's tunnel comes up.
pub const CMD_START: &str = "CmdStart";
/// Discriminator to request a bridge's child roster.
pub const GET_CHILDREN: &str = "GetChildren";
/// Discriminator of the child roster reply ([`MsgChildren`]).
pub const REPLY_CHILDREN: &str = "ReplyChildren";

/// Status of a Thing that is up and serving its bus.
pub const STATUS_ONLINE: &str = "online";
/// Status a bridge records for a child whose tunnel dropped.
pub const STATUS_OFFLINE: &str = "offline";

/// Bare message envelope. Every frame on the wire carries at least the `Msg`
/// discriminator; receivers ignore any additional fields they don't know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    #[serde(rename = "Msg")]
    pub msg: String,
}

impl Msg {
    pub fn new(msg: &str) -> Self {
        Self {
            msg: msg.to_string(),
        }
    }
}

/// Identity reply sent in response to [`GET_IDENTITY`]. Field names are
/// PascalCase on the wire; `StartupTime` is an RFC 3339 timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MsgIdentity {
    pub msg: String,
    pub status: String,
    pub id: String,
    pub model: String,
    pub name: String,
    pub startup_time: DateTime<Utc>,
}

/// Child roster reply sent in response to [`GET_CHILDREN`]: child id mapped
/// to its last-known status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MsgChildren {
    pub msg: String,
    pub children: HashMap<String, String>,
}

/// Outcome of asking a bridge's allocator for a tunnel port. `Busy` and
/// `Exhausted` are contention conditions, not errors; callers poll and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortAssignment {
    /// Dial your tunnel to this port.
    Assigned(u16),
    /// The port sticky-assigned to this id is carrying a live connection.
    Busy,
    /// Every port in the range is connected or freshly claimed.
    Exhausted,
}

impl fmt::Display for PortAssignment {
    /// Renders the exact allocator wire strings: the bare port number,
    /// `port busy`, or `no ports available`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortAssignment::Assigned(port) => write!(f, "{port}"),
            PortAssignment::Busy => write!(f, "port busy"),
            PortAssignment::Exhausted => write!(f, "no ports available"),
        }
    }
}

impl FromStr for PortAssignment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "port busy" => Ok(PortAssignment::Busy),
            "no ports available" => Ok(PortAssignment::Exhausted),
            other => other
                .parse::<u16>()
                .map(PortAssignment::Assigned)
                .map_err(|_| Error::BadAssignment(other.to_string())),
        }
    }
}

/// Workspace-wide error type spanning configuration, transport, and
/// handshake failures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid port range [{begin}-{end}]: {reason}")]
    InvalidPortRange {
        begin: u16,
        end: u16,
        reason: String,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake on port {port} failed: {reason}")]
    Handshake { port: u16, reason: String },

    #[error("listener probe failed: {0}")]
    Probe(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unrecognized port assignment reply: {0:?}")]
    BadAssignment(String),

    #[error("packet's source socket is gone")]
    NoSource,

    #[error("packet's bus is gone")]
    BusGone,
}
