//! TOML configuration for a Thing process.
//!
//! Every field carries a serde default so a minimal file (or no file at all)
//! yields a runnable configuration. The optional `[mother]` and `[bridge]`
//! tables decide the Thing's roles: a mother makes it someone's child (the
//! tunnel uplink runs), a bridge table makes it a parent (the port scanner
//! runs).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use warren_types::Error;

/// Top-level configuration, one Thing per file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub thing: ThingConfig,

    /// Present when this Thing tunnels up to a parent.
    #[serde(default)]
    pub mother: Option<MotherConfig>,

    /// Present when this Thing bridges children of its own.
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
}

/// The `[thing]` table: identity and the private endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThingConfig {
    /// Stable identity; when empty a `<model>-<uuid>` id is generated at
    /// startup.
    #[serde(default)]
    pub id: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_name")]
    pub name: String,

    /// Loopback port of the private endpoint. Zero disables it.
    #[serde(default = "default_port_private")]
    pub port_private: u16,

    /// Bus admission capacity.
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
}

/// The `[mother]` table: where this Thing's tunnel uplink points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotherConfig {
    pub host: String,

    /// ssh user on the mother host.
    pub user: String,

    /// The mother's private endpoint port, reached through the ssh tunnel's
    /// control channel for port allocation.
    #[serde(default = "default_port_private")]
    pub port_private: u16,
}

/// The `[bridge]` table: the port range scanned for child tunnels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port_begin")]
    pub port_begin: u16,

    #[serde(default = "default_port_end")]
    pub port_end: u16,
}

fn default_model() -> String {
    "thing".to_string()
}
fn default_name() -> String {
    "thing".to_string()
}
fn default_port_private() -> u16 {
    8080
}
fn default_max_sockets() -> usize {
    10
}
fn default_port_begin() -> u16 {
    8081
}
fn default_port_end() -> u16 {
    8088
}

impl Default for ThingConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            model: default_model(),
            name: default_name(),
            port_private: default_port_private(),
            max_sockets: default_max_sockets(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port_begin: default_port_begin(),
            port_end: default_port_end(),
        }
    }
}

/// Load a config file. A missing file is `Ok(None)` so the caller can fall
/// back to defaults; an unreadable or unparsable file is an error.
pub fn load(path: &Path) -> Result<Option<Config>, Error> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
    let config = toml::from_str(&raw)
        .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
    Ok(Some(config))
}
