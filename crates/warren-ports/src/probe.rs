//! Point-in-time discovery of loopback listeners.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::process::Command;

use warren_types::Error;

/// One query for the TCP listeners currently bound to 127.0.0.1 with a port
/// inside `[begin, end]`.
///
/// The pool issues a single range-wide query per scan tick rather than one
/// per port. Tests substitute a fake that returns a scripted set.
#[async_trait]
pub trait ListenerProbe: Send + Sync {
    async fn listening(&self, begin: u16, end: u16) -> Result<HashSet<u16>, Error>;
}

/// Probe backed by iproute2's `ss`.
#[derive(Debug, Default)]
pub struct SsProbe;

#[async_trait]
impl ListenerProbe for SsProbe {
    async fn listening(&self, begin: u16, end: u16) -> Result<HashSet<u16>, Error> {
        // ss -Hntl4 src 127.0.0.1 sport ge <begin> sport le <end>
        let output = Command::new("ss")
            .args([
                "-Hntl4",
                "src",
                "127.0.0.1",
                "sport",
                "ge",
                &begin.to_string(),
                "sport",
                "le",
                &end.to_string(),
            ])
            .output()
            .await
            .map_err(|e| Error::Probe(format!("spawning ss: {e}")))?;

        if !output.status.success() {
            return Err(Error::Probe(format!(
                "ss exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_listener_table(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse headerless `ss -Hntl` output into the set of listening ports.
///
/// Each line looks like
/// `LISTEN 0 128 127.0.0.1:8081 0.0.0.0:*`; the port is the tail of the
/// fourth column. Lines that don't fit the shape are skipped.
pub fn parse_listener_table(table: &str) -> HashSet<u16> {
    let mut ports = HashSet::new();
    for line in table.lines() {
        let Some(local) = line.split_whitespace().nth(3) else {
            continue;
        };
        let Some((_, port)) = local.rsplit_once(':') else {
            continue;
        };
        if let Ok(port) = port.parse::<u16>() {
            ports.insert(port);
        }
    }
    ports
}
