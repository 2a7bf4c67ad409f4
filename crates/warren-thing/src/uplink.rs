//! The child-side tunnel uplink.
//!
//! A child has no dialable address; it publishes itself by holding an
//! `ssh -R` reverse tunnel from one of the mother's pooled loopback ports back
//! to its own private endpoint. The uplink loop asks the mother's allocator
//! which port to use (`GET /port/{id}`), holds the tunnel open until ssh
//! exits, and retries on a fixed cadence after sentinels, errors, or tunnel
//! loss. The mother's port scanner notices the forwarded listener and runs
//! the identity handshake through it.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warren_types::{Error, PortAssignment};

use crate::config::MotherConfig;

/// Pause between allocator attempts, after sentinels, errors, and dropped
/// tunnels alike.
pub const RETRY_PERIOD: Duration = Duration::from_secs(7);

/// Holds one reverse tunnel toward the configured mother.
pub struct TunnelUplink {
    id: String,
    host: String,
    user: String,
    mother_port: u16,
    private_port: u16,
    client: reqwest::Client,
}

impl TunnelUplink {
    pub fn new(id: &str, mother: &MotherConfig, private_port: u16) -> Self {
        Self {
            id: id.to_string(),
            host: mother.host.clone(),
            user: mother.user.clone(),
            mother_port: mother.port_private,
            private_port,
            client: reqwest::Client::new(),
        }
    }

    /// Ask the mother's allocator which pooled port to tunnel to.
    pub async fn fetch_assignment(&self) -> Result<PortAssignment, Error> {
        let url = format!(
            "http://{}:{}/port/{}",
            self.host, self.mother_port, self.id
        );
        let body = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("allocator request {url}: {e}")))?
            .text()
            .await
            .map_err(|e| Error::Transport(format!("allocator response {url}: {e}")))?;
        body.parse()
    }

    /// Spawn the uplink loop: allocate, tunnel, repeat until `shutdown`.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(id = %self.id, host = %self.host, "tunnel uplink started");
            loop {
                match self.fetch_assignment().await {
                    Ok(PortAssignment::Assigned(port)) => {
                        self.hold_tunnel(port, &shutdown).await;
                    }
                    Ok(sentinel) => {
                        debug!(id = %self.id, %sentinel, "allocator deferred; will retry");
                    }
                    Err(e) => {
                        warn!(id = %self.id, error = %e, "port allocation failed");
                    }
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_PERIOD) => {}
                }
            }
            debug!(id = %self.id, "tunnel uplink stopped");
        })
    }

    /// Run ssh until the tunnel dies or shutdown kills it. A clean or dirty
    /// exit both mean the same thing to the caller: re-allocate and retry.
    async fn hold_tunnel(&self, port: u16, shutdown: &CancellationToken) {
        let forward = format!("{port}:localhost:{}", self.private_port);
        let target = format!("{}@{}", self.user, self.host);
        info!(id = %self.id, port, %target, "opening reverse tunnel");

        let child = Command::new("ssh")
            .args(["-o", "ExitOnForwardFailure=yes", "-CNT", "-R", &forward, &target])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "spawning ssh failed");
                return;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "killing ssh tunnel");
                }
            }
            status = child.wait() => match status {
                Ok(status) => info!(id = %self.id, port, %status, "reverse tunnel exited"),
                Err(e) => warn!(id = %self.id, port, error = %e, "waiting on ssh"),
            },
        }
    }
}
