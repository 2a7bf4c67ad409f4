//! One slot of the scanned range.
//!
//! A port is `idle → trying → connected → idle`, with `trying → idle` on
//! deadline expiry. `trying` is the allocator's claim: [`PortPool::get_port`]
//! hands the port number to a child id and stamps a 2-second deadline; a
//! child that never shows up loses the claim when the deadline lapses.
//! `connected` means an attach task owns the port, from the moment the scan
//! saw a listener until the handshake fails or the pumped connection ends.
//!
//! [`PortPool::get_port`]: crate::pool::PortPool::get_port

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warren_types::Error;

use crate::attach::{Attacher, TunnelConn};
use crate::handshake;
use crate::probe::ListenerProbe;

#[derive(Default)]
struct PortState {
    trying: bool,
    trying_until: Option<Instant>,
    connected: bool,
    /// Cancelling tears down the live connection's pump loop.
    session: Option<CancellationToken>,
    /// Incremented per connect so a stale attach task can't clobber the
    /// state of its successor.
    generation: u64,
}

/// One port of the pool's range. All state sits behind a single per-port
/// lock; the pool's allocator lock is never held while this one is taken.
pub struct Port {
    number: u16,
    state: Mutex<PortState>,
}

impl Port {
    pub(crate) fn new(number: u16) -> Self {
        Self {
            number,
            state: Mutex::new(PortState::default()),
        }
    }

    /// The absolute port number this slot watches.
    pub fn number(&self) -> u16 {
        self.number
    }

    /// True while an attach task owns this port.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// True while the port is claimed by an allocation (the claim may have
    /// an expired deadline; expiry is evaluated at claim time).
    pub fn is_trying(&self) -> bool {
        self.state.lock().trying
    }

    /// Claim an unclaimed port: fails when connected or when an existing
    /// claim's deadline is still live; otherwise stamps `trying` with a
    /// fresh deadline of `ttl`.
    pub(crate) fn try_claim(&self, ttl: Duration) -> bool {
        let mut st = self.state.lock();
        if st.connected {
            return false;
        }
        if st.trying
            && st
                .trying_until
                .map(|until| until > Instant::now())
                .unwrap_or(false)
        {
            return false;
        }
        st.trying = true;
        st.trying_until = Some(Instant::now() + ttl);
        true
    }

    /// Refresh the claim deadline for the id that already owns this port.
    /// Fails only when the port is carrying a live connection.
    pub(crate) fn renew_claim(&self, ttl: Duration) -> bool {
        let mut st = self.state.lock();
        if st.connected {
            return false;
        }
        st.trying = true;
        st.trying_until = Some(Instant::now() + ttl);
        true
    }

    /// Take ownership of a freshly-detected listener: mark connected, clear
    /// the claim, and spawn the attach task (dial, identify, hand off to the
    /// attacher). No-op when already connected.
    ///
    /// Attach failure is logged and not retried here; the next scan re-detects
    /// a listener that is still up and calls `connect` again.
    pub fn connect(self: &Arc<Self>, attacher: &Weak<dyn Attacher>) {
        let session = CancellationToken::new();
        let generation;
        {
            let mut st = self.state.lock();
            if st.connected {
                return;
            }
            info!(port = self.number, "tunnel connected");
            st.connected = true;
            st.trying = false;
            st.session = Some(session.clone());
            st.generation += 1;
            generation = st.generation;
        }

        let port = Arc::clone(self);
        let attacher = attacher.clone();
        tokio::spawn(async move {
            port.run_attach(attacher, session, generation).await;
        });
    }

    /// Tear down a live connection: cancel its pump session and mark the
    /// port idle. Idempotent; a no-op on an idle port.
    pub fn disconnect(&self) {
        let mut st = self.state.lock();
        if st.connected {
            info!(port = self.number, "closing tunnel");
            st.connected = false;
            if let Some(session) = st.session.take() {
                session.cancel();
            }
        }
    }

    /// Single-port scan: probe just this port and drive
    /// `connect`/`disconnect` from the listener's presence.
    pub async fn scan(
        self: &Arc<Self>,
        probe: &dyn ListenerProbe,
        attacher: &Weak<dyn Attacher>,
    ) -> Result<(), Error> {
        let listeners = probe.listening(self.number, self.number).await?;
        if listeners.contains(&self.number) {
            self.connect(attacher);
        } else {
            self.disconnect();
        }
        Ok(())
    }

    async fn run_attach(
        self: Arc<Self>,
        attacher: Weak<dyn Attacher>,
        session: CancellationToken,
        generation: u64,
    ) {
        match handshake::connect_and_identify(self.number).await {
            Ok((stream, identity)) => match attacher.upgrade() {
                Some(attacher) => {
                    let conn = TunnelConn {
                        port: self.number,
                        stream,
                        closed: session,
                    };
                    if let Err(e) = attacher.attach(conn, identity).await {
                        warn!(port = self.number, error = %e, "attach failed");
                    }
                }
                None => debug!(port = self.number, "attacher gone; dropping connection"),
            },
            Err(e) => {
                warn!(port = self.number, error = %e, "connect failed");
            }
        }
        self.detached(generation);
    }

    /// Return to idle after an attach task ends, unless a newer connect has
    /// already taken the port over.
    fn detached(&self, generation: u64) {
        let mut st = self.state.lock();
        if st.generation == generation {
            st.connected = false;
            st.session = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn test_force_connected(&self) -> CancellationToken {
        let mut st = self.state.lock();
        let session = CancellationToken::new();
        st.connected = true;
        st.trying = false;
        st.session = Some(session.clone());
        st.generation += 1;
        session
    }
}
