//! Allocator and scanner for a contiguous range of local tunnel ports.
//!
//! The pool owns one [`Port`] per number in `[begin, end]`. Two actors drive
//! them: the allocator ([`PortPool::get_port`]) hands numbers to child ids
//! ahead of their dial, and the scanner (one probe pass per second) watches
//! which ports actually carry a listener and connects or disconnects them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warren_types::{Error, PortAssignment};

use crate::attach::Attacher;
use crate::port::Port;
use crate::probe::ListenerProbe;

/// How long an allocated port stays reserved for the id it was handed to.
/// A child that hasn't dialed in by then loses the claim to the next asker.
pub const TRYING_TTL: Duration = Duration::from_secs(2);

/// Cadence of the listener probe.
pub const SCAN_PERIOD: Duration = Duration::from_secs(1);

struct PoolInner {
    /// Round-robin cursor into `ports`.
    cursor: usize,
    /// Sticky id-to-port map. An id that asks again is steered back to the
    /// port it was given, so a slow dialer keeps its reservation.
    sticky: HashMap<String, Arc<Port>>,
}

/// The port range a bridge listens on for child tunnels.
pub struct PortPool {
    begin: u16,
    end: u16,
    ports: Vec<Arc<Port>>,
    inner: Mutex<PoolInner>,
    probe: Arc<dyn ListenerProbe>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PortPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortPool")
            .field("begin", &self.begin)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

impl PortPool {
    /// Build a pool over the inclusive range `[begin, end]`.
    pub fn new(begin: u16, end: u16, probe: Arc<dyn ListenerProbe>) -> Result<Self, Error> {
        if begin == 0 {
            return Err(Error::InvalidPortRange {
                begin,
                end,
                reason: "begin port is zero".to_string(),
            });
        }
        if begin > end {
            return Err(Error::InvalidPortRange {
                begin,
                end,
                reason: "begin port greater than end port".to_string(),
            });
        }
        Ok(Self {
            begin,
            end,
            ports: (begin..=end).map(|n| Arc::new(Port::new(n))).collect(),
            inner: Mutex::new(PoolInner {
                cursor: 0,
                sticky: HashMap::new(),
            }),
            probe,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn begin(&self) -> u16 {
        self.begin
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Hand a port to the child with this id.
    ///
    /// A repeat ask from a known id returns the same number with a refreshed
    /// reservation, or [`PortAssignment::Busy`] while that port still carries
    /// the child's live connection. An unknown id gets the next free port in
    /// round-robin order, or [`PortAssignment::Exhausted`] when a full lap
    /// finds none. Reservations lapse after [`TRYING_TTL`], so two ids can
    /// transiently point at one port; whichever dials first wins it and the
    /// other's next ask comes back `Busy`.
    pub fn get_port(&self, id: &str) -> PortAssignment {
        let mut inner = self.inner.lock();

        if let Some(port) = inner.sticky.get(id).cloned() {
            return if port.renew_claim(TRYING_TTL) {
                PortAssignment::Assigned(port.number())
            } else {
                PortAssignment::Busy
            };
        }

        match self.next_port_locked(&mut inner) {
            Some(port) => {
                inner.sticky.insert(id.to_string(), Arc::clone(&port));
                PortAssignment::Assigned(port.number())
            }
            None => PortAssignment::Exhausted,
        }
    }

    /// Claim the next free port in round-robin order, one full lap at most.
    fn next_port_locked(&self, inner: &mut PoolInner) -> Option<Arc<Port>> {
        for _ in 0..self.ports.len() {
            let port = Arc::clone(&self.ports[inner.cursor]);
            inner.cursor = (inner.cursor + 1) % self.ports.len();
            if port.try_claim(TRYING_TTL) {
                return Some(port);
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    /// One probe pass: connect every port that gained a listener, disconnect
    /// every port that lost one.
    pub async fn scan_once(&self, attacher: &Weak<dyn Attacher>) -> Result<(), Error> {
        let listeners = self.probe.listening(self.begin, self.end).await?;
        for port in &self.ports {
            if listeners.contains(&port.number()) {
                port.connect(attacher);
            } else {
                port.disconnect();
            }
        }
        Ok(())
    }

    /// Spawn the scan loop. Probe failures are logged and the loop keeps
    /// going; a bad pass must not strand connected ports with no way to
    /// ever disconnect them.
    pub fn start(self: &Arc<Self>, attacher: Weak<dyn Attacher>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCAN_PERIOD);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = pool.scan_once(&attacher).await {
                            warn!(error = %e, "port scan failed");
                        }
                    }
                }
            }
            debug!(begin = pool.begin, end = pool.end, "port scanner stopped");
        })
    }

    /// Stop the scan loop started by [`PortPool::start`].
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
