//! The bounded pub/sub router.
//!
//! A [`Bus`] owns two independent structures, each behind its own lock so
//! that handler invocation and socket mutation never contend:
//!
//! * the **socket set** – every currently-plugged [`SocketRef`], bounded by
//!   an admission semaphore (`plugin` at capacity parks until an `unplug`);
//! * the **subscription table** – regex pattern → ordered handler list,
//!   matched against each packet's `Msg` discriminator.
//!
//! Dispatch is synchronous on whichever task read the frame: handlers for one
//! pattern run in registration order, the handler list is snapshotted before
//! invocation, and handlers may freely re-enter `subscribe`, `unsubscribe`,
//! `reply`, and `broadcast` on the same bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use warren_types::Error;

use crate::packet::Packet;
use crate::socket::SocketRef;

/// Socket capacity used by [`Bus::default`].
pub const DEFAULT_MAX_SOCKETS: usize = 10;

/// Callback invoked for every packet whose discriminator matches the pattern
/// it was subscribed under.
pub type Handler = Arc<dyn Fn(&Packet) + Send + Sync>;

/// Registration handle returned by [`Bus::subscribe`] and consumed by
/// [`Bus::unsubscribe`]. Identifies exactly one (pattern, handler) entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pattern: String,
    token: u64,
}

struct PatternEntry {
    /// `None` when the pattern failed to compile; the entry stays registered
    /// but never matches.
    regex: Option<Regex>,
    handlers: Vec<(u64, Handler)>,
}

struct PluggedSocket {
    sock: SocketRef,
    /// Held for as long as the socket is plugged; dropping the entry frees
    /// one admission slot.
    _permit: OwnedSemaphorePermit,
}

/// The message router. See the [module docs](self) for the locking story.
pub struct Bus {
    slots: Arc<Semaphore>,
    sockets: Mutex<Vec<PluggedSocket>>,
    subs: Mutex<HashMap<String, PatternEntry>>,
    next_token: AtomicU64,
}

impl Bus {
    /// A bus admitting at most `max_sockets` concurrently-plugged sockets.
    pub fn new(max_sockets: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_sockets)),
            sockets: Mutex::new(Vec::new()),
            subs: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    // -----------------------------------------------------------------------
    // Socket set
    // -----------------------------------------------------------------------

    /// Register a socket as live, making it eligible for `broadcast`
    /// delivery.
    ///
    /// Parks when the bus is at capacity until another socket unplugs; this
    /// is the admission-control backpressure for inbound connections.
    /// Plugging a socket that is already plugged is a no-op (the extra slot
    /// is released immediately).
    pub async fn plugin(&self, sock: SocketRef) {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("admission semaphore never closes");

        let mut sockets = self.sockets.lock();
        if sockets.iter().any(|e| Arc::ptr_eq(&e.sock, &sock)) {
            debug!(socket = sock.name(), "plugin: already plugged");
            return;
        }
        debug!(socket = sock.name(), "plugged in");
        sockets.push(PluggedSocket {
            sock,
            _permit: permit,
        });
    }

    /// Remove a socket and free its admission slot. Idempotent: unplugging a
    /// socket that isn't plugged does nothing and frees nothing.
    pub fn unplug(&self, sock: &SocketRef) {
        let mut sockets = self.sockets.lock();
        let before = sockets.len();
        sockets.retain(|e| !Arc::ptr_eq(&e.sock, sock));
        if sockets.len() < before {
            debug!(socket = sock.name(), "unplugged");
        }
    }

    /// Number of currently-plugged sockets.
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }

    // -----------------------------------------------------------------------
    // Subscription table
    // -----------------------------------------------------------------------

    /// Register `handler` under a regex `pattern` matched against packet
    /// discriminators. Patterns match anywhere in the discriminator (an
    /// unanchored search), and several patterns may match one packet.
    ///
    /// The pattern is compiled here, once. A pattern that fails to compile is
    /// logged and left inert: its handlers never fire, other patterns are
    /// unaffected.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: impl Fn(&Packet) + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subs.lock();
        let entry = subs
            .entry(pattern.to_string())
            .or_insert_with(|| PatternEntry {
                regex: match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(pattern, error = %e, "subscription pattern does not compile; its handlers will never fire");
                        None
                    }
                },
                handlers: Vec::new(),
            });
        entry.handlers.push((token, Arc::new(handler)));
        Subscription {
            pattern: pattern.to_string(),
            token,
        }
    }

    /// Remove exactly the registration named by `sub`. When the pattern's
    /// handler list empties, the pattern entry itself is removed. No-op if
    /// the registration is already gone.
    pub fn unsubscribe(&self, sub: Subscription) {
        let mut subs = self.subs.lock();
        if let Some(entry) = subs.get_mut(&sub.pattern) {
            entry.handlers.retain(|(token, _)| *token != sub.token);
            if entry.handlers.is_empty() {
                subs.remove(&sub.pattern);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Dispatch a packet to every handler whose pattern matches its
    /// discriminator, synchronously, on the calling task.
    ///
    /// Handlers sharing a pattern run in registration order; the order across
    /// different matching patterns is table iteration order, stable within
    /// one call. The handler list is snapshotted before invocation, so
    /// handlers can mutate the subscription table without deadlocking.
    pub fn receive(&self, pkt: &Packet) {
        let discriminator = pkt.discriminator();

        let matched: Vec<Handler> = {
            let subs = self.subs.lock();
            let mut matched = Vec::new();
            for entry in subs.values() {
                let Some(re) = &entry.regex else { continue };
                if re.is_match(&discriminator) {
                    matched.extend(entry.handlers.iter().map(|(_, h)| Arc::clone(h)));
                }
            }
            matched
        };

        for handler in matched {
            handler(pkt);
        }
    }

    /// Send the packet to every plugged socket except its source.
    ///
    /// With no sockets plugged, or with the source as the only socket, there
    /// is nothing useful to deliver and this is a no-op. Per-socket send
    /// failures are logged and skipped; delivery order is unspecified.
    pub fn broadcast(&self, pkt: &Packet) {
        let src = pkt.source();

        let targets: Vec<SocketRef> = {
            let sockets = self.sockets.lock();
            sockets
                .iter()
                .filter(|e| match &src {
                    Some(s) => !Arc::ptr_eq(&e.sock, s),
                    None => true,
                })
                .map(|e| Arc::clone(&e.sock))
                .collect()
        };

        for sock in targets {
            if let Err(e) = sock.send(pkt) {
                warn!(socket = sock.name(), error = %e, "broadcast send failed");
            }
        }
    }

    /// Unicast the packet back to its source socket.
    pub fn reply(&self, pkt: &Packet) -> Result<(), Error> {
        let src = pkt.source().ok_or(Error::NoSource)?;
        src.send(pkt)
    }

    /// Close every plugged socket without unplugging any of them. Shutdown
    /// path: each closed transport fails its read loop, and the read loop
    /// unplugs.
    pub fn close(&self) {
        let targets: Vec<SocketRef> = self
            .sockets
            .lock()
            .iter()
            .map(|e| Arc::clone(&e.sock))
            .collect();
        for sock in targets {
            sock.close();
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SOCKETS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Socket;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;
    use warren_types::Msg;

    struct FakeSocket {
        name: String,
        sent: Mutex<Vec<String>>,
        closed: AtomicBool,
        flags: AtomicU32,
    }

    impl FakeSocket {
        fn plugged(name: &str) -> (Arc<FakeSocket>, SocketRef) {
            let sock = Arc::new(FakeSocket {
                name: name.to_string(),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                flags: AtomicU32::new(0),
            });
            let as_ref: SocketRef = sock.clone();
            (sock, as_ref)
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl Socket for FakeSocket {
        fn send(&self, pkt: &Packet) -> Result<(), Error> {
            self.sent.lock().push(pkt.payload().to_string());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn flags(&self) -> u32 {
            self.flags.load(Ordering::SeqCst)
        }

        fn set_flags(&self, flags: u32) {
            self.flags.store(flags, Ordering::SeqCst);
        }
    }

    fn msg_packet(bus: &Arc<Bus>, src: Option<&SocketRef>, msg: &str) -> Packet {
        Packet::with_value(bus, src, &Msg::new(msg)).unwrap()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    #[test]
    fn receive_dispatches_on_regex_match() {
        let bus = Arc::new(Bus::default());
        let hits = Arc::new(Mutex::new(Vec::new()));

        for (label, pattern) in [
            ("exact", "GetIdentity"),
            ("prefix", "Get.*"),
            ("reply_only", "^Reply"),
        ] {
            let hits = Arc::clone(&hits);
            bus.subscribe(pattern, move |_| hits.lock().push(label));
        }

        bus.receive(&msg_packet(&bus, None, "GetIdentity"));

        let mut seen = hits.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["exact", "prefix"]);
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let bus = Arc::new(Bus::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 1..=3 {
            let order = Arc::clone(&order);
            bus.subscribe("CmdStart", move |_| order.lock().push(n));
        }

        bus.receive(&msg_packet(&bus, None, "CmdStart"));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_registration() {
        let bus = Arc::new(Bus::default());
        let hits = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let hits = Arc::clone(&hits);
            bus.subscribe("CmdStart", move |_| hits.lock().push("first"))
        };
        let second = {
            let hits = Arc::clone(&hits);
            bus.subscribe("CmdStart", move |_| hits.lock().push("second"))
        };

        bus.unsubscribe(first);
        bus.receive(&msg_packet(&bus, None, "CmdStart"));
        assert_eq!(*hits.lock(), vec!["second"]);

        // Removing the last handler removes the pattern entirely.
        bus.unsubscribe(second);
        bus.receive(&msg_packet(&bus, None, "CmdStart"));
        assert_eq!(*hits.lock(), vec!["second"]);
    }

    #[test]
    fn malformed_pattern_is_inert_and_isolated() {
        let bus = Arc::new(Bus::default());
        let hits = Arc::new(Mutex::new(Vec::new()));

        {
            let hits = Arc::clone(&hits);
            bus.subscribe("([unclosed", move |_| hits.lock().push("bad"));
        }
        {
            let hits = Arc::clone(&hits);
            bus.subscribe("CmdStart", move |_| hits.lock().push("good"));
        }

        bus.receive(&msg_packet(&bus, None, "CmdStart"));
        assert_eq!(*hits.lock(), vec!["good"]);
    }

    #[test]
    fn unparsable_payload_matches_empty_discriminator() {
        let bus = Arc::new(Bus::default());
        let hits = Arc::new(Mutex::new(Vec::new()));

        {
            let hits = Arc::clone(&hits);
            bus.subscribe("^$", move |_| hits.lock().push("empty"));
        }
        {
            let hits = Arc::clone(&hits);
            bus.subscribe("CmdStart", move |_| hits.lock().push("cmd"));
        }

        let (_, src) = FakeSocket::plugged("peer");
        bus.receive(&Packet::from_frame(&bus, &src, "garbage".to_string()));
        assert_eq!(*hits.lock(), vec!["empty"]);
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = Arc::new(Bus::default());
        let hits = Arc::new(Mutex::new(Vec::new()));

        {
            let bus_inner = Arc::clone(&bus);
            let hits = Arc::clone(&hits);
            bus.subscribe("CmdStart", move |pkt| {
                hits.lock().push("outer");
                let hits = Arc::clone(&hits);
                bus_inner.subscribe("Late", move |_| hits.lock().push("late"));
                // Re-entrant fan-out must not deadlock either.
                pkt.broadcast(&Msg::new("FanOut")).unwrap();
            });
        }

        bus.receive(&msg_packet(&bus, None, "CmdStart"));
        bus.receive(&msg_packet(&bus, None, "Late"));
        assert_eq!(*hits.lock(), vec!["outer", "late"]);
    }

    // -----------------------------------------------------------------------
    // Admission control
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn plugin_parks_at_capacity_until_unplug() {
        let bus = Arc::new(Bus::new(1));
        let (_first, first_ref) = FakeSocket::plugged("first");
        let (_second, second_ref) = FakeSocket::plugged("second");

        bus.plugin(first_ref.clone()).await;
        assert_eq!(bus.socket_count(), 1);

        let waiter = {
            let bus = Arc::clone(&bus);
            let second_ref = second_ref.clone();
            tokio::spawn(async move { bus.plugin(second_ref).await })
        };

        // The second plugin must still be parked.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "plugin must park at capacity");
        assert_eq!(bus.socket_count(), 1);

        bus.unplug(&first_ref);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("parked plugin must complete after unplug")
            .unwrap();
        assert_eq!(bus.socket_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_plugin_is_a_noop_and_frees_its_slot() {
        let bus = Arc::new(Bus::new(2));
        let (_sock, sock_ref) = FakeSocket::plugged("dup");

        bus.plugin(sock_ref.clone()).await;
        bus.plugin(sock_ref.clone()).await;
        assert_eq!(bus.socket_count(), 1);

        // Both slots must still be usable: a third plugin fits immediately.
        let (_other, other_ref) = FakeSocket::plugged("other");
        tokio::time::timeout(Duration::from_millis(100), bus.plugin(other_ref))
            .await
            .expect("slot freed by duplicate plugin must be available");
        assert_eq!(bus.socket_count(), 2);
    }

    #[tokio::test]
    async fn unplug_is_idempotent_and_never_overfrees() {
        let bus = Arc::new(Bus::new(1));
        let (_a, a_ref) = FakeSocket::plugged("a");
        let (_b, b_ref) = FakeSocket::plugged("b");

        bus.plugin(a_ref.clone()).await;
        bus.unplug(&a_ref);
        bus.unplug(&a_ref);

        // Exactly one slot exists; it must be free exactly once.
        tokio::time::timeout(Duration::from_millis(100), bus.plugin(b_ref.clone()))
            .await
            .expect("slot must be free after unplug");
        assert_eq!(bus.socket_count(), 1);
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn broadcast_skips_the_source() {
        let bus = Arc::new(Bus::default());
        let (src, src_ref) = FakeSocket::plugged("src");
        let (peer_a, peer_a_ref) = FakeSocket::plugged("peer_a");
        let (peer_b, peer_b_ref) = FakeSocket::plugged("peer_b");

        bus.plugin(src_ref.clone()).await;
        bus.plugin(peer_a_ref).await;
        bus.plugin(peer_b_ref).await;

        bus.broadcast(&msg_packet(&bus, Some(&src_ref), "SpinUpdate"));

        assert_eq!(src.sent_count(), 0);
        assert_eq!(peer_a.sent_count(), 1);
        assert_eq!(peer_b.sent_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_degenerate_cases_deliver_nothing() {
        let bus = Arc::new(Bus::default());

        // Zero sockets plugged.
        bus.broadcast(&msg_packet(&bus, None, "SpinUpdate"));

        // Exactly one socket plugged and it is the source.
        let (only, only_ref) = FakeSocket::plugged("only");
        bus.plugin(only_ref.clone()).await;
        bus.broadcast(&msg_packet(&bus, Some(&only_ref), "SpinUpdate"));
        assert_eq!(only.sent_count(), 0);
    }

    #[tokio::test]
    async fn reply_unicasts_to_the_source_only() {
        let bus = Arc::new(Bus::default());
        let (src, src_ref) = FakeSocket::plugged("src");
        let (peer, peer_ref) = FakeSocket::plugged("peer");

        bus.plugin(src_ref.clone()).await;
        bus.plugin(peer_ref).await;

        let pkt = msg_packet(&bus, Some(&src_ref), "GetIdentity");
        pkt.reply(&Msg::new("ReplyIdentity")).unwrap();

        assert_eq!(src.sent_count(), 1);
        assert_eq!(peer.sent_count(), 0);
        assert!(src.sent.lock()[0].contains("ReplyIdentity"));
    }

    #[test]
    fn reply_without_a_live_source_errors() {
        let bus = Arc::new(Bus::default());
        let pkt = msg_packet(&bus, None, "GetIdentity");
        assert!(matches!(bus.reply(&pkt), Err(Error::NoSource)));
    }

    #[tokio::test]
    async fn close_closes_all_sockets_without_unplugging() {
        let bus = Arc::new(Bus::default());
        let (a, a_ref) = FakeSocket::plugged("a");
        let (b, b_ref) = FakeSocket::plugged("b");

        bus.plugin(a_ref).await;
        bus.plugin(b_ref).await;

        bus.close();

        assert!(a.closed.load(Ordering::SeqCst));
        assert!(b.closed.load(Ordering::SeqCst));
        assert_eq!(bus.socket_count(), 2, "close must not unplug");
    }
}
