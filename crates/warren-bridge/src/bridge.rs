//! Child registry and the tunnel-to-bus pump.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use warren_bus::{Bus, Packet, SocketRef, Subscription};
use warren_ports::{Attacher, PortPool, TunnelConn};
use warren_types::{
    CMD_START, Error, GET_CHILDREN, Msg, MsgChildren, MsgIdentity, PortAssignment, REPLY_CHILDREN,
    STATUS_OFFLINE, STATUS_ONLINE,
};

use crate::socket::TunnelSocket;

/// One identified child. Entries survive disconnects; `status` records the
/// last-known state rather than the entry being dropped.
#[derive(Debug, Clone)]
pub struct Child {
    pub identity: MsgIdentity,
    pub status: String,
}

/// Composes a [`PortPool`] with a child registry over a [`Bus`].
///
/// Every port that completes the identify handshake lands in the bridge's
/// attach: the child is recorded, the tunnel's write half is plugged into the
/// bus as a socket, a `CmdStart` control packet is injected so local
/// subscribers see the arrival, and then inbound frames are pumped into
/// [`Bus::receive`] until the connection drops. That pump is the single entry
/// point for tunnel-sourced traffic.
pub struct Bridge {
    bus: Arc<Bus>,
    pool: Arc<PortPool>,
    children: Mutex<HashMap<String, Child>>,
    roster_sub: Mutex<Option<Subscription>>,
}

impl Bridge {
    /// Wire a bridge over `bus` and `pool` and register its `GetChildren`
    /// roster responder.
    pub fn new(bus: Arc<Bus>, pool: Arc<PortPool>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Bridge>| {
            let roster_sub = {
                let weak = weak.clone();
                bus.subscribe(GET_CHILDREN, move |pkt| {
                    if let Some(bridge) = weak.upgrade() {
                        bridge.reply_children(pkt);
                    }
                })
            };
            Self {
                bus: Arc::clone(&bus),
                pool,
                children: Mutex::new(HashMap::new()),
                roster_sub: Mutex::new(Some(roster_sub)),
            }
        })
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Start the port scan loop feeding this bridge. The returned handle
    /// joins after [`Bridge::stop`].
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let attacher: Weak<dyn Attacher> =
            Arc::downgrade(&(Arc::clone(self) as Arc<dyn Attacher>));
        self.pool.start(attacher)
    }

    /// Stop the scan loop, retire the roster responder, and close every
    /// plugged socket. Each closed transport fails its pump, and each pump
    /// unplugs itself on the way out.
    pub fn stop(&self) {
        self.pool.stop();
        if let Some(sub) = self.roster_sub.lock().take() {
            self.bus.unsubscribe(sub);
        }
        self.bus.close();
    }

    /// Allocate (or re-confirm) a tunnel port for child `id`.
    pub fn assign_port(&self, id: &str) -> PortAssignment {
        self.pool.get_port(id)
    }

    /// Snapshot of the roster: child id to last-known status.
    pub fn children(&self) -> HashMap<String, String> {
        self.children
            .lock()
            .iter()
            .map(|(id, child)| (id.clone(), child.status.clone()))
            .collect()
    }

    /// Full record for one child, if it ever attached.
    pub fn child(&self, id: &str) -> Option<Child> {
        self.children.lock().get(id).cloned()
    }

    fn reply_children(&self, pkt: &Packet) {
        let roster = MsgChildren {
            msg: REPLY_CHILDREN.to_string(),
            children: self.children(),
        };
        if let Err(e) = pkt.reply(&roster) {
            warn!(error = %e, "child roster reply failed");
        }
    }
}

#[async_trait]
impl Attacher for Bridge {
    /// Consume one identified tunnel connection until it drops.
    async fn attach(&self, conn: TunnelConn, identity: MsgIdentity) -> Result<(), Error> {
        let TunnelConn {
            port,
            stream,
            closed: session,
        } = conn;
        let id = identity.id.clone();
        info!(id = %id, model = %identity.model, name = %identity.name, port, "child attached");

        self.children.lock().insert(
            id.clone(),
            Child {
                identity,
                status: STATUS_ONLINE.to_string(),
            },
        );

        let (sink, mut frames) = stream.split();
        let sock: SocketRef = TunnelSocket::start(format!("port:{port}"), sink, session.clone());
        self.bus.plugin(Arc::clone(&sock)).await;

        // Announce the arrival before any child traffic flows.
        match Packet::with_value(&self.bus, Some(&sock), &Msg::new(CMD_START)) {
            Ok(pkt) => self.bus.receive(&pkt),
            Err(e) => warn!(error = %e, "start-of-stream packet failed"),
        }

        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let pkt = Packet::from_frame(&self.bus, &sock, text.as_str().to_string());
                        self.bus.receive(&pkt);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(id = %id, error = %e, "tunnel read failed");
                        break;
                    }
                },
            }
        }

        session.cancel();
        self.bus.unplug(&sock);
        if let Some(child) = self.children.lock().get_mut(&id) {
            child.status = STATUS_OFFLINE.to_string();
        }
        info!(id = %id, port, "child detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::SinkExt;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use warren_ports::ListenerProbe;
    use warren_types::{GET_IDENTITY, REPLY_IDENTITY};

    #[derive(Default)]
    struct TableProbe(Mutex<HashSet<u16>>);

    impl TableProbe {
        fn set(&self, ports: &[u16]) {
            *self.0.lock() = ports.iter().copied().collect();
        }
    }

    #[async_trait]
    impl ListenerProbe for TableProbe {
        async fn listening(&self, _begin: u16, _end: u16) -> Result<HashSet<u16>, Error> {
            Ok(self.0.lock().clone())
        }
    }

    struct FakeSocket {
        sent: Mutex<Vec<String>>,
    }

    impl warren_bus::Socket for FakeSocket {
        fn send(&self, pkt: &Packet) -> Result<(), Error> {
            self.sent.lock().push(pkt.payload().to_string());
            Ok(())
        }
        fn close(&self) {}
        fn name(&self) -> &str {
            "fake"
        }
        fn flags(&self) -> u32 {
            0
        }
        fn set_flags(&self, _flags: u32) {}
    }

    fn test_identity(id: &str) -> MsgIdentity {
        MsgIdentity {
            msg: REPLY_IDENTITY.to_string(),
            status: STATUS_ONLINE.to_string(),
            id: id.to_string(),
            model: "hub".to_string(),
            name: "basement".to_string(),
            startup_time: chrono::Utc::now(),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Serve the identity handshake for every connection, then hold each
    /// socket open.
    async fn spawn_identity_endpoint(id: &str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let id = id.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(frame)) = ws.next().await {
                        let Message::Text(text) = frame else { continue };
                        if text.as_str().contains(GET_IDENTITY) {
                            let reply = serde_json::json!({
                                "Msg": REPLY_IDENTITY,
                                "Status": "online",
                                "Id": id,
                                "Model": "hub",
                                "Name": "basement",
                                "StartupTime": chrono::Utc::now(),
                            });
                            ws.send(Message::text(reply.to_string())).await.unwrap();
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn roster_replies_to_get_children() {
        let bus = Arc::new(Bus::default());
        let pool = Arc::new(PortPool::new(9001, 9003, Arc::new(TableProbe::default())).unwrap());
        let bridge = Bridge::new(Arc::clone(&bus), pool);

        bridge.children.lock().insert(
            "a1".to_string(),
            Child {
                identity: test_identity("a1"),
                status: STATUS_ONLINE.to_string(),
            },
        );

        let fake = Arc::new(FakeSocket {
            sent: Mutex::new(Vec::new()),
        });
        let asker: SocketRef = fake.clone();
        let pkt = Packet::with_value(&bus, Some(&asker), &Msg::new(GET_CHILDREN)).unwrap();
        bus.receive(&pkt);

        let sent = fake.sent.lock();
        assert_eq!(sent.len(), 1, "roster must reply exactly once");
        let roster: MsgChildren = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(roster.msg, REPLY_CHILDREN);
        assert_eq!(roster.children["a1"], STATUS_ONLINE);
    }

    #[tokio::test]
    async fn stop_retires_the_roster_responder() {
        let bus = Arc::new(Bus::default());
        let pool = Arc::new(PortPool::new(9001, 9003, Arc::new(TableProbe::default())).unwrap());
        let bridge = Bridge::new(Arc::clone(&bus), pool);
        bridge.stop();

        let fake = Arc::new(FakeSocket {
            sent: Mutex::new(Vec::new()),
        });
        let asker: SocketRef = fake.clone();
        let pkt = Packet::with_value(&bus, Some(&asker), &Msg::new(GET_CHILDREN)).unwrap();
        bus.receive(&pkt);
        assert!(fake.sent.lock().is_empty(), "stopped bridge must not reply");
    }

    #[tokio::test]
    async fn attach_pumps_frames_and_marks_offline_on_close() {
        // Child endpoint: pushes one update, records what the bridge sends,
        // closes when told "Bye".
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::text(r#"{"Msg":"SpamUpdate","Level":7}"#))
                .await
                .unwrap();
            let mut got = Vec::new();
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(text) = frame {
                    if text.as_str().contains("Bye") {
                        break;
                    }
                    got.push(text.as_str().to_string());
                }
            }
            let _ = ws.close(None).await;
            got
        });

        let bus = Arc::new(Bus::default());
        let pool = Arc::new(PortPool::new(port, port, Arc::new(TableProbe::default())).unwrap());
        let bridge = Bridge::new(Arc::clone(&bus), pool);

        let starts = Arc::new(Mutex::new(Vec::new()));
        {
            let starts = Arc::clone(&starts);
            bus.subscribe(CMD_START, move |pkt| starts.lock().push(pkt.from_tunnel()));
        }
        let updates = Arc::new(Mutex::new(Vec::new()));
        {
            let updates = Arc::clone(&updates);
            bus.subscribe("SpamUpdate", move |pkt| {
                updates.lock().push(pkt.payload().to_string())
            });
        }

        let stream = warren_ports::handshake::dial(port).await.unwrap();
        let conn = TunnelConn {
            port,
            stream,
            closed: CancellationToken::new(),
        };
        let session = conn.closed.clone();
        let pump = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.attach(conn, test_identity("kid1")).await })
        };

        // Child online, arrival announced from the tunnel, pushed frame
        // dispatched locally.
        wait_until(|| bridge.children().get("kid1").map(String::as_str) == Some(STATUS_ONLINE))
            .await;
        wait_until(|| *starts.lock() == vec![true]).await;
        wait_until(|| updates.lock().len() == 1).await;
        assert!(updates.lock()[0].contains("\"Level\":7"));
        assert_eq!(bus.socket_count(), 1);

        // Outbound broadcasts reach the child over the tunnel socket.
        let poll = Packet::with_value(&bus, None, &Msg::new("CmdPoll")).unwrap();
        bus.broadcast(&poll);
        let bye = Packet::with_value(&bus, None, &Msg::new("Bye")).unwrap();
        bus.broadcast(&bye);

        let got = server.await.unwrap();
        assert_eq!(got, vec![r#"{"Msg":"CmdPoll"}"#.to_string()]);

        pump.await.unwrap().unwrap();
        assert_eq!(bus.socket_count(), 0, "pump must unplug on connection loss");
        assert_eq!(
            bridge.children().get("kid1").map(String::as_str),
            Some(STATUS_OFFLINE),
            "child entry survives with offline status"
        );
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn scan_attaches_children_and_marks_them_on_listener_loss() {
        let port = spawn_identity_endpoint("hub01").await;
        let probe = Arc::new(TableProbe::default());
        probe.set(&[port]);
        let pool = Arc::new(PortPool::new(port, port, probe.clone()).unwrap());
        let bus = Arc::new(Bus::default());
        let bridge = Bridge::new(bus, pool);

        let scanner = bridge.start();
        wait_until(|| bridge.children().get("hub01").map(String::as_str) == Some(STATUS_ONLINE))
            .await;

        probe.set(&[]);
        wait_until(|| bridge.children().get("hub01").map(String::as_str) == Some(STATUS_OFFLINE))
            .await;

        bridge.stop();
        tokio::time::timeout(Duration::from_secs(2), scanner)
            .await
            .expect("scanner did not stop")
            .unwrap();
    }
}
