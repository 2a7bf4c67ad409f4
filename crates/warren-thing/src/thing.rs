//! The Thing runtime: identity, bus, and role wiring.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use warren_bridge::Bridge;
use warren_bus::{Bus, Subscription};
use warren_ports::{PortPool, SsProbe};
use warren_types::{Error, GET_IDENTITY, MsgIdentity, REPLY_IDENTITY, STATUS_ONLINE};

use crate::config::Config;
use crate::endpoint::PrivateEndpoint;
use crate::uplink::TunnelUplink;

/// One device process on the tree.
///
/// A Thing always owns a bus and answers `GetIdentity` on it. The optional
/// roles come from the config: a `[mother]` table starts the tunnel uplink
/// (this Thing is someone's child), a `[bridge]` table builds a port pool and
/// a [`Bridge`] (this Thing collects children of its own). The private
/// endpoint is where both meet: parents dial children's `/ws` through the
/// tunnel, and children fetch tunnel ports from their parent's `/port/{id}`.
pub struct Thing {
    identity: MsgIdentity,
    config: Config,
    bus: Arc<Bus>,
    bridge: Option<Arc<Bridge>>,
    identity_sub: Mutex<Option<Subscription>>,
}

impl Thing {
    /// Build a Thing from its config. Fails on an invalid bridge port range.
    pub fn new(config: Config) -> Result<Arc<Self>, Error> {
        let id = if config.thing.id.is_empty() {
            format!("{}-{}", config.thing.model, Uuid::new_v4())
        } else {
            config.thing.id.clone()
        };
        let identity = MsgIdentity {
            msg: REPLY_IDENTITY.to_string(),
            status: STATUS_ONLINE.to_string(),
            id,
            model: config.thing.model.clone(),
            name: config.thing.name.clone(),
            startup_time: Utc::now(),
        };

        let bus = Arc::new(Bus::new(config.thing.max_sockets));
        let identity_sub = {
            let identity = identity.clone();
            bus.subscribe(GET_IDENTITY, move |pkt| {
                if let Err(e) = pkt.reply(&identity) {
                    warn!(error = %e, "identity reply failed");
                }
            })
        };

        let bridge = match &config.bridge {
            Some(cfg) => {
                let pool = Arc::new(PortPool::new(
                    cfg.port_begin,
                    cfg.port_end,
                    Arc::new(SsProbe),
                )?);
                Some(Bridge::new(Arc::clone(&bus), pool))
            }
            None => None,
        };

        info!(
            id = %identity.id,
            model = %identity.model,
            name = %identity.name,
            bridge = bridge.is_some(),
            child = config.mother.is_some(),
            "thing built"
        );

        Ok(Arc::new(Self {
            identity,
            config,
            bus,
            bridge,
            identity_sub: Mutex::new(Some(identity_sub)),
        }))
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &MsgIdentity {
        &self.identity
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn bridge(&self) -> Option<&Arc<Bridge>> {
        self.bridge.as_ref()
    }

    /// Run until `shutdown` fires: private endpoint, tunnel uplink, and
    /// bridge scanner as configured, then tear down in reverse order and
    /// close the bus last.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), Error> {
        let endpoint_shutdown = CancellationToken::new();
        let endpoint_handle = if self.config.thing.port_private != 0 {
            let endpoint = PrivateEndpoint::bind(
                Arc::clone(&self.bus),
                self.bridge.clone(),
                self.config.thing.port_private,
            )
            .await?;
            Some(endpoint.start(endpoint_shutdown.clone()))
        } else {
            info!(id = %self.identity.id, "private endpoint disabled");
            None
        };

        let uplink_shutdown = CancellationToken::new();
        let uplink_handle = match &self.config.mother {
            Some(mother) if self.config.thing.port_private != 0 => {
                let uplink =
                    TunnelUplink::new(&self.identity.id, mother, self.config.thing.port_private);
                Some(uplink.start(uplink_shutdown.clone()))
            }
            Some(_) => {
                warn!(id = %self.identity.id, "mother configured but private endpoint disabled; uplink not started");
                None
            }
            None => None,
        };

        let scanner_handle = self.bridge.as_ref().map(|bridge| bridge.start());

        shutdown.cancelled().await;
        info!(id = %self.identity.id, "shutting down");

        if let Some(bridge) = &self.bridge {
            bridge.stop();
        }
        if let Some(handle) = scanner_handle {
            let _ = handle.await;
        }

        uplink_shutdown.cancel();
        if let Some(handle) = uplink_handle {
            let _ = handle.await;
        }

        endpoint_shutdown.cancel();
        if let Some(handle) = endpoint_handle {
            let _ = handle.await;
        }

        if let Some(sub) = self.identity_sub.lock().take() {
            self.bus.unsubscribe(sub);
        }
        self.bus.close();
        Ok(())
    }
}
