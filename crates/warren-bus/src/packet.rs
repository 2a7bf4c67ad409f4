//! The message envelope routed by the bus.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;

use warren_types::{Error, Msg};

use crate::bus::Bus;
use crate::socket::{Socket, SocketRef, flags};

/// One routed message: a serialized JSON payload plus weak back-references to
/// the socket it arrived on and the bus that routes it.
///
/// The weak references mean a packet never extends the lifetime of its bus or
/// its source; a packet held past its socket's death simply loses the ability
/// to `reply`. Cloning is shallow and explicit – the payload string is copied,
/// the references stay weak.
#[derive(Clone)]
pub struct Packet {
    bus: Weak<Bus>,
    src: Option<Weak<dyn Socket>>,
    payload: String,
}

impl Packet {
    /// An empty packet. `src` is `None` for internally-generated traffic.
    pub fn new(bus: &Arc<Bus>, src: Option<&SocketRef>) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            src: src.map(Arc::downgrade),
            payload: String::new(),
        }
    }

    /// A packet carrying `value` already serialized into the payload.
    pub fn with_value<T: Serialize>(
        bus: &Arc<Bus>,
        src: Option<&SocketRef>,
        value: &T,
    ) -> Result<Self, Error> {
        let mut pkt = Self::new(bus, src);
        pkt.set(value)?;
        Ok(pkt)
    }

    /// A packet wrapping a raw inbound frame from `src`.
    pub fn from_frame(bus: &Arc<Bus>, src: &SocketRef, payload: String) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            src: Some(Arc::downgrade(src)),
            payload,
        }
    }

    /// Replace the payload with `value` serialized as JSON.
    pub fn set<T: Serialize>(&mut self, value: &T) -> Result<&mut Self, Error> {
        self.payload =
            serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(self)
    }

    /// Deserialize the payload into `T`. Unknown fields are ignored.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_str(&self.payload).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// The `Msg` discriminator string, or `""` when the payload has none or
    /// doesn't parse. Unroutable packets therefore match only patterns that
    /// match the empty string.
    pub fn discriminator(&self) -> String {
        self.parse::<Msg>().map(|m| m.msg).unwrap_or_default()
    }

    /// Raw payload text.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The source socket, if it is still alive.
    pub fn source(&self) -> Option<SocketRef> {
        self.src.as_ref().and_then(Weak::upgrade)
    }

    /// True when this packet entered over a bridge tunnel socket.
    pub fn from_tunnel(&self) -> bool {
        self.source()
            .map(|s| s.flags() & flags::TUNNEL != 0)
            .unwrap_or(false)
    }

    /// Serialize `value` and unicast it back to this packet's source socket.
    ///
    /// The request/response half of the bus: identity and roster handlers
    /// answer with `reply`. Fails when the bus or the source is gone.
    pub fn reply<T: Serialize>(&self, value: &T) -> Result<(), Error> {
        let bus = self.bus.upgrade().ok_or(Error::BusGone)?;
        let mut pkt = self.clone();
        pkt.set(value)?;
        bus.reply(&pkt)
    }

    /// Serialize `value` and fan it out to every plugged socket except this
    /// packet's source.
    pub fn broadcast<T: Serialize>(&self, value: &T) -> Result<(), Error> {
        let bus = self.bus.upgrade().ok_or(Error::BusGone)?;
        let mut pkt = self.clone();
        pkt.set(value)?;
        bus.broadcast(&pkt);
        Ok(())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("payload", &self.payload)
            .field("has_source", &self.src.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_types::Msg;

    #[test]
    fn discriminator_of_well_formed_payload() {
        let bus = Arc::new(Bus::default());
        let pkt = Packet::with_value(&bus, None, &Msg::new("GetIdentity")).unwrap();
        assert_eq!(pkt.discriminator(), "GetIdentity");
    }

    #[test]
    fn discriminator_of_garbage_is_empty() {
        let bus = Arc::new(Bus::default());
        let mut pkt = Packet::new(&bus, None);
        pkt.payload = "not json at all".to_string();
        assert_eq!(pkt.discriminator(), "");

        pkt.payload = r#"{"NoDiscriminator":true}"#.to_string();
        assert_eq!(pkt.discriminator(), "");
    }

    #[test]
    fn packet_does_not_keep_bus_alive() {
        let bus = Arc::new(Bus::default());
        let pkt = Packet::new(&bus, None);
        drop(bus);
        assert!(pkt.reply(&Msg::new("ReplyIdentity")).is_err());
    }
}
