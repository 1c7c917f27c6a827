//! Wire envelope carried over both the broadcast and transmit paths.
//!
//! # Wire format
//!
//! ```text
//! { "origin":    {"ns": "www", "nid": 1, "tid": null},
//!   "recipient": {"ns": "www", "nid": 0, "tid": "*", "r": "www.hello"},
//!   "payload":   {"message": "hi"} }
//! ```
//!
//! `recipient.r` only appears on transmit envelopes. It carries the full route
//! key because a queue key names a node, not a route.

use serde::{Deserialize, Serialize};

use crate::address::{route_key, Address, Destination, NodeSelector, TargetId, WILDCARD};
use crate::error::{CipherError, Result};

/// Application payload: an ordered, untyped string-keyed map.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Which delivery path an envelope is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Broadcast,
    Transmit,
}

/// Resolved recipient of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub ns: String,
    pub nid: NodeSelector,
    #[serde(default)]
    pub tid: Option<TargetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<String>,
}

impl Recipient {
    /// Removes the route key, leaving the normalized recipient address.
    pub fn take_route(&mut self) -> Option<String> {
        self.r.take()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: Address,
    pub recipient: Recipient,
    pub payload: Payload,
}

impl Envelope {
    /// Builds an envelope from `origin`, filling recipient defaults.
    ///
    /// For [`Delivery::Transmit`] the recipient carries `r = "<ns>.<route>"`,
    /// with `*` standing in for a missing route.
    pub fn build(
        origin: Address,
        route: &str,
        payload: Payload,
        destination: Destination,
        delivery: Delivery,
    ) -> Self {
        let ns = destination.ns.unwrap_or_else(|| origin.ns.clone());
        let r = match delivery {
            Delivery::Broadcast => None,
            Delivery::Transmit => {
                let route = if route.is_empty() { WILDCARD } else { route };
                Some(route_key(&ns, route))
            }
        };
        let recipient = Recipient {
            ns,
            nid: destination.nid.unwrap_or(NodeSelector::Any),
            tid: Some(destination.tid.unwrap_or_else(TargetId::wildcard)),
            r,
        };
        Self {
            origin,
            recipient,
            payload,
        }
    }
}

pub fn serialize(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope).map_err(CipherError::from)
}

/// Decodes a raw message. Anything that is not a complete envelope is a
/// [`CipherError::Decode`].
pub fn deserialize(raw: &str) -> Result<Envelope> {
    serde_json::from_str(raw).map_err(CipherError::from)
}
