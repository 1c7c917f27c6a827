//! Node addressing: namespaces, node ids, target ids and the keys derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Marker used on the wire for "any node" / "any target".
pub const WILDCARD: &str = "*";

/// Sub-address naming a logical target within a node.
///
/// Accepts either a string or an integer when decoded, always encodes as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawId", into = "String")]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn wildcard() -> Self {
        Self(WILDCARD.to_string())
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for TargetId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<TargetId> for String {
    fn from(id: TargetId) -> Self {
        id.0
    }
}

/// Integer-or-string form used by both id types on decode.
#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum RawId {
    Int(u64),
    Text(String),
}

impl TryFrom<RawId> for TargetId {
    type Error = String;

    fn try_from(raw: RawId) -> Result<Self, Self::Error> {
        Ok(match raw {
            RawId::Int(n) => TargetId::from(n),
            RawId::Text(s) => TargetId(s),
        })
    }
}

/// Selects a node within a namespace: a concrete node id or any node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "RawId", into = "RawId")]
pub enum NodeSelector {
    #[default]
    Any,
    Node(u64),
}

impl From<u64> for NodeSelector {
    fn from(nid: u64) -> Self {
        NodeSelector::Node(nid)
    }
}

impl TryFrom<RawId> for NodeSelector {
    type Error = String;

    fn try_from(raw: RawId) -> Result<Self, Self::Error> {
        match raw {
            RawId::Int(n) => Ok(NodeSelector::Node(n)),
            RawId::Text(s) if s == WILDCARD => Ok(NodeSelector::Any),
            RawId::Text(s) => s
                .parse::<u64>()
                .map(NodeSelector::Node)
                .map_err(|_| format!("invalid node id '{}'", s)),
        }
    }
}

impl From<NodeSelector> for RawId {
    fn from(sel: NodeSelector) -> Self {
        match sel {
            NodeSelector::Any => RawId::Text(WILDCARD.to_string()),
            NodeSelector::Node(n) => RawId::Int(n),
        }
    }
}

impl fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSelector::Any => f.write_str(WILDCARD),
            NodeSelector::Node(n) => write!(f, "{}", n),
        }
    }
}

/// A concrete instance address. Always used for the `origin` of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub ns: String,
    pub nid: u64,
    pub tid: Option<TargetId>,
}

impl Address {
    pub fn new(ns: impl Into<String>, nid: u64, tid: Option<TargetId>) -> Self {
        Self {
            ns: ns.into(),
            nid,
            tid,
        }
    }

    /// The queue this address consumes point-to-point messages from.
    pub fn queue_key(&self) -> String {
        queue_key(&self.ns, NodeSelector::Node(self.nid))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.ns, self.nid)?;
        if let Some(tid) = &self.tid {
            write!(f, "/{}", tid)?;
        }
        Ok(())
    }
}

/// Caller-side description of where a message should go.
///
/// Unset fields are filled in when the envelope is built: the namespace
/// defaults to the sender's, the node to [`NodeSelector::Any`] and the target
/// to the wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destination {
    pub ns: Option<String>,
    pub nid: Option<NodeSelector>,
    pub tid: Option<TargetId>,
}

impl Destination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn node(mut self, nid: u64) -> Self {
        self.nid = Some(NodeSelector::Node(nid));
        self
    }

    /// Any node in the namespace: the namespace-wide queue.
    pub fn any_node(mut self) -> Self {
        self.nid = Some(NodeSelector::Any);
        self
    }

    pub fn target(mut self, tid: impl Into<TargetId>) -> Self {
        self.tid = Some(tid.into());
        self
    }
}

/// Fully-qualified route key: `"<namespace>.<route>"`.
pub fn route_key(namespace: &str, route: &str) -> String {
    format!("{}.{}", namespace, route)
}

/// Queue key for point-to-point delivery: `"<namespace>.<nid>"`.
pub fn queue_key(namespace: &str, nid: NodeSelector) -> String {
    format!("{}.{}", namespace, nid)
}

/// Pattern every instance subscribes to for broadcasts in its namespace.
pub fn subscription_pattern(namespace: &str) -> String {
    format!("{}.{}", namespace, WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys() {
        assert_eq!(route_key("www", "hello"), "www.hello");
        assert_eq!(queue_key("www", NodeSelector::Node(3)), "www.3");
        assert_eq!(queue_key("www", NodeSelector::Any), "www.*");
        assert_eq!(subscription_pattern("www"), "www.*");
        assert_eq!(Address::new("www", 7, None).queue_key(), "www.7");
    }

    #[test]
    fn test_node_selector_wire() {
        assert_eq!(serde_json::to_value(NodeSelector::Any).unwrap(), json!("*"));
        assert_eq!(serde_json::to_value(NodeSelector::Node(2)).unwrap(), json!(2));
        let any: NodeSelector = serde_json::from_value(json!("*")).unwrap();
        assert_eq!(any, NodeSelector::Any);
        let numeric: NodeSelector = serde_json::from_value(json!("12")).unwrap();
        assert_eq!(numeric, NodeSelector::Node(12));
        assert!(serde_json::from_value::<NodeSelector>(json!("web")).is_err());
    }

    #[test]
    fn test_target_id_accepts_numbers() {
        let tid: TargetId = serde_json::from_value(json!(0)).unwrap();
        assert_eq!(tid.as_str(), "0");
        assert_eq!(serde_json::to_value(&tid).unwrap(), json!("0"));
        assert!(TargetId::wildcard().is_wildcard());
    }

    #[test]
    fn test_address_wire_shape() {
        let addr = Address::new("www", 1, None);
        assert_eq!(
            serde_json::to_value(&addr).unwrap(),
            json!({"ns": "www", "nid": 1, "tid": null})
        );
        assert_eq!(addr.to_string(), "www.1");
        let with_tid = Address::new("www", 1, Some("cart".into()));
        assert_eq!(with_tid.to_string(), "www.1/cart");
    }

    #[test]
    fn test_destination_builder() {
        let dest = Destination::new().namespace("api").node(4).target("job-9");
        assert_eq!(dest.ns.as_deref(), Some("api"));
        assert_eq!(dest.nid, Some(NodeSelector::Node(4)));
        assert_eq!(dest.tid, Some(TargetId::new("job-9")));
    }
}
