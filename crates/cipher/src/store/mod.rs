//! Abstract store layer the bus is built on.
//!
//! The bus needs a store that offers atomic publish / pattern-subscribe and
//! atomic list push / blocking pop, with optional password authentication.
//! The [`Store`] and [`StoreConnection`] traits describe exactly that surface.
//! An in-process implementation lives in [`memory`]; with the `redis` feature
//! enabled, [`RedisStore`] talks to a Redis server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, TransportError>;

/// Fully resolved parameters for opening one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub options: BTreeMap<String, String>,
}

impl ConnectionParams {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            options: BTreeMap::new(),
        }
    }
}

/// One message delivered to a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// The pattern that matched.
    pub pattern: String,
    /// The channel the message was published on.
    pub channel: String,
    pub payload: String,
}

/// Stream of deliveries for one pattern subscription.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, rx: mpsc::UnboundedReceiver<PubSubMessage>) -> Self {
        Self {
            pattern: pattern.into(),
            rx,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Waits for the next delivery. `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }
}

/// A store that hands out connections.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Parameters used when neither the caller nor the instance config set them.
    fn default_params(&self) -> ConnectionParams {
        ConnectionParams::default()
    }

    /// Open a new connection.
    async fn connect(&self, params: &ConnectionParams) -> StoreResult<Box<dyn StoreConnection>>;
}

/// An open connection to the store.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Authenticate this connection.
    async fn auth(&self, password: &str) -> StoreResult<()>;

    /// Publish `message` on `channel`. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize>;

    /// Subscribe to every channel matching the glob `pattern`.
    async fn psubscribe(&self, pattern: &str) -> StoreResult<Subscription>;

    /// Append `message` to the tail of the list at `key`. Returns the new length.
    async fn rpush(&self, key: &str, message: &str) -> StoreResult<usize>;

    /// Pop from the head of the list at `key`, waiting until an item arrives.
    ///
    /// `None` as timeout waits forever. Returns `Ok(None)` if the timeout
    /// elapsed with nothing to pop.
    async fn blpop(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> StoreResult<Option<(String, String)>>;

    /// Address this connection was opened against.
    fn peer_addr(&self) -> &str;
}

/// Matches a channel name against a glob pattern (`*` and `?` wildcards).
pub fn glob_match(pattern: &str, channel: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = channel.chars().collect();
    let (mut pi, mut ci) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ci));
            pi += 1;
        } else if let Some((sp, sc)) = star {
            pi = sp + 1;
            ci = sc + 1;
            star = Some((sp, sc + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
