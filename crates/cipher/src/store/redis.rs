//! Store backed by a Redis server.
//!
//! Commands go over one multiplexed connection per [`StoreConnection`].
//! Pattern subscriptions need a dedicated pub/sub connection, so
//! `psubscribe` opens one with the same address and credentials and forwards
//! its messages into the [`Subscription`] channel. When the server drops the
//! pub/sub connection the channel closes and the listener resubscribes.
//!
//! Recognized connection options: `db` (numeric database index) and
//! `username` (ACL user sent with `AUTH`).

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{
    AsyncCommands, Client, ConnectionAddr, ConnectionInfo, ErrorKind as RedisErrorKind,
    RedisConnectionInfo, RedisError,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{ConnectionParams, PubSubMessage, Store, StoreConnection, StoreResult, Subscription};
use crate::error::TransportError;

/// Opens connections to a Redis server.
#[derive(Debug, Clone, Default)]
pub struct RedisStore {
    defaults: ConnectionParams,
}

impl RedisStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `defaults` wherever neither the call nor the instance config
    /// names a host, port or options.
    pub fn with_defaults(defaults: ConnectionParams) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl Store for RedisStore {
    fn default_params(&self) -> ConnectionParams {
        self.defaults.clone()
    }

    async fn connect(&self, params: &ConnectionParams) -> StoreResult<Box<dyn StoreConnection>> {
        let addr = params.addr();
        let info = connection_info(params)?;
        let conn = open_client(&addr, &info)?
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| connect_error(&addr, err))?;
        trace!(addr = %addr, "redis connection opened");
        Ok(Box::new(RedisConnection {
            addr,
            info: Mutex::new(info),
            conn,
        }))
    }
}

/// A command connection to a Redis server.
pub struct RedisConnection {
    addr: String,
    /// Kept so pub/sub connections reuse the address and credentials.
    info: Mutex<ConnectionInfo>,
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("addr", &self.addr)
            .finish()
    }
}

impl RedisConnection {
    fn info(&self) -> MutexGuard<'_, ConnectionInfo> {
        self.info.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn auth(&self, password: &str) -> StoreResult<()> {
        let username = self.info().redis.username.clone();
        let mut cmd = ::redis::cmd("AUTH");
        if let Some(user) = &username {
            cmd.arg(user);
        }
        cmd.arg(password);

        let mut con = self.conn.clone();
        let reply: Result<(), RedisError> = cmd.query_async(&mut con).await;
        match reply {
            Ok(()) => {
                self.info().redis.password = Some(password.to_string());
                Ok(())
            }
            Err(err) => match map_error("auth", &self.addr, err) {
                TransportError::OperationFailed { reason, .. } => {
                    Err(TransportError::AuthFailed { reason })
                }
                other => Err(other),
            },
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        let mut con = self.conn.clone();
        con.publish::<_, _, usize>(channel, message)
            .await
            .map_err(|err| map_error("publish", &self.addr, err))
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<Subscription> {
        let info = self.info().clone();
        let mut pubsub = open_client(&self.addr, &info)?
            .get_async_pubsub()
            .await
            .map_err(|err| connect_error(&self.addr, err))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|err| map_error("psubscribe", &self.addr, err))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let owned = pattern.to_string();
        let messages = pubsub.into_on_message();
        tokio::spawn(async move {
            tokio::pin!(messages);
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = messages.next() => next,
                };
                let Some(msg) = next else {
                    debug!(pattern = %owned, "redis pub/sub stream ended");
                    break;
                };
                let payload = match msg.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(pattern = %owned, error = %err, "skipping non-text pub/sub payload");
                        continue;
                    }
                };
                let delivery = PubSubMessage {
                    pattern: msg.get_pattern::<String>().unwrap_or_else(|_| owned.clone()),
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(pattern, rx))
    }

    async fn rpush(&self, key: &str, message: &str) -> StoreResult<usize> {
        let mut con = self.conn.clone();
        con.rpush::<_, _, usize>(key, message)
            .await
            .map_err(|err| map_error("rpush", &self.addr, err))
    }

    async fn blpop(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> StoreResult<Option<(String, String)>> {
        let mut con = self.conn.clone();
        con.blpop::<_, Option<(String, String)>>(key, blpop_timeout(timeout))
            .await
            .map_err(|err| map_error("blpop", &self.addr, err))
    }

    fn peer_addr(&self) -> &str {
        &self.addr
    }
}

fn open_client(addr: &str, info: &ConnectionInfo) -> StoreResult<Client> {
    Client::open(info.clone()).map_err(|err| connect_error(addr, err))
}

/// Builds the client connection info for `params`.
pub fn connection_info(params: &ConnectionParams) -> StoreResult<ConnectionInfo> {
    let db = match params.options.get("db") {
        Some(raw) => raw.parse::<i64>().map_err(|_| TransportError::ConnectFailed {
            addr: params.addr(),
            reason: format!("invalid db option '{}'", raw),
        })?,
        None => 0,
    };
    Ok(ConnectionInfo {
        addr: ConnectionAddr::Tcp(params.host.clone(), params.port),
        redis: RedisConnectionInfo {
            db,
            username: params.options.get("username").cloned(),
            ..Default::default()
        },
    })
}

/// Redis treats a zero timeout as "block forever".
fn blpop_timeout(timeout: Option<Duration>) -> f64 {
    match timeout {
        None => 0.0,
        Some(limit) => limit.as_secs_f64().max(0.001),
    }
}

fn is_auth_error(err: &RedisError) -> bool {
    err.kind() == RedisErrorKind::AuthenticationFailed
        || matches!(err.code(), Some("NOAUTH") | Some("WRONGPASS"))
}

fn connect_error(addr: &str, err: RedisError) -> TransportError {
    if is_auth_error(&err) {
        TransportError::AuthFailed {
            reason: err.to_string(),
        }
    } else {
        TransportError::ConnectFailed {
            addr: addr.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Classifies a client error so the retry policy can act on it.
pub fn map_error(op: &'static str, addr: &str, err: RedisError) -> TransportError {
    if is_auth_error(&err) {
        TransportError::AuthFailed {
            reason: err.to_string(),
        }
    } else if err.is_connection_refusal() {
        TransportError::ConnectFailed {
            addr: addr.to_string(),
            reason: err.to_string(),
        }
    } else if err.is_connection_dropped() || err.is_io_error() {
        TransportError::ConnectionClosed
    } else {
        TransportError::OperationFailed {
            op,
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io;

    fn params(options: &[(&str, &str)]) -> ConnectionParams {
        ConnectionParams {
            host: "cache.internal".to_string(),
            port: 6380,
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_connection_info_from_params() {
        let info = connection_info(&params(&[("db", "3"), ("username", "bus")])).unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("cache.internal".to_string(), 6380));
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.username.as_deref(), Some("bus"));
        assert!(info.redis.password.is_none());

        let plain = connection_info(&params(&[])).unwrap();
        assert_eq!(plain.redis.db, 0);
        assert!(plain.redis.username.is_none());
    }

    #[test]
    fn test_invalid_db_option_rejected() {
        let err = connection_info(&params(&[("db", "zero")])).unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { ref addr, .. } if addr == "cache.internal:6380"));
    }

    #[test]
    fn test_error_classification() {
        let auth = RedisError::from((RedisErrorKind::AuthenticationFailed, "invalid password"));
        assert!(matches!(map_error("auth", "h:1", auth), TransportError::AuthFailed { .. }));

        let refused = RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(
            map_error("blpop", "h:1", refused),
            TransportError::ConnectFailed { ref addr, .. } if addr == "h:1"
        ));

        let dropped = RedisError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(map_error("blpop", "h:1", dropped), TransportError::ConnectionClosed);

        let typed = RedisError::from((RedisErrorKind::TypeError, "wrong type"));
        assert!(matches!(
            map_error("rpush", "h:1", typed),
            TransportError::OperationFailed { op: "rpush", .. }
        ));
    }

    #[test]
    fn test_blpop_timeout_encoding() {
        assert_eq!(blpop_timeout(None), 0.0);
        assert_eq!(blpop_timeout(Some(Duration::from_millis(1500))), 1.5);
        assert!(blpop_timeout(Some(Duration::ZERO)) > 0.0);
    }
}
