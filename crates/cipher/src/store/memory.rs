//! In-process store implementing the pub/sub and list primitives.
//!
//! Lists are FIFO queues guarded by a mutex; blocked poppers park on a
//! per-key [`Notify`]. Each push wakes exactly one parked popper, and a popper
//! that leaves items behind passes the wakeup on, so competing consumers on
//! one key never strand an item.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use super::{glob_match, ConnectionParams, PubSubMessage, Store, StoreConnection, StoreResult, Subscription};
use crate::error::TransportError;

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    wakers: HashMap<String, Arc<Notify>>,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    password: Option<String>,
    refuse_connects: AtomicU32,
    fail_pops: AtomicU32,
    next_conn_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn waker(&self, key: &str) -> Arc<Notify> {
        self.lock()
            .wakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn push(&self, key: &str, message: &str) -> usize {
        let (len, waker) = {
            let mut state = self.lock();
            let list = state.lists.entry(key.to_string()).or_default();
            list.push_back(message.to_string());
            let len = list.len();
            let waker = state
                .wakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();
            (len, waker)
        };
        waker.notify_one();
        len
    }

    fn try_pop(&self, key: &str, waker: &Notify) -> Option<String> {
        let mut state = self.lock();
        let list = state.lists.get_mut(key)?;
        let item = list.pop_front();
        if list.is_empty() {
            state.lists.remove(key);
        } else {
            waker.notify_one();
        }
        item
    }

    async fn pop_wait(&self, key: &str) -> String {
        let waker = self.waker(key);
        loop {
            let notified = waker.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_pop(key, &waker) {
                return item;
            }
            notified.await;
        }
    }

    fn publish(&self, channel: &str, message: &str) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for sub in state.subscribers.iter() {
            if glob_match(&sub.pattern, channel) {
                let msg = PubSubMessage {
                    pattern: sub.pattern.clone(),
                    channel: channel.to_string(),
                    payload: message.to_string(),
                };
                if sub.tx.send(msg).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// Shared in-memory store. Clones refer to the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("requires_auth", &self.shared.password.is_some())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose connections must authenticate with `password`.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                password: Some(password.into()),
                ..Shared::default()
            }),
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next_connects(&self, n: u32) {
        self.shared.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` blocking pops as if their connection had dropped.
    pub fn fail_next_pops(&self, n: u32) {
        self.shared.fail_pops.store(n, Ordering::SeqCst);
    }

    /// Ends every live pattern subscription, as a server restart would.
    pub fn close_subscriptions(&self) -> usize {
        let mut state = self.shared.lock();
        let closed = state.subscribers.len();
        state.subscribers.clear();
        debug!(closed, "memory store closed subscriptions");
        closed
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> u64 {
        self.shared.next_conn_id.load(Ordering::SeqCst)
    }

    /// Current length of the list at `key`.
    pub fn list_len(&self, key: &str) -> usize {
        self.shared.lock().lists.get(key).map_or(0, |l| l.len())
    }

    /// Number of live pattern subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let state = self.shared.lock();
        state.subscribers.iter().filter(|s| !s.tx.is_closed()).count()
    }

    /// Push a raw message without going through a connection.
    pub fn push_raw(&self, key: &str, message: &str) -> usize {
        self.shared.push(key, message)
    }

    /// Publish a raw message without going through a connection.
    pub fn publish_raw(&self, channel: &str, message: &str) -> usize {
        self.shared.publish(channel, message)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn connect(&self, params: &ConnectionParams) -> StoreResult<Box<dyn StoreConnection>> {
        let addr = params.addr();
        let refused = self
            .shared
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!(addr = %addr, "memory store refusing connection");
            return Err(TransportError::ConnectFailed {
                addr,
                reason: "connection refused".to_string(),
            });
        }

        let id = self.shared.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(addr = %addr, conn_id = id, "memory store connection opened");
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            addr,
            authenticated: AtomicBool::new(self.shared.password.is_none()),
        }))
    }
}

/// A connection to a [`MemoryStore`].
pub struct MemoryConnection {
    shared: Arc<Shared>,
    addr: String,
    authenticated: AtomicBool,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("addr", &self.addr)
            .finish()
    }
}

impl MemoryConnection {
    fn check_auth(&self) -> StoreResult<()> {
        if self.authenticated.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::AuthFailed {
                reason: "NOAUTH authentication required".to_string(),
            })
        }
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn auth(&self, password: &str) -> StoreResult<()> {
        match &self.shared.password {
            None => Err(TransportError::AuthFailed {
                reason: "AUTH sent but no password is set".to_string(),
            }),
            Some(expected) if expected == password => {
                self.authenticated.store(true, Ordering::SeqCst);
                Ok(())
            }
            Some(_) => Err(TransportError::AuthFailed {
                reason: "invalid password".to_string(),
            }),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize> {
        self.check_auth()?;
        Ok(self.shared.publish(channel, message))
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<Subscription> {
        self.check_auth()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Subscription::new(pattern, rx))
    }

    async fn rpush(&self, key: &str, message: &str) -> StoreResult<usize> {
        self.check_auth()?;
        Ok(self.shared.push(key, message))
    }

    async fn blpop(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> StoreResult<Option<(String, String)>> {
        self.check_auth()?;
        let failing = self
            .shared
            .fail_pops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::ConnectionClosed);
        }
        let wait = self.shared.pop_wait(key);
        let item = match timeout {
            None => Some(wait.await),
            Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
        };
        Ok(item.map(|message| (key.to_string(), message)))
    }

    fn peer_addr(&self) -> &str {
        &self.addr
    }
}
