//! Connection pools and the manager that fills them.
//!
//! A [`ConnectionPool`] is a fixed ring of store connections. Outgoing traffic
//! rotates through it so that work spreads evenly; subscribe and queue pools
//! hold one connection per listener.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::config::{AuthConfig, ConnectionConfig};
use crate::error::{CipherError, ErrorSink, TransportError};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::store::{ConnectionParams, Store, StoreConnection, StoreResult};

/// Shared handle to one store connection.
pub type Conn = Arc<dyn StoreConnection>;

/// An ordered ring of connections.
#[derive(Default)]
pub struct ConnectionPool {
    name: String,
    members: Mutex<VecDeque<Conn>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("size", &self.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Conn>> {
        self.members.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn push(&self, conn: Conn) {
        self.lock().push_back(conn);
    }

    /// Takes the front connection, moves it to the back and returns it.
    pub fn rotate(&self) -> StoreResult<Conn> {
        let mut members = self.lock();
        let conn = members.pop_front().ok_or(TransportError::EmptyPool)?;
        members.push_back(conn.clone());
        Ok(conn)
    }

    /// Swaps `old` for `new` in place. Returns `false` if `old` is not a member.
    pub fn replace(&self, old: &Conn, new: Conn) -> bool {
        let mut members = self.lock();
        match members.iter_mut().find(|c| Arc::ptr_eq(c, old)) {
            Some(slot) => {
                *slot = new;
                true
            }
            None => false,
        }
    }

    /// Snapshot of the members in their current order.
    pub fn members(&self) -> Vec<Conn> {
        self.lock().iter().cloned().collect()
    }
}

/// Opens connections against the store and adds them to pools.
pub struct PoolManager {
    store: Arc<dyn Store>,
    connection: ConnectionConfig,
    auth: AuthConfig,
    retry: RetryExecutor,
    errors: Arc<dyn ErrorSink>,
}

impl PoolManager {
    pub fn new(
        store: Arc<dyn Store>,
        connection: ConnectionConfig,
        auth: AuthConfig,
        retry: RetryConfig,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            store,
            connection,
            auth,
            retry: RetryExecutor::new(retry),
            errors,
        }
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Effective parameters for a new connection.
    pub fn params(&self, call: Option<&ConnectionConfig>) -> ConnectionParams {
        ConnectionConfig::resolve(call, &self.connection, self.store.default_params())
    }

    /// Opens one connection and authenticates it if a password is configured.
    ///
    /// Transient failures are retried with backoff. Every failed attempt is
    /// logged and reported to the error sink under `context`.
    pub async fn connect(&self, context: &str, call: Option<&ConnectionConfig>) -> StoreResult<Conn> {
        let params = self.params(call);
        let addr = params.addr();

        let outcome = self
            .retry
            .execute(
                || self.open(&params),
                |err, attempt| {
                    warn!(pool = %context, addr = %addr, attempt, error = %err, "store connection failed");
                    self.errors.report(&CipherError::Transport(err.clone()), context);
                },
            )
            .await;
        outcome.into_result()
    }

    /// Like [`connect`](Self::connect), then appends the connection to `pool`.
    pub async fn add_to_pool(
        &self,
        pool: &ConnectionPool,
        call: Option<&ConnectionConfig>,
    ) -> StoreResult<Conn> {
        let conn = self.connect(pool.name(), call).await?;
        pool.push(conn.clone());
        debug!(pool = %pool.name(), addr = %conn.peer_addr(), size = pool.len(), "connection added to pool");
        Ok(conn)
    }

    async fn open(&self, params: &ConnectionParams) -> StoreResult<Conn> {
        let conn: Conn = Arc::from(self.store.connect(params).await?);
        if let Some(pass) = &self.auth.pass {
            conn.auth(pass).await?;
        }
        Ok(conn)
    }

    /// Fills `pool` with `size` connections.
    pub async fn fill(&self, pool: &ConnectionPool, size: usize) -> StoreResult<()> {
        for _ in 0..size {
            self.add_to_pool(pool, None).await?;
        }
        Ok(())
    }
}
