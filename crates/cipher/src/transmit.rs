//! Point-to-point delivery path over list queues.
//!
//! An instance consumes two queues: its own (`"<ns>.<nid>"`) and the
//! namespace-wide one (`"<ns>.*"`). Each queue gets `pool_size` consumers,
//! every one on its own connection. Consumers compete for items, and each
//! processes its items strictly in the order it popped them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::{queue_key, NodeSelector};
use crate::cancel::CancelToken;
use crate::dispatch::Dispatcher;
use crate::error::CipherError;
use crate::pool::{Conn, ConnectionPool, PoolManager};
use crate::resolver::TenantResolver;
use crate::retry::is_retryable;
use crate::store::StoreResult;

pub struct TransmitTransport {
    outgoing: Arc<ConnectionPool>,
    queues: BTreeMap<String, Arc<ConnectionPool>>,
}

impl TransmitTransport {
    /// Opens the consumer connections for both queue keys and spawns one
    /// consumer per connection.
    pub async fn start<R: TenantResolver>(
        namespace: &str,
        nid: u64,
        pool_size: usize,
        outgoing: Arc<ConnectionPool>,
        manager: Arc<PoolManager>,
        dispatcher: Arc<Dispatcher<R>>,
        cancel: CancelToken,
    ) -> StoreResult<(Self, Vec<JoinHandle<()>>)> {
        let keys = [
            queue_key(namespace, NodeSelector::Any),
            queue_key(namespace, NodeSelector::Node(nid)),
        ];
        let mut queues = BTreeMap::new();
        let mut consumers = Vec::with_capacity(keys.len() * pool_size);

        for key in keys {
            let pool = Arc::new(ConnectionPool::new(key.clone()));
            for _ in 0..pool_size {
                let conn = manager.add_to_pool(&pool, None).await?;
                consumers.push(tokio::spawn(consume(
                    key.clone(),
                    conn,
                    pool.clone(),
                    manager.clone(),
                    dispatcher.clone(),
                    cancel.clone(),
                )));
            }
            info!(queue = %key, consumers = pool_size, "queue consumers started");
            queues.insert(key, pool);
        }

        Ok((Self { outgoing, queues }, consumers))
    }

    /// Queue keys this instance consumes, sorted.
    pub fn queue_keys(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    pub fn consumer_count(&self, key: &str) -> usize {
        self.queues.get(key).map(|pool| pool.len()).unwrap_or(0)
    }

    /// Appends `raw` to the queue at `key` through the next outgoing
    /// connection. Returns the queue length after the push.
    pub async fn push(&self, key: &str, raw: &str) -> StoreResult<usize> {
        self.outgoing.rotate()?.rpush(key, raw).await
    }
}

/// One competing consumer. Each popped item is dispatched to completion
/// before the next pop.
async fn consume<R: TenantResolver>(
    key: String,
    mut conn: Conn,
    pool: Arc<ConnectionPool>,
    manager: Arc<PoolManager>,
    dispatcher: Arc<Dispatcher<R>>,
    cancel: CancelToken,
) {
    let mut failures = 0u32;
    loop {
        let popped = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            popped = conn.blpop(&key, None) => popped,
        };

        match popped {
            Ok(Some((queue, raw))) => {
                failures = 0;
                dispatcher.dispatch_queue(&queue, &raw).await;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(queue = %key, attempt = failures, error = %err, "queue pop failed");
                dispatcher.report(&CipherError::Transport(err.clone()), &key);
                let delay = manager.retry().backoff(failures);
                failures = failures.saturating_add(1);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if is_retryable(&err) {
                    match manager.connect(&key, None).await {
                        Ok(fresh) => {
                            pool.replace(&conn, fresh.clone());
                            conn = fresh;
                        }
                        Err(err) => {
                            dispatcher.report(&CipherError::Transport(err), &key);
                        }
                    }
                }
            }
        }
    }
    debug!(queue = %key, "queue consumer stopped");
}
