//! Publish/subscribe delivery path.
//!
//! Every connection in the subscribe pool holds one pattern subscription on
//! `"<namespace>.*"`. Each delivery is handed to the dispatcher on its own
//! task, so a slow handler never holds up the listener.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::subscription_pattern;
use crate::cancel::CancelToken;
use crate::dispatch::Dispatcher;
use crate::error::{CipherError, TransportError};
use crate::pool::{Conn, ConnectionPool, PoolManager};
use crate::resolver::TenantResolver;
use crate::store::{StoreResult, Subscription};

pub struct BroadcastTransport {
    pattern: String,
    outgoing: Arc<ConnectionPool>,
    subscribers: Arc<ConnectionPool>,
}

impl BroadcastTransport {
    /// Opens `pool_size` subscriber connections, subscribes each to the
    /// namespace pattern and spawns one listener per subscription.
    pub async fn start<R: TenantResolver>(
        namespace: &str,
        pool_size: usize,
        outgoing: Arc<ConnectionPool>,
        manager: Arc<PoolManager>,
        dispatcher: Arc<Dispatcher<R>>,
        cancel: CancelToken,
    ) -> StoreResult<(Self, Vec<JoinHandle<()>>)> {
        let pattern = subscription_pattern(namespace);
        let subscribers = Arc::new(ConnectionPool::new(format!("{} (subscribe)", namespace)));
        let mut listeners = Vec::with_capacity(pool_size);

        for _ in 0..pool_size {
            let conn = manager.add_to_pool(&subscribers, None).await?;
            let subscription = conn.psubscribe(&pattern).await?;
            listeners.push(tokio::spawn(listen(
                subscription,
                conn,
                subscribers.clone(),
                manager.clone(),
                dispatcher.clone(),
                cancel.clone(),
            )));
        }
        info!(pattern = %pattern, listeners = listeners.len(), "broadcast listeners started");

        Ok((
            Self {
                pattern,
                outgoing,
                subscribers,
            },
            listeners,
        ))
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publishes `raw` on `channel` through the next outgoing connection.
    /// Returns the number of subscribers the store reached.
    pub async fn publish(&self, channel: &str, raw: &str) -> StoreResult<usize> {
        self.outgoing.rotate()?.publish(channel, raw).await
    }
}

/// Hands deliveries to the dispatcher. When the subscription closes, a fresh
/// connection takes the dead one's slot in the subscribe pool.
async fn listen<R: TenantResolver>(
    mut subscription: Subscription,
    mut conn: Conn,
    subscribers: Arc<ConnectionPool>,
    manager: Arc<PoolManager>,
    dispatcher: Arc<Dispatcher<R>>,
    cancel: CancelToken,
) {
    let pattern = subscription.pattern().to_string();
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = subscription.recv() => delivery,
        };

        match delivery {
            Some(msg) => {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch_broadcast(&msg).await;
                });
            }
            None => {
                warn!(pattern = %pattern, "subscription closed, resubscribing");
                dispatcher.report(
                    &CipherError::Transport(TransportError::ConnectionClosed),
                    &pattern,
                );
                match resubscribe(&pattern, &manager, &dispatcher, &cancel).await {
                    Some((fresh_conn, fresh)) => {
                        subscribers.replace(&conn, fresh_conn.clone());
                        conn = fresh_conn;
                        subscription = fresh;
                    }
                    None => break,
                }
            }
        }
    }
    debug!(pattern = %pattern, "broadcast listener stopped");
}

/// Keeps trying to open a new subscription until it works or the instance
/// shuts down.
async fn resubscribe<R: TenantResolver>(
    pattern: &str,
    manager: &PoolManager,
    dispatcher: &Dispatcher<R>,
    cancel: &CancelToken,
) -> Option<(Conn, Subscription)> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        let result = async {
            let conn = manager.connect(pattern, None).await?;
            let subscription = conn.psubscribe(pattern).await?;
            Ok::<_, TransportError>((conn, subscription))
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            outcome = result => outcome,
        };
        match outcome {
            Ok(fresh) => {
                info!(pattern, attempt, "resubscribed");
                return Some(fresh);
            }
            Err(err) => {
                warn!(pattern, attempt, error = %err, "resubscribe failed");
                dispatcher.report(&CipherError::Transport(err), pattern);
                let delay = manager.retry().backoff(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Destination};
    use crate::cancel::new_cancel_pair;
    use crate::config::{AuthConfig, ConnectionConfig};
    use crate::envelope::{self, Delivery, Envelope, Payload};
    use crate::error::{CollectErrors, DiscardErrors, ErrorKind, ErrorSink};
    use crate::instrument::MemoryLogSink;
    use crate::resolver::NoTenant;
    use crate::retry::RetryConfig;
    use crate::routes::RouteKind;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager(store: &MemoryStore) -> Arc<PoolManager> {
        let errors: Arc<dyn ErrorSink> = Arc::new(DiscardErrors);
        Arc::new(PoolManager::new(
            Arc::new(store.clone()),
            ConnectionConfig::default(),
            AuthConfig::default(),
            RetryConfig::default(),
            errors,
        ))
    }

    fn raw_broadcast(route: &str) -> String {
        let env = Envelope::build(
            Address::new("www", 1, None),
            route,
            Payload::new(),
            Destination::new(),
            Delivery::Broadcast,
        );
        envelope::serialize(&env).unwrap()
    }

    #[tokio::test]
    async fn test_listeners_dispatch_published_messages() {
        let store = MemoryStore::new();
        let mgr = manager(&store);
        let (token, handle) = new_cancel_pair();
        let dispatcher = Arc::new(Dispatcher::new(
            NoTenant,
            Duration::from_secs(1),
            token.clone(),
            Arc::new(MemoryLogSink::new()),
            Arc::new(DiscardErrors),
        ));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        dispatcher
            .routes(RouteKind::Broadcast)
            .register(
                "www",
                "news",
                Arc::new(move |_: Address, _: Arc<()>, _: Payload| {
                    let h = h.clone();
                    async move {
                        h.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();

        let outgoing = Arc::new(ConnectionPool::new("www (outgoing)"));
        mgr.fill(&outgoing, 1).await.unwrap();
        let (transport, listeners) = BroadcastTransport::start(
            "www",
            2,
            outgoing,
            mgr.clone(),
            dispatcher,
            token,
        )
        .await
        .unwrap();
        assert_eq!(transport.pattern(), "www.*");
        assert_eq!(transport.subscriber_count(), 2);
        assert_eq!(store.subscriber_count(), 2);

        // Both listeners receive it, so the handler runs once per subscription.
        let reached = transport.publish("www.news", &raw_broadcast("news")).await.unwrap();
        assert_eq!(reached, 2);
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        handle.cancel(crate::cancel::CancelReason::Shutdown);
        for listener in listeners {
            listener.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_publish_without_connections_fails() {
        let store = MemoryStore::new();
        let mgr = manager(&store);
        let (token, _handle) = new_cancel_pair();
        let dispatcher = Arc::new(Dispatcher::new(
            NoTenant,
            Duration::from_secs(1),
            token.clone(),
            Arc::new(MemoryLogSink::new()),
            Arc::new(DiscardErrors),
        ));
        let (transport, _listeners) = BroadcastTransport::start(
            "www",
            1,
            Arc::new(ConnectionPool::new("empty")),
            mgr,
            dispatcher,
            token,
        )
        .await
        .unwrap();
        let err = transport.publish("www.news", "{}").await.unwrap_err();
        assert_eq!(err, TransportError::EmptyPool);
    }

    #[tokio::test]
    async fn test_closed_subscription_replaced_in_pool() {
        let store = MemoryStore::new();
        let mgr = manager(&store);
        let (token, handle) = new_cancel_pair();
        let errors = Arc::new(CollectErrors::new());
        let dispatcher = Arc::new(Dispatcher::new(
            NoTenant,
            Duration::from_secs(1),
            token.clone(),
            Arc::new(MemoryLogSink::new()),
            errors.clone(),
        ));
        let outgoing = Arc::new(ConnectionPool::new("www (outgoing)"));
        mgr.fill(&outgoing, 1).await.unwrap();
        let (transport, listeners) =
            BroadcastTransport::start("www", 1, outgoing, mgr, dispatcher, token)
                .await
                .unwrap();
        let before = transport.subscribers.members();
        assert_eq!(before.len(), 1);

        assert_eq!(store.close_subscriptions(), 1);
        for _ in 0..200 {
            let current = transport.subscribers.members();
            if store.subscriber_count() == 1 && !Arc::ptr_eq(&before[0], &current[0]) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.subscriber_count(), 1);

        let after = transport.subscribers.members();
        assert_eq!(after.len(), 1);
        assert!(!Arc::ptr_eq(&before[0], &after[0]));
        assert_eq!(errors.count(ErrorKind::Transport), 1);
        assert_eq!(errors.reports()[0].1, "www.*");

        handle.cancel(crate::cancel::CancelReason::Shutdown);
        for listener in listeners {
            listener.await.unwrap();
        }
    }
}
