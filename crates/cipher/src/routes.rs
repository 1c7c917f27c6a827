//! Route handler registries.
//!
//! Each instance keeps two independent registries, one per delivery kind.
//! Keys are fully-qualified route keys (`"<namespace>.<name>"`).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::address::{route_key, Address};
use crate::envelope::Payload;
use crate::error::{CipherError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    Broadcast,
    Transmit,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKind::Broadcast => write!(f, "broadcast"),
            RouteKind::Transmit => write!(f, "transmit"),
        }
    }
}

/// Handles messages delivered on one route.
///
/// `tenant` is whatever the instance's tenant resolver produced for the
/// message's recipient.
#[async_trait]
pub trait RouteHandler<T>: Send + Sync + 'static {
    async fn handle(&self, origin: Address, tenant: Arc<T>, payload: Payload);
}

#[async_trait]
impl<T, F, Fut> RouteHandler<T> for F
where
    T: Send + Sync + 'static,
    F: Fn(Address, Arc<T>, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, origin: Address, tenant: Arc<T>, payload: Payload) {
        (self)(origin, tenant, payload).await
    }
}

/// Options accepted by `on_broadcast` / `on_transmit`.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Register under this namespace instead of the instance's own.
    pub namespace: Option<String>,
}

impl RouteOptions {
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self {
            namespace: Some(ns.into()),
        }
    }
}

pub struct RouteRegistry<T> {
    kind: RouteKind,
    handlers: RwLock<HashMap<String, Arc<dyn RouteHandler<T>>>>,
}

impl<T: Send + Sync + 'static> RouteRegistry<T> {
    pub fn new(kind: RouteKind) -> Self {
        Self {
            kind,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> RouteKind {
        self.kind
    }

    /// Registers `handler` under `"<namespace>.<name>"`.
    ///
    /// Fails with [`CipherError::DuplicateRoute`] if the key is taken; the
    /// existing handler stays in place. Returns the full key.
    pub fn register(
        &self,
        namespace: &str,
        name: &str,
        handler: Arc<dyn RouteHandler<T>>,
    ) -> Result<String> {
        let key = route_key(namespace, name);
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handlers.contains_key(&key) {
            return Err(CipherError::DuplicateRoute {
                kind: self.kind,
                route: key,
            });
        }
        handlers.insert(key.clone(), handler);
        Ok(key)
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<dyn RouteHandler<T>>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn RouteHandler<()>> {
        Arc::new(move |_: Address, _: Arc<()>, _: Payload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = RouteRegistry::<()>::new(RouteKind::Transmit);
        let hits = Arc::new(AtomicUsize::new(0));
        let key = registry.register("www", "hello", counting(hits.clone())).unwrap();
        assert_eq!(key, "www.hello");
        assert!(registry.contains("www.hello"));
        assert!(registry.lookup("www.other").is_none());

        let handler = registry.lookup("www.hello").unwrap();
        handler
            .handle(Address::new("www", 1, None), Arc::new(()), Payload::new())
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_keeps_first() {
        let registry = RouteRegistry::<()>::new(RouteKind::Broadcast);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        registry.register("www", "news", counting(first.clone())).unwrap();

        let err = registry
            .register("www", "news", counting(second.clone()))
            .unwrap_err();
        assert!(matches!(
            err,
            CipherError::DuplicateRoute { kind: RouteKind::Broadcast, ref route } if route == "www.news"
        ));

        registry
            .lookup("www.news")
            .unwrap()
            .handle(Address::new("www", 0, None), Arc::new(()), Payload::new())
            .await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_same_name_other_namespace() {
        let registry = RouteRegistry::<()>::new(RouteKind::Transmit);
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register("www", "hello", counting(hits.clone())).unwrap();
        registry.register("api", "hello", counting(hits)).unwrap();
        assert_eq!(registry.keys(), vec!["api.hello", "www.hello"]);
    }
}
