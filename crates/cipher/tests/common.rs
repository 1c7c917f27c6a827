//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cipher::{
    Address, Cipher, CipherBuilder, CipherConfig, MemoryStore, Payload, RetryConfig,
    UnconfiguredResolver,
};

/// Config with fast retries so failure tests finish quickly.
pub fn test_config(namespace: &str, nid: u64, pool_size: usize) -> CipherConfig {
    let mut config = CipherConfig::new(namespace, nid).with_pool_size(pool_size);
    config.retry = RetryConfig {
        max_retries: 1,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config.resolver_timeout_ms = 200;
    config
}

pub fn builder(store: &MemoryStore, namespace: &str, nid: u64) -> CipherBuilder<UnconfiguredResolver> {
    Cipher::builder(test_config(namespace, nid, 1), store.clone())
}

pub fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Records every handler invocation.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<(String, Address, Payload)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that records under `label`.
    pub fn handler<T: Send + Sync + 'static>(
        &self,
        label: &str,
    ) -> impl Fn(Address, Arc<T>, Payload) -> std::future::Ready<()> + Send + Sync + 'static {
        let calls = self.calls.clone();
        let label = label.to_string();
        move |origin, _tenant, payload| {
            calls
                .lock()
                .unwrap()
                .push((label.clone(), origin, payload));
            std::future::ready(())
        }
    }

    pub fn calls(&self) -> Vec<(String, Address, Payload)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn count_for(&self, label: &str) -> usize {
        self.calls().iter().filter(|(l, _, _)| l == label).count()
    }

    /// Polls until at least `n` calls were recorded or two seconds pass.
    pub async fn wait_for(&self, n: usize) -> usize {
        for _ in 0..400 {
            if self.count() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count()
    }
}

/// Gives background tasks time to pick up work that should be ignored.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
