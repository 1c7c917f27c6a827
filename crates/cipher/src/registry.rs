//! Process-level map of running instances keyed by `"<namespace>-<nid>"`.
//!
//! Each key owns a once-cell, so an `init` that is still connecting only
//! blocks callers of the same key. Lookups never wait on a build.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;

use crate::config::instance_key;
use crate::error::{CipherError, Result};
use crate::instance::{Cipher, CipherBuilder};
use crate::instrument::{Instrument, LogLevel, LogSink, TracerId, TracingLogSink};
use crate::resolver::TenantResolver;

type Slot<R> = Arc<OnceCell<Arc<Cipher<R>>>>;

pub struct CipherRegistry<R: TenantResolver> {
    instances: Mutex<HashMap<String, Slot<R>>>,
    log: Arc<dyn LogSink>,
}

impl<R: TenantResolver> Default for CipherRegistry<R> {
    fn default() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            log: Arc::new(TracingLogSink),
        }
    }
}

impl<R: TenantResolver> CipherRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<R>>> {
        self.instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Builds and registers an instance, or returns the one already running
    /// under the same key. A second `init` never opens connections; one that
    /// races an in-flight build waits for it and shares its result.
    pub async fn init(&self, builder: CipherBuilder<R>) -> Result<Arc<Cipher<R>>> {
        let key = builder.config().instance_key();
        let ins = Instrument::new(&*self.log, "CipherRegistry.init", TracerId::generate());
        let slot = self.lock().entry(key.clone()).or_default().clone();

        if let Some(existing) = slot.get() {
            ins.emit(
                LogLevel::Debug,
                Some(&key),
                format!("Instance {} already initialized", key),
            );
            return Ok(existing.clone());
        }

        match slot
            .get_or_try_init(|| async move { builder.build().await.map(Arc::new) })
            .await
        {
            Ok(cipher) => {
                ins.info(&key, format!("Instance {} ready", key));
                Ok(cipher.clone())
            }
            Err(err) => {
                let mut instances = self.lock();
                let abandoned = instances
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized());
                if abandoned {
                    instances.remove(&key);
                }
                drop(instances);
                ins.error(&key, format!("Instance {} failed to start: {}", key, err));
                Err(err)
            }
        }
    }

    /// Running instance under `(namespace, nid)`. An instance that is still
    /// starting counts as not initialized.
    pub fn get(&self, namespace: &str, nid: u64) -> Result<Arc<Cipher<R>>> {
        let key = instance_key(namespace, nid);
        let found = self.lock().get(&key).and_then(|slot| slot.get().cloned());
        match found {
            Some(cipher) => Ok(cipher),
            None => {
                Instrument::new(&*self.log, "CipherRegistry.get", TracerId::generate())
                    .warn(&key, format!("No instance registered under {}", key));
                Err(CipherError::NotInitialized { key })
            }
        }
    }

    pub fn contains(&self, namespace: &str, nid: u64) -> bool {
        self.lock()
            .get(&instance_key(namespace, nid))
            .is_some_and(|slot| slot.initialized())
    }

    /// Removes a running instance and shuts it down. An instance that is
    /// still starting is left alone.
    pub async fn remove(&self, namespace: &str, nid: u64) -> Option<Arc<Cipher<R>>> {
        let key = instance_key(namespace, nid);
        let removed = {
            let mut instances = self.lock();
            match instances.get(&key).and_then(|slot| slot.get().cloned()) {
                Some(cipher) => {
                    instances.remove(&key);
                    Some(cipher)
                }
                None => None,
            }
        };
        if let Some(cipher) = &removed {
            cipher.shutdown().await;
            Instrument::new(&*self.log, "CipherRegistry.remove", TracerId::generate())
                .info(&key, format!("Instance {} removed", key));
        }
        removed
    }

    /// Shuts down and forgets every running instance.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<Cipher<R>>> = {
            let mut instances = self.lock();
            let running: Vec<String> = instances
                .iter()
                .filter(|(_, slot)| slot.initialized())
                .map(|(key, _)| key.clone())
                .collect();
            running
                .into_iter()
                .filter_map(|key| instances.remove(&key))
                .filter_map(|slot| slot.get().cloned())
                .collect()
        };
        let ins = Instrument::new(&*self.log, "CipherRegistry.shutdown_all", TracerId::generate());
        for cipher in drained {
            cipher.shutdown().await;
            let key = cipher.config().instance_key();
            ins.info(&key, format!("Instance {} shut down", key));
        }
    }

    /// Number of running instances.
    pub fn len(&self) -> usize {
        self.lock().values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
