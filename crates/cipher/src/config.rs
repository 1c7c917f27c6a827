//! Instance configuration.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CipherError, Result};
use crate::retry::RetryConfig;
use crate::store::ConnectionParams;

/// Connection settings. Unset fields fall through to the next layer:
/// per-call override, then instance config, then store defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub options: Option<BTreeMap<String, String>>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            options: None,
        }
    }

    /// Resolves the final parameters from the three layers.
    pub fn resolve(
        call: Option<&ConnectionConfig>,
        instance: &ConnectionConfig,
        defaults: ConnectionParams,
    ) -> ConnectionParams {
        let pick = |f: fn(&ConnectionConfig) -> bool| call.filter(|c| f(c)).unwrap_or(instance);
        let host = pick(|c| c.host.is_some()).host.clone().unwrap_or(defaults.host);
        let port = pick(|c| c.port.is_some()).port.unwrap_or(defaults.port);
        let options = pick(|c| c.options.is_some())
            .options
            .clone()
            .unwrap_or(defaults.options);
        ConnectionParams { host, port, options }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    /// Prefix on every route, channel and queue this instance uses. Required.
    pub namespace: String,
    /// Node id within the namespace.
    pub nid: u64,
    /// Connections per pool, and consumers per queue key.
    pub pool_size: usize,
    pub connection: ConnectionConfig,
    pub auth: AuthConfig,
    /// Upper bound on a single tenant lookup.
    pub resolver_timeout_ms: u64,
    pub retry: RetryConfig,
    /// Default filter for [`crate::instrument::init_tracing`].
    pub log_level: String,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            nid: 0,
            pool_size: 1,
            connection: ConnectionConfig::default(),
            auth: AuthConfig::default(),
            resolver_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl CipherConfig {
    pub fn new(namespace: impl Into<String>, nid: u64) -> Self {
        Self {
            namespace: namespace.into(),
            nid,
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Registry key for this configuration: `"<namespace>-<nid>"`.
    pub fn instance_key(&self) -> String {
        instance_key(&self.namespace, self.nid)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CipherError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CipherError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Applies `CIPHER_NS`, `CIPHER_NID` and `CIPHER_POOL_SIZE` overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(ns) = var("CIPHER_NS") {
            self.namespace = ns;
        }
        if let Some(nid) = var("CIPHER_NID") {
            self.nid = nid
                .trim()
                .parse()
                .map_err(|_| CipherError::Config(format!("CIPHER_NID is not a node id: {}", nid)))?;
        }
        if let Some(size) = var("CIPHER_POOL_SIZE") {
            self.pool_size = size.trim().parse().map_err(|_| {
                CipherError::Config(format!("CIPHER_POOL_SIZE is not a number: {}", size))
            })?;
        }
        Ok(())
    }

    /// Checks required fields and normalizes the pool size to at least one.
    pub fn validate(&mut self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(CipherError::Config("no namespace provided".to_string()));
        }
        if self.namespace.contains('*') {
            return Err(CipherError::Config(format!(
                "namespace '{}' must not contain '*'",
                self.namespace
            )));
        }
        if self.pool_size == 0 {
            self.pool_size = 1;
        }
        if self.resolver_timeout_ms == 0 {
            return Err(CipherError::Config(
                "resolver_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn instance_key(namespace: &str, nid: u64) -> String {
    format!("{}-{}", namespace, nid)
}
