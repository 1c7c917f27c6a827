//! Error types for the cipher routing layer.
//!
//! Failures on the send path and during construction are returned as
//! [`CipherError`]. Failures that happen asynchronously on the receive path
//! (decode, transport, resolver) have no caller to return to, so they are
//! reported through an injectable [`ErrorSink`] in addition to being logged.

use std::sync::Mutex;

use thiserror::Error;

use crate::routes::RouteKind;

/// Failures talking to the backing store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection pool is empty")]
    EmptyPool,

    #[error("store operation {op} failed: {reason}")]
    OperationFailed { op: &'static str, reason: String },
}

/// Failures reported by a tenant resolver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("no tenant resolver has been configured")]
    NotConfigured,

    #[error("tenant lookup failed: {0}")]
    Failed(String),

    #[error("tenant lookup timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("tenant lookup cancelled")]
    Cancelled,
}

impl ResolverError {
    /// Convenience constructor for resolver implementations.
    pub fn failed(reason: impl Into<String>) -> Self {
        ResolverError::Failed(reason.into())
    }
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("handler already registered for {kind} route '{route}'")]
    DuplicateRoute { kind: RouteKind, route: String },

    #[error("malformed envelope: {reason}")]
    Decode { reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error("cipher instance {key} has not been initialized")]
    NotInitialized { key: String },

    #[error("handler for route '{route}' failed: {reason}")]
    Handler { route: String, reason: String },
}

impl CipherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CipherError::Config(_) => ErrorKind::Config,
            CipherError::DuplicateRoute { .. } => ErrorKind::DuplicateRoute,
            CipherError::Decode { .. } => ErrorKind::Decode,
            CipherError::Transport(_) => ErrorKind::Transport,
            CipherError::Resolver(_) => ErrorKind::Resolver,
            CipherError::NotInitialized { .. } => ErrorKind::NotInitialized,
            CipherError::Handler { .. } => ErrorKind::Handler,
        }
    }
}

impl From<serde_json::Error> for CipherError {
    fn from(err: serde_json::Error) -> Self {
        CipherError::Decode {
            reason: err.to_string(),
        }
    }
}

/// Coarse classification of a [`CipherError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    DuplicateRoute,
    Decode,
    Transport,
    Resolver,
    NotInitialized,
    Handler,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::DuplicateRoute => write!(f, "duplicate_route"),
            ErrorKind::Decode => write!(f, "decode"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Resolver => write!(f, "resolver"),
            ErrorKind::NotInitialized => write!(f, "not_initialized"),
            ErrorKind::Handler => write!(f, "handler"),
        }
    }
}

pub type Result<T> = std::result::Result<T, CipherError>;

/// Receives failures that cannot be returned to a caller.
///
/// Implementations must be cheap; they are invoked inline on the receive path.
pub trait ErrorSink: Send + Sync + 'static {
    /// Report a failure. `context` names the queue key or channel involved.
    fn report(&self, error: &CipherError, context: &str);
}

/// Sink that ignores everything. Failures are still logged by the instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardErrors;

impl ErrorSink for DiscardErrors {
    fn report(&self, _error: &CipherError, _context: &str) {}
}

impl<F> ErrorSink for F
where
    F: Fn(&CipherError, &str) + Send + Sync + 'static,
{
    fn report(&self, error: &CipherError, context: &str) {
        self(error, context)
    }
}

/// Sink that records the kind and context of every report.
#[derive(Debug, Default)]
pub struct CollectErrors {
    seen: Mutex<Vec<(ErrorKind, String)>>,
}

impl CollectErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn reports(&self) -> Vec<(ErrorKind, String)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.reports().iter().filter(|(k, _)| *k == kind).count()
    }
}

impl ErrorSink for CollectErrors {
    fn report(&self, error: &CipherError, context: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((error.kind(), context.to_string()));
        }
    }
}
