//! Cipher: addressed message routing over a shared pub/sub and list store.
//!
//! An instance is addressed as `(namespace, node id)` and offers two delivery
//! modes. `broadcast` publishes to every instance in a namespace; `transmit`
//! pushes onto a per-node queue so that exactly one consumer receives it.
//! Incoming messages are decoded, a tenant is resolved for the recipient and
//! the handler registered on the route runs with that tenant.

pub mod address;
pub mod broadcast;
pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod instance;
pub mod instrument;
pub mod pool;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod routes;
pub mod store;
pub mod transmit;

pub use address::{Address, Destination, NodeSelector, TargetId, WILDCARD};
pub use config::{AuthConfig, CipherConfig, ConnectionConfig};
pub use dispatch::DispatchOutcome;
pub use envelope::{Envelope, Payload, Recipient};
pub use error::{
    CipherError, CollectErrors, DiscardErrors, ErrorKind, ErrorSink, ResolverError, Result,
    TransportError,
};
pub use instance::{Cipher, CipherBuilder};
pub use instrument::{init_tracing, LogLevel, LogRecord, LogSink, MemoryLogSink, TracerId, TracingLogSink};
pub use registry::CipherRegistry;
pub use resolver::{resolver_fn, NoTenant, TenantResolver, UnconfiguredResolver};
pub use retry::RetryConfig;
pub use routes::{RouteHandler, RouteKind, RouteOptions};
pub use store::{MemoryStore, Store, StoreConnection};
#[cfg(feature = "redis")]
pub use store::RedisStore;
