//! A running cipher instance and its builder.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::address::{queue_key, route_key, Address, Destination, TargetId};
use crate::broadcast::BroadcastTransport;
use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason};
use crate::config::CipherConfig;
use crate::dispatch::Dispatcher;
use crate::envelope::{self, Delivery, Envelope, Payload};
use crate::error::{CipherError, DiscardErrors, ErrorSink, Result};
use crate::instrument::{Instrument, LogSink, TracerId, TracingLogSink};
use crate::pool::{ConnectionPool, PoolManager};
use crate::resolver::{TenantResolver, UnconfiguredResolver};
use crate::routes::{RouteHandler, RouteKind, RouteOptions};
use crate::store::Store;
use crate::transmit::TransmitTransport;

/// Collects everything an instance needs before it connects.
pub struct CipherBuilder<R = UnconfiguredResolver> {
    config: CipherConfig,
    store: Arc<dyn Store>,
    resolver: R,
    log: Arc<dyn LogSink>,
    errors: Arc<dyn ErrorSink>,
}

impl CipherBuilder<UnconfiguredResolver> {
    pub fn new(config: CipherConfig, store: impl Store) -> Self {
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: CipherConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            resolver: UnconfiguredResolver,
            log: Arc::new(TracingLogSink),
            errors: Arc::new(DiscardErrors),
        }
    }
}

impl<R: TenantResolver> CipherBuilder<R> {
    pub fn config(&self) -> &CipherConfig {
        &self.config
    }

    /// Replaces the tenant resolver. Handlers registered later receive the
    /// new resolver's tenant type.
    pub fn resolver<R2: TenantResolver>(self, resolver: R2) -> CipherBuilder<R2> {
        CipherBuilder {
            config: self.config,
            store: self.store,
            resolver,
            log: self.log,
            errors: self.errors,
        }
    }

    pub fn log_sink(mut self, sink: impl LogSink) -> Self {
        self.log = Arc::new(sink);
        self
    }

    pub fn log_sink_arc(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log = sink;
        self
    }

    pub fn error_sink(mut self, sink: impl ErrorSink) -> Self {
        self.errors = Arc::new(sink);
        self
    }

    pub fn error_sink_arc(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.errors = sink;
        self
    }

    /// Validates the config, fills the pools and starts both transports.
    ///
    /// If any connection cannot be established the partially started
    /// instance is torn down and the transport error is returned.
    pub async fn build(self) -> Result<Cipher<R>> {
        let CipherBuilder {
            mut config,
            store,
            resolver,
            log,
            errors,
        } = self;
        config.validate()?;

        let (token, cancel) = new_cancel_pair();
        let manager = Arc::new(PoolManager::new(
            store,
            config.connection.clone(),
            config.auth.clone(),
            config.retry.clone(),
            errors.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            resolver,
            Duration::from_millis(config.resolver_timeout_ms),
            token.clone(),
            log.clone(),
            errors,
        ));

        let outgoing = Arc::new(ConnectionPool::new(format!("{} (outgoing)", config.namespace)));
        let started = async {
            manager.fill(&outgoing, config.pool_size).await?;
            let (broadcast, mut tasks) = BroadcastTransport::start(
                &config.namespace,
                config.pool_size,
                outgoing.clone(),
                manager.clone(),
                dispatcher.clone(),
                token.clone(),
            )
            .await?;
            let (transmit, consumers) = TransmitTransport::start(
                &config.namespace,
                config.nid,
                config.pool_size,
                outgoing.clone(),
                manager.clone(),
                dispatcher.clone(),
                token.clone(),
            )
            .await?;
            tasks.extend(consumers);
            Ok::<_, CipherError>((broadcast, transmit, tasks))
        }
        .await;

        let (broadcast, transmit, tasks) = match started {
            Ok(parts) => parts,
            Err(err) => {
                cancel.cancel(CancelReason::Shutdown);
                return Err(err);
            }
        };

        let cipher = Cipher {
            address: Address::new(config.namespace.clone(), config.nid, None),
            config,
            broadcast,
            transmit,
            dispatcher,
            log,
            cancel,
            tasks: Mutex::new(tasks),
        };
        Instrument::new(&*cipher.log, "Cipher.init", TracerId::generate()).info(
            &cipher.address.queue_key(),
            format!("Cipher is running at {}", cipher.address),
        );
        Ok(cipher)
    }
}

/// One node on the bus: an address, two transports and two route registries.
pub struct Cipher<R: TenantResolver = UnconfiguredResolver> {
    config: CipherConfig,
    address: Address,
    broadcast: BroadcastTransport,
    transmit: TransmitTransport,
    dispatcher: Arc<Dispatcher<R>>,
    log: Arc<dyn LogSink>,
    cancel: CancelHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cipher<UnconfiguredResolver> {
    pub fn builder(config: CipherConfig, store: impl Store) -> CipherBuilder<UnconfiguredResolver> {
        CipherBuilder::new(config, store)
    }
}

impl<R: TenantResolver> Cipher<R> {
    pub fn namespace(&self) -> &str {
        &self.address.ns
    }

    pub fn nid(&self) -> u64 {
        self.address.nid
    }

    pub fn config(&self) -> &CipherConfig {
        &self.config
    }

    pub fn resolver(&self) -> &R {
        self.dispatcher.resolver()
    }

    /// This instance's address, optionally narrowed to a target.
    pub fn address(&self, tid: Option<TargetId>) -> Address {
        Address {
            tid,
            ..self.address.clone()
        }
    }

    /// Queue keys consumed by this instance.
    pub fn queue_keys(&self) -> Vec<String> {
        self.transmit.queue_keys()
    }

    pub fn subscription_pattern(&self) -> &str {
        self.broadcast.pattern()
    }

    /// Publishes `payload` on `route` to every subscriber in the target
    /// namespace. Failures are logged and reported, never returned.
    pub async fn broadcast(
        &self,
        route: &str,
        payload: Payload,
        destination: Destination,
        tid: Option<TargetId>,
    ) -> TracerId {
        self.broadcast_traced(route, payload, destination, tid, TracerId::generate())
            .await
    }

    pub async fn broadcast_traced(
        &self,
        route: &str,
        payload: Payload,
        destination: Destination,
        tid: Option<TargetId>,
        tracer_id: TracerId,
    ) -> TracerId {
        let ins = Instrument::new(&*self.log, "Cipher.broadcast", tracer_id);
        let env = Envelope::build(self.address(tid), route, payload, destination, Delivery::Broadcast);
        let channel = route_key(&env.recipient.ns, route);

        let raw = match envelope::serialize(&env) {
            Ok(raw) => raw,
            Err(err) => {
                ins.error(&channel, format!("Could not encode message for {}: {}", channel, err));
                self.dispatcher.report(&err, &channel);
                return tracer_id;
            }
        };
        match self.broadcast.publish(&channel, &raw).await {
            Ok(receivers) => ins.info(
                &channel,
                format!("Publishing message on channel {} ({} receivers)", channel, receivers),
            ),
            Err(err) => {
                ins.error(&channel, format!("Publish on {} failed: {}", channel, err));
                self.dispatcher.report(&CipherError::Transport(err), &channel);
            }
        }
        tracer_id
    }

    /// Pushes `payload` onto the queue of the target node. Exactly one
    /// consumer of that queue will receive it. Failures are logged and
    /// reported, never returned.
    pub async fn transmit(
        &self,
        route: &str,
        payload: Payload,
        destination: Destination,
        tid: Option<TargetId>,
    ) -> TracerId {
        self.transmit_traced(route, payload, destination, tid, TracerId::generate())
            .await
    }

    pub async fn transmit_traced(
        &self,
        route: &str,
        payload: Payload,
        destination: Destination,
        tid: Option<TargetId>,
        tracer_id: TracerId,
    ) -> TracerId {
        let ins = Instrument::new(&*self.log, "Cipher.transmit", tracer_id);
        let env = Envelope::build(self.address(tid), route, payload, destination, Delivery::Transmit);
        let key = queue_key(&env.recipient.ns, env.recipient.nid);

        let raw = match envelope::serialize(&env) {
            Ok(raw) => raw,
            Err(err) => {
                ins.error(&key, format!("Could not encode message for {}: {}", key, err));
                self.dispatcher.report(&err, &key);
                return tracer_id;
            }
        };
        match self.transmit.push(&key, &raw).await {
            Ok(len) => ins.info(
                &key,
                format!("Transmitting message on channel {} (queue length {})", key, len),
            ),
            Err(err) => {
                ins.error(&key, format!("Push to {} failed: {}", key, err));
                self.dispatcher.report(&CipherError::Transport(err), &key);
            }
        }
        tracer_id
    }

    /// Registers `handler` for broadcasts on `name`. Returns the full route key.
    pub fn on_broadcast<F, Fut>(&self, name: &str, handler: F, opts: RouteOptions) -> Result<String>
    where
        F: Fn(Address, Arc<R::Tenant>, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(RouteKind::Broadcast, name, Arc::new(handler), opts)
    }

    /// Registers `handler` for point-to-point messages on `name`. Returns the
    /// full route key.
    pub fn on_transmit<F, Fut>(&self, name: &str, handler: F, opts: RouteOptions) -> Result<String>
    where
        F: Fn(Address, Arc<R::Tenant>, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(RouteKind::Transmit, name, Arc::new(handler), opts)
    }

    /// Registers a handler object, for handlers that carry their own state.
    pub fn register(
        &self,
        kind: RouteKind,
        name: &str,
        handler: Arc<dyn RouteHandler<R::Tenant>>,
        opts: RouteOptions,
    ) -> Result<String> {
        let block = match kind {
            RouteKind::Broadcast => "Cipher.onBroadcast",
            RouteKind::Transmit => "Cipher.onTransmit",
        };
        let ins = Instrument::new(&*self.log, block, TracerId::generate());
        let namespace = opts.namespace.as_deref().unwrap_or(&self.address.ns);

        match self.dispatcher.routes(kind).register(namespace, name, handler) {
            Ok(key) => {
                ins.info(&key, format!("Registered {} handler for {}", kind, key));
                Ok(key)
            }
            Err(err) => {
                ins.error(&route_key(namespace, name), err.to_string());
                Err(err)
            }
        }
    }

    /// Registered route keys of one kind, sorted.
    pub fn routes(&self, kind: RouteKind) -> Vec<String> {
        self.dispatcher.routes(kind).keys()
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops every listener and consumer and waits for them to exit.
    /// Handlers still running when shutdown starts are aborted. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel(CancelReason::Shutdown);
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let stopped = tasks.len();
        for task in tasks {
            if let Err(err) = task.await {
                debug!(error = %err, "background task ended abnormally");
            }
        }
        if stopped > 0 {
            info!(address = %self.address, tasks = stopped, "cipher instance shut down");
        }
    }
}

impl<R: TenantResolver> Drop for Cipher<R> {
    fn drop(&mut self) {
        self.cancel.cancel(CancelReason::Shutdown);
    }
}
