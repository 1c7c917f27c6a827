//! Inbound dispatch: decode, resolve tenant, invoke handler.
//!
//! Both delivery paths end here. A message is processed in three steps and
//! stops at the first failure:
//!
//! 1. decode the envelope (malformed input is logged and dropped),
//! 2. resolve the tenant for the recipient (bounded by timeout/cancellation),
//! 3. look up the route and run the handler (a missing route is not an error).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::address::Address;
use crate::cancel::CancelToken;
use crate::envelope::{self, Payload, Recipient};
use crate::error::{CipherError, ErrorKind, ErrorSink};
use crate::instrument::{Instrument, LogSink, TracerId};
use crate::resolver::{resolve_bounded, TenantResolver};
use crate::routes::{RouteKind, RouteRegistry};
use crate::store::PubSubMessage;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion.
    Delivered { route: String },
    /// Decoded and resolved, but nothing is registered on the route.
    NoRoute { route: String },
    /// Dropped before reaching a handler.
    Dropped(ErrorKind),
    /// The handler panicked.
    HandlerPanicked { route: String },
    /// The instance shut down while the handler was still running.
    Aborted { route: String },
}

pub struct Dispatcher<R: TenantResolver> {
    resolver: R,
    broadcast_routes: RouteRegistry<R::Tenant>,
    transmit_routes: RouteRegistry<R::Tenant>,
    resolver_timeout: Duration,
    cancel: CancelToken,
    log: Arc<dyn LogSink>,
    errors: Arc<dyn ErrorSink>,
}

impl<R: TenantResolver> Dispatcher<R> {
    pub fn new(
        resolver: R,
        resolver_timeout: Duration,
        cancel: CancelToken,
        log: Arc<dyn LogSink>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            resolver,
            broadcast_routes: RouteRegistry::new(RouteKind::Broadcast),
            transmit_routes: RouteRegistry::new(RouteKind::Transmit),
            resolver_timeout,
            cancel,
            log,
            errors,
        }
    }

    pub fn routes(&self, kind: RouteKind) -> &RouteRegistry<R::Tenant> {
        match kind {
            RouteKind::Broadcast => &self.broadcast_routes,
            RouteKind::Transmit => &self.transmit_routes,
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Reports a failure that has no caller to return to.
    pub fn report(&self, err: &CipherError, context: &str) {
        self.errors.report(err, context);
    }

    /// Handles one pub/sub delivery. The channel is the full route key.
    pub async fn dispatch_broadcast(&self, msg: &PubSubMessage) -> DispatchOutcome {
        let ins = Instrument::new(&*self.log, "Cipher.recvSubMsg", TracerId::generate());
        let env = match envelope::deserialize(&msg.payload) {
            Ok(env) => env,
            Err(err) => {
                ins.error(
                    &msg.channel,
                    format!("Malformed subscription message on route {}: {}", msg.channel, err),
                );
                self.report(&err, &msg.channel);
                return DispatchOutcome::Dropped(ErrorKind::Decode);
            }
        };
        self.deliver(RouteKind::Broadcast, &msg.channel, env.origin, env.recipient, env.payload, &ins)
            .await
    }

    /// Handles one message popped from queue `key`. The route travels in `recipient.r`.
    pub async fn dispatch_queue(&self, key: &str, raw: &str) -> DispatchOutcome {
        let ins = Instrument::new(&*self.log, "Cipher.recvQueueMsg", TracerId::generate());
        let env = match envelope::deserialize(raw) {
            Ok(env) => env,
            Err(err) => {
                ins.error(key, format!("Malformed queue message on channel {}: {}", key, err));
                self.report(&err, key);
                return DispatchOutcome::Dropped(ErrorKind::Decode);
            }
        };
        let mut recipient = env.recipient;
        let route = match recipient.take_route() {
            Some(route) => route,
            None => {
                ins.warn(key, format!("Queue message on {} carries no route", key));
                String::new()
            }
        };
        self.deliver(RouteKind::Transmit, &route, env.origin, recipient, env.payload, &ins)
            .await
    }

    async fn deliver(
        &self,
        kind: RouteKind,
        route: &str,
        origin: Address,
        recipient: Recipient,
        payload: Payload,
        ins: &Instrument<'_>,
    ) -> DispatchOutcome {
        let tenant = match resolve_bounded(
            &self.resolver,
            &recipient,
            self.resolver_timeout,
            &self.cancel,
        )
        .await
        {
            Ok(tenant) => Arc::new(tenant),
            Err(err) => {
                ins.error(
                    route,
                    format!("Tenant resolution failed for {}.{}: {}", recipient.ns, recipient.nid, err),
                );
                self.report(&CipherError::Resolver(err), route);
                return DispatchOutcome::Dropped(ErrorKind::Resolver);
            }
        };

        let Some(handler) = self.routes(kind).lookup(route) else {
            debug!(kind = %kind, route, "no handler for message");
            return DispatchOutcome::NoRoute {
                route: route.to_string(),
            };
        };

        // Own task: a panic stays contained and shutdown can abort a stalled handler.
        let mut task = tokio::spawn(async move { handler.handle(origin, tenant, payload).await });
        let joined = tokio::select! {
            biased;
            joined = &mut task => joined,
            _ = self.cancel.cancelled() => {
                task.abort();
                ins.warn(route, format!("Handler for {} aborted by shutdown", route));
                return DispatchOutcome::Aborted {
                    route: route.to_string(),
                };
            }
        };
        match joined {
            Ok(()) => DispatchOutcome::Delivered {
                route: route.to_string(),
            },
            Err(join_err) => {
                error!(kind = %kind, route, error = %join_err, "route handler failed");
                ins.error(route, format!("Handler for {} failed: {}", route, join_err));
                self.report(
                    &CipherError::Handler {
                        route: route.to_string(),
                        reason: join_err.to_string(),
                    },
                    route,
                );
                DispatchOutcome::HandlerPanicked {
                    route: route.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Destination, NodeSelector};
    use crate::cancel::new_cancel_pair;
    use crate::envelope::{Delivery, Envelope};
    use crate::error::{CollectErrors, ResolverError};
    use crate::instrument::MemoryLogSink;
    use crate::resolver::{resolver_fn, NoTenant, UnconfiguredResolver};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Harness<R: TenantResolver> {
        dispatcher: Dispatcher<R>,
        errors: Arc<CollectErrors>,
        log: Arc<MemoryLogSink>,
        cancel: crate::cancel::CancelHandle,
    }

    fn harness<R: TenantResolver>(resolver: R) -> Harness<R> {
        let (token, handle) = new_cancel_pair();
        let errors = Arc::new(CollectErrors::new());
        let log = Arc::new(MemoryLogSink::new());
        Harness {
            dispatcher: Dispatcher::new(
                resolver,
                Duration::from_millis(50),
                token,
                log.clone(),
                errors.clone(),
            ),
            errors,
            log,
            cancel: handle,
        }
    }

    fn transmit_raw(route: &str, message: &str) -> String {
        let mut payload = Payload::new();
        payload.insert("message".to_string(), json!(message));
        let env = Envelope::build(
            Address::new("www", 1, None),
            route,
            payload,
            Destination::new().node(0),
            Delivery::Transmit,
        );
        envelope::serialize(&env).unwrap()
    }

    fn broadcast_msg(route: &str) -> PubSubMessage {
        let env = Envelope::build(
            Address::new("www", 1, None),
            route,
            Payload::new(),
            Destination::new(),
            Delivery::Broadcast,
        );
        PubSubMessage {
            pattern: "www.*".to_string(),
            channel: format!("www.{}", route),
            payload: envelope::serialize(&env).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_queue_message_reaches_handler() {
        let h = harness(NoTenant);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        h.dispatcher
            .routes(RouteKind::Transmit)
            .register(
                "www",
                "hello",
                Arc::new(move |origin: Address, _t: Arc<()>, payload: Payload| {
                    let s = s.clone();
                    async move {
                        s.lock().unwrap().push((origin, payload));
                    }
                }),
            )
            .unwrap();

        let outcome = h.dispatcher.dispatch_queue("www.0", &transmit_raw("hello", "hi")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Delivered {
                route: "www.hello".to_string()
            }
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Address::new("www", 1, None));
        assert_eq!(seen[0].1.get("message"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn test_resolver_sees_normalized_recipient() {
        let seen: Arc<Mutex<Option<Recipient>>> = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let h = harness(resolver_fn(move |r: Recipient| {
            *s.lock().unwrap() = Some(r);
            async { Ok::<_, ResolverError>(()) }
        }));
        h.dispatcher.dispatch_queue("www.0", &transmit_raw("hello", "hi")).await;
        let recipient = seen.lock().unwrap().clone().unwrap();
        assert!(recipient.r.is_none());
        assert_eq!(recipient.nid, NodeSelector::Node(0));
    }

    #[tokio::test]
    async fn test_malformed_queue_message_skips_resolver() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let h = harness(resolver_fn(move |_: Recipient| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ResolverError>(()) }
        }));
        let outcome = h.dispatcher.dispatch_queue("www.0", "{not json").await;
        assert_eq!(outcome, DispatchOutcome::Dropped(ErrorKind::Decode));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.errors.count(ErrorKind::Decode), 1);
        assert_eq!(h.log.records_for("Cipher.recvQueueMsg").len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_broadcast_dropped() {
        let h = harness(NoTenant);
        let outcome = h
            .dispatcher
            .dispatch_broadcast(&PubSubMessage {
                pattern: "www.*".to_string(),
                channel: "www.news".to_string(),
                payload: "garbage".to_string(),
            })
            .await;
        assert_eq!(outcome, DispatchOutcome::Dropped(ErrorKind::Decode));
        assert_eq!(h.errors.reports()[0].1, "www.news");
    }

    #[tokio::test]
    async fn test_missing_route_is_ignored() {
        let h = harness(NoTenant);
        let outcome = h.dispatcher.dispatch_broadcast(&broadcast_msg("news")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::NoRoute {
                route: "www.news".to_string()
            }
        );
        assert!(h.errors.reports().is_empty());
    }

    #[tokio::test]
    async fn test_resolver_failure_drops_message() {
        let h = harness(UnconfiguredResolver);
        let hits = Arc::new(AtomicUsize::new(0));
        let c = hits.clone();
        h.dispatcher
            .routes(RouteKind::Broadcast)
            .register(
                "www",
                "news",
                Arc::new(move |_: Address, _: Arc<()>, _: Payload| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
        let outcome = h.dispatcher.dispatch_broadcast(&broadcast_msg("news")).await;
        assert_eq!(outcome, DispatchOutcome::Dropped(ErrorKind::Resolver));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(h.errors.count(ErrorKind::Resolver), 1);
    }

    #[tokio::test]
    async fn test_resolver_timeout_drops_message() {
        let h = harness(resolver_fn(|_: Recipient| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ResolverError>(())
        }));
        let outcome = h.dispatcher.dispatch_queue("www.0", &transmit_raw("hello", "hi")).await;
        assert_eq!(outcome, DispatchOutcome::Dropped(ErrorKind::Resolver));
    }

    #[tokio::test]
    async fn test_tenant_passed_to_handler() {
        let h = harness(resolver_fn(|r: Recipient| async move {
            Ok::<_, ResolverError>(format!("tenant:{}", r.ns))
        }));
        let seen = Arc::new(Mutex::new(String::new()));
        let s = seen.clone();
        h.dispatcher
            .routes(RouteKind::Transmit)
            .register(
                "www",
                "hello",
                Arc::new(move |_: Address, tenant: Arc<String>, _: Payload| {
                    let s = s.clone();
                    async move {
                        *s.lock().unwrap() = (*tenant).clone();
                    }
                }),
            )
            .unwrap();
        h.dispatcher.dispatch_queue("www.0", &transmit_raw("hello", "hi")).await;
        assert_eq!(*seen.lock().unwrap(), "tenant:www");
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let h = harness(NoTenant);
        h.dispatcher
            .routes(RouteKind::Transmit)
            .register(
                "www",
                "boom",
                Arc::new(|_: Address, _: Arc<()>, _: Payload| async {
                    panic!("handler exploded");
                }),
            )
            .unwrap();
        let outcome = h.dispatcher.dispatch_queue("www.0", &transmit_raw("boom", "x")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::HandlerPanicked {
                route: "www.boom".to_string()
            }
        );
        assert_eq!(h.errors.count(ErrorKind::Handler), 1);
        assert_eq!(h.errors.reports()[0].1, "www.boom");
    }

    #[tokio::test]
    async fn test_stalled_handler_aborted_on_cancel() {
        let h = harness(NoTenant);
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        h.dispatcher
            .routes(RouteKind::Transmit)
            .register(
                "www",
                "hang",
                Arc::new(move |_: Address, _: Arc<()>, _: Payload| {
                    let s = s.clone();
                    async move {
                        s.fetch_add(1, Ordering::SeqCst);
                        std::future::pending::<()>().await;
                    }
                }),
            )
            .unwrap();

        let raw = transmit_raw("hang", "x");
        let (outcome, ()) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(h.dispatcher.dispatch_queue("www.0", &raw), async {
                while started.load(Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                h.cancel.cancel(crate::cancel::CancelReason::Shutdown);
            })
        })
        .await
        .expect("dispatch should return once cancelled");
        assert_eq!(
            outcome,
            DispatchOutcome::Aborted {
                route: "www.hang".to_string()
            }
        );
        assert!(h.errors.reports().is_empty());
    }
}
