//! Tenant resolution hook.
//!
//! Before a handler runs, the instance asks its [`TenantResolver`] for the
//! context belonging to the message's recipient. Resolution may do I/O; it is
//! bounded by a timeout and by the instance's cancellation token, and only the
//! message being resolved waits on it.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::envelope::Recipient;
use crate::error::ResolverError;

#[async_trait]
pub trait TenantResolver: Send + Sync + 'static {
    type Tenant: Send + Sync + 'static;

    async fn resolve(&self, recipient: &Recipient) -> Result<Self::Tenant, ResolverError>;
}

/// Default resolver: every lookup fails until a real one is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredResolver;

#[async_trait]
impl TenantResolver for UnconfiguredResolver {
    type Tenant = ();

    async fn resolve(&self, _recipient: &Recipient) -> Result<(), ResolverError> {
        Err(ResolverError::NotConfigured)
    }
}

/// Resolver that succeeds with `()` for every recipient.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTenant;

#[async_trait]
impl TenantResolver for NoTenant {
    type Tenant = ();

    async fn resolve(&self, _recipient: &Recipient) -> Result<(), ResolverError> {
        Ok(())
    }
}

/// Adapts an async closure into a resolver. See [`resolver_fn`].
pub struct FnResolver<F, T> {
    f: F,
    _tenant: PhantomData<fn() -> T>,
}

/// Builds a resolver from `Fn(Recipient) -> impl Future<Output = Result<T, ResolverError>>`.
pub fn resolver_fn<F, Fut, T>(f: F) -> FnResolver<F, T>
where
    F: Fn(Recipient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResolverError>> + Send + 'static,
    T: Send + Sync + 'static,
{
    FnResolver {
        f,
        _tenant: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> TenantResolver for FnResolver<F, T>
where
    F: Fn(Recipient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResolverError>> + Send + 'static,
    T: Send + Sync + 'static,
{
    type Tenant = T;

    async fn resolve(&self, recipient: &Recipient) -> Result<T, ResolverError> {
        (self.f)(recipient.clone()).await
    }
}

/// Runs one resolution bounded by `timeout` and `cancel`.
pub async fn resolve_bounded<R: TenantResolver + ?Sized>(
    resolver: &R,
    recipient: &Recipient,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<R::Tenant, ResolverError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ResolverError::Cancelled),
        outcome = tokio::time::timeout(timeout, resolver.resolve(recipient)) => match outcome {
            Ok(result) => result,
            Err(_) => Err(ResolverError::TimedOut {
                timeout_ms: timeout.as_millis() as u64,
            }),
        },
    }
}
