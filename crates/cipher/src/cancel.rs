//! Cooperative cancellation for an instance's background tasks.
//!
//! A [`CancelHandle`] is held by the instance; every subscription listener,
//! queue consumer and in-flight tenant lookup holds a [`CancelToken`] and
//! stops at its next suspension point once the handle fires.

use std::sync::Arc;

use tokio::sync::watch;

/// Reasons for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// The owning instance is shutting down.
    #[default]
    Shutdown,
    /// Explicit user cancellation.
    UserRequested,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::UserRequested => write!(f, "UserRequested"),
        }
    }
}

/// A cheap, cloneable, awaitable cancellation token.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been triggered.
    ///
    /// Also resolves if the handle was dropped, since nothing can cancel or
    /// keep alive the work after that.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }
}

/// The handle that triggers cancellation.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    /// Trigger cancellation. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Another token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let (tx, rx) = watch::channel(None);
    (CancelToken { rx }, CancelHandle { tx: Arc::new(tx) })
}
