//! Awaitable results with synchronously readable settlement state.

use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::signal::CancelReason;

/// Settlement status of a deferred result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Resolved,
    /// Settled with a reason.
    Rejected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Current state of a deferred result.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement<T, E> {
    Pending,
    Resolved(T),
    Rejected(E),
}

impl<T, E> Settlement<T, E> {
    /// The status of this settlement.
    pub fn status(&self) -> Status {
        match self {
            Self::Pending => Status::Pending,
            Self::Resolved(_) => Status::Resolved,
            Self::Rejected(_) => Status::Rejected,
        }
    }

    /// Whether this settlement is still pending.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl<T: Clone, E: Clone> Settlement<T, E> {
    /// The outcome as a `Result`, or `None` while pending.
    pub fn result(&self) -> Option<Result<T, E>> {
        match self {
            Self::Pending => None,
            Self::Resolved(value) => Some(Ok(value.clone())),
            Self::Rejected(reason) => Some(Err(reason.clone())),
        }
    }
}

/// Something a deferred result can ask to stop producing it.
pub(crate) trait Abort: Send + Sync {
    fn abort(&self, reason: CancelReason);
}

/// A single-shot asynchronous result.
///
/// `status`, `value` and `reason` can be read at any time without awaiting.
/// The handle itself can be awaited (or [`wait`](Self::wait)ed on) to get
/// the outcome once it settles. Clones share the same settlement.
pub struct Deferred<T, E> {
    state: Arc<watch::Sender<Settlement<T, E>>>,
    owner: Option<Weak<dyn Abort>>,
}

impl<T, E> Deferred<T, E> {
    /// Create a pending result with no owner.
    pub fn new() -> Self {
        let (state, _) = watch::channel(Settlement::Pending);
        Self {
            state: Arc::new(state),
            owner: None,
        }
    }

    pub(crate) fn with_owner(owner: Weak<dyn Abort>) -> Self {
        Self {
            owner: Some(owner),
            ..Self::new()
        }
    }

    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Resolved(value))
    }

    /// Settle with a reason. Returns `false` if already settled.
    pub fn reject(&self, reason: E) -> bool {
        self.settle(Settlement::Rejected(reason))
    }

    fn settle(&self, settlement: Settlement<T, E>) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_pending() {
                *current = settlement;
                true
            } else {
                false
            }
        })
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.state.borrow().status()
    }

    /// Whether the result is still pending.
    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    /// Whether the result has settled either way.
    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// Ask the attempt producing this result to stop.
    ///
    /// Returns `false` for results without a live owner.
    pub fn abort(&self, reason: CancelReason) -> bool {
        match self.owner.as_ref().and_then(Weak::upgrade) {
            Some(owner) => {
                owner.abort(reason);
                true
            }
            None => false,
        }
    }

    /// Whether both handles refer to the same result.
    pub fn same_as(&self, other: &Deferred<T, E>) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl<T: Clone, E: Clone> Deferred<T, E> {
    /// The resolved value, if any.
    pub fn value(&self) -> Option<T> {
        match &*self.state.borrow() {
            Settlement::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The rejection reason, if any.
    pub fn reason(&self) -> Option<E> {
        match &*self.state.borrow() {
            Settlement::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// A snapshot of the settlement state.
    pub fn settlement(&self) -> Settlement<T, E> {
        self.state.borrow().clone()
    }

    /// Wait for the result to settle.
    pub async fn wait(&self) -> Result<T, E> {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|state| !state.is_pending()).await {
            Ok(state) => state.result(),
            Err(_) => None,
        };

        match settled {
            Some(result) => result,
            // The sender lives in `self`, so the channel cannot close while we wait.
            None => std::future::pending().await,
        }
    }
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            owner: self.owner.clone(),
        }
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("status", &self.status())
            .finish()
    }
}

impl<T, E> IntoFuture for Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = BoxFuture<'static, Result<T, E>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}
