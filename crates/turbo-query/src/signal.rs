//! Cancellation tokens carrying a reason.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Why an operation was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Cancelled without a more specific reason.
    #[default]
    Aborted,
    /// A newer attempt of the same operation took over.
    Superseded,
    /// The owning cache entry was deleted or cleared.
    Removed,
    /// Caller-supplied reason.
    Message(String),
}

impl CancelReason {
    /// Create a reason from a custom message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => write!(f, "aborted"),
            Self::Superseded => write!(f, "superseded"),
            Self::Removed => write!(f, "removed"),
            Self::Message(message) => write!(f, "{}", message),
        }
    }
}

type Listener = Box<dyn FnOnce(&CancelReason) + Send>;

/// Identifies a listener registered with [`CancelToken::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct TokenState {
    reason: Option<CancelReason>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

#[derive(Default)]
struct TokenInner {
    token: CancellationToken,
    state: Mutex<TokenState>,
}

/// A cloneable cancellation token.
///
/// Cancelling is single-shot: the first reason wins and later calls are
/// ignored. Clones observe the same cancellation.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token.
    ///
    /// Returns `false` if it was already cancelled. Registered listeners run
    /// on the calling thread before this returns.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let listeners = {
            let mut state = self.state();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.listeners)
        };

        self.inner.token.cancel();
        for (_, listener) in listeners {
            listener(&reason);
        }
        true
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state().reason.is_some()
    }

    /// The cancellation reason, if cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.state().reason.clone()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Run `listener` once the token is cancelled.
    ///
    /// Runs immediately if the token is already cancelled.
    pub fn on_cancel<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce(&CancelReason) + Send + 'static,
    {
        let (id, reason) = {
            let mut state = self.state();
            let id = ListenerId(state.next_listener);
            state.next_listener += 1;
            match &state.reason {
                Some(reason) => (id, reason.clone()),
                None => {
                    state.listeners.push((id, Box::new(listener)));
                    return id;
                }
            }
        };
        listener(&reason);
        id
    }

    /// Drop a listener that has not run yet.
    pub fn remove_listener(&self, id: ListenerId) {
        self.state().listeners.retain(|(listener, _)| *listener != id);
    }

    /// Propagate cancellation of this token into `other`, one way only.
    ///
    /// The returned id unlinks the tokens through
    /// [`remove_listener`](Self::remove_listener).
    pub fn link(&self, other: &CancelToken) -> ListenerId {
        let other = other.clone();
        self.on_cancel(move |reason| {
            other.cancel(reason.clone());
        })
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    /// Whether both handles refer to the same token.
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_new_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_first_reason_wins() {
        let token = CancelToken::new();

        assert!(token.cancel(CancelReason::Superseded));
        assert!(!token.cancel(CancelReason::Removed));

        assert_eq!(token.reason(), Some(CancelReason::Superseded));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();

        clone.cancel(CancelReason::Aborted);

        assert!(token.is_cancelled());
        assert!(token.same_as(&clone));
    }

    #[test]
    fn test_listener_runs_once() {
        let token = CancelToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        token.on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel(CancelReason::Aborted);
        token.cancel(CancelReason::Aborted);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_on_cancelled_token_runs_immediately() {
        let token = CancelToken::new();
        token.cancel(CancelReason::message("gone"));

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        token.on_cancel(move |reason| {
            *slot.lock().unwrap() = Some(reason.clone());
        });

        assert_eq!(*seen.lock().unwrap(), Some(CancelReason::message("gone")));
    }

    #[test]
    fn test_link_is_one_directional() {
        let parent = CancelToken::new();
        let child = CancelToken::new();
        parent.link(&child);

        let other_parent = CancelToken::new();
        let other_child = CancelToken::new();
        other_parent.link(&other_child);

        other_child.cancel(CancelReason::Aborted);
        assert!(!other_parent.is_cancelled());

        parent.cancel(CancelReason::message("stop"));
        assert_eq!(child.reason(), Some(CancelReason::message("stop")));
    }

    #[test]
    fn test_removed_listener_never_runs() {
        let token = CancelToken::new();
        let child = CancelToken::new();

        let id = token.link(&child);
        assert_eq!(token.listener_count(), 1);

        token.remove_listener(id);
        assert_eq!(token.listener_count(), 0);

        token.cancel(CancelReason::Aborted);
        assert!(!child.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_completes() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel(CancelReason::Aborted);

        handle.await.unwrap();
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&CancelReason::Superseded).unwrap();
        assert_eq!(json, r#""superseded""#);

        let custom: CancelReason = serde_json::from_str(r#"{"message":"timeout"}"#).unwrap();
        assert_eq!(custom, CancelReason::message("timeout"));
        assert_eq!(custom.to_string(), "timeout");
    }
}
