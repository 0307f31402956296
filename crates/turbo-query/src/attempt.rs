//! A single execution of an operation.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::deferred::{Abort, Deferred, Status};
use crate::outcome::{Outcome, Rejection};
use crate::signal::{CancelReason, CancelToken, ListenerId};
use crate::Data;

/// A type-erased operation function.
pub(crate) type OperationFn<I, T, E> =
    Arc<dyn Fn(I, CancelToken) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Called once when an attempt settles, with whether it settled by cancellation.
pub(crate) type SettleHook<I, T, E> = Box<dyn Fn(&Attempt<I, T, E>, bool) + Send + Sync>;

pub(crate) fn operation_fn<I, T, E, F, Fut>(operation: F) -> OperationFn<I, T, E>
where
    F: Fn(I, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Arc::new(move |input, token| operation(input, token).boxed())
}

static NEXT_ATTEMPT_ID: AtomicU64 = AtomicU64::new(1);

struct AttemptState<I> {
    input: Option<I>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cached: bool,
    /// The caller's token and our listener on it, dropped once settled.
    linked: Option<(CancelToken, ListenerId)>,
}

struct AttemptInner<I, T, E> {
    id: u64,
    operation: Option<OperationFn<I, T, E>>,
    token: CancelToken,
    deferred: Deferred<T, Rejection<E>>,
    state: Mutex<AttemptState<I>>,
    on_settled: Option<SettleHook<I, T, E>>,
}

impl<I, T, E> AttemptInner<I, T, E> {
    fn state(&self) -> MutexGuard<'_, AttemptState<I>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<I: Data, T: Data, E: Data> Abort for AttemptInner<I, T, E> {
    fn abort(&self, reason: CancelReason) {
        self.token.cancel(reason);
    }
}

/// One execution of an operation.
///
/// An attempt runs at most once and settles its [`Deferred`] exactly once.
/// Cancelling its token before it settles rejects the result with
/// [`Rejection::Cancelled`]; afterwards cancellation has no effect.
pub struct Attempt<I, T, E> {
    inner: Arc<AttemptInner<I, T, E>>,
}

impl<I: Data, T: Data, E: Data> Attempt<I, T, E> {
    /// Create an attempt that will run `operation` when started.
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn(I, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::fresh(operation_fn(operation), None)
    }

    /// Create an already-settled attempt from a serialized outcome.
    ///
    /// The attempt is marked as cached and never invokes an operation.
    pub fn restored(outcome: Outcome<I, T, E>) -> Self {
        Self::seeded(None, outcome, None)
    }

    pub(crate) fn fresh(
        operation: OperationFn<I, T, E>,
        on_settled: Option<SettleHook<I, T, E>>,
    ) -> Self {
        Self::build(
            Some(operation),
            on_settled,
            AttemptState {
                input: None,
                started_at: None,
                finished_at: None,
                cached: false,
                linked: None,
            },
        )
    }

    pub(crate) fn seeded(
        operation: Option<OperationFn<I, T, E>>,
        outcome: Outcome<I, T, E>,
        on_settled: Option<SettleHook<I, T, E>>,
    ) -> Self {
        let time = outcome.time.unwrap_or_else(Utc::now);
        let attempt = Self::build(
            operation,
            on_settled,
            AttemptState {
                input: outcome.input,
                started_at: Some(time),
                finished_at: Some(time),
                cached: true,
                linked: None,
            },
        );

        match Result::from(outcome.result) {
            Ok(value) => attempt.inner.deferred.resolve(value),
            Err(reason) => attempt.inner.deferred.reject(reason),
        };
        attempt
    }

    fn build(
        operation: Option<OperationFn<I, T, E>>,
        on_settled: Option<SettleHook<I, T, E>>,
        state: AttemptState<I>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<AttemptInner<I, T, E>>| {
            let owner: Weak<dyn Abort> = weak.clone();
            AttemptInner {
                id: NEXT_ATTEMPT_ID.fetch_add(1, Ordering::Relaxed),
                operation,
                token: CancelToken::new(),
                deferred: Deferred::with_owner(owner),
                state: Mutex::new(state),
                on_settled,
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.token.on_cancel(move |reason| {
            if let Some(inner) = weak.upgrade() {
                Attempt { inner }.settle(Err(Rejection::Cancelled(reason.clone())));
            }
        });

        Self { inner }
    }

    /// Start the attempt.
    ///
    /// Only the first call has any effect; later calls return the same
    /// result and ignore their arguments. A cancelled `signal` cancels the
    /// attempt, either immediately or whenever it is cancelled later.
    ///
    /// # Panics
    ///
    /// The operation is spawned onto the current Tokio runtime, so this
    /// panics when called outside of one.
    pub fn run(&self, input: I, signal: Option<&CancelToken>) -> Deferred<T, Rejection<E>> {
        {
            let mut state = self.inner.state();
            if state.started_at.is_some() {
                return self.deferred();
            }
            state.started_at = Some(Utc::now());
            state.input = Some(input.clone());
        }

        if let Some(signal) = signal {
            if let Some(reason) = signal.reason() {
                self.inner.token.cancel(reason);
                return self.deferred();
            }
            let listener = signal.link(&self.inner.token);
            let settled = {
                let mut state = self.inner.state();
                if self.inner.deferred.is_settled() {
                    true
                } else {
                    state.linked = Some((signal.clone(), listener));
                    false
                }
            };
            if settled {
                signal.remove_listener(listener);
            }
        }

        if self.inner.token.is_cancelled() {
            return self.deferred();
        }

        if let Some(operation) = self.inner.operation.clone() {
            tracing::trace!(attempt = self.inner.id, "starting attempt");
            self.spawn(operation, input);
        }

        self.deferred()
    }

    fn spawn(&self, operation: OperationFn<I, T, E>, input: I) {
        let attempt = self.clone();
        let token = self.inner.token.clone();

        tokio::spawn(async move {
            // The operation is invoked inside the task, so a panic while
            // building its future is caught here too.
            let result = AssertUnwindSafe(async move { operation(input, token).await })
                .catch_unwind()
                .await;

            let result = match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(Rejection::Failed(err)),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::debug!(attempt = attempt.inner.id, %message, "operation panicked");
                    Err(Rejection::Panicked(message))
                }
            };
            attempt.settle(result);
        });
    }

    fn settle(&self, result: Result<T, Rejection<E>>) {
        let cancelled = matches!(result, Err(Rejection::Cancelled(_)));
        let linked = {
            let mut state = self.inner.state();
            let settled = match result {
                Ok(value) => self.inner.deferred.resolve(value),
                Err(reason) => self.inner.deferred.reject(reason),
            };
            if !settled {
                return;
            }
            state.finished_at = Some(Utc::now());
            state.linked.take()
        };

        if let Some((signal, listener)) = linked {
            signal.remove_listener(listener);
        }

        if let Some(on_settled) = &self.inner.on_settled {
            on_settled(self, cancelled);
        }
    }

    /// Cancel the attempt. Rejects its result if it has not settled yet.
    pub fn abort(&self, reason: Option<CancelReason>) {
        self.inner.token.cancel(reason.unwrap_or_default());
    }

    /// The result produced by this attempt.
    pub fn deferred(&self) -> Deferred<T, Rejection<E>> {
        self.inner.deferred.clone()
    }

    /// The attempt's own cancellation token.
    pub fn token(&self) -> &CancelToken {
        &self.inner.token
    }

    /// Input the attempt was started with.
    pub fn input(&self) -> Option<I> {
        self.inner.state().input.clone()
    }

    /// Current status of the result.
    pub fn status(&self) -> Status {
        self.inner.deferred.status()
    }

    /// The resolved value, if any.
    pub fn value(&self) -> Option<T> {
        self.inner.deferred.value()
    }

    /// The rejection reason, if any.
    pub fn error(&self) -> Option<Rejection<E>> {
        self.inner.deferred.reason()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state().finished_at
    }

    /// When the attempt last changed state.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        let state = self.inner.state();
        state.finished_at.or(state.started_at)
    }

    /// Whether the attempt was seeded from serialized data.
    pub fn is_cached(&self) -> bool {
        self.inner.state().cached
    }

    /// Whether the attempt has been started (or seeded).
    pub fn is_started(&self) -> bool {
        self.inner.state().started_at.is_some()
    }

    /// Whether the attempt's token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Whether both handles refer to the same attempt.
    pub fn same_as(&self, other: &Attempt<I, T, E>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The settled outcome, or `None` while pending.
    pub fn serialize(&self) -> Option<Outcome<I, T, E>> {
        let state = self.inner.state();
        let result = self.inner.deferred.settlement().result()?;
        Some(Outcome {
            result: result.into(),
            input: state.input.clone(),
            time: state.finished_at.or(state.started_at),
        })
    }
}

impl<I, T, E> Clone for Attempt<I, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, T, E> fmt::Debug for Attempt<I, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attempt")
            .field("id", &self.inner.id)
            .field("status", &self.inner.deferred.status())
            .field("cancelled", &self.inner.token.is_cancelled())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
