//! Long-lived handles for logical operations.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};

use crate::attempt::{operation_fn, Attempt, OperationFn, SettleHook};
use crate::deferred::{Deferred, Status};
use crate::outcome::{Outcome, Rejection};
use crate::signal::{CancelReason, CancelToken};
use crate::Data;

struct OperationState<I, T, E> {
    initial: Attempt<I, T, E>,
    running: Option<Attempt<I, T, E>>,
    finished: Option<Attempt<I, T, E>>,
}

struct OperationInner<I, T, E> {
    operation: OperationFn<I, T, E>,
    this: Weak<OperationInner<I, T, E>>,
    state: Mutex<OperationState<I, T, E>>,
}

impl<I: Data, T: Data, E: Data> OperationInner<I, T, E> {
    fn state(&self) -> MutexGuard<'_, OperationState<I, T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle_hook(this: Weak<Self>) -> SettleHook<I, T, E> {
        Box::new(move |attempt: &Attempt<I, T, E>, cancelled: bool| {
            if let Some(inner) = this.upgrade() {
                inner.finalize(attempt, cancelled);
            }
        })
    }

    /// `cancelled` reflects how the attempt settled. Its token may have been
    /// cancelled since, by a `fetch` racing the settlement.
    fn finalize(&self, attempt: &Attempt<I, T, E>, cancelled: bool) {
        let mut state = self.state();
        if !cancelled {
            state.finished = Some(attempt.clone());
        }
        if state
            .running
            .as_ref()
            .is_some_and(|running| running.same_as(attempt))
        {
            state.running = None;
        }
    }
}

/// The stable identity of a logical operation across repeated runs.
///
/// At most one attempt is running at a time: starting a new one cancels the
/// previous running attempt with [`CancelReason::Superseded`]. The cancelled
/// operation is not stopped forcibly, but its outcome never becomes the
/// handle's finished result.
///
/// All projections (`status`, `value`, `error`, timestamps) read the
/// *latest* attempt: the running one, else the last finished one, else the
/// initial one.
pub struct Operation<I, T, E> {
    inner: Arc<OperationInner<I, T, E>>,
}

impl<I: Data, T: Data, E: Data> Operation<I, T, E> {
    /// Create a handle for `operation`.
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn(I, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_parts(operation_fn(operation), None)
    }

    /// Create a handle whose initial attempt is seeded from `outcome`.
    ///
    /// The seeded attempt also counts as the finished attempt.
    pub fn restored<F, Fut>(operation: F, outcome: Outcome<I, T, E>) -> Self
    where
        F: Fn(I, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_parts(operation_fn(operation), Some(outcome))
    }

    pub(crate) fn from_parts(
        operation: OperationFn<I, T, E>,
        seed: Option<Outcome<I, T, E>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<OperationInner<I, T, E>>| {
            let hook = OperationInner::settle_hook(this.clone());
            let (initial, finished) = match seed {
                Some(outcome) => {
                    let initial = Attempt::seeded(Some(operation.clone()), outcome, Some(hook));
                    (initial.clone(), Some(initial))
                }
                None => (Attempt::fresh(operation.clone(), Some(hook)), None),
            };

            OperationInner {
                operation,
                this: this.clone(),
                state: Mutex::new(OperationState {
                    initial,
                    running: None,
                    finished,
                }),
            }
        });

        Self { inner }
    }

    /// Start a new run with `input`.
    ///
    /// Uses the initial attempt if it has never run, otherwise a new one.
    /// Whatever attempt was running before is cancelled, without waiting
    /// for it. Returns the new attempt's result.
    pub fn fetch(&self, input: I, signal: Option<&CancelToken>) -> Deferred<T, Rejection<E>> {
        let (attempt, previous) = {
            let mut state = self.inner.state();
            let attempt = if !state.initial.is_started() && !state.initial.is_cancelled() {
                state.initial.clone()
            } else {
                Attempt::fresh(
                    self.inner.operation.clone(),
                    Some(OperationInner::settle_hook(self.inner.this.clone())),
                )
            };
            let previous = state.running.replace(attempt.clone());
            (attempt, previous)
        };

        let deferred = attempt.run(input, signal);

        if let Some(previous) = previous {
            tracing::trace!(?previous, "superseding running attempt");
            previous.abort(Some(CancelReason::Superseded));
        }

        deferred
    }

    /// Alias for [`fetch`](Self::fetch).
    pub fn run(&self, input: I, signal: Option<&CancelToken>) -> Deferred<T, Rejection<E>> {
        self.fetch(input, signal)
    }

    /// Run again with the input of the latest attempt.
    ///
    /// Falls back to `I::default()` if nothing has run yet.
    pub fn refetch(&self, signal: Option<&CancelToken>) -> Deferred<T, Rejection<E>>
    where
        I: Default,
    {
        let input = self.latest().input().unwrap_or_default();
        self.fetch(input, signal)
    }

    /// Cancel the running attempt, if any.
    pub fn abort(&self, reason: Option<CancelReason>) {
        let running = self.inner.state().running.clone();
        if let Some(running) = running {
            running.abort(reason);
        }
    }

    /// The running attempt, else the finished one, else the initial one.
    pub fn latest(&self) -> Attempt<I, T, E> {
        let state = self.inner.state();
        state
            .running
            .as_ref()
            .or(state.finished.as_ref())
            .unwrap_or(&state.initial)
            .clone()
    }

    pub fn initial(&self) -> Attempt<I, T, E> {
        self.inner.state().initial.clone()
    }

    pub fn running(&self) -> Option<Attempt<I, T, E>> {
        self.inner.state().running.clone()
    }

    /// The most recently settled attempt that was not cancelled.
    pub fn finished(&self) -> Option<Attempt<I, T, E>> {
        self.inner.state().finished.clone()
    }

    /// Result of the latest attempt.
    pub fn deferred(&self) -> Deferred<T, Rejection<E>> {
        self.latest().deferred()
    }

    pub fn status(&self) -> Status {
        self.latest().status()
    }

    pub fn value(&self) -> Option<T> {
        self.latest().value()
    }

    /// Alias for [`value`](Self::value).
    pub fn data(&self) -> Option<T> {
        self.value()
    }

    pub fn error(&self) -> Option<Rejection<E>> {
        self.latest().error()
    }

    pub fn input(&self) -> Option<I> {
        self.latest().input()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().running.is_some()
    }

    pub fn has_finished(&self) -> bool {
        self.inner.state().finished.is_some()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.latest().started_at()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.latest().finished_at()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.latest().updated_at()
    }

    /// Outcome of the finished attempt, if any.
    pub fn serialize(&self) -> Option<Outcome<I, T, E>> {
        self.finished()?.serialize()
    }

    /// Whether both handles refer to the same operation.
    pub fn same_as(&self, other: &Operation<I, T, E>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<I, T, E> Clone for Operation<I, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: Data, T: Data, E: Data> fmt::Debug for Operation<I, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Operation")
            .field("running", &state.running)
            .field("finished", &state.finished)
            .finish()
    }
}
