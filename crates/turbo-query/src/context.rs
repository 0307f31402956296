//! Request-scoped access to a [`QueryCache`].
//!
//! A server renders each request against its own cache. Installing it with
//! [`QueryCache::scope`] lets code deep in the render tree reach it through
//! [`QueryCache::current`] without threading it through every call.

use std::future::Future;

use crate::error::CacheError;
use crate::registry::QueryCache;

tokio::task_local! {
    static CURRENT: QueryCache;
}

impl QueryCache {
    /// Run `future` with this cache installed as the current one.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT.scope(self.clone(), future).await
    }

    /// Run `f` with this cache installed as the current one.
    pub fn sync_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self.clone(), f)
    }

    /// The cache installed by the enclosing [`scope`](Self::scope).
    pub fn current() -> Result<QueryCache, CacheError> {
        CURRENT
            .try_with(QueryCache::clone)
            .map_err(|_| CacheError::MissingRegistry)
    }
}
