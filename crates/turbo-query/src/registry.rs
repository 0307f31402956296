//! The keyed store of cache entries.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::attempt::operation_fn;
use crate::config::CacheConfig;
use crate::deferred::{Deferred, Status};
use crate::entry::{AnyEntry, CacheEntry, DynEntry};
use crate::error::CacheError;
use crate::key::{QueryKey, QueryOptions};
use crate::operation::Operation;
use crate::outcome::{Rejection, SerializedOutcome};
use crate::signal::{CancelReason, CancelToken};
use crate::Hydrate;

/// Selects entries for [`QueryCache::find`], [`filter`](QueryCache::filter)
/// and [`delete`](QueryCache::delete).
pub trait EntryPredicate {
    fn matches(&self, entry: &dyn AnyEntry) -> bool;
}

impl<F> EntryPredicate for F
where
    F: Fn(&dyn AnyEntry) -> bool,
{
    fn matches(&self, entry: &dyn AnyEntry) -> bool {
        self(entry)
    }
}

/// Declarative entry filter.
///
/// Every criterion that is set must match: the exact key, all of the tags,
/// and one of the statuses.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub key: Option<QueryKey>,
    pub tags: Vec<String>,
    pub status: Vec<Status>,
}

impl Filter {
    /// A filter matching every entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match entries with this key.
    pub fn key(mut self, key: impl Into<QueryKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Require a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Require several tags.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Allow a status. Several calls allow any of them.
    pub fn status(mut self, status: Status) -> Self {
        self.status.push(status);
        self
    }
}

impl EntryPredicate for Filter {
    fn matches(&self, entry: &dyn AnyEntry) -> bool {
        if let Some(key) = &self.key {
            if key.id() != entry.id() {
                return false;
            }
        }
        if !self.status.is_empty() && !self.status.contains(&entry.status()) {
            return false;
        }
        entry.has_tags(&self.tags)
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, DynEntry>,
    /// Entry ids in creation order.
    order: Vec<String>,
    restore: HashMap<String, SerializedOutcome>,
    next_anonymous: u64,
}

struct RegistryInner {
    config: CacheConfig,
    state: Mutex<RegistryState>,
}

/// A keyed store of cache entries with hydration support.
///
/// On the server, entries are created and fetched during rendering and
/// [`serialize`](Self::serialize)d at the end. On the client, a new cache
/// [`restore`](Self::restore)s that list before rendering, so entries with
/// matching keys start out settled instead of running again.
///
/// # Example
///
/// ```rust,ignore
/// let cache = QueryCache::new();
/// let product = cache.get(fetch_product, QueryOptions::keyed("product:42").with_tag("catalog"))?;
/// let details = product.fetch(42, None).await?;
///
/// let hydration = cache.to_json()?;
/// ```
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<RegistryInner>,
}

impl QueryCache {
    /// Create a cache with the default configuration.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a cache with the given configuration.
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the entry for `options.key`, creating it on first use.
    ///
    /// Later calls with the same key return the same entry and ignore their
    /// `operation` and tags. Without a key, a new anonymous entry is created
    /// on every call. A new entry whose id is in the restore table starts out
    /// settled with the restored outcome.
    pub fn get<I, T, E, F, Fut>(
        &self,
        operation: F,
        options: QueryOptions,
    ) -> Result<CacheEntry<I, T, E>, CacheError>
    where
        I: Hydrate,
        T: Hydrate,
        E: Hydrate,
        F: Fn(I, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut state = self.state();
        let key = match options.key {
            Some(key) => key,
            None => self.mint_key(&mut state),
        };
        let id = key.id();

        if let Some(existing) = state.entries.get(&id) {
            return existing
                .downcast::<I, T, E>()
                .ok_or_else(|| CacheError::TypeMismatch {
                    id,
                    expected: std::any::type_name::<CacheEntry<I, T, E>>(),
                });
        }

        // Minted keys are private to this cache, so they never pick up a
        // restored outcome.
        let record = if key.is_anonymous() {
            None
        } else {
            state.restore.get(&id)
        };
        let seed = match record {
            Some(outcome) => Some(outcome.decode::<I, T, E>()?),
            None => None,
        };
        if seed.is_some() {
            state.restore.remove(&id);
        }

        tracing::debug!(
            cache = %self.inner.config.name,
            %id,
            restored = seed.is_some(),
            "creating cache entry"
        );

        let operation = Operation::from_parts(operation_fn(operation), seed);
        let entry = CacheEntry::new(key, options.tags, operation);
        state.entries.insert(id.clone(), Arc::new(entry.clone()));
        state.order.push(id);

        Ok(entry)
    }

    /// Shorthand for `get(operation, options)?.fetch(input, signal)`.
    pub fn fetch<I, T, E, F, Fut>(
        &self,
        operation: F,
        options: QueryOptions,
        input: I,
        signal: Option<&CancelToken>,
    ) -> Result<Deferred<T, Rejection<E>>, CacheError>
    where
        I: Hydrate,
        T: Hydrate,
        E: Hydrate,
        F: Fn(I, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Ok(self.get(operation, options)?.fetch(input, signal))
    }

    fn mint_key(&self, state: &mut RegistryState) -> QueryKey {
        loop {
            let id = format!(
                "{}{}",
                self.inner.config.anonymous_key_prefix, state.next_anonymous
            );
            state.next_anonymous += 1;
            if !state.entries.contains_key(&id) && !state.restore.contains_key(&id) {
                return QueryKey::Anonymous(id);
            }
        }
    }

    fn snapshot(&self) -> Vec<DynEntry> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect()
    }

    /// All entries matching `predicate`, in creation order.
    pub fn filter<P: EntryPredicate>(&self, predicate: P) -> Vec<DynEntry> {
        self.snapshot()
            .into_iter()
            .filter(|entry| predicate.matches(entry.as_ref()))
            .collect()
    }

    /// The first entry matching `predicate`.
    pub fn find<P: EntryPredicate>(&self, predicate: P) -> Option<DynEntry> {
        self.snapshot()
            .into_iter()
            .find(|entry| predicate.matches(entry.as_ref()))
    }

    /// Remove all entries matching `predicate` and cancel their running
    /// attempts. Returns the number of entries removed.
    pub fn delete<P: EntryPredicate>(&self, predicate: P) -> usize {
        let matched = self.filter(predicate);

        let removed: Vec<DynEntry> = {
            let mut state = self.state();
            let removed: Vec<DynEntry> = matched
                .into_iter()
                .filter(|entry| {
                    state
                        .entries
                        .get(entry.id())
                        .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(entry)))
                })
                .collect();

            let ids: HashSet<String> = removed.iter().map(|entry| entry.id().to_string()).collect();
            state.order.retain(|id| !ids.contains(id));
            for id in &ids {
                state.entries.remove(id);
            }
            removed
        };

        self.cancel_removed(&removed);
        removed.len()
    }

    /// Remove and cancel every entry.
    pub fn clear(&self) {
        let removed: Vec<DynEntry> = {
            let mut state = self.state();
            let RegistryState { entries, order, .. } = &mut *state;
            let removed: Vec<DynEntry> = order
                .drain(..)
                .filter_map(|id| entries.remove(&id))
                .collect();
            entries.clear();
            removed
        };

        self.cancel_removed(&removed);
    }

    fn cancel_removed(&self, removed: &[DynEntry]) {
        for entry in removed {
            tracing::debug!(cache = %self.inner.config.name, id = entry.id(), "removing cache entry");
            entry.abort(Some(CancelReason::Removed));
        }
    }

    /// Merge serialized outcomes into the restore table.
    ///
    /// Only entries created afterwards are affected. Each record seeds at
    /// most one entry.
    pub fn restore<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, SerializedOutcome)>,
    {
        let mut state = self.state();
        let before = state.restore.len();
        state.restore.extend(entries);
        tracing::debug!(
            cache = %self.inner.config.name,
            restored = state.restore.len() - before,
            "restored outcomes"
        );
    }

    /// Restore from the JSON produced by [`to_json`](Self::to_json).
    pub fn restore_json(&self, json: &str) -> Result<(), CacheError> {
        let entries: Vec<(String, SerializedOutcome)> = serde_json::from_str(json)?;
        self.restore(entries);
        Ok(())
    }

    /// `(id, outcome)` pairs for every entry with a finished attempt.
    ///
    /// Entries that are still pending are omitted, as are rejections when
    /// [`CacheConfig::hydrate_rejections`] is off.
    pub fn serialize(&self) -> Result<Vec<(String, SerializedOutcome)>, CacheError> {
        let mut serialized = Vec::new();
        for entry in self.snapshot() {
            let Some(outcome) = entry.serialize_outcome()? else {
                continue;
            };
            if outcome.is_rejected() && !self.inner.config.hydrate_rejections {
                continue;
            }
            serialized.push((entry.id().to_string(), outcome));
        }

        tracing::debug!(
            cache = %self.inner.config.name,
            entries = serialized.len(),
            "serialized cache"
        );
        Ok(serialized)
    }

    /// [`serialize`](Self::serialize) as a JSON array of `[id, outcome]` pairs.
    pub fn to_json(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(&self.serialize()?)?)
    }

    /// Keys of live entries, in creation order.
    pub fn keys(&self) -> impl Iterator<Item = QueryKey> {
        self.snapshot().into_iter().map(|entry| entry.key().clone())
    }

    /// Live entries, in creation order.
    pub fn values(&self) -> impl Iterator<Item = DynEntry> {
        self.snapshot().into_iter()
    }

    /// `(key, entry)` pairs, in creation order.
    pub fn entries(&self) -> impl Iterator<Item = (QueryKey, DynEntry)> {
        self.snapshot()
            .into_iter()
            .map(|entry| (entry.key().clone(), entry))
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("QueryCache")
            .field("name", &self.inner.config.name)
            .field("entries", &state.entries.len())
            .field("restorable", &state.restore.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::operation::tests::{flush, Gates};
    use crate::outcome::Outcome;

    type Entry = CacheEntry<u32, u32, String>;

    fn get(cache: &QueryCache, gates: &Gates, options: QueryOptions) -> Entry {
        let gates = gates.clone();
        cache
            .get(move |input: u32, _token| gates.open(input), options)
            .unwrap()
    }

    async fn settle(gates: &Gates, entry: &Entry, input: u32, result: Result<u32, String>) {
        let deferred = entry.fetch(input, None);
        flush().await;
        gates.release(input, result);
        let _ = deferred.await;
    }

    // === Lookup ===

    #[test]
    fn test_get_dedups_by_key() {
        let cache = QueryCache::new();
        let gates = Gates::default();

        let first = get(&cache, &gates, QueryOptions::keyed("x").with_tag("a"));
        let second = get(&cache, &gates, QueryOptions::keyed("x").with_tag("b"));

        assert!(first.same_as(&second));
        assert_eq!(second.tags(), ["a".to_string()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_structured_keys_dedup_canonically() {
        let cache = QueryCache::new();
        let gates = Gates::default();

        let first = get(&cache, &gates, QueryOptions::keyed(json!({"a": 1, "b": 2})));
        let second = get(&cache, &gates, QueryOptions::keyed(json!({"b": 2, "a": 1})));

        assert!(first.same_as(&second));
    }

    #[test]
    fn test_anonymous_keys_never_collide() {
        let cache = QueryCache::new();
        let gates = Gates::default();

        let first = get(&cache, &gates, QueryOptions::new());
        let second = get(&cache, &gates, QueryOptions::new());

        assert!(!first.same_as(&second));
        assert!(first.key().is_anonymous());
        assert_ne!(first.id(), second.id());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_anonymous_key_skips_taken_ids() {
        let cache = QueryCache::with_config(CacheConfig::default().with_anonymous_key_prefix("anon-"));
        let gates = Gates::default();

        let explicit = get(&cache, &gates, QueryOptions::keyed("anon-0"));
        let anonymous = get(&cache, &gates, QueryOptions::new());

        assert!(!explicit.same_as(&anonymous));
        assert_eq!(anonymous.id(), "anon-1");
    }

    #[test]
    fn test_anonymous_get_ignores_restored_outcomes() {
        let cache = QueryCache::new();
        cache.restore(vec![
            ("$anonymous:0".to_string(), Outcome::resolved(json!(7)).with_input(json!(1))),
            ("$anonymous:1".to_string(), Outcome::resolved(json!(8)).with_input(json!(2))),
        ]);

        let unit = cache
            .get(
                |_: (), _token| async { Ok::<String, String>("fresh".to_string()) },
                QueryOptions::new(),
            )
            .unwrap();
        let gates = Gates::default();
        let typed = get(&cache, &gates, QueryOptions::new());

        for entry in [unit.id(), typed.id()] {
            assert_ne!(entry, "$anonymous:0");
            assert_ne!(entry, "$anonymous:1");
        }
        assert_eq!(unit.status(), Status::Pending);
        assert_eq!(typed.status(), Status::Pending);
        assert!(typed.value().is_none());
    }

    #[test]
    fn test_get_with_other_types_fails() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        get(&cache, &gates, QueryOptions::keyed("shared"));

        let result = cache.get(
            |_: (), _token| async { Ok::<String, String>("text".to_string()) },
            QueryOptions::keyed("shared"),
        );

        assert!(matches!(result, Err(CacheError::TypeMismatch { ref id, .. }) if id == "shared"));
    }

    #[tokio::test]
    async fn test_fetch_shorthand() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let deferred = cache
            .fetch(
                move |input: u32, _token| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<u32, String>(input + 1) }
                },
                QueryOptions::keyed("inc"),
                1,
                None,
            )
            .unwrap();

        assert_eq!(deferred.await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // === Queries ===

    #[tokio::test]
    async fn test_filter_by_tags_requires_all() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        get(&cache, &gates, QueryOptions::keyed("ab").with_tags(["a", "b"]));
        get(&cache, &gates, QueryOptions::keyed("a").with_tag("a"));
        get(&cache, &gates, QueryOptions::keyed("abc").with_tags(["c", "b", "a"]));

        let ids: Vec<String> = cache
            .filter(Filter::new().tags(["a", "b"]))
            .iter()
            .map(|entry| entry.id().to_string())
            .collect();

        assert_eq!(ids, vec!["ab", "abc"]);
    }

    #[tokio::test]
    async fn test_filter_by_status_and_key() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        let done = get(&cache, &gates, QueryOptions::keyed("done"));
        let failed = get(&cache, &gates, QueryOptions::keyed("failed"));
        get(&cache, &gates, QueryOptions::keyed("idle"));

        settle(&gates, &done, 1, Ok(1)).await;
        settle(&gates, &failed, 2, Err("nope".to_string())).await;

        let settled = cache.filter(
            Filter::new()
                .status(Status::Resolved)
                .status(Status::Rejected),
        );
        assert_eq!(settled.len(), 2);

        let found = cache.find(Filter::new().key("failed")).unwrap();
        assert_eq!(found.status(), Status::Rejected);

        assert!(cache.find(Filter::new().key("missing")).is_none());
    }

    #[test]
    fn test_closure_predicate() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        get(&cache, &gates, QueryOptions::keyed("product:1"));
        get(&cache, &gates, QueryOptions::keyed("cart"));

        let found = cache
            .find(|entry: &dyn AnyEntry| entry.id().starts_with("product:"))
            .unwrap();

        assert_eq!(found.id(), "product:1");
    }

    #[test]
    fn test_iteration_in_creation_order() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        for key in ["c", "a", "b"] {
            get(&cache, &gates, QueryOptions::keyed(key));
        }

        let keys: Vec<String> = cache.keys().map(|key| key.id()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);

        let values: Vec<String> = cache.values().map(|entry| entry.id().to_string()).collect();
        assert_eq!(values, keys);

        let (key, entry) = cache.entries().next().unwrap();
        assert_eq!(key, QueryKey::from("c"));
        assert_eq!(entry.id(), "c");
    }

    // === Removal ===

    #[tokio::test]
    async fn test_delete_aborts_running_attempt() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        let entry = get(&cache, &gates, QueryOptions::keyed("slow").with_tag("search"));
        get(&cache, &gates, QueryOptions::keyed("other"));

        let deferred = entry.fetch(1, None);
        let removed = cache.delete(Filter::new().tag("search"));

        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            deferred.await,
            Err(Rejection::Cancelled(CancelReason::Removed))
        );
    }

    #[tokio::test]
    async fn test_clear_aborts_everything() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        let first = get(&cache, &gates, QueryOptions::keyed("one"));
        let second = get(&cache, &gates, QueryOptions::keyed("two"));

        let a = first.fetch(1, None);
        let b = second.fetch(2, None);
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.keys().count(), 0);
        assert_eq!(a.reason(), Some(Rejection::Cancelled(CancelReason::Removed)));
        assert_eq!(b.reason(), Some(Rejection::Cancelled(CancelReason::Removed)));
    }

    #[test]
    fn test_get_after_delete_creates_new_entry() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        let before = get(&cache, &gates, QueryOptions::keyed("k"));

        cache.delete(Filter::new().key("k"));
        let after = get(&cache, &gates, QueryOptions::keyed("k"));

        assert!(!before.same_as(&after));
    }

    // === Hydration ===

    #[tokio::test]
    async fn test_serialize_omits_pending() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        let done = get(&cache, &gates, QueryOptions::keyed("done"));
        let running = get(&cache, &gates, QueryOptions::keyed("running"));
        get(&cache, &gates, QueryOptions::keyed("idle"));

        settle(&gates, &done, 4, Ok(40)).await;
        running.fetch(5, None);

        let serialized = cache.serialize().unwrap();

        assert_eq!(serialized.len(), 1);
        assert_eq!(serialized[0].0, "done");
        assert_eq!(serialized[0].1.value(), Some(&json!(40)));
        assert_eq!(serialized[0].1.input, Some(json!(4)));
    }

    #[tokio::test]
    async fn test_serialize_can_skip_rejections() {
        let cache = QueryCache::with_config(CacheConfig::default().with_hydrate_rejections(false));
        let gates = Gates::default();
        let failed = get(&cache, &gates, QueryOptions::keyed("failed"));
        let done = get(&cache, &gates, QueryOptions::keyed("done"));

        settle(&gates, &failed, 1, Err("offline".to_string())).await;
        settle(&gates, &done, 2, Ok(2)).await;

        let ids: Vec<String> = cache
            .serialize()
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["done"]);
    }

    #[tokio::test]
    async fn test_restore_seeds_new_entries_only() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        let existing = get(&cache, &gates, QueryOptions::keyed("existing"));

        cache.restore(vec![
            ("existing".to_string(), Outcome::resolved(json!(1))),
            ("fresh".to_string(), Outcome::resolved(json!(2)).with_input(json!(9))),
        ]);

        assert_eq!(existing.status(), Status::Pending);

        let fresh = get(&cache, &gates, QueryOptions::keyed("fresh"));
        assert_eq!(fresh.status(), Status::Resolved);
        assert_eq!(fresh.value(), Some(2));
        assert_eq!(fresh.input(), Some(9));

        flush().await;
        assert_eq!(gates.calls(), 0);
    }

    #[test]
    fn test_restore_with_wrong_types_fails() {
        let cache = QueryCache::new();
        let gates = Gates::default();
        cache.restore(vec![(
            "price".to_string(),
            Outcome::resolved(json!("not a number")),
        )]);

        let result = cache.get(
            move |input: u32, _token| gates.open(input),
            QueryOptions::keyed("price"),
        );

        assert!(matches!(result, Err(CacheError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let server = QueryCache::new();
        let gates = Gates::default();
        let entry = get(&server, &gates, QueryOptions::keyed(json!({"sku": "A-1"})));
        settle(&gates, &entry, 3, Ok(300)).await;

        let json = server.to_json().unwrap();

        let client = QueryCache::new();
        client.restore_json(&json).unwrap();
        let hydrated = get(&client, &gates, QueryOptions::keyed(json!({"sku": "A-1"})));

        assert_eq!(hydrated.value(), Some(300));
        assert!(hydrated.latest().is_cached());
        assert_eq!(client.to_json().unwrap(), json);
    }

    #[test]
    fn test_restore_json_rejects_garbage() {
        let cache = QueryCache::new();
        let err = cache.restore_json("{not json").unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
