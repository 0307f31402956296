//! Keyed, tagged operation handles.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::Serialize;

use crate::deferred::Status;
use crate::error::CacheError;
use crate::key::QueryKey;
use crate::operation::Operation;
use crate::outcome::{Outcome, SerializedOutcome};
use crate::signal::CancelReason;
use crate::Data;

struct EntryInner<I, T, E> {
    id: String,
    key: QueryKey,
    tags: Vec<String>,
    operation: Operation<I, T, E>,
}

/// An [`Operation`] bound to a cache key and tags.
///
/// Dereferences to the operation, so `fetch`, `status`, `value` and friends
/// are available directly.
pub struct CacheEntry<I, T, E> {
    inner: Arc<EntryInner<I, T, E>>,
}

impl<I: Data, T: Data, E: Data> CacheEntry<I, T, E> {
    pub(crate) fn new(key: QueryKey, tags: Vec<String>, operation: Operation<I, T, E>) -> Self {
        Self {
            inner: Arc::new(EntryInner {
                id: key.id(),
                key,
                tags,
                operation,
            }),
        }
    }

    /// Normalized id of the key.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The key as originally requested.
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    pub fn tags(&self) -> &[String] {
        &self.inner.tags
    }

    /// The underlying operation handle.
    pub fn operation(&self) -> &Operation<I, T, E> {
        &self.inner.operation
    }

    /// The finished outcome paired with this entry's id.
    pub fn serialize(&self) -> Option<(String, Outcome<I, T, E>)> {
        let outcome = self.inner.operation.serialize()?;
        Some((self.inner.id.clone(), outcome))
    }

    /// Whether both handles refer to the same entry.
    pub fn same_as(&self, other: &CacheEntry<I, T, E>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<I, T, E> Deref for CacheEntry<I, T, E> {
    type Target = Operation<I, T, E>;

    fn deref(&self) -> &Self::Target {
        &self.inner.operation
    }
}

impl<I, T, E> Clone for CacheEntry<I, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: Data, T: Data, E: Data> fmt::Debug for CacheEntry<I, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.inner.id)
            .field("tags", &self.inner.tags)
            .field("status", &self.inner.operation.status())
            .finish()
    }
}

/// A cache entry with its operation types erased.
///
/// This is what the registry stores and what lookups return. Use
/// [`downcast`](dyn AnyEntry::downcast) to get the typed entry back.
pub trait AnyEntry: Send + Sync {
    fn id(&self) -> &str;

    fn key(&self) -> &QueryKey;

    fn tags(&self) -> &[String];

    /// Status of the latest attempt.
    fn status(&self) -> Status;

    fn is_running(&self) -> bool;

    fn has_finished(&self) -> bool;

    /// Cancel the running attempt, if any.
    fn abort(&self, reason: Option<CancelReason>);

    /// The finished outcome in its type-erased wire form.
    fn serialize_outcome(&self) -> Result<Option<SerializedOutcome>, CacheError>;

    /// Name of the concrete entry type, for diagnostics.
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

/// A shared, type-erased cache entry.
pub type DynEntry = Arc<dyn AnyEntry>;

impl<'a> dyn AnyEntry + 'a {
    /// Recover the typed entry, if `I`, `T` and `E` match.
    pub fn downcast<I, T, E>(&self) -> Option<CacheEntry<I, T, E>>
    where
        I: 'static,
        T: 'static,
        E: 'static,
    {
        self.as_any().downcast_ref::<CacheEntry<I, T, E>>().cloned()
    }

    /// Whether the entry carries every tag in `tags`.
    pub fn has_tags<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter()
            .all(|tag| self.tags().iter().any(|own| own == tag.as_ref()))
    }
}

impl fmt::Debug for dyn AnyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyEntry")
            .field("id", &self.id())
            .field("tags", &self.tags())
            .field("status", &self.status())
            .finish()
    }
}

impl<I, T, E> AnyEntry for CacheEntry<I, T, E>
where
    I: Data + Serialize,
    T: Data + Serialize,
    E: Data + Serialize,
{
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    fn tags(&self) -> &[String] {
        &self.inner.tags
    }

    fn status(&self) -> Status {
        self.inner.operation.status()
    }

    fn is_running(&self) -> bool {
        self.inner.operation.is_running()
    }

    fn has_finished(&self) -> bool {
        self.inner.operation.has_finished()
    }

    fn abort(&self, reason: Option<CancelReason>) {
        self.inner.operation.abort(reason);
    }

    fn serialize_outcome(&self) -> Result<Option<SerializedOutcome>, CacheError> {
        match self.inner.operation.serialize() {
            Some(outcome) => Ok(Some(outcome.erase()?)),
            None => Ok(None),
        }
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
