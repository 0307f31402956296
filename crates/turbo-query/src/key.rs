//! Cache key normalization.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::CacheError;

/// The key a cache entry was requested with.
///
/// Structured keys are compared by their canonical JSON encoding, so
/// `{"a": 1, "b": 2}` and `{"b": 2, "a": 1}` address the same entry.
/// Anonymous keys are minted by the registry for callers that supply none
/// and are never shared between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKey {
    /// A caller-supplied key.
    Value(Value),
    /// A registry-minted key.
    Anonymous(String),
}

impl QueryKey {
    /// Create a key from any serializable value.
    pub fn new<K: Serialize + ?Sized>(key: &K) -> Result<Self, CacheError> {
        Ok(Self::Value(serde_json::to_value(key)?))
    }

    /// The normalized id for this key.
    ///
    /// Strings are used as-is; everything else is encoded as canonical JSON.
    pub fn id(&self) -> String {
        match self {
            Self::Value(Value::String(s)) => s.clone(),
            // serde_json maps are ordered by key, so this encoding is canonical.
            Self::Value(value) => value.to_string(),
            Self::Anonymous(id) => id.clone(),
        }
    }

    /// Whether the registry minted this key.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous(_))
    }

    /// The caller-supplied value, if any.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Anonymous(_) => None,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl From<&str> for QueryKey {
    fn from(key: &str) -> Self {
        Self::Value(Value::String(key.to_string()))
    }
}

impl From<String> for QueryKey {
    fn from(key: String) -> Self {
        Self::Value(Value::String(key))
    }
}

impl From<Value> for QueryKey {
    fn from(key: Value) -> Self {
        Self::Value(key)
    }
}

impl From<i64> for QueryKey {
    fn from(key: i64) -> Self {
        Self::Value(Value::from(key))
    }
}

impl From<u64> for QueryKey {
    fn from(key: u64) -> Self {
        Self::Value(Value::from(key))
    }
}

/// Options for looking up a cache entry.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Key to deduplicate on. `None` creates a fresh anonymous entry.
    pub key: Option<QueryKey>,
    /// Tags for group lookup and invalidation.
    pub tags: Vec<String>,
}

impl QueryOptions {
    /// Options without a key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for the given key.
    pub fn keyed(key: impl Into<QueryKey>) -> Self {
        Self::new().with_key(key)
    }

    /// Set the key.
    pub fn with_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add several tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_key_is_its_own_id() {
        let key = QueryKey::from("product:42");
        assert_eq!(key.id(), "product:42");
        assert_eq!(key.to_string(), "product:42");
    }

    #[test]
    fn test_structured_key_is_canonical() {
        let a = QueryKey::from(json!({"page": 2, "category": "shoes"}));
        let b = QueryKey::from(json!({"category": "shoes", "page": 2}));

        assert_eq!(a.id(), b.id());
        assert_eq!(a.id(), r#"{"category":"shoes","page":2}"#);
    }

    #[test]
    fn test_scalar_key_ids() {
        assert_eq!(QueryKey::from(42u64).id(), "42");
        assert_eq!(QueryKey::from("42").id(), "42");
        assert_eq!(QueryKey::new(&["42"]).unwrap().id(), r#"["42"]"#);
    }

    #[test]
    fn test_key_from_serializable() {
        #[derive(Serialize)]
        struct SearchKey<'a> {
            query: &'a str,
            page: u32,
        }

        let key = QueryKey::new(&SearchKey {
            query: "boots",
            page: 1,
        })
        .unwrap();

        assert_eq!(key.id(), r#"{"page":1,"query":"boots"}"#);
        assert!(!key.is_anonymous());
    }

    #[test]
    fn test_options_builder() {
        let options = QueryOptions::keyed("cart")
            .with_tag("user")
            .with_tags(["session", "checkout"]);

        assert_eq!(options.key, Some(QueryKey::from("cart")));
        assert_eq!(options.tags, vec!["user", "session", "checkout"]);
    }
}
