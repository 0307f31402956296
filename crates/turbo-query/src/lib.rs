//! Asynchronous operation cache for the TurboCommerce storefront.
//!
//! This crate provides:
//! - `Deferred` - Externally settled, awaitable result slot
//! - `Attempt` - One execution of an operation, with cancellation
//! - `Operation` - Stable handle that supersedes stale attempts
//! - `CacheEntry` - Operation handle bound to a key and tags
//! - `QueryCache` - Keyed registry with server-to-client hydration
//!
//! # Example
//!
//! ```ignore
//! use turbo_query::{QueryCache, QueryOptions};
//!
//! // Server: fetch during render, then ship the outcomes
//! let cache = QueryCache::new();
//! let reviews = cache.get(load_reviews, QueryOptions::keyed("reviews:42").with_tag("product"))?;
//! reviews.fetch(42, None).await?;
//! let payload = cache.to_json()?;
//!
//! // Client: restore before rendering; the entry starts resolved
//! let cache = QueryCache::new();
//! cache.restore_json(&payload)?;
//! let reviews = cache.get(load_reviews, QueryOptions::keyed("reviews:42"))?;
//! assert!(reviews.value().is_some());
//! ```

mod attempt;
mod config;
mod context;
mod deferred;
mod entry;
mod error;
mod key;
mod operation;
mod outcome;
mod registry;
mod signal;

pub use attempt::*;
pub use config::*;
pub use deferred::*;
pub use entry::*;
pub use error::*;
pub use key::*;
pub use operation::*;
pub use outcome::*;
pub use registry::*;
pub use signal::*;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bounds shared by operation inputs, values and errors.
pub trait Data: Clone + Send + Sync + 'static {}

impl<D: Clone + Send + Sync + 'static> Data for D {}

/// [`Data`] that can also travel in a hydration payload.
pub trait Hydrate: Data + Serialize + DeserializeOwned {}

impl<D: Data + Serialize + DeserializeOwned> Hydrate for D {}
