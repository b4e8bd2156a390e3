//! Two-tier read-through cache
//!
//! Reads go to an eventually consistent local index first. A miss, or an
//! index that has not synced yet, falls back to a live point read against
//! the source of truth. Staleness is never resolved by blocking.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// Outcome of a local index lookup
#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup<T> {
    /// The index holds a value for the key
    Hit(T),
    /// The index is synced and holds no value for the key
    Miss,
    /// The index cannot answer (not synced, or stopped)
    Unavailable,
}

/// Eventually consistent local index
pub trait LocalIndex<T>: Send + Sync {
    /// Look up `key` without touching the network
    fn get(&self, key: &str) -> CacheLookup<T>;
}

/// Source of truth used when the local index cannot answer
#[async_trait]
pub trait LiveSource<T>: Send + Sync {
    /// Point read by `key`, `Ok(None)` when the object does not exist
    async fn live_get(&self, key: &str) -> Result<Option<T>>;
}

/// Where a read-through result came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadSource {
    /// Served by the local index
    Index,
    /// Served by a live read
    Live,
}

/// Read-through cache over a local index and a live source
///
/// The index and the live source may be keyed differently: tokens are
/// indexed by secret digest and read live by name.
pub struct ReadThrough<T> {
    kind: &'static str,
    index: Arc<dyn LocalIndex<T>>,
    live: Arc<dyn LiveSource<T>>,
}

impl<T> Clone for ReadThrough<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            index: self.index.clone(),
            live: self.live.clone(),
        }
    }
}

impl<T: Send + 'static> ReadThrough<T> {
    /// Create a read-through cache for resources of `kind`
    pub fn new(
        kind: &'static str,
        index: Arc<dyn LocalIndex<T>>,
        live: Arc<dyn LiveSource<T>>,
    ) -> Self {
        Self { kind, index, live }
    }

    /// Read `index_key` from the index, falling back to `live_key` on the live source
    pub async fn get(&self, index_key: &str, live_key: &str) -> Result<Option<T>> {
        Ok(self
            .get_with_source(index_key, live_key)
            .await?
            .map(|(value, _)| value))
    }

    /// Like [`ReadThrough::get`] but also reports which tier answered
    pub async fn get_with_source(
        &self,
        index_key: &str,
        live_key: &str,
    ) -> Result<Option<(T, ReadSource)>> {
        match self.index.get(index_key) {
            CacheLookup::Hit(value) => return Ok(Some((value, ReadSource::Index))),
            CacheLookup::Miss => {
                debug!(kind = self.kind, key = %live_key, "index miss, falling back to live read");
            }
            CacheLookup::Unavailable => {
                debug!(kind = self.kind, key = %live_key, "index unavailable, falling back to live read");
            }
        }
        let value = self.live.live_get(live_key).await?;
        Ok(value.map(|v| (v, ReadSource::Live)))
    }
}
