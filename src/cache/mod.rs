//! Local image cache.
//!
//! Request handling and the refresh loop only talk to the [`CacheStore`]
//! trait.  [`DiskCache`] is the engine shipped with the node: content-addressed
//! files on disk with a background scanner that evicts least-recently-used
//! entries once the configured size limit is exceeded.

pub mod disk;

use anyhow::Result;
use bytes::Bytes;

pub use disk::DiskCache;

/// Operations the node needs from its cache engine.
///
/// Stored entries are immutable; `set` either publishes a complete blob or
/// nothing.  A failed `set` degrades to "served but not cached".
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up `key`.  The returned buffer may be shared with the engine.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a complete blob under `key`, replacing any previous entry.
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// New size ceiling in bytes.
    async fn update_cache_limit(&self, bytes: u64);

    /// New interval between eviction scans.
    async fn update_cache_scan_interval(&self, seconds: u64);

    /// New minimum age before a hit refreshes an entry's access time.
    async fn update_cache_refresh_age(&self, seconds: u64);

    /// Stop background work.  Further calls may fail.
    async fn close(&self);
}
