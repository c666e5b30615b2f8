//! Configuration Module
//!
//! Plain value objects for the global cache configuration and the
//! optional per-entry overrides.

use serde::{Deserialize, Serialize};

/// Global cache configuration.
///
/// A value of `None` disables the corresponding policy. The active
/// configuration is persisted in the cache's metadata row and reloaded
/// when the cache is reopened without an explicit configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum total payload size in bytes before LRU eviction kicks in
    pub max_capacity_bytes: Option<i64>,
    /// Fixed TTL in seconds, measured from an entry's creation time
    pub ttl_seconds: Option<i64>,
    /// Sliding TTL in seconds, measured from an entry's last access
    pub sliding_ttl_seconds: Option<i64>,
}

/// Per-entry TTL overrides supplied alongside a single save.
///
/// An override supersedes the global configuration for that dimension
/// only; the other dimension keeps falling back to the global value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Fixed TTL in seconds for this entry
    pub ttl_seconds: Option<i64>,
    /// Sliding TTL in seconds for this entry
    pub sliding_ttl_seconds: Option<i64>,
}
