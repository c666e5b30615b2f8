//! Eviction Module
//!
//! Transactional cleanup pass: sweep expired entries, then trim the
//! least-recently-used entries while the running total sits at or above
//! the configured capacity. The whole pass commits or rolls back as one.

use rusqlite::{params, Connection, Transaction};
use tracing::debug;

use crate::config::CacheConfig;
use crate::storage::now_epoch_secs;

/// Per-pass result, consumed by the engine for counter and stats updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// Total bytes freed by the pass
    pub freed_bytes: i64,
    /// Entries removed because a TTL had elapsed
    pub expired_entries: u64,
    /// Entries removed by the capacity trim
    pub evicted_entries: u64,
}

/// Mirrors `expiry::is_valid`, inverted, as a set predicate: a per-entry
/// override wins over the global value for its dimension, an unset
/// dimension never expires, and the comparison is strict.
const EXPIRED_PREDICATE: &str = "
    (CASE
       WHEN TimeToLiveInSeconds IS NOT NULL THEN ?1 - CreatedUtc > TimeToLiveInSeconds
       WHEN ?2 IS NOT NULL THEN ?1 - CreatedUtc > ?2
       ELSE 0
     END)
    OR
    (CASE
       WHEN SlidingTimeToLiveInSeconds IS NOT NULL THEN ?1 - AccessUtc > SlidingTimeToLiveInSeconds
       WHEN ?3 IS NOT NULL THEN ?1 - AccessUtc > ?3
       ELSE 0
     END)";

// == Cleanup Pass ==
/// Removes expired entries, then trims LRU entries until the adjusted
/// total fits under the capacity bound. `current_total` is the caller's
/// running total at the start of the pass; the returned outcome reports
/// how much of it was freed.
pub fn cleanup(
    conn: &mut Connection,
    config: &CacheConfig,
    current_total: i64,
) -> rusqlite::Result<CleanupOutcome> {
    // One clock reading for the whole pass.
    let now = now_epoch_secs();

    let tx = conn.transaction()?;
    let mut outcome = CleanupOutcome::default();

    let (expired_bytes, expired_entries) = sweep_expired(&tx, config, now)?;
    outcome.freed_bytes += expired_bytes;
    outcome.expired_entries = expired_entries;

    if let Some(capacity) = config.max_capacity_bytes {
        let (evicted_bytes, evicted_entries) =
            trim_to_capacity(&tx, capacity, current_total - expired_bytes)?;
        outcome.freed_bytes += evicted_bytes;
        outcome.evicted_entries = evicted_entries;
    }

    tx.commit()?;

    if outcome.freed_bytes > 0 {
        debug!(
            "cleanup pass freed {} bytes ({} expired, {} evicted)",
            outcome.freed_bytes, outcome.expired_entries, outcome.evicted_entries
        );
    }
    Ok(outcome)
}

/// Deletes every entry whose effective fixed or sliding TTL has elapsed.
fn sweep_expired(
    tx: &Transaction<'_>,
    config: &CacheConfig,
    now: i64,
) -> rusqlite::Result<(i64, u64)> {
    let freed: i64 = tx.query_row(
        &format!(
            "SELECT COALESCE(SUM(SizeInBytes), 0) FROM Entries WHERE {}",
            EXPIRED_PREDICATE
        ),
        params![now, config.ttl_seconds, config.sliding_ttl_seconds],
        |row| row.get(0),
    )?;

    let removed = tx.execute(
        &format!("DELETE FROM Entries WHERE {}", EXPIRED_PREDICATE),
        params![now, config.ttl_seconds, config.sliding_ttl_seconds],
    )?;

    Ok((freed, removed as u64))
}

/// Deletes the least-recently-accessed half of the remaining entries,
/// repeating until the adjusted total drops under the capacity bound.
///
/// Halving keeps each batch cheap; iterating inside the same transaction
/// makes a single pass converge instead of leaving the store over
/// capacity for later passes. The rounded-up batch size means even a
/// single oversized entry gets evicted.
fn trim_to_capacity(
    tx: &Transaction<'_>,
    capacity: i64,
    mut total: i64,
) -> rusqlite::Result<(i64, u64)> {
    let mut freed = 0i64;
    let mut evicted = 0u64;

    while total >= capacity {
        let remaining: i64 =
            tx.query_row("SELECT COUNT(*) FROM Entries", [], |row| row.get(0))?;
        if remaining == 0 {
            break;
        }
        let batch = (remaining + 1) / 2;

        let batch_bytes: i64 = tx.query_row(
            "SELECT COALESCE(SUM(SizeInBytes), 0) FROM
               (SELECT SizeInBytes FROM Entries ORDER BY AccessUtc ASC, Key ASC LIMIT ?1)",
            params![batch],
            |row| row.get(0),
        )?;
        let removed = tx.execute(
            "DELETE FROM Entries WHERE Key IN
               (SELECT Key FROM Entries ORDER BY AccessUtc ASC, Key ASC LIMIT ?1)",
            params![batch],
        )?;

        freed += batch_bytes;
        evicted += removed as u64;
        total -= batch_bytes;
    }

    Ok((freed, evicted))
}
