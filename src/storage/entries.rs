//! Entry Store Module
//!
//! Row-level operations on the entry table. Every function here runs on
//! a leased connection inside a blocking task; mutating sequences are
//! wrapped in one transaction so same-key races cannot observe partial
//! state or lose size updates.

use rusqlite::{params, Connection, OptionalExtension};

use crate::cache::expiry;
use crate::config::{CacheConfig, EntryConfig};

/// Result of a [`retrieve`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveOutcome {
    /// The stored payload, when the entry exists and is still valid
    pub value: Option<Vec<u8>>,
    /// Bytes freed by deleting an expired entry during the read
    pub freed_bytes: i64,
}

// == Upsert ==
/// Inserts a new entry or replaces an existing one.
///
/// On replace, the value, size, and access time are overwritten while the
/// creation time is preserved; the per-entry TTL columns are rewritten
/// only when `entry_config` is supplied, so an earlier override sticks
/// until the caller provides a new one.
///
/// Returns the row's size before this write (0 for a new entry) so the
/// caller can apply `new_size - previous_size` to its running total.
pub fn upsert(
    conn: &mut Connection,
    key: &str,
    value: &[u8],
    entry_config: Option<&EntryConfig>,
    now: i64,
) -> rusqlite::Result<i64> {
    let size = value.len() as i64;

    let tx = conn.transaction()?;
    let previous: Option<i64> = tx
        .query_row(
            "SELECT SizeInBytes FROM Entries WHERE Key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    match entry_config {
        Some(config) => {
            tx.execute(
                "INSERT INTO Entries (Key, Value, SizeInBytes, AccessUtc, CreatedUtc,
                                      TimeToLiveInSeconds, SlidingTimeToLiveInSeconds)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)
                 ON CONFLICT(Key) DO UPDATE SET
                   Value = excluded.Value,
                   SizeInBytes = excluded.SizeInBytes,
                   AccessUtc = excluded.AccessUtc,
                   TimeToLiveInSeconds = excluded.TimeToLiveInSeconds,
                   SlidingTimeToLiveInSeconds = excluded.SlidingTimeToLiveInSeconds",
                params![
                    key,
                    value,
                    size,
                    now,
                    config.ttl_seconds,
                    config.sliding_ttl_seconds
                ],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO Entries (Key, Value, SizeInBytes, AccessUtc, CreatedUtc)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(Key) DO UPDATE SET
                   Value = excluded.Value,
                   SizeInBytes = excluded.SizeInBytes,
                   AccessUtc = excluded.AccessUtc",
                params![key, value, size, now],
            )?;
        }
    }

    tx.commit()?;
    Ok(previous.unwrap_or(0))
}

// == Retrieve ==
/// Reads an entry and renews its sliding window.
///
/// An entry that fails the expiration check is deleted on the spot; its
/// freed size is reported so the caller can adjust the running total.
/// Read, validity decision, and delete-or-touch run in one transaction.
pub fn retrieve(
    conn: &mut Connection,
    key: &str,
    config: &CacheConfig,
    now: i64,
) -> rusqlite::Result<RetrieveOutcome> {
    let tx = conn.transaction()?;

    let row: Option<(Vec<u8>, i64, i64, i64, Option<i64>, Option<i64>)> = tx
        .query_row(
            "SELECT Value, SizeInBytes, CreatedUtc, AccessUtc,
                    TimeToLiveInSeconds, SlidingTimeToLiveInSeconds
             FROM Entries WHERE Key = ?1",
            params![key],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;

    let Some((value, size, created, accessed, ttl, sliding_ttl)) = row else {
        return Ok(RetrieveOutcome {
            value: None,
            freed_bytes: 0,
        });
    };

    if !expiry::is_valid(now, created, accessed, ttl, sliding_ttl, config) {
        tx.execute("DELETE FROM Entries WHERE Key = ?1", params![key])?;
        tx.commit()?;
        return Ok(RetrieveOutcome {
            value: None,
            freed_bytes: size,
        });
    }

    tx.execute(
        "UPDATE Entries SET AccessUtc = ?1 WHERE Key = ?2",
        params![now, key],
    )?;
    tx.commit()?;

    Ok(RetrieveOutcome {
        value: Some(value),
        freed_bytes: 0,
    })
}

// == Remove ==
/// Deletes an entry, returning its freed size, or `None` when the key
/// did not exist.
pub fn remove(conn: &mut Connection, key: &str) -> rusqlite::Result<Option<i64>> {
    let tx = conn.transaction()?;
    let size: Option<i64> = tx
        .query_row(
            "SELECT SizeInBytes FROM Entries WHERE Key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    if size.is_some() {
        tx.execute("DELETE FROM Entries WHERE Key = ?1", params![key])?;
    }
    tx.commit()?;
    Ok(size)
}

// == Total Size ==
/// Sums the durable size of all entries; used once at initialization to
/// seed the in-memory running total.
pub fn total_size(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(SizeInBytes), 0) FROM Entries",
        [],
        |row| row.get(0),
    )
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        schema::ensure_schema(&mut conn).unwrap();
        conn
    }

    fn created_utc(conn: &Connection, key: &str) -> i64 {
        conn.query_row(
            "SELECT CreatedUtc FROM Entries WHERE Key = ?1",
            params![key],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_upsert_new_entry_reports_zero_previous_size() {
        let mut conn = test_conn();

        let previous = upsert(&mut conn, "k", b"hello", None, 100).unwrap();
        assert_eq!(previous, 0);
        assert_eq!(total_size(&conn).unwrap(), 5);
    }

    #[test]
    fn test_upsert_replace_reports_previous_size_and_keeps_created() {
        let mut conn = test_conn();

        upsert(&mut conn, "k", b"hello", None, 100).unwrap();
        let previous = upsert(&mut conn, "k", b"hi", None, 200).unwrap();

        assert_eq!(previous, 5);
        assert_eq!(total_size(&conn).unwrap(), 2);
        assert_eq!(created_utc(&conn, "k"), 100);

        let accessed: i64 = conn
            .query_row("SELECT AccessUtc FROM Entries WHERE Key = 'k'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(accessed, 200);
    }

    #[test]
    fn test_upsert_without_config_keeps_existing_override() {
        let mut conn = test_conn();

        let override_config = EntryConfig {
            ttl_seconds: Some(7),
            sliding_ttl_seconds: None,
        };
        upsert(&mut conn, "k", b"a", Some(&override_config), 100).unwrap();
        upsert(&mut conn, "k", b"bb", None, 200).unwrap();

        let ttl: Option<i64> = conn
            .query_row(
                "SELECT TimeToLiveInSeconds FROM Entries WHERE Key = 'k'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(ttl, Some(7));
    }

    #[test]
    fn test_upsert_with_config_rewrites_both_override_columns() {
        let mut conn = test_conn();

        let first = EntryConfig {
            ttl_seconds: Some(7),
            sliding_ttl_seconds: Some(3),
        };
        upsert(&mut conn, "k", b"a", Some(&first), 100).unwrap();

        // An explicit empty config clears the stored overrides.
        upsert(&mut conn, "k", b"a", Some(&EntryConfig::default()), 200).unwrap();

        let (ttl, sliding): (Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT TimeToLiveInSeconds, SlidingTimeToLiveInSeconds FROM Entries WHERE Key = 'k'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(ttl, None);
        assert_eq!(sliding, None);
    }

    #[test]
    fn test_retrieve_missing_key() {
        let mut conn = test_conn();

        let outcome = retrieve(&mut conn, "missing", &CacheConfig::default(), 100).unwrap();
        assert_eq!(outcome.value, None);
        assert_eq!(outcome.freed_bytes, 0);
    }

    #[test]
    fn test_retrieve_touches_access_time() {
        let mut conn = test_conn();

        upsert(&mut conn, "k", b"hello", None, 100).unwrap();
        let outcome = retrieve(&mut conn, "k", &CacheConfig::default(), 150).unwrap();
        assert_eq!(outcome.value.as_deref(), Some(b"hello".as_slice()));

        let accessed: i64 = conn
            .query_row("SELECT AccessUtc FROM Entries WHERE Key = 'k'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(accessed, 150);
    }

    #[test]
    fn test_retrieve_deletes_expired_entry_and_reports_freed_bytes() {
        let mut conn = test_conn();
        let config = CacheConfig {
            ttl_seconds: Some(10),
            ..CacheConfig::default()
        };

        upsert(&mut conn, "k", b"hello", None, 100).unwrap();
        let outcome = retrieve(&mut conn, "k", &config, 111).unwrap();

        assert_eq!(outcome.value, None);
        assert_eq!(outcome.freed_bytes, 5);
        assert_eq!(total_size(&conn).unwrap(), 0);
    }

    #[test]
    fn test_remove_existing_and_missing() {
        let mut conn = test_conn();

        upsert(&mut conn, "k", b"hello", None, 100).unwrap();
        assert_eq!(remove(&mut conn, "k").unwrap(), Some(5));
        assert_eq!(remove(&mut conn, "k").unwrap(), None);
        assert_eq!(total_size(&conn).unwrap(), 0);
    }
}
