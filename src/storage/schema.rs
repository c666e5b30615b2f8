//! Schema Module
//!
//! Creates or migrates the on-disk schema. Migrations are additive and
//! forward-only; there is no downgrade path.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::config::CacheConfig;

/// Current schema version.
///
/// v1 created the base tables; v2 added the two per-entry TTL override
/// columns to `Entries`.
pub const SCHEMA_VERSION: i64 = 2;

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS Entries (
  Key TEXT PRIMARY KEY NOT NULL,
  Value BLOB NOT NULL,
  SizeInBytes INTEGER NOT NULL,
  AccessUtc INTEGER NOT NULL,
  CreatedUtc INTEGER NOT NULL,
  TimeToLiveInSeconds INTEGER,
  SlidingTimeToLiveInSeconds INTEGER
);

CREATE INDEX IF NOT EXISTS idx_entries_access ON Entries(AccessUtc);

CREATE TABLE IF NOT EXISTS Metadata (
  Key INTEGER PRIMARY KEY CHECK (Key = 1),
  Version INTEGER NOT NULL,
  MaximumCapacityInBytes INTEGER,
  TimeToLiveInSeconds INTEGER,
  SlidingTimeToLiveInSeconds INTEGER
);
"#;

/// Outcome of [`ensure_schema`], used by the engine to decide whether a
/// caller-supplied configuration replaces the persisted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    /// Tables were created from scratch at the current version
    Created,
    /// An older schema was upgraded to the current version
    Migrated,
    /// The schema was already at the current version
    Current,
}

// == Ensure Schema ==
/// Brings the database up to [`SCHEMA_VERSION`], creating or migrating
/// as needed. Runs once per cache lifetime during initialization.
pub fn ensure_schema(conn: &mut Connection) -> rusqlite::Result<SchemaState> {
    // Write-ahead durability is best effort: some filesystems refuse it
    // and the cache still works on a rollback journal.
    match conn.query_row("PRAGMA journal_mode = WAL", [], |row| {
        row.get::<_, String>(0)
    }) {
        Ok(mode) => debug!("journal mode: {}", mode),
        Err(e) => debug!("could not enable WAL journal mode: {}", e),
    }

    match read_version(conn)? {
        None => {
            create_schema(conn)?;
            info!("created cache schema at version {}", SCHEMA_VERSION);
            Ok(SchemaState::Created)
        }
        Some(version) if version < SCHEMA_VERSION => {
            migrate(conn, version)?;
            info!(
                "migrated cache schema from version {} to {}",
                version, SCHEMA_VERSION
            );
            Ok(SchemaState::Migrated)
        }
        Some(_) => Ok(SchemaState::Current),
    }
}

/// Reads the stored schema version; `None` when the metadata table or
/// its singleton row does not exist yet.
fn read_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let table: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'Metadata'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if table.is_none() {
        return Ok(None);
    }

    conn.query_row("SELECT Version FROM Metadata WHERE Key = 1", [], |row| {
        row.get(0)
    })
    .optional()
}

fn create_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(DDL)?;
    tx.execute(
        "INSERT INTO Metadata (Key, Version) VALUES (1, ?1)",
        params![SCHEMA_VERSION],
    )?;
    tx.commit()
}

/// Applies every migration step above `from` in ascending order, inside
/// one transaction.
fn migrate(conn: &mut Connection, from: i64) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    if from < 2 {
        let cols = table_columns(&tx, "Entries")?;
        add_column_if_missing(&tx, &cols, "Entries", "TimeToLiveInSeconds", "INTEGER")?;
        add_column_if_missing(
            &tx,
            &cols,
            "Entries",
            "SlidingTimeToLiveInSeconds",
            "INTEGER",
        )?;
        tx.execute_batch("CREATE INDEX IF NOT EXISTS idx_entries_access ON Entries(AccessUtc)")?;
    }

    tx.execute(
        "UPDATE Metadata SET Version = ?1 WHERE Key = 1",
        params![SCHEMA_VERSION],
    )?;
    tx.commit()
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = HashSet::new();
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

fn add_column_if_missing(
    conn: &Connection,
    cols: &HashSet<String>,
    table: &str,
    col: &str,
    ty: &str,
) -> rusqlite::Result<()> {
    if !cols.contains(col) {
        let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, col, ty);
        conn.execute(&sql, [])?;
    }
    Ok(())
}

// == Metadata Configuration ==
/// Reads the persisted global configuration from the metadata singleton.
pub fn read_configuration(conn: &Connection) -> rusqlite::Result<Option<CacheConfig>> {
    conn.query_row(
        "SELECT MaximumCapacityInBytes, TimeToLiveInSeconds, SlidingTimeToLiveInSeconds
         FROM Metadata WHERE Key = 1",
        [],
        |row| {
            Ok(CacheConfig {
                max_capacity_bytes: row.get(0)?,
                ttl_seconds: row.get(1)?,
                sliding_ttl_seconds: row.get(2)?,
            })
        },
    )
    .optional()
}

/// Upserts the global configuration into the metadata singleton.
pub fn write_configuration(conn: &Connection, config: &CacheConfig) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO Metadata (Key, Version, MaximumCapacityInBytes, TimeToLiveInSeconds, SlidingTimeToLiveInSeconds)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT(Key) DO UPDATE SET
           MaximumCapacityInBytes = excluded.MaximumCapacityInBytes,
           TimeToLiveInSeconds = excluded.TimeToLiveInSeconds,
           SlidingTimeToLiveInSeconds = excluded.SlidingTimeToLiveInSeconds",
        params![
            SCHEMA_VERSION,
            config.max_capacity_bytes,
            config.ttl_seconds,
            config.sliding_ttl_seconds
        ],
    )?;
    Ok(())
}
