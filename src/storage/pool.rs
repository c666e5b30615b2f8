//! Connection Pool Module
//!
//! Bounds concurrent access to the SQLite database to a fixed number of
//! live connections. Idle connections are kept open and reused; waiting
//! callers can be cancelled without consuming a permit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Default bound on live connections per cache instance.
pub const DEFAULT_MAX_CONNECTIONS: usize = 3;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// == Connection Pool ==
/// Bounded pool of SQLite connections for one database file.
pub struct ConnectionPool {
    db_path: PathBuf,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    shut_down: AtomicBool,
}

/// A leased connection together with the pool permit backing it.
///
/// The permit is held for the lifetime of the lease, so dropping a lease
/// (with or without its connection) always frees a pool slot.
pub struct PooledConnection {
    conn: Option<Connection>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Moves the connection out of the lease, e.g. into a blocking task.
    pub(crate) fn detach(&mut self) -> Option<Connection> {
        self.conn.take()
    }

    /// Puts a previously detached connection back into the lease.
    pub(crate) fn attach(&mut self, conn: Connection) {
        self.conn = Some(conn);
    }
}

impl ConnectionPool {
    /// Creates a pool for the given database file, bounded to
    /// `max_connections` live connections.
    pub fn new(db_path: PathBuf, max_connections: usize) -> Self {
        Self {
            db_path,
            permits: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    // == Acquire ==
    /// Leases a connection, waiting for a pool permit if all are taken.
    ///
    /// Reuses an idle connection when one is available, otherwise opens a
    /// new one. Cancellation while waiting aborts with
    /// [`CacheError::Cancelled`] and consumes no permit; a pool that has
    /// been shut down reports [`CacheError::StorageUnavailable`].
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledConnection> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| {
                CacheError::StorageUnavailable("connection pool is shut down".to_string())
            })?,
        };

        let reused = self.idle.lock().unwrap().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.open_connection()?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            _permit: permit,
        })
    }

    // == Release ==
    /// Returns a leased connection to the idle set.
    ///
    /// After shutdown the connection is closed instead; the permit is
    /// freed either way when the lease drops.
    pub fn release(&self, mut lease: PooledConnection) {
        if let Some(conn) = lease.detach() {
            if self.shut_down.load(Ordering::SeqCst) {
                drop(conn);
            } else {
                self.idle.lock().unwrap().push(conn);
            }
        }
    }

    // == Shutdown ==
    /// Closes every idle connection and refuses further leases.
    ///
    /// Connections still leased out are closed individually when they are
    /// released.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.permits.close();

        let mut idle = self.idle.lock().unwrap();
        let closed = idle.len();
        idle.clear();
        debug!("connection pool shut down, closed {} idle connections", closed);
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .map_err(|e| CacheError::StorageUnavailable(e.to_string()))?;
        // Concurrent writers back off instead of failing with SQLITE_BUSY.
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| CacheError::StorageUnavailable(e.to_string()))?;
        Ok(conn)
    }
}
