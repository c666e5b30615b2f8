//! Cache Engine Module
//!
//! Facade over the pool, schema, entry store, and eviction pass. Owns
//! the lazily shared initialization outcome, the in-memory running size
//! total, and the guard for the self-triggered background cleanup.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{eviction, CacheStats, CleanupOutcome};
use crate::config::{CacheConfig, EntryConfig};
use crate::error::{CacheError, Result};
use crate::storage::{self, entries, schema, ConnectionPool, DEFAULT_MAX_CONNECTIONS};
use crate::tasks;

// == Cache Engine ==
/// Disk-backed cache over one SQLite file.
///
/// Cloning is cheap and every clone shares the same pool, counters, and
/// initialization state. All operations are safe to call concurrently;
/// the first operation initializes the schema once and every concurrent
/// first caller shares that outcome.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    pool: ConnectionPool,
    /// Memoized initialization outcome: `Ok(())` once ready, or the fatal
    /// schema error every later caller gets back. Transient failures
    /// (pool exhaustion, cancellation) are not memoized.
    init: OnceCell<std::result::Result<(), CacheError>>,
    supplied_config: Option<CacheConfig>,
    active_config: Mutex<CacheConfig>,
    /// Running total of stored payload bytes. Only ever adjusted by
    /// signed deltas; recomputed from the durable sum at initialization.
    total_size: AtomicI64,
    cleanup_in_flight: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheEngine {
    // == Constructors ==
    /// Creates an engine for the database derived from `base_path`.
    ///
    /// No I/O happens here; the schema is created or migrated lazily by
    /// the first operation. A supplied configuration replaces whatever
    /// the database has persisted, a `None` keeps the persisted one.
    pub fn new(base_path: impl AsRef<Path>, config: Option<CacheConfig>) -> Self {
        Self::with_pool_size(base_path, config, DEFAULT_MAX_CONNECTIONS)
    }

    /// Same as [`CacheEngine::new`] with an explicit connection bound.
    pub fn with_pool_size(
        base_path: impl AsRef<Path>,
        config: Option<CacheConfig>,
        max_connections: usize,
    ) -> Self {
        let db_path = storage::db_path_for(base_path.as_ref());
        Self {
            inner: Arc::new(EngineInner {
                pool: ConnectionPool::new(db_path, max_connections),
                init: OnceCell::new(),
                supplied_config: config,
                active_config: Mutex::new(CacheConfig::default()),
                total_size: AtomicI64::new(0),
                cleanup_in_flight: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    // == Get ==
    /// Retrieves the payload stored under `key`.
    ///
    /// Returns `None` for a missing key and for an entry whose TTL has
    /// elapsed; the expired entry is removed on the way. A successful
    /// read renews the entry's sliding window.
    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        self.ensure_initialized(cancel).await?;

        let config = self.active_config();
        let key = key.to_string();
        let now = storage::now_epoch_secs();
        let outcome = self
            .run_unit_of_work(cancel, move |conn| {
                entries::retrieve(conn, &key, &config, now).map_err(CacheError::from)
            })
            .await?;

        if outcome.freed_bytes > 0 {
            self.inner
                .total_size
                .fetch_sub(outcome.freed_bytes, Ordering::SeqCst);
        }

        match outcome.value {
            Some(value) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    // == Save ==
    /// Stores `value` under `key`, inserting or replacing.
    ///
    /// Replacing keeps the entry's creation time; an `entry_config`
    /// attaches per-entry TTL overrides and an earlier override sticks
    /// until a new one is supplied. When the updated total reaches a
    /// configured capacity bound, a best-effort cleanup is started in the
    /// background.
    pub async fn save(
        &self,
        key: &str,
        value: &[u8],
        entry_config: Option<EntryConfig>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_initialized(cancel).await?;

        let size = value.len() as i64;
        let key = key.to_string();
        let value = value.to_vec();
        let now = storage::now_epoch_secs();
        let previous = self
            .run_unit_of_work(cancel, move |conn| {
                entries::upsert(conn, &key, &value, entry_config.as_ref(), now)
                    .map_err(CacheError::from)
            })
            .await?;

        let delta = size - previous;
        let total = self.inner.total_size.fetch_add(delta, Ordering::SeqCst) + delta;

        if let Some(capacity) = self.active_config().max_capacity_bytes {
            if total >= capacity {
                tasks::spawn_capacity_cleanup(self.clone());
            }
        }
        Ok(())
    }

    // == Remove ==
    /// Deletes the entry under `key`; returns whether it existed.
    pub async fn remove(&self, key: &str, cancel: &CancellationToken) -> Result<bool> {
        self.ensure_initialized(cancel).await?;

        let key = key.to_string();
        let freed = self
            .run_unit_of_work(cancel, move |conn| {
                entries::remove(conn, &key).map_err(CacheError::from)
            })
            .await?;

        match freed {
            Some(bytes) => {
                self.inner.total_size.fetch_sub(bytes, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // == Cleanup ==
    /// Runs one cleanup pass: expired entries are swept and, when a
    /// capacity bound is configured, LRU entries are trimmed until the
    /// total fits under it. Returns the number of bytes freed.
    ///
    /// Explicit calls always run, independent of a self-triggered pass
    /// that may be in flight; the durable store serializes the two.
    pub async fn cleanup(&self, cancel: &CancellationToken) -> Result<u64> {
        self.ensure_initialized(cancel).await?;
        let outcome = self.run_cleanup_pass(cancel).await?;
        Ok(outcome.freed_bytes.max(0) as u64)
    }

    // == Set Configuration ==
    /// Persists `config` as the global configuration and makes it the
    /// active one for subsequent operations.
    pub async fn set_configuration(
        &self,
        config: CacheConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_initialized(cancel).await?;

        let persisted = config.clone();
        self.run_unit_of_work(cancel, move |conn| {
            schema::write_configuration(conn, &persisted).map_err(CacheError::from)
        })
        .await?;

        *self.inner.active_config.lock().unwrap() = config;
        Ok(())
    }

    // == Accessors ==
    /// Snapshot of the performance counters and the running size total.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            total_size_bytes: self.total_size_bytes(),
        }
    }

    /// Current running total of stored payload bytes.
    pub fn total_size_bytes(&self) -> u64 {
        self.inner.total_size.load(Ordering::SeqCst).max(0) as u64
    }

    // == Shutdown ==
    /// Shuts the connection pool down; subsequent operations report
    /// [`CacheError::StorageUnavailable`].
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }

    fn active_config(&self) -> CacheConfig {
        self.inner.active_config.lock().unwrap().clone()
    }

    // == Initialization ==
    /// Waits for the one-time initialization, sharing its outcome with
    /// every concurrent first caller.
    ///
    /// A fatal schema failure is memoized and handed back to all later
    /// callers; cancellation and pool exhaustion leave the engine
    /// uninitialized so a later call can retry.
    async fn ensure_initialized(&self, cancel: &CancellationToken) -> Result<()> {
        let memoized = tokio::select! {
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            outcome = self.inner.init.get_or_try_init(|| self.initialize(cancel)) => outcome?,
        };
        memoized.clone()
    }

    /// One initialization attempt. The outer `Err` is transient and not
    /// memoized; the inner result is the permanent Ready/Failed state.
    async fn initialize(
        &self,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<(), CacheError>> {
        let supplied = self.inner.supplied_config.clone();
        let outcome = self
            .run_unit_of_work(cancel, move |conn| {
                initialize_on_connection(conn, supplied.as_ref())
            })
            .await;

        match outcome {
            Ok((active_config, total)) => {
                info!(
                    "cache initialized, {} bytes stored, capacity {:?}",
                    total, active_config.max_capacity_bytes
                );
                *self.inner.active_config.lock().unwrap() = active_config;
                self.inner.total_size.store(total, Ordering::SeqCst);
                Ok(Ok(()))
            }
            Err(fatal @ CacheError::SchemaFailure(_)) => {
                warn!("cache initialization failed permanently: {}", fatal);
                Ok(Err(fatal))
            }
            Err(transient) => Err(transient),
        }
    }

    // == Unit Of Work ==
    /// Leases a pooled connection and runs `work` on the blocking pool,
    /// returning the connection to the pool afterwards.
    async fn run_unit_of_work<T, F>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut lease = self.inner.pool.acquire(cancel).await?;
        let mut conn = match lease.detach() {
            Some(conn) => conn,
            None => {
                return Err(CacheError::OperationFailed(
                    "leased connection was empty".to_string(),
                ))
            }
        };

        let joined = tokio::task::spawn_blocking(move || {
            let out = work(&mut conn);
            (conn, out)
        })
        .await;

        match joined {
            Ok((conn, out)) => {
                lease.attach(conn);
                self.inner.pool.release(lease);
                out
            }
            Err(join_error) => {
                // The connection died with the worker; the lease still
                // frees its permit on drop.
                drop(lease);
                Err(CacheError::OperationFailed(format!(
                    "storage worker failed: {}",
                    join_error
                )))
            }
        }
    }

    /// One eviction pass against the current running total.
    pub(crate) async fn run_cleanup_pass(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CleanupOutcome> {
        let config = self.active_config();
        let total = self.inner.total_size.load(Ordering::SeqCst);

        let outcome = self
            .run_unit_of_work(cancel, move |conn| {
                eviction::cleanup(conn, &config, total).map_err(CacheError::from)
            })
            .await?;

        if outcome.freed_bytes != 0 {
            self.inner
                .total_size
                .fetch_sub(outcome.freed_bytes, Ordering::SeqCst);
        }
        if outcome.evicted_entries > 0 {
            self.inner
                .evictions
                .fetch_add(outcome.evicted_entries, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    // == Background Cleanup Guard ==
    /// Claims the self-triggered cleanup slot; at most one background
    /// pass runs at a time and a failed claim means skip, not queue.
    pub(crate) fn try_begin_background_cleanup(&self) -> bool {
        self.inner
            .cleanup_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_background_cleanup(&self) {
        self.inner.cleanup_in_flight.store(false, Ordering::Release);
    }
}

/// Blocking part of initialization: schema, configuration, durable sum.
///
/// Schema problems are fatal; everything after the schema is ordinary
/// storage work whose failure leaves the engine uninitialized for retry.
fn initialize_on_connection(
    conn: &mut Connection,
    supplied: Option<&CacheConfig>,
) -> Result<(CacheConfig, i64)> {
    let state = schema::ensure_schema(conn)
        .map_err(|e| CacheError::SchemaFailure(e.to_string()))?;

    let active_config = match (state, supplied) {
        // A migrated schema keeps its persisted configuration; the
        // supplied one applies to fresh and already-current databases.
        (schema::SchemaState::Created, Some(config))
        | (schema::SchemaState::Current, Some(config)) => {
            schema::write_configuration(conn, config)?;
            config.clone()
        }
        _ => schema::read_configuration(conn)?.unwrap_or_default(),
    };

    let total = entries::total_size(conn)?;
    debug!("seeded running total from durable sum: {} bytes", total);
    Ok((active_config, total))
}
