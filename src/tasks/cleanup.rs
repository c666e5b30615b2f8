//! Capacity Cleanup Task
//!
//! Fire-and-forget cleanup pass spawned after a save lands at or over
//! the configured capacity bound. At most one such pass runs at a time;
//! a second trigger while one is in flight is skipped, not queued.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheEngine;

/// Spawns one background cleanup pass if none is currently running.
///
/// The pass is best effort: failures are logged and swallowed, and the
/// engine converges over later triggers instead. Returns the task handle
/// when a pass was started, `None` when the slot was already taken.
pub(crate) fn spawn_capacity_cleanup(engine: CacheEngine) -> Option<JoinHandle<()>> {
    if !engine.try_begin_background_cleanup() {
        debug!("capacity cleanup already in flight, skipping");
        return None;
    }

    Some(tokio::spawn(async move {
        let cancel = CancellationToken::new();
        match engine.run_cleanup_pass(&cancel).await {
            Ok(outcome) if outcome.freed_bytes > 0 => {
                info!(
                    "capacity cleanup freed {} bytes ({} expired, {} evicted)",
                    outcome.freed_bytes, outcome.expired_entries, outcome.evicted_entries
                );
            }
            Ok(_) => {}
            Err(e) => warn!("capacity cleanup failed: {}", e),
        }
        engine.finish_background_cleanup();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn capped_engine(capacity: i64) -> (tempfile::TempDir, CacheEngine) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            max_capacity_bytes: Some(capacity),
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(dir.path().join("cache"), Some(config));
        (dir, engine)
    }

    #[tokio::test]
    async fn test_cleanup_task_trims_over_capacity_store() {
        // Fill past the bound before any capacity is configured, so no
        // save triggers a pass of its own.
        let dir = tempfile::tempdir().unwrap();
        let engine = CacheEngine::new(dir.path().join("cache"), None);
        let cancel = CancellationToken::new();

        for i in 0..4 {
            engine
                .save(&format!("k{}", i), &[0u8; 4], None, &cancel)
                .await
                .unwrap();
        }
        engine
            .set_configuration(
                CacheConfig {
                    max_capacity_bytes: Some(10),
                    ..CacheConfig::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        assert!(engine.total_size_bytes() >= 10);

        let handle = spawn_capacity_cleanup(engine.clone()).unwrap();
        handle.await.unwrap();

        assert!(engine.total_size_bytes() < 10);
    }

    #[tokio::test]
    async fn test_second_trigger_is_skipped_while_in_flight() {
        let (_dir, engine) = capped_engine(10);
        let cancel = CancellationToken::new();
        engine.save("k", b"v", None, &cancel).await.unwrap();

        assert!(engine.try_begin_background_cleanup());
        assert!(spawn_capacity_cleanup(engine.clone()).is_none());
        engine.finish_background_cleanup();

        let handle = spawn_capacity_cleanup(engine.clone());
        assert!(handle.is_some());
        handle.unwrap().await.unwrap();
    }
}
