//! Expiration Policy Module
//!
//! Pure validity decision for a single entry. Kept free of storage
//! concerns so the rules can be tested exhaustively.

use crate::config::CacheConfig;

/// Decides whether an entry is still valid at `now`.
///
/// Each TTL dimension resolves independently: a per-entry override wins
/// over the global value for that dimension alone, and an unset dimension
/// never expires the entry. The fixed dimension measures from creation
/// time, the sliding dimension from the last access.
///
/// An entry expires once strictly more than its TTL has elapsed, so a
/// TTL of 1 second still admits a read exactly 1 second after its basis.
pub fn is_valid(
    now: i64,
    created_utc: i64,
    access_utc: i64,
    ttl_seconds: Option<i64>,
    sliding_ttl_seconds: Option<i64>,
    config: &CacheConfig,
) -> bool {
    let fixed_expired = match ttl_seconds.or(config.ttl_seconds) {
        Some(ttl) => now - created_utc > ttl,
        None => false,
    };

    let sliding_expired = match sliding_ttl_seconds.or(config.sliding_ttl_seconds) {
        Some(ttl) => now - access_utc > ttl,
        None => false,
    };

    !fixed_expired && !sliding_expired
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn global(ttl: Option<i64>, sliding: Option<i64>) -> CacheConfig {
        CacheConfig {
            max_capacity_bytes: None,
            ttl_seconds: ttl,
            sliding_ttl_seconds: sliding,
        }
    }

    #[test]
    fn test_no_policy_never_expires() {
        assert!(is_valid(1_000_000, 0, 0, None, None, &global(None, None)));
    }

    #[test]
    fn test_global_fixed_ttl() {
        let config = global(Some(10), None);
        assert!(is_valid(110, 100, 100, None, None, &config));
        assert!(!is_valid(111, 100, 100, None, None, &config));
    }

    #[test]
    fn test_global_sliding_ttl_renews_from_access() {
        let config = global(None, Some(10));
        // Created long ago but touched recently.
        assert!(is_valid(200, 100, 195, None, None, &config));
        assert!(!is_valid(200, 100, 189, None, None, &config));
    }

    #[test]
    fn test_entry_fixed_override_ignores_global() {
        // A short per-entry TTL expires under a long global one.
        let config = global(Some(1000), None);
        assert!(!is_valid(110, 100, 110, Some(5), None, &config));

        // A long per-entry TTL outlives a short global one.
        let config = global(Some(5), None);
        assert!(is_valid(110, 100, 110, Some(1000), None, &config));
    }

    #[test]
    fn test_entry_sliding_override_ignores_global() {
        let config = global(None, Some(120));
        assert!(!is_valid(110, 100, 100, None, Some(5), &config));

        let config = global(None, Some(5));
        assert!(is_valid(110, 100, 100, None, Some(1000), &config));
    }

    #[test]
    fn test_dimensions_resolve_independently() {
        // Fixed comes from the entry, sliding falls back to the global.
        let config = global(Some(1000), Some(10));
        assert!(is_valid(110, 100, 105, Some(50), None, &config));
        assert!(!is_valid(120, 100, 105, Some(50), None, &config));

        // Either dimension alone is enough to expire the entry.
        assert!(!is_valid(200, 100, 199, Some(50), None, &config));
    }

    #[test]
    fn test_expiry_boundary_is_strict() {
        let config = global(Some(10), Some(10));
        // Exactly TTL elapsed on both dimensions: still valid.
        assert!(is_valid(110, 100, 100, None, None, &config));
    }
}
