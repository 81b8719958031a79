//! Tests for [`ExpiringMap`] expiry and sweep semantics.
//!
//! TTLs here are milliseconds; production TTLs are minutes to hours, so real
//! sleeps keep the tests honest without slowing the suite.

use super::*;
use std::thread::sleep;

const SHORT_TTL: Duration = Duration::from_millis(30);

// ============================================================================
// get / contains_key tests
// ============================================================================

mod lookup_tests {
    use super::*;

    /// Values are retained and readable within the TTL.
    #[test]
    fn test_retains_values_within_ttl() {
        let mut map = ExpiringMap::new(Duration::from_secs(3600));
        map.insert("a", 1);
        assert_eq!(map.get("a"), Some(&1));
        assert!(map.contains_key("a"));
        assert_eq!(map.len(), 1);
    }

    /// Once the TTL elapses the key reads as absent even before any sweep.
    #[test]
    fn test_expired_key_reads_as_absent() {
        let mut map = ExpiringMap::new(SHORT_TTL);
        map.insert("a", 1);
        sleep(SHORT_TTL * 2);
        assert_eq!(map.get("a"), None);
        assert!(!map.contains_key("a"));
        assert!(map.is_empty());
    }

    /// Re-inserting a key restarts its clock.
    #[test]
    fn test_reinsert_restarts_ttl() {
        let mut map = ExpiringMap::new(SHORT_TTL);
        map.insert("a", 1);
        sleep(SHORT_TTL / 2);
        map.insert("a", 2);
        sleep(SHORT_TTL / 2);
        assert_eq!(map.get("a"), Some(&2));
    }
}

// ============================================================================
// insert sweep tests
// ============================================================================

mod sweep_tests {
    use super::*;

    /// A write drops entries whose TTL elapsed, keeping live ones.
    #[test]
    fn test_insert_sweeps_expired_entries() {
        let mut map = ExpiringMap::new(SHORT_TTL);
        map.insert("old", 1);
        sleep(SHORT_TTL * 2);
        map.insert("new", 2);
        assert_eq!(map.get("old"), None);
        assert_eq!(map.get("new"), Some(&2));
        assert_eq!(map.len(), 1);
    }
}

// ============================================================================
// remove tests
// ============================================================================

mod remove_tests {
    use super::*;

    /// Removing twice is fine; the second call is a no-op.
    #[test]
    fn test_remove_is_idempotent() {
        let mut map = ExpiringMap::new(Duration::from_secs(3600));
        map.insert("a", 1);
        assert_eq!(map.remove("a"), Some(1));
        assert_eq!(map.remove("a"), None);
    }

    /// Removing an expired entry reports it as already gone.
    #[test]
    fn test_remove_expired_returns_none() {
        let mut map = ExpiringMap::new(SHORT_TTL);
        map.insert("a", 1);
        sleep(SHORT_TTL * 2);
        assert_eq!(map.remove("a"), None);
    }
}
