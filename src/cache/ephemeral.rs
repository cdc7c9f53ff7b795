//! In-process cache plane.
//!
//! Single-node stand-in for the Redis implementation: the same
//! set-if-absent and TTL semantics over a mutexed map. Used by the test
//! suite and by deployments that run without a cache tier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use failure::Error as FailureError;

use super::{dedup_key, lock_key, CachePlane};

#[derive(Clone, Default)]
pub struct EphemeralCacheImpl {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

impl EphemeralCacheImpl {
    pub fn new() -> Self {
        EphemeralCacheImpl {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn set_if_absent(&self, key: String, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, deadline| *deadline > now);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, now + ttl);
        true
    }

    fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries.get(key).map(|deadline| *deadline > now).unwrap_or(false)
    }

    fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

impl CachePlane for EphemeralCacheImpl {
    fn set_dedup(&self, feature: &str, resource: &str, ttl: Duration) -> Result<bool, FailureError> {
        Ok(self.set_if_absent(dedup_key(feature, resource), ttl))
    }

    fn has_dedup(&self, feature: &str, resource: &str) -> Result<bool, FailureError> {
        Ok(self.exists(&dedup_key(feature, resource)))
    }

    fn clear_dedup(&self, feature: &str, resource: &str) {
        self.delete(&dedup_key(feature, resource));
    }

    fn acquire_lock(&self, feature: &str, resource: &str, ttl: Duration) -> Result<bool, FailureError> {
        Ok(self.set_if_absent(lock_key(feature, resource), ttl))
    }

    fn release_lock(&self, feature: &str, resource: &str) {
        self.delete(&lock_key(feature, resource));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_until_released() {
        let cache = EphemeralCacheImpl::new();
        let ttl = Duration::from_secs(30);
        assert!(cache.acquire_lock("coupon-lock", "CODE", ttl).unwrap());
        assert!(!cache.acquire_lock("coupon-lock", "CODE", ttl).unwrap());
        cache.release_lock("coupon-lock", "CODE");
        assert!(cache.acquire_lock("coupon-lock", "CODE", ttl).unwrap());
    }

    #[test]
    fn expired_entries_are_reclaimed() {
        let cache = EphemeralCacheImpl::new();
        assert!(cache.set_dedup("coupon-redeem", "C:u", Duration::from_millis(0)).unwrap());
        assert!(!cache.has_dedup("coupon-redeem", "C:u").unwrap());
        assert!(cache.set_dedup("coupon-redeem", "C:u", Duration::from_secs(60)).unwrap());
        assert!(cache.has_dedup("coupon-redeem", "C:u").unwrap());
    }

    #[test]
    fn namespaces_do_not_collide() {
        let cache = EphemeralCacheImpl::new();
        let ttl = Duration::from_secs(30);
        assert!(cache.set_dedup("coupon-redeem", "X", ttl).unwrap());
        assert!(cache.acquire_lock("coupon-redeem", "X", ttl).unwrap());
        cache.clear_dedup("coupon-redeem", "X");
        assert!(!cache.acquire_lock("coupon-redeem", "X", ttl).unwrap());
    }

    #[test]
    fn release_is_idempotent() {
        let cache = EphemeralCacheImpl::new();
        cache.release_lock("coupon-lock", "NEVER-HELD");
    }
}
