//! Cache plane: TTL-bounded dedup flags and mutual-exclusion locks.
//!
//! The cache is an optimization, never the authority: acquisition
//! failures are reported as "not acquired" and release failures are
//! swallowed after logging, because every entry carries a TTL backstop.
//! Correctness of the coupon state machine survives total cache loss.

pub mod ephemeral;
pub mod redis;

pub use self::ephemeral::EphemeralCacheImpl;
pub use self::redis::RedisCacheImpl;

use std::time::Duration;

use failure::Error as FailureError;

/// Feature key of checkout reservations.
pub const FEATURE_COUPON_LOCK: &str = "coupon-lock";
/// Feature key of redemption suppression and mutual exclusion.
pub const FEATURE_COUPON_REDEEM: &str = "coupon-redeem";

/// Time a redemption dedup flag suppresses repeats.
pub const DEDUP_TTL: Duration = Duration::from_secs(60);
/// Time a redemption mutual-exclusion lock is held at most.
pub const REDEEM_LOCK_TTL: Duration = Duration::from_secs(10);

/// Distributed key-value plane with set-if-absent semantics.
///
/// Keys are laid out `<namespace>:<feature>:<resource>` with the
/// namespaces `dedup` and `locks`.
pub trait CachePlane: Send + Sync + 'static {
    /// Sets an in-progress marker if absent. `false` means the marker
    /// was already present.
    fn set_dedup(&self, feature: &str, resource: &str, ttl: Duration) -> Result<bool, FailureError>;

    /// Whether an in-progress marker is currently set.
    fn has_dedup(&self, feature: &str, resource: &str) -> Result<bool, FailureError>;

    /// Drops an in-progress marker. Errors are logged and swallowed;
    /// the TTL bounds staleness either way.
    fn clear_dedup(&self, feature: &str, resource: &str);

    /// Acquires a mutual-exclusion lock if absent. `false` means the
    /// lock is held elsewhere.
    fn acquire_lock(&self, feature: &str, resource: &str, ttl: Duration) -> Result<bool, FailureError>;

    /// Releases a lock. Idempotent; errors are logged and swallowed.
    fn release_lock(&self, feature: &str, resource: &str);
}

fn dedup_key(feature: &str, resource: &str) -> String {
    format!("dedup:{}:{}", feature, resource)
}

fn lock_key(feature: &str, resource: &str) -> String {
    format!("locks:{}:{}", feature, resource)
}
