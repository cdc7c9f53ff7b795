//! Redis-backed cache plane.
//!
//! Uses short-lived synchronous connections drawn from an r2d2 pool,
//! matching the thread-pool execution model of the service layer. Dedup
//! flags and locks are both plain `SET NX EX` keys in separate
//! namespaces.

use std::time::Duration;

use failure::Error as FailureError;
use r2d2::Pool;
use redis;
use redis::{Client, Commands};

use super::{dedup_key, lock_key, CachePlane};

pub type RedisPool = Pool<Client>;

#[derive(Clone)]
pub struct RedisCacheImpl {
    pool: RedisPool,
}

impl RedisCacheImpl {
    pub fn new(pool: RedisPool) -> Self {
        RedisCacheImpl { pool }
    }

    pub fn from_url(url: &str, pool_size: u32) -> Result<Self, FailureError> {
        let client = Client::open(url)?;
        let pool = Pool::builder().max_size(pool_size).build(client)?;
        Ok(RedisCacheImpl::new(pool))
    }

    fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, FailureError> {
        let mut conn = self.pool.get()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query(&mut *conn)?;
        Ok(reply.is_some())
    }

    fn exists(&self, key: &str) -> Result<bool, FailureError> {
        let mut conn = self.pool.get()?;
        let exists: bool = conn.exists(key)?;
        Ok(exists)
    }

    fn delete(&self, key: &str) -> Result<(), FailureError> {
        let mut conn = self.pool.get()?;
        let _: () = conn.del(key)?;
        Ok(())
    }
}

impl CachePlane for RedisCacheImpl {
    fn set_dedup(&self, feature: &str, resource: &str, ttl: Duration) -> Result<bool, FailureError> {
        self.set_if_absent(&dedup_key(feature, resource), ttl)
    }

    fn has_dedup(&self, feature: &str, resource: &str) -> Result<bool, FailureError> {
        self.exists(&dedup_key(feature, resource))
    }

    fn clear_dedup(&self, feature: &str, resource: &str) {
        if let Err(e) = self.delete(&dedup_key(feature, resource)) {
            warn!("Failed to clear dedup flag {}:{}: {}", feature, resource, e);
        }
    }

    fn acquire_lock(&self, feature: &str, resource: &str, ttl: Duration) -> Result<bool, FailureError> {
        self.set_if_absent(&lock_key(feature, resource), ttl)
    }

    fn release_lock(&self, feature: &str, resource: &str) {
        if let Err(e) = self.delete(&lock_key(feature, resource)) {
            warn!("Failed to release cache lock {}:{}: {}", feature, resource, e);
        }
    }
}
