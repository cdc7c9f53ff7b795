//! Service layer plumbing: contexts and the thread-pool bridge.
use std::sync::Arc;

use diesel::connection::AnsiTransactionManager;
use diesel::pg::Pg;
use diesel::Connection;
use failure::Error as FailureError;
use futures::future::Future;
use futures_cpupool::CpuPool;
use r2d2::{ManageConnection, Pool, PooledConnection};

use cache::CachePlane;
use models::UserId;
use repos::repo_factory::ReposFactory;

/// Service layer Future
pub type ServiceFuture<T> = Box<Future<Item = T, Error = FailureError>>;

/// Process-wide dependencies shared by every request.
pub struct StaticContext<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    pub db_pool: Pool<M>,
    pub cpu_pool: CpuPool,
    pub repo_factory: F,
    pub cache: Arc<CachePlane>,
}

impl<T, M, F> Clone for StaticContext<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    fn clone(&self) -> Self {
        Self {
            db_pool: self.db_pool.clone(),
            cpu_pool: self.cpu_pool.clone(),
            repo_factory: self.repo_factory.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<T, M, F> StaticContext<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    pub fn new(db_pool: Pool<M>, cpu_pool: CpuPool, repo_factory: F, cache: Arc<CachePlane>) -> Self {
        Self {
            db_pool,
            cpu_pool,
            repo_factory,
            cache,
        }
    }
}

/// Per-request state. The subject identifier arrives already
/// authenticated from the transport layer.
#[derive(Clone, Debug, Default)]
pub struct DynamicContext {
    pub user_id: Option<UserId>,
}

impl DynamicContext {
    pub fn new(user_id: Option<UserId>) -> Self {
        Self { user_id }
    }
}

pub struct Service<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    pub static_context: StaticContext<T, M, F>,
    pub dynamic_context: DynamicContext,
}

impl<T, M, F> Service<T, M, F>
where
    T: Connection<Backend = Pg, TransactionManager = AnsiTransactionManager> + 'static,
    M: ManageConnection<Connection = T>,
    F: ReposFactory<T>,
{
    pub fn new(static_context: StaticContext<T, M, F>, dynamic_context: DynamicContext) -> Self {
        Self {
            static_context,
            dynamic_context,
        }
    }

    /// Ships blocking repo work onto the thread pool with a pooled
    /// connection.
    pub fn spawn_on_pool<R, Func>(&self, f: Func) -> ServiceFuture<R>
    where
        R: Send + 'static,
        Func: FnOnce(PooledConnection<M>) -> Result<R, FailureError> + Send + 'static,
    {
        let db_pool = self.static_context.db_pool.clone();
        let cpu_pool = self.static_context.cpu_pool.clone();
        Box::new(cpu_pool.spawn_fn(move || {
            db_pool
                .get()
                .map_err(|e| FailureError::from(e).context("Could not acquire database connection from pool").into())
                .and_then(f)
        }))
    }
}

/// Listing page size cap.
pub const MAX_PAGE_SIZE: i64 = 100;

/// Turns 1-based page/limit inputs into offset/limit, clamping the
/// page to 1 and the limit to `MAX_PAGE_SIZE`.
pub fn pagination(page: i64, limit: i64) -> (i64, i64) {
    let limit = if limit < 1 {
        1
    } else if limit > MAX_PAGE_SIZE {
        MAX_PAGE_SIZE
    } else {
        limit
    };
    let page = if page < 1 { 1 } else { page };
    ((page - 1) * limit, limit)
}

#[cfg(test)]
mod tests {
    use super::pagination;

    #[test]
    fn pagination_is_one_based_and_capped() {
        assert_eq!(pagination(1, 20), (0, 20));
        assert_eq!(pagination(3, 20), (40, 20));
        assert_eq!(pagination(0, 0), (0, 1));
        assert_eq!(pagination(2, 500), (100, 100));
    }
}
