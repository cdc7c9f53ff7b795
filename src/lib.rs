//! Coupons is a microservice responsible for coupon books and the
//! lifecycle of individual discount codes: bulk materialization,
//! assignment, checkout reservation and redemption.
//! The layered structure of the app is
//!
//! `Application -> Service -> Repo + Cache`
//!
//! Each layer can throw Error with context or cover occurred error with
//! Error in the context. An error without a recognized kind is
//! translated to an internal failure by the embedding application.

extern crate config as config_crate;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate failure;
extern crate futures;
extern crate futures_cpupool;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate r2d2;
extern crate rand;
extern crate redis;
extern crate regex;
extern crate serde;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate serde_json;
#[cfg(test)]
extern crate tokio_core;
extern crate uuid;
extern crate validator;
#[macro_use]
extern crate validator_derive;

pub mod cache;
pub mod config;
pub mod errors;
pub mod models;
pub mod repos;
pub mod schema;
pub mod services;

use std::sync::Arc;

use diesel::pg::PgConnection;
use diesel::r2d2::ConnectionManager;
use failure::Error as FailureError;
use futures_cpupool::CpuPool;

use cache::{CachePlane, RedisCacheImpl};
use config::Config;
use repos::repo_factory::ReposFactoryImpl;
use services::types::StaticContext;

/// Builds the shared process context from provided `Config`: database
/// and cache pools, the worker thread pool and the repo factory. The
/// embedding application combines it with a per-request
/// `DynamicContext` into a `Service`.
pub fn create_static_context(
    config: &Config,
) -> Result<StaticContext<PgConnection, ConnectionManager<PgConnection>, ReposFactoryImpl>, FailureError> {
    let manager = ConnectionManager::<PgConnection>::new(config.database.url.clone());
    let db_pool = r2d2::Pool::builder()
        .max_size(config.database.pool_size)
        .build(manager)
        .map_err(|e| FailureError::from(e).context("Could not create database connection pool"))?;

    let cpu_pool = CpuPool::new(config.cpu_pool.thread_count);

    let cache: Arc<CachePlane> = Arc::new(RedisCacheImpl::from_url(&config.redis.url, config.redis.pool_size)?);

    Ok(StaticContext::new(db_pool, cpu_pool, ReposFactoryImpl::default(), cache))
}
