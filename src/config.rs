//! Application settings, layered from the base file, an optional
//! RUN_MODE overlay and `COUPONS_*` environment variables.
use std::env;

use config_crate::{Config as RawConfig, ConfigError, Environment, File};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: Database,
    pub redis: Redis,
    pub cpu_pool: CpuPoolSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Redis {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CpuPoolSettings {
    pub thread_count: usize,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        let mut s = RawConfig::new();
        s.merge(File::with_name("config/base"))?;

        let env = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());
        s.merge(File::with_name(&format!("config/{}", env)).required(false))?;

        s.merge(Environment::with_prefix("COUPONS").separator("_"))?;

        s.try_into()
    }
}
