//! Server configuration loaded from `ALEA_*` environment variables.
//!
//! # Environment Variables
//!
//! - `ALEA_BIND_ADDR`: Listen address. Default: `0.0.0.0:3000`
//! - `ALEA_DB_PATH`: libSQL database file. Unset means an in-memory database
//! - `ALEA_CACHE_BACKEND`: `memory` or `redis`. Default: `memory`
//! - `ALEA_REDIS_URL`: Redis URL for the `redis` backend. Default: `redis://127.0.0.1:6379/`
//! - `ALEA_CACHE_PREFIX`: Key prefix in Redis. Default: `alea-acl:`
//! - `ALEA_CACHE_TIMEOUT_MS`: Bound on a single Redis command. Default: `250`
//! - `ALEA_LOG_JSON`: Emit JSON logs when `true` or `1`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use alea_acl::{CacheBackend, CacheConfig};
use anyhow::{bail, Context, Result};
use tracing::info;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// `None` keeps the store in memory
    pub db_path: Option<PathBuf>,
    pub cache: CacheConfig,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            db_path: None,
            cache: CacheConfig::default(),
            log_json: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any variable source
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        let bind = var("ALEA_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        config.bind_addr = bind
            .parse()
            .with_context(|| format!("invalid ALEA_BIND_ADDR '{}'", bind))?;

        config.db_path = var("ALEA_DB_PATH")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        config.cache.backend = parse_backend(
            var("ALEA_CACHE_BACKEND").as_deref().unwrap_or("memory"),
            var("ALEA_REDIS_URL"),
        )?;

        if let Some(prefix) = var("ALEA_CACHE_PREFIX") {
            config.cache.key_prefix = prefix;
        }

        if let Some(ms) = var("ALEA_CACHE_TIMEOUT_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("invalid ALEA_CACHE_TIMEOUT_MS '{}'", ms))?;
            config.cache.timeout = Duration::from_millis(ms);
        }

        config.log_json = var("ALEA_LOG_JSON")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(config)
    }

    /// Apply command-line cache flags on top of the environment
    pub fn override_cache(&mut self, backend: Option<&str>, redis_url: Option<String>) -> Result<()> {
        if backend.is_none() && redis_url.is_none() {
            return Ok(());
        }

        let current_url = match &self.cache.backend {
            CacheBackend::Redis { url } => Some(url.clone()),
            CacheBackend::Memory => None,
        };
        let name = backend.unwrap_or(match self.cache.backend {
            CacheBackend::Memory => "memory",
            CacheBackend::Redis { .. } => "redis",
        });

        self.cache.backend = parse_backend(name, redis_url.or(current_url))?;
        Ok(())
    }

    pub fn log_config(&self) {
        info!("Bind address: {}", self.bind_addr);
        match &self.db_path {
            Some(path) => info!("Database: {}", path.display()),
            None => info!("Database: in-memory"),
        }
        match &self.cache.backend {
            CacheBackend::Memory => info!("Cache: in-process"),
            CacheBackend::Redis { .. } => info!(
                "Cache: redis (prefix '{}', timeout {}ms)",
                self.cache.key_prefix,
                self.cache.timeout.as_millis()
            ),
        }
    }
}

/// Resolve a backend name to a [`CacheBackend`]
pub fn parse_backend(name: &str, redis_url: Option<String>) -> Result<CacheBackend> {
    match name.to_lowercase().as_str() {
        "memory" | "in-memory" => Ok(CacheBackend::Memory),
        "redis" => Ok(CacheBackend::Redis {
            url: redis_url.unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
        }),
        other => bail!("unknown cache backend '{}', expected 'memory' or 'redis'", other),
    }
}
