//! Cache store for flattened ACL sets and resource bindings
//!
//! Two interchangeable backends implement [`CacheStore`]:
//! - [`MemoryCache`]: in-process map for single-instance and dev deployments
//! - [`RedisCache`]: networked cache shared by every instance
//!
//! The backend is chosen once at startup through [`connect_cache`]; callers
//! only ever see `Arc<dyn CacheStore>`.
//!
//! Whole sets are swapped with [`CacheStore::replace_set`] so a reader sees
//! either the previous set or the next one, never a half-written set.

mod memory;
mod redis_store;

pub use self::memory::MemoryCache;
pub use self::redis_store::RedisCache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Cache backend faults
///
/// Absent keys are never errors. These variants mean the backend could not
/// answer, and authorization callers must treat them as a deny.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cache operation '{op}' timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("Key '{0}' holds a value of the wrong type")]
    WrongType(String),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Key/value and set-valued storage primitive
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Store a scalar value
    async fn set_entry(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Read a scalar value; `None` if the key is absent
    async fn get_entry(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Add members to the set at `key`, creating it if absent
    async fn add_to_set(&self, key: &str, members: &[String]) -> Result<(), CacheError>;

    /// All members of the set at `key`; empty if the key is absent
    async fn get_from_set(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Whether `member` is in the set at `key`; false if the key is absent
    async fn is_member_of_set(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    /// Atomically replace the whole set at `key`. An empty set removes the key.
    async fn replace_set(&self, key: &str, members: &[String]) -> Result<(), CacheError>;

    /// Remove keys of any type; missing keys are ignored
    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Take the lock at `key` for `token` unless another token holds it
    ///
    /// The lock lapses after `ttl` so a crashed holder cannot wedge it.
    /// Returns false while someone else holds it.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Release the lock at `key` if `token` still holds it
    async fn unlock(&self, key: &str, token: &str) -> Result<(), CacheError>;

    /// Check that the backend answers
    async fn ping(&self) -> Result<(), CacheError>;

    /// Short backend name for logs and health output
    fn backend_name(&self) -> &'static str;
}

/// Cache key layout
pub mod keys {
    /// Index of every ACL id that has flattened entries
    pub const ACL_INDEX: &str = "acl:index";
    /// Index of every cached (resource, action) entry key
    pub const ASSIGNMENT_INDEX: &str = "resource-action:index";
    /// Present once the assignment entries have been built
    pub const ASSIGNMENT_BUILT: &str = "resource-action:built";
    /// Held while any instance recomputes or mutates
    pub const RECOMPUTE_LOCK: &str = "recompute:lock";

    /// ACL ids reachable from `acl_id` through nesting edges
    pub fn closure(acl_id: &str) -> String {
        format!("{}:acl-closure", acl_id)
    }

    /// Users reachable from `acl_id`
    pub fn members(acl_id: &str) -> String {
        format!("{}:members", acl_id)
    }

    /// Present once both sets of `acl_id` have been written
    pub fn computed(acl_id: &str) -> String {
        format!("{}:computed", acl_id)
    }

    /// Present while `acl_id` is known not to exist
    pub fn absent(acl_id: &str) -> String {
        format!("{}:absent", acl_id)
    }

    /// Every key that belongs to `acl_id`
    pub fn all_for_acl(acl_id: &str) -> Vec<String> {
        vec![
            closure(acl_id),
            members(acl_id),
            computed(acl_id),
            absent(acl_id),
        ]
    }

    /// Governing ACL of a (resource, action) pair
    ///
    /// The resource id is length-prefixed so that ids containing ':' cannot
    /// collide with a different split of resource and action.
    pub fn assignment(resource_id: &str, action_id: &str) -> String {
        format!(
            "resource-action:{}:{}:{}",
            resource_id.len(),
            resource_id,
            action_id
        )
    }
}

/// Which backend to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis { url: String },
}

impl Default for CacheBackend {
    fn default() -> Self {
        CacheBackend::Memory
    }
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Prepended to every key in networked backends
    pub key_prefix: String,
    /// Upper bound on a single networked cache operation
    pub timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            key_prefix: "alea-acl:".to_string(),
            timeout: Duration::from_millis(250),
        }
    }
}

/// Connect the configured backend
pub async fn connect_cache(config: &CacheConfig) -> Result<Arc<dyn CacheStore>, CacheError> {
    match &config.backend {
        CacheBackend::Memory => {
            info!("Using in-process cache");
            Ok(Arc::new(MemoryCache::new()))
        }
        CacheBackend::Redis { url } => {
            let cache = RedisCache::connect(url, &config.key_prefix, config.timeout).await?;
            info!(prefix = %config.key_prefix, "Using Redis cache");
            Ok(Arc::new(cache))
        }
    }
}
