//! Cached (resource, action) → ACL bindings
//!
//! The whole table is small and changes rarely, so every change rebuilds it.
//! Entries that disappeared from the table are removed through the index set.
//!
//! A key is recorded in the index before its entry is written, so an entry
//! can never outlive a failed rebuild unindexed.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::cache::{keys, CacheError, CacheStore};
use crate::model::ResourceAction;

#[derive(Clone)]
pub struct ResourceAssignmentCache {
    cache: Arc<dyn CacheStore>,
}

impl ResourceAssignmentCache {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Replace every cached binding with `bindings`
    ///
    /// Returns the number of entries written. The built marker is cleared
    /// first and written last, so a partial rebuild reads as cold.
    #[instrument(skip_all, fields(count = bindings.len()))]
    pub async fn rebuild(&self, bindings: &[ResourceAction]) -> Result<usize, CacheError> {
        self.cache
            .delete(&[keys::ASSIGNMENT_BUILT.to_string()])
            .await?;

        let live: Vec<String> = bindings
            .iter()
            .map(|binding| keys::assignment(&binding.resource_id, &binding.action_id))
            .collect();
        self.cache.add_to_set(keys::ASSIGNMENT_INDEX, &live).await?;

        for (key, binding) in live.iter().zip(bindings) {
            self.cache.set_entry(key, &binding.acl_id).await?;
        }

        let current: HashSet<&String> = live.iter().collect();
        let stale: Vec<String> = self
            .cache
            .get_from_set(keys::ASSIGNMENT_INDEX)
            .await?
            .into_iter()
            .filter(|key| !current.contains(key))
            .collect();
        if !stale.is_empty() {
            debug!(stale = stale.len(), "Removing stale bindings");
            self.cache.delete(&stale).await?;
        }

        self.cache.replace_set(keys::ASSIGNMENT_INDEX, &live).await?;
        self.cache
            .set_entry(keys::ASSIGNMENT_BUILT, &Utc::now().to_rfc3339())
            .await?;

        Ok(live.len())
    }

    /// Governing ACL of (resource, action); `None` means no binding
    pub async fn lookup(
        &self,
        resource_id: &str,
        action_id: &str,
    ) -> Result<Option<String>, CacheError> {
        self.cache
            .get_entry(&keys::assignment(resource_id, action_id))
            .await
    }

    pub async fn is_built(&self) -> Result<bool, CacheError> {
        Ok(self.cache.get_entry(keys::ASSIGNMENT_BUILT).await?.is_some())
    }
}
