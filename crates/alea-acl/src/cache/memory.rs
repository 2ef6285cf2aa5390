//! In-process cache backend

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{CacheError, CacheStore};

#[derive(Debug, Clone)]
enum CachedValue {
    Scalar(String),
    /// Never mutated in place; writers install a new `Arc`
    Set(Arc<HashSet<String>>),
}

/// Cache backed by a concurrent map, for single-instance deployments
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CachedValue>,
    /// Lock key to holder token and expiry
    locks: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, locks excluded
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the set at `key`, if any
    fn set_snapshot(&self, key: &str) -> Result<Option<Arc<HashSet<String>>>, CacheError> {
        match self.entries.get(key) {
            Some(value) => match value.value() {
                CachedValue::Set(set) => Ok(Some(Arc::clone(set))),
                CachedValue::Scalar(_) => Err(CacheError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set_entry(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), CachedValue::Scalar(value.to_string()));
        Ok(())
    }

    async fn get_entry(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.entries.get(key) {
            Some(value) => match value.value() {
                CachedValue::Scalar(s) => Ok(Some(s.clone())),
                CachedValue::Set(_) => Err(CacheError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    async fn add_to_set(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
        if members.is_empty() {
            return Ok(());
        }
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                CachedValue::Set(set) => {
                    let mut next = (**set).clone();
                    next.extend(members.iter().cloned());
                    *set = Arc::new(next);
                    Ok(())
                }
                CachedValue::Scalar(_) => Err(CacheError::WrongType(key.to_string())),
            },
            Entry::Vacant(vacant) => {
                vacant.insert(CachedValue::Set(Arc::new(members.iter().cloned().collect())));
                Ok(())
            }
        }
    }

    async fn get_from_set(&self, key: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .set_snapshot(key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_member_of_set(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        Ok(self
            .set_snapshot(key)?
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    async fn replace_set(&self, key: &str, members: &[String]) -> Result<(), CacheError> {
        if members.is_empty() {
            self.entries.remove(key);
        } else {
            let next: HashSet<String> = members.iter().cloned().collect();
            self.entries
                .insert(key.to_string(), CachedValue::Set(Arc::new(next)));
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let (holder, expires) = occupied.get();
                if holder != token && *expires > now {
                    return Ok(false);
                }
                occupied.insert((token.to_string(), now + ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert((token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<(), CacheError> {
        self.locks.remove_if(key, |_, (holder, _)| holder == token);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
