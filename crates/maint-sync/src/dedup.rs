//! Idempotency filter for records that must not be delivered twice.
//!
//! Each domain owns a set of keys with a single expiry. Adding a key refreshes
//! the expiry of the whole set, so a domain that keeps seeing new records keeps
//! remembering the old ones; a domain that goes quiet for a full TTL forgets
//! everything at once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use maint_std::time::GetNow;

use crate::{error::SyncError, traits::DedupStore};

struct DomainSet {
    keys: HashSet<String>,
    expires_at: DateTime<Utc>,
}

/// In-process [`DedupStore`]. Only deduplicates within one process.
pub struct MemoryDedupStore<C> {
    domains: Arc<Mutex<HashMap<String, DomainSet>>>,
    clock: C,
}

impl<C: Clone> Clone for MemoryDedupStore<C> {
    fn clone(&self) -> Self {
        Self {
            domains: Arc::clone(&self.domains),
            clock: self.clock.clone(),
        }
    }
}

impl<C: GetNow> MemoryDedupStore<C> {
    pub fn new(clock: C) -> Self {
        Self {
            domains: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn mark(&self, domain: &str, key: &str, ttl: Duration) -> bool {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut domains = self
            .domains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let set = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainSet {
                keys: HashSet::new(),
                expires_at: now,
            });
        if set.expires_at <= now {
            set.keys.clear();
        }
        if !set.keys.insert(key.to_string()) {
            return false;
        }
        set.expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        true
    }

    fn contains(&self, domain: &str, key: &str) -> bool {
        let now = self.clock.now();
        self.domains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(domain)
            .is_some_and(|set| set.expires_at > now && set.keys.contains(key))
    }
}

impl<C> DedupStore for MemoryDedupStore<C>
where
    C: GetNow + Clone + Send + Sync + 'static,
{
    async fn try_mark(&self, domain: &str, key: &str, ttl: Duration) -> Result<bool, SyncError> {
        Ok(self.mark(domain, key, ttl))
    }

    async fn is_marked(&self, domain: &str, key: &str) -> Result<bool, SyncError> {
        Ok(self.contains(domain, key))
    }

    async fn clear(&self, domain: &str) -> Result<(), SyncError> {
        self.domains
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(domain);
        tracing::info!(domain, "Dedup domain cleared");
        Ok(())
    }
}

/// Keep the items whose key is not marked in `domain`, in their original
/// order. Keys repeated within `items` are kept once.
///
/// Nothing is marked here. Once the kept items have been delivered, record
/// them with [`mark_all`]; an undelivered item stays unmarked and is offered
/// again on the next pass.
pub async fn filter_unseen<D, T, K>(
    store: &D,
    domain: &str,
    items: Vec<T>,
    key: K,
) -> Result<Vec<T>, SyncError>
where
    D: DedupStore,
    K: Fn(&T) -> &str,
{
    let total = items.len();
    let mut in_batch = HashSet::new();
    let mut fresh = Vec::with_capacity(total);
    for item in items {
        let k = key(&item);
        if in_batch.contains(k) || store.is_marked(domain, k).await? {
            continue;
        }
        in_batch.insert(k.to_string());
        fresh.push(item);
    }
    if fresh.len() < total {
        tracing::debug!(domain, total, fresh = fresh.len(), "Dropped already-seen records");
    }
    Ok(fresh)
}

/// Mark every key in `domain`. Returns how many were newly marked.
pub async fn mark_all<'a, D, I>(store: &D, domain: &str, ttl: Duration, keys: I) -> Result<usize, SyncError>
where
    D: DedupStore,
    I: IntoIterator<Item = &'a str>,
{
    let mut marked = 0;
    for key in keys {
        if store.try_mark(domain, key, ttl).await? {
            marked += 1;
        }
    }
    Ok(marked)
}
