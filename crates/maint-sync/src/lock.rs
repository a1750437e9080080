use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// One mutex per lock domain, created on first use.
///
/// Acquisition is try-only: callers learn immediately whether the domain is
/// busy and never wait for it.
#[derive(Default)]
pub struct LockTable {
    domains: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The guard releases the domain when dropped, including on panic unwind.
    pub fn try_acquire(&self, domain: &str) -> Option<OwnedMutexGuard<()>> {
        let mutex = {
            let mut domains = self
                .domains
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(domains.entry(domain.to_string()).or_default())
        };
        mutex.try_lock_owned().ok()
    }
}
