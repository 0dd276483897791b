//! Advisory per-key locks held across one read-check-write sequence
//!
//! The engine locks the UID being written, then every (OU, identifying
//! number) pair it is about to claim, so two concurrent calls cannot both
//! pass the uniqueness pre-checks. Each batch is acquired in sorted order
//! and UID locks always come before number locks.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Entries kept before idle locks are pruned
const PRUNE_THRESHOLD: usize = 1024;

pub fn uid_key(uid: &str) -> String {
    format!("uid:{}", uid.trim().to_lowercase())
}

pub fn ou_key(ou: &str) -> String {
    format!("ou:{}", ou.trim().to_lowercase())
}

pub fn number_key(ou: &str, number: &str) -> String {
    format!("num:{}:{}", ou.trim().to_lowercase(), number.trim())
}

#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Guards for a set of keys; released on drop
pub struct KeyedGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
    keys: Vec<String>,
}

impl KeyedGuard {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Lock every key, deduplicated, in lexical order
    pub async fn lock_all<I>(&self, keys: I) -> KeyedGuard
    where
        I: IntoIterator<Item = String>,
    {
        if self.locks.len() > PRUNE_THRESHOLD {
            self.prune();
        }

        let keys: Vec<String> = keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let mut guards = Vec::with_capacity(keys.len());

        for key in &keys {
            let lock = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
            trace!(key = %key, "Acquired lock");
        }

        KeyedGuard {
            _guards: guards,
            keys,
        }
    }

    /// Drop locks nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
