//! A bounded store of raw beacon-state blobs keyed by state root.
//!
//! States are large, so the default capacity is small. The blobs are never decoded. The genesis
//! state is pinned by the downloader once identified and is exempt from expiry and eviction.

use crate::provider::metrics;
use crate::types::Hash256;
use parking_lot::RwLock;
use slog::{debug, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

struct CacheEntry {
    state: Arc<Vec<u8>>,
    expires_at: SystemTime,
    last_access: Instant,
    pinned: bool,
}

struct Inner {
    by_state_root: HashMap<Hash256, CacheEntry>,
    max_items: usize,
}

pub struct StateCache {
    inner: RwLock<Inner>,
    namespace: String,
    log: Logger,
}

impl StateCache {
    pub fn new(log: Logger, max_items: usize, namespace: &str) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_state_root: HashMap::new(),
                max_items,
            }),
            namespace: namespace.to_string(),
            log,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_state_root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_state_root.is_empty()
    }

    pub fn add(&self, state_root: Hash256, state: Arc<Vec<u8>>, expires_at: SystemTime) {
        let mut inner = self.inner.write();
        // Re-adding a pinned state keeps it pinned.
        let pinned = inner
            .by_state_root
            .get(&state_root)
            .map(|entry| entry.pinned)
            .unwrap_or(false);
        inner.by_state_root.insert(
            state_root,
            CacheEntry {
                state,
                expires_at,
                last_access: Instant::now(),
                pinned,
            },
        );

        self.enforce_capacity(&mut inner);
        self.observe_len(&inner);
    }

    /// Exempt the state with the given root from expiry and eviction.
    pub fn pin(&self, state_root: &Hash256) {
        if let Some(entry) = self.inner.write().by_state_root.get_mut(state_root) {
            entry.pinned = true;
        }
    }

    pub fn get_by_state_root(&self, state_root: &Hash256) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.write();

        let expired = {
            let entry = inner.by_state_root.get(state_root)?;
            !entry.pinned && entry.expires_at <= SystemTime::now()
        };

        if expired {
            inner.by_state_root.remove(state_root);
            self.observe_len(&inner);
            return None;
        }

        let entry = inner.by_state_root.get_mut(state_root)?;
        entry.last_access = Instant::now();
        Some(entry.state.clone())
    }

    /// Remove expired entries. Called by the background sweep.
    pub fn prune(&self) {
        let now = SystemTime::now();
        let mut inner = self.inner.write();
        let expired: Vec<Hash256> = inner
            .by_state_root
            .iter()
            .filter(|(_, entry)| !entry.pinned && entry.expires_at <= now)
            .map(|(root, _)| *root)
            .collect();
        for state_root in expired {
            inner.by_state_root.remove(&state_root);
            debug!(self.log, "Pruned expired beacon state"; "state_root" => ?state_root);
        }
        self.observe_len(&inner);
    }

    fn enforce_capacity(&self, inner: &mut Inner) {
        let now = SystemTime::now();
        while inner.by_state_root.len() > inner.max_items {
            let victim = inner
                .by_state_root
                .iter()
                .filter(|(_, entry)| !entry.pinned)
                .min_by_key(|(_, entry)| (entry.expires_at > now, entry.last_access))
                .map(|(root, _)| *root);

            match victim {
                Some(state_root) => {
                    inner.by_state_root.remove(&state_root);
                    debug!(
                        self.log,
                        "Evicted beacon state under capacity pressure";
                        "state_root" => ?state_root,
                    );
                }
                // Only pinned entries remain.
                None => return,
            }
        }
    }

    fn observe_len(&self, inner: &Inner) {
        metrics::set_gauge_vec(
            &metrics::STATE_CACHE_LEN,
            &[&self.namespace],
            inner.by_state_root.len() as i64,
        );
    }
}
