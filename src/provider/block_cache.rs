//! A bounded store of finalized blocks, indexed by block root, slot and state root.
//!
//! Entries carry an expiry and are removed lazily on access as well as by the periodic sweep.
//! Under capacity pressure the least-recently-used unexpired entry is evicted. The genesis
//! block (slot 0) is pinned: it is exempt from both expiry and eviction.

use crate::provider::metrics;
use crate::types::{Hash256, SignedBeaconBlock, Slot};
use parking_lot::RwLock;
use slog::{debug, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

struct CacheEntry {
    block: Arc<SignedBeaconBlock>,
    expires_at: SystemTime,
    inserted_at: Instant,
    last_access: Instant,
    pinned: bool,
}

struct Inner {
    by_root: HashMap<Hash256, CacheEntry>,
    by_slot: HashMap<Slot, Hash256>,
    by_state_root: HashMap<Hash256, Hash256>,
    max_items: usize,
}

impl Inner {
    fn remove(&mut self, root: &Hash256) -> Option<CacheEntry> {
        let entry = self.by_root.remove(root)?;
        // Secondary indexes may have been overwritten by a competing block at the same slot;
        // only remove them if they still point at this entry.
        if self.by_slot.get(&entry.block.slot()) == Some(root) {
            self.by_slot.remove(&entry.block.slot());
        }
        if self.by_state_root.get(&entry.block.state_root()) == Some(root) {
            self.by_state_root.remove(&entry.block.state_root());
        }
        Some(entry)
    }

    fn expired_roots(&self, now: SystemTime) -> Vec<Hash256> {
        self.by_root
            .iter()
            .filter(|(_, entry)| !entry.pinned && entry.expires_at <= now)
            .map(|(root, _)| *root)
            .collect()
    }

    /// The least-recently-used unpinned entry.
    fn lru_root(&self) -> Option<Hash256> {
        self.by_root
            .iter()
            .filter(|(_, entry)| !entry.pinned)
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(root, _)| *root)
    }
}

pub struct BlockCache {
    inner: RwLock<Inner>,
    namespace: String,
    log: Logger,
}

impl BlockCache {
    pub fn new(log: Logger, max_items: usize, namespace: &str) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_root: HashMap::new(),
                by_slot: HashMap::new(),
                by_state_root: HashMap::new(),
                max_items,
            }),
            namespace: namespace.to_string(),
            log,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_root.is_empty()
    }

    /// Insert a block, keyed by its intrinsic identifiers.
    ///
    /// A block at slot 0 is pinned and its `expires_at` is ignored.
    pub fn add(&self, block: Arc<SignedBeaconBlock>, expires_at: SystemTime) {
        let root = block.canonical_root();
        let slot = block.slot();
        let state_root = block.state_root();
        let pinned = slot == Slot::new(0);
        let now = Instant::now();

        let mut inner = self.inner.write();
        inner.by_slot.insert(slot, root);
        inner.by_state_root.insert(state_root, root);
        inner.by_root.insert(
            root,
            CacheEntry {
                block,
                expires_at,
                inserted_at: now,
                last_access: now,
                pinned,
            },
        );

        self.enforce_capacity(&mut inner);
        self.observe_len(&inner);
    }

    /// Returns the block with the given root, touching it for LRU purposes.
    pub fn get_by_root(&self, root: &Hash256) -> Option<Arc<SignedBeaconBlock>> {
        let mut inner = self.inner.write();
        self.get_touching(&mut inner, root)
    }

    pub fn get_by_slot(&self, slot: Slot) -> Option<Arc<SignedBeaconBlock>> {
        let mut inner = self.inner.write();
        let root = *inner.by_slot.get(&slot)?;
        self.get_touching(&mut inner, &root)
    }

    pub fn get_by_state_root(&self, state_root: &Hash256) -> Option<Arc<SignedBeaconBlock>> {
        let mut inner = self.inner.write();
        let root = *inner.by_state_root.get(state_root)?;
        self.get_touching(&mut inner, &root)
    }

    /// Remove expired entries. Called by the background sweep.
    pub fn prune(&self) {
        let now = SystemTime::now();
        let mut inner = self.inner.write();
        for root in inner.expired_roots(now) {
            if let Some(entry) = inner.remove(&root) {
                debug!(
                    self.log,
                    "Pruned expired block";
                    "root" => ?root,
                    "slot" => %entry.block.slot(),
                    "age_secs" => entry.inserted_at.elapsed().as_secs(),
                );
            }
        }
        self.observe_len(&inner);
    }

    fn get_touching(
        &self,
        inner: &mut Inner,
        root: &Hash256,
    ) -> Option<Arc<SignedBeaconBlock>> {
        let expired = {
            let entry = inner.by_root.get(root)?;
            !entry.pinned && entry.expires_at <= SystemTime::now()
        };

        if expired {
            inner.remove(root);
            self.observe_len(inner);
            return None;
        }

        let entry = inner.by_root.get_mut(root)?;
        entry.last_access = Instant::now();
        Some(entry.block.clone())
    }

    fn enforce_capacity(&self, inner: &mut Inner) {
        if inner.by_root.len() <= inner.max_items {
            return;
        }

        // Expired entries go first; after that the least-recently-used unexpired entry.
        let now = SystemTime::now();
        for root in inner.expired_roots(now) {
            if inner.by_root.len() <= inner.max_items {
                return;
            }
            inner.remove(&root);
        }

        while inner.by_root.len() > inner.max_items {
            match inner.lru_root() {
                Some(root) => {
                    if let Some(entry) = inner.remove(&root) {
                        debug!(
                            self.log,
                            "Evicted block under capacity pressure";
                            "root" => ?root,
                            "slot" => %entry.block.slot(),
                        );
                    }
                }
                // Only pinned entries remain.
                None => return,
            }
        }
    }

    fn observe_len(&self, inner: &Inner) {
        metrics::set_gauge_vec(
            &metrics::BLOCK_CACHE_LEN,
            &[&self.namespace],
            inner.by_root.len() as i64,
        );
    }
}
