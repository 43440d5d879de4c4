//! Fetches checkpoint bundles (a finalized block and its beacon state) into the local stores.
//!
//! Downloads are single-flight per block root: while a task for a root is alive, further
//! enqueues of the same root are no-ops. A task that exhausts its retry budget is dropped and
//! logged, leaving the root eligible for a future enqueue (typically the next head update).

use crate::eth2::types::BlockId;
use crate::provider::block_cache::BlockCache;
use crate::provider::metrics;
use crate::provider::state_cache::StateCache;
use crate::provider::upstream::{random_node, CandidateNode, UpstreamPool};
use crate::provider::{calculate_expiration, Error};
use crate::types::{Hash256, Slot};
use parking_lot::Mutex;
use slog::{debug, info, warn, Logger};
use std::collections::HashSet;
use std::sync::Arc;

/// Attempts per bundle, each against a freshly selected upstream.
pub const MAX_DOWNLOAD_ATTEMPTS: usize = 3;

/// Upper bound on concurrently pending bundle tasks.
pub const MAX_PENDING_BUNDLES: usize = 32;

#[derive(Clone)]
pub struct BundleDownloader {
    pool: Arc<UpstreamPool>,
    blocks: Arc<BlockCache>,
    states: Arc<StateCache>,
    pending: Arc<Mutex<HashSet<Hash256>>>,
    namespace: String,
    log: Logger,
}

impl BundleDownloader {
    pub fn new(
        pool: Arc<UpstreamPool>,
        blocks: Arc<BlockCache>,
        states: Arc<StateCache>,
        namespace: &str,
        log: Logger,
    ) -> Self {
        Self {
            pool,
            blocks,
            states,
            pending: Arc::new(Mutex::new(HashSet::new())),
            namespace: namespace.to_string(),
            log,
        }
    }

    /// True if a task for `root` is in flight.
    pub fn exists_in_queue(&self, root: &Hash256) -> bool {
        self.pending.lock().contains(root)
    }

    /// Enqueue a bundle download for `root`, spawning the task.
    ///
    /// Enqueueing a root that is already in flight is a no-op.
    pub fn add_to_queue(&self, root: Hash256) -> Result<(), Error> {
        {
            let mut pending = self.pending.lock();
            if pending.contains(&root) {
                return Ok(());
            }
            if pending.len() >= MAX_PENDING_BUNDLES {
                return Err(Error::QueueSaturated);
            }
            pending.insert(root);
        }

        let downloader = self.clone();
        tokio::spawn(async move {
            let result = downloader.download_bundle(root).await;
            downloader.pending.lock().remove(&root);

            match result {
                Ok(()) => {
                    metrics::inc_counter_vec(
                        &metrics::BUNDLE_DOWNLOADS,
                        &[&downloader.namespace, "success"],
                    );
                    debug!(downloader.log, "Bundle download complete"; "root" => ?root);
                }
                Err(e) => {
                    metrics::inc_counter_vec(
                        &metrics::BUNDLE_DOWNLOADS,
                        &[&downloader.namespace, "dropped"],
                    );
                    warn!(
                        downloader.log,
                        "Dropped bundle download";
                        "root" => ?root,
                        "error" => %e,
                    );
                }
            }
        });

        Ok(())
    }

    async fn download_bundle(&self, root: Hash256) -> Result<(), Error> {
        // Nothing to do if the bundle is already materialized.
        if let Some(block) = self.blocks.get_by_root(&root) {
            if self.states.get_by_state_root(&block.state_root()).is_some() {
                return Ok(());
            }
        }

        let mut tried: Vec<String> = Vec::new();
        let mut last_error = Error::NoCandidateNodes;
        for attempt in 1..=MAX_DOWNLOAD_ATTEMPTS {
            // Prefer an upstream that has not failed this bundle yet.
            let untried: Vec<_> = self
                .pool
                .data_providers()
                .into_iter()
                .filter(|node| !tried.contains(&node.config.name))
                .collect();
            let node = random_node(&untried)
                .or_else(|| self.pool.random_data_provider())
                .ok_or(Error::NoCandidateNodes)?;

            tried.push(node.config.name.clone());

            match self.try_fetch(&node, root).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    info!(
                        self.log,
                        "Bundle fetch attempt failed";
                        "node" => &node.config.name,
                        "attempt" => attempt,
                        "root" => ?root,
                        "error" => %e,
                    );
                    metrics::inc_counter_vec(
                        &metrics::UPSTREAM_ERRORS,
                        &[&self.namespace, &node.config.name],
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Fetch the missing pieces of the bundle from a single upstream.
    ///
    /// The block and its state are admitted with one shared expiry so the bundle ages out as a
    /// unit.
    async fn try_fetch(&self, node: &CandidateNode, root: Hash256) -> Result<(), Error> {
        let client = &node.client;
        let spec = client.get_config_spec().await?.data;
        let genesis = client.get_beacon_genesis().await?.data;

        let (block, newly_fetched) = match self.blocks.get_by_root(&root) {
            Some(block) => (block, false),
            None => {
                let block = client
                    .fetch_block(BlockId::Root(root))
                    .await?
                    .ok_or(Error::BlockNotFound)?;

                let computed = block.canonical_root();
                if computed != root {
                    return Err(Error::RootMismatch {
                        requested: root,
                        computed,
                    });
                }

                (Arc::new(block), true)
            }
        };

        let expires_at =
            calculate_expiration(block.slot(), spec.seconds_per_slot, genesis.genesis_time);

        if newly_fetched {
            self.blocks.add(block.clone(), expires_at);
        }

        let state_root = block.state_root();
        if self.states.get_by_state_root(&state_root).is_none() {
            let state = client
                .fetch_beacon_state(state_root)
                .await?
                .ok_or(Error::StateNotFound)?;
            self.states.add(state_root, Arc::new(state), expires_at);
        }

        if block.slot() == Slot::new(0) {
            self.states.pin(&state_root);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn downloader() -> BundleDownloader {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let pool = Arc::new(
            UpstreamPool::new(vec![], Duration::from_secs(1), "test", log.clone()).unwrap(),
        );
        let blocks = Arc::new(BlockCache::new(log.clone(), 16, "test"));
        let states = Arc::new(StateCache::new(log.clone(), 16, "test"));
        BundleDownloader::new(pool, blocks, states, "test", log)
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_a_no_op() {
        let downloader = downloader();
        let root = Hash256::from_low_u64_be(0xaa);

        downloader.add_to_queue(root).unwrap();
        assert!(downloader.exists_in_queue(&root));

        // A second enqueue while the task is alive neither errors nor adds a task.
        downloader.add_to_queue(root).unwrap();
        assert_eq!(downloader.pending.lock().len(), 1);
    }

    #[tokio::test]
    async fn dropped_task_frees_the_root() {
        let downloader = downloader();
        let root = Hash256::from_low_u64_be(0xaa);

        downloader.add_to_queue(root).unwrap();
        assert!(downloader.exists_in_queue(&root));

        // With no upstream nodes the task fails fast and must release the root.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!downloader.exists_in_queue(&root));

        // The root is eligible for enqueueing again.
        downloader.add_to_queue(root).unwrap();
        assert!(downloader.exists_in_queue(&root));
    }

    #[tokio::test]
    async fn queue_saturation_is_an_error() {
        let downloader = downloader();

        for i in 0..MAX_PENDING_BUNDLES {
            downloader
                .add_to_queue(Hash256::from_low_u64_be(i as u64))
                .unwrap();
        }

        assert!(matches!(
            downloader.add_to_queue(Hash256::from_low_u64_be(0xffff)),
            Err(Error::QueueSaturated)
        ));
    }
}
