//! The majority finality service.
//!
//! Periodically polls every ready upstream for its finality view, collapses the reports into a
//! majority head, and publishes head updates to the subscribers that materialize checkpoint
//! bundles. The serving checkpoint only advances once the bundle for the majority root is fully
//! present locally and sits on an epoch boundary; until then the previous bundle keeps being
//! served.

use crate::eth2::types::{BlockId, FinalityCheckpointsData, StateId};
use crate::provider::block_cache::BlockCache;
use crate::provider::downloader::BundleDownloader;
use crate::provider::events::EventBroker;
use crate::provider::majority::Checkpoints;
use crate::provider::metrics;
use crate::provider::state_cache::StateCache;
use crate::provider::upstream::{NodeConfig, UpstreamPool};
use crate::provider::{calculate_expiration, Error};
use crate::types::{Epoch, Hash256, SignedBeaconBlock, Slot};
use futures::future;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant};

/// Interval between finality checks.
pub const FINALITY_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before the first genesis bundle check.
pub const GENESIS_CHECK_DELAY: Duration = Duration::from_secs(5);

/// Interval between proactive cache sweeps.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn default_namespace() -> String {
    "harbor".to_string()
}

fn default_max_block_items() -> usize {
    200
}

fn default_max_state_items() -> usize {
    5
}

fn default_historical_distance() -> u64 {
    10
}

fn default_slots_per_epoch() -> u64 {
    32
}

fn default_upstream_timeout_millis() -> u64 {
    15_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Distinguishes metrics and logs when multiple provider instances run in one process.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub upstreams: Vec<NodeConfig>,
    #[serde(default = "default_max_block_items")]
    pub max_block_items: usize,
    #[serde(default = "default_max_state_items")]
    pub max_state_items: usize,
    /// How many epoch boundaries behind the finalized checkpoint to back-fill.
    #[serde(default = "default_historical_distance")]
    pub historical_distance: u64,
    /// Epoch length used for serving alignment until an upstream reports the real value.
    #[serde(default = "default_slots_per_epoch")]
    pub slots_per_epoch_override: u64,
    #[serde(default = "default_upstream_timeout_millis")]
    pub upstream_timeout_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            upstreams: vec![],
            max_block_items: default_max_block_items(),
            max_state_items: default_max_state_items(),
            historical_distance: default_historical_distance(),
            slots_per_epoch_override: default_slots_per_epoch(),
            upstream_timeout_millis: default_upstream_timeout_millis(),
        }
    }
}

/// A snapshot of one upstream's health, as exposed by the query API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamStatus {
    pub name: String,
    pub healthy: bool,
    pub finality: Option<FinalityCheckpointsData>,
}

struct Inner {
    config: Config,
    pool: Arc<UpstreamPool>,
    blocks: Arc<BlockCache>,
    states: Arc<StateCache>,
    downloader: BundleDownloader,
    broker: EventBroker,
    /// The most recent majority finality observed, materialized or not.
    head: RwLock<Option<FinalityCheckpointsData>>,
    /// The finality whose bundle is fully present locally and currently served.
    current_bundle: RwLock<Option<FinalityCheckpointsData>>,
    /// Epoch length reported by an upstream, once seen.
    slots_per_epoch: RwLock<Option<u64>>,
}

#[derive(Clone)]
pub struct MajorityService {
    inner: Arc<Inner>,
    log: Logger,
}

impl MajorityService {
    pub fn new(config: Config, log: Logger) -> Result<Self, Error> {
        let namespace = config.namespace.clone();
        let timeout = Duration::from_millis(config.upstream_timeout_millis);

        let pool = Arc::new(UpstreamPool::new(
            config.upstreams.clone(),
            timeout,
            &namespace,
            log.new(o!("service" => "upstream_pool")),
        )?);
        let blocks = Arc::new(BlockCache::new(
            log.new(o!("service" => "block_store")),
            config.max_block_items,
            &namespace,
        ));
        let states = Arc::new(StateCache::new(
            log.new(o!("service" => "state_store")),
            config.max_state_items,
            &namespace,
        ));
        let downloader = BundleDownloader::new(
            pool.clone(),
            blocks.clone(),
            states.clone(),
            &namespace,
            log.new(o!("service" => "bundle_downloader")),
        );
        let broker = EventBroker::new(log.new(o!("service" => "events")));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                blocks,
                states,
                downloader,
                broker,
                head: RwLock::new(None),
                current_bundle: RwLock::new(None),
                slots_per_epoch: RwLock::new(None),
            }),
            log,
        })
    }

    /// Start the provider's background tasks. All of them stop when `shutdown` fires.
    pub fn start(&self, shutdown: watch::Receiver<()>) {
        self.inner.pool.start_update_service(shutdown.clone());

        let service = self.clone();
        self.inner.broker.on_finality_head_updated(
            "bundle_downloader",
            shutdown.clone(),
            move |checkpoint| {
                let service = service.clone();
                async move { service.handle_finality_updated(checkpoint) }
            },
        );

        let service = self.clone();
        self.inner.broker.on_finality_head_updated(
            "historical_backfill",
            shutdown.clone(),
            move |checkpoint| {
                let service = service.clone();
                async move { service.fetch_historical_checkpoints(checkpoint).await }
            },
        );

        let service = self.clone();
        let mut sweep_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval =
                interval_at(Instant::now() + CACHE_SWEEP_INTERVAL, CACHE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = sweep_shutdown.changed() => break,
                    _ = interval.tick() => {
                        service.inner.blocks.prune();
                        service.inner.states.prune();
                    }
                }
            }
        });

        let service = self.clone();
        let mut tick_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = interval_at(
                Instant::now() + FINALITY_CHECK_INTERVAL,
                FINALITY_CHECK_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = tick_shutdown.changed() => {
                        debug!(service.log, "Finality check loop shut down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = service.check_finality().await {
                            error!(service.log, "Failed to check finality"; "error" => %e);
                        }
                        // Touches the genesis entries on every tick, which keeps them out of
                        // reach of the eviction policies, and retries a failed initial fetch.
                        if let Err(e) = service.check_genesis().await {
                            debug!(service.log, "Genesis check failed"; "error" => %e);
                        }
                    }
                }
            }
        });

        let service = self.clone();
        let mut genesis_shutdown = shutdown;
        tokio::spawn(async move {
            tokio::select! {
                _ = genesis_shutdown.changed() => {}
                _ = sleep(GENESIS_CHECK_DELAY) => {
                    if let Err(e) = service.check_genesis().await {
                        error!(service.log, "Failed to check for genesis"; "error" => %e);
                    }
                }
            }
        });

        info!(
            self.log,
            "Majority finality provider started";
            "namespace" => &self.inner.config.namespace,
            "upstreams" => self.inner.pool.nodes().len(),
        );
    }

    /// Collect finality from every ready upstream and apply the majority.
    ///
    /// Collection order is irrelevant: the aggregation is order-independent.
    pub async fn check_finality(&self) -> Result<(), Error> {
        let ready = self.inner.pool.ready();
        let mut reports = Vec::with_capacity(ready.len());

        let queries = ready.into_iter().map(|node| async move {
            let result = node
                .client
                .get_beacon_states_finality_checkpoints(StateId::Head)
                .await;
            (node, result)
        });

        for (node, result) in future::join_all(queries).await {
            match result {
                Ok(Some(response)) => {
                    node.note_finality(response.data.clone());
                    reports.push(response.data);
                }
                Ok(None) => {
                    info!(
                        self.log,
                        "Upstream has no finality for its head";
                        "node" => &node.config.name,
                    );
                }
                Err(e) => {
                    info!(
                        self.log,
                        "Failed to get finality from node";
                        "node" => &node.config.name,
                        "error" => %e,
                    );
                    metrics::inc_counter_vec(
                        &metrics::UPSTREAM_ERRORS,
                        &[&self.inner.config.namespace, &node.config.name],
                    );
                }
            }
        }

        let majority = Checkpoints::new(reports).majority()?;
        self.apply_finality(majority)
    }

    /// Apply an aggregated majority: advance the head view, publish, and attempt to advance the
    /// serving view.
    fn apply_finality(&self, majority: FinalityCheckpointsData) -> Result<(), Error> {
        let head_changed = {
            let mut head = self.inner.head.write();
            let changed = head
                .as_ref()
                .map_or(true, |current| current.finalized.root != majority.finalized.root);
            if changed {
                if let Some(current) = head.as_ref() {
                    // A reorg across finality may lower the epoch; permitted, but worth noting.
                    if majority.finalized.epoch < current.finalized.epoch {
                        warn!(
                            self.log,
                            "Majority finalized checkpoint moved to an earlier epoch";
                            "previous_epoch" => %current.finalized.epoch,
                            "new_epoch" => %majority.finalized.epoch,
                        );
                    }
                }
                *head = Some(majority.clone());
            }
            changed
        };

        if head_changed {
            metrics::set_gauge_vec(
                &metrics::HEAD_EPOCH,
                &[&self.inner.config.namespace],
                majority.finalized.epoch.as_u64() as i64,
            );
            self.inner
                .broker
                .publish_finality_head_updated(majority.clone());
            info!(
                self.log,
                "New finalized head checkpoint";
                "epoch" => %majority.finalized.epoch,
                "root" => ?majority.finalized.root,
            );
        }

        let serving_current = self
            .inner
            .current_bundle
            .read()
            .as_ref()
            .map_or(false, |bundle| {
                bundle.finalized.root == majority.finalized.root
            });
        if !serving_current {
            self.update_serving_checkpoint(majority)?;
        }

        Ok(())
    }

    /// Promote `checkpoint` to the serving view, provided its bundle is materialized and the
    /// block sits on an epoch boundary. On failure nothing changes and the next tick retries.
    pub fn update_serving_checkpoint(
        &self,
        checkpoint: FinalityCheckpointsData,
    ) -> Result<(), Error> {
        if self.inner.current_bundle.read().as_ref() == Some(&checkpoint) {
            return Ok(());
        }

        let block = self
            .inner
            .blocks
            .get_by_root(&checkpoint.finalized.root)
            .ok_or(Error::BlockNotFound)?;

        if self
            .inner
            .states
            .get_by_state_root(&block.state_root())
            .is_none()
        {
            return Err(Error::StateNotFound);
        }

        let slot = block.slot();
        if !slot.is_epoch_boundary(self.slots_per_epoch()) {
            return Err(Error::NotEpochAligned(slot));
        }

        *self.inner.current_bundle.write() = Some(checkpoint.clone());
        metrics::set_gauge_vec(
            &metrics::SERVING_EPOCH,
            &[&self.inner.config.namespace],
            checkpoint.finalized.epoch.as_u64() as i64,
        );
        info!(
            self.log,
            "Serving a new finalized checkpoint bundle";
            "epoch" => %checkpoint.finalized.epoch,
            "root" => ?checkpoint.finalized.root,
        );

        Ok(())
    }

    /// Ensure the genesis bundle is present, fetching it if necessary.
    ///
    /// When the bundle already exists the lookups double as touches, refreshing the pinned
    /// entries' recency.
    pub async fn check_genesis(&self) -> Result<(), Error> {
        if let Some(block) = self.inner.blocks.get_by_slot(Slot::new(0)) {
            if self
                .inner
                .states
                .get_by_state_root(&block.state_root())
                .is_some()
            {
                return Ok(());
            }
        }

        debug!(self.log, "Fetching genesis block and state");

        let node = self
            .inner
            .pool
            .random_ready()
            .ok_or(Error::NoCandidateNodes)?;

        let genesis_block = node
            .client
            .fetch_block(BlockId::Genesis)
            .await?
            .ok_or(Error::BlockNotFound)?;
        let root = genesis_block.canonical_root();

        if self.inner.downloader.exists_in_queue(&root) {
            return Ok(());
        }

        self.inner.downloader.add_to_queue(root)?;
        info!(self.log, "Added genesis bundle to download queue"; "root" => ?root);

        Ok(())
    }

    /// Head-updated subscriber: schedule the bundle download for the new majority root.
    fn handle_finality_updated(&self, checkpoint: FinalityCheckpointsData) -> Result<(), Error> {
        self.inner.downloader.add_to_queue(checkpoint.finalized.root)
    }

    /// Head-updated subscriber: back-fill the trailing window of epoch-boundary blocks.
    async fn fetch_historical_checkpoints(
        &self,
        checkpoint: FinalityCheckpointsData,
    ) -> Result<(), Error> {
        let node = self
            .inner
            .pool
            .random_data_provider()
            .ok_or(Error::NoCandidateNodes)?;

        let spec = node.client.get_config_spec().await?.data;
        let genesis = node.client.get_beacon_genesis().await?.data;

        // Prefer the epoch length the network actually reports over the configured fallback.
        *self.inner.slots_per_epoch.write() = Some(spec.slots_per_epoch);

        for slot in historical_slots(
            checkpoint.finalized.epoch,
            spec.slots_per_epoch,
            self.inner.config.historical_distance,
        ) {
            if self.inner.blocks.get_by_slot(slot).is_some() {
                continue;
            }

            info!(self.log, "Fetching historical block"; "slot" => %slot);

            let block = match node.client.fetch_block(BlockId::Slot(slot)).await? {
                Some(block) => block,
                // An empty slot; the boundary block lives at an earlier slot we don't index.
                None => continue,
            };

            debug!(
                self.log,
                "Fetched historical block";
                "slot" => %slot,
                "state_root" => ?block.state_root(),
            );

            let expires_at =
                calculate_expiration(block.slot(), spec.seconds_per_slot, genesis.genesis_time);
            self.inner.blocks.add(Arc::new(block), expires_at);
        }

        Ok(())
    }

    /// The epoch length used for serving alignment.
    pub fn slots_per_epoch(&self) -> u64 {
        self.inner
            .slots_per_epoch
            .read()
            .unwrap_or(self.inner.config.slots_per_epoch_override)
    }

    /*
     * Query API. Non-blocking: these consult the stores and the current snapshots only and
     * never trigger downloads.
     */

    pub fn healthy(&self) -> bool {
        !self.inner.pool.healthy().is_empty()
    }

    pub fn syncing(&self) -> bool {
        self.inner.pool.not_syncing().is_empty()
    }

    /// The checkpoint currently being served, guaranteed materialized and aligned.
    pub fn finality(&self) -> Option<FinalityCheckpointsData> {
        self.inner.current_bundle.read().clone()
    }

    /// The most recent majority head, whether or not materialized.
    pub fn head(&self) -> Option<FinalityCheckpointsData> {
        self.inner.head.read().clone()
    }

    pub fn get_block_by_slot(&self, slot: Slot) -> Result<Arc<SignedBeaconBlock>, Error> {
        self.inner.blocks.get_by_slot(slot).ok_or(Error::BlockNotFound)
    }

    pub fn get_block_by_root(&self, root: &Hash256) -> Result<Arc<SignedBeaconBlock>, Error> {
        self.inner.blocks.get_by_root(root).ok_or(Error::BlockNotFound)
    }

    pub fn get_block_by_state_root(
        &self,
        state_root: &Hash256,
    ) -> Result<Arc<SignedBeaconBlock>, Error> {
        self.inner
            .blocks
            .get_by_state_root(state_root)
            .ok_or(Error::BlockNotFound)
    }

    pub fn get_beacon_state_by_slot(&self, slot: Slot) -> Result<Arc<Vec<u8>>, Error> {
        let block = self.get_block_by_slot(slot)?;
        self.get_beacon_state_by_state_root(&block.state_root())
    }

    pub fn get_beacon_state_by_root(&self, root: &Hash256) -> Result<Arc<Vec<u8>>, Error> {
        let block = self.get_block_by_root(root)?;
        self.get_beacon_state_by_state_root(&block.state_root())
    }

    pub fn get_beacon_state_by_state_root(
        &self,
        state_root: &Hash256,
    ) -> Result<Arc<Vec<u8>>, Error> {
        self.inner
            .states
            .get_by_state_root(state_root)
            .ok_or(Error::StateNotFound)
    }

    /// Per-upstream health and the finality view each node last reported.
    pub fn upstreams_status(&self) -> HashMap<String, UpstreamStatus> {
        self.inner
            .pool
            .nodes()
            .iter()
            .map(|node| {
                (
                    node.config.name.clone(),
                    UpstreamStatus {
                        name: node.config.name.clone(),
                        healthy: node.is_healthy(),
                        finality: node.last_finality(),
                    },
                )
            })
            .collect()
    }
}

/// The epoch-boundary slots to back-fill behind a finalized epoch, most recent first.
///
/// Slot 0 is excluded: genesis is handled by its own pinned bundle.
fn historical_slots(finalized_epoch: Epoch, slots_per_epoch: u64, distance: u64) -> Vec<Slot> {
    let current_slot = finalized_epoch.start_slot(slots_per_epoch).as_u64();
    (1..distance)
        .filter_map(|i| {
            current_slot
                .checked_sub(i * slots_per_epoch)
                .filter(|slot| *slot != 0)
                .map(Slot::new)
        })
        .collect()
}
