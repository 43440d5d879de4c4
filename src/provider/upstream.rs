//! Tracks the configured upstream beacon nodes, refreshing each node's status on a background
//! loop and classifying nodes as healthy, ready or data providers.
//!
//! A node that fails a status refresh is marked offline and excluded from selection until a
//! later refresh succeeds; individual request failures never abort pool-wide operations.

use crate::eth2::types::FinalityCheckpointsData;
use crate::eth2::{self, BeaconNodeHttpClient};
use crate::provider::metrics;
use crate::types::Slot;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use slog::{debug, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use url::Url;

/// How often each node's status is refreshed.
pub const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Sync distances up to this many slots still count as healthy.
pub const SYNC_TOLERANCE: u64 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub url: String,
    #[serde(default, alias = "is_data_provider")]
    pub data_provider: bool,
}

/// Reasons why a candidate might not be usable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CandidateError {
    Uninitialized,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeStatus {
    pub head_slot: Slot,
    pub sync_distance: Slot,
    pub is_syncing: bool,
}

/// An upstream node that may or may not be used for a query.
pub struct CandidateNode {
    pub config: NodeConfig,
    pub client: BeaconNodeHttpClient,
    status: RwLock<Result<NodeStatus, CandidateError>>,
    last_finality: RwLock<Option<FinalityCheckpointsData>>,
}

impl CandidateNode {
    pub fn new(config: NodeConfig, client: BeaconNodeHttpClient) -> Self {
        Self {
            config,
            client,
            status: RwLock::new(Err(CandidateError::Uninitialized)),
            last_finality: RwLock::new(None),
        }
    }

    pub fn status(&self) -> Result<NodeStatus, CandidateError> {
        *self.status.read()
    }

    /// Reachable and close enough to the head of the chain.
    pub fn is_healthy(&self) -> bool {
        matches!(self.status(), Ok(status) if status.sync_distance.as_u64() <= SYNC_TOLERANCE)
    }

    pub fn is_not_syncing(&self) -> bool {
        matches!(self.status(), Ok(status) if !status.is_syncing)
    }

    /// Healthy and caught up enough to answer finality queries.
    pub fn is_ready(&self) -> bool {
        self.is_healthy() && self.is_not_syncing()
    }

    /// Ready and willing to serve arbitrary historical slots.
    pub fn is_data_provider(&self) -> bool {
        self.is_ready() && self.config.data_provider
    }

    /// The finality report most recently observed from this node, if any.
    pub fn last_finality(&self) -> Option<FinalityCheckpointsData> {
        self.last_finality.read().clone()
    }

    pub fn note_finality(&self, finality: FinalityCheckpointsData) {
        *self.last_finality.write() = Some(finality);
    }

    /// Query the node and update `self.status`.
    pub async fn refresh_status(&self, log: &Logger) -> Result<(), CandidateError> {
        match self.client.get_node_syncing().await {
            Ok(response) => {
                let syncing = response.data;
                debug!(
                    log,
                    "Refreshed upstream status";
                    "node" => &self.config.name,
                    "head_slot" => %syncing.head_slot,
                    "sync_distance" => %syncing.sync_distance,
                    "is_syncing" => syncing.is_syncing,
                );
                *self.status.write() = Ok(NodeStatus {
                    head_slot: syncing.head_slot,
                    sync_distance: syncing.sync_distance,
                    is_syncing: syncing.is_syncing,
                });
                Ok(())
            }
            Err(e) => {
                warn!(
                    log,
                    "Upstream node is offline";
                    "node" => &self.config.name,
                    "error" => %e,
                );
                *self.status.write() = Err(CandidateError::Offline);
                Err(CandidateError::Offline)
            }
        }
    }
}

/// The configured set of upstream nodes.
pub struct UpstreamPool {
    nodes: Vec<Arc<CandidateNode>>,
    namespace: String,
    log: Logger,
}

impl UpstreamPool {
    pub fn new(
        configs: Vec<NodeConfig>,
        timeout: Duration,
        namespace: &str,
        log: Logger,
    ) -> Result<Self, eth2::Error> {
        let nodes = configs
            .into_iter()
            .map(|config| {
                let url = Url::parse(&config.url)
                    .map_err(|e| eth2::Error::InvalidUrl(format!("{}: {}", config.url, e)))?;
                let client = BeaconNodeHttpClient::new(url, timeout)?;
                Ok(Arc::new(CandidateNode::new(config, client)))
            })
            .collect::<Result<Vec<_>, eth2::Error>>()?;

        Ok(Self {
            nodes,
            namespace: namespace.to_string(),
            log,
        })
    }

    /// Spawn one status-refresh loop per node. Loops run until `shutdown` fires.
    pub fn start_update_service(&self, shutdown: watch::Receiver<()>) {
        for node in &self.nodes {
            let node = node.clone();
            let namespace = self.namespace.clone();
            let log = self.log.clone();
            let mut shutdown = shutdown.clone();

            tokio::spawn(async move {
                let mut interval = interval_at(Instant::now(), STATUS_REFRESH_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = interval.tick() => {
                            if node.refresh_status(&log).await.is_err() {
                                metrics::inc_counter_vec(
                                    &metrics::UPSTREAM_ERRORS,
                                    &[&namespace, &node.config.name],
                                );
                            }
                        }
                    }
                }
            });
        }
    }

    pub fn nodes(&self) -> &[Arc<CandidateNode>] {
        &self.nodes
    }

    pub fn healthy(&self) -> Vec<Arc<CandidateNode>> {
        self.filter(CandidateNode::is_healthy)
    }

    pub fn not_syncing(&self) -> Vec<Arc<CandidateNode>> {
        self.filter(CandidateNode::is_not_syncing)
    }

    pub fn ready(&self) -> Vec<Arc<CandidateNode>> {
        self.filter(CandidateNode::is_ready)
    }

    pub fn data_providers(&self) -> Vec<Arc<CandidateNode>> {
        self.filter(CandidateNode::is_data_provider)
    }

    pub fn random_ready(&self) -> Option<Arc<CandidateNode>> {
        random_node(&self.ready())
    }

    pub fn random_data_provider(&self) -> Option<Arc<CandidateNode>> {
        random_node(&self.data_providers())
    }

    fn filter(&self, predicate: impl Fn(&CandidateNode) -> bool) -> Vec<Arc<CandidateNode>> {
        self.nodes
            .iter()
            .filter(|node| predicate(node))
            .cloned()
            .collect()
    }
}

/// Uniform random selection from a filtered set.
pub fn random_node(nodes: &[Arc<CandidateNode>]) -> Option<Arc<CandidateNode>> {
    nodes.choose(&mut rand::thread_rng()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, data_provider: bool) -> Arc<CandidateNode> {
        let config = NodeConfig {
            name: name.to_string(),
            url: format!("http://{}:5052/", name),
            data_provider,
        };
        let url = Url::parse(&config.url).unwrap();
        let client = BeaconNodeHttpClient::new(url, Duration::from_secs(1)).unwrap();
        Arc::new(CandidateNode::new(config, client))
    }

    fn set_status(node: &CandidateNode, sync_distance: u64, is_syncing: bool) {
        *node.status.write() = Ok(NodeStatus {
            head_slot: Slot::new(1000),
            sync_distance: Slot::new(sync_distance),
            is_syncing,
        });
    }

    fn pool(nodes: Vec<Arc<CandidateNode>>) -> UpstreamPool {
        UpstreamPool {
            nodes,
            namespace: "test".to_string(),
            log: slog::Logger::root(slog::Discard, slog::o!()),
        }
    }

    #[test]
    fn uninitialized_nodes_are_not_usable() {
        let pool = pool(vec![node("a", true)]);
        assert!(pool.healthy().is_empty());
        assert!(pool.ready().is_empty());
        assert!(pool.random_ready().is_none());
    }

    #[test]
    fn classification_tiers() {
        let synced = node("synced", false);
        let lagging = node("lagging", false);
        let syncing = node("syncing", false);
        let provider = node("provider", true);

        set_status(&synced, 0, false);
        set_status(&lagging, SYNC_TOLERANCE + 1, false);
        set_status(&syncing, 2, true);
        set_status(&provider, 1, false);

        let pool = pool(vec![synced, lagging, syncing, provider]);

        let names = |nodes: Vec<Arc<CandidateNode>>| -> Vec<String> {
            nodes.iter().map(|n| n.config.name.clone()).collect()
        };

        assert_eq!(names(pool.healthy()), vec!["synced", "syncing", "provider"]);
        assert_eq!(names(pool.not_syncing()), vec!["synced", "lagging", "provider"]);
        assert_eq!(names(pool.ready()), vec!["synced", "provider"]);
        assert_eq!(names(pool.data_providers()), vec!["provider"]);
    }

    #[test]
    fn random_node_draws_from_the_filtered_set() {
        let provider = node("provider", true);
        set_status(&provider, 0, false);
        let pool = pool(vec![node("plain", false), provider]);

        for _ in 0..10 {
            let chosen = pool.random_data_provider().expect("should select a node");
            assert_eq!(chosen.config.name, "provider");
        }
    }
}
