//! The majority finality provider: polls a pool of trusted upstream beacon nodes, derives the
//! majority-agreed finalized checkpoint and materializes checkpoint bundles into bounded local
//! stores, only ever serving a checkpoint whose block and state are both present and
//! epoch-aligned.

pub mod block_cache;
pub mod downloader;
pub mod events;
pub mod majority;
pub mod metrics;
pub mod service;
pub mod state_cache;
pub mod upstream;

pub use block_cache::BlockCache;
pub use downloader::BundleDownloader;
pub use events::EventBroker;
pub use majority::Checkpoints;
pub use service::{MajorityService, UpstreamStatus};
pub use state_cache::StateCache;
pub use upstream::{NodeConfig, UpstreamPool};

use crate::eth2;
use crate::types::{Hash256, Slot};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a bundle entry may live, at most.
pub const DEFAULT_BUNDLE_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Slots of margin added to an entry's own slot when deriving its expiry from chain time.
///
/// Sized to the historical back-fill window (10 epochs of 32 slots), so the retention of a
/// back-filled boundary is proportional to its recency.
pub const SLOT_LOOKAHEAD: u64 = 320;

#[derive(Debug)]
pub enum Error {
    /// An upstream request failed.
    Eth2(eth2::Error),
    /// No upstream node is usable for the operation.
    NoCandidateNodes,
    /// No finality reports were collected, so there is nothing to aggregate.
    NoCandidateCheckpoints,
    /// The block is not in the local store.
    BlockNotFound,
    /// The beacon state is not in the local store.
    StateNotFound,
    /// The candidate block does not sit on an epoch boundary.
    NotEpochAligned(Slot),
    /// A fetched block's recomputed root disagrees with the requested root.
    RootMismatch {
        requested: Hash256,
        computed: Hash256,
    },
    /// The download queue is full.
    QueueSaturated,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Eth2(e) => write!(f, "upstream request failed: {}", e),
            Error::NoCandidateNodes => write!(f, "no nodes available"),
            Error::NoCandidateCheckpoints => write!(f, "no finality checkpoints to aggregate"),
            Error::BlockNotFound => write!(f, "block not found"),
            Error::StateNotFound => write!(f, "state not found"),
            Error::NotEpochAligned(slot) => {
                write!(f, "block slot is not aligned to an epoch boundary: {}", slot)
            }
            Error::RootMismatch {
                requested,
                computed,
            } => write!(
                f,
                "fetched block root mismatch: requested {:?}, computed {:?}",
                requested, computed
            ),
            Error::QueueSaturated => write!(f, "download queue is saturated"),
        }
    }
}

impl From<eth2::Error> for Error {
    fn from(e: eth2::Error) -> Self {
        Error::Eth2(e)
    }
}

/// The expiry for a cached block or state at `slot`.
///
/// Entries live until the wall-clock time of `slot + SLOT_LOOKAHEAD`, bounded above by
/// `DEFAULT_BUNDLE_TTL` from now. Genesis entries bypass expiry entirely via store pinning.
pub fn calculate_expiration(slot: Slot, seconds_per_slot: u64, genesis_time: u64) -> SystemTime {
    let window_end = UNIX_EPOCH
        + Duration::from_secs(
            genesis_time.saturating_add(
                slot.as_u64()
                    .saturating_add(SLOT_LOOKAHEAD)
                    .saturating_mul(seconds_per_slot),
            ),
        );
    let ttl_end = SystemTime::now() + DEFAULT_BUNDLE_TTL;

    std::cmp::min(ttl_end, window_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after unix epoch")
            .as_secs()
    }

    #[test]
    fn expiration_tracks_the_slot_window() {
        // A chain whose head is roughly "now": slot 3200 at 12 s/slot.
        let genesis_time = unix_now() - 3200 * 12;
        let expires = calculate_expiration(Slot::new(2912), 12, genesis_time);

        // Slot 2912 + lookahead 320 = slot 3232, 32 slots past the present.
        let expected = UNIX_EPOCH + Duration::from_secs(genesis_time + 3232 * 12);
        assert_eq!(expires, expected);
        assert!(expires > SystemTime::now());
    }

    #[test]
    fn expiration_is_capped_by_the_default_ttl() {
        // A far-future slot window gets capped at now + TTL.
        let expires = calculate_expiration(Slot::new(u64::MAX / 1000), 12, unix_now());
        assert!(expires <= SystemTime::now() + DEFAULT_BUNDLE_TTL);
    }

    #[test]
    fn deep_historical_slots_expire_immediately() {
        // Retention is proportional to recency: a slot far outside the lookahead window is
        // already past its expiry when admitted.
        let genesis_time = unix_now() - 100_000 * 12;
        let expires = calculate_expiration(Slot::new(0), 12, genesis_time);
        assert!(expires <= SystemTime::now());
    }
}
