//! The `Slot` and `Epoch` types are defined as new types over u64 to enforce type-safety between
//! the two, along with the small set of consensus primitives this service needs to reason about
//! checkpoints and block identity.
//!
//! Blocks are opaque to this service: we keep the decoded header (enough to know the slot, the
//! state root and to recompute the block root) next to the raw SSZ payload that is served to
//! bootstrapping clients. Beacon states are never decoded at all.

use serde::{Deserialize, Serialize};
use std::fmt;
use tree_hash::TreeHash as _;
use tree_hash_derive::TreeHash;

pub use ethereum_types::H256 as Hash256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slot(#[serde(with = "eth2_serde_utils::quoted_u64")] u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(#[serde(with = "eth2_serde_utils::quoted_u64")] u64);

impl Slot {
    pub const fn new(slot: u64) -> Slot {
        Slot(slot)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The epoch containing this slot.
    pub fn epoch(&self, slots_per_epoch: u64) -> Epoch {
        Epoch::new(self.0 / slots_per_epoch)
    }

    /// True if this slot sits on an epoch boundary.
    pub fn is_epoch_boundary(&self, slots_per_epoch: u64) -> bool {
        self.0 % slots_per_epoch == 0
    }
}

impl Epoch {
    pub const fn new(epoch: u64) -> Epoch {
        Epoch(epoch)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The first slot in the epoch.
    pub fn start_slot(&self, slots_per_epoch: u64) -> Slot {
        Slot::new(self.0.saturating_mul(slots_per_epoch))
    }
}

impl From<u64> for Slot {
    fn from(slot: u64) -> Slot {
        Slot(slot)
    }
}

impl From<u64> for Epoch {
    fn from(epoch: u64) -> Epoch {
        Epoch(epoch)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl tree_hash::TreeHash for Slot {
    fn tree_hash_type() -> tree_hash::TreeHashType {
        u64::tree_hash_type()
    }

    fn tree_hash_packed_encoding(&self) -> tree_hash::PackedEncoding {
        self.0.tree_hash_packed_encoding()
    }

    fn tree_hash_packing_factor() -> usize {
        u64::tree_hash_packing_factor()
    }

    fn tree_hash_root(&self) -> tree_hash::Hash256 {
        self.0.tree_hash_root()
    }
}

impl tree_hash::TreeHash for Epoch {
    fn tree_hash_type() -> tree_hash::TreeHashType {
        u64::tree_hash_type()
    }

    fn tree_hash_packed_encoding(&self) -> tree_hash::PackedEncoding {
        self.0.tree_hash_packed_encoding()
    }

    fn tree_hash_packing_factor() -> usize {
        u64::tree_hash_packing_factor()
    }

    fn tree_hash_root(&self) -> tree_hash::Hash256 {
        self.0.tree_hash_root()
    }
}

/// Casper FFG checkpoint: an epoch paired with the block root at its boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Hash256,
}

/// The header of a beacon block.
///
/// The tree-hash root of the header is, by construction, equal to the tree-hash root of the full
/// block, which lets us verify block identity without decoding fork-specific block bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TreeHash)]
pub struct BeaconBlockHeader {
    pub slot: Slot,
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub proposer_index: u64,
    pub parent_root: Hash256,
    pub state_root: Hash256,
    pub body_root: Hash256,
}

impl BeaconBlockHeader {
    /// Returns the block root of the block this header belongs to.
    pub fn canonical_root(&self) -> Hash256 {
        self.tree_hash_root()
    }
}

/// A signed beacon block, opaque apart from its header.
///
/// Holds the raw SSZ encoding exactly as received from an upstream, which is what gets served
/// to bootstrapping clients.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedBeaconBlock {
    header: BeaconBlockHeader,
    ssz: Vec<u8>,
}

impl SignedBeaconBlock {
    pub fn from_parts(header: BeaconBlockHeader, ssz: Vec<u8>) -> Self {
        Self { header, ssz }
    }

    pub fn slot(&self) -> Slot {
        self.header.slot
    }

    pub fn state_root(&self) -> Hash256 {
        self.header.state_root
    }

    pub fn parent_root(&self) -> Hash256 {
        self.header.parent_root
    }

    /// The hash-tree-root of the block.
    pub fn canonical_root(&self) -> Hash256 {
        self.header.canonical_root()
    }

    /// The raw SSZ encoding of the signed block.
    pub fn as_ssz_bytes(&self) -> &[u8] {
        &self.ssz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(slot: u64) -> BeaconBlockHeader {
        BeaconBlockHeader {
            slot: Slot::new(slot),
            proposer_index: 42,
            parent_root: Hash256::from_low_u64_be(1),
            state_root: Hash256::from_low_u64_be(2),
            body_root: Hash256::from_low_u64_be(3),
        }
    }

    #[test]
    fn slot_epoch_conversions() {
        assert_eq!(Slot::new(3200).epoch(32), Epoch::new(100));
        assert_eq!(Epoch::new(100).start_slot(32), Slot::new(3200));
        assert!(Slot::new(3200).is_epoch_boundary(32));
        assert!(!Slot::new(3201).is_epoch_boundary(32));
    }

    #[test]
    fn quoted_serde() {
        let slot: Slot = serde_json::from_str("\"3200\"").expect("should decode quoted slot");
        assert_eq!(slot, Slot::new(3200));
        assert_eq!(serde_json::to_string(&slot).unwrap(), "\"3200\"");
    }

    #[test]
    fn header_root_is_stable() {
        assert_eq!(header(5).canonical_root(), header(5).canonical_root());
    }

    #[test]
    fn header_root_commits_to_fields() {
        assert_ne!(header(5).canonical_root(), header(6).canonical_root());

        let mut other = header(5);
        other.state_root = Hash256::from_low_u64_be(99);
        assert_ne!(header(5).canonical_root(), other.canonical_root());
    }

    #[test]
    fn block_exposes_header_fields() {
        let block = SignedBeaconBlock::from_parts(header(7), vec![0xde, 0xad]);
        assert_eq!(block.slot(), Slot::new(7));
        assert_eq!(block.state_root(), Hash256::from_low_u64_be(2));
        assert_eq!(block.canonical_root(), header(7).canonical_root());
        assert_eq!(block.as_ssz_bytes(), &[0xde, 0xad]);
    }
}
