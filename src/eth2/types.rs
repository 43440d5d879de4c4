//! Types returned by the standard beacon node HTTP API, limited to the endpoints this service
//! consumes.

use crate::types::{BeaconBlockHeader, Checkpoint, Hash256, Slot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The `{"data": ...}` wrapper common to beacon API responses.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + serde::de::DeserializeOwned")]
pub struct GenericResponse<T: Serialize + serde::de::DeserializeOwned> {
    pub data: T,
}

impl<T: Serialize + serde::de::DeserializeOwned> From<T> for GenericResponse<T> {
    fn from(data: T) -> Self {
        Self { data }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisData {
    #[serde(with = "eth2_serde_utils::quoted_u64")]
    pub genesis_time: u64,
    pub genesis_validators_root: Hash256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionData {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncingData {
    pub is_syncing: bool,
    pub head_slot: Slot,
    pub sync_distance: Slot,
}

/// An upstream's current view of finality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FinalityCheckpointsData {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}

/// The subset of `/eth/v1/config/spec` this service reads.
///
/// The spec endpoint returns every chain constant; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecData {
    #[serde(rename = "SECONDS_PER_SLOT", with = "eth2_serde_utils::quoted_u64")]
    pub seconds_per_slot: u64,
    #[serde(rename = "SLOTS_PER_EPOCH", with = "eth2_serde_utils::quoted_u64")]
    pub slots_per_epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedBeaconBlockHeaderData {
    pub message: BeaconBlockHeader,
    pub signature: String,
}

/// Response of `/eth/v1/beacon/headers/{block_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeaderData {
    pub root: Hash256,
    pub canonical: bool,
    pub header: SignedBeaconBlockHeaderData,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BlockId {
    Head,
    Genesis,
    Finalized,
    Slot(Slot),
    Root(Hash256),
}

impl FromStr for BlockId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "head" => Ok(BlockId::Head),
            "genesis" => Ok(BlockId::Genesis),
            "finalized" => Ok(BlockId::Finalized),
            other => {
                if let Some(hex) = other.strip_prefix("0x") {
                    Hash256::from_str(hex)
                        .map(BlockId::Root)
                        .map_err(|e| format!("{} cannot be parsed as a root: {:?}", s, e))
                } else {
                    u64::from_str(other)
                        .map(Slot::new)
                        .map(BlockId::Slot)
                        .map_err(|_| format!("{} cannot be parsed as a slot", s))
                }
            }
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Head => write!(f, "head"),
            BlockId::Genesis => write!(f, "genesis"),
            BlockId::Finalized => write!(f, "finalized"),
            BlockId::Slot(slot) => write!(f, "{}", slot),
            BlockId::Root(root) => write!(f, "{:?}", root),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum StateId {
    Head,
    Genesis,
    Finalized,
    Slot(Slot),
    Root(Hash256),
}

impl FromStr for StateId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "head" => Ok(StateId::Head),
            "genesis" => Ok(StateId::Genesis),
            "finalized" => Ok(StateId::Finalized),
            other => {
                if let Some(hex) = other.strip_prefix("0x") {
                    Hash256::from_str(hex)
                        .map(StateId::Root)
                        .map_err(|e| format!("{} cannot be parsed as a root: {:?}", s, e))
                } else {
                    u64::from_str(other)
                        .map(Slot::new)
                        .map(StateId::Slot)
                        .map_err(|_| format!("{} cannot be parsed as a slot", s))
                }
            }
        }
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateId::Head => write!(f, "head"),
            StateId::Genesis => write!(f, "genesis"),
            StateId::Finalized => write!(f, "finalized"),
            StateId::Slot(slot) => write!(f, "{}", slot),
            StateId::Root(root) => write!(f, "{:?}", root),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Epoch;

    #[test]
    fn block_id_round_trip() {
        for id in ["genesis", "finalized", "head", "3200"] {
            let parsed = BlockId::from_str(id).expect("should parse block id");
            assert_eq!(parsed.to_string(), id);
        }

        let root = "0x00000000000000000000000000000000000000000000000000000000000000aa";
        assert_eq!(
            BlockId::from_str(root).expect("should parse root"),
            BlockId::Root(Hash256::from_low_u64_be(0xaa))
        );
    }

    #[test]
    fn block_id_rejects_garbage() {
        assert!(BlockId::from_str("0xzz").is_err());
        assert!(BlockId::from_str("not-a-slot").is_err());
    }

    #[test]
    fn finality_checkpoints_decode() {
        let json = r#"{
            "data": {
                "previous_justified": {
                    "epoch": "98",
                    "root": "0x0000000000000000000000000000000000000000000000000000000000000001"
                },
                "current_justified": {
                    "epoch": "99",
                    "root": "0x0000000000000000000000000000000000000000000000000000000000000002"
                },
                "finalized": {
                    "epoch": "100",
                    "root": "0x00000000000000000000000000000000000000000000000000000000000000aa"
                }
            }
        }"#;

        let response: GenericResponse<FinalityCheckpointsData> =
            serde_json::from_str(json).expect("should decode finality checkpoints");
        assert_eq!(response.data.finalized.epoch, Epoch::new(100));
        assert_eq!(response.data.finalized.root, Hash256::from_low_u64_be(0xaa));
    }

    #[test]
    fn syncing_data_decode() {
        let json = r#"{"data": {"is_syncing": false, "head_slot": "3204", "sync_distance": "1"}}"#;
        let response: GenericResponse<SyncingData> =
            serde_json::from_str(json).expect("should decode syncing data");
        assert!(!response.data.is_syncing);
        assert_eq!(response.data.head_slot, Slot::new(3204));
    }

    #[test]
    fn spec_data_ignores_unknown_constants() {
        let json = r#"{
            "data": {
                "SECONDS_PER_SLOT": "12",
                "SLOTS_PER_EPOCH": "32",
                "MAX_COMMITTEES_PER_SLOT": "64"
            }
        }"#;
        let response: GenericResponse<SpecData> =
            serde_json::from_str(json).expect("should decode spec data");
        assert_eq!(response.data.seconds_per_slot, 12);
        assert_eq!(response.data.slots_per_epoch, 32);
    }
}
