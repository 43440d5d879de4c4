//! Collapses the finality reports gathered from upstream nodes into a single majority view.
//!
//! This is plurality-with-tie-break, not a quorum: the aggregation filters out lagging or
//! transiently wrong upstreams from a small trusted set, it does not defend against Byzantine
//! ones. Should a stronger agreement rule ever be required, only this module changes.

use crate::eth2::types::FinalityCheckpointsData;
use crate::provider::Error;
use crate::types::{Epoch, Hash256};
use std::collections::HashMap;

/// A multiset of upstream finality reports.
pub struct Checkpoints(Vec<FinalityCheckpointsData>);

impl Checkpoints {
    pub fn new(reports: Vec<FinalityCheckpointsData>) -> Self {
        Self(reports)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the plurality finality report.
    ///
    /// Reports are keyed by their finalized checkpoint. Ties on vote count prefer the higher
    /// finalized epoch, then the numerically larger root; the result is independent of input
    /// order.
    pub fn majority(&self) -> Result<FinalityCheckpointsData, Error> {
        let mut votes: HashMap<(Epoch, Hash256), (usize, &FinalityCheckpointsData)> =
            HashMap::new();

        for report in &self.0 {
            let key = (report.finalized.epoch, report.finalized.root);
            let entry = votes.entry(key).or_insert((0, report));
            entry.0 += 1;
            // Keep a deterministic representative when reports agree on the finalized
            // checkpoint but differ elsewhere.
            if justified_key(report) > justified_key(entry.1) {
                entry.1 = report;
            }
        }

        votes
            .into_iter()
            .max_by_key(|((epoch, root), (count, _))| (*count, *epoch, *root))
            .map(|(_, (_, report))| report.clone())
            .ok_or(Error::NoCandidateCheckpoints)
    }
}

fn justified_key(report: &FinalityCheckpointsData) -> (Epoch, Hash256) {
    (report.current_justified.epoch, report.current_justified.root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Checkpoint;

    fn report(epoch: u64, root: u64) -> FinalityCheckpointsData {
        FinalityCheckpointsData {
            previous_justified: Checkpoint {
                epoch: Epoch::new(epoch),
                root: Hash256::from_low_u64_be(root),
            },
            current_justified: Checkpoint {
                epoch: Epoch::new(epoch + 1),
                root: Hash256::from_low_u64_be(root),
            },
            finalized: Checkpoint {
                epoch: Epoch::new(epoch),
                root: Hash256::from_low_u64_be(root),
            },
        }
    }

    #[test]
    fn majority_emerges() {
        let reports = vec![
            report(100, 0xaa),
            report(100, 0xaa),
            report(100, 0xaa),
            report(99, 0xbb),
        ];

        let majority = Checkpoints::new(reports).majority().unwrap();
        assert_eq!(majority.finalized.epoch, Epoch::new(100));
        assert_eq!(majority.finalized.root, Hash256::from_low_u64_be(0xaa));
    }

    #[test]
    fn tie_broken_by_higher_epoch() {
        let reports = vec![
            report(100, 0xaa),
            report(100, 0xaa),
            report(101, 0xcc),
            report(101, 0xcc),
        ];

        let majority = Checkpoints::new(reports).majority().unwrap();
        assert_eq!(majority.finalized.epoch, Epoch::new(101));
        assert_eq!(majority.finalized.root, Hash256::from_low_u64_be(0xcc));
    }

    #[test]
    fn tie_broken_by_larger_root() {
        let reports = vec![report(100, 0xaa), report(100, 0xcc)];

        let majority = Checkpoints::new(reports).majority().unwrap();
        assert_eq!(majority.finalized.root, Hash256::from_low_u64_be(0xcc));
    }

    #[test]
    fn sole_survivor_wins() {
        let majority = Checkpoints::new(vec![report(100, 0xaa)]).majority().unwrap();
        assert_eq!(majority.finalized.root, Hash256::from_low_u64_be(0xaa));
    }

    #[test]
    fn empty_input_fails() {
        assert!(matches!(
            Checkpoints::new(vec![]).majority(),
            Err(Error::NoCandidateCheckpoints)
        ));
    }

    #[test]
    fn permutation_invariant() {
        let a = report(100, 0xaa);
        let b = report(101, 0xcc);
        let c = report(99, 0xbb);

        let forwards = Checkpoints::new(vec![a.clone(), a.clone(), b.clone(), c.clone()])
            .majority()
            .unwrap();
        let backwards = Checkpoints::new(vec![c, b, a.clone(), a]).majority().unwrap();

        assert_eq!(forwards, backwards);
    }
}
