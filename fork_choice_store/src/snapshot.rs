use anyhow::{ensure, Context as _, Result};
use serde::{Deserialize, Serialize};
use types::{
    containers::{BlockSummary, Checkpoint, Vote},
    primitives::{Epoch, Slot, Weight},
};

use crate::{error::Error, proto_array::ProtoArray, vote_tracker::VoteEntry};

// Incremented whenever the encoding of `StoreSnapshot` changes.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct SnapshotNode {
    pub block: BlockSummary,
    pub weight: Weight,
}

/// Checkpoint epochs and nodes of a [`ProtoArray`].
///
/// Nodes are in insertion order. The first one is the anchor.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct ProtoArraySnapshot {
    pub justified_epoch: Epoch,
    pub finalized_epoch: Epoch,
    pub anchor_epoch: Epoch,
    pub nodes: Vec<SnapshotNode>,
}

impl From<&ProtoArray> for ProtoArraySnapshot {
    fn from(proto_array: &ProtoArray) -> Self {
        let nodes = proto_array
            .nodes()
            .map(|node| SnapshotNode {
                block: node.summary(),
                weight: node.weight,
            })
            .collect();

        Self {
            justified_epoch: proto_array.justified_epoch(),
            finalized_epoch: proto_array.finalized_epoch(),
            anchor_epoch: proto_array.anchor_epoch(),
            nodes,
        }
    }
}

impl ProtoArraySnapshot {
    /// Rebuilds a tree by replaying insertions and then restoring the recorded weights.
    ///
    /// Best links are recomputed from the weights, so the restored tree selects the same head.
    pub fn restore(&self, prune_threshold: usize) -> Result<ProtoArray> {
        let (anchor, descendants) = self.nodes.split_first().ok_or(Error::EmptySnapshot)?;

        let mut proto_array = ProtoArray::new(&anchor.block, prune_threshold);

        for node in descendants {
            proto_array.insert(&node.block)?;
        }

        for (index, node) in self.nodes.iter().enumerate() {
            proto_array.restore_weight(index, node.weight)?;
        }

        proto_array.restore_epochs(self.justified_epoch, self.finalized_epoch, self.anchor_epoch);
        proto_array.apply_weight_changes(core::iter::empty())?;

        Ok(proto_array)
    }
}

/// Everything needed to restart a [`Store`] without replaying historical votes.
///
/// Votes are included so that votes cast before a restart are not counted twice after it.
///
/// [`Store`]: crate::Store
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub slot: Slot,
    pub justified_checkpoint: Checkpoint,
    pub finalized_checkpoint: Checkpoint,
    pub proto_array: ProtoArraySnapshot,
    pub votes: Vec<VoteEntry>,
    pub held_attestations: Vec<Vote>,
}

impl StoreSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context(Error::SnapshotEncode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // The version is the first field, so it can be checked before decoding the rest.
        let version = bincode::deserialize::<u32>(bytes).context(Error::SnapshotDecode)?;

        ensure!(
            version == SNAPSHOT_VERSION,
            Error::UnsupportedSnapshotVersion {
                version,
                expected: SNAPSHOT_VERSION,
            },
        );

        bincode::deserialize(bytes).context(Error::SnapshotDecode)
    }
}
