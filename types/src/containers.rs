use serde::{Deserialize, Serialize};

use crate::primitives::{Epoch, Gwei, Slot, ValidatorIndex, H256};

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, Deserialize, Serialize,
)]
#[serde(deny_unknown_fields)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: H256,
}

/// The part of a validated block that fork choice needs.
///
/// `justified_epoch` and `finalized_epoch` are the checkpoint epochs in the state produced by the
/// block, not the ones in the state it was applied to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BlockSummary {
    pub slot: Slot,
    pub root: H256,
    pub parent_root: H256,
    pub state_root: H256,
    pub justified_epoch: Epoch,
    pub finalized_epoch: Epoch,
}

/// A single validator's attestation to `target_root`, already verified and deduplicated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Vote {
    pub validator_index: ValidatorIndex,
    pub target_root: H256,
    pub slot: Slot,
    pub effective_balance: Gwei,
}

impl BlockSummary {
    #[must_use]
    pub const fn justified_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            epoch: self.justified_epoch,
            root: self.root,
        }
    }

    #[must_use]
    pub const fn finalized_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            epoch: self.finalized_epoch,
            root: self.root,
        }
    }
}
