use serde::Serialize;
use types::{
    containers::Checkpoint,
    primitives::{Slot, H256},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockAction {
    Accept,
    /// The block is already known or can never be connected to the tree.
    Ignore,
    DelayUntilParent(H256),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AttestationAction {
    Accept,
    /// The attestation is stale or targets a block older than the anchor.
    Ignore,
    DelayUntilBlock(H256),
    DelayUntilSlot(Slot),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ApplyTickChanges {
    SlotUnchanged,
    SlotUpdated { released_attestations: usize },
}

impl ApplyTickChanges {
    #[must_use]
    pub const fn is_slot_updated(self) -> bool {
        matches!(self, Self::SlotUpdated { .. })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Uninitialized,
    Ready,
}

/// Summary of a [`Store`] for informational queries.
///
/// [`Store`]: crate::Store
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct StoreStatus {
    pub state: StoreState,
    pub slot: Slot,
    pub justified_checkpoint: Checkpoint,
    pub finalized_checkpoint: Checkpoint,
    pub anchor_root: Option<H256>,
    pub block_count: usize,
    pub head: Option<H256>,
    pub pending_votes: bool,
}
