use strum::IntoStaticStr;
use types::{
    containers::{BlockSummary, Vote},
    primitives::Slot,
};

#[derive(Debug)]
pub struct PendingBlock {
    pub block: BlockSummary,
    // The slot the store was at when the block was first delayed.
    pub delayed_at: Slot,
}

#[derive(Debug)]
pub struct PendingVote {
    pub vote: Vote,
    pub delayed_at: Slot,
}

#[derive(Default, Debug)]
pub struct Delayed {
    pub blocks: Vec<PendingBlock>,
    pub attestations: Vec<PendingVote>,
}

impl Delayed {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let Self {
            blocks,
            attestations,
        } = self;

        blocks.is_empty() && attestations.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len() + self.attestations.len()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RejectionReason {
    InvalidBlock,
    InvalidAttestation,
    InvalidCheckpoint,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DiscardReason {
    /// The referenced block did not arrive within `StoreConfig.max_delay_slots`.
    Expired,
    CapacityExceeded,
    /// The object is older than the finalized anchor and can never be connected to the tree.
    Orphaned,
    TooFarInFuture,
}
