use anyhow::{bail, ensure, Result};
use im::Vector;
use log::debug;
use types::{
    containers::{BlockSummary, Checkpoint, Vote},
    primitives::{Slot, ValidatorIndex, H256},
};

use crate::{
    error::Error,
    misc::{ApplyTickChanges, AttestationAction, BlockAction, StoreState, StoreStatus},
    proto_array::ProtoArray,
    snapshot::{StoreSnapshot, SNAPSHOT_VERSION},
    store_config::{FlushPolicy, StoreConfig},
    vote_tracker::VoteTracker,
};

/// Fork choice state machine.
///
/// A [`Store`] starts out uninitialized and becomes ready once it has an anchor. Every method
/// other than [`Store::initialize`], [`Store::apply_tick`] and the accessors fails with
/// [`Error::NotReady`] before that.
///
/// Cloning is cheap. See [`ProtoArray`].
#[derive(Clone, Debug)]
pub struct Store {
    config: StoreConfig,
    proto_array: Option<ProtoArray>,
    votes: VoteTracker,
    justified_checkpoint: Checkpoint,
    finalized_checkpoint: Checkpoint,
    slot: Slot,
    // Attestations from the current slot. Only used with `FlushPolicy::NextSlot`.
    held_attestations: Vector<Vote>,
    head: Option<H256>,
}

impl Store {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            proto_array: None,
            votes: VoteTracker::default(),
            justified_checkpoint: Checkpoint::default(),
            finalized_checkpoint: Checkpoint::default(),
            slot: 0,
            held_attestations: Vector::new(),
            head: None,
        }
    }

    pub fn from_snapshot(config: StoreConfig, snapshot: StoreSnapshot) -> Result<Self> {
        let StoreSnapshot {
            version,
            slot,
            justified_checkpoint,
            finalized_checkpoint,
            proto_array,
            votes,
            held_attestations,
        } = snapshot;

        ensure!(
            version == SNAPSHOT_VERSION,
            Error::UnsupportedSnapshotVersion {
                version,
                expected: SNAPSHOT_VERSION,
            },
        );

        let proto_array = proto_array.restore(config.prune_threshold)?;

        ensure!(
            proto_array.contains_block(justified_checkpoint.root),
            Error::UnknownJustifiedRoot {
                root: justified_checkpoint.root,
            },
        );

        Ok(Self {
            config,
            proto_array: Some(proto_array),
            votes: VoteTracker::from_entries(votes),
            justified_checkpoint,
            finalized_checkpoint,
            slot,
            held_attestations: held_attestations.into_iter().collect(),
            head: None,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub const fn state(&self) -> StoreState {
        match self.proto_array {
            Some(_) => StoreState::Ready,
            None => StoreState::Uninitialized,
        }
    }

    #[must_use]
    pub const fn slot(&self) -> Slot {
        self.slot
    }

    #[must_use]
    pub const fn justified_checkpoint(&self) -> Checkpoint {
        self.justified_checkpoint
    }

    #[must_use]
    pub const fn finalized_checkpoint(&self) -> Checkpoint {
        self.finalized_checkpoint
    }

    /// The head computed by the latest call to [`Store::head`].
    ///
    /// It may be out of date if blocks or votes were applied since.
    #[must_use]
    pub const fn last_head(&self) -> Option<H256> {
        self.head
    }

    pub fn proto_array(&self) -> Result<&ProtoArray> {
        self.proto_array
            .as_ref()
            .ok_or_else(|| Error::NotReady.into())
    }

    #[must_use]
    pub fn contains_block(&self, root: H256) -> bool {
        self.proto_array
            .as_ref()
            .is_some_and(|proto_array| proto_array.contains_block(root))
    }

    #[must_use]
    pub fn block_slot(&self, root: H256) -> Option<Slot> {
        self.proto_array.as_ref()?.block_slot(root)
    }

    #[must_use]
    pub fn is_descendant(&self, root: H256, ancestor_root: H256) -> bool {
        self.proto_array
            .as_ref()
            .is_some_and(|proto_array| proto_array.is_descendant(root, ancestor_root))
    }

    #[must_use]
    pub fn latest_message(&self, validator_index: ValidatorIndex) -> Option<(H256, Slot)> {
        self.votes.latest_message(validator_index)
    }

    #[must_use]
    pub fn status(&self) -> StoreStatus {
        let proto_array = self.proto_array.as_ref();

        StoreStatus {
            state: self.state(),
            slot: self.slot,
            justified_checkpoint: self.justified_checkpoint,
            finalized_checkpoint: self.finalized_checkpoint,
            anchor_root: proto_array.map(|proto_array| proto_array.anchor().root),
            block_count: proto_array.map(ProtoArray::len).unwrap_or_default(),
            head: self.head,
            pending_votes: self.votes.has_pending_changes() || !self.held_attestations.is_empty(),
        }
    }

    /// Makes `anchor` the root of the tree and both checkpoints.
    pub fn initialize(&mut self, anchor: &BlockSummary) -> Result<()> {
        ensure!(self.proto_array.is_none(), Error::AlreadyInitialized);

        self.proto_array = Some(ProtoArray::new(anchor, self.config.prune_threshold));
        self.justified_checkpoint = anchor.justified_checkpoint();
        self.finalized_checkpoint = anchor.finalized_checkpoint();
        self.slot = self.slot.max(anchor.slot);
        self.head = Some(anchor.root);

        Ok(())
    }

    pub fn apply_block(&mut self, block: &BlockSummary) -> Result<BlockAction> {
        let proto_array = self.proto_array_mut()?;

        if proto_array.contains_block(block.root) {
            return Ok(BlockAction::Ignore);
        }

        if !proto_array.contains_block(block.parent_root) {
            // The parent would have to be older than the anchor, which has already been pruned.
            if block.slot <= proto_array.anchor().slot {
                return Ok(BlockAction::Ignore);
            }

            return Ok(BlockAction::DelayUntilParent(block.parent_root));
        }

        proto_array.insert(block)?;

        Ok(BlockAction::Accept)
    }

    pub fn apply_attestation(&mut self, vote: Vote) -> Result<AttestationAction> {
        let proto_array = self.proto_array()?;

        let Some(block_slot) = proto_array.block_slot(vote.target_root) else {
            if vote.slot <= proto_array.anchor().slot {
                return Ok(AttestationAction::Ignore);
            }

            return Ok(AttestationAction::DelayUntilBlock(vote.target_root));
        };

        ensure!(
            vote.validator_index < self.config.max_validators,
            Error::ValidatorIndexOutOfBounds {
                validator_index: vote.validator_index,
            },
        );

        ensure!(
            block_slot <= vote.slot,
            Error::AttestationForFutureBlock {
                target_root: vote.target_root,
                attestation_slot: vote.slot,
                block_slot,
            },
        );

        if vote.slot > self.slot {
            return Ok(AttestationAction::DelayUntilSlot(vote.slot));
        }

        if self.config.flush_policy.holds_current_slot_attestations() && vote.slot == self.slot {
            self.held_attestations.push_back(vote);
            return Ok(AttestationAction::Accept);
        }

        if !self.votes.process_vote(vote)? {
            return Ok(AttestationAction::Ignore);
        }

        if self.config.flush_policy == FlushPolicy::Immediate {
            self.flush()?;
        }

        Ok(AttestationAction::Accept)
    }

    /// Advances the current slot. Ticks for the current or an earlier slot have no effect.
    pub fn apply_tick(&mut self, slot: Slot) -> Result<ApplyTickChanges> {
        if slot <= self.slot {
            return Ok(ApplyTickChanges::SlotUnchanged);
        }

        self.slot = slot;

        let released = core::mem::take(&mut self.held_attestations);
        let released_attestations = released.len();

        for vote in released {
            self.votes.process_vote(vote)?;
        }

        if self.proto_array.is_some() {
            self.flush()?;
        }

        Ok(ApplyTickChanges::SlotUpdated {
            released_attestations,
        })
    }

    /// Returns `false` if `checkpoint` is not newer than the current justified checkpoint.
    pub fn apply_justified_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<bool> {
        let proto_array = self.proto_array()?;

        ensure!(
            proto_array.contains_block(checkpoint.root),
            Error::UnknownJustifiedRoot {
                root: checkpoint.root,
            },
        );

        if checkpoint.epoch <= self.justified_checkpoint.epoch {
            return Ok(false);
        }

        self.justified_checkpoint = checkpoint;

        Ok(true)
    }

    /// Records a new finalized checkpoint and prunes the tree if enough nodes can be removed.
    ///
    /// Returns the number of nodes removed.
    pub fn apply_finalized_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<usize> {
        let proto_array = self.proto_array()?;

        ensure!(
            proto_array.contains_block(checkpoint.root),
            Error::UnknownFinalizedRoot {
                root: checkpoint.root,
            },
        );

        let current = self.finalized_checkpoint.epoch;

        if checkpoint.epoch < current {
            bail!(Error::FinalizedEpochReverted {
                current,
                new: checkpoint.epoch,
            });
        }

        if checkpoint == self.finalized_checkpoint {
            return Ok(0);
        }

        // A justified checkpoint that is older than the finalized one or conflicts with it can no
        // longer be built upon. Its block may be pruned below.
        let justified_conflicts =
            !proto_array.is_descendant(self.justified_checkpoint.root, checkpoint.root);

        self.finalized_checkpoint = checkpoint;

        if self.justified_checkpoint.epoch < checkpoint.epoch || justified_conflicts {
            self.justified_checkpoint = checkpoint;
        }

        // Deltas refer to nodes by index, so they must be applied before indices change.
        self.flush()?;
        self.push_checkpoints()?;

        let removed = self.proto_array_mut()?.maybe_prune(checkpoint.root)?;

        if removed > 0 {
            debug!("pruned fork choice tree (finalized: {checkpoint:?}, removed: {removed})");
        }

        Ok(removed)
    }

    /// Flushes pending votes, applies checkpoint changes and returns the current head.
    pub fn head(&mut self) -> Result<H256> {
        self.push_checkpoints()?;
        self.flush()?;

        let head = self
            .proto_array()?
            .find_head(self.justified_checkpoint.root)?;

        self.head = Some(head);

        Ok(head)
    }

    /// Turns recorded votes into weight changes. This also links blocks inserted since the
    /// previous flush.
    pub fn flush(&mut self) -> Result<()> {
        let Some(proto_array) = self.proto_array.as_mut() else {
            bail!(Error::NotReady);
        };

        let deltas = self.votes.compute_deltas(proto_array)?;

        proto_array.apply_weight_changes(deltas)
    }

    /// Captures the store for a later restart.
    ///
    /// Pending votes are flushed first, which does not affect any future head.
    pub fn to_snapshot(&mut self) -> Result<StoreSnapshot> {
        self.flush()?;

        let proto_array = self.proto_array()?;

        Ok(StoreSnapshot {
            version: SNAPSHOT_VERSION,
            slot: self.slot,
            justified_checkpoint: self.justified_checkpoint,
            finalized_checkpoint: self.finalized_checkpoint,
            proto_array: proto_array.into(),
            votes: self.votes.entries().copied().collect(),
            held_attestations: self.held_attestations.iter().copied().collect(),
        })
    }

    fn push_checkpoints(&mut self) -> Result<()> {
        let justified_epoch = self.justified_checkpoint.epoch;
        let finalized_epoch = self.finalized_checkpoint.epoch;

        self.proto_array_mut()?
            .update_checkpoints(justified_epoch, finalized_epoch);

        Ok(())
    }

    fn proto_array_mut(&mut self) -> Result<&mut ProtoArray> {
        self.proto_array
            .as_mut()
            .ok_or_else(|| Error::NotReady.into())
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools as _;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;
    use static_assertions::assert_impl_all;
    use test_case::test_case;
    use types::primitives::{Epoch, Gwei};

    use crate::error::{error_kind, ErrorKind};

    use super::*;

    assert_impl_all!(Store: Send, Sync);

    const BALANCE: Gwei = 32;

    fn root(byte: u8) -> H256 {
        H256::repeat_byte(byte)
    }

    fn block(slot: Slot, byte: u8, parent_byte: u8) -> BlockSummary {
        BlockSummary {
            slot,
            root: root(byte),
            parent_root: root(parent_byte),
            ..BlockSummary::default()
        }
    }

    fn block_in_epochs(
        slot: Slot,
        byte: u8,
        parent_byte: u8,
        justified_epoch: Epoch,
        finalized_epoch: Epoch,
    ) -> BlockSummary {
        BlockSummary {
            justified_epoch,
            finalized_epoch,
            ..block(slot, byte, parent_byte)
        }
    }

    fn vote(validator_index: ValidatorIndex, byte: u8, slot: Slot) -> Vote {
        Vote {
            validator_index,
            target_root: root(byte),
            slot,
            effective_balance: BALANCE,
        }
    }

    fn ready_store(flush_policy: FlushPolicy) -> Result<Store> {
        let mut store = Store::new(StoreConfig {
            prune_threshold: 0,
            flush_policy,
            ..StoreConfig::default()
        });

        store.initialize(&block(0, 0xa, 0))?;

        Ok(store)
    }

    fn expect_error(result: Result<impl core::fmt::Debug>) -> Error {
        result
            .expect_err("operation should fail")
            .downcast::<Error>()
            .expect("error should come from this crate")
    }

    #[test]
    fn uninitialized_store_is_not_ready() {
        let mut store = Store::new(StoreConfig::default());

        assert_eq!(store.state(), StoreState::Uninitialized);
        assert!(matches!(expect_error(store.head()), Error::NotReady));
        assert!(matches!(
            expect_error(store.apply_block(&block(1, 0xb, 0xa))),
            Error::NotReady,
        ));
        assert!(matches!(
            expect_error(store.apply_attestation(vote(0, 0xa, 0))),
            Error::NotReady,
        ));
    }

    #[test]
    fn store_can_only_be_initialized_once() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        assert_eq!(store.state(), StoreState::Ready);
        assert!(matches!(
            expect_error(store.initialize(&block(0, 0xa, 0))),
            Error::AlreadyInitialized,
        ));

        Ok(())
    }

    #[test]
    fn ticks_before_initialization_are_kept() -> Result<()> {
        let mut store = Store::new(StoreConfig::default());

        assert!(store.apply_tick(5)?.is_slot_updated());
        store.initialize(&block(0, 0xa, 0))?;

        assert_eq!(store.slot(), 5);

        Ok(())
    }

    #[test]
    fn head_follows_votes() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        assert_eq!(store.apply_block(&block(1, 0xb, 0xa))?, BlockAction::Accept);
        assert_eq!(store.apply_block(&block(1, 0xc, 0xa))?, BlockAction::Accept);

        store.apply_tick(1)?;

        for validator_index in 0..3 {
            store.apply_attestation(vote(validator_index, 0xb, 1))?;
        }

        assert_eq!(store.head()?, root(0xb));

        store.apply_tick(2)?;

        for validator_index in 0..3 {
            store.apply_attestation(vote(validator_index + 3, 0xc, 2))?;
        }

        store.apply_attestation(vote(0, 0xc, 2))?;

        assert_eq!(store.head()?, root(0xc));
        assert_eq!(store.last_head(), Some(root(0xc)));
        assert_eq!(store.proto_array()?.weight(root(0xc)), Some(4 * 32));
        assert_eq!(store.proto_array()?.weight(root(0xb)), Some(2 * 32));

        Ok(())
    }

    #[test]
    fn head_is_idempotent() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_block(&block(2, 0xc, 0xb))?;
        store.apply_tick(2)?;
        store.apply_attestation(vote(0, 0xb, 2))?;

        let first = store.head()?;
        let second = store.head()?;

        assert_eq!(first, second);
        assert_eq!(first, root(0xc));

        Ok(())
    }

    #[test]
    fn block_actions() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(1, 0xb, 0xa))?;

        assert_eq!(store.apply_block(&block(1, 0xb, 0xa))?, BlockAction::Ignore);
        assert_eq!(
            store.apply_block(&block(3, 0xd, 0xc))?,
            BlockAction::DelayUntilParent(root(0xc)),
        );
        assert_eq!(store.apply_block(&block(0, 0xe, 0xf))?, BlockAction::Ignore);

        assert!(matches!(
            expect_error(store.apply_block(&block(1, 0xd, 0xb))),
            Error::SlotNotAfterParent { .. },
        ));

        Ok(())
    }

    #[test]
    fn attestation_actions() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(2, 0xb, 0xa))?;
        store.apply_tick(3)?;

        assert_eq!(
            store.apply_attestation(vote(0, 0xc, 3))?,
            AttestationAction::DelayUntilBlock(root(0xc)),
        );
        assert_eq!(
            store.apply_attestation(vote(0, 0xb, 4))?,
            AttestationAction::DelayUntilSlot(4),
        );
        assert_eq!(
            store.apply_attestation(vote(0, 0xb, 3))?,
            AttestationAction::Accept,
        );
        assert_eq!(
            store.apply_attestation(vote(0, 0xa, 3))?,
            AttestationAction::Ignore,
        );
        assert_eq!(
            store.apply_attestation(vote(1, 0xee, 0))?,
            AttestationAction::Ignore,
        );

        let error = expect_error(store.apply_attestation(vote(2, 0xb, 1)));

        assert!(matches!(error, Error::AttestationForFutureBlock { .. }));
        assert_eq!(error.kind(), ErrorKind::Structural);

        Ok(())
    }

    #[test]
    fn next_slot_policy_holds_current_slot_attestations() -> Result<()> {
        let mut store = ready_store(FlushPolicy::NextSlot)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_block(&block(1, 0xc, 0xa))?;
        store.apply_tick(1)?;

        store.apply_attestation(vote(0, 0xb, 1))?;

        assert_eq!(store.latest_message(0), None);
        assert!(store.status().pending_votes);
        assert_eq!(store.head()?, root(0xc));

        assert_eq!(
            store.apply_tick(2)?,
            ApplyTickChanges::SlotUpdated {
                released_attestations: 1,
            },
        );

        assert_eq!(store.latest_message(0), Some((root(0xb), 1)));
        assert_eq!(store.head()?, root(0xb));

        Ok(())
    }

    #[test]
    fn immediate_policy_applies_weights_right_away() -> Result<()> {
        let mut store = ready_store(FlushPolicy::Immediate)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_tick(1)?;
        store.apply_attestation(vote(0, 0xb, 1))?;

        assert_eq!(store.proto_array()?.weight(root(0xb)), Some(32));
        assert!(!store.status().pending_votes);

        Ok(())
    }

    #[test]
    fn finalization_prunes_and_moves_justified_checkpoint() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_block(&block_in_epochs(2, 0xc, 0xb, 1, 1))?;
        store.apply_block(&block(2, 0xd, 0xa))?;

        let finalized = Checkpoint {
            epoch: 1,
            root: root(0xb),
        };

        assert_eq!(store.apply_finalized_checkpoint(finalized)?, 2);

        assert_eq!(store.finalized_checkpoint(), finalized);
        assert_eq!(store.justified_checkpoint(), finalized);
        assert!(!store.contains_block(root(0xa)));
        assert!(!store.contains_block(root(0xd)));
        assert_eq!(store.head()?, root(0xc));

        let error = expect_error(store.apply_finalized_checkpoint(Checkpoint {
            epoch: 0,
            root: root(0xb),
        }));

        assert!(matches!(error, Error::FinalizedEpochReverted { .. }));

        Ok(())
    }

    #[test]
    fn finalization_replaces_conflicting_justified_checkpoint() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_block(&block(1, 0xd, 0xa))?;

        let justified = Checkpoint {
            epoch: 2,
            root: root(0xd),
        };

        let finalized = Checkpoint {
            epoch: 1,
            root: root(0xb),
        };

        assert!(store.apply_justified_checkpoint(justified)?);
        assert_eq!(store.head()?, root(0xd));
        assert_eq!(store.apply_finalized_checkpoint(finalized)?, 2);

        assert!(!store.contains_block(root(0xd)));
        assert_eq!(store.justified_checkpoint(), finalized);
        assert_eq!(store.head()?, root(0xb));

        Ok(())
    }

    #[test]
    fn finalization_keeps_descending_justified_checkpoint() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_block(&block_in_epochs(2, 0xc, 0xb, 2, 1))?;

        let justified = Checkpoint {
            epoch: 2,
            root: root(0xc),
        };

        store.apply_justified_checkpoint(justified)?;
        store.apply_finalized_checkpoint(Checkpoint {
            epoch: 1,
            root: root(0xb),
        })?;

        assert_eq!(store.justified_checkpoint(), justified);
        assert_eq!(store.head()?, root(0xc));

        Ok(())
    }

    #[test]
    fn validator_indices_are_bounded() -> Result<()> {
        let mut store = Store::new(StoreConfig {
            max_validators: 4,
            ..StoreConfig::default()
        });

        store.initialize(&block(0, 0xa, 0))?;

        assert_eq!(store.apply_attestation(vote(3, 0xa, 0))?, AttestationAction::Accept);

        for validator_index in [4, ValidatorIndex::MAX] {
            assert!(matches!(
                expect_error(store.apply_attestation(vote(validator_index, 0xa, 0))),
                Error::ValidatorIndexOutOfBounds { .. },
            ));
        }

        assert_eq!(store.latest_message(4), None);

        Ok(())
    }

    #[test]
    fn checkpoints_must_be_known() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        let unknown = Checkpoint {
            epoch: 1,
            root: root(0xee),
        };

        assert!(matches!(
            expect_error(store.apply_justified_checkpoint(unknown)),
            Error::UnknownJustifiedRoot { .. },
        ));
        assert!(matches!(
            expect_error(store.apply_finalized_checkpoint(unknown)),
            Error::UnknownFinalizedRoot { .. },
        ));

        Ok(())
    }

    #[test]
    fn older_justified_checkpoints_are_ignored() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(1, 0xb, 0xa))?;

        let newer = Checkpoint {
            epoch: 2,
            root: root(0xb),
        };

        assert!(store.apply_justified_checkpoint(newer)?);
        assert!(!store.apply_justified_checkpoint(Checkpoint {
            epoch: 1,
            root: root(0xa),
        })?);
        assert_eq!(store.justified_checkpoint(), newer);

        Ok(())
    }

    #[test]
    fn justified_checkpoint_filters_head() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_block(&block_in_epochs(2, 0xc, 0xb, 1, 0))?;
        store.apply_block(&block(2, 0xd, 0xb))?;
        store.apply_tick(2)?;

        for validator_index in 0..4 {
            store.apply_attestation(vote(validator_index, 0xd, 2))?;
        }

        assert_eq!(store.head()?, root(0xd));

        store.apply_justified_checkpoint(Checkpoint {
            epoch: 1,
            root: root(0xb),
        })?;

        assert_eq!(store.head()?, root(0xc));

        Ok(())
    }

    #[test]
    fn snapshot_restores_votes_and_head() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_block(&block(1, 0xc, 0xa))?;
        store.apply_tick(1)?;
        store.apply_attestation(vote(0, 0xb, 1))?;

        let head = store.head()?;
        let bytes = store.to_snapshot()?.to_bytes()?;
        let mut restored = Store::from_snapshot(*store.config(), StoreSnapshot::from_bytes(&bytes)?)?;

        assert_eq!(restored.head()?, head);
        assert_eq!(restored.latest_message(0), Some((root(0xb), 1)));
        assert_eq!(restored.slot(), 1);

        // The vote moves rather than being counted again.
        restored.apply_tick(2)?;
        restored.apply_attestation(vote(0, 0xc, 2))?;

        assert_eq!(restored.head()?, root(0xc));
        assert_eq!(restored.proto_array()?.weight(root(0xb)), Some(0));
        assert_eq!(restored.proto_array()?.weight(root(0xa)), Some(32));

        Ok(())
    }

    #[test]
    fn pruned_anchor_cannot_be_used_as_justified_root() -> Result<()> {
        let mut store = ready_store(FlushPolicy::SlotBoundary)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_block(&block(2, 0xc, 0xb))?;
        store.flush()?;

        let proto_array = store.proto_array_mut()?;

        proto_array.prune(root(0xb))?;

        let error = proto_array
            .find_head(root(0xa))
            .expect_err("anchor should be pruned");

        assert_eq!(error_kind(&error), ErrorKind::Structural);
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::UnknownJustifiedRoot { .. }),
        ));

        Ok(())
    }

    #[test_case(FlushPolicy::Immediate)]
    #[test_case(FlushPolicy::SlotBoundary)]
    #[test_case(FlushPolicy::NextSlot)]
    fn policies_agree_after_slot_ends(flush_policy: FlushPolicy) -> Result<()> {
        let mut store = ready_store(flush_policy)?;

        store.apply_block(&block(1, 0xb, 0xa))?;
        store.apply_block(&block(1, 0xc, 0xa))?;
        store.apply_block(&block(2, 0xd, 0xb))?;
        store.apply_tick(2)?;

        store.apply_attestation(vote(0, 0xc, 2))?;
        store.apply_attestation(vote(1, 0xc, 2))?;
        store.apply_attestation(vote(2, 0xd, 2))?;
        store.apply_attestation(vote(3, 0xd, 2))?;
        store.apply_attestation(vote(4, 0xb, 2))?;

        store.apply_tick(3)?;

        assert_eq!(store.head()?, root(0xd));

        Ok(())
    }

    // Every policy must select the same head once the slot containing the votes has ended.
    #[quickcheck]
    fn quickcheck_flush_policies_are_equivalent(
        parents: Vec<u8>,
        votes: Vec<(u8, u8, u8)>,
    ) -> TestResult {
        if parents.len() > 32 || votes.len() > 64 {
            return TestResult::discard();
        }

        let heads = [
            FlushPolicy::Immediate,
            FlushPolicy::SlotBoundary,
            FlushPolicy::NextSlot,
        ]
        .into_iter()
        .map(|policy| run_votes(policy, &parents, &votes).ok())
        .collect_vec();

        TestResult::from_bool(heads.iter().all_equal() && heads[0].is_some())
    }

    fn run_votes(
        flush_policy: FlushPolicy,
        parents: &[u8],
        votes: &[(u8, u8, u8)],
    ) -> Result<H256> {
        let mut store = ready_store(flush_policy)?;
        let mut roots = vec![(root(0xa), 0)];

        for (offset, parent) in parents.iter().enumerate() {
            let (parent_root, parent_slot) = roots[usize::from(*parent) % roots.len()];
            let root = H256::from_low_u64_be(offset as u64 + 1);

            store.apply_block(&BlockSummary {
                slot: parent_slot + 1,
                root,
                parent_root,
                ..BlockSummary::default()
            })?;

            roots.push((root, parent_slot + 1));
        }

        let max_slot = roots.iter().map(|(_, slot)| *slot).max().unwrap_or_default();
        store.apply_tick(max_slot)?;

        // Votes are grouped into slots so that every policy sees the same latest messages.
        for (slot_offset, chunk) in (0..).zip(votes.chunks(8)) {
            let slot = max_slot + slot_offset;
            store.apply_tick(slot)?;

            for (validator, target, balance) in chunk {
                let (target_root, _) = roots[usize::from(*target) % roots.len()];

                store.apply_attestation(Vote {
                    validator_index: ValidatorIndex::from(*validator % 16),
                    target_root,
                    slot,
                    effective_balance: Gwei::from(*balance),
                })?;
            }
        }

        store.apply_tick(max_slot + 100)?;
        store.head()
    }
}
