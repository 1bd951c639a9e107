// `Mutator::run` is executed in a dedicated thread. It owns the only mutable copy of `Store` and
// handles messages one at a time, so every mutation and every authoritative head computation is
// serialized without locks.
//
// After handling a message that leaves `Store` in a consistent state, the mutator publishes a clone
// of it through `Mutator.store_snapshot`. Readers never observe a partially applied update.
//
// Blocks and attestations that reference blocks not yet in the tree are kept in memory and sent
// back to the mutator through its own channel when the referenced block is accepted.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        mpsc::{Receiver, Sender},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use drain_filter_polyfill::VecExt as _;
use fork_choice_store::{
    error_kind, ApplyTickChanges, AttestationAction, BlockAction, ErrorKind, Store,
};
use futures::channel::oneshot::Sender as OneshotSender;
use log::{debug, error, info, warn};
use types::{
    containers::{BlockSummary, Checkpoint, Vote},
    primitives::{Slot, H256},
};

use crate::{
    messages::{ForkChoiceEvent, MutatorMessage},
    misc::{Delayed, DiscardReason, PendingBlock, PendingVote, RejectionReason},
    unbounded_sink::UnboundedSink,
    wait::Wait,
};

pub struct Mutator<W, E> {
    store: Arc<Store>,
    store_snapshot: Arc<ArcSwap<Store>>,
    delayed_until_block: HashMap<H256, Delayed>,
    delayed_until_slot: BTreeMap<Slot, Delayed>,
    snapshot_path: Option<PathBuf>,
    mutator_tx: Sender<MutatorMessage<W>>,
    mutator_rx: Receiver<MutatorMessage<W>>,
    event_tx: E,
}

impl<W, E> Mutator<W, E>
where
    W: Wait,
    E: UnboundedSink<ForkChoiceEvent>,
{
    pub fn new(
        store_snapshot: Arc<ArcSwap<Store>>,
        snapshot_path: Option<PathBuf>,
        mutator_tx: Sender<MutatorMessage<W>>,
        mutator_rx: Receiver<MutatorMessage<W>>,
        event_tx: E,
    ) -> Self {
        Self {
            store: store_snapshot.load_full(),
            store_snapshot,
            delayed_until_block: HashMap::new(),
            delayed_until_slot: BTreeMap::new(),
            snapshot_path,
            mutator_tx,
            mutator_rx,
            event_tx,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            match self
                .mutator_rx
                .recv()
                .expect("Mutator.mutator_tx keeps the channel open until the mutator exits")
            {
                MutatorMessage::Tick { wait_group, slot } => self.handle_tick(&wait_group, slot)?,
                MutatorMessage::Block {
                    wait_group,
                    block,
                    delayed_at,
                } => self.handle_block(&wait_group, block, delayed_at)?,
                MutatorMessage::Attestation {
                    wait_group: _,
                    vote,
                    delayed_at,
                } => self.handle_attestation(vote, delayed_at)?,
                MutatorMessage::Justified {
                    wait_group: _,
                    checkpoint,
                } => self.handle_justified(checkpoint)?,
                MutatorMessage::Finalized {
                    wait_group: _,
                    checkpoint,
                } => self.handle_finalized(checkpoint)?,
                MutatorMessage::Head { sender } => {
                    let result = self.update_head();
                    self.respond(sender, result)?;
                }
                MutatorMessage::ExportSnapshot { sender } => {
                    let result = self.export_snapshot();
                    self.respond(sender, result)?;
                }
                MutatorMessage::Stop { save_to_storage } => {
                    break self.handle_stop(save_to_storage);
                }
            }
        }
    }

    fn handle_tick(&mut self, wait_group: &W, slot: Slot) -> Result<()> {
        let changes = self.store_mut().apply_tick(slot)?;

        let ApplyTickChanges::SlotUpdated {
            released_attestations,
        } = changes
        else {
            return Ok(());
        };

        if released_attestations > 0 {
            debug!("released {released_attestations} attestations held until slot {slot}");
        }

        self.discard_expired_delayed_objects(slot);

        for delayed in self.take_delayed_until_slot(slot) {
            self.retry_delayed(delayed, wait_group);
        }

        // The head is recomputed on every slot so that `Head` events are emitted without queries.
        self.refresh_head()
    }

    fn handle_block(
        &mut self,
        wait_group: &W,
        block: BlockSummary,
        delayed_at: Option<Slot>,
    ) -> Result<()> {
        match self.store_mut().apply_block(&block) {
            Ok(BlockAction::Accept) => {
                debug!("block accepted (block: {block:?})");

                self.update_store_snapshot();

                if let Some(delayed) = self.take_delayed_until_block(block.root) {
                    self.retry_delayed(delayed, wait_group);
                }
            }
            Ok(BlockAction::Ignore) => debug!("block ignored (block: {block:?})"),
            Ok(BlockAction::DelayUntilParent(parent_root)) => {
                self.delay_block_until_parent(block, parent_root, delayed_at);
            }
            Err(error) => self.handle_store_error(error, RejectionReason::InvalidBlock)?,
        }

        Ok(())
    }

    fn handle_attestation(&mut self, vote: Vote, delayed_at: Option<Slot>) -> Result<()> {
        match self.store_mut().apply_attestation(vote) {
            Ok(AttestationAction::Accept) => self.update_store_snapshot(),
            Ok(AttestationAction::Ignore) => debug!("attestation ignored (vote: {vote:?})"),
            Ok(AttestationAction::DelayUntilBlock(block_root)) => {
                self.delay_attestation_until_block(vote, block_root, delayed_at);
            }
            Ok(AttestationAction::DelayUntilSlot(slot)) => {
                self.delay_attestation_until_slot(vote, slot, delayed_at);
            }
            Err(error) => self.handle_store_error(error, RejectionReason::InvalidAttestation)?,
        }

        Ok(())
    }

    fn handle_justified(&mut self, checkpoint: Checkpoint) -> Result<()> {
        match self.store_mut().apply_justified_checkpoint(checkpoint) {
            Ok(true) => {
                info!("justified checkpoint updated (checkpoint: {checkpoint:?})");
                self.refresh_head()?;
            }
            Ok(false) => debug!("justified checkpoint is not newer (checkpoint: {checkpoint:?})"),
            Err(error) => self.handle_store_error(error, RejectionReason::InvalidCheckpoint)?,
        }

        Ok(())
    }

    fn handle_finalized(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if self.store.finalized_checkpoint() == checkpoint {
            return Ok(());
        }

        let removed = match self.store_mut().apply_finalized_checkpoint(checkpoint) {
            Ok(removed) => removed,
            Err(error) => return self.handle_store_error(error, RejectionReason::InvalidCheckpoint),
        };

        info!("finalized checkpoint updated (checkpoint: {checkpoint:?})");

        ForkChoiceEvent::Finalized(checkpoint).send(&self.event_tx);

        if removed > 0 {
            info!("pruned {removed} blocks not descending from {:?}", checkpoint.root);

            ForkChoiceEvent::Pruned {
                finalized_root: checkpoint.root,
                removed,
            }
            .send(&self.event_tx);
        }

        self.discard_orphaned_delayed_objects(checkpoint.root);
        self.refresh_head()
    }

    fn handle_stop(&mut self, save_to_storage: bool) -> Result<()> {
        if !save_to_storage {
            return Ok(());
        }

        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };

        let bytes = self.export_snapshot()?;

        fs_err::write(&path, bytes)?;

        info!(
            "fork choice snapshot saved (path: {}, blocks: {})",
            path.display(),
            self.store.status().block_count,
        );

        Ok(())
    }

    fn handle_store_error(&self, error: anyhow::Error, reason: RejectionReason) -> Result<()> {
        if error_kind(&error) == ErrorKind::InvariantViolation {
            error!("fork choice store is inconsistent: {error:?}");
            return Err(error);
        }

        let reason_str: &str = reason.into();

        warn!("{reason_str}: {error:#}");

        ForkChoiceEvent::Rejected {
            reason,
            message: format!("{error:#}"),
        }
        .send(&self.event_tx);

        Ok(())
    }

    // The requester gets a copy of the error even if it stops the mutator.
    fn respond<T>(&self, sender: OneshotSender<Result<T>>, result: Result<T>) -> Result<()> {
        let (reply, fatal) = match result {
            Err(error) if error_kind(&error) == ErrorKind::InvariantViolation => {
                error!("fork choice store is inconsistent: {error:?}");
                let reply = Err(anyhow!("fork choice store is inconsistent: {error:#}"));
                (reply, Some(error))
            }
            result => (result, None),
        };

        if sender.send(reply).is_err() {
            debug!("send to requester failed because the receiver was dropped");
        }

        fatal.map_or(Ok(()), Err)
    }

    // Only invariant violations are returned. Other failures leave the previous head in place.
    fn refresh_head(&mut self) -> Result<()> {
        match self.update_head() {
            Ok(_) => Ok(()),
            Err(error) if error_kind(&error) == ErrorKind::InvariantViolation => {
                error!("fork choice store is inconsistent: {error:?}");
                Err(error)
            }
            Err(error) => {
                warn!("head could not be updated: {error:#}");
                Ok(())
            }
        }
    }

    fn update_head(&mut self) -> Result<H256> {
        let previous_head = self.store.last_head();
        let head = self.store_mut().head()?;

        self.update_store_snapshot();

        if previous_head != Some(head) {
            let slot = self.store.block_slot(head).unwrap_or_default();

            info!("head changed (root: {head:?}, slot: {slot})");

            ForkChoiceEvent::Head { root: head, slot }.send(&self.event_tx);
        }

        Ok(head)
    }

    fn export_snapshot(&mut self) -> Result<Vec<u8>> {
        let snapshot = self.store_mut().to_snapshot()?;

        // Creating the snapshot flushes pending votes.
        self.update_store_snapshot();

        snapshot.to_bytes()
    }

    fn delay_block_until_parent(
        &mut self,
        block: BlockSummary,
        parent_root: H256,
        delayed_at: Option<Slot>,
    ) {
        let delayed_at = delayed_at.unwrap_or_else(|| self.store.slot());

        if self.delayed_object_count() >= self.store.config().max_delayed_objects {
            self.discard(DiscardReason::CapacityExceeded, block.root);
            return;
        }

        debug!("block delayed until parent (block: {block:?}, parent_root: {parent_root:?})");

        self.delayed_until_block
            .entry(parent_root)
            .or_default()
            .blocks
            .push(PendingBlock {
                block,
                delayed_at,
            });
    }

    fn delay_attestation_until_block(
        &mut self,
        vote: Vote,
        block_root: H256,
        delayed_at: Option<Slot>,
    ) {
        let delayed_at = delayed_at.unwrap_or_else(|| self.store.slot());

        if self.delayed_object_count() >= self.store.config().max_delayed_objects {
            self.discard(DiscardReason::CapacityExceeded, vote.target_root);
            return;
        }

        debug!("attestation delayed until block (vote: {vote:?}, block_root: {block_root:?})");

        self.delayed_until_block
            .entry(block_root)
            .or_default()
            .attestations
            .push(PendingVote {
                vote,
                delayed_at,
            });
    }

    fn delay_attestation_until_slot(&mut self, vote: Vote, slot: Slot, delayed_at: Option<Slot>) {
        let delayed_at = delayed_at.unwrap_or_else(|| self.store.slot());
        let max_delay_slots = self.store.config().max_delay_slots;

        if slot > self.store.slot().saturating_add(max_delay_slots) {
            self.discard(DiscardReason::TooFarInFuture, vote.target_root);
            return;
        }

        if self.delayed_object_count() >= self.store.config().max_delayed_objects {
            self.discard(DiscardReason::CapacityExceeded, vote.target_root);
            return;
        }

        debug!("attestation delayed until slot (vote: {vote:?}, slot: {slot})");

        self.delayed_until_slot
            .entry(slot)
            .or_default()
            .attestations
            .push(PendingVote {
                vote,
                delayed_at,
            });
    }

    fn take_delayed_until_block(&mut self, block_root: H256) -> Option<Delayed> {
        self.delayed_until_block.remove(&block_root)
    }

    fn take_delayed_until_slot(&mut self, slot: Slot) -> impl Iterator<Item = Delayed> {
        match slot.checked_add(1) {
            Some(next_slot) => {
                let later = self.delayed_until_slot.split_off(&next_slot);
                core::mem::replace(&mut self.delayed_until_slot, later)
            }
            None => core::mem::take(&mut self.delayed_until_slot),
        }
        .into_values()
    }

    // `wait_group` is borrowed from the message being handled, so `Controller::wait_for_tasks`
    // cannot return before the retries are sent.
    fn retry_delayed(&self, delayed: Delayed, wait_group: &W) {
        let Delayed {
            blocks,
            attestations,
        } = delayed;

        for PendingBlock { block, delayed_at } in blocks {
            debug!("retrying delayed block (block: {block:?})");

            MutatorMessage::Block {
                wait_group: wait_group.clone(),
                block,
                delayed_at: Some(delayed_at),
            }
            .send(&self.mutator_tx);
        }

        for PendingVote { vote, delayed_at } in attestations {
            debug!("retrying delayed attestation (vote: {vote:?})");

            MutatorMessage::Attestation {
                wait_group: wait_group.clone(),
                vote,
                delayed_at: Some(delayed_at),
            }
            .send(&self.mutator_tx);
        }
    }

    fn discard_expired_delayed_objects(&mut self, slot: Slot) {
        let max_delay_slots = self.store.config().max_delay_slots;
        let is_expired = |delayed_at: Slot| delayed_at.saturating_add(max_delay_slots) < slot;

        self.discard_delayed_until_block(
            DiscardReason::Expired,
            |pending| is_expired(pending.delayed_at),
            |pending| is_expired(pending.delayed_at),
        );
    }

    // Objects from slots up to the finalized block can only be connected to finalized ancestors.
    fn discard_orphaned_delayed_objects(&mut self, finalized_root: H256) {
        let Some(finalized_slot) = self.store.block_slot(finalized_root) else {
            return;
        };

        self.discard_delayed_until_block(
            DiscardReason::Orphaned,
            |pending| pending.block.slot <= finalized_slot,
            |pending| pending.vote.slot <= finalized_slot,
        );
    }

    fn discard_delayed_until_block(
        &mut self,
        reason: DiscardReason,
        mut discard_block: impl FnMut(&PendingBlock) -> bool,
        mut discard_vote: impl FnMut(&PendingVote) -> bool,
    ) {
        let event_tx = &self.event_tx;

        // Use `drain_filter_polyfill` because `Vec::extract_if` is not stable on all supported
        // toolchains.
        self.delayed_until_block.retain(|_, delayed| {
            for pending in delayed.blocks.drain_filter(|pending| discard_block(&*pending)) {
                Self::report_discarded(event_tx, reason, pending.block.root);
            }

            for pending in delayed
                .attestations
                .drain_filter(|pending| discard_vote(&*pending))
            {
                Self::report_discarded(event_tx, reason, pending.vote.target_root);
            }

            !delayed.is_empty()
        });
    }

    fn discard(&self, reason: DiscardReason, root: H256) {
        Self::report_discarded(&self.event_tx, reason, root);
    }

    fn report_discarded(event_tx: &E, reason: DiscardReason, root: H256) {
        let reason_str: &str = reason.into();

        warn!("delayed object discarded (reason: {reason_str}, root: {root:?})");

        ForkChoiceEvent::Discarded { reason, root }.send(event_tx);
    }

    fn delayed_object_count(&self) -> usize {
        self.delayed_until_block
            .values()
            .chain(self.delayed_until_slot.values())
            .map(Delayed::len)
            .sum()
    }

    // This should only be called when `Mutator.store` is in a consistent state.
    fn update_store_snapshot(&self) {
        self.store_snapshot.store(Arc::clone(&self.store));
    }

    fn store_mut(&mut self) -> &mut Store {
        Arc::make_mut(&mut self.store)
    }
}
