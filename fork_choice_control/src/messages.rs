use std::sync::mpsc::Sender;

use anyhow::Result;
use futures::channel::oneshot::Sender as OneshotSender;
use log::debug;
use types::{
    containers::{BlockSummary, Checkpoint, Vote},
    primitives::{Slot, H256},
};

use crate::{
    misc::{DiscardReason, RejectionReason},
    unbounded_sink::UnboundedSink,
};

// Queries are answered through `OneshotSender`s and do not need a `wait_group`.
// Everything else carries one to make `Controller::wait_for_tasks` work.
pub enum MutatorMessage<W> {
    Tick {
        wait_group: W,
        slot: Slot,
    },
    Block {
        wait_group: W,
        block: BlockSummary,
        // `Some` if the block is being retried after a delay.
        delayed_at: Option<Slot>,
    },
    Attestation {
        wait_group: W,
        vote: Vote,
        delayed_at: Option<Slot>,
    },
    Justified {
        wait_group: W,
        checkpoint: Checkpoint,
    },
    Finalized {
        wait_group: W,
        checkpoint: Checkpoint,
    },
    Head {
        sender: OneshotSender<Result<H256>>,
    },
    ExportSnapshot {
        sender: OneshotSender<Result<Vec<u8>>>,
    },
    Stop {
        save_to_storage: bool,
    },
}

impl<W> MutatorMessage<W> {
    pub(crate) fn send(self, tx: &Sender<Self>) {
        if tx.send(self).is_err() {
            // This happens when the mutator thread has already exited, either because it was
            // stopped or because it failed.
            debug!("send to mutator failed because the receiver was dropped");
        }
    }
}

/// Notifications about changes in the fork choice store.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ForkChoiceEvent {
    Head {
        root: H256,
        slot: Slot,
    },
    Finalized(Checkpoint),
    Pruned {
        finalized_root: H256,
        removed: usize,
    },
    Rejected {
        reason: RejectionReason,
        message: String,
    },
    /// A delayed block or attestation was dropped. `root` is the root of the block or the target
    /// of the attestation.
    Discarded {
        reason: DiscardReason,
        root: H256,
    },
}

impl ForkChoiceEvent {
    pub(crate) fn send(self, tx: &impl UnboundedSink<Self>) {
        if tx.unbounded_send(self).is_err() {
            debug!("send to event channel failed because the receiver was dropped");
        }
    }
}
