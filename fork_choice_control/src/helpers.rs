use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use crossbeam_utils::sync::WaitGroup;
use fork_choice_store::StoreConfig;
use futures::channel::mpsc::UnboundedReceiver;
use types::{
    containers::{BlockSummary, Checkpoint, Vote},
    primitives::{Epoch, Gwei, Slot, ValidatorIndex, H256},
};
use unwrap_none::UnwrapNone as _;

use crate::{
    controller::{Controller, MutatorHandle},
    messages::ForkChoiceEvent,
    specialized::TestController,
};

pub const BALANCE: Gwei = 32_000_000_000;

pub struct Context {
    controller: Option<Arc<TestController>>,
    // `None` after `Context::shut_down`.
    mutator_handle: Option<MutatorHandle<WaitGroup>>,
    event_rx: UnboundedReceiver<ForkChoiceEvent>,
}

impl Drop for Context {
    fn drop(&mut self) {
        drop(self.controller.take());
        drop(self.mutator_handle.take());

        if !std::thread::panicking() {
            self.next_event().unwrap_none();
        }
    }
}

impl Context {
    pub fn new(store_config: StoreConfig) -> Self {
        let (event_tx, event_rx) = futures::channel::mpsc::unbounded();
        let (controller, mutator_handle) =
            TestController::with_event_tx(store_config, &anchor(), event_tx);

        Self::from_parts(controller, mutator_handle, event_rx)
    }

    pub fn with_snapshot_path(store_config: StoreConfig, snapshot_path: PathBuf) -> Result<Self> {
        let (event_tx, event_rx) = futures::channel::mpsc::unbounded();
        let (controller, mutator_handle) =
            Controller::new(store_config, &anchor(), Some(snapshot_path), event_tx)?;

        Ok(Self::from_parts(controller, mutator_handle, event_rx))
    }

    pub fn restored(store_config: StoreConfig, bytes: &[u8]) -> Result<Self> {
        let (event_tx, event_rx) = futures::channel::mpsc::unbounded();
        let (controller, mutator_handle) = Controller::restore(store_config, bytes, None, event_tx)?;

        Ok(Self::from_parts(controller, mutator_handle, event_rx))
    }

    fn from_parts(
        controller: Arc<TestController>,
        mutator_handle: MutatorHandle<WaitGroup>,
        event_rx: UnboundedReceiver<ForkChoiceEvent>,
    ) -> Self {
        Self {
            controller: Some(controller),
            mutator_handle: Some(mutator_handle),
            event_rx,
        }
    }

    pub fn controller(&self) -> &TestController {
        self.controller
            .as_ref()
            .expect("Context.controller is only taken when the context is shut down")
    }

    pub fn on_tick(&self, slot: Slot) {
        self.controller().on_tick(slot);
        self.controller().wait_for_tasks();
    }

    pub fn on_block(&self, block: BlockSummary) {
        self.controller().on_block(block);
        self.controller().wait_for_tasks();
    }

    pub fn on_attestation(&self, vote: Vote) {
        self.controller().on_attestation(vote);
        self.controller().wait_for_tasks();
    }

    pub fn on_new_justified(&self, checkpoint: Checkpoint) {
        self.controller().on_new_justified(checkpoint);
        self.controller().wait_for_tasks();
    }

    pub fn on_new_finalized(&self, checkpoint: Checkpoint) {
        self.controller().on_new_finalized(checkpoint);
        self.controller().wait_for_tasks();
    }

    pub fn head(&self) -> H256 {
        self.controller()
            .head()
            .expect("head should be computable in tests")
    }

    pub fn next_event(&mut self) -> Option<ForkChoiceEvent> {
        self.event_rx.try_next().ok().flatten()
    }

    pub fn assert_head(&self, expected_head: H256) {
        assert_eq!(self.head(), expected_head);
    }

    /// Stops the mutator and returns the error it stopped with, if any.
    pub fn shut_down(&mut self) -> Result<()> {
        drop(self.controller.take());

        self.mutator_handle
            .take()
            .expect("Context.mutator_handle is only taken once")
            .join()
    }
}

pub fn root(byte: u8) -> H256 {
    H256::repeat_byte(byte)
}

pub fn anchor() -> BlockSummary {
    block(0, 0xa, 0)
}

pub fn block(slot: Slot, byte: u8, parent_byte: u8) -> BlockSummary {
    BlockSummary {
        slot,
        root: root(byte),
        parent_root: root(parent_byte),
        ..BlockSummary::default()
    }
}

pub fn block_in_epochs(
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

pub fn vote(validator_index: ValidatorIndex, byte: u8, slot: Slot) -> Vote {
    Vote {
        validator_index,
        target_root: root(byte),
        slot,
        effective_balance: BALANCE,
    }
}

pub const fn checkpoint(epoch: Epoch, root: H256) -> Checkpoint {
    Checkpoint { epoch, root }
}
