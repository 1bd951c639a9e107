// The `on_*` methods do not mutate `Store` directly. They send messages to the mutator thread,
// which handles them in order. Query methods operate on a recent but potentially out-of-date
// snapshot of `Store`. This accomplishes 2 things:
// - The `on_*` methods return quickly and can be called from `async` tasks.
// - Informational queries never wait for pending mutations.
//
// `Controller::head` is the exception. It goes through the mutator to flush pending votes first.

use core::{future::Future, panic::AssertUnwindSafe};
use std::{
    path::PathBuf,
    sync::{mpsc::Sender, Arc},
    thread::{Builder, JoinHandle},
};

use anyhow::{Context as _, Result};
use arc_swap::{ArcSwap, Guard};
use fork_choice_store::{Store, StoreConfig, StoreSnapshot, StoreStatus};
use futures::channel::oneshot;
use thiserror::Error;
use types::{
    containers::{BlockSummary, Checkpoint, Vote},
    primitives::{Slot, ValidatorIndex, H256},
};

use crate::{
    messages::{ForkChoiceEvent, MutatorMessage},
    mutator::Mutator,
    unbounded_sink::UnboundedSink,
    wait::Wait,
};

pub struct Controller<W: Wait> {
    // The latest consistent snapshot of the store.
    store_snapshot: Arc<ArcSwap<Store>>,
    wait_group: W::Swappable,
    mutator_tx: Sender<MutatorMessage<W>>,
}

impl<W: Wait> Drop for Controller<W> {
    fn drop(&mut self) {
        let save_to_storage = !std::thread::panicking();
        MutatorMessage::Stop { save_to_storage }.send(&self.mutator_tx);
    }
}

impl<W: Wait> Controller<W> {
    /// Starts a mutator thread with a store anchored at `anchor`.
    ///
    /// If `snapshot_path` is set, a snapshot is written to it when the mutator stops.
    pub fn new(
        store_config: StoreConfig,
        anchor: &BlockSummary,
        snapshot_path: Option<PathBuf>,
        event_tx: impl UnboundedSink<ForkChoiceEvent>,
    ) -> Result<(Arc<Self>, MutatorHandle<W>)> {
        let mut store = Store::new(store_config);

        store.initialize(anchor)?;

        Self::start(store, snapshot_path, event_tx)
    }

    /// Like [`Controller::new`], but with a store restored from bytes produced by
    /// [`Controller::export_snapshot`].
    pub fn restore(
        store_config: StoreConfig,
        bytes: &[u8],
        snapshot_path: Option<PathBuf>,
        event_tx: impl UnboundedSink<ForkChoiceEvent>,
    ) -> Result<(Arc<Self>, MutatorHandle<W>)> {
        let snapshot = StoreSnapshot::from_bytes(bytes)?;
        let store = Store::from_snapshot(store_config, snapshot)?;

        Self::start(store, snapshot_path, event_tx)
    }

    fn start(
        store: Store,
        snapshot_path: Option<PathBuf>,
        event_tx: impl UnboundedSink<ForkChoiceEvent>,
    ) -> Result<(Arc<Self>, MutatorHandle<W>)> {
        let store_snapshot = Arc::new(ArcSwap::from_pointee(store));
        let (mutator_tx, mutator_rx) = std::sync::mpsc::channel();

        let mut mutator = Mutator::new(
            Arc::clone(&store_snapshot),
            snapshot_path,
            mutator_tx.clone(),
            mutator_rx,
            event_tx,
        );

        let join_handle = Builder::new().name("store-mutator".to_owned()).spawn(|| {
            // The copy of `Store` owned by the mutator may be left inconsistent by a panic, but it
            // cannot be observed because snapshots are only published in consistent states.
            std::panic::catch_unwind(AssertUnwindSafe(move || mutator.run()))
                .map_err(payload_into_error)
                .context(Error::MutatorPanicked)?
                .context(Error::MutatorFailed)
        })?;

        let controller = Arc::new(Self {
            store_snapshot,
            wait_group: W::Swappable::default(),
            mutator_tx: mutator_tx.clone(),
        });

        let mutator_handle = MutatorHandle {
            join_handle: Some(join_handle),
            mutator_tx,
        };

        Ok((controller, mutator_handle))
    }

    // Ticks for past slots are ignored by `Store`, so they are sent without checking.
    pub fn on_tick(&self, slot: Slot) {
        MutatorMessage::Tick {
            wait_group: self.owned_wait_group(),
            slot,
        }
        .send(&self.mutator_tx)
    }

    pub fn on_block(&self, block: BlockSummary) {
        MutatorMessage::Block {
            wait_group: self.owned_wait_group(),
            block,
            delayed_at: None,
        }
        .send(&self.mutator_tx)
    }

    pub fn on_attestation(&self, vote: Vote) {
        MutatorMessage::Attestation {
            wait_group: self.owned_wait_group(),
            vote,
            delayed_at: None,
        }
        .send(&self.mutator_tx)
    }

    pub fn on_new_justified(&self, checkpoint: Checkpoint) {
        MutatorMessage::Justified {
            wait_group: self.owned_wait_group(),
            checkpoint,
        }
        .send(&self.mutator_tx)
    }

    pub fn on_new_finalized(&self, checkpoint: Checkpoint) {
        MutatorMessage::Finalized {
            wait_group: self.owned_wait_group(),
            checkpoint,
        }
        .send(&self.mutator_tx)
    }

    /// Computes the head after every message sent so far has been handled.
    ///
    /// Blocks the current thread. Use [`Controller::head_async`] in `async` code.
    pub fn head(&self) -> Result<H256> {
        futures::executor::block_on(self.head_async())
    }

    pub fn head_async(&self) -> impl Future<Output = Result<H256>> {
        let (sender, receiver) = oneshot::channel();

        MutatorMessage::Head { sender }.send(&self.mutator_tx);

        async move { receiver.await.context(Error::MutatorStopped)? }
    }

    /// Encodes the store in the format accepted by [`Controller::restore`].
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        let (sender, receiver) = oneshot::channel();

        MutatorMessage::ExportSnapshot { sender }.send(&self.mutator_tx);

        futures::executor::block_on(receiver).context(Error::MutatorStopped)?
    }

    /// The head computed by the latest head update. May lag behind [`Controller::head`].
    #[must_use]
    pub fn snapshot_head(&self) -> Option<H256> {
        self.store_snapshot().last_head()
    }

    #[must_use]
    pub fn status(&self) -> StoreStatus {
        self.store_snapshot().status()
    }

    #[must_use]
    pub fn slot(&self) -> Slot {
        self.store_snapshot().slot()
    }

    #[must_use]
    pub fn contains_block(&self, root: H256) -> bool {
        self.store_snapshot().contains_block(root)
    }

    #[must_use]
    pub fn is_descendant(&self, root: H256, ancestor_root: H256) -> bool {
        self.store_snapshot().is_descendant(root, ancestor_root)
    }

    #[must_use]
    pub fn justified_checkpoint(&self) -> Checkpoint {
        self.store_snapshot().justified_checkpoint()
    }

    #[must_use]
    pub fn finalized_checkpoint(&self) -> Checkpoint {
        self.store_snapshot().finalized_checkpoint()
    }

    #[must_use]
    pub fn latest_message(&self, validator_index: ValidatorIndex) -> Option<(H256, Slot)> {
        self.store_snapshot().latest_message(validator_index)
    }

    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        *self.store_snapshot().config()
    }

    pub fn store_snapshot(&self) -> Guard<Arc<Store>> {
        self.store_snapshot.load()
    }

    #[must_use]
    pub fn owned_store_snapshot(&self) -> Arc<Store> {
        self.store_snapshot.load_full()
    }

    pub(crate) const fn wait_group(&self) -> &W::Swappable {
        &self.wait_group
    }

    fn owned_wait_group(&self) -> W {
        W::load_and_clone(&self.wait_group)
    }
}

/// A wrapper over [`JoinHandle`] that can be used to wait for the mutator thread to finish.
///
/// In normal operation the mutator thread should be joined explicitly using
/// [`MutatorHandle::join`], which returns the error that stopped it, if any. Tests may drop
/// [`MutatorHandle`], at which point the mutator thread will be joined implicitly.
pub struct MutatorHandle<W> {
    join_handle: Option<JoinHandle<Result<()>>>,
    mutator_tx: Sender<MutatorMessage<W>>,
}

impl<W> Drop for MutatorHandle<W> {
    fn drop(&mut self) {
        // Stop the mutator even if the corresponding `Controller` is still alive.
        // Otherwise joining would deadlock.
        self.stop();

        let result = self.join_internal();

        if !std::thread::panicking() {
            result.expect("mutator thread should succeed when joined implicitly")
        }
    }
}

impl<W> MutatorHandle<W> {
    pub fn join(mut self) -> Result<()> {
        self.join_internal()
    }

    fn stop(&self) {
        let save_to_storage = !std::thread::panicking();
        MutatorMessage::Stop { save_to_storage }.send(&self.mutator_tx);
    }

    fn join_internal(&mut self) -> Result<()> {
        // `MutatorHandle::join_internal` is called twice when joining explicitly.
        match self.join_handle.take() {
            Some(join_handle) => join_handle
                .join()
                .expect("mutator thread handles panics internally"),
            None => Ok(()),
        }
    }
}

fn payload_into_error(payload: Box<dyn core::any::Any + Send>) -> anyhow::Error {
    let message = match payload.downcast::<String>() {
        Ok(string) => *string,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map_or_else(
                || "panic payload is not a string".to_owned(),
                |message| (*message).to_owned(),
            ),
    };

    anyhow::Error::msg(message)
}

#[derive(Debug, Error)]
enum Error {
    #[error("mutator panicked")]
    MutatorPanicked,
    #[error("mutator failed")]
    MutatorFailed,
    #[error("mutator stopped before responding")]
    MutatorStopped,
}
