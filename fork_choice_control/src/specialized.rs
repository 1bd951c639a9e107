use core::ops::DerefMut as _;
use std::sync::Arc;

use crossbeam_utils::sync::WaitGroup;
use fork_choice_store::StoreConfig;
use tap::Pipe as _;
use types::containers::BlockSummary;

use crate::{
    controller::{Controller, MutatorHandle},
    messages::ForkChoiceEvent,
    unbounded_sink::UnboundedSink,
};

#[cfg(test)]
pub type TestController = Controller<WaitGroup>;

impl Controller<WaitGroup> {
    /// Waits until every message sent so far has been handled.
    ///
    /// Objects retried by the mutator while handling those messages are waited for too.
    ///
    /// This is intended for use in tests and benchmarks.
    /// [`WaitGroup`] is not used in normal operation because it adds some overhead.
    pub fn wait_for_tasks(&self) {
        let wait_group = self
            .wait_group()
            .lock()
            .expect("Controller.wait_group mutex is poisoned")
            .deref_mut()
            .pipe(core::mem::take);

        wait_group.wait()
    }

    #[must_use]
    pub fn quiet(
        store_config: StoreConfig,
        anchor: &BlockSummary,
    ) -> (Arc<Self>, MutatorHandle<WaitGroup>) {
        Self::with_event_tx(store_config, anchor, futures::sink::drain())
    }

    pub fn with_event_tx(
        store_config: StoreConfig,
        anchor: &BlockSummary,
        event_tx: impl UnboundedSink<ForkChoiceEvent>,
    ) -> (Arc<Self>, MutatorHandle<WaitGroup>) {
        Self::new(store_config, anchor, None, event_tx)
            .expect("Controller::new should not fail in tests and benchmarks")
    }
}
