use std::sync::{Arc, Mutex};

use crossbeam_utils::sync::WaitGroup;

/// Tracks messages that have been sent to the mutator but not handled yet.
///
/// `()` tracks nothing. [`WaitGroup`] lets tests block until the mutator catches up.
pub trait Wait: Clone + Default + Send + 'static {
    type Swappable: Clone + Default + Send + Sync;

    fn load_and_clone(swappable: &Self::Swappable) -> Self;
}

impl Wait for () {
    type Swappable = ();

    fn load_and_clone((): &Self::Swappable) -> Self {}
}

impl Wait for WaitGroup {
    // `Controller::wait_for_tasks` replaces the `WaitGroup` with a fresh one before waiting.
    type Swappable = Arc<Mutex<Self>>;

    fn load_and_clone(swappable: &Self::Swappable) -> Self {
        swappable
            .lock()
            .expect("Controller.wait_group mutex is poisoned")
            .clone()
    }
}
