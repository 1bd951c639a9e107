//! Concurrency shell around [`fork_choice_store::Store`].
//!
//! This crate handles the following concerns:
//! - Serializing mutations in a [dedicated thread](`Controller`).
//! - Publishing snapshots of the store for read-only queries.
//! - Delaying and retrying objects that reference blocks not yet in the store.
//! - [Waiting for message handling to complete](`Controller::wait_for_tasks`).
//! - Notifying other components through [`ForkChoiceEvent`]s.
//! - Saving the store on shutdown.

pub use crate::{
    controller::{Controller, MutatorHandle},
    messages::ForkChoiceEvent,
    misc::{DiscardReason, RejectionReason},
    unbounded_sink::UnboundedSink,
    wait::Wait,
};

mod controller;
mod messages;
mod misc;
mod mutator;
mod specialized;
mod unbounded_sink;
mod wait;

#[cfg(test)]
mod helpers;
