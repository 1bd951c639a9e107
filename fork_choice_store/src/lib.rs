//! LMD-GHOST fork choice over a weighted block tree.
//!
//! The tree is a [`ProtoArray`]. Every node stores the total weight of votes for it and its
//! descendants along with a link to its heaviest child and the best leaf reachable through such
//! links. Finding the head is a single lookup once weight changes have been applied.
//!
//! Votes are recorded by [`VoteTracker`], which turns changed votes into per-node deltas.
//! Deltas are only computed when the [`Store`] is flushed. When that happens depends on the
//! [`FlushPolicy`]. Every policy results in the same head once all pending votes are flushed.
//!
//! Blocks and attestations are processed with `apply_*` methods on [`Store`].
//! They return an action describing what the caller should do with the object.
//! Objects that reference unknown blocks or future slots are not stored. Delaying them is left to
//! the caller (see `fork_choice_control`).
//!
//! Errors are returned as [`anyhow::Error`]s wrapping [`Error`]. Use [`error_kind`] to tell
//! structural errors caused by callers apart from violations of internal invariants.
//! The latter mean the tree can no longer be trusted.
//!
//! The tree and the vote table are persistent data structures, so a [`Store`] can be cloned after
//! every mutation and handed to readers.

pub use crate::{
    error::{error_kind, Error, ErrorKind},
    misc::{ApplyTickChanges, AttestationAction, BlockAction, StoreState, StoreStatus},
    proto_array::{AncestorIter, NodeIndex, ProtoArray, WeightedNode},
    snapshot::{ProtoArraySnapshot, SnapshotNode, StoreSnapshot, SNAPSHOT_VERSION},
    store::Store,
    store_config::{FlushPolicy, StoreConfig, DEFAULT_PRUNE_THRESHOLD},
    vote_tracker::{VoteEntry, VoteTracker},
};

mod error;
mod misc;
mod proto_array;
mod snapshot;
mod store;
mod store_config;
mod vote_tracker;
