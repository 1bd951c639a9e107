use static_assertions::assert_impl_all;
use thiserror::Error;
use types::primitives::{Epoch, Slot, ValidatorIndex, Weight, WeightDelta, H256};

use crate::proto_array::NodeIndex;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// The caller referenced something the store does not have or broke a precondition.
    /// The store is unchanged and remains usable.
    Structural,
    /// Internal state is inconsistent. No further fork choice decisions should be made.
    InvariantViolation,
    /// A snapshot could not be encoded or decoded.
    Codec,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("fork choice store is already initialized")]
    AlreadyInitialized,
    #[error(
        "attestation votes for a block from the future \
         (target_root: {target_root:?}, attestation_slot: {attestation_slot}, block_slot: {block_slot})"
    )]
    AttestationForFutureBlock {
        target_root: H256,
        attestation_slot: Slot,
        block_slot: Slot,
    },
    #[error("snapshot contains no nodes")]
    EmptySnapshot,
    #[error("finalized epoch cannot decrease (current: {current}, new: {new})")]
    FinalizedEpochReverted { current: Epoch, new: Epoch },
    #[error("node index could not be remapped while pruning (index: {index})")]
    IndexRemapFailed { index: NodeIndex },
    #[error("node index is out of bounds (index: {index}, length: {length})")]
    InvalidNodeIndex { index: NodeIndex, length: usize },
    #[error("weight would become negative (root: {root:?}, weight: {weight}, delta: {delta})")]
    NegativeWeight {
        root: H256,
        weight: Weight,
        delta: WeightDelta,
    },
    #[error(
        "best descendant is not viable for head \
         (justified_root: {justified_root:?}, best_descendant: {best_descendant:?})"
    )]
    NonViableBestDescendant {
        justified_root: H256,
        best_descendant: H256,
    },
    #[error("fork choice store is not initialized")]
    NotReady,
    #[error(
        "block slot is not after parent slot \
         (root: {root:?}, slot: {slot}, parent_slot: {parent_slot})"
    )]
    SlotNotAfterParent {
        root: H256,
        slot: Slot,
        parent_slot: Slot,
    },
    #[error("failed to decode snapshot")]
    SnapshotDecode,
    #[error("failed to encode snapshot")]
    SnapshotEncode,
    #[error("block is not known: {root:?}")]
    UnknownBlock { root: H256 },
    #[error("finalized root is not known: {root:?}")]
    UnknownFinalizedRoot { root: H256 },
    #[error("justified root is not known: {root:?}")]
    UnknownJustifiedRoot { root: H256 },
    #[error("parent of block is not known (root: {root:?}, parent_root: {parent_root:?})")]
    UnknownParent { root: H256, parent_root: H256 },
    #[error("snapshot format version is not supported (version: {version}, expected: {expected})")]
    UnsupportedSnapshotVersion { version: u32, expected: u32 },
    #[error("validator index is out of bounds: {validator_index}")]
    ValidatorIndexOutOfBounds { validator_index: ValidatorIndex },
    #[error("weight overflowed (root: {root:?}, weight: {weight}, delta: {delta})")]
    WeightOverflow {
        root: H256,
        weight: Weight,
        delta: WeightDelta,
    },
}

assert_impl_all!(Error: Send, Sync);

impl Error {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyInitialized
            | Self::AttestationForFutureBlock { .. }
            | Self::FinalizedEpochReverted { .. }
            | Self::NotReady
            | Self::SlotNotAfterParent { .. }
            | Self::UnknownBlock { .. }
            | Self::UnknownFinalizedRoot { .. }
            | Self::UnknownJustifiedRoot { .. }
            | Self::UnknownParent { .. }
            | Self::ValidatorIndexOutOfBounds { .. } => ErrorKind::Structural,
            Self::IndexRemapFailed { .. }
            | Self::InvalidNodeIndex { .. }
            | Self::NegativeWeight { .. }
            | Self::NonViableBestDescendant { .. }
            | Self::WeightOverflow { .. } => ErrorKind::InvariantViolation,
            Self::EmptySnapshot
            | Self::SnapshotDecode
            | Self::SnapshotEncode
            | Self::UnsupportedSnapshotVersion { .. } => ErrorKind::Codec,
        }
    }
}

/// Classifies an error returned by this crate.
///
/// Errors that did not originate here (there should be none) are treated as invariant
/// violations so that callers stop instead of continuing with unknown state.
#[must_use]
pub fn error_kind(error: &anyhow::Error) -> ErrorKind {
    error
        .downcast_ref::<Error>()
        .map_or(ErrorKind::InvariantViolation, Error::kind)
}
