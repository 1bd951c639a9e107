use derivative::Derivative;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use types::primitives::{Slot, ValidatorIndex};

pub const DEFAULT_PRUNE_THRESHOLD: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Derivative, Deserialize, Serialize)]
#[derivative(Default)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    #[derivative(Default(value = "DEFAULT_PRUNE_THRESHOLD"))]
    pub prune_threshold: usize,
    pub flush_policy: FlushPolicy,
    // Blocks and attestations waiting for a block they reference. Counted together.
    #[derivative(Default(value = "10_000"))]
    pub max_delayed_objects: usize,
    #[derivative(Default(value = "32"))]
    pub max_delay_slots: Slot,
    // Votes from validators with higher indices are rejected. Bounds the size of the vote table.
    #[derivative(Default(value = "1 << 22"))]
    pub max_validators: ValidatorIndex,
}

/// Determines when recorded votes are turned into weight changes.
///
/// All policies produce the same head once pending changes are flushed. They differ in how much
/// work is done per attestation and in which attestations the head can see.
#[derive(
    Clone, Copy, PartialEq, Eq, Default, Debug, Display, EnumString, Deserialize, Serialize,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Apply weight changes after every attestation.
    Immediate,
    /// Apply weight changes when the slot advances and before every head query.
    #[default]
    SlotBoundary,
    /// Like [`FlushPolicy::SlotBoundary`], but attestations from the current slot are held
    /// until the next slot starts. Attestations released just before a head computation cannot
    /// affect it.
    NextSlot,
}

impl FlushPolicy {
    #[must_use]
    pub const fn holds_current_slot_attestations(self) -> bool {
        matches!(self, Self::NextSlot)
    }
}
