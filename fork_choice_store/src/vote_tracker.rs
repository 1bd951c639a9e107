use core::ops::{AddAssign as _, SubAssign as _};

use anyhow::Result;
use hash_hasher::HashedMap;
use im::Vector;
use serde::{Deserialize, Serialize};
use types::{
    containers::Vote,
    primitives::{Gwei, Slot, ValidatorIndex, WeightDelta, H256},
};

use crate::{
    error::Error,
    proto_array::{NodeIndex, ProtoArray},
};

/// The latest known vote of a single validator.
///
/// `current_*` fields describe what has been applied to weights. `next_*` fields describe the
/// latest vote, which is applied on the next call to [`VoteTracker::compute_deltas`].
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
pub struct VoteEntry {
    pub current_root: Option<H256>,
    pub current_balance: Gwei,
    pub next_root: Option<H256>,
    pub next_balance: Gwei,
    pub next_slot: Slot,
}

#[derive(Clone, Default, Debug)]
pub struct VoteTracker {
    // Validator indices are dense, so a vector indexed by them is smaller than a map.
    entries: Vector<VoteEntry>,
    // Validators whose entries changed since the last call to `VoteTracker::compute_deltas`.
    // May contain duplicates.
    changed: Vector<usize>,
}

impl VoteTracker {
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = VoteEntry>) -> Self {
        let entries = entries.into_iter().collect::<Vector<_>>();

        let changed = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.current_root != entry.next_root
                    || entry.current_balance != entry.next_balance
            })
            .map(|(index, _)| index)
            .collect();

        Self { entries, changed }
    }

    pub fn entries(&self) -> impl Iterator<Item = &VoteEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    #[must_use]
    pub fn latest_message(&self, validator_index: ValidatorIndex) -> Option<(H256, Slot)> {
        let entry = self.entries.get(usize::try_from(validator_index).ok()?)?;
        entry.next_root.map(|root| (root, entry.next_slot))
    }

    /// Records `vote` if it is newer than the latest vote of the same validator.
    ///
    /// Returns `false` if the vote was stale. Votes from the same slot do not replace each other.
    pub fn process_vote(&mut self, vote: Vote) -> Result<bool> {
        let Vote {
            validator_index,
            target_root,
            slot,
            effective_balance,
        } = vote;

        let index = usize::try_from(validator_index)
            .map_err(|_| Error::ValidatorIndexOutOfBounds { validator_index })?;

        let length = index
            .checked_add(1)
            .ok_or(Error::ValidatorIndexOutOfBounds { validator_index })?;

        if self.entries.len() < length {
            let missing = length - self.entries.len();
            self.entries
                .extend(core::iter::repeat(VoteEntry::default()).take(missing));
        }

        let entry = self
            .entries
            .get_mut(index)
            .ok_or(Error::ValidatorIndexOutOfBounds { validator_index })?;

        if entry.next_root.is_some() && slot <= entry.next_slot {
            return Ok(false);
        }

        entry.next_root = Some(target_root);
        entry.next_balance = effective_balance;
        entry.next_slot = slot;

        self.changed.push_back(index);

        Ok(true)
    }

    /// Moves the weight of every changed vote from its old target to its new one.
    ///
    /// Targets missing from `proto_array` are skipped. A missing old target has been pruned along
    /// with the weight it carried.
    pub fn compute_deltas(
        &mut self,
        proto_array: &ProtoArray,
    ) -> Result<Vec<(NodeIndex, WeightDelta)>> {
        // `hash_hasher::HashedMap` is safe to use because block roots are already hashed.
        let mut deltas = HashedMap::<H256, WeightDelta>::default();

        for index in core::mem::take(&mut self.changed) {
            let Some(entry) = self.entries.get_mut(index) else {
                continue;
            };

            if entry.current_root == entry.next_root && entry.current_balance == entry.next_balance
            {
                continue;
            }

            if let Some(root) = entry.current_root {
                if proto_array.contains_block(root) {
                    deltas
                        .entry(root)
                        .or_default()
                        .sub_assign(WeightDelta::from(entry.current_balance));
                }
            }

            if let Some(root) = entry.next_root {
                if proto_array.contains_block(root) {
                    deltas
                        .entry(root)
                        .or_default()
                        .add_assign(WeightDelta::from(entry.next_balance));
                }
            }

            entry.current_root = entry.next_root;
            entry.current_balance = entry.next_balance;
        }

        deltas
            .into_iter()
            .filter(|(_, delta)| *delta != 0)
            .map(|(root, delta)| {
                let index = proto_array
                    .index_of(root)
                    .ok_or(Error::UnknownBlock { root })?;

                Ok((index, delta))
            })
            .collect()
    }
}
