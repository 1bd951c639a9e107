//! Weighted block tree stored as a flat arena.
//!
//! Nodes refer to each other by index. Parents always have lower indices than their children
//! because a block can only be inserted after its parent. Pruning preserves relative order, so
//! iterating over indices in descending order visits every child before its parent. Both weight
//! propagation and best descendant maintenance rely on this.
//!
//! The arena and the lookup table are persistent data structures. Cloning a [`ProtoArray`] is
//! cheap, which lets the controller publish a snapshot after every mutation.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{ensure, Result};
use im::{HashMap, Vector};
use itertools::Itertools as _;
use types::{
    consts::GENESIS_EPOCH,
    containers::BlockSummary,
    primitives::{Epoch, Slot, Weight, WeightDelta, H256},
};

use crate::error::Error;

pub type NodeIndex = usize;

/// A single block's fork choice record.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct WeightedNode {
    pub slot: Slot,
    pub root: H256,
    pub parent_root: H256,
    pub state_root: H256,
    pub justified_epoch: Epoch,
    pub finalized_epoch: Epoch,
    /// Sum of effective balances of validators whose latest vote targets this node or one of its
    /// descendants.
    pub weight: Weight,
    /// [`None`] for the anchor.
    pub parent: Option<NodeIndex>,
    pub best_child: Option<NodeIndex>,
    /// Equal to the index of the node itself if it has no best child.
    pub best_descendant: NodeIndex,
    pub children: Vec<NodeIndex>,
}

impl WeightedNode {
    fn new(block: &BlockSummary, index: NodeIndex, parent: Option<NodeIndex>) -> Self {
        let BlockSummary {
            slot,
            root,
            parent_root,
            state_root,
            justified_epoch,
            finalized_epoch,
        } = *block;

        Self {
            slot,
            root,
            parent_root,
            state_root,
            justified_epoch,
            finalized_epoch,
            weight: 0,
            parent,
            best_child: None,
            best_descendant: index,
            children: vec![],
        }
    }

    #[must_use]
    pub const fn summary(&self) -> BlockSummary {
        BlockSummary {
            slot: self.slot,
            root: self.root,
            parent_root: self.parent_root,
            state_root: self.state_root,
            justified_epoch: self.justified_epoch,
            finalized_epoch: self.finalized_epoch,
        }
    }

    // The order used to pick the heaviest child. Roots are unique, so no two nodes compare equal.
    const fn head_key(&self) -> (Weight, H256) {
        (self.weight, self.root)
    }
}

#[derive(Clone, Debug)]
pub struct ProtoArray {
    prune_threshold: usize,
    justified_epoch: Epoch,
    finalized_epoch: Epoch,
    anchor_epoch: Epoch,
    nodes: Vector<WeightedNode>,
    indices: HashMap<H256, NodeIndex>,
    // Nodes inserted since the last weight pass. Best links of their ancestors are stale.
    unlinked: Vec<NodeIndex>,
    // Set when checkpoint epochs change. Viability of every node may be different.
    full_pass_needed: bool,
}

impl ProtoArray {
    /// Creates a tree containing only `anchor`.
    ///
    /// The parent root of the anchor is recorded but never resolved.
    #[must_use]
    pub fn new(anchor: &BlockSummary, prune_threshold: usize) -> Self {
        let node = WeightedNode::new(anchor, 0, None);

        Self {
            prune_threshold,
            justified_epoch: anchor.justified_epoch,
            finalized_epoch: anchor.finalized_epoch,
            anchor_epoch: anchor.finalized_epoch,
            nodes: Vector::unit(node),
            indices: HashMap::unit(anchor.root, 0),
            unlinked: vec![],
            full_pass_needed: false,
        }
    }

    #[must_use]
    pub const fn prune_threshold(&self) -> usize {
        self.prune_threshold
    }

    #[must_use]
    pub const fn justified_epoch(&self) -> Epoch {
        self.justified_epoch
    }

    #[must_use]
    pub const fn finalized_epoch(&self) -> Epoch {
        self.finalized_epoch
    }

    #[must_use]
    pub const fn anchor_epoch(&self) -> Epoch {
        self.anchor_epoch
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn anchor(&self) -> &WeightedNode {
        self.nodes
            .front()
            .expect("ProtoArray always contains at least the anchor")
    }

    #[must_use]
    pub fn contains_block(&self, root: H256) -> bool {
        self.indices.contains_key(&root)
    }

    #[must_use]
    pub fn index_of(&self, root: H256) -> Option<NodeIndex> {
        self.indices.get(&root).copied()
    }

    #[must_use]
    pub fn node(&self, root: H256) -> Option<&WeightedNode> {
        self.index_of(root).and_then(|index| self.nodes.get(index))
    }

    #[must_use]
    pub fn block_slot(&self, root: H256) -> Option<Slot> {
        self.node(root).map(|node| node.slot)
    }

    #[must_use]
    pub fn weight(&self, root: H256) -> Option<Weight> {
        self.node(root).map(|node| node.weight)
    }

    /// Iterates over nodes in insertion order. Parents come before their children.
    pub fn nodes(&self) -> impl Iterator<Item = &WeightedNode> {
        self.nodes.iter()
    }

    /// Roots of nodes with no children.
    pub fn heads(&self) -> impl Iterator<Item = H256> + '_ {
        self.nodes
            .iter()
            .filter(|node| node.children.is_empty())
            .map(|node| node.root)
    }

    /// Returns `true` if [`ProtoArray::find_head`] could return an outdated result.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.unlinked.is_empty() || self.full_pass_needed
    }

    /// Inserts a block whose parent is already in the tree.
    ///
    /// Inserting a known block does nothing. Best links are not updated until the next call to
    /// [`ProtoArray::apply_weight_changes`].
    pub fn insert(&mut self, block: &BlockSummary) -> Result<NodeIndex> {
        if let Some(index) = self.index_of(block.root) {
            return Ok(index);
        }

        let parent_index = self
            .index_of(block.parent_root)
            .ok_or(Error::UnknownParent {
                root: block.root,
                parent_root: block.parent_root,
            })?;

        let parent_slot = self.node_at(parent_index)?.slot;

        ensure!(
            block.slot > parent_slot,
            Error::SlotNotAfterParent {
                root: block.root,
                slot: block.slot,
                parent_slot,
            },
        );

        let index = self.nodes.len();

        self.nodes
            .push_back(WeightedNode::new(block, index, Some(parent_index)));

        self.node_at_mut(parent_index)?.children.push(index);
        self.indices.insert(block.root, index);
        self.unlinked.push(index);

        Ok(index)
    }

    /// Sets the checkpoint epochs used to filter out nodes that are not viable for head.
    pub fn update_checkpoints(&mut self, justified_epoch: Epoch, finalized_epoch: Epoch) {
        if self.justified_epoch != justified_epoch || self.finalized_epoch != finalized_epoch {
            self.justified_epoch = justified_epoch;
            self.finalized_epoch = finalized_epoch;
            self.full_pass_needed = true;
        }
    }

    /// Adds `deltas` to the weights of the nodes they refer to and all of their ancestors,
    /// then brings best links up to date.
    ///
    /// Deltas for the same node are summed. The work done is proportional to the number of nodes
    /// whose weight changes, except after a checkpoint change, which requires a pass over the
    /// entire tree.
    pub fn apply_weight_changes(
        &mut self,
        deltas: impl IntoIterator<Item = (NodeIndex, WeightDelta)>,
    ) -> Result<()> {
        let mut pending = BTreeMap::<NodeIndex, WeightDelta>::new();

        for (index, delta) in deltas {
            self.accumulate(&mut pending, index, delta)?;
        }

        pending.retain(|_, delta| *delta != 0);

        let mut stale = self
            .unlinked
            .drain(..)
            .collect::<BTreeSet<_>>();

        // Children have higher indices than their parents, so by the time a node is popped every
        // delta from its subtree has been added to its entry.
        while let Some((index, delta)) = pending.pop_last() {
            let node = self.node_at_mut(index)?;
            node.weight = apply_delta(node.weight, delta, node.root)?;
            let parent = node.parent;

            if let Some(parent_index) = parent {
                self.accumulate(&mut pending, parent_index, delta)?;
            }

            stale.insert(index);
        }

        if core::mem::take(&mut self.full_pass_needed) {
            for index in (0..self.nodes.len()).rev() {
                self.update_best_links(index)?;
            }

            return Ok(());
        }

        // A node whose weight or best descendant changed may change the choice made by its
        // parent. Parents are re-evaluated after all of their children.
        let mut dirty = BTreeSet::new();

        for index in stale {
            if let Some(parent_index) = self.node_at(index)?.parent {
                dirty.insert(parent_index);
            }
        }

        while let Some(index) = dirty.pop_last() {
            if self.update_best_links(index)? {
                if let Some(parent_index) = self.node_at(index)?.parent {
                    dirty.insert(parent_index);
                }
            }
        }

        Ok(())
    }

    /// Returns the root of the best descendant of `justified_root`.
    ///
    /// If `justified_root` has no descendants that are viable for head, `justified_root` itself is
    /// returned. Pending changes must be applied beforehand for the result to be current.
    pub fn find_head(&self, justified_root: H256) -> Result<H256> {
        let justified_index = self
            .index_of(justified_root)
            .ok_or(Error::UnknownJustifiedRoot {
                root: justified_root,
            })?;

        let best_index = self.node_at(justified_index)?.best_descendant;

        if best_index == justified_index {
            return Ok(justified_root);
        }

        let best_node = self.node_at(best_index)?;

        ensure!(
            self.node_is_viable_for_head(best_node),
            Error::NonViableBestDescendant {
                justified_root,
                best_descendant: best_node.root,
            },
        );

        Ok(best_node.root)
    }

    /// Prunes only if enough nodes would be removed to make compaction worthwhile.
    ///
    /// Every node inserted before `finalized_root` is prunable, so its index is used as a cheap
    /// lower bound on the number of prunable nodes. Returns the number of nodes removed.
    pub fn maybe_prune(&mut self, finalized_root: H256) -> Result<usize> {
        let finalized_index = self
            .index_of(finalized_root)
            .ok_or(Error::UnknownFinalizedRoot {
                root: finalized_root,
            })?;

        if finalized_index <= self.prune_threshold {
            return Ok(0);
        }

        self.prune(finalized_root)
    }

    /// Removes every node that is neither `finalized_root` nor one of its descendants.
    ///
    /// `finalized_root` becomes the new anchor. Returns the number of nodes removed.
    pub fn prune(&mut self, finalized_root: H256) -> Result<usize> {
        let finalized_index = self
            .index_of(finalized_root)
            .ok_or(Error::UnknownFinalizedRoot {
                root: finalized_root,
            })?;

        let length = self.nodes.len();
        let mut remap = vec![None; length];
        let mut kept = Vector::new();

        // Descendants of the finalized node cannot have been inserted before it.
        for (index, node) in self.nodes.iter().enumerate().skip(finalized_index) {
            let keep = index == finalized_index
                || node
                    .parent
                    .and_then(|parent_index| remap.get(parent_index).copied().flatten())
                    .is_some();

            if keep {
                remap[index] = Some(kept.len());
                kept.push_back(node.clone());
            }
        }

        let lookup = |index: NodeIndex| {
            remap
                .get(index)
                .copied()
                .flatten()
                .ok_or(Error::IndexRemapFailed { index })
        };

        for (new_index, node) in kept.iter_mut().enumerate() {
            node.parent = match node.parent {
                Some(parent_index) if new_index > 0 => Some(lookup(parent_index)?),
                _ => None,
            };
            node.children = node
                .children
                .iter()
                .map(|child_index| lookup(*child_index))
                .try_collect()?;
            node.best_child = node.best_child.map(lookup).transpose()?;
            node.best_descendant = lookup(node.best_descendant)?;
        }

        self.indices = kept
            .iter()
            .enumerate()
            .map(|(index, node)| (node.root, index))
            .collect();

        self.unlinked = self
            .unlinked
            .iter()
            .filter_map(|index| remap.get(*index).copied().flatten())
            .collect();

        let removed = length - kept.len();

        self.nodes = kept;
        self.anchor_epoch = self.anchor_epoch.max(self.finalized_epoch);

        Ok(removed)
    }

    /// Iterates over `root` and its ancestors, ending with the anchor.
    pub fn iter_ancestors(&self, root: H256) -> AncestorIter<'_> {
        AncestorIter {
            proto_array: self,
            next: self.index_of(root),
        }
    }

    /// Returns `true` if `ancestor_root` is `root` or one of its ancestors.
    ///
    /// Unknown roots are not descendants of anything.
    #[must_use]
    pub fn is_descendant(&self, root: H256, ancestor_root: H256) -> bool {
        let Some(ancestor_slot) = self.block_slot(ancestor_root) else {
            return false;
        };

        self.iter_ancestors(root)
            .take_while(|node| node.slot >= ancestor_slot)
            .any(|node| node.root == ancestor_root)
    }

    #[must_use]
    pub fn common_ancestor(&self, root_1: H256, root_2: H256) -> Option<H256> {
        let ancestors = self
            .iter_ancestors(root_1)
            .map(|node| node.root)
            .collect::<HashSet<_>>();

        self.iter_ancestors(root_2)
            .map(|node| node.root)
            .find(|root| ancestors.contains(root))
    }

    pub(crate) fn restore_weight(&mut self, index: NodeIndex, weight: Weight) -> Result<()> {
        self.node_at_mut(index)?.weight = weight;
        Ok(())
    }

    pub(crate) fn restore_epochs(
        &mut self,
        justified_epoch: Epoch,
        finalized_epoch: Epoch,
        anchor_epoch: Epoch,
    ) {
        self.justified_epoch = justified_epoch;
        self.finalized_epoch = finalized_epoch;
        self.anchor_epoch = anchor_epoch;
        self.full_pass_needed = true;
    }

    fn node_at(&self, index: NodeIndex) -> Result<&WeightedNode> {
        let length = self.nodes.len();

        self.nodes
            .get(index)
            .ok_or_else(|| Error::InvalidNodeIndex { index, length }.into())
    }

    fn node_at_mut(&mut self, index: NodeIndex) -> Result<&mut WeightedNode> {
        let length = self.nodes.len();

        self.nodes
            .get_mut(index)
            .ok_or_else(|| Error::InvalidNodeIndex { index, length }.into())
    }

    fn accumulate(
        &self,
        pending: &mut BTreeMap<NodeIndex, WeightDelta>,
        index: NodeIndex,
        delta: WeightDelta,
    ) -> Result<()> {
        let node = self.node_at(index)?;
        let entry = pending.entry(index).or_default();

        *entry = entry.checked_add(delta).ok_or(Error::WeightOverflow {
            root: node.root,
            weight: node.weight,
            delta,
        })?;

        Ok(())
    }

    // Returns `true` if either of the links changed.
    fn update_best_links(&mut self, index: NodeIndex) -> Result<bool> {
        let mut best_child = None::<&WeightedNode>;
        let mut best_child_index = None;

        for child_index in self.node_at(index)?.children.iter().copied() {
            let child = self.node_at(child_index)?;

            if !self.node_leads_to_viable_head(child)? {
                continue;
            }

            let better = match best_child {
                Some(best) => child.head_key() > best.head_key(),
                None => true,
            };

            if better {
                best_child = Some(child);
                best_child_index = Some(child_index);
            }
        }

        let best_descendant = best_child.map_or(index, |child| child.best_descendant);
        let node = self.node_at_mut(index)?;
        let changed = node.best_child != best_child_index || node.best_descendant != best_descendant;

        node.best_child = best_child_index;
        node.best_descendant = best_descendant;

        Ok(changed)
    }

    fn node_leads_to_viable_head(&self, node: &WeightedNode) -> Result<bool> {
        let best_descendant = self.node_at(node.best_descendant)?;

        Ok(self.node_is_viable_for_head(best_descendant) || self.node_is_viable_for_head(node))
    }

    // Blocks that disagree with the current checkpoints are filtered out unless the checkpoints
    // are still at genesis.
    fn node_is_viable_for_head(&self, node: &WeightedNode) -> bool {
        (node.justified_epoch == self.justified_epoch || self.justified_epoch == GENESIS_EPOCH)
            && (node.finalized_epoch == self.finalized_epoch
                || self.finalized_epoch == GENESIS_EPOCH)
    }
}

pub struct AncestorIter<'array> {
    proto_array: &'array ProtoArray,
    next: Option<NodeIndex>,
}

impl<'array> Iterator for AncestorIter<'array> {
    type Item = &'array WeightedNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.proto_array.nodes.get(self.next?)?;
        self.next = node.parent;
        Some(node)
    }
}

fn apply_delta(weight: Weight, delta: WeightDelta, root: H256) -> Result<Weight> {
    let magnitude = delta.unsigned_abs();

    let new_weight = if delta.is_negative() {
        weight.checked_sub(magnitude).ok_or(Error::NegativeWeight {
            root,
            weight,
            delta,
        })?
    } else {
        weight.checked_add(magnitude).ok_or(Error::WeightOverflow {
            root,
            weight,
            delta,
        })?
    };

    Ok(new_weight)
}
