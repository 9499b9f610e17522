/// Revision tree for a single document.
///
/// The tree is an arena of `RevNode` records keyed by the sequence at which
/// each revision was stored. Parent links are revision IDs resolved through
/// an index, never live references, so dropping arena entries (pruning,
/// purging) never leaves dangling pointers: a parent that is gone simply
/// ends the ancestry walk.
///
/// A tree may have several roots: generation-1 revisions, plus the oldest
/// surviving ancestor of every branch after pruning.
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};
use crate::rev_id::RevId;

/// One revision's metadata inside the arena. Bodies live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNode {
    pub rev_id: RevId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RevId>,
    pub sequence: u64,
    #[serde(default)]
    pub deleted: bool,
    /// No body is stored: a phantom ancestor, or compacted.
    #[serde(default)]
    pub missing: bool,
}

/// Total order used to choose the winning leaf: highest generation, then the
/// byte-wise greater suffix, then non-deleted over deleted. `Less` means
/// `a` wins.
pub fn winner_order(a: &RevNode, b: &RevNode) -> Ordering {
    b.rev_id
        .cmp(&a.rev_id)
        .then_with(|| a.deleted.cmp(&b.deleted))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<RevNode>", into = "Vec<RevNode>")]
pub struct RevTree {
    nodes: BTreeMap<u64, RevNode>,
    index: HashMap<RevId, u64>,
}

impl From<Vec<RevNode>> for RevTree {
    fn from(list: Vec<RevNode>) -> Self {
        let mut tree = RevTree::new();
        for node in list {
            tree.index.insert(node.rev_id.clone(), node.sequence);
            tree.nodes.insert(node.sequence, node);
        }
        tree
    }
}

impl From<RevTree> for Vec<RevNode> {
    fn from(tree: RevTree) -> Self {
        tree.nodes.into_values().collect()
    }
}

impl RevTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, rev_id: &RevId) -> bool {
        self.index.contains_key(rev_id)
    }

    pub fn get(&self, rev_id: &RevId) -> Option<&RevNode> {
        self.index.get(rev_id).and_then(|seq| self.nodes.get(seq))
    }

    pub fn by_sequence(&self, sequence: u64) -> Option<&RevNode> {
        self.nodes.get(&sequence)
    }

    /// All nodes in sequence order.
    pub fn nodes(&self) -> impl Iterator<Item = &RevNode> {
        self.nodes.values()
    }

    /// Add a node. Fails if the revision is already present or the sequence
    /// slot is taken.
    pub fn insert(&mut self, node: RevNode) -> Result<()> {
        if self.index.contains_key(&node.rev_id) {
            return Err(TrellisError::Corrupt(format!(
                "revision {} already in tree",
                node.rev_id
            )));
        }
        if self.nodes.contains_key(&node.sequence) {
            return Err(TrellisError::Corrupt(format!(
                "sequence {} already used in tree",
                node.sequence
            )));
        }
        self.index.insert(node.rev_id.clone(), node.sequence);
        self.nodes.insert(node.sequence, node);
        Ok(())
    }

    /// Remove a node, returning it. Children keep their parent link and
    /// simply become roots.
    pub fn remove(&mut self, rev_id: &RevId) -> Option<RevNode> {
        let seq = self.index.remove(rev_id)?;
        self.nodes.remove(&seq)
    }

    /// Move a node to a new sequence slot, optionally changing its flags.
    pub fn restamp(&mut self, rev_id: &RevId, sequence: u64, deleted: bool, missing: bool) {
        if let Some(mut node) = self.remove(rev_id) {
            node.sequence = sequence;
            node.deleted = deleted;
            node.missing = missing;
            self.index.insert(node.rev_id.clone(), sequence);
            self.nodes.insert(sequence, node);
        }
    }

    pub fn set_missing(&mut self, rev_id: &RevId) {
        if let Some(seq) = self.index.get(rev_id)
            && let Some(node) = self.nodes.get_mut(seq)
        {
            node.missing = true;
        }
    }

    pub fn parent_of(&self, rev_id: &RevId) -> Option<&RevNode> {
        self.get(rev_id)
            .and_then(|n| n.parent.as_ref())
            .and_then(|p| self.get(p))
    }

    fn parent_set(&self) -> HashSet<&RevId> {
        self.nodes
            .values()
            .filter_map(|n| n.parent.as_ref())
            .collect()
    }

    pub fn has_children(&self, rev_id: &RevId) -> bool {
        self.nodes
            .values()
            .any(|n| n.parent.as_ref() == Some(rev_id))
    }

    pub fn is_leaf(&self, rev_id: &RevId) -> bool {
        self.contains(rev_id) && !self.has_children(rev_id)
    }

    /// All leaves, best candidate first.
    pub fn leaves(&self) -> Vec<&RevNode> {
        let parents = self.parent_set();
        let mut leaves: Vec<&RevNode> = self
            .nodes
            .values()
            .filter(|n| !parents.contains(&n.rev_id))
            .collect();
        leaves.sort_by(|a, b| winner_order(a, b));
        leaves
    }

    /// Non-deleted leaves, best candidate first.
    pub fn live_leaves(&self) -> Vec<&RevNode> {
        self.leaves().into_iter().filter(|n| !n.deleted).collect()
    }

    /// The deterministically chosen current revision.
    pub fn winner(&self) -> Option<&RevNode> {
        self.leaves().into_iter().next()
    }

    /// More than one live leaf.
    pub fn in_conflict(&self) -> bool {
        self.live_leaves().len() > 1
    }

    /// The revision followed by its ancestors, newest first, ending where a
    /// parent is not in the tree.
    pub fn ancestry(&self, rev_id: &RevId) -> Vec<&RevNode> {
        let mut chain = Vec::new();
        let mut cursor = self.get(rev_id);
        while let Some(node) = cursor {
            chain.push(node);
            cursor = node.parent.as_ref().and_then(|p| self.get(p));
        }
        chain
    }

    /// Walk from `rev_id` toward the root and return the first ID that is in
    /// `candidates`. The revision itself counts.
    pub fn find_common_ancestor(&self, rev_id: &RevId, candidates: &HashSet<RevId>) -> Option<RevId> {
        self.ancestry(rev_id)
            .into_iter()
            .find(|n| candidates.contains(&n.rev_id))
            .map(|n| n.rev_id.clone())
    }

    /// Add the revisions of `history` (newest first) that are not yet in the
    /// tree. `history[0]` gets the given flags and a body; ancestors that
    /// have to be created become phantoms.
    ///
    /// Returns the IDs of newly created nodes, oldest first. A phantom
    /// `history[0]` that is already present is filled in place and reported
    /// as well.
    pub fn graft(
        &mut self,
        history: &[RevId],
        deleted: bool,
        mut next_sequence: impl FnMut() -> u64,
    ) -> Result<Vec<RevId>> {
        validate_history(history)?;
        let mut added = Vec::new();
        // Find the newest entry already in the tree.
        let present = history.iter().position(|r| self.contains(r));
        let create_upto = present.unwrap_or(history.len());

        for i in (0..create_upto).rev() {
            let rev_id = history[i].clone();
            let parent = history.get(i + 1).cloned();
            let is_leaf = i == 0;
            self.insert(RevNode {
                rev_id: rev_id.clone(),
                parent,
                sequence: next_sequence(),
                deleted: is_leaf && deleted,
                missing: !is_leaf,
            })?;
            added.push(rev_id);
        }

        if present == Some(0)
            && let Some(node) = self.get(&history[0])
            && node.missing
        {
            let rev_id = history[0].clone();
            self.restamp(&rev_id, next_sequence(), deleted, false);
            added.push(rev_id);
        }
        Ok(added)
    }

    /// Drop every node further than `max_depth` from all leaves.
    pub fn prune(&mut self, max_depth: usize) -> Vec<RevNode> {
        if max_depth == 0 {
            return Vec::new();
        }
        let mut keep: HashSet<RevId> = HashSet::new();
        for leaf in self.leaves() {
            for node in self.ancestry(&leaf.rev_id).into_iter().take(max_depth) {
                keep.insert(node.rev_id.clone());
            }
        }
        let doomed: Vec<RevId> = self
            .nodes
            .values()
            .filter(|n| !keep.contains(&n.rev_id))
            .map(|n| n.rev_id.clone())
            .collect();
        doomed.iter().filter_map(|r| self.remove(r)).collect()
    }

    /// Remove the given revisions together with their ancestors, except
    /// ancestors still needed by a leaf that was not named. Returns the
    /// removed nodes.
    pub fn purge(&mut self, revs: &HashSet<RevId>) -> Vec<RevNode> {
        let mut keep: HashSet<RevId> = HashSet::new();
        for leaf in self.leaves() {
            if revs.contains(&leaf.rev_id) {
                continue;
            }
            for node in self.ancestry(&leaf.rev_id) {
                keep.insert(node.rev_id.clone());
            }
        }
        let mut doomed: HashSet<RevId> = HashSet::new();
        for rev_id in revs {
            for node in self.ancestry(rev_id) {
                if keep.contains(&node.rev_id) {
                    break;
                }
                doomed.insert(node.rev_id.clone());
            }
        }
        doomed.iter().filter_map(|r| self.remove(r)).collect()
    }
}

/// A history list must be newest first with strictly consecutive
/// generations.
pub fn validate_history(history: &[RevId]) -> Result<()> {
    if history.is_empty() {
        return Err(TrellisError::BadRequest("empty revision history".into()));
    }
    for pair in history.windows(2) {
        if pair[1].generation.checked_add(1) != Some(pair[0].generation) {
            return Err(TrellisError::BadRequest(format!(
                "revision history is not consecutive at {} -> {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}
