//! Read paths and maintenance on the per-document revision trees.

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use tracing::debug;

use trellis_core::document::{RevisionsDict, RevsDiffResponse, RevsDiffResult};
use trellis_core::error::{Result, TrellisError};
use trellis_core::kv::{KeyRange, Table, body_key, seq_key};
use trellis_core::rev_id::RevId;
use trellis_core::rev_tree::{RevNode, RevTree, winner_order};
use trellis_core::revision::{Body, Revision, RevisionList};

use crate::transaction::Transaction;

/// How many possible ancestors a revs-diff answer carries per document.
const MAX_POSSIBLE_ANCESTORS: usize = 10;

/// What `purge` removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeTarget {
    /// The whole document, without leaving a tombstone.
    All,
    /// These revisions and every ancestor no other leaf needs.
    Revs(HashSet<RevId>),
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| TrellisError::Corrupt(e.to_string()))
}

fn not_found(doc_id: &str) -> TrellisError {
    TrellisError::NotFound(doc_id.to_string())
}

impl Transaction<'_> {
    // -----------------------------------------------------------------------
    // Raw tree and body access
    // -----------------------------------------------------------------------

    pub(crate) fn load_tree(&self, doc_id: &str) -> Result<Option<RevTree>> {
        match self.read(Table::Docs, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist a tree. An empty tree removes the document.
    pub(crate) fn save_tree(&mut self, doc_id: &str, tree: &RevTree) -> Result<()> {
        if tree.is_empty() {
            self.delete(Table::Docs, doc_id.as_bytes().to_vec());
        } else {
            self.write(
                Table::Docs,
                doc_id.as_bytes().to_vec(),
                serde_json::to_vec(tree)?,
            );
        }
        Ok(())
    }

    pub(crate) fn load_body(&self, doc_id: &str, sequence: u64) -> Result<Option<Body>> {
        match self.read(Table::Bodies, &body_key(doc_id, sequence))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn store_body(&mut self, doc_id: &str, sequence: u64, body: &Body) -> Result<()> {
        self.write(
            Table::Bodies,
            body_key(doc_id, sequence),
            serde_json::to_vec(body)?,
        );
        Ok(())
    }

    /// Delete the body and change-log entry of nodes removed from a tree.
    pub(crate) fn forget_nodes(&mut self, doc_id: &str, nodes: &[RevNode]) {
        for node in nodes {
            self.delete(Table::Bodies, body_key(doc_id, node.sequence));
            self.delete(Table::BySeq, seq_key(node.sequence));
        }
    }

    pub(crate) fn revision_from_node(
        &self,
        doc_id: &str,
        node: &RevNode,
        include_body: bool,
    ) -> Result<Revision> {
        let mut rev = Revision {
            sequence: node.sequence,
            missing: node.missing,
            ..Revision::new(doc_id, node.rev_id.clone(), node.deleted)
        };
        if include_body && !node.missing {
            rev.body = self.load_body(doc_id, node.sequence)?;
        }
        Ok(rev)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// A revision, or the winner when `rev_id` is `None`. Asking for the
    /// body of a revision that has none is `NotFound`.
    pub fn get(&self, doc_id: &str, rev_id: Option<&RevId>, include_body: bool) -> Result<Revision> {
        let tree = self.load_tree(doc_id)?.ok_or_else(|| not_found(doc_id))?;
        let node = match rev_id {
            Some(rev_id) => tree.get(rev_id),
            None => tree.winner(),
        }
        .ok_or_else(|| not_found(doc_id))?;
        if include_body && node.missing {
            return Err(TrellisError::NotFound(format!("{doc_id} {}", node.rev_id)));
        }
        let rev = self.revision_from_node(doc_id, node, include_body)?;
        if include_body && rev.body.is_none() {
            return Err(TrellisError::NotFound(format!("{doc_id} {}", node.rev_id)));
        }
        Ok(rev)
    }

    /// Leaves in winner order. With `only_current`, just the winner, or
    /// every live leaf while the document is in conflict.
    pub fn get_all_leaves(&self, doc_id: &str, only_current: bool) -> Result<RevisionList> {
        let Some(tree) = self.load_tree(doc_id)? else {
            return Ok(RevisionList::default());
        };
        let nodes: Vec<&RevNode> = if !only_current {
            tree.leaves()
        } else if tree.in_conflict() {
            tree.live_leaves()
        } else {
            tree.winner().into_iter().collect()
        };
        let revs = nodes
            .into_iter()
            .map(|n| self.revision_from_node(doc_id, n, true))
            .collect::<Result<Vec<_>>>()?;
        Ok(RevisionList::new(revs))
    }

    /// The revision and its ancestors, newest first, without bodies. Stops
    /// after the first revision that is in `stop_at`.
    pub fn get_history(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        stop_at: &HashSet<RevId>,
    ) -> Result<Vec<Revision>> {
        let tree = self.load_tree(doc_id)?.ok_or_else(|| not_found(doc_id))?;
        if !tree.contains(rev_id) {
            return Err(TrellisError::NotFound(format!("{doc_id} {rev_id}")));
        }
        let mut out = Vec::new();
        for node in tree.ancestry(rev_id) {
            out.push(self.revision_from_node(doc_id, node, false)?);
            if stop_at.contains(&node.rev_id) {
                break;
            }
        }
        Ok(out)
    }

    pub fn get_revision_history_dict(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        stop_at: &HashSet<RevId>,
    ) -> Result<RevisionsDict> {
        let history: Vec<RevId> = self
            .get_history(doc_id, rev_id, stop_at)?
            .into_iter()
            .map(|r| r.rev_id)
            .collect();
        RevisionsDict::from_history(&history)
            .ok_or_else(|| TrellisError::NotFound(format!("{doc_id} {rev_id}")))
    }

    pub fn find_common_ancestor(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        candidates: &HashSet<RevId>,
    ) -> Result<Option<RevId>> {
        Ok(self
            .load_tree(doc_id)?
            .and_then(|tree| tree.find_common_ancestor(rev_id, candidates)))
    }

    /// Stored revisions older than `rev_id` that a sender could use to cut
    /// history short. Best candidates first.
    pub fn get_possible_ancestor_rev_ids(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        limit: usize,
    ) -> Result<Vec<RevId>> {
        let Some(tree) = self.load_tree(doc_id)? else {
            return Ok(Vec::new());
        };
        Ok(possible_ancestors(&tree, rev_id.generation, limit))
    }

    /// For each document, which of the given revisions are not stored here.
    /// Phantoms count as missing.
    pub fn find_missing_revisions(
        &self,
        revs: &HashMap<String, Vec<RevId>>,
    ) -> Result<RevsDiffResponse> {
        let mut response = RevsDiffResponse::default();
        for (doc_id, rev_ids) in revs {
            let tree = self.load_tree(doc_id)?;
            let missing: Vec<&RevId> = rev_ids
                .iter()
                .filter(|r| {
                    !tree
                        .as_ref()
                        .and_then(|t| t.get(r))
                        .is_some_and(|n| !n.missing)
                })
                .collect();
            if missing.is_empty() {
                continue;
            }
            let possible = match (&tree, missing.iter().map(|r| r.generation).max()) {
                (Some(tree), Some(max_gen)) => {
                    possible_ancestors(tree, max_gen, MAX_POSSIBLE_ANCESTORS)
                }
                _ => Vec::new(),
            };
            response.results.insert(
                doc_id.clone(),
                RevsDiffResult {
                    missing: missing.iter().map(|r| r.to_string()).collect(),
                    possible_ancestors: possible.iter().map(|r| r.to_string()).collect(),
                },
            );
        }
        Ok(response)
    }

    /// Documents whose winner is not a tombstone.
    pub fn document_count(&self) -> Result<u64> {
        let mut count = 0;
        for (_, bytes) in self.scan(Table::Docs, &KeyRange::all(), None)? {
            let tree: RevTree = decode(&bytes)?;
            if tree.winner().is_some_and(|w| !w.deleted) {
                count += 1;
            }
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Remove revisions outright. Never allocates sequences and never
    /// notifies. Returns the removed revision IDs keyed by document.
    pub fn purge(
        &mut self,
        doc_id: &str,
        target: &PurgeTarget,
    ) -> Result<HashMap<String, Vec<RevId>>> {
        let mut result = HashMap::new();
        let Some(mut tree) = self.load_tree(doc_id)? else {
            return Ok(result);
        };
        let removed: Vec<RevNode> = match target {
            PurgeTarget::All => {
                let all: Vec<RevNode> = tree.nodes().cloned().collect();
                tree = RevTree::new();
                all
            }
            PurgeTarget::Revs(revs) => tree.purge(revs),
        };
        if removed.is_empty() {
            return Ok(result);
        }
        self.forget_nodes(doc_id, &removed);
        self.save_tree(doc_id, &tree)?;
        debug!(doc = doc_id, removed = removed.len(), "purged revisions");
        result.insert(
            doc_id.to_string(),
            removed.into_iter().map(|n| n.rev_id).collect(),
        );
        Ok(result)
    }

    /// Drop revisions further than `max_depth` from every leaf.
    pub fn prune(&mut self, doc_id: &str, max_depth: usize) -> Result<Vec<RevId>> {
        let Some(mut tree) = self.load_tree(doc_id)? else {
            return Ok(Vec::new());
        };
        let removed = tree.prune(max_depth);
        if !removed.is_empty() {
            self.forget_nodes(doc_id, &removed);
            self.save_tree(doc_id, &tree)?;
        }
        Ok(removed.into_iter().map(|n| n.rev_id).collect())
    }

    /// Delete the body of every non-leaf revision. Returns how many bodies
    /// were dropped.
    pub fn compact(&mut self) -> Result<usize> {
        let mut dropped = 0;
        for (key, bytes) in self.scan(Table::Docs, &KeyRange::all(), None)? {
            let doc_id = String::from_utf8(key).map_err(|e| TrellisError::Corrupt(e.to_string()))?;
            let mut tree: RevTree = decode(&bytes)?;
            let stale: Vec<RevNode> = tree
                .nodes()
                .filter(|n| !n.missing && !tree.is_leaf(&n.rev_id))
                .cloned()
                .collect();
            if stale.is_empty() {
                continue;
            }
            for node in &stale {
                self.delete(Table::Bodies, body_key(&doc_id, node.sequence));
                tree.set_missing(&node.rev_id);
            }
            dropped += stale.len();
            self.save_tree(&doc_id, &tree)?;
        }
        Ok(dropped)
    }
}

fn possible_ancestors(tree: &RevTree, below_generation: u64, limit: usize) -> Vec<RevId> {
    let mut nodes: Vec<&RevNode> = tree
        .nodes()
        .filter(|n| !n.missing && n.rev_id.generation < below_generation)
        .collect();
    nodes.sort_by(|a, b| winner_order(a, b));
    nodes
        .into_iter()
        .take(limit)
        .map(|n| n.rev_id.clone())
        .collect()
}
