use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use trellis_core::error::{Result, TrellisError};
use trellis_core::kv::{KeyRange, Table, decode_seq_key, seq_key};
use trellis_core::rev_id::RevId;
use trellis_core::rev_tree::RevTree;
use trellis_core::revision::Revision;

use crate::store::decode;
use crate::transaction::{SeqRecord, Transaction};

/// Rows read from the change log per backend scan.
const SCAN_CHUNK: usize = 256;

/// A named change filter: `true` keeps the revision. Must be pure, since
/// it may run again when a page is re-read.
pub type Filter = Arc<dyn Fn(&Revision, &Map<String, Value>) -> bool + Send + Sync>;

/// Published once per inserted revision, after the commit.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseChange {
    /// The inserted revision, without its body.
    pub revision: Revision,
    pub winning_rev_id: RevId,
    pub winner_changed: bool,
    pub in_conflict: bool,
    pub conflict_changed: bool,
    /// Where the revision came from, e.g. a replication's remote.
    pub source: Option<String>,
}

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionChange {
    pub revision: Revision,
    pub winning_rev_id: RevId,
    pub in_conflict: bool,
    /// Set only for changes delivered from live notifications.
    pub source: Option<String>,
}

impl From<DatabaseChange> for RevisionChange {
    fn from(change: DatabaseChange) -> Self {
        RevisionChange {
            revision: change.revision,
            winning_rev_id: change.winning_rev_id,
            in_conflict: change.in_conflict,
            source: change.source,
        }
    }
}

/// A filter by name plus the parameters it is called with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSpec {
    pub name: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    pub limit: Option<usize>,
    pub include_docs: bool,
    /// Every leaf, not only the winner.
    pub all_leaves: bool,
    pub doc_ids: Option<HashSet<String>>,
    pub filter: Option<FilterSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangesPage {
    pub changes: Vec<RevisionChange>,
    /// Pass back as `since` to continue after this page.
    pub last_sequence: u64,
}

fn run_filter(name: &str, filter: &Filter, rev: &Revision, params: &Map<String, Value>) -> bool {
    match catch_unwind(AssertUnwindSafe(|| filter(rev, params))) {
        Ok(keep) => keep,
        Err(_) => {
            warn!(filter = name, doc = %rev.doc_id, "filter panicked");
            false
        }
    }
}

impl Transaction<'_> {
    /// Changes with sequence greater than `since`, oldest first. Only
    /// revisions that are still leaves show up, each at its own sequence.
    pub fn changes_since(&self, since: u64, options: &ChangesOptions) -> Result<ChangesPage> {
        let filter = match &options.filter {
            Some(spec) => Some((
                spec,
                self.registry
                    .filters
                    .get(&spec.name)
                    .cloned()
                    .ok_or_else(|| TrellisError::NotFound(format!("filter {}", spec.name)))?,
            )),
            None => None,
        };
        let want_body = options.include_docs || filter.is_some();
        let mut trees: HashMap<String, Option<RevTree>> = HashMap::new();
        let mut page = ChangesPage {
            changes: Vec::new(),
            last_sequence: since,
        };

        let mut cursor = since.saturating_add(1);
        loop {
            let rows = self.scan(Table::BySeq, &KeyRange::from(seq_key(cursor)), Some(SCAN_CHUNK))?;
            let exhausted = rows.len() < SCAN_CHUNK;
            for (key, bytes) in rows {
                let seq = decode_seq_key(&key)
                    .ok_or_else(|| TrellisError::Corrupt("bad change log key".into()))?;
                cursor = seq + 1;
                page.last_sequence = seq;
                let record: SeqRecord = decode(&bytes)?;

                if let Some(ids) = &options.doc_ids
                    && !ids.contains(&record.doc_id)
                {
                    continue;
                }
                if !trees.contains_key(&record.doc_id) {
                    let tree = self.load_tree(&record.doc_id)?;
                    trees.insert(record.doc_id.clone(), tree);
                }
                let Some(Some(tree)) = trees.get(&record.doc_id) else {
                    continue;
                };
                let Some(node) = tree.by_sequence(seq) else {
                    continue;
                };
                if node.rev_id != record.rev_id || node.missing || !tree.is_leaf(&node.rev_id) {
                    continue;
                }
                let Some(winner) = tree.winner() else {
                    continue;
                };
                if !options.all_leaves && winner.rev_id != node.rev_id {
                    continue;
                }

                let mut revision = self.revision_from_node(&record.doc_id, node, want_body)?;
                if let Some((spec, f)) = &filter
                    && !run_filter(&spec.name, f, &revision, &spec.params)
                {
                    continue;
                }
                if !options.include_docs {
                    revision.body = None;
                }
                page.changes.push(RevisionChange {
                    revision,
                    winning_rev_id: winner.rev_id.clone(),
                    in_conflict: tree.in_conflict(),
                    source: None,
                });
                if options.limit.is_some_and(|n| page.changes.len() >= n) {
                    return Ok(page);
                }
            }
            if exhausted {
                break;
            }
        }
        page.last_sequence = page.last_sequence.max(self.last_sequence());
        Ok(page)
    }
}
