//! Writing revisions: local edits with an MVCC check, and forced inserts of
//! replicated revisions together with their history.

use tracing::{debug, trace};

use trellis_core::error::{Result, TrellisError};
use trellis_core::kv::{Table, seq_key};
use trellis_core::rev_id::RevId;
use trellis_core::rev_tree::{RevTree, validate_history};
use trellis_core::revision::{Body, Revision, generate_doc_id, strip_metadata, validate_doc_id};

use crate::changes::DatabaseChange;
use crate::transaction::{SeqRecord, Transaction};
use crate::validation::{ValidationContext, Validator, run_validator};

/// A local edit.
#[derive(Debug, Clone, Default)]
pub struct PutRevision {
    /// Generated when absent.
    pub doc_id: Option<String>,
    pub body: Body,
    /// The revision being replaced. `None` creates the document.
    pub prev_rev: Option<RevId>,
    pub deleted: bool,
    /// Allow `prev_rev` to be any stored revision, not just the winner.
    pub allow_conflict: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForceInsertOutcome {
    /// The revision was already stored with its body, or it lies deeper
    /// than the pruning depth and was dropped on arrival. No notification
    /// is sent.
    AlreadyPresent,
    Inserted(DatabaseChange),
}

/// How `resolve_conflict` settles a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep this leaf's body; every other live leaf is tombstoned.
    Keep(RevId),
    /// Replace all live leaves with one merged body.
    Merge(Body),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertPhase {
    Validating,
    Rejected,
    Proceed,
    Writing,
    Committed,
    RolledBack,
}

fn phase(doc_id: &str, rev_id: &RevId, phase: InsertPhase) {
    trace!(doc = doc_id, rev = %rev_id, phase = ?phase, "insert");
}

impl Transaction<'_> {
    fn validate(
        &self,
        revision: &Revision,
        previous: Option<&Revision>,
        validator: Option<&Validator>,
    ) -> Result<()> {
        phase(&revision.doc_id, &revision.rev_id, InsertPhase::Validating);
        let context = ValidationContext::new(previous, revision);
        let registry = self.registry.clone();
        let result = validator
            .map(|v| run_validator("call", v, revision, &context))
            .unwrap_or(Ok(()))
            .and_then(|()| {
                registry
                    .validators
                    .iter()
                    .try_for_each(|(name, v)| run_validator(name, v, revision, &context))
            });
        match &result {
            Ok(()) => phase(&revision.doc_id, &revision.rev_id, InsertPhase::Proceed),
            Err(e) => {
                phase(&revision.doc_id, &revision.rev_id, InsertPhase::Rejected);
                debug!(doc = %revision.doc_id, rev = %revision.rev_id, error = %e, "revision rejected");
            }
        }
        result
    }

    /// Graft `history` into `tree` with `revision` at its head, write the
    /// body and change-log entry, prune, and queue the notification.
    ///
    /// Returns `None` when pruning removed `revision` itself.
    fn commit_revision(
        &mut self,
        mut tree: RevTree,
        history: &[RevId],
        revision: &Revision,
        source: Option<&str>,
    ) -> Result<Option<DatabaseChange>> {
        let doc_id = revision.doc_id.as_str();
        phase(doc_id, &revision.rev_id, InsertPhase::Writing);
        let old_winner = tree.winner().map(|w| w.rev_id.clone());
        let old_conflict = tree.in_conflict();
        // A compacted or phantom node being filled moves to a new sequence.
        let old_sequence = tree.get(&revision.rev_id).map(|n| n.sequence);

        let added = tree.graft(history, revision.deleted, || self.next_sequence())?;
        if !added.contains(&revision.rev_id) {
            return Err(TrellisError::Corrupt(format!(
                "{doc_id} {} is already stored",
                revision.rev_id
            )));
        }
        let sequence = tree
            .get(&revision.rev_id)
            .map(|n| n.sequence)
            .ok_or_else(|| TrellisError::Corrupt(format!("{doc_id} lost {}", revision.rev_id)))?;
        if let Some(old) = old_sequence {
            self.delete(Table::BySeq, seq_key(old));
        }

        self.write(
            Table::BySeq,
            seq_key(sequence),
            serde_json::to_vec(&SeqRecord {
                doc_id: doc_id.to_string(),
                rev_id: revision.rev_id.clone(),
            })?,
        );
        let empty = Body::new();
        self.store_body(doc_id, sequence, revision.body.as_ref().unwrap_or(&empty))?;

        let pruned = tree.prune(self.options.max_rev_tree_depth);
        if !pruned.is_empty() {
            trace!(doc = doc_id, count = pruned.len(), "pruned revisions");
            self.forget_nodes(doc_id, &pruned);
        }
        self.save_tree(doc_id, &tree)?;
        if !tree.contains(&revision.rev_id) {
            trace!(doc = doc_id, rev = %revision.rev_id, "revision pruned on arrival");
            return Ok(None);
        }

        let winner = tree
            .winner()
            .map(|w| w.rev_id.clone())
            .ok_or_else(|| TrellisError::Corrupt(format!("{doc_id} has no leaves")))?;
        let in_conflict = tree.in_conflict();
        let change = DatabaseChange {
            revision: Revision {
                sequence,
                body: None,
                missing: false,
                ..revision.clone()
            },
            winner_changed: old_winner.as_ref() != Some(&winner),
            winning_rev_id: winner,
            in_conflict,
            conflict_changed: in_conflict != old_conflict,
            source: source.map(str::to_string),
        };
        self.pending_changes.push(change.clone());
        Ok(Some(change))
    }

    /// Write one nested step, logging how it ended.
    fn write_nested(
        &mut self,
        tree: RevTree,
        history: &[RevId],
        revision: &Revision,
        source: Option<&str>,
    ) -> Result<Option<DatabaseChange>> {
        let result = self.nested(|txn| txn.commit_revision(tree, history, revision, source));
        let end = if result.is_ok() {
            InsertPhase::Committed
        } else {
            InsertPhase::RolledBack
        };
        phase(&revision.doc_id, &revision.rev_id, end);
        result
    }

    // -----------------------------------------------------------------------
    // put_revision
    // -----------------------------------------------------------------------

    /// Create a new revision on top of `prev_rev`.
    pub fn put_revision(
        &mut self,
        request: PutRevision,
        validator: Option<&Validator>,
    ) -> Result<Revision> {
        let doc_id = request.doc_id.unwrap_or_else(generate_doc_id);
        validate_doc_id(&doc_id)?;
        let tree = self.load_tree(&doc_id)?.unwrap_or_default();

        let parent: Option<RevId> = match &request.prev_rev {
            Some(prev) => {
                if !tree.contains(prev) {
                    return Err(if request.allow_conflict {
                        TrellisError::NotFound(format!("{doc_id} {prev}"))
                    } else {
                        TrellisError::Conflict
                    });
                }
                if !request.allow_conflict && tree.winner().map(|w| &w.rev_id) != Some(prev) {
                    return Err(TrellisError::Conflict);
                }
                Some(prev.clone())
            }
            None => match tree.winner() {
                Some(w) if !w.deleted && !request.allow_conflict => {
                    return Err(TrellisError::Conflict);
                }
                // Recreating a deleted document continues its tombstone.
                Some(w) if w.deleted => Some(w.rev_id.clone()),
                _ => None,
            },
        };
        if request.deleted {
            let parent_live = parent
                .as_ref()
                .and_then(|p| tree.get(p))
                .is_some_and(|n| !n.deleted);
            if !parent_live {
                return Err(TrellisError::NotFound(doc_id));
            }
        }

        let body = strip_metadata(request.body);
        let rev_id = RevId::generate(parent.as_ref(), request.deleted, &body)?;
        if tree.contains(&rev_id) {
            return Err(TrellisError::Conflict);
        }
        let revision = Revision::new(doc_id, rev_id, request.deleted).with_body(body);

        let previous = self.parent_with_body(&tree, parent.as_ref(), &revision.doc_id)?;
        self.validate(&revision, previous.as_ref(), validator)?;

        let mut history = vec![revision.rev_id.clone()];
        if let Some(p) = &parent {
            history.extend(tree.ancestry(p).into_iter().map(|n| n.rev_id.clone()));
        }
        let change = self
            .write_nested(tree, &history, &revision, None)?
            .ok_or_else(|| {
                TrellisError::Corrupt(format!(
                    "{} {} pruned on insert",
                    revision.doc_id, revision.rev_id
                ))
            })?;
        Ok(Revision {
            sequence: change.revision.sequence,
            ..revision
        })
    }

    /// The stored parent with its body, for validators.
    fn parent_with_body(
        &self,
        tree: &RevTree,
        parent: Option<&RevId>,
        doc_id: &str,
    ) -> Result<Option<Revision>> {
        match parent.and_then(|p| tree.get(p)) {
            Some(node) if !node.missing => Ok(Some(self.revision_from_node(doc_id, node, true)?)),
            _ => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // force_insert
    // -----------------------------------------------------------------------

    /// Insert a revision that already has an ID, with its history newest
    /// first. Never fails on conflict: the revision becomes another leaf.
    pub fn force_insert(
        &mut self,
        revision: Revision,
        history: &[RevId],
        validator: Option<&Validator>,
        source: Option<&str>,
    ) -> Result<ForceInsertOutcome> {
        validate_doc_id(&revision.doc_id)?;
        validate_history(history)?;
        if history[0] != revision.rev_id {
            return Err(TrellisError::BadRequest(format!(
                "history of {} starts at {}, not {}",
                revision.doc_id, history[0], revision.rev_id
            )));
        }
        let tree = self.load_tree(&revision.doc_id)?.unwrap_or_default();
        if tree.get(&revision.rev_id).is_some_and(|n| !n.missing) {
            trace!(doc = %revision.doc_id, rev = %revision.rev_id, "already present");
            return Ok(ForceInsertOutcome::AlreadyPresent);
        }

        let revision = Revision {
            body: Some(strip_metadata(revision.body.unwrap_or_default())),
            sequence: 0,
            missing: false,
            ..revision
        };
        let previous = self.parent_with_body(&tree, history.get(1), &revision.doc_id)?;
        self.validate(&revision, previous.as_ref(), validator)?;

        Ok(match self.write_nested(tree, history, &revision, source)? {
            Some(change) => ForceInsertOutcome::Inserted(change),
            None => ForceInsertOutcome::AlreadyPresent,
        })
    }

    // -----------------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------------

    /// Collapse a document's live leaves into one winning revision.
    ///
    /// Every live leaf except the highest-ranked one is tombstoned, and the
    /// chosen body is written as a child of that highest-ranked leaf. While
    /// a tombstone still outranks the result, the body is written once more
    /// on top, so the resolution always ends up as the winner.
    pub fn resolve_conflict(&mut self, doc_id: &str, resolution: Resolution) -> Result<Revision> {
        let tree = self
            .load_tree(doc_id)?
            .ok_or_else(|| TrellisError::NotFound(doc_id.to_string()))?;
        let live: Vec<RevId> = tree.live_leaves().iter().map(|n| n.rev_id.clone()).collect();
        let Some(head) = live.first().cloned() else {
            return Err(TrellisError::NotFound(doc_id.to_string()));
        };

        let (body, keep_head) = match resolution {
            Resolution::Keep(rev_id) => {
                if !live.contains(&rev_id) {
                    return Err(TrellisError::BadRequest(format!(
                        "{rev_id} is not a live leaf of {doc_id}"
                    )));
                }
                let kept = self.get(doc_id, Some(&rev_id), true)?;
                (kept.body.unwrap_or_default(), rev_id == head)
            }
            Resolution::Merge(body) => (strip_metadata(body), false),
        };
        debug!(doc = doc_id, leaves = live.len(), "resolving conflict");

        for leaf in live.iter().filter(|r| **r != head) {
            self.put_revision(
                PutRevision {
                    doc_id: Some(doc_id.to_string()),
                    prev_rev: Some(leaf.clone()),
                    deleted: true,
                    allow_conflict: true,
                    ..Default::default()
                },
                None,
            )?;
        }

        let mut current = head;
        if !keep_head {
            current = self.put_child(doc_id, &current, &body)?;
        }
        loop {
            let tree = self
                .load_tree(doc_id)?
                .ok_or_else(|| TrellisError::NotFound(doc_id.to_string()))?;
            let winner = tree
                .winner()
                .map(|w| w.rev_id.clone())
                .ok_or_else(|| TrellisError::Corrupt(format!("{doc_id} has no leaves")))?;
            if winner == current {
                break;
            }
            // Only a higher tombstone can outrank the resolution here, and
            // each round adds a generation.
            current = self.put_child(doc_id, &current, &body)?;
        }
        self.get(doc_id, Some(&current), true)
    }

    fn put_child(&mut self, doc_id: &str, parent: &RevId, body: &Body) -> Result<RevId> {
        let rev = self.put_revision(
            PutRevision {
                doc_id: Some(doc_id.to_string()),
                body: body.clone(),
                prev_rev: Some(parent.clone()),
                allow_conflict: true,
                ..Default::default()
            },
            None,
        )?;
        Ok(rev.rev_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::Database;
    use serde_json::json;

    fn rev(s: &str) -> RevId {
        s.parse().unwrap()
    }

    fn body(v: serde_json::Value) -> Body {
        v.as_object().cloned().unwrap_or_default()
    }

    fn incoming(doc: &str, rev_id: &str, v: serde_json::Value) -> Revision {
        Revision::new(doc, rev(rev_id), false).with_body(body(v))
    }

    #[tokio::test]
    async fn linear_history() {
        let db = Database::memory("t").unwrap();
        let r1 = db.put("d", json!({"n": 1}), None).await.unwrap();
        let r2 = db.put("d", json!({"n": 2}), Some(&r1.rev_id)).await.unwrap();
        let r3 = db.put("d", json!({"n": 3}), Some(&r2.rev_id)).await.unwrap();
        assert_eq!(r3.rev_id.generation, 3);
        assert_eq!((r1.sequence, r2.sequence, r3.sequence), (1, 2, 3));

        let history = db.get_history("d", &r3.rev_id, &HashSet::new()).await.unwrap();
        let ids: Vec<RevId> = history.into_iter().map(|r| r.rev_id).collect();
        assert_eq!(ids, vec![r3.rev_id.clone(), r2.rev_id, r1.rev_id]);
        assert_eq!(db.get("d", None, true).await.unwrap().body.unwrap()["n"], 3);
    }

    #[tokio::test]
    async fn same_edit_same_rev_id() {
        let a = Database::memory("a").unwrap();
        let b = Database::memory("b").unwrap();
        let ra = a.put("d", json!({"x": 1, "y": [1, 2]}), None).await.unwrap();
        let rb = b.put("d", json!({"y": [1, 2], "x": 1}), None).await.unwrap();
        assert_eq!(ra.rev_id, rb.rev_id);
    }

    #[tokio::test]
    async fn mvcc_conflicts() {
        let db = Database::memory("t").unwrap();
        let r1 = db.put("d", json!({"n": 1}), None).await.unwrap();
        let r2 = db.put("d", json!({"n": 2}), Some(&r1.rev_id)).await.unwrap();

        // Stale parent.
        assert!(matches!(
            db.put("d", json!({"n": 3}), Some(&r1.rev_id)).await,
            Err(TrellisError::Conflict)
        ));
        // Unknown parent.
        assert!(matches!(
            db.put("d", json!({}), Some(&rev("9-zz"))).await,
            Err(TrellisError::Conflict)
        ));
        // Creating over a live document.
        assert!(matches!(
            db.put("d", json!({}), None).await,
            Err(TrellisError::Conflict)
        ));
        // Unknown parent with conflicts allowed.
        let err = db
            .put_revision(
                PutRevision {
                    doc_id: Some("d".into()),
                    prev_rev: Some(rev("9-zz")),
                    allow_conflict: true,
                    ..Default::default()
                },
                None,
            )
            .await;
        assert!(matches!(err, Err(TrellisError::NotFound(_))));
        // Branch from the stale parent when allowed.
        let branch = db
            .put_revision(
                PutRevision {
                    doc_id: Some("d".into()),
                    body: body(json!({"n": "branch"})),
                    prev_rev: Some(r1.rev_id.clone()),
                    allow_conflict: true,
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(branch.rev_id.generation, 2);
        let leaves = db.get_all_leaves("d", true).await.unwrap();
        assert_eq!(leaves.len(), 2);
        assert!(leaves.rev_with_id(&r2.rev_id).is_some());
    }

    #[tokio::test]
    async fn bad_ids_and_deletes() {
        let db = Database::memory("t").unwrap();
        assert!(matches!(
            db.put("_hidden", json!({}), None).await,
            Err(TrellisError::BadId(_))
        ));
        assert!(matches!(
            db.delete("ghost", &rev("1-a")).await,
            Err(TrellisError::Conflict)
        ));
        let missing_delete = db
            .put_revision(
                PutRevision {
                    doc_id: Some("ghost".into()),
                    deleted: true,
                    ..Default::default()
                },
                None,
            )
            .await;
        assert!(matches!(missing_delete, Err(TrellisError::NotFound(_))));

        let r1 = db.put("d", json!({"v": 1}), None).await.unwrap();
        let gone = db.delete("d", &r1.rev_id).await.unwrap();
        assert!(gone.deleted);
        assert_eq!(db.document_count().await.unwrap(), 0);
        assert!(db.get("d", None, false).await.unwrap().deleted);

        // Deleting again has nothing live to delete.
        assert!(matches!(
            db.delete("d", &gone.rev_id).await,
            Err(TrellisError::NotFound(_))
        ));

        // Recreating continues the tombstone.
        let again = db.put("d", json!({"v": 2}), None).await.unwrap();
        assert_eq!(again.rev_id.generation, 3);
        assert_eq!(db.document_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn generated_doc_id() {
        let db = Database::memory("t").unwrap();
        let r = db.post(body(json!({"a": 1}))).await.unwrap();
        assert_eq!(r.doc_id.len(), 32);
        assert_eq!(r.rev_id.generation, 1);
    }

    #[tokio::test]
    async fn rejecting_validator_changes_nothing() {
        let db = Database::memory("t").unwrap();
        db.put("keep", json!({"v": 1}), None).await.unwrap();
        db.define_validation(
            "deny_all",
            Arc::new(|_: &Revision, _: &ValidationContext<'_>| Err("read only".to_string())),
        );
        let count = db.document_count().await.unwrap();
        let seq = db.last_sequence().await.unwrap();

        let err = db.put("new", json!({"v": 1}), None).await;
        assert!(matches!(err, Err(TrellisError::ValidationRejected(ref r)) if r == "read only"));
        let err = db
            .force_insert(incoming("x", "1-a", json!({})), &[rev("1-a")], None, None)
            .await;
        assert!(matches!(err, Err(TrellisError::ValidationRejected(_))));

        assert_eq!(db.document_count().await.unwrap(), count);
        assert_eq!(db.last_sequence().await.unwrap(), seq);
    }

    #[tokio::test]
    async fn validator_sees_parent_and_changed_keys() {
        let db = Database::memory("t").unwrap();
        let r1 = db.put("d", json!({"owner": "ann", "n": 1}), None).await.unwrap();
        let owner_locked: Validator = Arc::new(|_: &Revision, ctx: &ValidationContext<'_>| {
            match ctx.previous_revision() {
                Some(prev) if prev.body.is_some() && ctx.changed_keys().iter().any(|k| k == "owner") => {
                    Err("owner is immutable".to_string())
                }
                _ => Ok(()),
            }
        });
        let ok = db
            .put_revision(
                PutRevision {
                    doc_id: Some("d".into()),
                    body: body(json!({"owner": "ann", "n": 2})),
                    prev_rev: Some(r1.rev_id.clone()),
                    ..Default::default()
                },
                Some(owner_locked.clone()),
            )
            .await
            .unwrap();
        let err = db
            .put_revision(
                PutRevision {
                    doc_id: Some("d".into()),
                    body: body(json!({"owner": "bob", "n": 3})),
                    prev_rev: Some(ok.rev_id),
                    ..Default::default()
                },
                Some(owner_locked),
            )
            .await;
        assert!(matches!(err, Err(TrellisError::ValidationRejected(_))));
    }

    #[tokio::test]
    async fn rejection_does_not_poison_batch() {
        let db = Database::memory("t").unwrap();
        let deny_b: Validator = Arc::new(|rev: &Revision, _: &ValidationContext<'_>| {
            if rev.doc_id == "b" { Err("no b".to_string()) } else { Ok(()) }
        });
        let outcomes = db
            .in_transaction(|txn| {
                let mut out = Vec::new();
                for id in ["a", "b", "c"] {
                    out.push(
                        txn.force_insert(incoming(id, "1-x", json!({})), &[rev("1-x")], Some(&deny_b), Some("remote"))
                            .is_ok(),
                    );
                }
                Ok(out)
            })
            .await
            .unwrap();
        assert_eq!(outcomes, vec![true, false, true]);
        assert_eq!(db.document_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sibling_order_independence() {
        let a = Database::memory("a").unwrap();
        let b = Database::memory("b").unwrap();
        let base = [rev("1-a")];
        let x = incoming("d", "2-x", json!({"v": "x"}));
        let y = incoming("d", "2-y", json!({"v": "y"}));
        for (db, order) in [(&a, [&x, &y]), (&b, [&y, &x])] {
            for r in order {
                let history = vec![r.rev_id.clone(), base[0].clone()];
                db.force_insert(r.clone(), &history, None, None).await.unwrap();
            }
        }
        let wa = a.get("d", None, true).await.unwrap();
        let wb = b.get("d", None, true).await.unwrap();
        assert_eq!(wa.rev_id, rev("2-y"));
        assert_eq!(wa.rev_id, wb.rev_id);
        assert_eq!(wa.body, wb.body);
        assert_eq!(a.get_all_leaves("d", true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn forced_insert_is_idempotent() {
        let db = Database::memory("t").unwrap();
        let r = incoming("d", "3-c", json!({"v": 1}));
        let history = [rev("3-c"), rev("2-b"), rev("1-a")];
        let mut rx = db.subscribe();

        let first = db.force_insert(r.clone(), &history, None, Some("peer")).await.unwrap();
        let ForceInsertOutcome::Inserted(change) = first else {
            panic!("expected an insert");
        };
        assert!(change.winner_changed);
        assert_eq!(change.source.as_deref(), Some("peer"));
        // Two phantoms and the revision itself.
        assert_eq!(change.revision.sequence, 3);
        assert!(rx.try_recv().is_ok());

        let seq = db.last_sequence().await.unwrap();
        let again = db.force_insert(r, &history, None, None).await.unwrap();
        assert_eq!(again, ForceInsertOutcome::AlreadyPresent);
        assert_eq!(db.last_sequence().await.unwrap(), seq);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forced_insert_fills_phantom() {
        let db = Database::memory("t").unwrap();
        db.force_insert(incoming("d", "2-b", json!({})), &[rev("2-b"), rev("1-a")], None, None)
            .await
            .unwrap();
        assert!(db.get("d", Some(&rev("1-a")), true).await.is_err());
        let filled = db
            .force_insert(incoming("d", "1-a", json!({"first": true})), &[rev("1-a")], None, None)
            .await
            .unwrap();
        let ForceInsertOutcome::Inserted(change) = filled else {
            panic!("expected an insert");
        };
        assert!(!change.winner_changed);
        assert_eq!(change.revision.sequence, 4);
        let stored = db.get("d", Some(&rev("1-a")), true).await.unwrap();
        assert_eq!(stored.body.unwrap()["first"], true);
        // Still not a leaf, so not in the feed.
        let page = db.changes_since(0, &Default::default()).await.unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.changes[0].revision.rev_id, rev("2-b"));
    }

    #[tokio::test]
    async fn filling_a_phantom_beyond_the_depth_sends_nothing() {
        let kv: Arc<dyn trellis_core::kv::KvBackend> =
            Arc::new(trellis_adapter_memory::MemoryBackend::new());
        let history: Vec<RevId> = ["5-e", "4-d", "3-c", "2-b", "1-a"]
            .iter()
            .map(|r| rev(r))
            .collect();
        let wide = Database::with_backend("t", kv.clone(), Default::default()).unwrap();
        wide.force_insert(incoming("d", "5-e", json!({})), &history, None, None)
            .await
            .unwrap();
        drop(wide);

        let narrow = Database::with_backend(
            "t",
            kv,
            crate::DatabaseOptions {
                max_rev_tree_depth: 2,
                ..Default::default()
            },
        )
        .unwrap();
        let mut rx = narrow.subscribe();
        let out = narrow
            .force_insert(incoming("d", "1-a", json!({"old": true})), &[rev("1-a")], None, None)
            .await
            .unwrap();
        assert_eq!(out, ForceInsertOutcome::AlreadyPresent);
        assert!(rx.try_recv().is_err());
        assert!(narrow.get("d", Some(&rev("1-a")), false).await.is_err());
        let kept = narrow.get_history("d", &rev("5-e"), &HashSet::new()).await.unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[tokio::test]
    async fn generation_overflow_is_an_error() {
        let db = Database::memory("t").unwrap();
        let wrapping = [rev("1-a"), rev("18446744073709551615-b")];
        assert!(matches!(
            db.force_insert(incoming("d", "1-a", json!({})), &wrapping, None, None).await,
            Err(TrellisError::BadRequest(_))
        ));

        let top = rev("18446744073709551615-z");
        let at_top = Revision::new("d", top.clone(), false);
        db.force_insert(at_top, &[top.clone()], None, None).await.unwrap();
        assert!(matches!(
            db.put("d", json!({"next": true}), Some(&top)).await,
            Err(TrellisError::InvalidRev(_))
        ));
        assert_eq!(db.get("d", None, true).await.unwrap().rev_id, top);
    }

    #[tokio::test]
    async fn malformed_history() {
        let db = Database::memory("t").unwrap();
        let r = incoming("d", "3-c", json!({}));
        assert!(matches!(
            db.force_insert(r.clone(), &[rev("3-c"), rev("1-a")], None, None).await,
            Err(TrellisError::BadRequest(_))
        ));
        assert!(matches!(
            db.force_insert(r.clone(), &[rev("3-x"), rev("2-b")], None, None).await,
            Err(TrellisError::BadRequest(_))
        ));
        assert!(matches!(
            db.force_insert(r, &[], None, None).await,
            Err(TrellisError::BadRequest(_))
        ));
        assert_eq!(db.last_sequence().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn conflict_flags_in_notifications() {
        let db = Database::memory("t").unwrap();
        let base = [rev("1-a")];
        db.force_insert(incoming("d", "1-a", json!({})), &base, None, None)
            .await
            .unwrap();
        db.force_insert(incoming("d", "2-x", json!({})), &[rev("2-x"), rev("1-a")], None, None)
            .await
            .unwrap();
        let out = db
            .force_insert(incoming("d", "2-w", json!({})), &[rev("2-w"), rev("1-a")], None, None)
            .await
            .unwrap();
        let ForceInsertOutcome::Inserted(change) = out else {
            panic!("expected an insert");
        };
        assert!(change.in_conflict);
        assert!(change.conflict_changed);
        // 2-x still wins over 2-w.
        assert!(!change.winner_changed);
        assert_eq!(change.winning_rev_id, rev("2-x"));
    }

    #[tokio::test]
    async fn resolve_by_keeping_loser() {
        let db = Database::memory("t").unwrap();
        for (r, v) in [("2-x", "x"), ("2-y", "y")] {
            db.force_insert(incoming("d", r, json!({"v": v})), &[rev(r), rev("1-a")], None, None)
                .await
                .unwrap();
        }
        let resolved = db
            .resolve_conflict("d", Resolution::Keep(rev("2-x")))
            .await
            .unwrap();
        assert_eq!(resolved.body.as_ref().unwrap()["v"], "x");
        let winner = db.get("d", None, true).await.unwrap();
        assert_eq!(winner.rev_id, resolved.rev_id);
        assert!(!winner.deleted);
        assert_eq!(db.get_all_leaves("d", true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolve_by_merge() {
        let db = Database::memory("t").unwrap();
        for (r, v) in [("2-x", "x"), ("2-y", "y"), ("3-z", "z")] {
            let parent = if r == "3-z" { vec![rev(r), rev("2-q"), rev("1-a")] } else { vec![rev(r), rev("1-a")] };
            db.force_insert(incoming("d", r, json!({"v": v})), &parent, None, None)
                .await
                .unwrap();
        }
        let merged = db
            .resolve_conflict("d", Resolution::Merge(body(json!({"v": "merged"}))))
            .await
            .unwrap();
        let winner = db.get("d", None, true).await.unwrap();
        assert_eq!(winner.rev_id, merged.rev_id);
        assert_eq!(winner.body.unwrap()["v"], "merged");
        assert!(winner.rev_id.generation >= 4);
        let current = db.get_all_leaves("d", true).await.unwrap();
        assert_eq!(current.len(), 1);
        assert!(!current.first().unwrap().deleted);
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_leaf() {
        let db = Database::memory("t").unwrap();
        db.put("d", json!({}), None).await.unwrap();
        assert!(matches!(
            db.resolve_conflict("d", Resolution::Keep(rev("5-nope"))).await,
            Err(TrellisError::BadRequest(_))
        ));
        assert!(matches!(
            db.resolve_conflict("none", Resolution::Merge(Body::new())).await,
            Err(TrellisError::NotFound(_))
        ));
    }
}
