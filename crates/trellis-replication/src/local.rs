//! A [`Peer`] over a local [`Database`], for syncing two databases in the
//! same process and for exercising the replicator without a server.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use trellis_changes::{ChangeFeed, ChangesStreamOptions};
use trellis_core::document::{
    ChangeRev, ChangeRow, ChangesRequest, DocResult, FeedEvent, FeedMode, PeerInfo,
    RevsDiffResponse, Seq, revision_from_wire, revision_to_wire,
};
use trellis_core::error::{Result, TrellisError};
use trellis_core::peer::{ChangeStream, Peer};
use trellis_core::rev_id::RevId;
use trellis_store::{Database, FilterSpec, RevisionChange};

pub struct LocalPeer {
    db: Database,
}

impl LocalPeer {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn change_row(change: RevisionChange) -> ChangeRow {
    let rev = change.revision;
    ChangeRow {
        seq: Seq::Num(rev.sequence),
        id: rev.doc_id,
        changes: vec![ChangeRev {
            rev: rev.rev_id.to_string(),
        }],
        deleted: rev.deleted,
        doc: None,
    }
}

fn error_result(doc_id: String, e: &TrellisError) -> DocResult {
    let error = match e {
        TrellisError::ValidationRejected(_) | TrellisError::Forbidden(_) => "forbidden",
        TrellisError::Unauthorized => "unauthorized",
        TrellisError::Conflict => "conflict",
        TrellisError::NotFound(_) => "not_found",
        _ => "bad_request",
    };
    DocResult {
        ok: false,
        id: doc_id,
        rev: None,
        error: Some(error.into()),
        reason: Some(e.to_string()),
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn identity(&self) -> String {
        format!("trellis:{}/{}", self.db.name(), self.db.public_uuid())
    }

    async fn info(&self) -> Result<PeerInfo> {
        self.db.info().await
    }

    async fn create_if_missing(&self) -> Result<()> {
        Ok(())
    }

    async fn open_changes(&self, request: ChangesRequest) -> Result<ChangeStream> {
        let filter = match (&request.doc_ids, &request.filter) {
            (None, Some(name)) => {
                if self.db.filter(name).is_none() {
                    return Err(TrellisError::NotFound(format!("filter {name}")));
                }
                Some(FilterSpec {
                    name: name.clone(),
                    params: request.filter_params.clone(),
                })
            }
            _ => None,
        };
        let opts = ChangesStreamOptions {
            since: request.since.as_num(),
            live: request.mode != FeedMode::OneShot,
            all_leaves: request.all_leaves,
            doc_ids: request
                .doc_ids
                .as_ref()
                .map(|ids| ids.iter().cloned().collect::<HashSet<_>>()),
            filter,
            limit: request.limit.map(|l| l as usize),
            timeout: if request.mode == FeedMode::LongPoll {
                request.timeout
            } else {
                None
            },
            ..Default::default()
        };
        let mode = request.mode;
        let feed = ChangeFeed::new(Arc::new(self.db.clone()), opts);

        // Rows, then `LastSeq` once the backlog is drained. Long-poll and
        // one-shot end there; a long-poll with an empty backlog first waits
        // for one change.
        let state = (feed, false, false);
        Ok(Box::pin(futures_util::stream::unfold(
            state,
            move |(mut feed, mut announced, mut yielded)| async move {
                if announced && !mode.is_streaming() {
                    return None;
                }
                let ready_to_announce = feed.is_caught_up()
                    && !announced
                    && (mode != FeedMode::LongPoll || yielded);
                if ready_to_announce {
                    announced = true;
                    let seq = Seq::Num(feed.last_sequence());
                    return Some((Ok(FeedEvent::LastSeq(seq)), (feed, announced, yielded)));
                }
                match feed.next_change().await {
                    Ok(Some(change)) => {
                        yielded = true;
                        Some((Ok(FeedEvent::Change(change_row(change))), (feed, announced, yielded)))
                    }
                    Ok(None) if !announced => {
                        announced = true;
                        let seq = Seq::Num(feed.last_sequence());
                        Some((Ok(FeedEvent::LastSeq(seq)), (feed, announced, yielded)))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(e), (feed, true, yielded))),
                }
            },
        )))
    }

    async fn revs_diff(&self, revs: HashMap<String, Vec<RevId>>) -> Result<RevsDiffResponse> {
        self.db.find_missing_revisions(revs).await
    }

    async fn upload_revisions(&self, docs: Vec<Value>) -> Result<Vec<DocResult>> {
        self.db
            .in_transaction(|txn| {
                let mut results = Vec::with_capacity(docs.len());
                for doc in docs {
                    let fallback_id = doc
                        .get("_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let outcome = revision_from_wire(doc).and_then(|(revision, history)| {
                        let doc_id = revision.doc_id.clone();
                        let rev = revision.rev_id.to_string();
                        txn.force_insert(revision, &history, None, None)
                            .map(|_| (doc_id, rev))
                    });
                    results.push(match outcome {
                        Ok((id, rev)) => DocResult {
                            ok: true,
                            id,
                            rev: Some(rev),
                            error: None,
                            reason: None,
                        },
                        Err(e @ (TrellisError::Storage(_) | TrellisError::Corrupt(_))) => {
                            return Err(e);
                        }
                        Err(e) => error_result(fallback_id, &e),
                    });
                }
                Ok(results)
            })
            .await
    }

    async fn get_revisions(
        &self,
        doc_id: &str,
        revs: &[RevId],
        known_ancestors: &[RevId],
    ) -> Result<Vec<Value>> {
        let stop_at: HashSet<RevId> = known_ancestors.iter().cloned().collect();
        self.db
            .in_transaction(|txn| {
                let mut out = Vec::with_capacity(revs.len());
                for rev_id in revs {
                    let revision = match txn.get(doc_id, Some(rev_id), true) {
                        Ok(revision) => revision,
                        Err(TrellisError::NotFound(_)) => continue,
                        Err(e) => return Err(e),
                    };
                    let history: Vec<RevId> = txn
                        .get_history(doc_id, rev_id, &stop_at)?
                        .into_iter()
                        .map(|r| r.rev_id)
                        .collect();
                    out.push(revision_to_wire(&revision, &history));
                }
                Ok(out)
            })
            .await
    }

    async fn get_local(&self, id: &str) -> Result<Option<Value>> {
        self.db.get_local(id).await
    }

    async fn put_local(&self, id: &str, doc: Value) -> Result<()> {
        self.db.put_local(id, doc).await
    }

    async fn delete_local(&self, id: &str) -> Result<()> {
        self.db.delete_local(id).await.map(|_| ())
    }
}
