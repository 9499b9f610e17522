//! Push sessions: local change feed to remote `_bulk_docs`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trellis_changes::{ChangeFeed, ChangesStreamOptions};
use trellis_core::document::revision_to_wire;
use trellis_core::error::{Result, TrellisError};
use trellis_core::peer::Peer;
use trellis_core::rev_id::RevId;
use trellis_store::{Database, FilterSpec, RevisionChange};

use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointSaver};
use crate::replicator::{ReplicationState, SessionContext};
use crate::sequence_map::SequenceMap;

pub(crate) async fn run(ctx: &SessionContext, cancel: CancellationToken) -> Result<()> {
    let settings = &ctx.settings;
    if settings.create_target {
        ctx.peer.create_if_missing().await?;
    }

    let filter = match &settings.filter_name {
        Some(name) if settings.doc_ids.is_none() => {
            if ctx.db.filter(name).is_none() {
                return Err(TrellisError::BadRequest(format!("unknown filter {name}")));
            }
            Some(FilterSpec {
                name: name.clone(),
                params: settings.filter_params.clone(),
            })
        }
        _ => None,
    };

    let manager = Arc::new(CheckpointManager::new(
        ctx.db.clone(),
        ctx.peer.clone(),
        settings,
    ));
    let since = manager
        .load()
        .await?
        .map(|c| c.local_sequence)
        .unwrap_or(0);
    debug!(checkpoint = %manager.id(), since, "push session starting");

    let feed = ChangeFeed::new(
        Arc::new(ctx.db.clone()),
        ChangesStreamOptions {
            since,
            live: settings.continuous,
            all_leaves: true,
            doc_ids: settings
                .doc_ids
                .as_ref()
                .map(|ids| ids.iter().cloned().collect()),
            filter,
            page_size: settings.batch_size,
            ..Default::default()
        },
    );
    let saver = CheckpointSaver::spawn(manager);
    let mut pusher = Pusher {
        ctx,
        feed,
        saver: &saver,
        sequences: SequenceMap::new(since),
        pending: Vec::new(),
        in_flight: JoinSet::new(),
    };
    let result = pusher.run(&cancel).await;
    // Batches still uploading are abandoned; their sequences were never
    // checkpointed.
    pusher.in_flight.abort_all();
    drop(pusher);
    let saved = saver.finish().await;
    result.and(saved)
}

struct Pusher<'a> {
    ctx: &'a SessionContext,
    feed: ChangeFeed<Database>,
    saver: &'a CheckpointSaver,
    sequences: SequenceMap<u64>,
    pending: Vec<RevisionChange>,
    in_flight: JoinSet<(u64, Result<usize>)>,
}

impl Pusher<'_> {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let batch_size = self.ctx.settings.batch_size;
        let max_in_flight = self.ctx.settings.max_in_flight_batches;
        let mut feed_done = false;

        loop {
            let caught_up = feed_done || self.feed.is_caught_up();
            let batch_ready =
                !self.pending.is_empty() && (self.pending.len() >= batch_size || caught_up);
            if batch_ready && self.in_flight.len() < max_in_flight {
                self.dispatch();
                continue;
            }
            if caught_up && self.pending.is_empty() && self.in_flight.is_empty() {
                // Anything between the last pushed change and the end of
                // the log was filtered out.
                let tag = self.sequences.add(self.feed.last_sequence());
                self.sequences.remove(tag);
                self.checkpoint();
                if feed_done {
                    return Ok(());
                }
                if self.ctx.settings.continuous {
                    self.ctx.set_state(ReplicationState::Idle);
                }
            }

            let can_read = !feed_done && self.pending.len() < batch_size;
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    let (tag, result) = joined.map_err(|e| {
                        TrellisError::Storage(format!("push batch task failed: {e}"))
                    })?;
                    let pushed = result?;
                    self.sequences.remove(tag);
                    self.ctx.progressed(pushed as u64);
                    self.checkpoint();
                }
                change = self.feed.next_change(), if can_read => match change? {
                    Some(change) => {
                        self.ctx.discovered(1);
                        self.pending.push(change);
                    }
                    None => feed_done = true,
                },
            }
        }
    }

    fn dispatch(&mut self) {
        let batch = std::mem::take(&mut self.pending);
        let last = batch
            .iter()
            .map(|c| c.revision.sequence)
            .max()
            .unwrap_or_default();
        let tag = self.sequences.add(last);
        debug!(changes = batch.len(), through = last, "pushing batch");
        let db = self.ctx.db.clone();
        let peer = self.ctx.peer.clone();
        self.in_flight
            .spawn(async move { (tag, push_batch(&db, peer.as_ref(), batch).await) });
    }

    fn checkpoint(&self) {
        self.saver.request(Checkpoint {
            local_sequence: *self.sequences.checkpointed_value(),
            remote_token: None,
        });
    }
}

/// Upload whatever the remote is missing from `changes`. Returns the number
/// of changes handled; per-document rejections are logged, not fatal.
async fn push_batch(db: &Database, peer: &dyn Peer, changes: Vec<RevisionChange>) -> Result<usize> {
    let mut revs: HashMap<String, Vec<RevId>> = HashMap::new();
    for change in &changes {
        revs.entry(change.revision.doc_id.clone())
            .or_default()
            .push(change.revision.rev_id.clone());
    }
    let diff = peer.revs_diff(revs).await?;
    if diff.results.is_empty() {
        return Ok(changes.len());
    }

    let docs = db
        .in_transaction(|txn| {
            let mut docs = Vec::new();
            for (doc_id, result) in &diff.results {
                let ancestors: HashSet<RevId> = result
                    .possible_ancestors
                    .iter()
                    .filter_map(|r| r.parse().ok())
                    .collect();
                for rev in &result.missing {
                    let rev_id: RevId = match rev.parse() {
                        Ok(rev_id) => rev_id,
                        Err(_) => {
                            warn!(doc_id = %doc_id, rev = %rev, "remote reported a malformed revision");
                            continue;
                        }
                    };
                    let revision = match txn.get(doc_id, Some(&rev_id), true) {
                        Ok(revision) => revision,
                        // Purged since the feed reported it.
                        Err(TrellisError::NotFound(_)) => continue,
                        Err(e) => return Err(e),
                    };
                    let stop_at: HashSet<RevId> = txn
                        .find_common_ancestor(doc_id, &rev_id, &ancestors)?
                        .into_iter()
                        .collect();
                    let history: Vec<RevId> = txn
                        .get_history(doc_id, &rev_id, &stop_at)?
                        .into_iter()
                        .map(|r| r.rev_id)
                        .collect();
                    docs.push(revision_to_wire(&revision, &history));
                }
            }
            Ok(docs)
        })
        .await?;

    if !docs.is_empty() {
        let results = peer.upload_revisions(docs).await?;
        for result in results.iter().filter(|r| !r.ok) {
            warn!(
                doc_id = %result.id,
                error = result.error.as_deref().unwrap_or("unknown"),
                reason = result.reason.as_deref().unwrap_or(""),
                "remote rejected revision"
            );
        }
    }
    Ok(changes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};
    use std::time::Duration;
    use trellis_core::revision::Revision;

    use crate::local::LocalPeer;
    use crate::replicator::Replicator;
    use crate::settings::ReplicationSettings;

    async fn push_once(local: &Database, peer: Arc<dyn Peer>, settings: ReplicationSettings) {
        let replicator = Replicator::new(local.clone(), peer, settings).unwrap();
        replicator.start();
        let status = tokio::time::timeout(Duration::from_secs(5), replicator.wait_for_stopped())
            .await
            .unwrap();
        assert_eq!(status.error, None);
    }

    #[tokio::test]
    async fn pushes_history_trimmed_to_common_ancestor() {
        let local = Database::memory("local").unwrap();
        let remote = Database::memory("remote").unwrap();
        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(remote.clone()));

        let r1 = local.put("doc", json!({"v": 1}), None).await.unwrap();
        push_once(&local, peer.clone(), ReplicationSettings::push("remote")).await;
        assert_eq!(remote.get("doc", None, false).await.unwrap().rev_id, r1.rev_id);

        let r2 = local.put("doc", json!({"v": 2}), Some(&r1.rev_id)).await.unwrap();
        let r3 = local.put("doc", json!({"v": 3}), Some(&r2.rev_id)).await.unwrap();
        push_once(&local, peer, ReplicationSettings::push("remote")).await;

        let winner = remote.get("doc", None, true).await.unwrap();
        assert_eq!(winner.rev_id, r3.rev_id);
        let history: Vec<RevId> = remote
            .get_history("doc", &r3.rev_id, &HashSet::new())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.rev_id)
            .collect();
        assert_eq!(history, vec![r3.rev_id, r2.rev_id, r1.rev_id]);
    }

    #[tokio::test]
    async fn filtered_push_checkpoints_past_skipped_changes() {
        let local = Database::memory("local").unwrap();
        let remote = Database::memory("remote").unwrap();
        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(remote.clone()));
        local.define_filter(
            "even",
            Arc::new(|rev: &Revision, _: &Map<String, Value>| {
                rev.body
                    .as_ref()
                    .and_then(|b| b.get("n"))
                    .and_then(Value::as_u64)
                    .is_some_and(|n| n % 2 == 0)
            }),
        );
        for n in 0..5u64 {
            local.put(&format!("d{n}"), json!({"n": n}), None).await.unwrap();
        }
        let mut settings = ReplicationSettings::push("remote");
        settings.filter_name = Some("even".into());
        push_once(&local, peer.clone(), settings.clone()).await;
        assert_eq!(remote.document_count().await.unwrap(), 3);

        let manager = CheckpointManager::new(local.clone(), peer, &settings);
        let checkpoint = manager.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.local_sequence, local.last_sequence().await.unwrap());
    }

    #[tokio::test]
    async fn unknown_filter_is_a_bad_request() {
        let local = Database::memory("local").unwrap();
        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(Database::memory("remote").unwrap()));
        let mut settings = ReplicationSettings::push("remote");
        settings.filter_name = Some("missing".into());
        let replicator = Replicator::new(local, peer, settings).unwrap();
        replicator.start();
        let status = replicator.wait_for_stopped().await;
        assert!(matches!(status.error, Some(TrellisError::BadRequest(_))));
    }

    #[tokio::test]
    async fn doc_ids_limit_what_is_pushed() {
        let local = Database::memory("local").unwrap();
        let remote = Database::memory("remote").unwrap();
        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(remote.clone()));
        for id in ["a", "b", "c"] {
            local.put(id, json!({}), None).await.unwrap();
        }
        let mut settings = ReplicationSettings::push("remote");
        settings.doc_ids = Some(vec!["b".into()]);
        push_once(&local, peer, settings).await;
        assert_eq!(remote.document_count().await.unwrap(), 1);
        assert!(remote.get("b", None, false).await.is_ok());
    }
}
