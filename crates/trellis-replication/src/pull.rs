//! Pull sessions: remote change feed to local forced inserts.
//!
//! Rows from the tracker are checked against the local store in groups,
//! missing revisions are fetched with bounded concurrency, and fetched
//! revisions are committed in time-windowed batches. The remote checkpoint
//! only moves past a row once everything before it is committed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::document::{Seq, revision_from_wire};
use trellis_core::error::{Result, TrellisError};
use trellis_core::rev_id::RevId;
use trellis_store::ForceInsertOutcome;

use crate::batcher::{Batcher, sleep_until};
use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointSaver};
use crate::replicator::{ReplicationState, SessionContext};
use crate::sequence_map::SequenceMap;
use crate::tracker::{ChangeTracker, TrackerEvent, TrackerOptions};

pub(crate) async fn run(ctx: &SessionContext, cancel: CancellationToken) -> Result<()> {
    let manager = Arc::new(CheckpointManager::new(
        ctx.db.clone(),
        ctx.peer.clone(),
        &ctx.settings,
    ));
    let checkpoint = manager.load().await?.unwrap_or_default();
    let since = checkpoint
        .remote_token
        .as_ref()
        .and_then(Seq::from_json)
        .unwrap_or_default();
    debug!(checkpoint = %manager.id(), %since, "pull session starting");

    let tracker_cancel = cancel.child_token();
    let (tracker, events) = ChangeTracker::start(
        ctx.peer.clone(),
        TrackerOptions::from_settings(&ctx.settings, since.clone()),
        tracker_cancel.clone(),
    );
    let saver = CheckpointSaver::spawn(manager);
    let mut puller = Puller::new(ctx, &saver, since, checkpoint.local_sequence);

    let result = puller.run(events, &tracker, &cancel).await;

    tracker_cancel.cancel();
    tracker.join().await;
    // Revisions already fetched are committed; fetches still running are
    // dropped and will be asked for again next time.
    puller.fetches.abort_all();
    let flushed = puller.flush_inserts().await;
    drop(puller);
    let saved = saver.finish().await;
    result.and(flushed).and(saved)
}

/// A feed row waiting for its missing-revision check.
struct Row {
    tag: u64,
    doc_id: String,
    rev_ids: Vec<RevId>,
}

struct FetchJob {
    tag: u64,
    doc_id: String,
    revs: Vec<RevId>,
    known: Vec<RevId>,
}

/// Wire-form revisions of one row, ready to insert.
struct Fetched {
    tag: u64,
    doc_id: String,
    revisions: Vec<Value>,
}

struct Puller<'a> {
    ctx: &'a SessionContext,
    saver: &'a CheckpointSaver,
    sequences: SequenceMap<Seq>,
    /// Informational: local sequence after the last committed batch.
    local_sequence: u64,
    rows: Batcher<Row>,
    queue: VecDeque<FetchJob>,
    fetches: JoinSet<(u64, String, Result<Vec<Value>>)>,
    inserts: Batcher<Fetched>,
    caught_up: bool,
}

impl<'a> Puller<'a> {
    fn new(
        ctx: &'a SessionContext,
        saver: &'a CheckpointSaver,
        since: Seq,
        local_sequence: u64,
    ) -> Self {
        let settings = &ctx.settings;
        Self {
            ctx,
            saver,
            sequences: SequenceMap::new(since),
            local_sequence,
            rows: Batcher::new(settings.batch_size, settings.insert_batch_delay()),
            queue: VecDeque::new(),
            fetches: JoinSet::new(),
            inserts: Batcher::new(settings.insert_batch_size, settings.insert_batch_delay()),
            caught_up: false,
        }
    }

    fn is_drained(&self) -> bool {
        self.rows.is_empty()
            && self.queue.is_empty()
            && self.fetches.is_empty()
            && self.inserts.is_empty()
    }

    async fn run(
        &mut self,
        mut events: mpsc::Receiver<TrackerEvent>,
        tracker: &ChangeTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut retry = self.ctx.retry_signal();
        let mut tracker_done = false;

        loop {
            self.spawn_fetches();
            if tracker_done {
                if !self.rows.is_empty() {
                    let rows = self.rows.take();
                    self.check_missing(rows).await?;
                    continue;
                }
                if self.queue.is_empty() && self.fetches.is_empty() {
                    self.flush_inserts().await?;
                    return Ok(());
                }
            } else if self.caught_up
                && self.is_drained()
                && self.sequences.is_empty()
                && self.ctx.settings.continuous
            {
                self.ctx.set_state(ReplicationState::Idle);
            }

            let rows_due = self.rows.deadline();
            let inserts_due = self.inserts.deadline();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Ok(()) = retry.changed() => tracker.retry(),
                event = events.recv(), if !tracker_done => match event {
                    Some(event) => {
                        if let Some(error) = self.on_tracker_event(event).await? {
                            return Err(error);
                        }
                    }
                    None => tracker_done = true,
                },
                Some(joined) = self.fetches.join_next(), if !self.fetches.is_empty() => {
                    let (tag, doc_id, result) = joined.map_err(|e| {
                        TrellisError::Storage(format!("fetch task failed: {e}"))
                    })?;
                    match result {
                        Ok(revisions) => {
                            let fetched = Fetched { tag, doc_id, revisions };
                            if let Some(batch) = self.inserts.push(fetched) {
                                self.insert(batch).await?;
                            }
                        }
                        Err(TrellisError::NotFound(_)) => {
                            warn!(doc_id = %doc_id, "revisions vanished from the remote");
                            self.complete(tag);
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ = sleep_until(rows_due) => {
                    let rows = self.rows.take();
                    self.check_missing(rows).await?;
                }
                _ = sleep_until(inserts_due) => {
                    let batch = self.inserts.take();
                    self.insert(batch).await?;
                }
            }
        }
    }

    /// Handle one tracker event. Returns the tracker's fatal error, if it
    /// gave up.
    async fn on_tracker_event(&mut self, event: TrackerEvent) -> Result<Option<TrellisError>> {
        match event {
            TrackerEvent::Received {
                sequence,
                doc_id,
                rev_ids,
                ..
            } => {
                let tag = self.sequences.add(sequence);
                self.ctx.discovered(1);
                let row = Row {
                    tag,
                    doc_id,
                    rev_ids,
                };
                if let Some(rows) = self.rows.push(row) {
                    self.check_missing(rows).await?;
                }
            }
            TrackerEvent::CaughtUp => {
                debug!("remote feed caught up");
                self.caught_up = true;
                let rows = self.rows.take();
                self.check_missing(rows).await?;
            }
            TrackerEvent::Retrying { error, .. } => {
                self.ctx.transport_error(&error);
            }
            TrackerEvent::Finished { error } => return Ok(error),
        }
        Ok(None)
    }

    /// Queue fetches for revisions not stored locally; rows with nothing
    /// missing are done right away.
    async fn check_missing(&mut self, rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut revs: HashMap<String, Vec<RevId>> = HashMap::new();
        for row in &rows {
            revs.entry(row.doc_id.clone())
                .or_default()
                .extend(row.rev_ids.iter().cloned());
        }
        let diff = self.ctx.db.find_missing_revisions(revs).await?;

        for row in rows {
            let Some(result) = diff.results.get(&row.doc_id) else {
                self.complete(row.tag);
                continue;
            };
            let missing: HashSet<&str> = result.missing.iter().map(String::as_str).collect();
            let revs: Vec<RevId> = row
                .rev_ids
                .into_iter()
                .filter(|r| missing.contains(r.to_string().as_str()))
                .collect();
            if revs.is_empty() {
                self.complete(row.tag);
                continue;
            }
            let known = result
                .possible_ancestors
                .iter()
                .filter_map(|r| r.parse().ok())
                .collect();
            self.queue.push_back(FetchJob {
                tag: row.tag,
                doc_id: row.doc_id,
                revs,
                known,
            });
        }
        Ok(())
    }

    fn spawn_fetches(&mut self) {
        while self.fetches.len() < self.ctx.settings.max_in_flight_batches {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            let peer = self.ctx.peer.clone();
            self.fetches.spawn(async move {
                let result = peer.get_revisions(&job.doc_id, &job.revs, &job.known).await;
                (job.tag, job.doc_id, result)
            });
        }
    }

    async fn flush_inserts(&mut self) -> Result<()> {
        let batch = self.inserts.take();
        self.insert(batch).await
    }

    /// Commit a group of fetched rows in one transaction, then advance the
    /// checkpoint and settle new conflicts.
    async fn insert(&mut self, batch: Vec<Fetched>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let source = self.ctx.peer.identity();
        let (conflicted, local_sequence) = self
            .ctx
            .db
            .in_transaction(|txn| {
                let mut conflicted = Vec::new();
                for fetched in &batch {
                    for doc in &fetched.revisions {
                        let outcome = revision_from_wire(doc.clone()).and_then(|(revision, history)| {
                            txn.force_insert(revision, &history, None, Some(&source))
                        });
                        match outcome {
                            Ok(ForceInsertOutcome::Inserted(change)) => {
                                if change.in_conflict {
                                    conflicted.push(change.revision.doc_id);
                                }
                            }
                            Ok(ForceInsertOutcome::AlreadyPresent) => {}
                            Err(e @ (TrellisError::Storage(_) | TrellisError::Corrupt(_))) => {
                                return Err(e);
                            }
                            Err(e) => {
                                warn!(doc_id = %fetched.doc_id, error = %e, "pulled revision not inserted");
                            }
                        }
                    }
                }
                Ok((conflicted, txn.last_sequence()))
            })
            .await?;

        debug!(rows = batch.len(), local_sequence, "pulled batch committed");
        self.local_sequence = local_sequence;
        for fetched in &batch {
            self.complete(fetched.tag);
        }
        self.resolve_conflicts(conflicted).await;
        Ok(())
    }

    /// Mark a row done and ask for a checkpoint.
    fn complete(&mut self, tag: u64) {
        self.sequences.remove(tag);
        self.ctx.progressed(1);
        self.saver.request(Checkpoint {
            local_sequence: self.local_sequence,
            remote_token: Some(self.sequences.checkpointed_value().to_json()),
        });
    }

    async fn resolve_conflicts(&self, mut doc_ids: Vec<String>) {
        let Some(resolver) = &self.ctx.resolver else {
            return;
        };
        doc_ids.sort();
        doc_ids.dedup();
        for doc_id in doc_ids {
            let leaves = match self.ctx.db.get_all_leaves(&doc_id, true).await {
                Ok(leaves) if leaves.len() > 1 => leaves,
                Ok(_) => continue,
                Err(e) => {
                    warn!(doc_id = %doc_id, error = %e, "could not load conflicting leaves");
                    continue;
                }
            };
            let Some(resolution) = resolver(&doc_id, &leaves) else {
                continue;
            };
            match self.ctx.db.resolve_conflict(&doc_id, resolution).await {
                Ok(revision) => {
                    info!(doc_id = %doc_id, rev = %revision.rev_id, "conflict resolved")
                }
                Err(e) => warn!(doc_id = %doc_id, error = %e, "conflict resolution failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use trellis_core::peer::Peer;
    use trellis_store::Database;

    use crate::local::LocalPeer;
    use crate::replicator::Replicator;
    use crate::settings::ReplicationSettings;

    async fn pull_once(local: &Database, peer: Arc<dyn Peer>, settings: ReplicationSettings) {
        let replicator = Replicator::new(local.clone(), peer, settings).unwrap();
        replicator.start();
        let status = tokio::time::timeout(Duration::from_secs(5), replicator.wait_for_stopped())
            .await
            .unwrap();
        assert_eq!(status.error, None);
    }

    fn settings() -> ReplicationSettings {
        let mut settings = ReplicationSettings::pull("remote");
        settings.insert_batch_delay_ms = 10;
        settings.insert_batch_size = 3;
        settings.batch_size = 4;
        settings
    }

    #[tokio::test]
    async fn pulls_everything_and_records_the_remote_token() {
        let local = Database::memory("local").unwrap();
        let remote = Database::memory("remote").unwrap();
        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(remote.clone()));
        for n in 0..10 {
            remote.put(&format!("doc{n}"), json!({"n": n}), None).await.unwrap();
        }
        pull_once(&local, peer.clone(), settings()).await;
        assert_eq!(local.document_count().await.unwrap(), 10);

        let manager = CheckpointManager::new(local.clone(), peer.clone(), &settings());
        let checkpoint = manager.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.remote_token, Some(json!(10)));
        assert_eq!(checkpoint.local_sequence, local.last_sequence().await.unwrap());

        // Nothing new: the second run starts from the checkpoint.
        let before = local.last_sequence().await.unwrap();
        pull_once(&local, peer, settings()).await;
        assert_eq!(local.last_sequence().await.unwrap(), before);
    }

    #[tokio::test]
    async fn pulled_revisions_carry_the_remote_as_source() {
        let local = Database::memory("local").unwrap();
        let remote = Database::memory("remote").unwrap();
        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(remote.clone()));
        let identity = peer.identity();
        remote.put("doc", json!({}), None).await.unwrap();

        let mut changes = local.subscribe();
        pull_once(&local, peer, settings()).await;
        let change = changes.recv().await.unwrap();
        assert_eq!(change.revision.doc_id, "doc");
        assert_eq!(change.source.as_deref(), Some(identity.as_str()));
    }

    #[tokio::test]
    async fn conflicting_revisions_become_siblings() {
        let local = Database::memory("local").unwrap();
        let remote = Database::memory("remote").unwrap();
        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(remote.clone()));
        let base = remote.put("doc", json!({"v": 0}), None).await.unwrap();
        pull_once(&local, peer.clone(), settings()).await;

        remote.put("doc", json!({"v": "remote"}), Some(&base.rev_id)).await.unwrap();
        local.put("doc", json!({"v": "local"}), Some(&base.rev_id)).await.unwrap();
        pull_once(&local, peer, settings()).await;

        let leaves = local.get_all_leaves("doc", true).await.unwrap();
        assert_eq!(leaves.len(), 2);
    }
}
