use std::sync::Arc;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::peer::Peer;
use trellis_core::rev_id::canonical_json;
use trellis_store::Database;

use crate::settings::ReplicationSettings;

/// Progress of one replication configuration.
///
/// Push replications advance `local_sequence`; pull replications advance
/// `remote_token`, an opaque value from the remote feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    #[serde(default, rename = "lastSequence")]
    pub local_sequence: u64,
    #[serde(default)]
    pub remote_token: Option<Value>,
}

/// Deterministic checkpoint ID for a configuration.
///
/// Any change to the local database identity, remote, direction, filter,
/// its parameters or the doc ID list yields a different ID, so progress is
/// never shared between configurations.
pub fn checkpoint_id(private_uuid: &str, remote: &str, settings: &ReplicationSettings) -> String {
    let mut doc_ids = settings.doc_ids.clone().unwrap_or_default();
    doc_ids.sort();
    let params = canonical_json(&Value::Object(settings.filter_params.clone()));

    let mut hasher = Md5::new();
    for part in [
        private_uuid,
        remote,
        settings.direction.as_str(),
        settings.filter_name.as_deref().unwrap_or_default(),
        params.as_str(),
        doc_ids.join(",").as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Reads and writes the two copies of a checkpoint: a local document
/// `checkpoint/<id>` and, when mirrored, the remote's `_local/<id>`.
pub struct CheckpointManager {
    db: Database,
    peer: Arc<dyn Peer>,
    id: String,
    mirror: bool,
}

impl CheckpointManager {
    pub fn new(db: Database, peer: Arc<dyn Peer>, settings: &ReplicationSettings) -> Self {
        let id = checkpoint_id(db.private_uuid(), &peer.identity(), settings);
        Self {
            db,
            peer,
            id,
            mirror: settings.remote_checkpoint,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn local_key(&self) -> String {
        format!("checkpoint/{}", self.id)
    }

    async fn load_local(&self) -> Result<Option<Checkpoint>> {
        match self.db.get_local(&self.local_key()).await? {
            Some(doc) => Ok(serde_json::from_value(doc).ok()),
            None => Ok(None),
        }
    }

    /// The checkpoint to resume from, or `None` to start over.
    ///
    /// With mirroring on, both copies must exist and agree. A remote that
    /// was reset or restored from backup would otherwise be skipped over.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let local = self.load_local().await?;
        if !self.mirror {
            return Ok(local);
        }
        let remote: Option<Checkpoint> = self
            .peer
            .get_local(&self.id)
            .await?
            .and_then(|doc| serde_json::from_value(doc).ok());
        match (local, remote) {
            (Some(local), Some(remote)) if local == remote => Ok(Some(local)),
            (None, None) => Ok(None),
            (local, remote) => {
                info!(
                    checkpoint = %self.id,
                    local = ?local,
                    remote = ?remote,
                    "checkpoint copies disagree, starting over"
                );
                Ok(None)
            }
        }
    }

    /// Write the local copy, then the remote one.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let doc = serde_json::to_value(checkpoint)?;
        self.db.put_local(&self.local_key(), doc.clone()).await?;
        if self.mirror {
            self.peer.put_local(&self.id, doc).await?;
        }
        debug!(checkpoint = %self.id, local = checkpoint.local_sequence, remote = ?checkpoint.remote_token, "checkpoint saved");
        Ok(())
    }

    /// Delete both copies.
    pub async fn reset(&self) -> Result<()> {
        self.db.delete_local(&self.local_key()).await?;
        if self.mirror {
            self.peer.delete_local(&self.id).await?;
        }
        info!(checkpoint = %self.id, "checkpoint reset");
        Ok(())
    }
}

/// Saves checkpoints in the background, one at a time.
///
/// Requests made while a save is running collapse into the newest one.
pub struct CheckpointSaver {
    tx: watch::Sender<Option<Checkpoint>>,
    task: JoinHandle<Result<()>>,
}

impl CheckpointSaver {
    pub fn spawn(manager: Arc<CheckpointManager>) -> Self {
        let (tx, mut rx) = watch::channel::<Option<Checkpoint>>(None);
        let task = tokio::spawn(async move {
            let mut saved: Option<Checkpoint> = None;
            let mut last_result = Ok(());
            loop {
                let closed = rx.changed().await.is_err();
                let latest = rx.borrow_and_update().clone();
                if let Some(checkpoint) = latest
                    && saved.as_ref() != Some(&checkpoint)
                {
                    last_result = manager.save(&checkpoint).await;
                    match &last_result {
                        Ok(()) => saved = Some(checkpoint),
                        Err(e) => warn!(checkpoint = %manager.id(), error = %e, "checkpoint save failed"),
                    }
                }
                if closed {
                    return last_result;
                }
            }
        });
        Self { tx, task }
    }

    /// Ask for `checkpoint` to be saved. Returns immediately.
    pub fn request(&self, checkpoint: Checkpoint) {
        self.tx.send_replace(Some(checkpoint));
    }

    /// Save the newest requested checkpoint, then stop. Nothing is written
    /// after this returns.
    pub async fn finish(self) -> Result<()> {
        drop(self.tx);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TrellisError::Storage(format!("checkpoint task failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalPeer;
    use serde_json::json;

    fn pair() -> (Database, Database, Arc<dyn Peer>) {
        let local = Database::memory("local").unwrap();
        let remote = Database::memory("remote").unwrap();
        let peer: Arc<dyn Peer> = Arc::new(LocalPeer::new(remote.clone()));
        (local, remote, peer)
    }

    #[test]
    fn ids_differ_per_configuration() {
        let base = ReplicationSettings::push("http://h/db");
        let id = checkpoint_id("uuid", "http://h/db", &base);
        assert_eq!(id.len(), 32);
        assert_eq!(id, checkpoint_id("uuid", "http://h/db", &base));

        let mut pull = base.clone();
        pull.direction = crate::settings::Direction::Pull;
        let mut filtered = base.clone();
        filtered.filter_name = Some("f".into());
        let mut with_params = filtered.clone();
        with_params.filter_params.insert("k".into(), json!(1));
        let mut with_ids = base.clone();
        with_ids.doc_ids = Some(vec!["b".into(), "a".into()]);
        let mut reordered = base.clone();
        reordered.doc_ids = Some(vec!["a".into(), "b".into()]);

        let ids = [
            id.clone(),
            checkpoint_id("other-uuid", "http://h/db", &base),
            checkpoint_id("uuid", "http://h/db2", &base),
            checkpoint_id("uuid", "http://h/db", &pull),
            checkpoint_id("uuid", "http://h/db", &filtered),
            checkpoint_id("uuid", "http://h/db", &with_params),
            checkpoint_id("uuid", "http://h/db", &with_ids),
        ];
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(
            checkpoint_id("uuid", "http://h/db", &with_ids),
            checkpoint_id("uuid", "http://h/db", &reordered)
        );
    }

    #[tokio::test]
    async fn round_trip_and_reset() {
        let (local, remote, peer) = pair();
        let settings = ReplicationSettings::push("remote");
        let manager = CheckpointManager::new(local.clone(), peer, &settings);
        assert_eq!(manager.load().await.unwrap(), None);

        let cp = Checkpoint {
            local_sequence: 7,
            remote_token: Some(json!("7-abc")),
        };
        manager.save(&cp).await.unwrap();
        assert_eq!(manager.load().await.unwrap(), Some(cp));
        assert!(remote.get_local(manager.id()).await.unwrap().is_some());

        manager.reset().await.unwrap();
        assert_eq!(manager.load().await.unwrap(), None);
        assert!(remote.get_local(manager.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disagreeing_copies_start_over() {
        let (local, remote, peer) = pair();
        let settings = ReplicationSettings::push("remote");
        let manager = CheckpointManager::new(local.clone(), peer.clone(), &settings);
        manager
            .save(&Checkpoint {
                local_sequence: 5,
                remote_token: None,
            })
            .await
            .unwrap();

        // Remote lost its copy.
        remote.delete_local(manager.id()).await.unwrap();
        assert_eq!(manager.load().await.unwrap(), None);

        // Without mirroring the local copy is trusted.
        let mut unmirrored = settings.clone();
        unmirrored.remote_checkpoint = false;
        let solo = CheckpointManager::new(local, peer, &unmirrored);
        assert_eq!(solo.id(), manager.id());
        assert_eq!(solo.load().await.unwrap().map(|c| c.local_sequence), Some(5));
    }

    #[tokio::test]
    async fn saver_coalesces_and_finishes_with_latest() {
        let (local, _remote, peer) = pair();
        let settings = ReplicationSettings::push("remote");
        let manager = Arc::new(CheckpointManager::new(local, peer, &settings));
        let saver = CheckpointSaver::spawn(manager.clone());
        for seq in 1..=20 {
            saver.request(Checkpoint {
                local_sequence: seq,
                remote_token: None,
            });
        }
        saver.finish().await.unwrap();
        assert_eq!(
            manager.load().await.unwrap().map(|c| c.local_sequence),
            Some(20)
        );
    }
}
