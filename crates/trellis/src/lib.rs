//! # trellis
//!
//! An embedded document database that keeps every document's full revision
//! tree, so independent copies can be edited offline and replicated with
//! each other, or with any CouchDB-compatible server, without losing
//! concurrent edits.
//!
//! ## Quick start
//!
//! ```no_run
//! use trellis::{Database, ReplicationSettings, Replicator};
//!
//! # async fn example() -> trellis::Result<()> {
//! let db = Database::open("path/to/app.redb", "app")?;
//! let rev = db.put("doc1", serde_json::json!({"name": "Alice"}), None).await?;
//! db.put("doc1", serde_json::json!({"name": "Alicia"}), Some(&rev.rev_id)).await?;
//!
//! let settings = ReplicationSettings::push("http://localhost:5984/app");
//! let replicator = trellis::replicator(db.clone(), settings).await?;
//! replicator.start();
//! let status = replicator.wait_for_stopped().await;
//! assert!(status.error.is_none());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::debug;

pub use trellis_core::document::{
    ChangeRow, ChangesRequest, DocResult, FeedEvent, FeedMode, PeerInfo, RevisionsDict,
    RevsDiffResponse, RevsDiffResult, Seq, revision_from_wire, revision_to_wire,
};
pub use trellis_core::error::{Result, TrellisError};
pub use trellis_core::peer::{ChangeStream, Credentials, Peer};
pub use trellis_core::rev_id::{RevId, canonical_json};
pub use trellis_core::revision::{Body, Revision, RevisionList};

pub use trellis_store::{
    ChangesOptions, ChangesPage, Database, DatabaseChange, DatabaseOptions, Filter, FilterSpec,
    ForceInsertOutcome, PurgeTarget, PutRevision, Resolution, RevisionChange, Transaction,
    ValidationContext, Validator,
};

pub use trellis_changes::{ChangeFeed, ChangesHandle, ChangesStreamOptions, get_changes, live_changes};

pub use trellis_adapter_http::{AuthClient, HttpOptions, HttpPeer};

pub use trellis_replication::{
    ChangeTracker, Checkpoint, CheckpointManager, ConflictResolver, Direction, LocalPeer,
    MaxRetries, NetworkPolicy, NetworkStatus, ReplicationSettings, ReplicationState,
    ReplicationStatus, Replicator, TrackerEvent, TrackerOptions, checkpoint_id,
};

fn is_url(remote: &str) -> bool {
    remote.starts_with("http://") || remote.starts_with("https://")
}

/// The peer a replication's `remote` names: a CouchDB-compatible server
/// for `http(s)://` URLs, otherwise a database file on disk.
///
/// Session credentials are exchanged for a cookie here, so an invalid
/// login fails before any replication starts.
pub async fn open_peer(settings: &ReplicationSettings) -> Result<Arc<dyn Peer>> {
    if is_url(&settings.remote) {
        let options = HttpOptions {
            credentials: settings.auth.clone(),
            headers: settings.headers.clone(),
            request_timeout: settings.request_timeout(),
        };
        let peer = HttpPeer::connect(&settings.remote, options).await?;
        debug!(remote = %peer.identity(), "opened http peer");
        return Ok(Arc::new(peer));
    }
    let path = std::path::Path::new(&settings.remote);
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("remote")
        .to_string();
    let db = Database::open(path, &name)?;
    debug!(remote = %settings.remote, "opened local peer");
    Ok(Arc::new(LocalPeer::new(db)))
}

/// Build a replicator for `db` against the remote named in `settings`.
pub async fn replicator(db: Database, settings: ReplicationSettings) -> Result<Replicator> {
    settings.validate()?;
    let peer = open_peer(&settings).await?;
    Replicator::new(db, peer, settings)
}
