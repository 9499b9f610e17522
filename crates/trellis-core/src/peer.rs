use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::document::{ChangesRequest, DocResult, FeedEvent, PeerInfo, RevsDiffResponse};
use crate::error::Result;
use crate::rev_id::RevId;

/// How to authenticate against a remote peer.
///
/// Serialized externally tagged: `{"basic": {"username": .., "password": ..}}`,
/// `{"bearer": "token"}` or `{"session": {..}}` for cookie login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
    Session { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => {
                f.debug_struct("Basic").field("username", username).finish_non_exhaustive()
            }
            Credentials::Bearer(_) => f.write_str("Bearer(..)"),
            Credentials::Session { username, .. } => {
                f.debug_struct("Session").field("username", username).finish_non_exhaustive()
            }
        }
    }
}

/// An open change feed.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<FeedEvent>> + Send>>;

/// The far side of a replication.
///
/// Implemented over HTTP for CouchDB-compatible servers, and in-process for
/// syncing two local databases. Revisions travel in their wire form: a JSON
/// body decorated with `_id`, `_rev`, `_deleted` and `_revisions`.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Stable identity used in checkpoint IDs, usually the URL.
    fn identity(&self) -> String;

    async fn info(&self) -> Result<PeerInfo>;

    /// Create the database if it does not exist yet.
    async fn create_if_missing(&self) -> Result<()>;

    /// Open a change feed. One-shot and long-poll feeds end after their
    /// `FeedEvent::LastSeq`; continuous and socket feeds stay open.
    async fn open_changes(&self, request: ChangesRequest) -> Result<ChangeStream>;

    /// Which of the given revisions the peer lacks.
    async fn revs_diff(&self, revs: HashMap<String, Vec<RevId>>) -> Result<RevsDiffResponse>;

    /// Store revisions exactly as given, with their history.
    async fn upload_revisions(&self, docs: Vec<serde_json::Value>) -> Result<Vec<DocResult>>;

    /// Fetch specific revisions of one document with `_revisions`. History
    /// may be truncated at the first ID in `known_ancestors`.
    async fn get_revisions(
        &self,
        doc_id: &str,
        revs: &[RevId],
        known_ancestors: &[RevId],
    ) -> Result<Vec<serde_json::Value>>;

    async fn get_local(&self, id: &str) -> Result<Option<serde_json::Value>>;

    async fn put_local(&self, id: &str, doc: serde_json::Value) -> Result<()>;

    async fn delete_local(&self, id: &str) -> Result<()>;
}
