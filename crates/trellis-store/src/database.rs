use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use trellis_adapter_memory::MemoryBackend;
use trellis_adapter_redb::RedbBackend;
use trellis_core::document::{PeerInfo, RevsDiffResponse, RevisionsDict, Seq};
use trellis_core::error::{Result, TrellisError};
use trellis_core::kv::{KvBackend, KvOp, Table};
use trellis_core::rev_id::RevId;
use trellis_core::revision::{Body, Revision, RevisionList};

use crate::changes::{ChangesOptions, ChangesPage, DatabaseChange, Filter};
use crate::insertion::{ForceInsertOutcome, PutRevision, Resolution};
use crate::store::PurgeTarget;
use crate::transaction::{META_KEY, MetaRecord, Transaction, read_meta};
use crate::validation::Validator;

/// Default depth at which old revisions are pruned.
pub const DEFAULT_MAX_REV_TREE_DEPTH: usize = 20;

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Revisions further than this from every leaf are pruned on insert.
    pub max_rev_tree_depth: usize,
    /// Capacity of the change notification channel.
    pub changes_buffer: usize,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_rev_tree_depth: DEFAULT_MAX_REV_TREE_DEPTH,
            changes_buffer: 256,
        }
    }
}

/// Named callbacks, swapped as a whole when one is added.
#[derive(Default, Clone)]
pub(crate) struct Registry {
    pub validators: BTreeMap<String, Validator>,
    pub filters: HashMap<String, Filter>,
}

struct DbInner {
    name: String,
    backend: Arc<dyn KvBackend>,
    /// The serialized execution context: one session at a time.
    context: Mutex<()>,
    registry: RwLock<Arc<Registry>>,
    options: DatabaseOptions,
    changes_tx: broadcast::Sender<DatabaseChange>,
    public_uuid: String,
    private_uuid: String,
}

/// An open database. Cheap to clone; clones share the same context.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("public_uuid", &self.inner.public_uuid)
            .finish()
    }
}

impl Database {
    /// A fresh in-memory database.
    pub fn memory(name: &str) -> Result<Self> {
        Self::with_backend(name, Arc::new(MemoryBackend::new()), DatabaseOptions::default())
    }

    /// Open or create a persistent database file.
    pub fn open(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let backend = RedbBackend::open(path)?;
        Self::with_backend(name, Arc::new(backend), DatabaseOptions::default())
    }

    pub fn with_backend(
        name: &str,
        backend: Arc<dyn KvBackend>,
        options: DatabaseOptions,
    ) -> Result<Self> {
        let meta = match read_meta(backend.as_ref())? {
            Some(meta) => meta,
            None => {
                let meta = MetaRecord::fresh();
                backend.apply(vec![KvOp::Put {
                    table: Table::Meta,
                    key: META_KEY.to_vec(),
                    value: serde_json::to_vec(&meta)?,
                }])?;
                info!(db = name, uuid = %meta.public_uuid, "created database");
                meta
            }
        };
        Ok(Self::assemble(name, backend, options, meta))
    }

    fn assemble(
        name: &str,
        backend: Arc<dyn KvBackend>,
        options: DatabaseOptions,
        meta: MetaRecord,
    ) -> Self {
        let (changes_tx, _) = broadcast::channel(options.changes_buffer.max(1));
        Database {
            inner: Arc::new(DbInner {
                name: name.to_string(),
                backend,
                context: Mutex::new(()),
                registry: RwLock::new(Arc::new(Registry::default())),
                options,
                changes_tx,
                public_uuid: meta.public_uuid,
                private_uuid: meta.private_uuid,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identifier shared with peers.
    pub fn public_uuid(&self) -> &str {
        &self.inner.public_uuid
    }

    /// Identifier that never leaves this database. Seeds checkpoint IDs.
    pub fn private_uuid(&self) -> &str {
        &self.inner.private_uuid
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.inner.options
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Run `f` on the database's execution context inside a transaction.
    ///
    /// Commits if `f` returns `Ok` and no nested transaction failed; rolls
    /// back otherwise. Change notifications go out only after the commit.
    pub async fn in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let _context = self.inner.context.lock().await;
        let registry = self.registry();
        let mut txn = Transaction::begin(
            self.inner.backend.as_ref(),
            registry,
            &self.inner.options,
        )?;
        let value = f(&mut txn)?;
        let changes = txn.commit()?;
        for change in changes {
            debug!(
                db = %self.inner.name,
                doc = %change.revision.doc_id,
                rev = %change.revision.rev_id,
                seq = change.revision.sequence,
                "revision committed"
            );
            // No receivers is fine.
            let _ = self.inner.changes_tx.send(change);
        }
        Ok(value)
    }

    fn registry(&self) -> Arc<Registry> {
        match self.inner.registry.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update_registry(&self, f: impl FnOnce(&mut Registry)) {
        let mut guard = match self.inner.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = Registry::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Register a validator that runs on every insert.
    pub fn define_validation(&self, name: &str, validator: Validator) {
        self.update_registry(|r| {
            r.validators.insert(name.to_string(), validator);
        });
    }

    pub fn remove_validation(&self, name: &str) {
        self.update_registry(|r| {
            r.validators.remove(name);
        });
    }

    /// Register a named change filter.
    pub fn define_filter(&self, name: &str, filter: Filter) {
        self.update_registry(|r| {
            r.filters.insert(name.to_string(), filter);
        });
    }

    pub fn filter(&self, name: &str) -> Option<Filter> {
        self.registry().filters.get(name).cloned()
    }

    /// Live notifications for every committed revision.
    pub fn subscribe(&self) -> broadcast::Receiver<DatabaseChange> {
        self.inner.changes_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Info
    // -----------------------------------------------------------------------

    pub async fn info(&self) -> Result<PeerInfo> {
        let (doc_count, last_seq) = self
            .in_transaction(|txn| Ok((txn.document_count()?, txn.last_sequence())))
            .await?;
        Ok(PeerInfo {
            db_name: self.inner.name.clone(),
            doc_count,
            update_seq: Seq::Num(last_seq),
        })
    }

    pub async fn document_count(&self) -> Result<u64> {
        self.in_transaction(|txn| txn.document_count()).await
    }

    pub async fn last_sequence(&self) -> Result<u64> {
        self.in_transaction(|txn| Ok(txn.last_sequence())).await
    }

    // -----------------------------------------------------------------------
    // Revision store
    // -----------------------------------------------------------------------

    /// A revision, or the current winner when `rev_id` is `None`.
    pub async fn get(
        &self,
        doc_id: &str,
        rev_id: Option<&RevId>,
        include_body: bool,
    ) -> Result<Revision> {
        self.in_transaction(|txn| txn.get(doc_id, rev_id, include_body))
            .await
    }

    pub async fn get_all_leaves(&self, doc_id: &str, only_current: bool) -> Result<RevisionList> {
        self.in_transaction(|txn| txn.get_all_leaves(doc_id, only_current))
            .await
    }

    pub async fn get_history(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        stop_at: &HashSet<RevId>,
    ) -> Result<Vec<Revision>> {
        self.in_transaction(|txn| txn.get_history(doc_id, rev_id, stop_at))
            .await
    }

    pub async fn get_revision_history_dict(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        stop_at: &HashSet<RevId>,
    ) -> Result<RevisionsDict> {
        self.in_transaction(|txn| txn.get_revision_history_dict(doc_id, rev_id, stop_at))
            .await
    }

    pub async fn find_common_ancestor(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        candidates: &HashSet<RevId>,
    ) -> Result<Option<RevId>> {
        self.in_transaction(|txn| txn.find_common_ancestor(doc_id, rev_id, candidates))
            .await
    }

    pub async fn get_possible_ancestor_rev_ids(
        &self,
        doc_id: &str,
        rev_id: &RevId,
        limit: usize,
    ) -> Result<Vec<RevId>> {
        self.in_transaction(|txn| txn.get_possible_ancestor_rev_ids(doc_id, rev_id, limit))
            .await
    }

    pub async fn find_missing_revisions(
        &self,
        revs: HashMap<String, Vec<RevId>>,
    ) -> Result<RevsDiffResponse> {
        self.in_transaction(|txn| txn.find_missing_revisions(&revs))
            .await
    }

    pub async fn purge(
        &self,
        doc_id: &str,
        target: PurgeTarget,
    ) -> Result<HashMap<String, Vec<RevId>>> {
        self.in_transaction(|txn| txn.purge(doc_id, &target)).await
    }

    /// Drop the bodies of every non-leaf revision.
    pub async fn compact(&self) -> Result<usize> {
        let dropped = self.in_transaction(|txn| txn.compact()).await?;
        info!(db = %self.inner.name, bodies = dropped, "compacted");
        Ok(dropped)
    }

    /// Remove every document, local document and the change log. The
    /// database identity is kept.
    pub async fn destroy(&self) -> Result<()> {
        let _context = self.inner.context.lock().await;
        let meta = read_meta(self.inner.backend.as_ref())?;
        self.inner.backend.clear()?;
        if let Some(meta) = meta {
            self.inner.backend.apply(vec![KvOp::Put {
                table: Table::Meta,
                key: META_KEY.to_vec(),
                value: serde_json::to_vec(&meta)?,
            }])?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------------

    pub async fn put_revision(
        &self,
        request: PutRevision,
        validator: Option<Validator>,
    ) -> Result<Revision> {
        self.in_transaction(|txn| txn.put_revision(request, validator.as_ref()))
            .await
    }

    /// Create or update a document from a JSON object.
    pub async fn put(
        &self,
        doc_id: &str,
        body: serde_json::Value,
        prev_rev: Option<&RevId>,
    ) -> Result<Revision> {
        let serde_json::Value::Object(body) = body else {
            return Err(TrellisError::BadRequest(
                "document body must be a JSON object".into(),
            ));
        };
        self.put_revision(
            PutRevision {
                doc_id: Some(doc_id.to_string()),
                body,
                prev_rev: prev_rev.cloned(),
                ..Default::default()
            },
            None,
        )
        .await
    }

    /// Create a document with a generated ID.
    pub async fn post(&self, body: Body) -> Result<Revision> {
        self.put_revision(
            PutRevision {
                body,
                ..Default::default()
            },
            None,
        )
        .await
    }

    /// Write a tombstone on top of `prev_rev`.
    pub async fn delete(&self, doc_id: &str, prev_rev: &RevId) -> Result<Revision> {
        self.put_revision(
            PutRevision {
                doc_id: Some(doc_id.to_string()),
                prev_rev: Some(prev_rev.clone()),
                deleted: true,
                ..Default::default()
            },
            None,
        )
        .await
    }

    pub async fn force_insert(
        &self,
        revision: Revision,
        history: &[RevId],
        validator: Option<Validator>,
        source: Option<&str>,
    ) -> Result<ForceInsertOutcome> {
        self.in_transaction(|txn| txn.force_insert(revision, history, validator.as_ref(), source))
            .await
    }

    pub async fn resolve_conflict(&self, doc_id: &str, resolution: Resolution) -> Result<Revision> {
        self.in_transaction(|txn| txn.resolve_conflict(doc_id, resolution))
            .await
    }

    // -----------------------------------------------------------------------
    // Change feed
    // -----------------------------------------------------------------------

    /// One page of changes after `since`.
    pub async fn changes_since(&self, since: u64, options: &ChangesOptions) -> Result<ChangesPage> {
        self.in_transaction(|txn| txn.changes_since(since, options))
            .await
    }

    // -----------------------------------------------------------------------
    // Local documents
    // -----------------------------------------------------------------------

    pub async fn get_local(&self, id: &str) -> Result<Option<serde_json::Value>> {
        self.in_transaction(|txn| txn.get_local(id)).await
    }

    pub async fn put_local(&self, id: &str, doc: serde_json::Value) -> Result<()> {
        self.in_transaction(|txn| txn.put_local(id, doc)).await
    }

    pub async fn delete_local(&self, id: &str) -> Result<bool> {
        self.in_transaction(|txn| txn.delete_local(id)).await
    }
}
