//! The session handle every storage operation runs on.
//!
//! A `Transaction` buffers writes in an overlay that its own reads see.
//! Nothing reaches the backend until the outermost level commits, and then
//! everything (trees, bodies, change log, sequence counter) goes out in one
//! atomic batch. Change notifications collected along the way are handed
//! back to the caller only after that batch has landed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use trellis_core::error::{Result, TrellisError};
use trellis_core::kv::{KeyRange, KvBackend, KvOp, Table};
use trellis_core::rev_id::RevId;

use crate::changes::DatabaseChange;
use crate::database::{DatabaseOptions, Registry};

pub(crate) const META_KEY: &[u8] = b"meta";

/// Database-wide metadata, stored under `Table::Meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MetaRecord {
    pub last_sequence: u64,
    /// Shared with peers.
    pub public_uuid: String,
    /// Never leaves this database; seeds checkpoint IDs.
    pub private_uuid: String,
}

impl MetaRecord {
    pub fn fresh() -> Self {
        Self {
            last_sequence: 0,
            public_uuid: uuid::Uuid::new_v4().simple().to_string(),
            private_uuid: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Change-log entry, stored under `Table::BySeq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SeqRecord {
    pub doc_id: String,
    pub rev_id: RevId,
}

pub(crate) fn read_meta(backend: &dyn KvBackend) -> Result<Option<MetaRecord>> {
    match backend.get(Table::Meta, META_KEY)? {
        Some(bytes) => Ok(Some(
            serde_json::from_slice(&bytes).map_err(|e| TrellisError::Corrupt(e.to_string()))?,
        )),
        None => Ok(None),
    }
}

pub struct Transaction<'a> {
    backend: &'a dyn KvBackend,
    pub(crate) registry: Arc<Registry>,
    pub(crate) options: &'a DatabaseOptions,
    overlay: BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>,
    meta: MetaRecord,
    meta_dirty: bool,
    depth: usize,
    abort_reason: Option<TrellisError>,
    pub(crate) pending_changes: Vec<DatabaseChange>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(
        backend: &'a dyn KvBackend,
        registry: Arc<Registry>,
        options: &'a DatabaseOptions,
    ) -> Result<Self> {
        let meta = read_meta(backend)?
            .ok_or_else(|| TrellisError::Corrupt("database metadata missing".into()))?;
        Ok(Self {
            backend,
            registry,
            options,
            overlay: BTreeMap::new(),
            meta,
            meta_dirty: false,
            depth: 0,
            abort_reason: None,
            pending_changes: Vec::new(),
        })
    }

    /// Run `f` as a nested transaction. Any error inside marks the whole
    /// transaction for rollback, even if an enclosing level swallows it.
    pub fn nested<T>(&mut self, f: impl FnOnce(&mut Transaction<'a>) -> Result<T>) -> Result<T> {
        if let Some(reason) = &self.abort_reason {
            return Err(reason.clone());
        }
        self.depth += 1;
        trace!(depth = self.depth, "enter nested transaction");
        let result = f(self);
        self.depth -= 1;
        if let Err(e) = &result {
            trace!(depth = self.depth, error = %e, "nested transaction failed, rolling back");
            if self.abort_reason.is_none() {
                self.abort_reason = Some(e.clone());
            }
        }
        result
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    pub fn last_sequence(&self) -> u64 {
        self.meta.last_sequence
    }

    pub fn public_uuid(&self) -> &str {
        &self.meta.public_uuid
    }

    pub(crate) fn next_sequence(&mut self) -> u64 {
        self.meta.last_sequence += 1;
        self.meta_dirty = true;
        self.meta.last_sequence
    }

    // -----------------------------------------------------------------------
    // Overlay reads and writes
    // -----------------------------------------------------------------------

    pub(crate) fn read(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.overlay.get(&(table, key.to_vec())) {
            return Ok(value.clone());
        }
        self.backend.get(table, key)
    }

    pub(crate) fn write(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.overlay.insert((table, key), Some(value));
    }

    pub(crate) fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.overlay.insert((table, key), None);
    }

    /// Range scan that merges buffered writes over committed data.
    pub(crate) fn scan(
        &self,
        table: Table,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let pending: Vec<(&Vec<u8>, &Option<Vec<u8>>)> = self
            .overlay
            .range((table, range.start.clone())..)
            .take_while(|((t, _), _)| *t == table)
            .filter(|((_, k), _)| range.contains(k))
            .map(|((_, k), v)| (k, v))
            .collect();

        if pending.is_empty() {
            return self.backend.scan(table, range, limit);
        }

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.backend.scan(table, range, None)?.into_iter().collect();
        for (key, value) in pending {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        let iter = merged.into_iter();
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Write everything in one backend batch. Returns the notifications to
    /// publish, in commit order.
    pub(crate) fn commit(self) -> Result<Vec<DatabaseChange>> {
        if let Some(reason) = self.abort_reason {
            return Err(reason);
        }
        let mut ops: Vec<KvOp> = self
            .overlay
            .into_iter()
            .map(|((table, key), value)| match value {
                Some(value) => KvOp::Put { table, key, value },
                None => KvOp::Delete { table, key },
            })
            .collect();
        if self.meta_dirty {
            ops.push(KvOp::Put {
                table: Table::Meta,
                key: META_KEY.to_vec(),
                value: serde_json::to_vec(&self.meta)?,
            });
        }
        if !ops.is_empty() {
            self.backend.apply(ops)?;
            trace!(last_sequence = self.meta.last_sequence, "transaction committed");
        }
        Ok(self.pending_changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_adapter_memory::MemoryBackend;

    fn backend() -> MemoryBackend {
        let kv = MemoryBackend::new();
        kv.apply(vec![KvOp::Put {
            table: Table::Meta,
            key: META_KEY.to_vec(),
            value: serde_json::to_vec(&MetaRecord::fresh()).unwrap(),
        }])
        .unwrap();
        kv
    }

    #[test]
    fn overlay_reads_own_writes() {
        let kv = backend();
        let opts = DatabaseOptions::default();
        let mut txn = Transaction::begin(&kv, Arc::default(), &opts).unwrap();
        txn.write(Table::Local, b"a".to_vec(), b"1".to_vec());
        assert_eq!(txn.read(Table::Local, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get(Table::Local, b"a").unwrap(), None);
        txn.commit().unwrap();
        assert_eq!(kv.get(Table::Local, b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn scan_merges_overlay() {
        let kv = backend();
        kv.apply(vec![
            KvOp::Put {
                table: Table::Local,
                key: b"a".to_vec(),
                value: b"old".to_vec(),
            },
            KvOp::Put {
                table: Table::Local,
                key: b"b".to_vec(),
                value: b"keep".to_vec(),
            },
        ])
        .unwrap();
        let opts = DatabaseOptions::default();
        let mut txn = Transaction::begin(&kv, Arc::default(), &opts).unwrap();
        txn.delete(Table::Local, b"a".to_vec());
        txn.write(Table::Local, b"c".to_vec(), b"new".to_vec());
        let rows = txn.scan(Table::Local, &KeyRange::all(), None).unwrap();
        let keys: Vec<&[u8]> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"b".as_slice(), b"c".as_slice()]);
    }

    #[test]
    fn nested_failure_aborts_outer() {
        let kv = backend();
        let opts = DatabaseOptions::default();
        let mut txn = Transaction::begin(&kv, Arc::default(), &opts).unwrap();
        txn.write(Table::Local, b"a".to_vec(), b"1".to_vec());
        let inner: Result<()> = txn.nested(|t| {
            t.write(Table::Local, b"b".to_vec(), b"2".to_vec());
            Err(TrellisError::Storage("disk full".into()))
        });
        assert!(inner.is_err());
        assert!(txn.is_aborted());
        // Further nested work is refused.
        assert!(txn.nested(|_| Ok(())).is_err());
        assert!(txn.commit().is_err());
        assert_eq!(kv.get(Table::Local, b"a").unwrap(), None);
        assert_eq!(kv.get(Table::Local, b"b").unwrap(), None);
    }

    #[test]
    fn sequence_is_committed_with_data() {
        let kv = backend();
        let opts = DatabaseOptions::default();
        let mut txn = Transaction::begin(&kv, Arc::default(), &opts).unwrap();
        assert_eq!(txn.next_sequence(), 1);
        assert_eq!(txn.next_sequence(), 2);
        drop(txn);
        assert_eq!(read_meta(&kv).unwrap().unwrap().last_sequence, 0);

        let mut txn = Transaction::begin(&kv, Arc::default(), &opts).unwrap();
        txn.next_sequence();
        txn.commit().unwrap();
        assert_eq!(read_meta(&kv).unwrap().unwrap().last_sequence, 1);
    }
}
