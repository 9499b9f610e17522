/// Persistent storage backend for trellis, built on `redb`.
///
/// Each logical table is one redb table of byte keys to byte values. A
/// batch from the revision store becomes a single redb write transaction,
/// so the sequence counter, revision trees, bodies and the change log are
/// always committed together.
use std::ops::Bound;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use trellis_core::error::{Result, TrellisError};
use trellis_core::kv::{KeyRange, KvBackend, KvOp, Table};

// ---------------------------------------------------------------------------
// Table definitions for redb
// ---------------------------------------------------------------------------

const DOC_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("docs");
const BODY_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("bodies");
const BY_SEQ_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("by_seq");
const LOCAL_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("local_docs");
const META_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("metadata");

fn definition(table: Table) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match table {
        Table::Docs => DOC_TABLE,
        Table::Bodies => BODY_TABLE,
        Table::BySeq => BY_SEQ_TABLE,
        Table::Local => LOCAL_TABLE,
        Table::Meta => META_TABLE,
    }
}

macro_rules! db_err {
    ($e:expr) => {
        $e.map_err(|e| TrellisError::Storage(e.to_string()))
    };
}

/// Persistent backend backed by a single redb file.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = db_err!(Database::create(path.as_ref()))?;

        // Opening tables in a write transaction creates them.
        let write_txn = db_err!(db.begin_write())?;
        for table in Table::ALL {
            db_err!(write_txn.open_table(definition(table)))?;
        }
        db_err!(write_txn.commit())?;

        tracing::debug!(path = %path.as_ref().display(), "opened redb backend");
        Ok(Self { db })
    }
}

impl KvBackend for RedbBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read_txn = db_err!(self.db.begin_read())?;
        let t = db_err!(read_txn.open_table(definition(table)))?;
        Ok(db_err!(t.get(key))?.map(|guard| guard.value().to_vec()))
    }

    fn scan(
        &self,
        table: Table,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let read_txn = db_err!(self.db.begin_read())?;
        let t = db_err!(read_txn.open_table(definition(table)))?;
        let upper: Bound<&[u8]> = match &range.end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };
        let iter = db_err!(t.range::<&[u8]>((Bound::Included(range.start.as_slice()), upper)))?;

        let mut out = Vec::new();
        for entry in iter {
            if limit.is_some_and(|n| out.len() >= n) {
                break;
            }
            let (k, v) = db_err!(entry)?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }

    fn apply(&self, ops: Vec<KvOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let write_txn = db_err!(self.db.begin_write())?;
        {
            for op in &ops {
                match op {
                    KvOp::Put { table, key, value } => {
                        let mut t = db_err!(write_txn.open_table(definition(*table)))?;
                        db_err!(t.insert(key.as_slice(), value.as_slice()))?;
                    }
                    KvOp::Delete { table, key } => {
                        let mut t = db_err!(write_txn.open_table(definition(*table)))?;
                        db_err!(t.remove(key.as_slice()))?;
                    }
                }
            }
        }
        db_err!(write_txn.commit())?;
        tracing::trace!(ops = ops.len(), "redb batch committed");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let write_txn = db_err!(self.db.begin_write())?;
        for table in Table::ALL {
            db_err!(write_txn.delete_table(definition(table)))?;
            db_err!(write_txn.open_table(definition(table)))?;
        }
        db_err!(write_txn.commit())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::kv::seq_key;

    fn temp_db() -> (tempfile::TempDir, RedbBackend) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let backend = RedbBackend::open(&path).unwrap();
        (dir, backend)
    }

    fn put(table: Table, key: &[u8], value: &[u8]) -> KvOp {
        KvOp::Put {
            table,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn put_and_get() {
        let (_dir, kv) = temp_db();
        kv.apply(vec![put(Table::Docs, b"doc1", b"{}")]).unwrap();
        assert_eq!(kv.get(Table::Docs, b"doc1").unwrap(), Some(b"{}".to_vec()));
        assert_eq!(kv.get(Table::Docs, b"missing").unwrap(), None);
    }

    #[test]
    fn batch_is_applied_in_order() {
        let (_dir, kv) = temp_db();
        kv.apply(vec![
            put(Table::Meta, b"k", b"1"),
            KvOp::Delete {
                table: Table::Meta,
                key: b"k".to_vec(),
            },
            put(Table::Meta, b"k", b"2"),
        ])
        .unwrap();
        assert_eq!(kv.get(Table::Meta, b"k").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn range_scan_with_limit() {
        let (_dir, kv) = temp_db();
        kv.apply((1..=5).map(|i| put(Table::BySeq, &seq_key(i), b"x")).collect())
            .unwrap();
        let rows = kv
            .scan(Table::BySeq, &KeyRange::from(seq_key(3)), Some(2))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, seq_key(3));
        assert_eq!(rows[1].0, seq_key(4));
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.redb");
        {
            let kv = RedbBackend::open(&path).unwrap();
            kv.apply(vec![put(Table::Local, b"cp", b"42")]).unwrap();
        }
        let kv = RedbBackend::open(&path).unwrap();
        assert_eq!(kv.get(Table::Local, b"cp").unwrap(), Some(b"42".to_vec()));
    }

    #[test]
    fn clear_drops_all_tables() {
        let (_dir, kv) = temp_db();
        kv.apply(vec![put(Table::Docs, b"a", b"1"), put(Table::Meta, b"m", b"2")])
            .unwrap();
        kv.clear().unwrap();
        assert_eq!(kv.get(Table::Docs, b"a").unwrap(), None);
        assert_eq!(kv.get(Table::Meta, b"m").unwrap(), None);
    }
}
