/// In-memory storage backend for trellis.
///
/// Every table is a `BTreeMap`, so scans come back in key order just like
/// the persistent backend. Useful for tests and for ephemeral replicas.
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use trellis_core::error::{Result, TrellisError};
use trellis_core::kv::{KeyRange, KvBackend, KvOp, Table};

type TableMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<Table, TableMap>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> TrellisError {
    TrellisError::Storage("memory backend lock poisoned".into())
}

impl KvBackend for MemoryBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.get(&table).and_then(|t| t.get(key)).cloned())
    }

    fn scan(
        &self,
        table: Table,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read().map_err(poisoned)?;
        let Some(t) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        let upper = match &range.end {
            Some(end) => Bound::Excluded(end.clone()),
            None => Bound::Unbounded,
        };
        let iter = t
            .range((Bound::Included(range.start.clone()), upper))
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    fn apply(&self, ops: Vec<KvOp>) -> Result<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        for op in ops {
            match op {
                KvOp::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                KvOp::Delete { table, key } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.tables.write().map_err(poisoned)?.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::kv::{body_key, body_prefix, seq_key};

    fn put(table: Table, key: &[u8], value: &[u8]) -> KvOp {
        KvOp::Put {
            table,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn get_after_apply() {
        let kv = MemoryBackend::new();
        assert_eq!(kv.get(Table::Docs, b"a").unwrap(), None);
        kv.apply(vec![put(Table::Docs, b"a", b"1")]).unwrap();
        assert_eq!(kv.get(Table::Docs, b"a").unwrap(), Some(b"1".to_vec()));
        // Tables are separate keyspaces.
        assert_eq!(kv.get(Table::Local, b"a").unwrap(), None);
    }

    #[test]
    fn delete_removes() {
        let kv = MemoryBackend::new();
        kv.apply(vec![put(Table::Meta, b"k", b"v")]).unwrap();
        kv.apply(vec![KvOp::Delete {
            table: Table::Meta,
            key: b"k".to_vec(),
        }])
        .unwrap();
        assert_eq!(kv.get(Table::Meta, b"k").unwrap(), None);
    }

    #[test]
    fn scan_in_key_order_with_limit() {
        let kv = MemoryBackend::new();
        kv.apply(vec![
            put(Table::BySeq, &seq_key(10), b"c"),
            put(Table::BySeq, &seq_key(2), b"a"),
            put(Table::BySeq, &seq_key(5), b"b"),
        ])
        .unwrap();
        let all = kv.scan(Table::BySeq, &KeyRange::all(), None).unwrap();
        let values: Vec<&[u8]> = all.iter().map(|(_, v)| v.as_slice()).collect();
        assert_eq!(values, vec![b"a".as_slice(), b"b", b"c"]);

        let from = kv
            .scan(Table::BySeq, &KeyRange::from(seq_key(3)), Some(1))
            .unwrap();
        assert_eq!(from.len(), 1);
        assert_eq!(from[0].1, b"b");
    }

    #[test]
    fn prefix_scan() {
        let kv = MemoryBackend::new();
        kv.apply(vec![
            put(Table::Bodies, &body_key("doc", 1), b"x"),
            put(Table::Bodies, &body_key("doc", 3), b"y"),
            put(Table::Bodies, &body_key("doc2", 2), b"z"),
        ])
        .unwrap();
        let hits = kv
            .scan(Table::Bodies, &KeyRange::prefix(&body_prefix("doc")), None)
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn clear_empties_everything() {
        let kv = MemoryBackend::new();
        kv.apply(vec![put(Table::Docs, b"a", b"1")]).unwrap();
        kv.clear().unwrap();
        assert!(kv.scan(Table::Docs, &KeyRange::all(), None).unwrap().is_empty());
    }
}
