//! Ordered key-value storage underneath the revision store.
//!
//! Backends only need point reads, ordered range scans and an atomic batch
//! write. Everything revision-specific (trees, sequences, the change log) is
//! encoded on top by `trellis-store`, so a backend never has to know what a
//! revision is.

use crate::error::Result;

/// Logical tables. Backends map each to their own keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// doc_id -> serialized revision tree
    Docs,
    /// doc_id \0 sequence(be) -> body JSON
    Bodies,
    /// sequence(be) -> (doc_id, rev_id)
    BySeq,
    /// local doc id -> JSON
    Local,
    /// key -> value (last sequence, database UUIDs)
    Meta,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Docs,
        Table::Bodies,
        Table::BySeq,
        Table::Local,
        Table::Meta,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Docs => "docs",
            Table::Bodies => "bodies",
            Table::BySeq => "by_seq",
            Table::Local => "local_docs",
            Table::Meta => "metadata",
        }
    }
}

/// One buffered mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: Vec<u8>,
    },
}

/// A key range. `end` is exclusive; `None` means "to the end of the table".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from(start: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: None,
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: prefix.to_vec(),
            end: prefix_successor(prefix),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.as_deref().is_none_or(|end| key < end)
    }
}

/// Smallest key greater than every key with this prefix, if one exists.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// A storage backend. Reads see only committed data; `apply` commits a
/// whole batch atomically or not at all.
pub trait KvBackend: Send + Sync {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Entries in `range`, in ascending key order, at most `limit` of them.
    fn scan(
        &self,
        table: Table,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn apply(&self, ops: Vec<KvOp>) -> Result<()>;

    /// Remove all data.
    fn clear(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Key encoding helpers
// ---------------------------------------------------------------------------

pub fn seq_key(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

pub fn decode_seq_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// `doc_id \0 seq(be)`: bodies of one document sort together.
pub fn body_key(doc_id: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_id.len() + 9);
    key.extend_from_slice(doc_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

pub fn body_prefix(doc_id: &str) -> Vec<u8> {
    let mut key = doc_id.as_bytes().to_vec();
    key.push(0);
    key
}
