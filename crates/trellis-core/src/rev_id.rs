use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TrellisError};

/// A revision identifier: `{generation}-{suffix}`.
///
/// - `generation` starts at 1 and grows by one per edit.
/// - `suffix` is opaque; locally generated ones are 32-character hex MD5
///   digests, but peers may send anything printable.
///
/// Ordering is generation first, then a raw byte-wise comparison of the
/// suffix. Every peer must agree on this order or winners diverge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevId {
    pub generation: u64,
    pub suffix: String,
}

impl RevId {
    pub fn new(generation: u64, suffix: impl Into<String>) -> Self {
        Self {
            generation,
            suffix: suffix.into(),
        }
    }

    /// Deterministic ID for a new revision.
    ///
    /// The suffix is the MD5 of the parent ID, the deleted flag and the
    /// canonical body, so the same edit made on two peers yields the same ID.
    /// Fails with [`TrellisError::InvalidRev`] when the parent's generation
    /// cannot be incremented.
    pub fn generate(
        parent: Option<&RevId>,
        deleted: bool,
        body: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let generation = match parent {
            Some(p) => p.generation.checked_add(1).ok_or_else(|| {
                TrellisError::InvalidRev(format!("no generation follows {p}"))
            })?,
            None => 1,
        };
        let mut hasher = Md5::new();
        if let Some(p) = parent {
            hasher.update(p.to_string().as_bytes());
        }
        hasher.update([if deleted { 1u8 } else { 0u8 }]);
        hasher.update(canonical_body(body).as_bytes());
        let suffix = format!("{:x}", hasher.finalize());
        Ok(RevId { generation, suffix })
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.suffix)
    }
}

impl FromStr for RevId {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self> {
        let (gen_str, suffix) = s
            .split_once('-')
            .ok_or_else(|| TrellisError::InvalidRev(s.to_string()))?;
        let generation: u64 = gen_str
            .parse()
            .map_err(|_| TrellisError::InvalidRev(s.to_string()))?;
        if generation == 0 || suffix.is_empty() {
            return Err(TrellisError::InvalidRev(s.to_string()));
        }
        Ok(RevId {
            generation,
            suffix: suffix.to_string(),
        })
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.suffix.as_bytes().cmp(other.suffix.as_bytes()))
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for RevId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Canonical JSON for a body: sorted keys, no whitespace, and top-level
/// `_`-prefixed metadata removed (`_attachments` stays, it is content).
pub fn canonical_body(body: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut out = String::new();
    let mut keys: Vec<&String> = body
        .keys()
        .filter(|k| !k.starts_with('_') || *k == "_attachments")
        .collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(&mut out, key);
        out.push(':');
        write_canonical(&mut out, &body[key]);
    }
    out.push('}');
    out
}

/// Canonical JSON for any value (sorted object keys, no whitespace).
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push_str(&serde_json::Value::String(s.to_string()).to_string());
}
