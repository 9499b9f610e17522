use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};
use crate::rev_id::RevId;
use crate::revision::{Body, Revision, strip_metadata};

// ---------------------------------------------------------------------------
// Sequence token: numeric locally, opaque string for some remote peers
// ---------------------------------------------------------------------------

/// A change-feed position as reported by a peer.
///
/// Local databases use plain integers. CouchDB 2.x+ and other peers may
/// hand back opaque strings that must be passed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seq {
    Num(u64),
    Str(String),
}

impl Seq {
    pub fn zero() -> Self {
        Seq::Num(0)
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Seq::Num(0))
    }

    /// Numeric value. Opaque strings yield their numeric prefix
    /// (`"13-g1AAA"` gives 13), or 0.
    pub fn as_num(&self) -> u64 {
        match self {
            Seq::Num(n) => *n,
            Seq::Str(s) => s
                .split('-')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
        }
    }

    /// Form used in a `since=` query parameter.
    pub fn to_query_string(&self) -> String {
        match self {
            Seq::Num(n) => n.to_string(),
            Seq::Str(s) => s.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Seq::Num(n) => serde_json::Value::from(*n),
            Seq::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Seq> {
        match value {
            serde_json::Value::Number(n) => n.as_u64().map(Seq::Num),
            serde_json::Value::String(s) => Some(Seq::Str(s.clone())),
            _ => None,
        }
    }
}

impl Default for Seq {
    fn default() -> Self {
        Seq::Num(0)
    }
}

impl From<u64> for Seq {
    fn from(n: u64) -> Self {
        Seq::Num(n)
    }
}

impl std::fmt::Display for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Seq::Num(n) => write!(f, "{}", n),
            Seq::Str(s) => write!(f, "{}", s),
        }
    }
}

// ---------------------------------------------------------------------------
// Change feed wire types
// ---------------------------------------------------------------------------

/// One row of a change feed: `{seq, id, changes: [{rev}], deleted?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub seq: Seq,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<serde_json::Value>,
}

impl ChangeRow {
    pub fn rev_ids(&self) -> Result<Vec<RevId>> {
        self.changes.iter().map(|c| c.rev.parse()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

/// Terminated (one-shot or long-poll) change feed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeRow>,
    pub last_seq: Seq,
}

/// How a remote change feed is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedMode {
    /// Fetch once and finish.
    #[default]
    OneShot,
    /// Blocking request re-issued after every response.
    LongPoll,
    /// Streamed, newline-delimited; never completes on its own.
    Continuous,
    /// Full-duplex WebSocket feed.
    Socket,
}

impl FeedMode {
    /// Modes whose connection is expected to stay open.
    pub fn is_streaming(self) -> bool {
        matches!(self, FeedMode::Continuous | FeedMode::Socket)
    }
}

/// A request for a remote change feed.
#[derive(Debug, Clone, Default)]
pub struct ChangesRequest {
    pub mode: FeedMode,
    pub since: Seq,
    pub limit: Option<u64>,
    pub filter: Option<String>,
    pub filter_params: serde_json::Map<String, serde_json::Value>,
    pub doc_ids: Option<Vec<String>>,
    pub heartbeat: Option<std::time::Duration>,
    pub timeout: Option<std::time::Duration>,
    /// Report every leaf, not only the winner.
    pub all_leaves: bool,
}

/// One element of an open change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(ChangeRow),
    /// End of the current backlog. In one-shot and long-poll modes the
    /// response ends here.
    LastSeq(Seq),
}

// ---------------------------------------------------------------------------
// Revision history wire form
// ---------------------------------------------------------------------------

/// Compact history: `{start, ids}` where `ids[i]` has generation
/// `start - i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionsDict {
    pub start: u64,
    pub ids: Vec<String>,
}

impl RevisionsDict {
    /// Build from a newest-first history. Stops at the first generation gap,
    /// since the compact form cannot express one.
    pub fn from_history(history: &[RevId]) -> Option<Self> {
        let first = history.first()?;
        let mut ids = Vec::with_capacity(history.len());
        for (i, rev) in history.iter().enumerate() {
            if rev.generation.checked_add(i as u64) != Some(first.generation) {
                break;
            }
            ids.push(rev.suffix.clone());
        }
        Some(RevisionsDict {
            start: first.generation,
            ids,
        })
    }

    /// Expand back into full revision IDs, newest first.
    pub fn to_history(&self) -> Result<Vec<RevId>> {
        if self.ids.is_empty() || (self.ids.len() as u64) > self.start {
            return Err(TrellisError::BadRequest(format!(
                "invalid _revisions: start {} with {} ids",
                self.start,
                self.ids.len()
            )));
        }
        Ok(self
            .ids
            .iter()
            .enumerate()
            .map(|(i, suffix)| RevId::new(self.start - i as u64, suffix.clone()))
            .collect())
    }
}

/// Encode a revision for transfer: body plus `_id`, `_rev`, `_deleted` and
/// `_revisions`.
pub fn revision_to_wire(rev: &Revision, history: &[RevId]) -> serde_json::Value {
    let mut value = rev.properties();
    if let Some(dict) = RevisionsDict::from_history(history)
        && let Some(obj) = value.as_object_mut()
        && let Ok(v) = serde_json::to_value(dict)
    {
        obj.insert("_revisions".into(), v);
    }
    value
}

/// Decode a transferred revision. Returns the revision (body stripped of
/// metadata) and its history, newest first. Without `_revisions` the
/// history is just the revision itself.
pub fn revision_from_wire(value: serde_json::Value) -> Result<(Revision, Vec<RevId>)> {
    let serde_json::Value::Object(obj) = value else {
        return Err(TrellisError::BadRequest(
            "revision must be a JSON object".into(),
        ));
    };
    let doc_id = obj
        .get("_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TrellisError::BadRequest("revision is missing _id".into()))?
        .to_string();
    let rev_id: RevId = obj
        .get("_rev")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TrellisError::BadRequest(format!("revision of {doc_id} is missing _rev")))?
        .parse()?;
    let deleted = obj
        .get("_deleted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let history = match obj.get("_revisions") {
        Some(v) => {
            let dict: RevisionsDict = serde_json::from_value(v.clone())?;
            let history = dict.to_history()?;
            if history[0] != rev_id {
                return Err(TrellisError::BadRequest(format!(
                    "_revisions of {doc_id} does not start at {rev_id}"
                )));
            }
            history
        }
        None => vec![rev_id.clone()],
    };
    let body: Body = strip_metadata(obj);
    Ok((Revision::new(doc_id, rev_id, deleted).with_body(body), history))
}

// ---------------------------------------------------------------------------
// Replication request / response shapes
// ---------------------------------------------------------------------------

/// `_revs_diff` response for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevsDiffResult {
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevsDiffResponse {
    #[serde(flatten)]
    pub results: HashMap<String, RevsDiffResult>,
}

/// Per-document outcome of a bulk upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocResult {
    #[serde(default)]
    pub ok: bool,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Identity and position of a database or remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub db_name: String,
    pub doc_count: u64,
    pub update_seq: Seq,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rev(s: &str) -> RevId {
        s.parse().unwrap()
    }

    #[test]
    fn seq_variants() {
        assert_eq!(Seq::Str("13-g1AAAA".into()).as_num(), 13);
        assert_eq!(Seq::Num(42).to_query_string(), "42");
        assert_eq!(Seq::from_json(&json!("7-x")), Some(Seq::Str("7-x".into())));
        assert_eq!(Seq::from_json(&json!(7)), Some(Seq::Num(7)));
        assert_eq!(Seq::from_json(&json!(null)), None);
        assert!(Seq::default().is_zero());
    }

    #[test]
    fn change_row_wire_form() {
        let row: ChangeRow = serde_json::from_value(json!({
            "seq": 4,
            "id": "foo",
            "changes": [{"rev": "2-x"}, {"rev": "2-y"}],
            "deleted": true
        }))
        .unwrap();
        assert_eq!(row.rev_ids().unwrap(), vec![rev("2-x"), rev("2-y")]);
        assert!(row.deleted);

        let live: ChangeRow =
            serde_json::from_value(json!({"seq": "9-abc", "id": "a", "changes": [{"rev": "1-a"}]}))
                .unwrap();
        assert!(!live.deleted);
        let back = serde_json::to_value(&live).unwrap();
        assert!(back.get("deleted").is_none());
    }

    #[test]
    fn revisions_dict_from_history() {
        let dict = RevisionsDict::from_history(&[rev("3-c"), rev("2-b"), rev("1-a")]).unwrap();
        assert_eq!(dict.start, 3);
        assert_eq!(dict.ids, vec!["c", "b", "a"]);
        assert_eq!(dict.to_history().unwrap(), vec![rev("3-c"), rev("2-b"), rev("1-a")]);
    }

    #[test]
    fn revisions_dict_stops_at_gap() {
        let dict = RevisionsDict::from_history(&[rev("5-e"), rev("4-d"), rev("2-b")]).unwrap();
        assert_eq!(dict.ids, vec!["e", "d"]);
    }

    #[test]
    fn revisions_dict_stops_at_a_wrapping_generation() {
        let dict =
            RevisionsDict::from_history(&[rev("5-e"), rev("18446744073709551615-z")]).unwrap();
        assert_eq!(dict.start, 5);
        assert_eq!(dict.ids, vec!["e"]);
    }

    #[test]
    fn revisions_dict_rejects_impossible() {
        let dict = RevisionsDict {
            start: 1,
            ids: vec!["a".into(), "b".into()],
        };
        assert!(dict.to_history().is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let body = json!({"name": "x"}).as_object().unwrap().clone();
        let r = Revision::new("doc", rev("2-b"), false).with_body(body.clone());
        let wire = revision_to_wire(&r, &[rev("2-b"), rev("1-a")]);
        assert_eq!(wire["_revisions"]["start"], 2);

        let (decoded, history) = revision_from_wire(wire).unwrap();
        assert_eq!(decoded.doc_id, "doc");
        assert_eq!(decoded.rev_id, rev("2-b"));
        assert_eq!(decoded.body, Some(body));
        assert_eq!(history, vec![rev("2-b"), rev("1-a")]);
    }

    #[test]
    fn wire_rejects_mismatched_history() {
        let wire = json!({"_id": "d", "_rev": "2-b", "_revisions": {"start": 2, "ids": ["z", "a"]}});
        assert!(revision_from_wire(wire).is_err());
        assert!(revision_from_wire(json!([1, 2])).is_err());
        assert!(revision_from_wire(json!({"_rev": "1-a"})).is_err());
    }

    #[test]
    fn revs_diff_flattened() {
        let v = json!({"doc": {"missing": ["2-b"], "possible_ancestors": ["1-a"]}});
        let diff: RevsDiffResponse = serde_json::from_value(v).unwrap();
        assert_eq!(diff.results["doc"].missing, vec!["2-b"]);
        assert_eq!(diff.results["doc"].possible_ancestors, vec!["1-a"]);
    }
}
