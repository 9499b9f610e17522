use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};
use crate::rev_id::RevId;

/// A document body: a JSON object with unique keys.
pub type Body = serde_json::Map<String, serde_json::Value>;

const MAX_DOC_ID_LEN: usize = 250;

// ---------------------------------------------------------------------------
// Revision
// ---------------------------------------------------------------------------

/// One immutable version of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: RevId,
    #[serde(default)]
    pub deleted: bool,
    /// `None` when the body was not loaded, was compacted away, or never
    /// arrived (phantom ancestors).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    /// Assigned at commit; 0 means unassigned.
    #[serde(default)]
    pub sequence: u64,
    /// Placeholder with no stored body.
    #[serde(default)]
    pub missing: bool,
}

impl Revision {
    pub fn new(doc_id: impl Into<String>, rev_id: RevId, deleted: bool) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            deleted,
            body: None,
            sequence: 0,
            missing: false,
        }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn generation(&self) -> u64 {
        self.rev_id.generation
    }

    /// The body decorated with `_id`, `_rev` and `_deleted`.
    pub fn properties(&self) -> serde_json::Value {
        let mut obj = self.body.clone().unwrap_or_default();
        obj.insert("_id".into(), serde_json::Value::String(self.doc_id.clone()));
        obj.insert(
            "_rev".into(),
            serde_json::Value::String(self.rev_id.to_string()),
        );
        if self.deleted {
            obj.insert("_deleted".into(), serde_json::Value::Bool(true));
        }
        serde_json::Value::Object(obj)
    }

    /// Body with `_`-prefixed metadata removed, except `_attachments`.
    pub fn user_properties(&self) -> Body {
        strip_metadata(self.body.clone().unwrap_or_default())
    }
}

/// Drop the reserved underscore keys a body may carry on the wire.
/// `_attachments` is content and stays.
pub fn strip_metadata(mut body: Body) -> Body {
    body.retain(|k, _| !k.starts_with('_') || k == "_attachments");
    body
}

// ---------------------------------------------------------------------------
// Document IDs
// ---------------------------------------------------------------------------

/// Check a document ID: non-empty, bounded, no control characters, and no
/// leading underscore except for `_design/` documents.
pub fn validate_doc_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_DOC_ID_LEN {
        return Err(TrellisError::BadId(id.to_string()));
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(TrellisError::BadId(id.to_string()));
    }
    if id.starts_with('_') && !id.starts_with("_design/") {
        return Err(TrellisError::BadId(id.to_string()));
    }
    Ok(())
}

/// A fresh random document ID.
pub fn generate_doc_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// RevisionList
// ---------------------------------------------------------------------------

/// An ordered collection of revisions, used for leaves, history chains and
/// bulk results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevisionList(Vec<Revision>);

impl RevisionList {
    pub fn new(revs: Vec<Revision>) -> Self {
        Self(revs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Revision> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&Revision> {
        self.0.first()
    }

    pub fn push(&mut self, rev: Revision) {
        self.0.push(rev);
    }

    pub fn rev_with_id(&self, rev_id: &RevId) -> Option<&Revision> {
        self.0.iter().find(|r| &r.rev_id == rev_id)
    }

    pub fn rev_ids(&self) -> Vec<RevId> {
        self.0.iter().map(|r| r.rev_id.clone()).collect()
    }

    /// Distinct document IDs in first-seen order.
    pub fn doc_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.0
            .iter()
            .filter(|r| seen.insert(r.doc_id.as_str()))
            .map(|r| r.doc_id.clone())
            .collect()
    }

    pub fn sort_by_sequence(&mut self) {
        self.0.sort_by_key(|r| r.sequence);
    }

    pub fn limit(&mut self, n: usize) {
        self.0.truncate(n);
    }

    pub fn into_vec(self) -> Vec<Revision> {
        self.0
    }
}

impl From<Vec<Revision>> for RevisionList {
    fn from(revs: Vec<Revision>) -> Self {
        Self(revs)
    }
}

impl IntoIterator for RevisionList {
    type Item = Revision;
    type IntoIter = std::vec::IntoIter<Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a RevisionList {
    type Item = &'a Revision;
    type IntoIter = std::slice::Iter<'a, Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
