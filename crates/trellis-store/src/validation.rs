use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use trellis_core::error::{Result, TrellisError};
use trellis_core::revision::Revision;

/// Accepts or rejects an incoming revision. `Err(reason)` rejects.
pub type Validator =
    Arc<dyn Fn(&Revision, &ValidationContext<'_>) -> std::result::Result<(), String> + Send + Sync>;

/// What a validator can see besides the new revision itself.
pub struct ValidationContext<'a> {
    previous: Option<&'a Revision>,
    current: &'a Revision,
}

impl<'a> ValidationContext<'a> {
    pub(crate) fn new(previous: Option<&'a Revision>, current: &'a Revision) -> Self {
        Self { previous, current }
    }

    /// The parent revision with its body, if it is stored locally.
    pub fn previous_revision(&self) -> Option<&Revision> {
        self.previous
    }

    /// Top-level keys whose value differs between the parent's body and the
    /// new body, sorted.
    pub fn changed_keys(&self) -> Vec<String> {
        let empty = trellis_core::Body::new();
        let old = self.previous.and_then(|p| p.body.as_ref()).unwrap_or(&empty);
        let new = self.current.body.as_ref().unwrap_or(&empty);
        let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        keys.into_iter()
            .filter(|k| old.get(*k) != new.get(*k))
            .cloned()
            .collect()
    }
}

/// Run a validator, turning a panic into a rejection.
pub(crate) fn run_validator(
    name: &str,
    validator: &Validator,
    revision: &Revision,
    context: &ValidationContext<'_>,
) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(|| validator(revision, context))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(TrellisError::ValidationRejected(reason)),
        Err(_) => {
            warn!(validator = name, doc = %revision.doc_id, "validator panicked");
            Err(TrellisError::ValidationRejected(format!(
                "validator {name} failed"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::RevId;

    fn rev(body: serde_json::Value) -> Revision {
        Revision::new("doc", RevId::new(1, "a"), false)
            .with_body(body.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn changed_keys_diff() {
        let old = rev(json!({"a": 1, "b": 2, "c": 3}));
        let new = rev(json!({"a": 1, "b": 5, "d": 4}));
        let ctx = ValidationContext::new(Some(&old), &new);
        assert_eq!(ctx.changed_keys(), vec!["b", "c", "d"]);

        let ctx = ValidationContext::new(None, &new);
        assert_eq!(ctx.changed_keys(), vec!["a", "b", "d"]);
    }

    #[test]
    fn panic_is_rejection() {
        let v: Validator = Arc::new(
            |_: &Revision, _: &ValidationContext<'_>| -> std::result::Result<(), String> {
                panic!("boom")
            },
        );
        let r = rev(json!({}));
        let err = run_validator("explodes", &v, &r, &ValidationContext::new(None, &r)).unwrap_err();
        assert!(matches!(err, TrellisError::ValidationRejected(_)));
    }

    #[test]
    fn reason_is_surfaced() {
        let v: Validator =
            Arc::new(|_: &Revision, _: &ValidationContext<'_>| Err("no".to_string()));
        let r = rev(json!({}));
        match run_validator("deny", &v, &r, &ValidationContext::new(None, &r)) {
            Err(TrellisError::ValidationRejected(reason)) => assert_eq!(reason, "no"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
