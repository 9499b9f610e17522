//! Revision trees across databases: wire round-trips, common ancestors and
//! persistence.

mod common;

use std::collections::HashSet;

use common::rev;
use serde_json::json;
use trellis::{Database, ForceInsertOutcome, RevId, revision_from_wire, revision_to_wire};

async fn history(db: &Database, doc_id: &str, rev_id: &RevId) -> Vec<RevId> {
    db.get_history(doc_id, rev_id, &HashSet::new())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.rev_id)
        .collect()
}

#[tokio::test]
async fn wire_round_trip_rebuilds_the_same_tree() {
    let a = Database::memory("a").unwrap();
    let r1 = a.put("doc", json!({"v": 1}), None).await.unwrap();
    let r2 = a.put("doc", json!({"v": 2}), Some(&r1.rev_id)).await.unwrap();
    let r3 = a.put("doc", json!({"v": 3}), Some(&r2.rev_id)).await.unwrap();
    // A sibling branch off r2.
    a.force_insert(
        trellis::Revision::new("doc", rev("3-zzz"), false).with_body(
            json!({"v": "branch"}).as_object().cloned().unwrap(),
        ),
        &[rev("3-zzz"), r2.rev_id.clone(), r1.rev_id.clone()],
        None,
        None,
    )
    .await
    .unwrap();

    let b = Database::memory("b").unwrap();
    for leaf in a.get_all_leaves("doc", false).await.unwrap().iter() {
        let full = a.get("doc", Some(&leaf.rev_id), true).await.unwrap();
        let wire = revision_to_wire(&full, &history(&a, "doc", &leaf.rev_id).await);
        let (revision, hist) = revision_from_wire(wire).unwrap();
        b.force_insert(revision, &hist, None, None).await.unwrap();
    }

    let leaves = |db: Database| async move {
        let mut ids = db.get_all_leaves("doc", false).await.unwrap().rev_ids();
        ids.sort();
        ids
    };
    assert_eq!(leaves(a.clone()).await, leaves(b.clone()).await);
    assert_eq!(history(&a, "doc", &r3.rev_id).await, history(&b, "doc", &r3.rev_id).await);
    assert_eq!(
        a.get("doc", None, false).await.unwrap().rev_id,
        b.get("doc", None, false).await.unwrap().rev_id
    );
    let body = b.get("doc", Some(&r3.rev_id), true).await.unwrap().body.unwrap();
    assert_eq!(body["v"], 3);
}

#[tokio::test]
async fn common_ancestor_is_none_only_without_a_shared_candidate() {
    let db = Database::memory("db").unwrap();
    let r1 = db.put("doc", json!({"n": 1}), None).await.unwrap();
    let r2 = db.put("doc", json!({"n": 2}), Some(&r1.rev_id)).await.unwrap();
    let r3 = db.put("doc", json!({"n": 3}), Some(&r2.rev_id)).await.unwrap();

    let ancestor = |candidates: Vec<RevId>| {
        let db = db.clone();
        let r3 = r3.rev_id.clone();
        async move {
            db.find_common_ancestor("doc", &r3, &candidates.into_iter().collect())
                .await
                .unwrap()
        }
    };
    assert_eq!(ancestor(vec![]).await, None);
    assert_eq!(ancestor(vec![rev("2-unrelated"), rev("7-x")]).await, None);
    assert_eq!(ancestor(vec![r1.rev_id.clone()]).await, Some(r1.rev_id.clone()));
    assert_eq!(
        ancestor(vec![r1.rev_id.clone(), r2.rev_id.clone()]).await,
        Some(r2.rev_id.clone())
    );
    assert_eq!(
        db.find_common_ancestor("nope", &r3.rev_id, &HashSet::from([r1.rev_id.clone()]))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn repeated_forced_insert_changes_nothing() {
    let db = Database::memory("db").unwrap();
    let wire = json!({
        "_id": "doc", "_rev": "2-b", "k": "v",
        "_revisions": {"start": 2, "ids": ["b", "a"]}
    });
    let (revision, hist) = revision_from_wire(wire).unwrap();
    let first = db.force_insert(revision.clone(), &hist, None, None).await.unwrap();
    assert!(matches!(first, ForceInsertOutcome::Inserted(_)));
    let seq = db.last_sequence().await.unwrap();

    let mut changes = db.subscribe();
    let again = db.force_insert(revision, &hist, None, None).await.unwrap();
    assert_eq!(again, ForceInsertOutcome::AlreadyPresent);
    assert_eq!(db.last_sequence().await.unwrap(), seq);
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn trees_survive_reopening_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.redb");
    let (r2, uuid) = {
        let db = Database::open(&path, "app").unwrap();
        let r1 = db.put("doc", json!({"v": 1}), None).await.unwrap();
        let r2 = db.put("doc", json!({"v": 2}), Some(&r1.rev_id)).await.unwrap();
        db.put_local("note", json!({"x": 1})).await.unwrap();
        (r2, db.private_uuid().to_string())
    };

    let db = Database::open(&path, "app").unwrap();
    assert_eq!(db.private_uuid(), uuid);
    assert_eq!(db.get("doc", None, false).await.unwrap().rev_id, r2.rev_id);
    assert_eq!(history(&db, "doc", &r2.rev_id).await.len(), 2);
    assert_eq!(db.get_local("note").await.unwrap(), Some(json!({"x": 1})));
    assert_eq!(db.last_sequence().await.unwrap(), 2);
}
