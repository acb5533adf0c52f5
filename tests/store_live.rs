//! Round-trip tests against a real MongoDB, skipped by default.
//!
//! Run with a server available: `MONGO_URI=... cargo test -- --ignored`.
//! Each test owns one collection in the `pawbank_test` database and clears
//! it up front, so reruns start clean.

use mongodb::bson::{doc, Bson};
use mongodb::Client;
use pawbank::db::{BulkOutcome, DocumentStore, FindSpec, Opcode};
use pawbank::{MessageTally, TallyFlusher};

async fn open_store(collection: &str) -> DocumentStore {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pawbank=debug")
        .try_init();
    let uri = std::env::var("MONGO_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let client = Client::with_uri_str(&uri).await.expect("parse MONGO_URI");
    let store = DocumentStore::new(&client, "pawbank_test", collection);
    store.delete_many(None).await.expect("clear collection");
    store
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn insert_then_find_returns_equal_document() {
    let store = open_store("live_insert").await;

    let original = doc! { "_id": 1_i64, "balance": 10_i64, "tag": "x" };
    store.insert(original.clone()).await.unwrap();

    let found = store.find(1_i64, None).await.unwrap().unwrap();
    assert_eq!(found, original);

    // Lookups for ids never written stay errorless.
    assert!(store.find(999_i64, None).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn upsert_creates_then_updates() {
    let store = open_store("live_upsert").await;

    store.upsert(2_i64, doc! { "f": "first" }).await.unwrap();
    let created = store.find(2_i64, None).await.unwrap().unwrap();
    assert_eq!(created.get_str("f").unwrap(), "first");

    let updated = store
        .upsert_fetch(2_i64, doc! { "f": "second" })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.get_str("f").unwrap(), "second");
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn unset_removes_the_field() {
    let store = open_store("live_unset").await;

    store.upsert(3_i64, doc! { "f": "v", "keep": 1_i64 }).await.unwrap();
    store.unset(3_i64, ["f"]).await.unwrap();

    let found = store.find(3_i64, None).await.unwrap().unwrap();
    assert!(!found.contains_key("f"));
    assert!(found.contains_key("keep"));
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn increment_twice_accumulates() {
    let store = open_store("live_increment").await;

    store.increment(4_i64, doc! { "n": 3_i64 }).await.unwrap();
    let after = store
        .increment_fetch(4_i64, doc! { "n": 3_i64 })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.get_i64("n").unwrap(), 6);
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn bulk_update_inc_applies_deltas() {
    let store = open_store("live_bulk_update").await;

    store.upsert(1_i64, doc! { "balance": 10_i64 }).await.unwrap();
    let outcome = store
        .bulk_update(vec![doc! { "_id": 1_i64, "balance": 5_i64 }], None, Opcode::Inc)
        .await
        .unwrap();
    assert!(matches!(outcome, BulkOutcome::Applied(_)));

    let found = store.find(1_i64, None).await.unwrap().unwrap();
    assert_eq!(found.get_i64("balance").unwrap(), 15);
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn bulk_update_swallows_partial_failures() {
    let store = open_store("live_partial_failure").await;

    // A string balance makes the $inc request fail for this document only.
    store.upsert(1_i64, doc! { "balance": "corrupt" }).await.unwrap();

    let outcome = store
        .bulk_update(
            vec![
                doc! { "_id": 1_i64, "balance": 5_i64 },
                doc! { "_id": 2_i64, "balance": 5_i64 },
            ],
            None,
            Opcode::Inc,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, BulkOutcome::PartiallyFailed));

    // The unordered batch still applied the independent request.
    let created = store.find(2_i64, None).await.unwrap().unwrap();
    assert_eq!(created.get_i64("balance").unwrap(), 5);

    // The document behind the failing request is untouched.
    let skipped = store.find(1_i64, None).await.unwrap().unwrap();
    assert_eq!(skipped.get_str("balance").unwrap(), "corrupt");
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn bulk_unset_strips_field_everywhere() {
    let store = open_store("live_bulk_unset").await;

    store.upsert(1_i64, doc! { "tmp": 1_i64, "keep": 1_i64 }).await.unwrap();
    store.upsert(2_i64, doc! { "tmp": 2_i64 }).await.unwrap();
    store.upsert(3_i64, doc! { "keep": 3_i64 }).await.unwrap();

    let outcome = store.bulk_unset("tmp").await.unwrap();
    assert!(matches!(outcome, BulkOutcome::Applied(_)));

    let remaining = store
        .find_many(FindSpec::new().filter(doc! { "tmp": { "$exists": true } }))
        .await
        .unwrap();
    assert!(remaining.is_empty());
    assert!(store
        .find(1_i64, None)
        .await
        .unwrap()
        .unwrap()
        .contains_key("keep"));
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn prune_empty_deletes_bare_documents() {
    let store = open_store("live_prune").await;

    store.insert(doc! { "_id": 1_i64 }).await.unwrap();
    store.insert(doc! { "_id": 2_i64, "x": 1_i64 }).await.unwrap();

    store.prune_empty().await.unwrap();

    let all = store.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].get_i64("_id").unwrap(), 2);
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn find_many_sorts_and_limits_through_pipeline() {
    let store = open_store("live_find_many").await;

    for (id, balance) in [(1_i64, 5_i64), (2, 20), (3, 10)] {
        store.upsert(id, doc! { "balance": balance }).await.unwrap();
    }

    let spec = FindSpec::new()
        .filter(doc! { "balance": { "$exists": true } })
        .sort(doc! { "balance": -1 })
        .limit(2);
    let top = store.find_many(spec).await.unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!(top[0].get_i64("balance").unwrap(), 20);
    assert_eq!(top[1].get_i64("balance").unwrap(), 10);
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn delete_many_without_filter_clears_the_collection() {
    let store = open_store("live_delete_many").await;

    store.upsert(1_i64, doc! { "a": 1_i64 }).await.unwrap();
    store.upsert(2_i64, doc! { "b": 2_i64 }).await.unwrap();

    let result = store.delete_many(None).await.unwrap();
    assert_eq!(result.deleted_count, 2);
    assert!(store.get_all().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires a running MongoDB (set MONGO_URI)"]
async fn tally_flush_credits_balances_and_clears() {
    let store = open_store("live_flush").await;

    let tally = MessageTally::new();
    for _ in 0..4 {
        tally.record_one("42");
    }

    let flusher = TallyFlusher::new(tally.clone(), store.clone(), 300);
    flusher.flush().await.unwrap();

    assert!(tally.is_empty());

    let profile = store.find(42_i64, None).await.unwrap().unwrap();
    assert_eq!(profile.get_i64("balance").unwrap(), 2);

    let expire_at = match profile.get("ExpireAt") {
        Some(Bson::DateTime(stamp)) => *stamp,
        other => panic!("expected ExpireAt datetime, got {:?}", other),
    };
    let delta_ms = expire_at.timestamp_millis() - mongodb::bson::DateTime::now().timestamp_millis();
    let week_ms = 7 * 24 * 60 * 60 * 1000;
    assert!(delta_ms > week_ms - 60_000 && delta_ms <= week_ms);

    // A second flush with nothing recorded writes nothing.
    flusher.flush().await.unwrap();
    let profile = store.find(42_i64, None).await.unwrap().unwrap();
    assert_eq!(profile.get_i64("balance").unwrap(), 2);
}
