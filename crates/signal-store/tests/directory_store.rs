use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use signal_store::{DirectoryStore, Document, DocumentChange, DocumentStore, DocumentWatch};
use tokio::time::timeout;

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("signal-store-{}", uuid::Uuid::new_v4()))
}

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().expect("object")
}

async fn next_change(watch: &mut DocumentWatch) -> DocumentChange {
    timeout(Duration::from_secs(2), watch.changed())
        .await
        .expect("change before timeout")
        .expect("watch open")
}

fn store(root: &PathBuf) -> DirectoryStore {
    DirectoryStore::new(root).with_poll_interval(Duration::from_millis(10))
}

#[tokio::test(flavor = "multi_thread")]
async fn burst_of_writes_reaches_a_watcher_in_another_store_handle() {
    let root = scratch_dir();
    let writer = store(&root);
    let reader = store(&root);

    let mut watch = reader
        .watch("connectionData", "callerCandidate")
        .await
        .expect("watch");
    for index in 0..5 {
        writer
            .set(
                "connectionData",
                "callerCandidate",
                doc(json!({"sdp": format!("candidate-{index}"), "sdpMLineIndex": 0})),
            )
            .await
            .expect("set");
    }

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let change = timeout(Duration::from_secs(2), watch.changed())
            .await
            .expect("change before timeout")
            .expect("watch open");
        seen.push(change.fields().expect("set")["sdp"].clone());
    }
    let expected: Vec<_> = (0..5).map(|i| json!(format!("candidate-{i}"))).collect();
    assert_eq!(seen, expected);

    let _ = tokio::fs::remove_dir_all(&root).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_starts_from_the_current_value_and_sees_deletes() {
    let root = scratch_dir();
    let store = store(&root);
    store
        .set("connectionData", "receiverAnswer", doc(json!({"sdp": "A0"})))
        .await
        .expect("set");
    store
        .set("connectionData", "receiverAnswer", doc(json!({"sdp": "A1"})))
        .await
        .expect("set");

    let mut watch = store
        .watch("connectionData", "receiverAnswer")
        .await
        .expect("watch");
    let first = timeout(Duration::from_secs(2), watch.changed())
        .await
        .expect("initial value")
        .expect("watch open");
    assert_eq!(first.fields().expect("set")["sdp"], json!("A1"));

    store
        .delete("connectionData", "receiverAnswer")
        .await
        .expect("delete");
    let next = timeout(Duration::from_secs(2), watch.changed())
        .await
        .expect("delete notification")
        .expect("watch open");
    assert_eq!(next, DocumentChange::Deleted);
    assert!(store
        .get("connectionData", "receiverAnswer")
        .await
        .expect("get")
        .is_none());

    let _ = tokio::fs::remove_dir_all(&root).await;
}

#[tokio::test]
async fn missing_document_reads_as_empty() {
    let root = scratch_dir();
    let store = store(&root);
    assert!(store.get("connectionData", "callerOffer").await.expect("get").is_none());
    store
        .delete("connectionData", "callerOffer")
        .await
        .expect("delete of missing document is a no-op");
}

#[tokio::test]
async fn set_and_delete_cycles_keep_the_journal_small() {
    let root = scratch_dir();
    let store = store(&root);
    let path = store.journal_path("connectionData", "callerCandidate");

    for session in 0..50 {
        for index in 0..20 {
            store
                .set(
                    "connectionData",
                    "callerCandidate",
                    doc(json!({
                        "sdp": format!("candidate:{session} 1 udp 2130706431 10.0.0.{index} 5000 typ host"),
                        "sdpMLineIndex": 0,
                    })),
                )
                .await
                .expect("set");
        }
        store
            .delete("connectionData", "callerCandidate")
            .await
            .expect("delete");
    }

    assert!(store
        .get("connectionData", "callerCandidate")
        .await
        .expect("get")
        .is_none());
    let len = tokio::fs::metadata(&path).await.expect("journal").len();
    assert!(len < 256, "journal holds {len} bytes after deletes");

    let _ = tokio::fs::remove_dir_all(&root).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_journal_compacts_to_the_latest_value() {
    let root = scratch_dir();
    let writer = store(&root).with_compact_threshold(1024);
    let reader = store(&root);
    let path = writer.journal_path("connectionData", "receiverCandidate");

    let mut watch = reader
        .watch("connectionData", "receiverCandidate")
        .await
        .expect("watch");
    for index in 0..200 {
        writer
            .set(
                "connectionData",
                "receiverCandidate",
                doc(json!({"sdp": format!("candidate-{index}"), "sdpMLineIndex": 0})),
            )
            .await
            .expect("set");
    }

    let len = tokio::fs::metadata(&path).await.expect("journal").len();
    assert!(len <= 1024 + 128, "journal holds {len} bytes");
    let current = reader
        .get("connectionData", "receiverCandidate")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(current["sdp"], json!("candidate-199"));

    // the watcher may skip compacted writes but always converges on the latest one
    let last = timeout(Duration::from_secs(2), async {
        loop {
            let change = watch.changed().await.expect("watch open");
            if change.fields().map(|fields| fields["sdp"].clone()) == Some(json!("candidate-199")) {
                break change;
            }
        }
    })
    .await
    .expect("latest value delivered");
    assert!(matches!(last, DocumentChange::Set { .. }));

    let _ = tokio::fs::remove_dir_all(&root).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_follows_writes_after_a_compacting_delete() {
    let root = scratch_dir();
    let store = store(&root);
    store
        .set("connectionData", "callerOffer", doc(json!({"sdp": "O1"})))
        .await
        .expect("set");

    let mut watch = store.watch("connectionData", "callerOffer").await.expect("watch");
    assert_eq!(next_change(&mut watch).await.fields().expect("set")["sdp"], json!("O1"));

    store.delete("connectionData", "callerOffer").await.expect("delete");
    assert_eq!(next_change(&mut watch).await, DocumentChange::Deleted);

    store
        .set("connectionData", "callerOffer", doc(json!({"sdp": "O2"})))
        .await
        .expect("set");
    assert_eq!(next_change(&mut watch).await.fields().expect("set")["sdp"], json!("O2"));

    let _ = tokio::fs::remove_dir_all(&root).await;
}
