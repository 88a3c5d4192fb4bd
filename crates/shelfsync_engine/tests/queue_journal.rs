//! Durability of the operation queue across restarts and crashes.

use proptest::prelude::*;
use shelfsync_engine::{
    JournalConfig, JournalQueueStore, PendingOperationQueue, QueueStore, DEFAULT_MAX_RETRIES,
};
use shelfsync_protocol::{EntityRef, OperationKind, OperationStatus};
use shelfsync_storage::FileBackend;
use shelfsync_testkit::{edit_sequence_strategy, tear_tail, CrashableBackend, TempJournal};
use std::collections::HashMap;
use std::sync::Arc;

fn open_file(journal: &TempJournal, config: JournalConfig) -> Arc<JournalQueueStore<FileBackend>> {
    Arc::new(JournalQueueStore::open_file(journal.path(), config).unwrap())
}

async fn open_queue(store: Arc<dyn QueueStore>) -> PendingOperationQueue {
    PendingOperationQueue::open(store, DEFAULT_MAX_RETRIES)
        .await
        .unwrap()
}

fn patch(title: &str) -> Vec<u8> {
    format!(r#"{{"fields":{{"title":"{title}"}}}}"#).into_bytes()
}

#[tokio::test]
async fn rows_survive_reopen() {
    let journal = TempJournal::new();
    let (kept, next) = {
        let queue = open_queue(open_file(&journal, JournalConfig::default())).await;
        let kept = queue
            .enqueue(
                OperationKind::UpdateEntityFields,
                EntityRef::book("b1"),
                patch("A"),
                Some(3),
            )
            .await
            .unwrap();
        let done = queue
            .enqueue(
                OperationKind::UpdateEntityFields,
                EntityRef::book("b2"),
                patch("B"),
                Some(1),
            )
            .await
            .unwrap();
        queue.mark_completed(done).await.unwrap();
        (kept, done.next())
    };

    let queue = open_queue(open_file(&journal, JournalConfig::default())).await;
    assert_eq!(queue.len(), 1);
    let row = queue.get(kept).unwrap();
    assert_eq!(row.payload, patch("A"));
    assert_eq!(row.base_version, Some(3));

    let fresh = queue
        .enqueue(
            OperationKind::UpdateEntityFields,
            EntityRef::book("b3"),
            patch("C"),
            None,
        )
        .await
        .unwrap();
    assert!(fresh >= next, "ids are never reused");
}

#[tokio::test]
async fn interrupted_rows_return_to_pending() {
    let journal = TempJournal::new();
    {
        let queue = open_queue(open_file(&journal, JournalConfig::default())).await;
        queue
            .enqueue(
                OperationKind::UpdateEntityFields,
                EntityRef::book("b1"),
                patch("A"),
                Some(1),
            )
            .await
            .unwrap();
        let batch = queue.next_batch(10).await.unwrap();
        assert_eq!(batch[0].status, OperationStatus::InFlight);
    }

    let queue = open_queue(open_file(&journal, JournalConfig::default())).await;
    let rows = queue.list();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_pending());
}

#[tokio::test]
async fn torn_tail_is_discarded() {
    let journal = TempJournal::new();
    let first = {
        let queue = open_queue(open_file(&journal, JournalConfig::default())).await;
        let first = queue
            .enqueue(
                OperationKind::UpdateEntityFields,
                EntityRef::book("b1"),
                patch("A"),
                None,
            )
            .await
            .unwrap();
        queue
            .enqueue(
                OperationKind::UpdateEntityFields,
                EntityRef::book("b2"),
                patch("B"),
                None,
            )
            .await
            .unwrap();
        first
    };
    tear_tail(journal.path(), 3).unwrap();

    let store = open_file(&journal, JournalConfig::default());
    assert!(store.stats().unwrap().recovered_bytes > 0);
    let queue = open_queue(store).await;
    assert_eq!(queue.len(), 1);
    assert!(queue.get(first).is_some());
}

#[tokio::test]
async fn crash_mid_record_keeps_committed_rows() {
    let backend = CrashableBackend::new();
    let committed = {
        let store = Arc::new(JournalQueueStore::open(backend.clone(), JournalConfig::default()).unwrap());
        let queue = open_queue(store).await;
        let committed = queue
            .enqueue(
                OperationKind::UpdateEntityFields,
                EntityRef::book("b1"),
                patch("A"),
                None,
            )
            .await
            .unwrap();

        backend.crash_after(5);
        let lost = queue
            .enqueue(
                OperationKind::DeleteEntity,
                EntityRef::book("b2"),
                b"{}".to_vec(),
                None,
            )
            .await;
        assert!(lost.is_err());
        committed
    };
    assert!(backend.has_crashed());

    let store = Arc::new(JournalQueueStore::open(backend.restart(), JournalConfig::default()).unwrap());
    let queue = open_queue(store).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get(committed).unwrap().payload, patch("A"));
}

#[tokio::test]
async fn compaction_preserves_rows_and_id_sequence() {
    let journal = TempJournal::new();
    let config = JournalConfig::new()
        .with_compact_min_records(8)
        .with_compact_dead_ratio(0.5);

    let store = open_file(&journal, config.clone());
    let queue = open_queue(store.clone()).await;
    let keep = queue
        .enqueue(
            OperationKind::UpdateEntityFields,
            EntityRef::book("keep"),
            patch("K"),
            Some(9),
        )
        .await
        .unwrap();
    let mut last = keep;
    for i in 0..20 {
        last = queue
            .enqueue(
                OperationKind::UpdateEntityFields,
                EntityRef::book(format!("t{i}")),
                patch("T"),
                None,
            )
            .await
            .unwrap();
        queue.mark_completed(last).await.unwrap();
    }
    let stats = store.stats().unwrap();
    assert!(stats.compactions >= 1);
    assert_eq!(stats.live, 1);
    drop(queue);
    drop(store);

    let queue = open_queue(open_file(&journal, config)).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get(keep).unwrap().base_version, Some(9));
    let fresh = queue
        .enqueue(
            OperationKind::UpdateEntityFields,
            EntityRef::book("new"),
            patch("N"),
            None,
        )
        .await
        .unwrap();
    assert!(fresh > last);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn offline_edits_coalesce_to_last(edits in edit_sequence_strategy(3, 12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let (rows, expected) = runtime.block_on(async {
            let queue = PendingOperationQueue::in_memory().await.unwrap();
            let mut expected = HashMap::new();
            for (entity, edit) in &edits {
                let bytes = serde_json::to_vec(edit).unwrap();
                queue
                    .enqueue_or_coalesce(
                        OperationKind::UpdateEntityFields,
                        entity.clone(),
                        bytes.clone(),
                        Some(1),
                    )
                    .await
                    .unwrap();
                expected.insert(entity.clone(), bytes);
            }
            (queue.list(), expected)
        });

        prop_assert_eq!(rows.len(), expected.len());
        for row in rows {
            prop_assert_eq!(Some(&row.payload), expected.get(&row.entity));
            prop_assert_eq!(row.base_version, Some(1));
        }
    }
}
