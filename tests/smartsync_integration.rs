//! Placeholder dehydration through the engine.

use tidesync_integration_tests::EngineFixture;
use tidesync_store::{QueueOp, SyncStatus};
use tidesync_transport::types::ChangeAction;

#[tokio::test(flavor = "multi_thread")]
async fn dehydration_replaces_cold_files_with_placeholders() {
    let fixture = EngineFixture::with_config("share1", |c| {
        c.smartsync.enabled = true;
        c.smartsync.max_age_days = 30;
    });

    // Materialize two files through a normal pass.
    fixture
        .remote
        .put_file_with_change("share1", "/cold.bin", &vec![1u8; 4096], ChangeAction::Created);
    fixture
        .remote
        .put_file_with_change("share1", "/hot.bin", &vec![2u8; 4096], ChangeAction::Created);

    fixture.engine.start().await.unwrap();
    fixture.engine.run_pass().await.unwrap();

    // Track both as hydrated; pressure worth one file.
    fixture.engine.note_access("share1", "/cold.bin", 4096);
    fixture.engine.note_access("share1", "/hot.bin", 4096);
    let selected = fixture.engine.dehydrate_share("share1", 4096).unwrap();
    assert_eq!(selected.len(), 1);

    // The dehydrated path holds the placeholder marker and is flagged
    // for re-download.
    let dehydrated = &selected[0];
    let abs = fixture.local_path("share1", dehydrated);
    assert!(tidesync_core::smartsync::is_placeholder(&abs));
    let record = fixture.store.get_file("share1", dehydrated).unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::PendingDownload);
    assert!(record.local_hash.is_empty());

    // Hydration queues a download and the next pass restores the bytes.
    fixture.engine.hydrate_path("share1", dehydrated).unwrap();
    let entries = fixture.store.dequeue(10).unwrap();
    assert!(entries.iter().any(|e| e.op == QueueOp::Download && &e.path == dehydrated));
    for entry in &entries {
        fixture
            .store
            .requeue(entry, "", entry.retry_count, chrono::Duration::zero())
            .unwrap();
    }
    fixture.engine.run_pass().await.unwrap();

    let restored = std::fs::read(&abs).unwrap();
    assert_eq!(restored.len(), 4096);
    let record = fixture.store.get_file("share1", dehydrated).unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    fixture.engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn dehydration_disabled_is_a_no_op() {
    let fixture = EngineFixture::new("share1");
    fixture.engine.start().await.unwrap();

    fixture.engine.note_access("share1", "/whatever.bin", 1024);
    let selected = fixture.engine.dehydrate_share("share1", u64::MAX).unwrap();
    assert!(selected.is_empty());
    fixture.engine.stop();
}
