//! Remote-change application: downloads, cursor movement, skips.

use std::sync::atomic::Ordering;
use tidesync_integration_tests::{EngineFixture, sha256_hex};
use tidesync_store::SyncStatus;
use tidesync_transport::types::ChangeAction;

#[tokio::test(flavor = "multi_thread")]
async fn pure_remote_change_is_applied() {
    let fixture = EngineFixture::new("share1");
    fixture
        .remote
        .put_file_with_change("share1", "/a.txt", b"remote content", ChangeAction::Modified);

    fixture.engine.start().await.unwrap();
    let summary = fixture.engine.run_pass().await.unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.failed, 0);

    // Local bytes landed.
    let local = std::fs::read(fixture.local_path("share1", "/a.txt")).unwrap();
    assert_eq!(local, b"remote content");

    // Record agrees on both hashes and the server version.
    let record = fixture.store.get_file("share1", "/a.txt").unwrap().unwrap();
    let hash = sha256_hex(b"remote content");
    assert_eq!(record.local_hash, hash);
    assert_eq!(record.remote_hash, hash);
    assert_eq!(record.version, 1);
    assert_eq!(record.sync_status, SyncStatus::Synced);

    // Cursor committed past the batch.
    assert_eq!(fixture.store.get_cursor("share1").unwrap().as_deref(), Some("1"));
    fixture.engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn equal_hashes_skip_the_byte_transfer() {
    let fixture = EngineFixture::new("share1");

    // The same bytes already exist locally before the engine starts.
    let path = fixture.local_path("share1", "/same.txt");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"identical").unwrap();
    fixture
        .remote
        .put_file_with_change("share1", "/same.txt", b"identical", ChangeAction::Modified);

    fixture.engine.start().await.unwrap();
    fixture.engine.run_pass().await.unwrap();

    assert_eq!(fixture.remote.full_download_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.remote.range_calls.load(Ordering::SeqCst), 0);

    let record = fixture.store.get_file("share1", "/same.txt").unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.version, 1);
    fixture.engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_delete_removes_local_path() {
    let fixture = EngineFixture::new("share1");
    fixture
        .remote
        .put_file_with_change("share1", "/doomed.txt", b"bytes", ChangeAction::Created);

    fixture.engine.start().await.unwrap();
    fixture.engine.run_pass().await.unwrap();
    let path = fixture.local_path("share1", "/doomed.txt");
    assert!(path.exists());

    // Server-side delete arrives on the feed.
    {
        let mut changes = fixture.remote.changes.lock();
        let feed = changes.get_mut("share1").unwrap();
        feed.push(tidesync_transport::types::FileChange {
            path: "/doomed.txt".to_string(),
            kind: tidesync_transport::types::EntryKind::File,
            action: ChangeAction::Deleted,
            previous_path: None,
            size: 0,
            mod_time: chrono::Utc::now(),
            content_strong_hash: String::new(),
            version: 2,
        });
    }
    fixture.engine.run_pass().await.unwrap();

    assert!(!path.exists());
    assert!(fixture.store.get_file("share1", "/doomed.txt").unwrap().is_none());
    assert_eq!(fixture.store.get_cursor("share1").unwrap().as_deref(), Some("2"));
    fixture.engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn cursor_only_moves_forward_across_passes() {
    let fixture = EngineFixture::new("share1");
    fixture
        .remote
        .put_file_with_change("share1", "/one.txt", b"1", ChangeAction::Created);

    fixture.engine.start().await.unwrap();
    fixture.engine.run_pass().await.unwrap();
    let first = fixture.store.get_cursor("share1").unwrap().unwrap();

    // A pass with no new changes keeps the cursor in place.
    fixture.engine.run_pass().await.unwrap();
    let second = fixture.store.get_cursor("share1").unwrap().unwrap();
    assert_eq!(first, second);

    fixture
        .remote
        .put_file_with_change("share1", "/two.txt", b"2", ChangeAction::Created);
    fixture.engine.run_pass().await.unwrap();
    let third = fixture.store.get_cursor("share1").unwrap().unwrap();
    assert!(third.parse::<usize>().unwrap() > second.parse::<usize>().unwrap());

    // Explicit reset is the only way back.
    fixture.store.reset_cursor("share1").unwrap();
    assert_eq!(fixture.store.get_cursor("share1").unwrap(), None);
    fixture.engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_state_is_mirrored_to_the_server() {
    let fixture = EngineFixture::new("share1");
    fixture
        .remote
        .put_file_with_change("share1", "/m.txt", b"m", ChangeAction::Created);

    fixture.engine.start().await.unwrap();
    fixture.engine.run_pass().await.unwrap();

    let states = fixture.remote.sync_states.lock();
    let state = states.get("share1").expect("sync state mirrored");
    assert_eq!(state.cursor, "1");
    assert_eq!(state.status, "idle");
    fixture.engine.stop();
}
