//! Delta download behavior over the engine.

use chrono::Utc;
use std::sync::atomic::Ordering;
use tidesync_integration_tests::{EngineFixture, sha256_hex};
use tidesync_store::{FileKind, FileRecord, SyncStatus};
use tidesync_transport::types::ChangeAction;

const MIB: usize = 1024 * 1024;
const BLOCK: usize = 64 * 1024;

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(31).wrapping_add(u32::from(seed)) % 251) as u8)
        .collect()
}

/// Place a local file and a matching synced record so the reconciler
/// treats it as clean (no conflict) when the remote moves on.
fn seed_clean_local(fixture: &EngineFixture, path: &str, bytes: &[u8]) {
    let abs = fixture.local_path("share1", path);
    std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
    std::fs::write(&abs, bytes).unwrap();

    let hash = sha256_hex(bytes);
    fixture
        .store
        .upsert_file(&FileRecord {
            share_id: "share1".to_string(),
            path: path.to_string(),
            kind: FileKind::File,
            size: bytes.len() as u64,
            mod_time: Utc::now(),
            local_hash: hash.clone(),
            remote_hash: hash,
            last_sync_at: Some(Utc::now()),
            version: 1,
            sync_status: SyncStatus::Synced,
            error_message: None,
        })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn delta_download_fetches_only_changed_blocks() {
    let fixture = EngineFixture::new("share1");

    // 10 MiB file: the first 9 MiB are unchanged, the last 1 MiB is new.
    let old = patterned(10 * MIB, 1);
    let mut new = old.clone();
    new[9 * MIB..].copy_from_slice(&patterned(MIB, 2));

    seed_clean_local(&fixture, "/video.bin", &old);
    fixture
        .remote
        .put_file_with_change("share1", "/video.bin", &new, ChangeAction::Modified);

    fixture.engine.start().await.unwrap();
    let summary = fixture.engine.run_pass().await.unwrap();
    assert_eq!(summary.applied, 1);

    // Exactly the 16 changed 64 KiB blocks moved over the wire.
    assert_eq!(fixture.remote.full_download_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.remote.range_calls.load(Ordering::SeqCst), 16);
    assert!(fixture.remote.range_bytes.load(Ordering::SeqCst) <= MIB as u64);

    // The reconstructed file matches the authoritative bytes.
    let local = std::fs::read(fixture.local_path("share1", "/video.bin")).unwrap();
    assert_eq!(sha256_hex(&local), sha256_hex(&new));

    let record = fixture.store.get_file("share1", "/video.bin").unwrap().unwrap();
    assert_eq!(record.local_hash, sha256_hex(&new));
    assert_eq!(record.sync_status, SyncStatus::Synced);
    fixture.engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn mostly_changed_file_falls_back_to_full_download() {
    let fixture = EngineFixture::new("share1");

    // Local base shares nothing with the remote content.
    let old = patterned(2 * MIB, 3);
    let new = patterned(2 * MIB, 4);

    seed_clean_local(&fixture, "/rewrite.bin", &old);
    fixture
        .remote
        .put_file_with_change("share1", "/rewrite.bin", &new, ChangeAction::Modified);

    fixture.engine.start().await.unwrap();
    fixture.engine.run_pass().await.unwrap();

    // More than 80% of blocks missing locally: the delta path declines.
    assert_eq!(fixture.remote.range_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.remote.full_download_calls.load(Ordering::SeqCst), 1);

    let local = std::fs::read(fixture.local_path("share1", "/rewrite.bin")).unwrap();
    assert_eq!(sha256_hex(&local), sha256_hex(&new));
    fixture.engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn small_files_never_take_the_delta_path() {
    let fixture = EngineFixture::new("share1");

    // Below the delta threshold: block-hash negotiation is skipped.
    let old = vec![1u8; 4 * BLOCK];
    let new = vec![2u8; 4 * BLOCK];

    seed_clean_local(&fixture, "/small.bin", &old);
    fixture
        .remote
        .put_file_with_change("share1", "/small.bin", &new, ChangeAction::Modified);

    fixture.engine.start().await.unwrap();
    fixture.engine.run_pass().await.unwrap();

    assert_eq!(fixture.remote.range_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.remote.full_download_calls.load(Ordering::SeqCst), 1);

    let local = std::fs::read(fixture.local_path("share1", "/small.bin")).unwrap();
    assert_eq!(local, new);
    fixture.engine.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn appended_tail_reuses_every_existing_block() {
    let fixture = EngineFixture::new("share1");

    // The remote file grew by one megabyte; everything else is intact.
    let old = patterned(4 * MIB, 5);
    let mut new = old.clone();
    new.extend_from_slice(&patterned(MIB, 6));

    seed_clean_local(&fixture, "/grow.bin", &old);
    fixture
        .remote
        .put_file_with_change("share1", "/grow.bin", &new, ChangeAction::Modified);

    fixture.engine.start().await.unwrap();
    fixture.engine.run_pass().await.unwrap();

    assert_eq!(fixture.remote.full_download_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.remote.range_calls.load(Ordering::SeqCst), 16);

    let local = std::fs::read(fixture.local_path("share1", "/grow.bin")).unwrap();
    assert_eq!(sha256_hex(&local), sha256_hex(&new));
    fixture.engine.stop();
}
