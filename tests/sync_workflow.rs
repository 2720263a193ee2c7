use assert_fs::prelude::*;
use std::sync::Arc;
use tokio_test::assert_ok;

use transx::config::Config;
use transx::etag::MIB;
use transx::scan::DirectoryScanner;
use transx::storage::{MemoryObjectStore, ObjectStore};
use transx::sync::{SyncCoordinator, SyncStatus, object_key};

fn coordinator(store: Arc<MemoryObjectStore>) -> SyncCoordinator {
    SyncCoordinator::new(store, "media", "alice")
}

#[tokio::test]
async fn test_repeated_sync_only_uploads_changes() {
    let temp = assert_fs::TempDir::new().unwrap();
    temp.child("talks/clip1.mp4").write_binary(b"first cut").unwrap();
    temp.child("talks/subs/clip1.en.vtt").write_str("WEBVTT\n").unwrap();
    temp.child("talks/notes.txt").write_str("ignored").unwrap();

    let store = Arc::new(MemoryObjectStore::new());
    let scanner = DirectoryScanner::new(&Config::default().scan);

    // First run uploads everything
    let report = assert_ok!(coordinator(store.clone()).sync(&scanner, temp.path()).await);
    assert_eq!(report.status(), "ok");
    assert_eq!(report.count(SyncStatus::Uploaded), 2);
    assert_eq!(store.put_count(), 2);
    assert_eq!(store.bucket_create_count(), 1);

    let mut keys = store.keys("media");
    keys.sort();
    assert_eq!(keys, vec!["alice/talks/clip1.mp4", "alice/talks/subs/clip1.en.vtt"]);

    // Nothing changed
    let report = coordinator(store.clone()).sync(&scanner, temp.path()).await.unwrap();
    assert_eq!(report.count(SyncStatus::InSync), 2);
    assert_eq!(store.put_count(), 2);
    assert_eq!(store.bucket_create_count(), 1);

    // Only the edited media is uploaded again
    temp.child("talks/clip1.mp4").write_binary(b"second cut").unwrap();
    let report = coordinator(store.clone()).sync(&scanner, temp.path()).await.unwrap();
    let uploaded: Vec<_> = report
        .records
        .iter()
        .filter(|r| r.status == SyncStatus::Uploaded)
        .map(|r| r.file.relative.as_str())
        .collect();
    assert_eq!(uploaded, vec!["talks/clip1.mp4"]);
    assert_eq!(store.put_count(), 3);
    assert_eq!(store.get_object("media", "alice/talks/clip1.mp4").await.unwrap(), b"second cut");
}

#[tokio::test]
async fn test_multipart_copy_is_not_reuploaded() {
    let temp = assert_fs::TempDir::new().unwrap();
    let data: Vec<u8> = (0..5 * MIB + 3).map(|i| (i % 251) as u8).collect();
    temp.child("clip2.mov").write_binary(&data).unwrap();

    // Stored as if uploaded in 1 MiB parts
    let store = Arc::new(MemoryObjectStore::with_multipart(MIB, MIB));
    let scanner = DirectoryScanner::new(&Config::default().scan);
    let files = scanner.scan(temp.path()).unwrap();
    store.insert("media", &object_key("alice", &files[0]), data);

    let report = coordinator(store.clone()).sync_files(files).await.unwrap();
    assert_eq!(report.count(SyncStatus::InSync), 1);
    assert_eq!(store.put_count(), 0);
}
