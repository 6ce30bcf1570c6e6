//! End-to-end tests of the engine's core read/write path against
//! in-memory collaborators.

mod common;

use std::sync::Arc;

use common::{key, pattern, test_config, MemCluster, MemMetaStore};
use extentfs_client::{ClientError, ExtentClient};
use futures::future::join_all;

async fn new_client(meta: &Arc<MemMetaStore>, cluster: &Arc<MemCluster>) -> Arc<ExtentClient> {
    ExtentClient::new(test_config(meta, cluster)).await.unwrap()
}

#[tokio::test]
async fn test_write_flush_read_roundtrip() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(3);
    let client = new_client(&meta, &cluster).await;
    let ino = 42;

    client.open_stream(ino, false, false).await.unwrap();

    let data = pattern(4096, 7);
    let (written, row) = client.write(ino, 0, &data, false, false).await.unwrap();
    assert_eq!(written, 4096);
    assert!(!row);

    client.flush(ino).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let (read, has_hole) = client.read(ino, &mut buf, 0, 4096).await.unwrap();
    assert_eq!(read, 4096);
    assert!(!has_hole);
    assert_eq!(buf, data);

    // The key is durable at the metadata service.
    let file = meta.file(ino);
    assert_eq!(file.size, 4096);
    assert_eq!(file.keys.len(), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_cold_read_from_seeded_metadata() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(2);

    let content = pattern(1024, 3);
    cluster.seed_extent(1, 100, content.clone());
    meta.seed_file(42, 1024, vec![key(1, 100, 0, 1024)]);

    let client = new_client(&meta, &cluster).await;
    client.open_stream(42, false, false).await.unwrap();

    let mut buf = vec![0u8; 1024];
    let (read, has_hole) = client.read(42, &mut buf, 0, 1024).await.unwrap();
    assert_eq!(read, 1024);
    assert!(!has_hole);
    assert_eq!(buf, content);
}

#[tokio::test]
async fn test_hole_read_returns_zeros() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(2);

    let head = pattern(512, 1);
    let tail = pattern(512, 2);
    cluster.seed_extent(1, 100, head.clone());
    cluster.seed_extent(2, 200, tail.clone());
    meta.seed_file(7, 2560, vec![key(1, 100, 0, 512), key(2, 200, 2048, 512)]);

    let client = new_client(&meta, &cluster).await;
    client.open_stream(7, false, false).await.unwrap();

    let mut buf = vec![0xffu8; 2560];
    let (read, has_hole) = client.read(7, &mut buf, 0, 2560).await.unwrap();
    assert_eq!(read, 2560);
    assert!(has_hole);
    assert_eq!(&buf[..512], &head[..]);
    assert_eq!(&buf[512..2048], &vec![0u8; 1536][..]);
    assert_eq!(&buf[2048..], &tail[..]);
}

#[tokio::test]
async fn test_overwrite_in_place() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(2);
    let client = new_client(&meta, &cluster).await;
    let ino = 9;

    client.open_stream(ino, false, false).await.unwrap();
    client
        .write(ino, 0, &pattern(2048, 5), false, false)
        .await
        .unwrap();

    let patch = pattern(512, 9);
    let (written, row) = client.write(ino, 512, &patch, false, false).await.unwrap();
    assert_eq!(written, 512);
    assert!(!row);

    // Still one extent: the overwrite landed in place.
    assert_eq!(meta.file(ino).keys.len(), 1);

    let mut buf = vec![0u8; 2048];
    client.read(ino, &mut buf, 0, 2048).await.unwrap();
    assert_eq!(&buf[512..1024], &patch[..]);
}

#[tokio::test]
async fn test_truncate_and_read_past_eof() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(2);
    let client = new_client(&meta, &cluster).await;
    let ino = 11;

    client.open_stream(ino, false, false).await.unwrap();
    client
        .write(ino, 0, &pattern(2048, 4), false, false)
        .await
        .unwrap();

    client.truncate(ino, 1000).await.unwrap();

    let (size, _, valid) = client.file_size(ino).await;
    assert!(valid);
    assert_eq!(size, 1000);

    // Read past the new end returns nothing.
    let mut buf = vec![0u8; 128];
    let (read, has_hole) = client.read(ino, &mut buf, 1000, 128).await.unwrap();
    assert_eq!(read, 0);
    assert!(!has_hole);

    // A full read is clamped to the truncated size.
    let mut buf = vec![0u8; 2048];
    let (read, _) = client.read(ino, &mut buf, 0, 2048).await.unwrap();
    assert_eq!(read, 1000);
}

#[tokio::test]
async fn test_zero_sized_ops_are_noops() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(1);
    let client = new_client(&meta, &cluster).await;
    let ino = 3;

    client.open_stream(ino, false, false).await.unwrap();

    let (written, row) = client.write(ino, 0, &[], false, false).await.unwrap();
    assert_eq!((written, row), (0, false));

    let mut buf = [0u8; 0];
    let (read, has_hole) = client.read(ino, &mut buf, 0, 0).await.unwrap();
    assert_eq!((read, has_hole), (0, false));

    // Nothing touched the metadata service.
    assert_eq!(meta.file(ino).keys.len(), 0);
}

#[tokio::test]
async fn test_ops_without_open_stream() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(1);
    let client = new_client(&meta, &cluster).await;

    let err = client.write(5, 0, b"x", false, false).await.unwrap_err();
    assert!(matches!(err, ClientError::StreamNotOpen(5)));

    let mut buf = [0u8; 1];
    let err = client.read(5, &mut buf, 0, 1).await.unwrap_err();
    assert!(matches!(err, ClientError::StreamNotOpen(5)));

    let (_, _, valid) = client.file_size(5).await;
    assert!(!valid);

    // Close/evict of an unknown stream are fine.
    client.close_stream(5).await.unwrap();
    client.evict_stream(5).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_opens_share_one_streamer() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(1);
    let client = new_client(&meta, &cluster).await;
    let ino = 77;

    let opens = (0..10).map(|_| {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.open_stream(ino, false, false).await })
    });
    for result in join_all(opens).await {
        result.unwrap().unwrap();
    }
    assert_eq!(client.streamer_count().await, 1);

    // Ten releases bring the handle count to zero and the worker exits.
    for _ in 0..10 {
        client.close_stream(ino).await.unwrap();
    }
    client.evict_stream(ino).await.unwrap();
    assert_eq!(client.streamer_count().await, 0);
}

#[tokio::test]
async fn test_evict_then_reopen_builds_fresh_streamer() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(2);
    let client = new_client(&meta, &cluster).await;
    let ino = 12;

    client.open_stream(ino, false, false).await.unwrap();
    client
        .write(ino, 0, &pattern(1024, 8), false, false)
        .await
        .unwrap();
    client.evict_stream(ino).await.unwrap();
    assert_eq!(client.streamer_count().await, 0);

    client.open_stream(ino, false, false).await.unwrap();
    let mut buf = vec![0u8; 1024];
    let (read, _) = client.read(ino, &mut buf, 0, 1024).await.unwrap();
    assert_eq!(read, 1024);
    assert_eq!(buf, pattern(1024, 8));
}

#[tokio::test]
async fn test_file_size_tracks_generation() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(1);
    let client = new_client(&meta, &cluster).await;
    let ino = 21;

    client.open_stream(ino, false, false).await.unwrap();
    client.write(ino, 0, &pattern(512, 1), false, false).await.unwrap();
    let (size_a, gen_a, _) = client.file_size(ino).await;
    assert_eq!(size_a, 512);

    client.write(ino, 512, &pattern(512, 2), false, false).await.unwrap();
    let (size_b, gen_b, _) = client.file_size(ino).await;
    assert_eq!(size_b, 1024);
    assert!(gen_b > gen_a);
}

#[tokio::test]
async fn test_rate_control_surface() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(1);
    let client = new_client(&meta, &cluster).await;

    assert_eq!(client.set_write_rate(1048576).await, "1048576");
    assert_eq!(client.set_read_rate(0).await, "unlimited");
    assert_eq!(client.get_rate().await, "read: unlimited\nwrite: 1048576\n");

    assert_eq!(client.set_write_rate(-1).await, "unlimited");
    assert_eq!(client.get_rate().await, "read: unlimited\nwrite: unlimited\n");
}

#[tokio::test]
async fn test_refresh_extents_cache_sees_external_growth() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(2);
    let client = new_client(&meta, &cluster).await;
    let ino = 30;

    cluster.seed_extent(1, 100, pattern(1024, 6));
    meta.seed_file(ino, 1024, vec![key(1, 100, 0, 1024)]);

    client.open_stream(ino, false, false).await.unwrap();
    let mut buf = vec![0u8; 1024];
    client.read(ino, &mut buf, 0, 1024).await.unwrap();

    // Another client appended out of band.
    cluster.seed_extent(2, 200, pattern(512, 9));
    meta.seed_file(
        ino,
        1536,
        vec![key(1, 100, 0, 1024), key(2, 200, 1024, 512)],
    );

    client.refresh_extents_cache(ino).await.unwrap();
    let (size, _, valid) = client.file_size(ino).await;
    assert!(valid);
    assert_eq!(size, 1536);
}

#[tokio::test]
async fn test_sync_write_returns_uncached_key() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(2);
    let client = new_client(&meta, &cluster).await;
    let ino = 50;

    client.open_stream(ino, false, false).await.unwrap();

    let data = pattern(2048, 11);
    let (dp, written, new_key) = client.sync_write(ino, 0, &data).await.unwrap();
    assert_eq!(written, 2048);
    assert_eq!(new_key.file_offset, 0);
    assert_eq!(new_key.size, 2048);
    assert_eq!(dp.partition_id, new_key.partition_id);

    // The data is on the extent, but neither the cache nor the metadata
    // service knows the key: that is the caller's job.
    assert_eq!(
        cluster.extent_data(new_key.partition_id, new_key.extent_id),
        Some(data.clone())
    );
    let (size, _, _) = client.file_size(ino).await;
    assert_eq!(size, 0);
    assert!(meta.file(ino).keys.is_empty());

    // Appending to the same extent through the explicit-extent path.
    let more = pattern(512, 12);
    let appended = client
        .sync_write_to_specific_extent(&dp, ino, 2048, 2048, &more, new_key.extent_id)
        .await
        .unwrap();
    assert_eq!(appended, 512);
    let stored = cluster
        .extent_data(new_key.partition_id, new_key.extent_id)
        .unwrap();
    assert_eq!(&stored[2048..], &more[..]);
}

#[tokio::test]
async fn test_sparse_write_past_eof_leaves_hole() {
    let meta = MemMetaStore::new();
    let cluster = MemCluster::new(2);
    let client = new_client(&meta, &cluster).await;
    let ino = 60;

    client.open_stream(ino, false, false).await.unwrap();
    client.write(ino, 0, &pattern(512, 1), false, false).await.unwrap();
    // Leave [512, 4096) unwritten.
    client
        .write(ino, 4096, &pattern(512, 2), false, false)
        .await
        .unwrap();

    let (size, _, _) = client.file_size(ino).await;
    assert_eq!(size, 4608);

    let mut buf = vec![0xaau8; 4608];
    let (read, has_hole) = client.read(ino, &mut buf, 0, 4608).await.unwrap();
    assert_eq!(read, 4608);
    assert!(has_hole);
    assert_eq!(&buf[512..4096], &vec![0u8; 3584][..]);
    assert_eq!(&buf[4096..], &pattern(512, 2)[..]);
}
