// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end engine scenarios over one- and two-node clusters with a
//! directory-backed object store.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use falcon_storage::backend::localfs::LocalFs;
use falcon_storage::backend::BlobBackend;
use falcon_storage::buffer::open_instance::OpenInstance;
use falcon_storage::fd_table::FalconFd;
use falcon_storage::server::RemoteIoServer;
use falcon_storage::store::{FalconStore, StoreOptions};
use falcon_storage::{StatFsBuf, INVALID_FD};
use falcon_utils::config::FalconConfig;
use falcon_utils::stats::FalconStats;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn node_config(root: &Path, node_id: u32, view: &[String], block: u32, big: u32, persist: bool) -> FalconConfig {
    FalconConfig::from_value(&json!({
        "falcon_cache_root": root.to_str().unwrap(),
        "falcon_dir_num": 10,
        "falcon_block_size": block,
        "falcon_read_big_file_size": big,
        "falcon_preblock_num": 16,
        "falcon_thread_num": 4,
        "falcon_node_id": node_id,
        "falcon_cluster_view": view,
        "falcon_persist": persist,
        "falcon_eviction": 0.95,
    }))
    .unwrap()
}

struct TestNode {
    server: RemoteIoServer,
    store: Arc<FalconStore>,
    fd_table: Arc<FalconFd>,
    _cache_dir: TempDir,
}

/// Start `n` peer servers, then the engines behind them, sharing one blob
/// backend when given.
fn start_cluster(
    n: usize,
    block: u32,
    big: u32,
    backend: Option<Arc<dyn BlobBackend>>,
) -> Vec<TestNode> {
    let view: Vec<String> = (0..n)
        .map(|_| format!("127.0.0.1:{}", free_port()))
        .collect();

    let servers: Vec<RemoteIoServer> = view
        .iter()
        .map(|endpoint| {
            let server = RemoteIoServer::new(endpoint);
            server.start().unwrap();
            server
        })
        .collect();

    servers
        .into_iter()
        .enumerate()
        .map(|(i, server)| {
            let cache_dir = TempDir::new().unwrap();
            let config = node_config(
                cache_dir.path(),
                i as u32,
                &view,
                block,
                big,
                backend.is_some(),
            );
            let fd_table = FalconFd::new();
            let options = StoreOptions {
                backend: backend.clone(),
                ..Default::default()
            };
            let store =
                FalconStore::new(&config, fd_table.clone(), FalconStats::new(), options).unwrap();
            server.set_ready(store.clone());
            TestNode {
                server,
                store,
                fd_table,
                _cache_dir: cache_dir,
            }
        })
        .collect()
}

fn new_instance(
    node: &TestNode,
    inode: u64,
    node_id: i32,
    path: &str,
    oflags: i32,
    size: u64,
) -> Arc<OpenInstance> {
    let inst = node.fd_table.wait_new_instance(false).unwrap();
    inst.inode_id.store(inode, Ordering::SeqCst);
    inst.node_id.store(node_id, Ordering::SeqCst);
    *inst.path.write().unwrap() = path.to_string();
    inst.oflags.store(oflags, Ordering::SeqCst);
    inst.original_size.store(size, Ordering::SeqCst);
    inst.current_size.store(size, Ordering::SeqCst);
    inst
}

fn write_close(node: &TestNode, inst: &Arc<OpenInstance>, data: &[u8]) {
    assert_eq!(node.store.write_file(inst, data, 0), 0);
    assert_eq!(node.store.close_tmp_files(inst, true, true), 0);
    assert_eq!(node.store.close_tmp_files(inst, false, true), 0);
}

#[test]
fn test_create_write_read_close_local_large() {
    let cluster = start_cluster(2, 1 << 20, 4 << 20, None);
    let node = &cluster[0];
    let data = pattern(8 << 20);

    let inst = new_instance(node, 100, 0, "/a", libc::O_WRONLY | libc::O_CREAT, 0);
    assert_eq!(node.store.write_file(&inst, &data, 0), 0);
    assert_eq!(inst.current_size(), 8 << 20);
    assert_eq!(node.store.close_tmp_files(&inst, true, false), 0);
    assert_eq!(node.store.close_tmp_files(&inst, false, false), 0);

    // Cache entry (inode, 8 MiB, refs = 0) after the release.
    let entry = node.store.cache().entry(100).unwrap();
    assert_eq!(entry.size, 8 << 20);
    assert_eq!(entry.refs, 0);
    assert_eq!(node.store.cache().used_capacity(), 8 << 20);

    let inst = new_instance(node, 100, 0, "/a", libc::O_RDONLY, 8 << 20);
    let mut buf = vec![0u8; 4 << 20];
    let n = node.store.read_file(&inst, &mut buf, 0);
    assert_eq!(n, 4 << 20);
    assert_eq!(buf, data[..4 << 20]);

    let n = node.store.read_file(&inst, &mut buf, 4 << 20);
    assert_eq!(n, 4 << 20);
    assert_eq!(buf, data[4 << 20..]);

    // Read at offset == current_size returns zero bytes.
    let mut one = [0u8; 1];
    assert_eq!(node.store.read_file(&inst, &mut one, 8 << 20), 0);

    // A read spanning end-of-file returns only the in-range bytes.
    let mut tail = vec![0u8; 1 << 20];
    let n = node.store.read_file(&inst, &mut tail, (8 << 20) - (1 << 19));
    assert_eq!(n, 1 << 19);
    assert_eq!(tail[..1 << 19], data[(8 << 20) - (1 << 19)..]);

    assert_eq!(node.store.close_tmp_files(&inst, true, false), 0);
    assert_eq!(node.store.close_tmp_files(&inst, false, false), 0);
}

#[test]
fn test_zero_length_write_is_noop() {
    let cluster = start_cluster(1, 1 << 20, 4 << 20, None);
    let node = &cluster[0];
    let inst = new_instance(node, 7, 0, "/empty", libc::O_WRONLY | libc::O_CREAT, 0);
    assert_eq!(node.store.write_file(&inst, &[], 0), 0);
    assert_eq!(inst.current_size(), 0);
    assert_eq!(node.store.close_tmp_files(&inst, true, false), 0);
    assert_eq!(node.store.close_tmp_files(&inst, false, false), 0);
    assert_eq!(node.store.cache().entry(7).unwrap().size, 0);
}

#[test]
fn test_buffered_write_visible_to_read() {
    let cluster = start_cluster(1, 1 << 20, 4 << 20, None);
    let node = &cluster[0];
    let data = pattern(64 << 10);

    let inst = new_instance(node, 8, 0, "/visible", libc::O_RDWR | libc::O_CREAT, 0);
    // Sequential small writes coalesce in the serial buffer.
    for (i, chunk) in data.chunks(4096).enumerate() {
        assert_eq!(node.store.write_file(&inst, chunk, (i * 4096) as i64), 0);
    }
    assert!(inst.write_stream.buffered() > 0);

    // The read path drains the buffer first, making the bytes visible.
    let mut buf = vec![0u8; 64 << 10];
    let n = node.store.read_file(&inst, &mut buf, 0);
    assert_eq!(n, (64 << 10) as i64);
    assert_eq!(buf, data);

    assert_eq!(node.store.close_tmp_files(&inst, true, false), 0);
    assert_eq!(node.store.close_tmp_files(&inst, false, false), 0);
}

#[test]
fn test_peer_write_and_pipelined_read() {
    // Small block and big-file threshold so a 1 MiB body is "large" and
    // streams through the prefetch pipes.
    let cluster = start_cluster(2, 256 << 10, 64 << 10, None);
    let client_node = &cluster[0];
    let data = pattern(1 << 20);

    let inst = new_instance(
        client_node,
        200,
        1,
        "/remote",
        libc::O_WRONLY | libc::O_CREAT,
        0,
    );
    assert_eq!(client_node.store.write_file(&inst, &data, 0), 0);
    assert_eq!(client_node.store.close_tmp_files(&inst, true, true), 0);
    assert_eq!(client_node.store.close_tmp_files(&inst, false, true), 0);

    // The body landed in the peer's cache, not ours.
    assert!(cluster[1].store.cache().entry(200).is_some());
    assert!(client_node.store.cache().entry(200).is_none());

    let inst = new_instance(client_node, 200, 1, "/remote", libc::O_RDONLY, 1 << 20);
    let mut out = Vec::new();
    let mut buf = vec![0u8; 100 << 10];
    loop {
        let n = client_node
            .store
            .read_file(&inst, &mut buf, out.len() as i64);
        assert!(n >= 0, "read failed: {}", n);
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
    assert_eq!(out, data);
    // The remote body streamed through the prefetch ring.
    assert!(inst.pre_read_started.load(Ordering::SeqCst));

    assert_eq!(client_node.store.close_tmp_files(&inst, true, false), 0);
    assert_eq!(client_node.store.close_tmp_files(&inst, false, false), 0);
}

#[test]
fn test_seek_kills_prefetch_and_falls_back() {
    let cluster = start_cluster(2, 64 << 10, 64 << 10, None);
    let client_node = &cluster[0];
    let data = pattern(256 << 10);

    let inst = new_instance(
        client_node,
        300,
        1,
        "/seeky",
        libc::O_WRONLY | libc::O_CREAT,
        0,
    );
    write_close(client_node, &inst, &data);

    let inst = new_instance(client_node, 300, 1, "/seeky", libc::O_RDONLY, 256 << 10);
    let mut buf = vec![0u8; 64 << 10];
    assert_eq!(client_node.store.read_file(&inst, &mut buf, 0), (64 << 10) as i64);
    assert_eq!(
        client_node.store.read_file(&inst, &mut buf, 64 << 10),
        (64 << 10) as i64
    );
    assert!(!inst.direct_read_file.load(Ordering::SeqCst));

    // Re-reading offset 0 is a seek: the pipeline dies for this instance
    // and the read is served directly.
    let n = client_node.store.read_file(&inst, &mut buf, 0);
    assert_eq!(n, (64 << 10) as i64);
    assert_eq!(buf, data[..64 << 10]);
    assert!(inst.direct_read_file.load(Ordering::SeqCst));

    // Later reads stay correct on the direct path.
    let n = client_node.store.read_file(&inst, &mut buf, 128 << 10);
    assert_eq!(n, (64 << 10) as i64);
    assert_eq!(buf, data[128 << 10..192 << 10]);

    assert_eq!(client_node.store.close_tmp_files(&inst, true, false), 0);
    assert_eq!(client_node.store.close_tmp_files(&inst, false, false), 0);
}

#[test]
fn test_peer_miss_without_persistence_is_enoent() {
    let cluster = start_cluster(2, 64 << 10, 64 << 10, None);
    let client_node = &cluster[0];
    let data = pattern(128 << 10);

    let inst = new_instance(
        client_node,
        400,
        1,
        "/gone",
        libc::O_WRONLY | libc::O_CREAT,
        0,
    );
    write_close(client_node, &inst, &data);

    // Evict the body on the owner, e.g. by an external cleaner.
    assert_eq!(cluster[1].store.cache().delete(400), 0);

    let inst = new_instance(client_node, 400, 1, "/gone", libc::O_RDONLY, 128 << 10);
    let ret = client_node.store.open_file(&inst);
    assert_eq!(ret, -libc::ENOENT);
}

struct CountingBackend {
    inner: Arc<LocalFs>,
    reads: AtomicUsize,
}

impl CountingBackend {
    fn new(inner: Arc<LocalFs>) -> Arc<Self> {
        Arc::new(CountingBackend {
            inner,
            reads: AtomicUsize::new(0),
        })
    }
}

impl BlobBackend for CountingBackend {
    fn read_object(
        &self,
        key: &str,
        offset: u64,
        size: u64,
        fd: Option<RawFd>,
        buf: Option<&mut [u8]>,
    ) -> std::io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_object(key, offset, size, fd, buf)
    }

    fn put_file(&self, key: &str, path: &Path) -> std::io::Result<()> {
        self.inner.put_file(key, path)
    }

    fn put_buffer(&self, key: &str, buf: &[u8], offset: u64) -> std::io::Result<()> {
        self.inner.put_buffer(key, buf, offset)
    }

    fn delete_object(&self, key: &str) -> std::io::Result<()> {
        self.inner.delete_object(key)
    }

    fn copy_object(&self, src: &str, dst: &str) -> std::io::Result<()> {
        self.inner.copy_object(src, dst)
    }

    fn stat_fs(&self) -> std::io::Result<StatFsBuf> {
        self.inner.stat_fs()
    }
}

#[test]
fn test_single_flight_blob_download() {
    let blob_dir = TempDir::new().unwrap();
    let localfs = LocalFs::with_root(blob_dir.path(), FalconStats::new()).unwrap();
    let body = pattern(10 << 20);
    localfs.put_buffer("x", &body, 0).unwrap();
    let backend = CountingBackend::new(localfs);

    let cluster = start_cluster(1, 1 << 20, 64 << 10, Some(backend.clone()));
    let node = &cluster[0];

    // Two concurrent write-opens of an uncached 10 MiB file.
    let insts: Vec<_> = (0..2)
        .map(|_| new_instance(node, 500, 0, "/x", libc::O_RDWR, 10 << 20))
        .collect();
    let handles: Vec<_> = insts
        .iter()
        .map(|inst| {
            let store = node.store.clone();
            let inst = inst.clone();
            std::thread::spawn(move || store.open_file(&inst))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 0);
    }

    // Exactly one ranged get populated the cache; both opens see it.
    assert_eq!(backend.reads.load(Ordering::SeqCst), 1);
    let entry = node.store.cache().entry(500).unwrap();
    assert_eq!(entry.size, 10 << 20);
    assert_eq!(entry.refs, 2);
    assert_eq!(
        std::fs::read(node.store.cache().file_path(500)).unwrap(),
        body
    );

    for inst in &insts {
        assert_eq!(node.store.close_tmp_files(inst, true, false), 0);
        assert_eq!(node.store.close_tmp_files(inst, false, false), 0);
    }
}

#[test]
fn test_small_file_fast_path_from_object_store() {
    let blob_dir = TempDir::new().unwrap();
    let localfs = LocalFs::with_root(blob_dir.path(), FalconStats::new()).unwrap();
    let body = pattern(3 << 10);
    localfs.put_buffer("small", &body, 0).unwrap();

    let cluster = start_cluster(1, 1 << 20, 64 << 10, Some(localfs as Arc<dyn BlobBackend>));
    let node = &cluster[0];

    // 3 KiB < 64 KiB: read-only open slurps the body before returning.
    let inst = new_instance(node, 600, 0, "/small", libc::O_RDONLY, 3 << 10);
    *inst.read_buffer.write().unwrap() = vec![0u8; 3 << 10];
    assert_eq!(node.store.read_small_files(&inst), 0);

    let mut buf = vec![0u8; 3 << 10];
    let n = node.store.read_file(&inst, &mut buf, 0);
    assert_eq!(n, (3 << 10) as i64);
    assert_eq!(buf, body);
    // No prefetch pipeline spawned for the in-memory body.
    assert!(!inst.pre_read_started.load(Ordering::SeqCst));

    // The async cache populate lands eventually.
    let deadline = Instant::now() + Duration::from_secs(5);
    while node.store.cache().entry(600).is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(node.store.cache().entry(600).unwrap().size, (3 << 10) as u64);
}

#[test]
fn test_flush_persists_to_object_store() {
    let blob_dir = TempDir::new().unwrap();
    let localfs = LocalFs::with_root(blob_dir.path(), FalconStats::new()).unwrap();
    let backend: Arc<dyn BlobBackend> = localfs.clone();

    let cluster = start_cluster(1, 1 << 20, 64 << 10, Some(backend));
    let node = &cluster[0];
    let data = pattern(512 << 10);

    let inst = new_instance(node, 700, 0, "/persisted", libc::O_WRONLY | libc::O_CREAT, 0);
    write_close(node, &inst, &data);

    // After close(flush) the object matches the final cache file.
    let mut object = vec![0u8; data.len()];
    let n = localfs
        .read_object("persisted", 0, 0, None, Some(object.as_mut_slice()))
        .unwrap();
    assert_eq!(n, data.len());
    assert_eq!(object, data);
}

#[test]
fn test_unlink_semantics() {
    let cluster = start_cluster(1, 1 << 20, 4 << 20, None);
    let node = &cluster[0];
    let data = pattern(4096);

    let inst = new_instance(node, 800, 0, "/del", libc::O_WRONLY | libc::O_CREAT, 0);
    write_close(node, &inst, &data);
    assert!(node.store.cache().entry(800).is_some());

    assert_eq!(node.store.delete_files(800, 0, "/del"), 0);
    assert!(node.store.cache().entry(800).is_none());
    assert!(!node.store.cache().file_path(800).exists());

    // Absent cache and no durable tier propagates ENOENT.
    assert_eq!(node.store.delete_files(801, 0, "/never"), -libc::ENOENT);
}

#[test]
fn test_statfs_reports_capacity() {
    let cluster = start_cluster(2, 1 << 20, 4 << 20, None);
    let usage = cluster[0].store.stat_fs().unwrap();
    assert!(usage.f_blocks > 0);
    assert!(usage.f_bfree <= usage.f_blocks);
}

#[test]
fn test_truncate_local_file() {
    let cluster = start_cluster(1, 1 << 20, 4 << 20, None);
    let node = &cluster[0];
    let data = pattern(64 << 10);

    let inst = new_instance(node, 900, 0, "/trunc", libc::O_RDWR | libc::O_CREAT, 0);
    assert_eq!(node.store.write_file(&inst, &data, 0), 0);
    assert_eq!(node.store.truncate_open_instance(&inst, 4096), 0);
    assert_eq!(node.store.truncate_file(&inst, 4096), 0);
    assert_eq!(inst.current_size(), 4096);
    assert_eq!(inst.original_size(), 4096);

    assert_eq!(node.store.close_tmp_files(&inst, true, false), 0);
    assert_eq!(node.store.close_tmp_files(&inst, false, false), 0);
    let meta = std::fs::metadata(node.store.cache().file_path(900)).unwrap();
    assert_eq!(meta.len(), 4096);
}

#[test]
fn test_stat_cluster_roundtrip() {
    let cluster = start_cluster(2, 1 << 20, 4 << 20, None);
    let snapshot = cluster[0].store.stat_cluster(-1, true);
    assert_eq!(snapshot.len(), falcon_utils::stats::STATS_END);
}

#[test]
fn test_open_never_returns_invalid_fd_state() {
    let cluster = start_cluster(1, 1 << 20, 4 << 20, None);
    let node = &cluster[0];
    let inst = new_instance(node, 1000, 0, "/new", libc::O_WRONLY | libc::O_CREAT, 0);
    assert_eq!(node.store.open_file(&inst), 0);
    assert_ne!(inst.physical_fd(), INVALID_FD);
    assert_eq!(node.store.close_tmp_files(&inst, true, false), 0);
    assert_eq!(node.store.close_tmp_files(&inst, false, false), 0);
}
