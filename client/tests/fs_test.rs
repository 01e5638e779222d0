// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Surface-level scenarios against an in-process metadata service and a
//! single-node storage cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tonic::{Request, Response, Status};

use falcon_client::connection::{ServerIdentifier, FILE_NOT_EXISTS, SUCCESS};
use falcon_client::router::Router;
use falcon_client::FalconFs;
use falcon_protocols::meta::meta_service_server::{MetaService, MetaServiceServer};
use falcon_protocols::meta::{
    Attr, AttrReply, ChmodRequest, ChownRequest, CloseRequest, CommonReply, OpenDirReply,
    PathRequest, ReadDirReply, ReadDirRequest, RenameRequest, ShardEntry, ShardTableReply,
    ShardTableRequest, UnlinkReply, UtimeNsRequest,
};
use falcon_storage::fd_table::FalconFd;
use falcon_storage::server::RemoteIoServer;
use falcon_storage::store::{FalconStore, StoreOptions};
use falcon_utils::config::FalconConfig;
use falcon_utils::stats::FalconStats;

const FILE_EXISTS_CODE: i32 = 17;

#[derive(Clone, Default)]
struct Entry {
    inode: u64,
    size: i64,
    node_id: i32,
    mode: u32,
}

#[derive(Clone)]
struct MockMeta {
    host: String,
    port: u16,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_inode: Arc<AtomicU64>,
}

impl MockMeta {
    fn new(host: &str, port: u16) -> Self {
        MockMeta {
            host: host.to_string(),
            port,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_inode: Arc::new(AtomicU64::new(1)),
        }
    }

    fn attr_reply(&self, entry: &Entry) -> AttrReply {
        AttrReply {
            error_code: SUCCESS,
            read_point: 42,
            attr: Some(Attr {
                st_ino: entry.inode,
                st_mode: entry.mode,
                st_nlink: 1,
                st_size: entry.size,
                ..Default::default()
            }),
            node_id: entry.node_id,
        }
    }
}

#[tonic::async_trait]
impl MetaService for MockMeta {
    async fn mkdir(&self, request: Request<PathRequest>) -> Result<Response<CommonReply>, Status> {
        let path = request.into_inner().path;
        let mut entries = self.entries.lock().unwrap();
        let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
        entries.insert(
            path,
            Entry {
                inode,
                size: 0,
                node_id: 0,
                mode: libc::S_IFDIR | 0o755,
            },
        );
        Ok(Response::new(CommonReply {
            error_code: SUCCESS,
            read_point: 42,
        }))
    }

    async fn create(&self, request: Request<PathRequest>) -> Result<Response<AttrReply>, Status> {
        let path = request.into_inner().path;
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(&path) {
            let mut reply = self.attr_reply(entry);
            reply.error_code = FILE_EXISTS_CODE;
            return Ok(Response::new(reply));
        }
        let entry = Entry {
            inode: self.next_inode.fetch_add(1, Ordering::SeqCst),
            size: 0,
            node_id: 0,
            mode: libc::S_IFREG | 0o644,
        };
        let reply = self.attr_reply(&entry);
        entries.insert(path, entry);
        Ok(Response::new(reply))
    }

    async fn stat(&self, request: Request<PathRequest>) -> Result<Response<AttrReply>, Status> {
        let path = request.into_inner().path;
        let entries = self.entries.lock().unwrap();
        match entries.get(&path) {
            Some(entry) => Ok(Response::new(self.attr_reply(entry))),
            None => Ok(Response::new(AttrReply {
                error_code: FILE_NOT_EXISTS,
                ..Default::default()
            })),
        }
    }

    async fn open(&self, request: Request<PathRequest>) -> Result<Response<AttrReply>, Status> {
        self.stat(request).await
    }

    async fn close(&self, request: Request<CloseRequest>) -> Result<Response<CommonReply>, Status> {
        let req = request.into_inner();
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&req.path) {
            entry.size = req.size;
            entry.node_id = req.node_id;
        }
        Ok(Response::new(CommonReply {
            error_code: SUCCESS,
            read_point: 42,
        }))
    }

    async fn unlink(&self, request: Request<PathRequest>) -> Result<Response<UnlinkReply>, Status> {
        let path = request.into_inner().path;
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(&path) {
            Some(entry) => Ok(Response::new(UnlinkReply {
                error_code: SUCCESS,
                read_point: 42,
                st_ino: entry.inode,
                st_size: entry.size,
                node_id: entry.node_id,
            })),
            None => Ok(Response::new(UnlinkReply {
                error_code: FILE_NOT_EXISTS,
                ..Default::default()
            })),
        }
    }

    async fn open_dir(&self, request: Request<PathRequest>) -> Result<Response<OpenDirReply>, Status> {
        let path = request.into_inner().path;
        let entries = self.entries.lock().unwrap();
        let inode = entries.get(&path).map(|e| e.inode).unwrap_or(1);
        Ok(Response::new(OpenDirReply {
            error_code: SUCCESS,
            read_point: 42,
            st_ino: inode,
        }))
    }

    async fn read_dir(
        &self,
        request: Request<ReadDirRequest>,
    ) -> Result<Response<ReadDirReply>, Status> {
        let req = request.into_inner();
        let prefix = if req.path.ends_with('/') {
            req.path.clone()
        } else {
            format!("{}/", req.path)
        };
        let entries = self.entries.lock().unwrap();
        let mut names: Vec<(String, u32)> = entries
            .iter()
            .filter(|(path, _)| {
                path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
            })
            .map(|(path, entry)| (path[prefix.len()..].to_string(), entry.mode))
            .collect();
        names.sort();

        let start = if req.last_file_name.is_empty() {
            0
        } else {
            names
                .iter()
                .position(|(name, _)| name.as_str() > req.last_file_name.as_str())
                .unwrap_or(names.len())
        };
        let page: Vec<_> = names
            .into_iter()
            .skip(start)
            .take(req.max_read_count as usize)
            .collect();
        let last = page.last().map(|(name, _)| name.clone()).unwrap_or_default();
        Ok(Response::new(ReadDirReply {
            error_code: SUCCESS,
            read_point: 42,
            entries: page
                .into_iter()
                .map(|(name, mode)| falcon_protocols::meta::DirEntry {
                    name,
                    st_mode: mode,
                })
                .collect(),
            last_shard_index: 0,
            last_file_name: last,
        }))
    }

    async fn rmdir(&self, request: Request<PathRequest>) -> Result<Response<CommonReply>, Status> {
        let path = request.into_inner().path;
        self.entries.lock().unwrap().remove(&path);
        Ok(Response::new(CommonReply {
            error_code: SUCCESS,
            read_point: 42,
        }))
    }

    async fn rename(&self, request: Request<RenameRequest>) -> Result<Response<CommonReply>, Status> {
        let req = request.into_inner();
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(&req.src) {
            Some(entry) => {
                entries.insert(req.dst, entry);
                Ok(Response::new(CommonReply {
                    error_code: SUCCESS,
                    read_point: 42,
                }))
            }
            None => Ok(Response::new(CommonReply {
                error_code: FILE_NOT_EXISTS,
                read_point: 42,
            })),
        }
    }

    async fn utime_ns(
        &self,
        _request: Request<UtimeNsRequest>,
    ) -> Result<Response<CommonReply>, Status> {
        Ok(Response::new(CommonReply {
            error_code: SUCCESS,
            read_point: 42,
        }))
    }

    async fn chown(&self, _request: Request<ChownRequest>) -> Result<Response<CommonReply>, Status> {
        Ok(Response::new(CommonReply {
            error_code: SUCCESS,
            read_point: 42,
        }))
    }

    async fn chmod(&self, _request: Request<ChmodRequest>) -> Result<Response<CommonReply>, Status> {
        Ok(Response::new(CommonReply {
            error_code: SUCCESS,
            read_point: 42,
        }))
    }

    async fn fetch_shard_table(
        &self,
        _request: Request<ShardTableRequest>,
    ) -> Result<Response<ShardTableReply>, Status> {
        Ok(Response::new(ShardTableReply {
            error_code: SUCCESS,
            shards: vec![ShardEntry {
                min_hash_key: i32::MIN,
                max_hash_key: i32::MAX,
                host: self.host.clone(),
                port: self.port as i32,
                server_id: 1,
            }],
        }))
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn start_mock_meta() -> (MockMeta, u16) {
    let port = free_port();
    let meta = MockMeta::new("127.0.0.1", port);
    let service = meta.clone();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let addr = format!("127.0.0.1:{}", port).parse().unwrap();
            let _ = tonic::transport::Server::builder()
                .add_service(MetaServiceServer::new(service))
                .serve(addr)
                .await;
        });
    });
    // Wait for the listener to come up.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::net::TcpStream::connect(("127.0.0.1", port)).is_err() {
        assert!(std::time::Instant::now() < deadline, "mock meta did not start");
        std::thread::sleep(Duration::from_millis(20));
    }
    (meta, port)
}

struct Harness {
    fs: Arc<FalconFs>,
    _server: RemoteIoServer,
    _cache_dir: TempDir,
}

fn start_harness(fd_table: Arc<FalconFd>) -> Harness {
    let (_meta, meta_port) = start_mock_meta();

    let data_endpoint = format!("127.0.0.1:{}", free_port());
    let server = RemoteIoServer::new(&data_endpoint);
    server.start().unwrap();

    let cache_dir = TempDir::new().unwrap();
    let config = FalconConfig::from_value(&json!({
        "falcon_cache_root": cache_dir.path().to_str().unwrap(),
        "falcon_dir_num": 10,
        "falcon_block_size": 262144,
        "falcon_read_big_file_size": 65536,
        "falcon_preblock_num": 8,
        "falcon_thread_num": 4,
        "falcon_node_id": 0,
        "falcon_cluster_view": [data_endpoint],
        "falcon_persist": false,
        "falcon_eviction": 0.95,
    }))
    .unwrap();
    let store = FalconStore::new(
        &config,
        fd_table,
        FalconStats::new(),
        StoreOptions::default(),
    )
    .unwrap();
    server.set_ready(store.clone());

    let coordinator = ServerIdentifier::new("127.0.0.1", meta_port, -1);
    let router = Router::new(coordinator, None).unwrap();
    Harness {
        fs: FalconFs::new(router, store),
        _server: server,
        _cache_dir: cache_dir,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_create_write_close_reopen_read() {
    let harness = start_harness(FalconFd::new());
    let fs = &harness.fs;
    let data = pattern(128 << 10);

    let (fd, stat) = fs.create("/f", libc::O_WRONLY | libc::O_CREAT).unwrap();
    assert!(fd >= 3);
    assert_eq!(stat.st_size, 0);
    assert_eq!(fs.write(fd, &data, 0), 0);
    assert_eq!(fs.close("/f", fd, true, -1), SUCCESS);
    assert_eq!(fs.close("/f", fd, false, -1), SUCCESS);

    // The metadata close recorded the new size.
    let stat = fs.stat("/f").unwrap();
    assert_eq!(stat.st_size, (128 << 10) as i64);

    let (fd, stat) = fs.open("/f", libc::O_RDONLY).unwrap();
    assert_eq!(stat.st_size, (128 << 10) as i64);
    let mut buf = vec![0u8; 128 << 10];
    assert_eq!(fs.read(fd, &mut buf, 0), (128 << 10) as i64);
    assert_eq!(buf, data);
    assert_eq!(fs.close("/f", fd, true, -1), SUCCESS);
    assert_eq!(fs.close("/f", fd, false, -1), SUCCESS);
}

#[test]
fn test_small_file_served_from_memory() {
    let harness = start_harness(FalconFd::new());
    let fs = &harness.fs;
    let data = pattern(3 << 10);

    let (fd, _) = fs.create("/small", libc::O_WRONLY | libc::O_CREAT).unwrap();
    assert_eq!(fs.write(fd, &data, 0), 0);
    assert_eq!(fs.close("/small", fd, true, -1), SUCCESS);
    assert_eq!(fs.close("/small", fd, false, -1), SUCCESS);

    // 3 KiB < 64 KiB threshold: the open slurps the body eagerly.
    let (fd, _) = fs.open("/small", libc::O_RDONLY).unwrap();
    let inst = fs.store().fd_table().get(fd).unwrap();
    assert_eq!(inst.read_buffer.read().unwrap().len(), 3 << 10);
    assert!(!inst.pre_read_started.load(Ordering::SeqCst));

    let mut buf = vec![0u8; 3 << 10];
    assert_eq!(fs.read(fd, &mut buf, 0), (3 << 10) as i64);
    assert_eq!(buf, data);
    // Reads past the in-memory body return zero bytes.
    let mut one = [0u8; 1];
    assert_eq!(fs.read(fd, &mut one, (3 << 10) as i64), 0);

    assert_eq!(fs.close("/small", fd, true, -1), SUCCESS);
    assert_eq!(fs.close("/small", fd, false, -1), SUCCESS);
}

#[test]
fn test_exclusive_create_conflict() {
    let harness = start_harness(FalconFd::new());
    let fs = &harness.fs;
    let (fd, _) = fs.create("/dup", libc::O_WRONLY | libc::O_CREAT).unwrap();
    assert_eq!(fs.close("/dup", fd, true, -1), SUCCESS);
    assert_eq!(fs.close("/dup", fd, false, -1), SUCCESS);

    // Re-create without O_EXCL succeeds, with O_EXCL reports the conflict.
    let (fd, _) = fs.create("/dup", libc::O_WRONLY | libc::O_CREAT).unwrap();
    assert_eq!(fs.close("/dup", fd, true, -1), SUCCESS);
    assert_eq!(fs.close("/dup", fd, false, -1), SUCCESS);
    let err = fs
        .create("/dup", libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL)
        .unwrap_err();
    assert_eq!(err, FILE_EXISTS_CODE);
}

#[test]
fn test_unlink_removes_file_and_cache() {
    let harness = start_harness(FalconFd::new());
    let fs = &harness.fs;
    let data = pattern(8 << 10);

    let (fd, _) = fs.create("/doomed", libc::O_WRONLY | libc::O_CREAT).unwrap();
    assert_eq!(fs.write(fd, &data, 0), 0);
    assert_eq!(fs.close("/doomed", fd, true, -1), SUCCESS);
    assert_eq!(fs.close("/doomed", fd, false, -1), SUCCESS);
    let inode = fs.stat("/doomed").unwrap().st_ino;
    assert!(fs.store().cache().entry(inode).is_some());

    assert_eq!(fs.unlink("/doomed"), SUCCESS);
    assert!(fs.store().cache().entry(inode).is_none());
    assert_eq!(fs.stat("/doomed").unwrap_err(), FILE_NOT_EXISTS);
}

#[test]
fn test_readdir_lists_created_files() {
    let harness = start_harness(FalconFd::new());
    let fs = &harness.fs;

    assert_eq!(fs.mkdir("/dir"), SUCCESS);
    for name in ["a", "b", "c"] {
        let path = format!("/dir/{}", name);
        let (fd, _) = fs.create(&path, libc::O_WRONLY | libc::O_CREAT).unwrap();
        assert_eq!(fs.close(&path, fd, true, -1), SUCCESS);
        assert_eq!(fs.close(&path, fd, false, -1), SUCCESS);
    }

    let dir_fd = fs.opendir("/dir").unwrap();
    let entries = fs.readdir("/dir", dir_fd, 0).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    // The epoch is consumed; a follow-up read at the running offset is empty.
    assert!(fs.readdir("/dir", dir_fd, entries.len()).unwrap().is_empty());
    assert_eq!(fs.closedir(dir_fd), SUCCESS);
}

#[test]
fn test_truncate_updates_metadata_and_cache_file() {
    let harness = start_harness(FalconFd::new());
    let fs = &harness.fs;
    let data = pattern(8 << 10);

    let (fd, _) = fs.create("/t", libc::O_WRONLY | libc::O_CREAT).unwrap();
    assert_eq!(fs.write(fd, &data, 0), 0);
    assert_eq!(fs.close("/t", fd, true, -1), SUCCESS);
    assert_eq!(fs.close("/t", fd, false, -1), SUCCESS);

    assert_eq!(fs.truncate("/t", 1 << 10), SUCCESS);
    let stat = fs.stat("/t").unwrap();
    assert_eq!(stat.st_size, (1 << 10) as i64);
    let meta = std::fs::metadata(fs.store().cache().file_path(stat.st_ino)).unwrap();
    assert_eq!(meta.len(), 1 << 10);
}

#[test]
fn test_open_missing_file_reports_meta_code() {
    let harness = start_harness(FalconFd::new());
    let err = harness.fs.open("/missing", libc::O_RDONLY).unwrap_err();
    assert_eq!(err, FILE_NOT_EXISTS);
    // The failed open released its instance charge.
    assert_eq!(harness.fs.store().fd_table().active_count(), 0);
}

#[test]
fn test_instance_semaphore_saturation_surfaces_emfile() {
    let harness = start_harness(FalconFd::with_capacity(2));
    let fs = &harness.fs;

    let (fd1, _) = fs.create("/s1", libc::O_WRONLY | libc::O_CREAT).unwrap();
    let (fd2, _) = fs.create("/s2", libc::O_WRONLY | libc::O_CREAT).unwrap();

    let start = std::time::Instant::now();
    let err = fs.create("/s3", libc::O_WRONLY | libc::O_CREAT).unwrap_err();
    assert_eq!(err, -libc::EMFILE);
    assert!(start.elapsed() >= Duration::from_secs(3));

    assert_eq!(fs.close("/s1", fd1, true, -1), SUCCESS);
    assert_eq!(fs.close("/s1", fd1, false, -1), SUCCESS);
    let (fd3, _) = fs.create("/s3", libc::O_WRONLY | libc::O_CREAT).unwrap();
    assert_eq!(fs.close("/s3", fd3, true, -1), SUCCESS);
    assert_eq!(fs.close("/s3", fd3, false, -1), SUCCESS);
    assert_eq!(fs.close("/s2", fd2, true, -1), SUCCESS);
    assert_eq!(fs.close("/s2", fd2, false, -1), SUCCESS);
}

#[test]
fn test_rename_moves_metadata() {
    let harness = start_harness(FalconFd::new());
    let fs = &harness.fs;
    let (fd, _) = fs.create("/old", libc::O_WRONLY | libc::O_CREAT).unwrap();
    assert_eq!(fs.close("/old", fd, true, -1), SUCCESS);
    assert_eq!(fs.close("/old", fd, false, -1), SUCCESS);

    assert_eq!(fs.rename("/old", "/new"), SUCCESS);
    assert_eq!(fs.stat("/old").unwrap_err(), FILE_NOT_EXISTS);
    assert!(fs.stat("/new").is_ok());
}
