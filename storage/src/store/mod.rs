// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The storage engine core. Orchestrates the disk cache, the read/write
//! streams, the node roster and the blob store behind the per-open
//! instances; decides placement per file and falls back to the object tier
//! when a cache or peer path fails. Engine calls return 0 / byte counts or
//! negative errnos.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Result;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use falcon_utils::config::{parent_path_level, storage_threshold, FalconConfig};
use falcon_utils::stats::{FalconStats, StatItem};
use falcon_utils::thread_pool::ThreadPool;
use falcon_utils::{div_round_up, round_up_512};

use crate::backend::{new_backend, BlobBackend};
use crate::buffer::mem_pool::{AlignedBuf, MemPool};
use crate::buffer::open_instance::OpenInstance;
use crate::buffer::read_stream::PipeReader;
use crate::cache::DiskCache;
use crate::fd_table::FalconFd;
use crate::lock::{FileLockTable, LockMode, OwnedFileLocker};
use crate::node::{MembershipSource, StoreNode};
use crate::{
    object_key, StatFsBuf, INVALID_FD, RPC_RETRY_DELAY_SECS, RPC_RETRY_NUM, STREAM_MAX_SIZE,
};

const THREAD_POOL_QUEUE_CAP: usize = 100_000;
const WRITE_POOL_BLOCKS: usize = 500;

struct StoreParams {
    root: PathBuf,
    dir_num: u32,
    block_size: u32,
    big_file_read_size: u32,
    async_upload: bool,
    persist: bool,
    to_local: bool,
    is_inference: bool,
    parent_path_level: i32,
}

pub struct StoreOptions {
    /// Blob backend override; defaults to the `obs` backend from the
    /// environment when persistence is on.
    pub backend: Option<Arc<dyn BlobBackend>>,
    /// Cluster membership; `None` pins the roster to `falcon_cluster_view`.
    pub membership: Option<Arc<dyn MembershipSource>>,
    /// Endpoint advertised to the membership source.
    pub advertised: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            backend: None,
            membership: None,
            advertised: None,
        }
    }
}

pub struct FalconStore {
    params: StoreParams,
    cache: Arc<DiskCache>,
    mem_pool: Arc<MemPool>,
    write_pool: Arc<MemPool>,
    file_lock: Arc<FileLockTable>,
    fd_table: Arc<FalconFd>,
    node: Arc<StoreNode>,
    pool: ThreadPool,
    backend: Option<Arc<dyn BlobBackend>>,
    stats: Arc<FalconStats>,
    // Memoized parent-path placement used in inference mode.
    node_hash: Mutex<HashMap<String, i32>>,
}

impl FalconStore {
    pub fn new(
        config: &FalconConfig,
        fd_table: Arc<FalconFd>,
        stats: Arc<FalconStats>,
        options: StoreOptions,
    ) -> Result<Arc<Self>> {
        let root = PathBuf::from(config.get_string("falcon_cache_root"));
        if root.as_os_str().is_empty() {
            return Err(einval!("falcon_cache_root is not configured"));
        }
        std::fs::create_dir_all(&root)?;

        let persist = config.get_bool("falcon_persist");
        let dir_num = match config.get_u32("falcon_dir_num") {
            0 => 100,
            n => n,
        };
        let block_size = match config.get_u32("falcon_block_size") {
            0 => 1 << 20,
            n => n,
        };
        let big_file_read_size = match config.get_u32("falcon_read_big_file_size") {
            0 => 4 << 20,
            n => n,
        };
        let preblock_num = match config.get_u32("falcon_preblock_num") {
            0 => 128,
            n => n,
        };
        let thread_num = match config.get_u32("falcon_thread_num") {
            0 => 8,
            n => n,
        };

        let eviction = config.get_f64("falcon_eviction");
        let threshold = if eviction > 0.0 {
            eviction
        } else {
            storage_threshold(persist)
        };
        let (free_ratio, bg_free_ratio) = if threshold < 1.0 {
            // The background watermark can exceed 1.0 for tiny thresholds;
            // both are clamped into [0, 1].
            (
                (1.0 - threshold).clamp(0.0, 1.0),
                (1.1 - threshold).clamp(0.0, 1.0),
            )
        } else {
            (0.0, 0.0)
        };
        info!("falcon_cache root: {:?}", root);

        let backend = if persist {
            match options.backend {
                Some(backend) => Some(backend),
                None => Some(new_backend("obs", &HashMap::new(), stats.clone())?),
            }
        } else {
            None
        };

        let cache = DiskCache::new(&root, dir_num, free_ratio, bg_free_ratio);
        cache.start()?;

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("falcon_io_rt")
                .enable_all()
                .build()?,
        );
        let node = StoreNode::new(runtime);
        match &options.membership {
            Some(membership) => {
                let advertised = options
                    .advertised
                    .clone()
                    .or_else(falcon_utils::config::pod_endpoint)
                    .ok_or_else(|| einval!("no advertised endpoint for membership"))?;
                node.set_node_config_with_membership(&root, &advertised, membership.clone())?;
            }
            None => {
                let view = config.get_array("falcon_cluster_view");
                node.set_node_config(config.get_u32("falcon_node_id") as i32, &view)?;
            }
        }

        let pool = ThreadPool::new(thread_num, THREAD_POOL_QUEUE_CAP, "falcon_store")?;

        Ok(Arc::new(FalconStore {
            params: StoreParams {
                root,
                dir_num,
                block_size,
                big_file_read_size,
                async_upload: config.get_bool("falcon_async"),
                persist,
                to_local: config.get_bool("falcon_to_local"),
                is_inference: config.get_bool("falcon_is_inference"),
                parent_path_level: parent_path_level(),
            },
            cache,
            mem_pool: MemPool::new(block_size as usize, preblock_num as usize),
            write_pool: MemPool::new(STREAM_MAX_SIZE, WRITE_POOL_BLOCKS),
            file_lock: Arc::new(FileLockTable::new()),
            fd_table,
            node,
            pool,
            backend,
            stats,
            node_hash: Mutex::new(HashMap::new()),
        }))
    }

    pub fn fd_table(&self) -> &Arc<FalconFd> {
        &self.fd_table
    }

    pub fn node(&self) -> &Arc<StoreNode> {
        &self.node
    }

    pub fn stats(&self) -> &Arc<FalconStats> {
        &self.stats
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.cache
    }

    pub fn big_file_read_size(&self) -> u32 {
        self.params.big_file_read_size
    }

    pub fn persist(&self) -> bool {
        self.params.persist
    }

    pub fn root(&self) -> &PathBuf {
        &self.params.root
    }

    pub fn shutdown(&self) {
        self.pool.stop();
        self.node.stop();
        self.cache.stop();
    }

    /*---------------------- placement ----------------------*/

    fn path_to_node_id(&self, path: &str) -> i32 {
        let parent = parent_path(path, self.params.parent_path_level);
        if !parent.is_empty() {
            let mut node_hash = self.node_hash.lock().unwrap();
            return *node_hash
                .entry(parent.clone())
                .or_insert_with(|| self.node.alloc_node(djb2(&parent)));
        }
        self.node.alloc_node(djb2(&parent))
    }

    fn alloc_node_id(&self, inst: &OpenInstance) {
        if inst.node_id() != -1 {
            return;
        }
        if self.params.to_local && self.cache.has_free_space() {
            inst.node_id.store(self.node.node_id(), Ordering::SeqCst);
            return;
        }
        let id = if self.params.is_inference {
            self.path_to_node_id(&inst.path())
        } else {
            self.node.alloc_node(inst.inode_id())
        };
        inst.node_id.store(id, Ordering::SeqCst);
    }

    /*---------------------- write ----------------------*/

    pub fn write_file(&self, inst: &Arc<OpenInstance>, buf: &[u8], offset: i64) -> i32 {
        // A read stream is outdated once the file is written; discard it.
        if inst.pre_read_started.load(Ordering::SeqCst)
            && !inst.pre_read_stopped.swap(true, Ordering::SeqCst)
        {
            info!("write_file(): stopping the read stream");
            self.stop_pre_read(inst);
        }

        if !inst.is_opened.load(Ordering::SeqCst) {
            let _guard = inst.file_mutex.write().unwrap();
            let ret = self.open_file(inst);
            if ret != 0 {
                inst.write_fail.store(true, Ordering::SeqCst);
                return ret;
            }
            inst.is_opened.store(true, Ordering::SeqCst);
        }

        let ret = inst
            .write_stream
            .push(buf, offset, inst.current_size());
        if ret != 0 {
            error!("write_file(): push failed");
            inst.write_fail.store(true, Ordering::SeqCst);
            return ret;
        }
        inst.write_cnt.fetch_add(1, Ordering::SeqCst);

        if !buf.is_empty() {
            inst.grow_current_size(offset as u64 + buf.len() as u64);
        }
        0
    }

    /// Unbuffered write into the local cache file on behalf of a peer.
    pub fn write_local_for_peer(&self, inst: &Arc<OpenInstance>, buf: &[u8], offset: i64) -> i32 {
        let current = inst.current_size();
        let new_size = std::cmp::max(current, offset as u64 + buf.len() as u64);
        let size_to_add = new_size - current;
        let fd = inst.physical_fd() as RawFd;

        if !self.cache.pre_alloc(size_to_add) {
            error!("write_local_for_peer(): cannot pre-allocate space");
            return -libc::ENOSPC;
        }

        let ret = if inst.is_direct() {
            match AlignedBuf::new(round_up_512(buf.len())) {
                Some(mut aligned) => {
                    aligned[..buf.len()].copy_from_slice(buf);
                    nix::sys::uio::pwrite(fd, &aligned[..buf.len()], offset as libc::off_t)
                }
                None => {
                    self.cache.free_pre_alloc(size_to_add);
                    return -libc::ENOMEM;
                }
            }
        } else {
            nix::sys::uio::pwrite(fd, buf, offset as libc::off_t)
        };

        match ret {
            Err(errno) => {
                error!("write_local_for_peer(): pwrite failed: {}", errno);
                self.cache.free_pre_alloc(size_to_add);
                -(errno as i32)
            }
            Ok(_) => {
                self.stats.add(StatItem::BlockcacheWrite, buf.len() as u64);
                inst.current_size.store(new_size, Ordering::SeqCst);
                if !self.cache.update(inst.inode_id(), new_size) {
                    error!("write_local_for_peer(): cache update failed");
                    self.cache.free_pre_alloc(size_to_add);
                    return -libc::ENOENT;
                }
                self.cache.free_pre_alloc(size_to_add);
                0
            }
        }
    }

    /*---------------------- read ----------------------*/

    pub fn read_file(
        self: &Arc<Self>,
        inst: &Arc<OpenInstance>,
        buf: &mut [u8],
        offset: i64,
    ) -> i64 {
        // Let buffered writes become visible before reading.
        if inst.write_stream.buffered() > 0 {
            info!("read_file(): persisting buffered writes");
            let ret = inst.write_stream.complete(inst.current_size(), true, false);
            if ret != 0 {
                error!("read_file(): persisting before read failed");
                return ret as i64;
            }
        }

        if inst.original_size() >= self.params.big_file_read_size as u64 || !inst.is_rdonly() {
            if !inst.is_opened.load(Ordering::SeqCst) {
                let _guard = inst.file_mutex.write().unwrap();
                let ret = self.open_file(inst);
                if ret != 0 {
                    error!("read_file(): open_file failed");
                    return ret as i64;
                }
                inst.is_opened.store(true, Ordering::SeqCst);
            }

            if !inst.pre_read_started.swap(true, Ordering::SeqCst) {
                if self.node.is_local(inst.node_id()) {
                    // Local bodies read straight from the cache file.
                    self.stop_pre_read(inst);
                } else if !self.start_pre_read(inst) {
                    self.start_pre_read(inst);
                }
            }

            let read_size = self.read_to_buffer(inst, buf, offset);
            if read_size < 0 {
                error!("read_file(): read_to_buffer failed");
                inst.read_fail.store(true, Ordering::SeqCst);
            }
            return read_size;
        }

        // Small read-only files are served from the in-memory body.
        let _guard = inst.file_mutex.read().unwrap();
        let body = inst.read_buffer.read().unwrap();
        let offset = offset as usize;
        if offset + buf.len() <= body.len() {
            buf.copy_from_slice(&body[offset..offset + buf.len()]);
            return buf.len() as i64;
        } else if offset < body.len() {
            let count = body.len() - offset;
            buf[..count].copy_from_slice(&body[offset..]);
            return count as i64;
        }
        0
    }

    fn start_pre_read(self: &Arc<Self>, inst: &Arc<OpenInstance>) -> bool {
        let blocks = div_round_up(inst.current_size(), self.params.block_size as u64);
        if !inst.read_stream.init(
            &self.mem_pool,
            blocks as usize,
            self.params.block_size as usize,
        ) {
            return false;
        }
        let store = self.clone();
        let target = inst.clone();
        let reader: PipeReader =
            Arc::new(move |buf, offset| store.read_file_lr(&target, buf, offset as i64) as isize);
        inst.read_stream.start(reader);
        true
    }

    fn stop_pre_read(&self, inst: &OpenInstance) {
        inst.pre_read_stopped.store(true, Ordering::SeqCst);
        inst.direct_read_file.store(true, Ordering::SeqCst);
        inst.read_stream.stop();
    }

    fn read_to_buffer(self: &Arc<Self>, inst: &Arc<OpenInstance>, buf: &mut [u8], offset: i64) -> i64 {
        if inst.direct_read_file.load(Ordering::SeqCst) {
            return self.random_read(inst, buf, offset);
        }
        // Sequential reads peek and advance the watermark atomically.
        let guard = inst.file_mutex.write().unwrap();
        if inst.direct_read_file.load(Ordering::SeqCst)
            || inst.serial_read_end.load(Ordering::SeqCst) != offset as u64
        {
            // A seek kills the pipeline permanently for this instance.
            self.stop_pre_read(inst);
            drop(guard);
            return self.random_read(inst, buf, offset);
        }
        let ret = inst.read_stream.wait_pop(buf) as i64;
        if ret > 0 {
            inst.serial_read_end.fetch_add(ret as u64, Ordering::SeqCst);
        }
        ret
    }

    fn random_read(&self, inst: &Arc<OpenInstance>, buf: &mut [u8], offset: i64) -> i64 {
        if !inst.is_direct() {
            return self.read_file_lr(inst, buf, offset);
        }
        let mut aligned = match AlignedBuf::new(round_up_512(buf.len())) {
            Some(aligned) => aligned,
            None => {
                error!("random_read(): aligned allocation failed");
                return -(libc::ENOMEM as i64);
            }
        };
        let ret = self.read_file_lr(inst, &mut aligned[..buf.len()], offset);
        if ret < 0 {
            return ret;
        }
        buf.copy_from_slice(&aligned[..buf.len()]);
        ret
    }

    /// Read from the local cache file, the remote owner, or the object
    /// store. Peer-served calls never fall through to the object store.
    pub fn read_file_lr(&self, inst: &Arc<OpenInstance>, buf: &mut [u8], offset: i64) -> i64 {
        let current = inst.current_size();
        if offset as u64 >= current {
            return 0;
        }
        let check_len = std::cmp::min(buf.len() as u64, current - offset as u64) as i64;
        let mut ret: i64 = -libc::EIO as i64;

        if self.node.is_local(inst.node_id()) {
            let fd = inst.physical_fd();
            if fd != INVALID_FD
                && !self
                    .file_lock
                    .test_locked(inst.inode_id(), LockMode::Exclusive)
            {
                self.stats.add(StatItem::BlockcacheRead, check_len as u64);
                ret = match nix::sys::uio::pread(fd as RawFd, buf, offset as libc::off_t) {
                    Ok(n) if n as i64 == check_len => check_len,
                    Ok(_) => {
                        // One retry covers transient short reads.
                        match nix::sys::uio::pread(
                            fd as RawFd,
                            &mut buf[..check_len as usize],
                            offset as libc::off_t,
                        ) {
                            Ok(n) if n as i64 == check_len => check_len,
                            Ok(n) => {
                                error!(
                                    "read_file_lr(): pread fd {} returned {} of {}",
                                    fd, n, check_len
                                );
                                -libc::EIO as i64
                            }
                            Err(errno) => {
                                error!("read_file_lr(): pread fd {} failed: {}", fd, errno);
                                -(errno as i32) as i64
                            }
                        }
                    }
                    Err(errno) => {
                        error!("read_file_lr(): pread fd {} failed: {}", fd, errno);
                        -(errno as i32) as i64
                    }
                };
            }
        } else if !inst.remote_failed.load(Ordering::SeqCst) {
            ret = -libc::EHOSTUNREACH as i64;
            if let Some(client) = self.node.rpc_connection(inst.node_id()) {
                for i in 0..RPC_RETRY_NUM {
                    match client.read_file(
                        inst.physical_fd(),
                        buf.len(),
                        offset,
                        &inst.path(),
                    ) {
                        Ok(data) => {
                            buf[..data.len()].copy_from_slice(&data);
                            ret = data.len() as i64;
                            break;
                        }
                        Err(err) if err.is_timeout() => {
                            ret = -libc::ETIMEDOUT as i64;
                            error!("read_file_lr(): peer timeout, retry {}", i);
                            std::thread::sleep(Duration::from_secs(RPC_RETRY_DELAY_SECS));
                        }
                        Err(err) => {
                            ret = err.to_neg_errno() as i64;
                            break;
                        }
                    }
                }
            }
            if ret != check_len {
                error!(
                    "read_file_lr(): remote read failed ({}) for node {}",
                    ret,
                    inst.node_id()
                );
                inst.remote_failed.store(true, Ordering::SeqCst);
            }
        }

        if ret < 0 && !inst.is_remote_call.load(Ordering::SeqCst) && self.params.persist {
            let backend = self.backend.as_ref().unwrap();
            let path = inst.path();
            debug!("read_file_lr(): falling back to the object store for {}", path);
            ret = match backend.read_object(
                object_key(&path),
                offset as u64,
                buf.len() as u64,
                None,
                Some(buf),
            ) {
                Ok(n) => n as i64,
                Err(_) => {
                    error!("read_file_lr(): object-store read failed");
                    -libc::EIO as i64
                }
            };
        }
        ret
    }

    /*---------------------- open ----------------------*/

    /// Allocate a backing descriptor and warm the cache if needed.
    pub fn open_file(&self, inst: &Arc<OpenInstance>) -> i32 {
        info!(
            "open_file(): called by {}",
            if inst.is_remote_call.load(Ordering::SeqCst) {
                "peer"
            } else {
                "adapter"
            }
        );
        if inst.physical_fd() != INVALID_FD {
            return 0;
        }

        self.alloc_node_id(inst);

        if !self.node.is_local(inst.node_id()) {
            let ret = self.open_file_from_remote(inst, true);
            if ret != 0 {
                error!("open_file(): remote open failed");
                return ret;
            }
            return 0;
        }

        let inode = inst.inode_id();
        let file_name = self.cache.file_path(inode);
        if inst.node_fail.load(Ordering::SeqCst) {
            // Handoff: the stale body must be re-populated.
            self.cache.delete_old_cache_no_pin(inode);
        }

        if self.cache.find(inode, true) {
            let fd = match nix::fcntl::open(
                &file_name,
                nix::fcntl::OFlag::from_bits_truncate(inst.oflags()),
                nix::sys::stat::Mode::from_bits_truncate(0o755),
            ) {
                Ok(fd) => fd,
                Err(errno) => {
                    self.cache.unpin(inode);
                    error!("open_file(): open {:?} failed: {}", file_name, errno);
                    return -(errno as i32);
                }
            };
            inst.physical_fd.store(fd as u64, Ordering::SeqCst);
            info!("open_file(): opened cached file {:?}, fd = {}", file_name, fd);
        } else if !inst.is_rdonly() {
            // Write-open miss: warm the cache synchronously when the body
            // already exists somewhere durable.
            if !inst.has_creat() && inst.original_size() > 0 {
                if !self.params.persist {
                    error!("open_file(): cache file {:?} missing for write", file_name);
                    return -libc::ENOENT;
                }
                info!("open_file(): loading evicted cache file for write");
                let ret = self.download_from_storage(
                    inode,
                    &inst.path(),
                    inst.original_size(),
                    true,
                    None,
                );
                if ret != 0 {
                    return ret;
                }
                // The body is pinned in the cache now.
            }
            let fd = match nix::fcntl::open(
                &file_name,
                nix::fcntl::OFlag::from_bits_truncate(inst.oflags())
                    | nix::fcntl::OFlag::O_CREAT,
                nix::sys::stat::Mode::from_bits_truncate(0o755),
            ) {
                Ok(fd) => fd,
                Err(errno) => {
                    error!("open_file(): create {:?} failed: {}", file_name, errno);
                    return -(errno as i32);
                }
            };
            inst.physical_fd.store(fd as u64, Ordering::SeqCst);
            if inst.original_size() == 0 || inst.has_creat() {
                self.cache.insert_or_update(inode, 0, true);
            }
            info!("open_file(): created cache file {:?}, fd = {}", file_name, fd);
        } else {
            // Read-only miss: trigger a background fetch and serve reads
            // from the partial file or the object store meanwhile.
            if !self.params.persist {
                error!("open_file(): cache file {:?} missing for read", file_name);
                return -libc::ENOENT;
            }
            let ret = self.download_from_storage(
                inode,
                &inst.path(),
                inst.original_size(),
                false,
                None,
            );
            if ret != 0 {
                return ret;
            }
            if let Ok(fd) = nix::fcntl::open(
                &file_name,
                nix::fcntl::OFlag::from_bits_truncate(inst.oflags()),
                nix::sys::stat::Mode::empty(),
            ) {
                inst.physical_fd.store(fd as u64, Ordering::SeqCst);
            }
        }

        let fd = inst.physical_fd();
        if fd != INVALID_FD {
            return inst.write_stream.bind_local(
                fd as RawFd,
                inode,
                inst.is_direct(),
                self.cache.clone(),
                self.stats.clone(),
                self.write_pool.clone(),
            );
        }
        0
    }

    /// Open (large) or slurp (small) a file owned by a peer, walking the
    /// roster on connection faults.
    fn open_file_from_remote(&self, inst: &Arc<OpenInstance>, large_file: bool) -> i32 {
        let node_cnt = self.node.node_count();
        let mut last_err: i32 = libc::EHOSTUNREACH;
        let mut retry = RPC_RETRY_NUM;
        let mut i = 0;

        while i < node_cnt {
            i += 1;
            let client = self.node.rpc_connection(inst.node_id());
            let result = match &client {
                None => Err(crate::node::io_client::RpcError::Transport(
                    libc::EHOSTUNREACH,
                )),
                Some(client) => {
                    if large_file {
                        client
                            .open_file(
                                inst.inode_id(),
                                inst.oflags(),
                                inst.original_size(),
                                &inst.path(),
                                inst.node_fail.load(Ordering::SeqCst),
                            )
                            .map(|fd| {
                                inst.physical_fd.store(fd, Ordering::SeqCst);
                            })
                    } else {
                        client
                            .read_small_file(
                                inst.inode_id(),
                                inst.original_size() as usize,
                                &inst.path(),
                                inst.oflags(),
                                inst.node_fail.load(Ordering::SeqCst),
                            )
                            .map(|data| {
                                let mut body = inst.read_buffer.write().unwrap();
                                body.copy_from_slice(&data);
                            })
                    }
                }
            };

            match result {
                Ok(()) => {
                    if large_file {
                        let client = client.unwrap();
                        let ret = inst.write_stream.bind_remote(
                            client,
                            inst.physical_fd(),
                            inst.inode_id(),
                            self.write_pool.clone(),
                        );
                        if ret != 0 {
                            return ret;
                        }
                    }
                    return 0;
                }
                Err(crate::node::io_client::RpcError::Remote(err)) => {
                    last_err = err;
                    break;
                }
                Err(err) => {
                    let errno = match err {
                        crate::node::io_client::RpcError::Transport(e) => e,
                        _ => unreachable!(),
                    };
                    last_err = errno;
                    if errno != libc::ETIMEDOUT {
                        self.node.delete_node(inst.node_id());
                    } else if retry > 0 {
                        retry -= 1;
                        error!("open_file_from_remote(): timeout, retries left {}", retry);
                        std::thread::sleep(Duration::from_secs(RPC_RETRY_DELAY_SECS));
                        continue;
                    }
                    // Without a durable copy, an existing file cannot move.
                    if !self.params.persist && !inst.has_creat() {
                        break;
                    }
                    let backup = inst.node_id();
                    let next = self.node.alloc_node(inst.inode_id());
                    inst.node_id.store(next, Ordering::SeqCst);
                    warn!(
                        "open_file_from_remote(): failed at node {}, switch to {}",
                        backup, next
                    );
                    inst.node_fail.store(true, Ordering::SeqCst);
                    if self.params.is_inference {
                        let parent = parent_path(&inst.path(), self.params.parent_path_level);
                        self.node_hash.lock().unwrap().insert(parent, next);
                    }
                    if self.node.is_local(next) {
                        return self.open_file(inst);
                    }
                }
            }
        }

        if large_file || last_err == 0 {
            if last_err > 0 {
                error!("open_file_from_remote(): connection failed for all nodes");
                return -last_err;
            }
            if last_err < 0 {
                error!(
                    "open_file_from_remote(): open remote file {} failed: {}",
                    inst.path(),
                    last_err
                );
            }
            return last_err;
        }

        // Small files that exhaust the roster read the object store.
        if self.params.persist {
            warn!("open_file_from_remote(): small read failed on peers, reading the object store");
            let backend = self.backend.as_ref().unwrap();
            let path = inst.path();
            let mut body = inst.read_buffer.write().unwrap();
            match backend.read_object(object_key(&path), 0, body.len() as u64, None, Some(body.as_mut_slice()))
            {
                Ok(_) => 0,
                Err(_) => {
                    error!("open_file_from_remote(): object read {} failed", path);
                    -libc::EIO
                }
            }
        } else {
            error!("open_file_from_remote(): small remote read failed");
            if last_err > 0 {
                -last_err
            } else {
                last_err
            }
        }
    }

    /*---------------------- small files ----------------------*/

    /// Populate the small-file read buffer at open time. Runs once per
    /// instance before `open` returns.
    pub fn read_small_files(&self, inst: &Arc<OpenInstance>) -> i32 {
        self.alloc_node_id(inst);

        if !self.node.is_local(inst.node_id()) {
            return self.open_file_from_remote(inst, false);
        }

        let inode = inst.inode_id();
        let file_name = self.cache.file_path(inode);
        if inst.node_fail.load(Ordering::SeqCst) {
            self.cache.delete_old_cache_no_pin(inode);
        }

        if self.cache.find(inode, true) {
            let ret = self.read_cached_body(&file_name, inst);
            self.cache.unpin(inode);
            return ret;
        }

        if !self.params.persist {
            error!("read_small_files(): no local cache exists");
            return -libc::ENOENT;
        }

        if !inst.is_rdonly() {
            // A writer may follow; load the body into cache and buffer now.
            info!("read_small_files(): sync download to cache and buffer");
            let path = inst.path();
            let mut body = inst.read_buffer.write().unwrap();
            let len = body.len() as u64;
            return self.download_from_storage(inode, &path, len, true, Some(body.as_mut_slice()));
        }

        if inst.is_remote_call.load(Ordering::SeqCst) {
            // Peer-served: start the load, let the caller hit the object
            // store itself.
            info!("read_small_files(): peer call, background load and report miss");
            let ret =
                self.download_from_storage(inode, &inst.path(), inst.original_size(), false, None);
            return if ret == 0 { -libc::ENOENT } else { ret };
        }

        let path = inst.path();
        {
            let mut body = inst.read_buffer.write().unwrap();
            let backend = self.backend.as_ref().unwrap();
            if backend
                .read_object(object_key(&path), 0, body.len() as u64, None, Some(body.as_mut_slice()))
                .is_err()
            {
                error!("read_small_files(): object read failed");
                return -libc::EIO;
            }
        }
        let body = inst.read_buffer.read().unwrap().clone();
        self.write_to_file_async(inode, body)
    }

    fn read_cached_body(&self, file_name: &std::path::Path, inst: &Arc<OpenInstance>) -> i32 {
        let file = match std::fs::File::open(file_name) {
            Ok(file) => file,
            Err(e) => {
                error!("read_small_files(): open {:?} failed: {}", file_name, e);
                return -e.raw_os_error().unwrap_or(libc::EIO);
            }
        };
        let mut body = inst.read_buffer.write().unwrap();
        self.stats.add(StatItem::BlockcacheRead, body.len() as u64);
        let mut total = 0usize;
        while total < body.len() {
            match nix::sys::uio::pread(file.as_raw_fd(), &mut body[total..], total as libc::off_t) {
                Ok(0) => {
                    error!("read_small_files(): short body in {:?}", file_name);
                    return -libc::EIO;
                }
                Ok(n) => total += n,
                Err(nix::errno::Errno::EAGAIN) => continue,
                Err(errno) => {
                    error!("read_small_files(): pread failed: {}", errno);
                    return -(errno as i32);
                }
            }
        }
        0
    }

    /// Peer-side whole-body read of a small file.
    pub fn read_small_for_peer(
        &self,
        inode: u64,
        path: &str,
        size: usize,
        oflags: i32,
        node_fail: bool,
    ) -> std::result::Result<Vec<u8>, i32> {
        let file_name = self.cache.file_path(inode);
        if node_fail {
            self.cache.delete_old_cache_no_pin(inode);
        }

        if self.cache.find(inode, true) {
            let result = (|| {
                let file = std::fs::File::open(&file_name)
                    .map_err(|e| -e.raw_os_error().unwrap_or(libc::EIO))?;
                self.stats.add(StatItem::BlockcacheRead, size as u64);
                let mut body = vec![0u8; size];
                let mut total = 0usize;
                while total < body.len() {
                    match nix::sys::uio::pread(
                        file.as_raw_fd(),
                        &mut body[total..],
                        total as libc::off_t,
                    ) {
                        Ok(0) => return Err(-libc::EIO),
                        Ok(n) => total += n,
                        Err(nix::errno::Errno::EAGAIN) => continue,
                        Err(errno) => return Err(-(errno as i32)),
                    }
                }
                Ok(body)
            })();
            self.cache.unpin(inode);
            return result;
        }

        if !self.params.persist {
            error!("read_small_for_peer(): no local cache exists");
            return Err(-libc::ENOENT);
        }

        if oflags & libc::O_ACCMODE != libc::O_RDONLY {
            let mut body = vec![0u8; size];
            let ret = self.download_from_storage(inode, path, size as u64, true, Some(body.as_mut_slice()));
            if ret != 0 {
                return Err(ret);
            }
            return Ok(body);
        }

        info!("read_small_for_peer(): background load and report miss");
        let ret = self.download_from_storage(inode, path, size as u64, false, None);
        Err(if ret == 0 { -libc::ENOENT } else { ret })
    }

    /// Write a freshly fetched small body into the local cache off the hot
    /// path. Best effort; gives up silently when another populate runs.
    fn write_to_file_async(&self, inode: u64, body: Vec<u8>) -> i32 {
        let locker =
            OwnedFileLocker::new(self.file_lock.clone(), inode, LockMode::Exclusive, false);
        if !locker.is_locked() {
            info!("write_to_file_async(): another populate holds the lock, abort");
            return 0;
        }
        if self.cache.find(inode, false) {
            info!("write_to_file_async(): local file already exists, abort");
            return 0;
        }
        let size = body.len() as u64;
        if !self.cache.pre_alloc(size) {
            error!("write_to_file_async(): cannot pre-allocate space");
            return -libc::ENOSPC;
        }
        let file_name = self.cache.file_path(inode);
        let file = match OpenOptions::new()
            .write(true)
            .create(true)
            .open(&file_name)
        {
            Ok(file) => file,
            Err(e) => {
                error!("write_to_file_async(): create {:?} failed: {}", file_name, e);
                self.cache.free_pre_alloc(size);
                return -e.raw_os_error().unwrap_or(libc::EIO);
            }
        };

        let cache = self.cache.clone();
        let stats = self.stats.clone();
        self.pool.submit(move || {
            let _locker = locker;
            stats.add(StatItem::BlockcacheWrite, size);
            match nix::sys::uio::pwrite(file.as_raw_fd(), &body, 0) {
                Ok(_) => cache.insert_or_update(inode, size, false),
                Err(errno) => error!("write_to_file_async(): pwrite failed: {}", errno),
            }
            cache.free_pre_alloc(size);
        });
        0
    }

    /*---------------------- object store ----------------------*/

    /// Single-flight blob download guarded by the inode's exclusive lock.
    /// With `is_sync` the call blocks on the lock and the transfer and the
    /// cache entry ends up pinned; otherwise the transfer runs on the shared
    /// pool. `buf` additionally receives the body and implies `is_sync`.
    fn download_from_storage(
        &self,
        inode: u64,
        path: &str,
        file_size: u64,
        is_sync: bool,
        buf: Option<&mut [u8]>,
    ) -> i32 {
        let backend = match &self.backend {
            Some(backend) => backend.clone(),
            None => return -libc::ENOENT,
        };
        let locker =
            OwnedFileLocker::new(self.file_lock.clone(), inode, LockMode::Exclusive, is_sync);
        if !locker.is_locked() {
            info!("download_from_storage(): another downloader holds the lock, abort");
            return 0;
        }
        // Re-check under the lock: a finished downloader may have populated
        // the cache already.
        if self.cache.find(inode, is_sync) {
            info!("download_from_storage(): local file already exists, abort");
            return 0;
        }

        if !self.cache.pre_alloc(file_size) {
            error!("download_from_storage(): cannot pre-allocate space");
            return -libc::ENOSPC;
        }

        let file_name = self.cache.file_path(inode);
        let file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&file_name)
        {
            Ok(file) => file,
            Err(e) => {
                error!("download_from_storage(): create {:?} failed: {}", file_name, e);
                self.cache.free_pre_alloc(file_size);
                return -e.raw_os_error().unwrap_or(libc::EIO);
            }
        };

        let key = object_key(path).to_string();
        let cache = self.cache.clone();

        if is_sync {
            let result = match buf {
                Some(out) => {
                    let len = out.len() as u64;
                    backend.read_object(&key, 0, len, Some(file.as_raw_fd()), Some(out))
                }
                None => backend.read_object(&key, 0, 0, Some(file.as_raw_fd()), None),
            };
            drop(file);
            match result {
                Ok(_) => {
                    cache.insert_or_update(inode, file_size, true);
                    cache.free_pre_alloc(file_size);
                    0
                }
                Err(_) => {
                    error!("download_from_storage(): loading {} failed", key);
                    let _ = std::fs::remove_file(&file_name);
                    cache.free_pre_alloc(file_size);
                    -libc::EIO
                }
            }
        } else {
            self.pool.submit(move || {
                let _locker = locker;
                let result = backend.read_object(&key, 0, 0, Some(file.as_raw_fd()), None);
                drop(file);
                match result {
                    Ok(_) => cache.insert_or_update(inode, file_size, false),
                    Err(_) => {
                        error!("download_from_storage(): loading {} failed", key);
                        let _ = std::fs::remove_file(&file_name);
                    }
                }
                cache.free_pre_alloc(file_size);
            });
            0
        }
    }

    fn flush_to_storage(&self, path: &str, inode: u64) -> i32 {
        let backend = match &self.backend {
            Some(backend) => backend.clone(),
            None => return 0,
        };
        let key = object_key(path).to_string();
        let local_file = self.cache.file_path(inode);
        if self.params.async_upload {
            self.pool.submit(move || match backend.put_file(&key, &local_file) {
                Ok(()) => info!("flushed {} to the object store", key),
                Err(e) => error!("flushing {} to the object store failed: {}", key, e),
            });
            return 0;
        }
        match backend.put_file(&key, &local_file) {
            Ok(()) => {
                info!("flushed {} to the object store", key);
                0
            }
            Err(e) => {
                error!("flushing {} to the object store failed: {}", key, e);
                -libc::EIO
            }
        }
    }

    /*---------------------- close ----------------------*/

    /// Two-phase close: the adapter flushes first, then releases.
    pub fn close_tmp_files(&self, inst: &Arc<OpenInstance>, is_flush: bool, is_sync: bool) -> i32 {
        info!(
            "close_tmp_files(): {} {}",
            if is_flush { "flush" } else { "close" },
            inst.path()
        );

        // Both only happen when open failed.
        if inst.physical_fd() == INVALID_FD {
            warn!("close_tmp_files(): fd not set");
            return 0;
        }
        if inst.node_id() == -1 {
            warn!("close_tmp_files(): node not set");
            return 0;
        }

        let mut ret = 0;
        if is_flush {
            inst.is_flushed.store(true, Ordering::SeqCst);
        } else if !inst.is_flushed.load(Ordering::SeqCst) {
            warn!("close_tmp_files(): close called without flush");
            ret = self.close_tmp_files(inst, true, is_sync);
            if ret != 0 {
                error!("close_tmp_files(): implicit flush failed");
                inst.write_fail.store(true, Ordering::SeqCst);
            }
        }

        if !is_flush && !inst.is_remote_call.load(Ordering::SeqCst) {
            self.stop_pre_read(inst);
            inst.read_stream.wait_ended();
        }

        if !inst.is_remote_call.load(Ordering::SeqCst) {
            let complete_ret = inst
                .write_stream
                .complete(inst.current_size(), is_flush, is_sync);
            if complete_ret != 0 {
                error!(
                    "close_tmp_files(): draining the write stream failed for node {}",
                    inst.node_id()
                );
                inst.write_fail.store(true, Ordering::SeqCst);
                ret = complete_ret;
            }
        }

        if self.node.is_local(inst.node_id()) {
            let inode = inst.inode_id();
            if !is_flush {
                let _ = nix::unistd::close(inst.physical_fd() as RawFd);
                self.cache.unpin(inode);
                return ret;
            }
            self.cache.insert_or_update(inode, inst.current_size(), false);
            if inst.write_cnt.load(Ordering::SeqCst) > 0 && !inst.write_fail.load(Ordering::SeqCst)
            {
                if is_sync {
                    let _ = nix::unistd::fsync(inst.physical_fd() as RawFd);
                    info!("close_tmp_files(): {} fsynced", inst.path());
                }
                if self.params.persist {
                    let flush_ret = self.flush_to_storage(&inst.path(), inode);
                    inst.write_fail.store(flush_ret != 0, Ordering::SeqCst);
                    if flush_ret != 0 {
                        ret = flush_ret;
                    }
                }
            }
        }
        ret
    }

    /*---------------------- other ops ----------------------*/

    pub fn delete_files(&self, inode: u64, node_id: i32, path: &str) -> i32 {
        let mut ret = 0;
        if node_id == -1 || self.node.is_local(node_id) {
            if self.cache.find(inode, false) {
                ret = self.cache.delete(inode);
                if ret != 0 {
                    return ret;
                }
            } else if !self.params.persist {
                error!("delete of {:?} failed: not cached", self.cache.file_path(inode));
                return -libc::ENOENT;
            }
        } else {
            match self.node.rpc_connection(node_id) {
                Some(client) => match client.delete_file(inode, node_id, path) {
                    Ok(()) => return 0,
                    Err(err) => {
                        error!("remote delete failed on node {}: {}", node_id, err);
                        ret = err.to_neg_errno();
                    }
                },
                None => return -libc::EHOSTUNREACH,
            }
        }

        if self.params.persist {
            let backend = self.backend.as_ref().unwrap();
            if backend.delete_object(object_key(path)).is_err() {
                error!("deleting object {} failed", path);
                return -libc::EIO;
            }
            return 0;
        }
        ret
    }

    /// Truncate the backing body, local or remote. Write-open is required.
    pub fn truncate_file(&self, inst: &Arc<OpenInstance>, size: i64) -> i32 {
        info!(
            "truncate_file(): {} to size {}",
            inst.path(),
            size
        );
        if !inst.is_opened.load(Ordering::SeqCst) {
            let _guard = inst.file_mutex.write().unwrap();
            let ret = self.open_file(inst);
            if ret != 0 {
                error!("truncate_file(): open_file failed");
                return ret;
            }
            inst.is_opened.store(true, Ordering::SeqCst);
        }

        if self.node.is_local(inst.node_id()) {
            if let Err(errno) =
                nix::unistd::ftruncate(inst.physical_fd() as RawFd, size as libc::off_t)
            {
                error!("truncate of {:?} failed: {}", self.cache.file_path(inst.inode_id()), errno);
                return -(errno as i32);
            }
        } else {
            match self.node.rpc_connection(inst.node_id()) {
                Some(client) => {
                    if let Err(err) = client.truncate_file(inst.physical_fd(), size) {
                        error!("remote truncate failed on node {}: {}", inst.node_id(), err);
                        return err.to_neg_errno();
                    }
                }
                None => return -libc::EHOSTUNREACH,
            }
        }
        0
    }

    /// Adjust an instance's in-memory sizes (and its remote twin's) without
    /// touching the cache file.
    pub fn truncate_open_instance(&self, inst: &Arc<OpenInstance>, size: i64) -> i32 {
        if inst.write_stream.buffered() > 0 {
            info!("truncate_open_instance(): persisting buffered writes");
            let ret = inst.write_stream.complete(inst.current_size(), true, false);
            if ret != 0 {
                error!("truncate_open_instance(): persist failed");
                return ret;
            }
        }

        if !self.node.is_local(inst.node_id()) && inst.is_opened.load(Ordering::SeqCst) {
            if let Some(client) = self.node.rpc_connection(inst.node_id()) {
                if let Err(err) = client.truncate_open_instance(inst.physical_fd(), size) {
                    error!(
                        "remote truncate_open_instance failed on node {}: {}",
                        inst.node_id(),
                        err
                    );
                    return err.to_neg_errno();
                }
            }
        }

        let _guard = inst.file_mutex.write().unwrap();
        inst.current_size.store(size as u64, Ordering::SeqCst);
        inst.original_size.store(size as u64, Ordering::SeqCst);
        0
    }

    /// Cluster-wide usage: the local cache filesystem plus every peer's,
    /// or the object tier when persistence is on.
    pub fn stat_fs(&self) -> std::result::Result<StatFsBuf, i32> {
        if self.params.persist {
            let backend = self.backend.as_ref().unwrap();
            return backend.stat_fs().map_err(|_| -libc::EIO);
        }

        let fs = nix::sys::statvfs::statvfs(&self.params.root).map_err(|errno| {
            error!("statvfs failed: {}", errno);
            -(errno as i32)
        })?;
        let mut out = StatFsBuf {
            f_blocks: fs.blocks() as u64,
            f_bfree: fs.blocks_free() as u64,
            f_bavail: fs.blocks_available() as u64,
            f_files: fs.files() as u64,
            f_ffree: fs.files_free() as u64,
        };

        for node_id in self.node.all_node_ids() {
            if self.node.is_local(node_id) {
                continue;
            }
            let client = match self.node.rpc_connection(node_id) {
                Some(client) => client,
                None => return Err(-libc::EHOSTUNREACH),
            };
            let endpoint = self.node.endpoint(node_id).unwrap_or_default();
            match client.stat_fs(&endpoint) {
                Ok(remote) => {
                    out.f_blocks += remote.f_blocks;
                    out.f_bfree += remote.f_bfree;
                    out.f_bavail += remote.f_bavail;
                    out.f_files += remote.f_files;
                    out.f_ffree += remote.f_ffree;
                }
                Err(err) => {
                    error!("remote statfs failed on node {}: {}", node_id, err);
                }
            }
        }
        Ok(out)
    }

    /// Peer-side statfs; only answers for its own endpoint.
    pub fn stat_fs_for_peer(&self, endpoint: &str) -> std::result::Result<StatFsBuf, i32> {
        if !self.node.is_local_endpoint(endpoint) {
            return Ok(StatFsBuf::default());
        }
        let fs = nix::sys::statvfs::statvfs(&self.params.root).map_err(|errno| {
            error!("statfs failed: {}", errno);
            -(errno as i32)
        })?;
        Ok(StatFsBuf {
            f_blocks: fs.blocks() as u64,
            f_bfree: fs.blocks_free() as u64,
            f_bavail: fs.blocks_available() as u64,
            f_files: fs.files() as u64,
            f_ffree: fs.files_free() as u64,
        })
    }

    /// The per-second stats snapshot; `node_id == -1` with `scatter` folds
    /// in every peer's snapshot.
    pub fn stat_cluster(&self, node_id: i32, scatter: bool) -> Vec<u64> {
        let mut snapshot = self.stats.snapshot();
        if node_id == -1 && scatter {
            for id in self.node.all_node_ids() {
                if self.node.is_local(id) {
                    continue;
                }
                if let Some(client) = self.node.rpc_connection(id) {
                    if let Ok(remote) = client.stat_cluster(id, false) {
                        for (slot, value) in snapshot.iter_mut().zip(remote) {
                            *slot += value;
                        }
                    }
                }
            }
        }
        snapshot
    }

    /// Object-store side of a rename when persistence is on.
    pub fn copy_data(&self, src: &str, dst: &str) -> i32 {
        match &self.backend {
            Some(backend) => match backend.copy_object(object_key(src), object_key(dst)) {
                Ok(()) => 0,
                Err(_) => -libc::EIO,
            },
            None => 0,
        }
    }

    pub fn delete_data_after_rename(&self, path: &str) -> i32 {
        match &self.backend {
            Some(backend) => match backend.delete_object(object_key(path)) {
                Ok(()) => 0,
                Err(_) => -libc::EIO,
            },
            None => 0,
        }
    }
}

impl Drop for FalconStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parent-path truncation used by inference placement. `level == -1` keeps
/// the immediate parent.
pub fn parent_path(path: &str, level: i32) -> String {
    let bytes = path.as_bytes();
    if level == -1 {
        if bytes.is_empty() {
            return String::new();
        }
        let mut end = bytes.len() - 1;
        while end > 0 && bytes[end] != b'/' {
            end -= 1;
        }
        return path[..end].to_string();
    }

    let mut components = Vec::new();
    let mut depth = 1;
    for part in path.split('/') {
        if part.is_empty() {
            continue;
        }
        components.push(part);
        depth += 1;
        if depth >= level + 1 {
            break;
        }
    }
    let mut parent = String::from("/");
    if depth == level + 1 {
        for part in components.iter().take(level.max(1) as usize - 1) {
            parent.push_str(part);
            parent.push('/');
        }
    } else {
        for part in components.iter().take(components.len().saturating_sub(1)) {
            parent.push_str(part);
            parent.push('/');
        }
    }
    parent
}

/// djb2 over the parent path; seeds inference placement.
pub fn djb2(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(byte as u64);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_path_immediate() {
        assert_eq!(parent_path("/a/b/c", -1), "/a/b");
        assert_eq!(parent_path("/a", -1), "");
        assert_eq!(parent_path("/", -1), "");
    }

    #[test]
    fn test_parent_path_leveled() {
        assert_eq!(parent_path("/a/b/c/d", 2), "/a/");
        assert_eq!(parent_path("/a/b/c/d", 3), "/a/b/");
        // Shallower paths fall back to all but the final component.
        assert_eq!(parent_path("/a/b", 4), "/a/");
    }

    #[test]
    fn test_djb2_stability() {
        assert_eq!(djb2(""), 5381);
        assert_eq!(djb2("a"), 5381 * 33 + 97);
        assert_ne!(djb2("/data"), djb2("/date"));
    }
}
