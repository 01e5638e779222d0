// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The write assembler. Sequential small writes coalesce into a single
//! serial run capped at [`STREAM_MAX_SIZE`]; out-of-order or oversized
//! writes force the current run out first. The terminal persist is a
//! `pwrite` into the local cache file or a `write_file` RPC to the owning
//! peer; the close-time flush rides the `close_file` RPC together with the
//! trailing run.

use std::cmp::min;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use falcon_utils::round_up_512;
use falcon_utils::stats::{FalconStats, StatItem};

use crate::buffer::mem_pool::{AlignedBuf, MemPool, PoolBlock};
use crate::cache::DiskCache;
use crate::node::io_client::FalconIoClient;
use crate::{INVALID_FD, RPC_RETRY_DELAY_SECS, RPC_RETRY_NUM, STREAM_MAX_SIZE};

#[derive(Default)]
struct SerialData {
    block: Option<PoolBlock>,
    size: usize,
    offset: i64,
}

impl SerialData {
    fn append(&mut self, pool: &Arc<MemPool>, buf: &[u8], offset: i64) -> bool {
        if self.block.is_none() {
            match pool.alloc_block() {
                Some(block) => self.block = Some(block),
                None => {
                    error!("SerialData::append(): pool allocation failed");
                    return false;
                }
            }
            self.offset = offset;
            self.size = 0;
        }
        let block = self.block.as_mut().unwrap();
        if self.size + buf.len() > block.len() {
            error!("SerialData::append(): run overflow");
            return false;
        }
        block[self.size..self.size + buf.len()].copy_from_slice(buf);
        self.size += buf.len();
        true
    }

    fn end(&self) -> i64 {
        if self.block.is_none() {
            0
        } else {
            self.offset + self.size as i64
        }
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn clear(&mut self) {
        self.block = None;
        self.size = 0;
        self.offset = 0;
    }
}

struct LocalSink {
    fd: RawFd,
    cache: Arc<DiskCache>,
    stats: Arc<FalconStats>,
}

#[derive(Default)]
struct WsInner {
    data: SerialData,
    local: Option<LocalSink>,
    client: Option<Arc<FalconIoClient>>,
    remote_fd: u64,
    inode_id: u64,
    direct: bool,
    pool: Option<Arc<MemPool>>,
    serial_cap: usize,
}

#[derive(Default)]
pub struct WriteStream {
    inner: Mutex<WsInner>,
}

impl WriteStream {
    pub fn bind_local(
        &self,
        fd: RawFd,
        inode_id: u64,
        direct: bool,
        cache: Arc<DiskCache>,
        stats: Arc<FalconStats>,
        pool: Arc<MemPool>,
    ) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sink) = &inner.local {
            if sink.fd != fd {
                error!("WriteStream::bind_local(): fd already set to {}", sink.fd);
                return -libc::EBADF;
            }
        }
        inner.serial_cap = min(STREAM_MAX_SIZE, pool.block_size());
        inner.local = Some(LocalSink { fd, cache, stats });
        inner.inode_id = inode_id;
        inner.direct = direct;
        inner.pool = Some(pool);
        0
    }

    pub fn bind_remote(
        &self,
        client: Arc<FalconIoClient>,
        remote_fd: u64,
        inode_id: u64,
        pool: Arc<MemPool>,
    ) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        if inner.remote_fd != 0 && inner.remote_fd != INVALID_FD && inner.remote_fd != remote_fd {
            error!(
                "WriteStream::bind_remote(): fd already set to {}",
                inner.remote_fd
            );
            return -libc::EBADF;
        }
        inner.serial_cap = min(STREAM_MAX_SIZE, pool.block_size());
        inner.client = Some(client);
        inner.remote_fd = remote_fd;
        inner.inode_id = inode_id;
        inner.pool = Some(pool);
        0
    }

    /// Bytes currently buffered in the serial run.
    pub fn buffered(&self) -> u64 {
        self.inner.lock().unwrap().data.size as u64
    }

    pub fn push(&self, buf: &[u8], offset: i64, current_size: u64) -> i32 {
        if buf.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock().unwrap();

        // Direct-I/O writes go straight down with an aligned copy.
        if inner.direct && inner.client.is_none() {
            let mut aligned = match AlignedBuf::new(round_up_512(buf.len())) {
                Some(aligned) => aligned,
                None => {
                    error!("WriteStream::push(): aligned allocation failed");
                    return -libc::ENOMEM;
                }
            };
            aligned[..buf.len()].copy_from_slice(buf);
            return Self::persist_to(&inner, &aligned[..buf.len()], offset, current_size);
        }

        let cap = inner.serial_cap;

        // Out-of-order or oversized data flushes the current run first.
        if inner.data.end() != offset || buf.len() >= cap {
            let ret = Self::persist_run(&mut inner, current_size);
            if ret != 0 {
                return ret;
            }
        }

        if buf.len() >= cap {
            return Self::persist_to(&inner, buf, offset, current_size);
        }

        if inner.data.size + buf.len() > cap {
            let ret = Self::persist_run(&mut inner, current_size);
            if ret != 0 {
                return ret;
            }
        }

        let pool = inner.pool.clone();
        let pool = match pool {
            Some(pool) => pool,
            None => {
                error!("WriteStream::push(): stream not bound");
                return -libc::EBADF;
            }
        };
        if !inner.data.append(&pool, buf, offset) {
            return -libc::ENOMEM;
        }
        0
    }

    fn persist_run(inner: &mut WsInner, current_size: u64) -> i32 {
        if inner.client.is_none() && inner.local.is_none() {
            error!("WriteStream::persist_run(): stream not bound");
            return -libc::EBADF;
        }
        let mut ret = 0;
        if !inner.data.is_empty() {
            let offset = inner.data.offset;
            let size = inner.data.size;
            let block = inner.data.block.take();
            if let Some(block) = &block {
                ret = Self::persist_to(inner, &block[..size], offset, current_size);
            }
        }
        inner.data.clear();
        ret
    }

    fn persist_to(inner: &WsInner, buf: &[u8], offset: i64, current_size: u64) -> i32 {
        if buf.is_empty() {
            return 0;
        }

        if let Some(client) = &inner.client {
            let mut ret = -libc::ETIMEDOUT;
            for i in 0..RPC_RETRY_NUM {
                match client.write_file(inner.remote_fd, buf, offset) {
                    Ok(()) => return 0,
                    Err(err) => {
                        ret = err.to_neg_errno();
                        if !err.is_timeout() {
                            break;
                        }
                        std::thread::sleep(Duration::from_secs(RPC_RETRY_DELAY_SECS));
                        error!("WriteStream: remote persist timed out, retry {}", i);
                    }
                }
            }
            error!("WriteStream::persist_to(): remote persist failed");
            return ret;
        }

        let sink = inner.local.as_ref().unwrap();
        // The cache entry tracks the on-disk length; the instance's
        // current_size may already run ahead of unflushed runs.
        let known = sink
            .cache
            .entry(inner.inode_id)
            .map(|e| e.size)
            .unwrap_or(current_size);
        let new_size = std::cmp::max(offset as u64 + buf.len() as u64, known);
        let size_to_add = new_size - known;
        if !sink.cache.pre_alloc(size_to_add) {
            error!("WriteStream::persist_to(): cannot pre-allocate space");
            return -libc::ENOSPC;
        }
        sink.stats.add(StatItem::BlockcacheWrite, buf.len() as u64);
        let ret = nix::sys::uio::pwrite(sink.fd, buf, offset as libc::off_t);
        match ret {
            Err(errno) => {
                error!("WriteStream::persist_to(): pwrite failed: {}", errno);
                sink.cache.free_pre_alloc(size_to_add);
                -(errno as i32)
            }
            Ok(_) => {
                if !sink.cache.update(inner.inode_id, new_size) {
                    sink.cache.free_pre_alloc(size_to_add);
                    error!("WriteStream::persist_to(): cache update failed");
                    return -libc::ENOENT;
                }
                sink.cache.free_pre_alloc(size_to_add);
                0
            }
        }
    }

    /// Close-time flush. The remote path sends the trailing run with the
    /// `close_file` RPC; the local path drains the serial run.
    pub fn complete(&self, current_size: u64, is_flush: bool, is_sync: bool) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(client) = inner.client.clone() {
            let payload: Vec<u8> = match &inner.data.block {
                Some(block) => block[..inner.data.size].to_vec(),
                None => Vec::new(),
            };
            let offset = inner.data.offset;
            let fd = inner.remote_fd;
            inner.data.clear();
            let mut ret = -libc::ETIMEDOUT;
            for i in 0..RPC_RETRY_NUM {
                match client.close_file(fd, is_flush, is_sync, &payload, offset) {
                    Ok(()) => return 0,
                    Err(err) => {
                        ret = err.to_neg_errno();
                        if !err.is_timeout() {
                            break;
                        }
                        std::thread::sleep(Duration::from_secs(RPC_RETRY_DELAY_SECS));
                        error!("WriteStream: remote close timed out, retry {}", i);
                    }
                }
            }
            return ret;
        }

        Self::persist_run(&mut inner, current_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::io::AsRawFd;

    fn disabled_cache() -> Arc<DiskCache> {
        // ratio 0 disables accounting so the sink exercises pure I/O.
        DiskCache::disabled()
    }

    #[test]
    fn test_sequential_writes_coalesce() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let pool = MemPool::new(STREAM_MAX_SIZE, 4);
        let stats = FalconStats::new();
        let ws = WriteStream::default();
        assert_eq!(
            ws.bind_local(
                file.as_file().as_raw_fd(),
                9,
                false,
                disabled_cache(),
                stats,
                pool
            ),
            0
        );

        let mut current = 0u64;
        for i in 0..4 {
            let chunk = vec![i as u8; 1000];
            assert_eq!(ws.push(&chunk, i * 1000, current), 0);
            current = (i as u64 + 1) * 1000;
        }
        // Still buffered, nothing on disk yet.
        assert_eq!(ws.buffered(), 4000);
        assert_eq!(ws.complete(current, true, false), 0);
        assert_eq!(ws.buffered(), 0);

        let mut content = Vec::new();
        file.reopen().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content.len(), 4000);
        for i in 0..4usize {
            assert!(content[i * 1000..(i + 1) * 1000].iter().all(|b| *b == i as u8));
        }
    }

    #[test]
    fn test_out_of_order_write_flushes_run() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let pool = MemPool::new(STREAM_MAX_SIZE, 4);
        let ws = WriteStream::default();
        ws.bind_local(
            file.as_file().as_raw_fd(),
            9,
            false,
            disabled_cache(),
            FalconStats::new(),
            pool,
        );

        assert_eq!(ws.push(b"aaaa", 0, 0), 0);
        // A seek back persists the pending run before buffering anew.
        assert_eq!(ws.push(b"bb", 10, 4), 0);
        let mut content = Vec::new();
        file.reopen().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(&content[..4], b"aaaa");
        assert_eq!(ws.buffered(), 2);
        assert_eq!(ws.complete(12, true, false), 0);
    }

    #[test]
    fn test_oversized_write_goes_direct() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let pool = MemPool::new(STREAM_MAX_SIZE, 4);
        let ws = WriteStream::default();
        ws.bind_local(
            file.as_file().as_raw_fd(),
            9,
            false,
            disabled_cache(),
            FalconStats::new(),
            pool,
        );

        let big = vec![7u8; STREAM_MAX_SIZE];
        assert_eq!(ws.push(&big, 0, 0), 0);
        assert_eq!(ws.buffered(), 0);
        let mut content = Vec::new();
        file.reopen().unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content.len(), STREAM_MAX_SIZE);
    }

    #[test]
    fn test_zero_length_write_is_noop() {
        let ws = WriteStream::default();
        assert_eq!(ws.push(&[], 0, 0), 0);
        assert_eq!(ws.buffered(), 0);
    }

    #[test]
    fn test_unbound_stream_rejects_persist() {
        let ws = WriteStream::default();
        assert_eq!(ws.push(b"xy", 5, 0), -libc::EBADF);
    }
}
