// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-`open()` state. One instance per fd, many per inode. The engine is
//! the only writer of the lifecycle flags; `file_mutex` serializes composite
//! transitions (open, size updates, sequential-read bookkeeping) and
//! `close_mutex` fences peer RPCs against use-after-close.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::buffer::read_stream::ReadStream;
use crate::buffer::write_stream::WriteStream;
use crate::INVALID_FD;

pub struct OpenInstance {
    pub inode_id: AtomicU64,
    // Chosen owner of the file body; -1 until placement runs.
    pub node_id: AtomicI32,
    // Local OS fd when cached here, peer-assigned descriptor when remote.
    pub physical_fd: AtomicU64,
    pub oflags: AtomicI32,
    pub original_size: AtomicU64,
    pub current_size: AtomicU64,
    pub path: RwLock<String>,

    // Small-file fast path: the whole body, populated before open returns.
    pub read_buffer: RwLock<Vec<u8>>,

    pub write_stream: WriteStream,
    pub read_stream: ReadStream,

    pub is_opened: AtomicBool,
    pub is_closed: AtomicBool,
    pub is_flushed: AtomicBool,
    pub pre_read_started: AtomicBool,
    pub pre_read_stopped: AtomicBool,
    pub direct_read_file: AtomicBool,
    pub write_fail: AtomicBool,
    pub read_fail: AtomicBool,
    pub node_fail: AtomicBool,
    pub remote_failed: AtomicBool,
    pub is_remote_call: AtomicBool,
    pub write_cnt: AtomicU64,
    pub serial_read_end: AtomicU64,

    pub file_mutex: RwLock<()>,
    pub close_mutex: RwLock<()>,

    // Held by the fd table while a charge against the instance semaphore is
    // outstanding.
    pub charged: AtomicBool,
    pub fd: AtomicU64,
}

impl Default for OpenInstance {
    fn default() -> Self {
        OpenInstance {
            inode_id: AtomicU64::new(0),
            node_id: AtomicI32::new(-1),
            physical_fd: AtomicU64::new(INVALID_FD),
            oflags: AtomicI32::new(0),
            original_size: AtomicU64::new(0),
            current_size: AtomicU64::new(0),
            path: RwLock::new(String::new()),
            read_buffer: RwLock::new(Vec::new()),
            write_stream: WriteStream::default(),
            read_stream: ReadStream::default(),
            is_opened: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            is_flushed: AtomicBool::new(false),
            pre_read_started: AtomicBool::new(false),
            pre_read_stopped: AtomicBool::new(false),
            direct_read_file: AtomicBool::new(false),
            write_fail: AtomicBool::new(false),
            read_fail: AtomicBool::new(false),
            node_fail: AtomicBool::new(false),
            remote_failed: AtomicBool::new(false),
            is_remote_call: AtomicBool::new(false),
            write_cnt: AtomicU64::new(0),
            serial_read_end: AtomicU64::new(0),
            file_mutex: RwLock::new(()),
            close_mutex: RwLock::new(()),
            charged: AtomicBool::new(false),
            fd: AtomicU64::new(INVALID_FD),
        }
    }
}

impl OpenInstance {
    pub fn inode_id(&self) -> u64 {
        self.inode_id.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> i32 {
        self.node_id.load(Ordering::SeqCst)
    }

    pub fn physical_fd(&self) -> u64 {
        self.physical_fd.load(Ordering::SeqCst)
    }

    pub fn oflags(&self) -> i32 {
        self.oflags.load(Ordering::SeqCst)
    }

    pub fn original_size(&self) -> u64 {
        self.original_size.load(Ordering::SeqCst)
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> String {
        self.path.read().unwrap().clone()
    }

    pub fn is_rdonly(&self) -> bool {
        self.oflags() & libc::O_ACCMODE == libc::O_RDONLY
    }

    pub fn is_direct(&self) -> bool {
        self.oflags() & libc::O_DIRECT != 0
    }

    pub fn has_creat(&self) -> bool {
        self.oflags() & libc::O_CREAT != 0
    }

    /// Raise `current_size` to cover a write ending at `end`.
    pub fn grow_current_size(&self, end: u64) {
        let _guard = self.file_mutex.write().unwrap();
        let cur = self.current_size.load(Ordering::SeqCst);
        if end > cur {
            self.current_size.store(end, Ordering::SeqCst);
        }
    }
}
