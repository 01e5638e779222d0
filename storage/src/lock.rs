// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-inode shared/exclusive locks used to single-flight blob-store
//! downloads and local cache populates. The scoped [`FileLocker`] is the
//! only acquisition path; dropping it releases the lock.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

#[derive(Default)]
pub struct FileLockTable {
    locks: Mutex<HashMap<u64, LockState>>,
    cv: Condvar,
}

impl FileLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn grantable(state: &LockState, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !state.writer,
            LockMode::Exclusive => !state.writer && state.readers == 0,
        }
    }

    fn acquire(&self, inode: u64, mode: LockMode, blocking: bool) -> bool {
        let mut locks = self.locks.lock().unwrap();
        loop {
            let state = locks.entry(inode).or_default();
            if Self::grantable(state, mode) {
                match mode {
                    LockMode::Shared => state.readers += 1,
                    LockMode::Exclusive => state.writer = true,
                }
                return true;
            }
            if !blocking {
                return false;
            }
            locks = self.cv.wait(locks).unwrap();
        }
    }

    fn release(&self, inode: u64, mode: LockMode) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(state) = locks.get_mut(&inode) {
            match mode {
                LockMode::Shared => state.readers = state.readers.saturating_sub(1),
                LockMode::Exclusive => state.writer = false,
            }
            if state.readers == 0 && !state.writer {
                locks.remove(&inode);
            }
        }
        self.cv.notify_all();
    }

    /// Whether `mode` is currently held on `inode`. The local read path uses
    /// this to avoid reading a cache file that a downloader holds exclusively.
    pub fn test_locked(&self, inode: u64, mode: LockMode) -> bool {
        let locks = self.locks.lock().unwrap();
        match locks.get(&inode) {
            Some(state) => match mode {
                LockMode::Exclusive => state.writer,
                LockMode::Shared => state.readers > 0,
            },
            None => false,
        }
    }
}

pub struct FileLocker<'a> {
    table: &'a FileLockTable,
    inode: u64,
    mode: LockMode,
    locked: bool,
}

impl<'a> FileLocker<'a> {
    /// Blocking acquisition waits until the mode is satisfiable; the try
    /// variant returns an unlocked instance instead.
    pub fn new(table: &'a FileLockTable, inode: u64, mode: LockMode, blocking: bool) -> Self {
        let locked = table.acquire(inode, mode, blocking);
        FileLocker {
            table,
            inode,
            mode,
            locked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for FileLocker<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.table.release(self.inode, self.mode);
        }
    }
}

/// Owning variant of [`FileLocker`] for locks that outlive the acquiring
/// frame, e.g. held by a background download job until it completes.
pub struct OwnedFileLocker {
    table: std::sync::Arc<FileLockTable>,
    inode: u64,
    mode: LockMode,
    locked: bool,
}

impl OwnedFileLocker {
    pub fn new(
        table: std::sync::Arc<FileLockTable>,
        inode: u64,
        mode: LockMode,
        blocking: bool,
    ) -> Self {
        let locked = table.acquire(inode, mode, blocking);
        OwnedFileLocker {
            table,
            inode,
            mode,
            locked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for OwnedFileLocker {
    fn drop(&mut self) {
        if self.locked {
            self.table.release(self.inode, self.mode);
        }
    }
}
