// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The open-instance table. Descriptors come from a monotone 64-bit counter
//! that skips 0-2 and the invalid sentinel; the fd map is the sole owner of
//! an instance while the inode map holds weak back-references. A bounded
//! semaphore caps concurrently open instances and surfaces `EMFILE` after a
//! 3 s wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::buffer::open_instance::OpenInstance;
use crate::INVALID_FD;

pub const START_FD: u64 = 3;
pub const MAX_OPEN_INSTANCES: u32 = 40000;
const INSTANCE_WAIT: Duration = Duration::from_secs(3);

pub struct FalconFd {
    next_fd: AtomicU64,
    fd_map: RwLock<HashMap<u64, Arc<OpenInstance>>>,
    inode_map: RwLock<HashMap<u64, HashMap<u64, Weak<OpenInstance>>>>,
    active: Mutex<u32>,
    active_cv: Condvar,
    max_instances: u32,
}

impl FalconFd {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(MAX_OPEN_INSTANCES)
    }

    pub fn with_capacity(max_instances: u32) -> Arc<Self> {
        Arc::new(FalconFd {
            next_fd: AtomicU64::new(START_FD),
            fd_map: RwLock::new(HashMap::new()),
            inode_map: RwLock::new(HashMap::new()),
            active: Mutex::new(0),
            active_cv: Condvar::new(),
            max_instances,
        })
    }

    /// Allocate the next descriptor, skipping 0-2 and `u64::MAX`. The counter
    /// never reuses a value within a run; exhaustion wraps by recursion with
    /// an error log entry.
    pub fn obtain_fd(&self) -> u64 {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        if fd == INVALID_FD || fd < START_FD {
            error!("fd counter wrapped at {}", fd);
            self.next_fd.store(START_FD, Ordering::SeqCst);
            return self.obtain_fd();
        }
        fd
    }

    /// Hand out a fresh instance. With `charge`, a semaphore permit is taken
    /// first; timing out after 3 s returns `None` so the caller can surface
    /// `EMFILE`.
    pub fn wait_new_instance(&self, charge: bool) -> Option<Arc<OpenInstance>> {
        if charge {
            let mut active = self.active.lock().unwrap();
            while *active >= self.max_instances {
                let (next, timeout) = self
                    .active_cv
                    .wait_timeout(active, INSTANCE_WAIT)
                    .unwrap();
                active = next;
                if timeout.timed_out() && *active >= self.max_instances {
                    warn!("open instance semaphore saturated");
                    return None;
                }
            }
            *active += 1;
        }
        let inst = Arc::new(OpenInstance::default());
        inst.charged.store(charge, Ordering::SeqCst);
        Some(inst)
    }

    /// Release a charge taken by `wait_new_instance` for an instance that
    /// never got attached.
    pub fn release_instance(&self, inst: &Arc<OpenInstance>) {
        if inst.charged.swap(false, Ordering::SeqCst) {
            let mut active = self.active.lock().unwrap();
            if *active > 0 {
                *active -= 1;
            }
            drop(active);
            self.active_cv.notify_one();
        }
    }

    /// Insert into the fd map and the inode reverse index. fd-map first;
    /// a duplicate fd is an invariant violation.
    pub fn attach(&self, path: &str, inst: &Arc<OpenInstance>) -> u64 {
        let fd = self.obtain_fd();
        *inst.path.write().unwrap() = path.to_string();
        inst.fd.store(fd, Ordering::SeqCst);
        {
            let mut fd_map = self.fd_map.write().unwrap();
            let prev = fd_map.insert(fd, inst.clone());
            assert!(prev.is_none(), "duplicate fd {}", fd);
        }
        {
            let mut inode_map = self.inode_map.write().unwrap();
            inode_map
                .entry(inst.inode_id())
                .or_default()
                .insert(fd, Arc::downgrade(inst));
        }
        fd
    }

    pub fn get(&self, fd: u64) -> Option<Arc<OpenInstance>> {
        self.fd_map.read().unwrap().get(&fd).cloned()
    }

    pub fn get_by_inode(&self, inode: u64) -> Vec<Arc<OpenInstance>> {
        let inode_map = self.inode_map.read().unwrap();
        match inode_map.get(&inode) {
            Some(bucket) => bucket.values().filter_map(Weak::upgrade).collect(),
            None => Vec::new(),
        }
    }

    /// Remove from both maps; the inode bucket goes away when it empties.
    pub fn delete(&self, fd: u64, release_charge: bool) -> i32 {
        let inst = {
            let mut fd_map = self.fd_map.write().unwrap();
            match fd_map.remove(&fd) {
                Some(inst) => inst,
                None => {
                    error!("delete of unknown fd {}", fd);
                    return -libc::EBADF;
                }
            }
        };
        {
            let mut inode_map = self.inode_map.write().unwrap();
            let inode = inst.inode_id();
            let emptied = match inode_map.get_mut(&inode) {
                Some(bucket) => {
                    bucket.remove(&fd);
                    bucket.is_empty()
                }
                None => false,
            };
            if emptied {
                inode_map.remove(&inode);
            }
        }
        if release_charge {
            self.release_instance(&inst);
        } else {
            inst.charged.store(false, Ordering::SeqCst);
        }
        0
    }

    pub fn active_count(&self) -> u32 {
        *self.active.lock().unwrap()
    }

    pub fn open_count(&self) -> usize {
        self.fd_map.read().unwrap().len()
    }
}
