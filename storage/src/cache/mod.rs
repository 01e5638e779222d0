// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! LRU block cache over local files keyed by inode. Capacity is governed by
//! two free-space watermarks recomputed from `statvfs`: a background evictor
//! keeps both the block and inode ratios above `bg_free_ratio`, and the hot
//! path evicts just enough to keep a pre-allocation above `free_ratio`.
//! Entries with a positive pin count are never evicted.

use std::collections::{HashMap, VecDeque};
use std::io::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache_file_path;

const EVICTOR_PERIOD: Duration = Duration::from_secs(10);
const PRE_ALLOC_RETRY: u32 = 3;

#[derive(Clone, Copy, Debug, Default)]
pub struct CacheItem {
    pub size: u64,
    pub atime: u64,
    pub refs: u32,
}

#[derive(Default)]
struct CacheState {
    // Insertion order; ids deleted from `items` are skipped lazily.
    order: VecDeque<u64>,
    items: HashMap<u64, CacheItem>,
    used_cap: u64,
    free_cap: u64,
    total_cap: u64,
    block_ratio: f64,
    total_inodes: u64,
    free_inodes: u64,
    inode_ratio: f64,
}

pub struct DiskCache {
    root: PathBuf,
    dir_num: u32,
    free_ratio: f64,
    bg_free_ratio: f64,
    state: Mutex<CacheState>,
    reserved_cap: AtomicU64,
    alloc_lock: Mutex<()>,
    has_free_space: AtomicBool,
    stop: AtomicBool,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl DiskCache {
    pub fn new(root: &Path, dir_num: u32, free_ratio: f64, bg_free_ratio: f64) -> Arc<Self> {
        Arc::new(DiskCache {
            root: root.to_path_buf(),
            dir_num: dir_num.max(1),
            free_ratio,
            bg_free_ratio,
            state: Mutex::new(CacheState::default()),
            reserved_cap: AtomicU64::new(0),
            alloc_lock: Mutex::new(()),
            has_free_space: AtomicBool::new(true),
            stop: AtomicBool::new(false),
            evictor: Mutex::new(None),
        })
    }

    /// A cache with accounting disabled; operations degrade to direct
    /// filesystem checks.
    pub fn disabled() -> Arc<Self> {
        let cache = Self::new(Path::new(""), 1, 0.0, 0.0);
        cache.stop.store(true, Ordering::SeqCst);
        cache
    }

    pub fn file_path(&self, inode: u64) -> PathBuf {
        cache_file_path(&self.root, self.dir_num, inode)
    }

    /// Scan the shard directories, rebuild the LRU in ascending-atime order,
    /// verify the provisioning watermark, and start the background evictor.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.free_ratio == 0.0 {
            self.stop.store(true, Ordering::SeqCst);
            return Ok(());
        }

        for i in 0..self.dir_num {
            std::fs::create_dir_all(self.root.join(format!("{}", i)))?;
        }

        let scanned = self.scan()?;
        for (inode, size, atime) in scanned {
            let mut state = self.state.lock().unwrap();
            let item = CacheItem {
                size,
                atime,
                refs: 0,
            };
            state.order.push_back(inode);
            state.items.insert(inode, item);
            state.used_cap += size;
        }

        {
            let mut state = self.state.lock().unwrap();
            self.refresh_ratios(&mut state)?;
            if !self.space_enough_at_start(&state) {
                return Err(enospc!("free space cannot support the cache"));
            }
        }

        let cache = self.clone();
        let handle = std::thread::Builder::new()
            .name("falcon_evictor".to_string())
            .spawn(move || cache.evictor_loop())?;
        *self.evictor.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(u64, u64, u64)>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let mut walkers = Vec::new();
        for i in 0..self.dir_num {
            let dir = self.root.join(format!("{}", i));
            let collected = collected.clone();
            walkers.push(std::thread::spawn(move || {
                let mut local = Vec::new();
                let entries = match std::fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(_) => return,
                };
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    let inode: u64 = match name.split('-').next().and_then(|s| s.parse().ok()) {
                        Some(inode) => inode,
                        None => continue,
                    };
                    if let Ok(meta) = entry.metadata() {
                        let atime = meta
                            .accessed()
                            .ok()
                            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                        local.push((inode, meta.len(), atime));
                    }
                }
                collected.lock().unwrap().extend(local);
            }));
        }
        for walker in walkers {
            let _ = walker.join();
        }
        let mut scanned = Arc::try_unwrap(collected)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default();
        scanned.sort_by_key(|(_, _, atime)| *atime);
        Ok(scanned)
    }

    fn refresh_ratios(&self, state: &mut CacheState) -> Result<()> {
        let fs = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|e| eio!(format!("statvfs {:?} failed: {}", self.root, e)))?;
        let bsize = fs.block_size() as u64;
        state.total_cap = bsize * fs.blocks() as u64;
        state.free_cap = bsize * fs.blocks_available() as u64;
        state.block_ratio = if state.total_cap > 0 {
            state.free_cap as f64 / state.total_cap as f64
        } else {
            0.0
        };
        state.total_inodes = fs.files() as u64;
        state.free_inodes = fs.files_free() as u64;
        state.inode_ratio = if state.total_inodes > 0 {
            state.free_inodes as f64 / state.total_inodes as f64
        } else {
            0.0
        };
        Ok(())
    }

    fn space_enough_at_start(&self, state: &CacheState) -> bool {
        let block_ratio = if state.total_cap > 0 {
            (state.free_cap + state.used_cap) as f64 / state.total_cap as f64
        } else {
            0.0
        };
        let inode_ratio = if state.total_inodes > 0 {
            (state.free_inodes + state.items.len() as u64) as f64 / state.total_inodes as f64
        } else {
            0.0
        };
        if block_ratio <= self.bg_free_ratio
            || inode_ratio <= self.bg_free_ratio
            || block_ratio <= self.free_ratio
            || inode_ratio < self.free_ratio
        {
            error!("free space cannot support FalconFS running");
            return false;
        }
        true
    }

    fn evictor_loop(self: Arc<Self>) {
        while !self.stop.load(Ordering::SeqCst) {
            {
                let mut state = self.state.lock().unwrap();
                if self.refresh_ratios(&mut state).is_err() {
                    break;
                }
                if state.block_ratio < self.bg_free_ratio || state.inode_ratio < self.bg_free_ratio
                {
                    self.has_free_space.store(false, Ordering::SeqCst);
                    self.cleanup_bg(&mut state);
                }
                let ok = state.block_ratio >= self.bg_free_ratio
                    && state.inode_ratio >= self.bg_free_ratio;
                self.has_free_space.store(ok, Ordering::SeqCst);
            }
            // Wake every 10 s, checking the stop flag more often.
            let mut slept = Duration::ZERO;
            while slept < EVICTOR_PERIOD && !self.stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(500));
                slept += Duration::from_millis(500);
            }
        }
    }

    /// Background pass: recover both ratios above `bg_free_ratio`.
    /// In-flight reservations are not considered here.
    fn cleanup_bg(&self, state: &mut CacheState) {
        let target = self.bg_free_ratio;
        let mut to_free_cap: u64 = 0;
        let mut to_free_inode: u64 = 0;

        if state.block_ratio < target {
            to_free_cap = (state.total_cap as f64 * (target - state.block_ratio)) as u64;
            to_free_cap = to_free_cap.min(state.used_cap);
            warn!("cache eviction due to block limit, to_free_cap = {}", to_free_cap);
        }
        if state.inode_ratio < target {
            to_free_inode = (state.total_inodes as f64 * (target - state.inode_ratio)) as u64;
            to_free_inode = to_free_inode.min(state.items.len() as u64);
            warn!(
                "cache eviction due to inode limit, to_free_inode = {}",
                to_free_inode
            );
        }
        self.evict_entries(state, to_free_cap, to_free_inode);
    }

    /// Hot-path pass sized for an imminent allocation: recover `free_ratio`
    /// as if `pre_alloc_size` plus every outstanding reservation were
    /// already taken.
    fn cleanup_for_evict(&self, state: &mut CacheState, pre_alloc_size: u64) {
        let target = self.free_ratio;
        let mut to_free_cap: u64 = 0;
        let mut to_free_inode: u64 = 0;

        let pending = pre_alloc_size + self.reserved_cap.load(Ordering::SeqCst);
        let free_block_ratio = if state.total_cap > 0 {
            state.block_ratio - pending as f64 / state.total_cap as f64
        } else {
            0.0
        };
        if free_block_ratio < target {
            to_free_cap = (state.total_cap as f64 * (target - free_block_ratio)) as u64;
            to_free_cap = to_free_cap.min(state.used_cap);
            warn!("cache eviction due to block limit, to_free_cap = {}", to_free_cap);
        }
        if state.inode_ratio < target {
            to_free_inode = (state.total_inodes as f64 * (target - state.inode_ratio)) as u64;
            to_free_inode = to_free_inode.min(state.items.len() as u64);
            warn!(
                "cache eviction due to inode limit, to_free_inode = {}",
                to_free_inode
            );
        }
        self.evict_entries(state, to_free_cap, to_free_inode);
    }

    /// Evict oldest-first until the freed targets are met. Pinned entries
    /// are skipped.
    fn evict_entries(&self, state: &mut CacheState, to_free_cap: u64, to_free_inode: u64) {
        if to_free_cap == 0 && to_free_inode == 0 {
            return;
        }

        let mut freed_cap: u64 = 0;
        let mut freed_inode: u64 = 0;
        let mut kept: Vec<u64> = Vec::new();

        while let Some(key) = state.order.pop_front() {
            let item = match state.items.get(&key) {
                Some(item) => *item,
                // Stale id left behind by delete.
                None => continue,
            };
            if item.refs > 0 {
                kept.push(key);
                continue;
            }
            let file = self.file_path(key);
            match std::fs::remove_file(&file) {
                Ok(()) => {
                    freed_cap += item.size;
                    freed_inode += 1;
                    state.items.remove(&key);
                    state.used_cap -= item.size;
                    state.free_cap += item.size;
                    warn!("evicted cache file {:?}", file);
                }
                Err(e) => {
                    kept.push(key);
                    warn!("evicting cache file {:?} failed: {}", file, e);
                }
            }
            if freed_cap >= to_free_cap && freed_inode >= to_free_inode {
                break;
            }
        }
        // Skipped entries go back in front, preserving age order.
        for key in kept.into_iter().rev() {
            state.order.push_front(key);
        }
        info!("evicted {} files, {} bytes", freed_inode, freed_cap);
    }

    /// Returns true when the inode is cached; pinning refreshes the atime.
    pub fn find(&self, key: u64, pin: bool) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return self.file_path(key).exists();
        }
        let mut state = self.state.lock().unwrap();
        match state.items.get_mut(&key) {
            Some(item) => {
                if pin {
                    item.refs += 1;
                    item.atime = now_secs();
                }
                true
            }
            None => false,
        }
    }

    pub fn pin(&self, key: u64) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items.get_mut(&key) {
            item.refs += 1;
            item.atime = now_secs();
        }
    }

    /// Unpin of an unknown inode is a no-op.
    pub fn unpin(&self, key: u64) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items.get_mut(&key) {
            if item.refs > 0 {
                item.refs -= 1;
            }
        }
    }

    /// Idempotent insert; an existing entry gets its size replaced and the
    /// capacity accounting adjusted by the delta. Only a fresh insert takes
    /// the pin; updating an existing entry never does.
    pub fn insert_or_update(&self, key: u64, size: u64, pin: bool) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        match state.items.get(&key).copied() {
            Some(old) => {
                state.used_cap = (state.used_cap + size).saturating_sub(old.size);
                state.free_cap = (state.free_cap + old.size).saturating_sub(size);
                let item = state.items.get_mut(&key).unwrap();
                item.size = size;
                item.atime = now_secs();
            }
            None => {
                state.order.push_back(key);
                state.items.insert(
                    key,
                    CacheItem {
                        size,
                        atime: now_secs(),
                        refs: if pin { 1 } else { 0 },
                    },
                );
                state.used_cap += size;
                state.free_cap = state.free_cap.saturating_sub(size);
            }
        }
    }

    /// Grow an existing entry by `delta`. The entry must exist.
    pub fn add(&self, key: u64, delta: u64) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        match state.items.get_mut(&key) {
            Some(item) => {
                item.size += delta;
                item.atime = now_secs();
                state.used_cap += delta;
                state.free_cap = state.free_cap.saturating_sub(delta);
                true
            }
            None => {
                error!("DiskCache::add(): inode {} not found", key);
                false
            }
        }
    }

    /// Raise an existing entry's size to `size`; shrinking is ignored.
    pub fn update(&self, key: u64, size: u64) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        match state.items.get(&key).copied() {
            Some(old) => {
                if size <= old.size {
                    return true;
                }
                state.used_cap += size - old.size;
                state.free_cap = state.free_cap.saturating_sub(size - old.size);
                let item = state.items.get_mut(&key).unwrap();
                item.size = size;
                item.atime = now_secs();
                true
            }
            None => {
                error!("DiskCache::update(): inode {} not found", key);
                false
            }
        }
    }

    /// Unlink the backing file and release the bytes.
    pub fn delete(&self, key: u64) -> i32 {
        let file = self.file_path(key);
        if self.stop.load(Ordering::SeqCst) {
            return match std::fs::remove_file(&file) {
                Ok(()) => 0,
                Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            };
        }
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items.get(&key).copied() {
            if let Err(e) = std::fs::remove_file(&file) {
                let err = e.raw_os_error().unwrap_or(libc::EIO);
                error!("delete cache file {:?} failed: {}", file, e);
                return -err;
            }
            state.items.remove(&key);
            state.used_cap -= item.size;
            state.free_cap += item.size;
            info!("deleted cache file {:?}", file);
        }
        0
    }

    /// Purge a stale entry after a node handoff, but only when unpinned.
    pub fn delete_old_cache_no_pin(&self, key: u64) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.items.get(&key).copied() {
            if item.refs > 0 {
                return;
            }
            let file = self.file_path(key);
            if let Err(e) = std::fs::remove_file(&file) {
                error!("purging cache file {:?} failed: {}", file, e);
                return;
            }
            state.items.remove(&key);
            state.used_cap -= item.size;
            state.free_cap += item.size;
        }
    }

    /// One synchronous eviction pass sized for an imminent allocation.
    pub fn evict(&self, size: u64) {
        let mut state = self.state.lock().unwrap();
        if self.refresh_ratios(&mut state).is_err() {
            return;
        }
        self.cleanup_for_evict(&mut state, size);
    }

    /// Reserve virtual capacity ahead of a write or download. On deficit,
    /// retries a synchronous eviction up to 3 times with 1 s backoff.
    pub fn pre_alloc(&self, size: u64) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return true;
        }
        let _guard = self.alloc_lock.lock().unwrap();
        let free = self.state.lock().unwrap().free_cap;
        if self.reserved_cap.load(Ordering::SeqCst) + size < free {
            self.reserved_cap.fetch_add(size, Ordering::SeqCst);
            return true;
        }

        self.has_free_space.store(false, Ordering::SeqCst);
        let mut retry = PRE_ALLOC_RETRY;
        loop {
            if retry == 0 {
                warn!(
                    "pre_alloc failed, size = {}, reserved = {}",
                    size,
                    self.reserved_cap.load(Ordering::SeqCst)
                );
                return false;
            }
            self.evict(size);
            retry -= 1;
            std::thread::sleep(Duration::from_secs(1));
            let free = self.state.lock().unwrap().free_cap;
            if self.reserved_cap.load(Ordering::SeqCst) + size < free {
                break;
            }
        }
        self.has_free_space.store(true, Ordering::SeqCst);
        self.reserved_cap.fetch_add(size, Ordering::SeqCst);
        true
    }

    pub fn free_pre_alloc(&self, size: u64) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.alloc_lock.lock().unwrap();
        self.reserved_cap.fetch_sub(size, Ordering::SeqCst);
    }

    pub fn has_free_space(&self) -> bool {
        self.has_free_space.load(Ordering::SeqCst)
    }

    /// Stop the background evictor and disable further accounting.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.evictor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn used_capacity(&self) -> u64 {
        self.state.lock().unwrap().used_cap
    }

    pub fn entry(&self, key: u64) -> Option<CacheItem> {
        self.state.lock().unwrap().items.get(&key).copied()
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.evictor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
