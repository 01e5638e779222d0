// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Directory listing state. A listing snapshots every metadata worker at
//! offset 0 and then fans out one paged request per still-producing worker
//! per epoch, keeping a `(last_shard_index, last_file_name)` cursor for each
//! so the adapter can consume entries one at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::connection::Connection;

pub const MAX_READ_COUNT: i32 = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntryOut {
    pub name: String,
    pub mode: u32,
}

#[derive(Default)]
pub struct DirOpenInstance {
    pub fd: u64,
    pub inode_id: u64,
    workers: HashMap<String, Arc<Connection>>,
    working: HashMap<String, Arc<Connection>>,
    cursors: HashMap<String, (i32, String)>,
    entries: Vec<DirEntryOut>,
    pub offset: usize,
}

impl DirOpenInstance {
    pub fn new(fd: u64, inode_id: u64) -> Self {
        DirOpenInstance {
            fd,
            inode_id,
            ..Default::default()
        }
    }

    /// Install the worker snapshot and reset every cursor; called when the
    /// adapter starts a listing from offset 0.
    pub fn set_workers(&mut self, workers: HashMap<String, Arc<Connection>>) {
        self.working = workers.clone();
        for endpoint in workers.keys() {
            self.cursors.insert(endpoint.clone(), (-1, String::new()));
        }
        self.workers = workers;
        self.entries.clear();
        self.offset = 0;
    }

    pub fn has_producers(&self) -> bool {
        !self.working.is_empty()
    }

    pub fn buffered(&self) -> &[DirEntryOut] {
        &self.entries
    }

    /// One fan-out round: every still-producing worker contributes a page
    /// continued from its cursor; a short page retires the worker.
    pub fn fill_epoch(&mut self, path: &str) -> Result<(), i32> {
        let mut retired = Vec::new();
        for (endpoint, conn) in &self.working {
            let cursor = self
                .cursors
                .get(endpoint)
                .cloned()
                .unwrap_or((-1, String::new()));
            let page = conn.read_dir(path, MAX_READ_COUNT, cursor.0, &cursor.1)?;
            let produced = page.entries.len();
            for (name, mode) in page.entries {
                self.entries.push(DirEntryOut { name, mode });
            }
            self.cursors.insert(
                endpoint.clone(),
                (page.last_shard_index, page.last_file_name),
            );
            if produced < MAX_READ_COUNT as usize {
                retired.push(endpoint.clone());
            }
        }
        for endpoint in retired {
            self.working.remove(&endpoint);
        }
        Ok(())
    }
}

/// Directory descriptors live in their own table; fds come from the shared
/// allocator so file and directory descriptors never collide.
#[derive(Default)]
pub struct DirTable {
    map: RwLock<HashMap<u64, Arc<Mutex<DirOpenInstance>>>>,
}

impl DirTable {
    pub fn insert(&self, fd: u64, instance: DirOpenInstance) {
        self.map
            .write()
            .unwrap()
            .insert(fd, Arc::new(Mutex::new(instance)));
    }

    pub fn get(&self, fd: u64) -> Option<Arc<Mutex<DirOpenInstance>>> {
        self.map.read().unwrap().get(&fd).cloned()
    }

    pub fn remove(&self, fd: u64) -> bool {
        self.map.write().unwrap().remove(&fd).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_table_lifecycle() {
        let table = DirTable::default();
        table.insert(5, DirOpenInstance::new(5, 77));
        let inst = table.get(5).unwrap();
        assert_eq!(inst.lock().unwrap().inode_id, 77);
        assert!(table.remove(5));
        assert!(!table.remove(5));
        assert!(table.get(5).is_none());
    }

    #[test]
    fn test_snapshot_resets_state() {
        let mut inst = DirOpenInstance::new(3, 1);
        inst.entries.push(DirEntryOut {
            name: "stale".to_string(),
            mode: 0,
        });
        inst.offset = 4;
        inst.set_workers(HashMap::new());
        assert!(inst.buffered().is_empty());
        assert_eq!(inst.offset, 0);
        assert!(!inst.has_producers());
    }
}
