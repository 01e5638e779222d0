// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Objects in a local directory tree. Serves single-node deployments and
//! the test suite; object keys map directly to relative paths.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Result, Seek, SeekFrom, Write};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use falcon_utils::stats::{FalconStats, StatItem};

use super::BlobBackend;
use crate::StatFsBuf;

pub struct LocalFs {
    root: PathBuf,
    stats: Arc<FalconStats>,
}

pub fn new(config: &HashMap<String, String>, stats: Arc<FalconStats>) -> Result<Arc<LocalFs>> {
    let root = config
        .get("dir")
        .ok_or_else(|| einval!("localfs backend needs a 'dir' entry"))?;
    LocalFs::with_root(Path::new(root), stats)
}

impl LocalFs {
    pub fn with_root(root: &Path, stats: Arc<FalconStats>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(root)?;
        Ok(Arc::new(LocalFs {
            root: root.to_path_buf(),
            stats,
        }))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl BlobBackend for LocalFs {
    fn read_object(
        &self,
        key: &str,
        offset: u64,
        size: u64,
        fd: Option<RawFd>,
        buf: Option<&mut [u8]>,
    ) -> Result<usize> {
        let path = self.object_path(key);
        let mut file =
            File::open(&path).map_err(|e| enoent!(format!("object {:?}: {}", path, e)))?;
        let total = file.metadata()?.len();
        if offset >= total {
            return Ok(0);
        }
        let wanted = if size == 0 {
            total - offset
        } else {
            size.min(total - offset)
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; wanted as usize];
        file.read_exact(&mut data)?;
        self.stats.add(StatItem::ObjGet, data.len() as u64);

        if let Some(out) = buf {
            let count = out.len().min(data.len());
            out[..count].copy_from_slice(&data[..count]);
        }
        if let Some(fd) = fd {
            let mut written = 0usize;
            while written < data.len() {
                let n = nix::sys::uio::pwrite(fd, &data[written..], written as libc::off_t)
                    .map_err(|e| eio!(format!("pwrite object {:?}: {}", path, e)))?;
                written += n;
            }
            self.stats.add(StatItem::BlockcacheWrite, data.len() as u64);
        }
        Ok(data.len())
    }

    fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let dst = self.object_path(key);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let copied = std::fs::copy(path, &dst)?;
        self.stats.add(StatItem::ObjPut, copied);
        Ok(())
    }

    fn put_buffer(&self, key: &str, buf: &[u8], offset: u64) -> Result<()> {
        let dst = self.object_path(key);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create(true).open(&dst)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        self.stats.add(StatItem::ObjPut, buf.len() as u64);
        Ok(())
    }

    fn delete_object(&self, key: &str) -> Result<()> {
        std::fs::remove_file(self.object_path(key))
    }

    fn copy_object(&self, src: &str, dst: &str) -> Result<()> {
        let to = self.object_path(dst);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(self.object_path(src), to)?;
        Ok(())
    }

    fn stat_fs(&self) -> Result<StatFsBuf> {
        let fs = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|e| eio!(format!("statvfs {:?}: {}", self.root, e)))?;
        Ok(StatFsBuf {
            f_blocks: fs.blocks() as u64,
            f_bfree: fs.blocks_free() as u64,
            f_bavail: fs.blocks_available() as u64,
            f_files: fs.files() as u64,
            f_ffree: fs.files_free() as u64,
        })
    }
}
