// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The thin facade a file-system adapter drives: typed metadata operations
//! routed by shard plus data operations delegated to the storage engine.
//! Returns are 0 / byte counts, positive metadata codes, or negative errnos;
//! the adapter folds positives with [`connection::to_neg_errno`].

#[macro_use]
extern crate log;
#[macro_use]
extern crate falcon_utils;

pub mod connection;
pub mod dir_stream;
pub mod hash;
pub mod router;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use falcon_storage::buffer::open_instance::OpenInstance;
use falcon_storage::fd_table::FalconFd;
use falcon_storage::store::FalconStore;
use falcon_storage::StatFsBuf;
use falcon_utils::stats::{FalconStats, StatItem, StatTimer};

use connection::{
    AttrOut, Connection, FileStat, FILE_EXISTS, NOT_FOUND_FD, PROGRAM_ERROR, SERVER_FAULT, SUCCESS,
};
use dir_stream::{DirEntryOut, DirOpenInstance, DirTable};
use router::{Router, RETRY_CNT, RETRY_SLEEP};

pub use connection::{error_code_to_errno, to_neg_errno};

pub struct FalconFs {
    router: Arc<Router>,
    store: Arc<FalconStore>,
    fd_table: Arc<FalconFd>,
    dirs: DirTable,
    stats: Arc<FalconStats>,
}

impl FalconFs {
    pub fn new(router: Arc<Router>, store: Arc<FalconStore>) -> Arc<Self> {
        let fd_table = store.fd_table().clone();
        let stats = store.stats().clone();
        Arc::new(FalconFs {
            router,
            store,
            fd_table,
            dirs: DirTable::default(),
            stats,
        })
    }

    pub fn store(&self) -> &Arc<FalconStore> {
        &self.store
    }

    pub fn destroy(&self) {
        self.store.shutdown();
    }

    fn worker(&self, path: &str) -> Result<Arc<Connection>, i32> {
        self.router.worker_by_path(path).ok_or_else(|| {
            error!("route error for {}", path);
            PROGRAM_ERROR
        })
    }

    fn retry_code(&self, conn: Arc<Connection>, call: impl Fn(&Connection) -> i32) -> i32 {
        let mut conn = conn;
        let mut code = call(&conn);
        let mut cnt = 0;
        while cnt < RETRY_CNT && code == SERVER_FAULT {
            cnt += 1;
            std::thread::sleep(RETRY_SLEEP);
            conn = self.router.try_update_worker_conn(&conn);
            code = call(&conn);
        }
        code
    }

    fn retry_result<T>(
        &self,
        conn: Arc<Connection>,
        call: impl Fn(&Connection) -> Result<T, i32>,
    ) -> Result<T, i32> {
        let mut conn = conn;
        let mut result = call(&conn);
        let mut cnt = 0;
        while cnt < RETRY_CNT && matches!(result, Err(SERVER_FAULT)) {
            cnt += 1;
            std::thread::sleep(RETRY_SLEEP);
            conn = self.router.try_update_worker_conn(&conn);
            result = call(&conn);
        }
        result
    }

    /*---------------------- metadata-only operations ----------------------*/

    pub fn mkdir(&self, path: &str) -> i32 {
        self.stats.inc(StatItem::MetaMkdir);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);
        match self.worker(path) {
            Ok(conn) => self.retry_code(conn, |c| c.mkdir(path)),
            Err(code) => code,
        }
    }

    pub fn rmdir(&self, path: &str) -> i32 {
        self.stats.inc(StatItem::MetaRmdir);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);
        match self.worker(path) {
            Ok(conn) => self.retry_code(conn, |c| c.rmdir(path)),
            Err(code) => code,
        }
    }

    pub fn stat(&self, path: &str) -> Result<FileStat, i32> {
        self.stats.inc(StatItem::MetaStat);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, Some(StatItem::MetaStatLat));
        let conn = self.worker(path)?;
        let result = self.retry_result(conn, |c| c.stat(path));
        if let Err(code) = &result {
            if *code != connection::FILE_NOT_EXISTS {
                error!("stat failed for {}: code {}", path, code);
            }
        }
        result
    }

    pub fn utimens(&self, path: &str, atime: i64, mtime: i64) -> i32 {
        match self.worker(path) {
            Ok(conn) => self.retry_code(conn, |c| c.utimens(path, atime, mtime)),
            Err(code) => code,
        }
    }

    pub fn chmod(&self, path: &str, mode: u32) -> i32 {
        match self.worker(path) {
            Ok(conn) => self.retry_code(conn, |c| c.chmod(path, mode)),
            Err(code) => code,
        }
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> i32 {
        match self.worker(path) {
            Ok(conn) => self.retry_code(conn, |c| c.chown(path, uid, gid)),
            Err(code) => code,
        }
    }

    /// Rename, carrying the object-store body along when persistence is on:
    /// copy to the new key first, flip the metadata, then drop the old key.
    pub fn rename(&self, src: &str, dst: &str) -> i32 {
        self.stats.inc(StatItem::MetaRename);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);
        if self.store.persist() {
            let ret = self.store.copy_data(src, dst);
            if ret != 0 {
                error!("rename: object copy {} -> {} failed", src, dst);
                return ret;
            }
        }
        let code = match self.worker(src) {
            Ok(conn) => self.retry_code(conn, |c| c.rename(src, dst)),
            Err(code) => code,
        };
        if code == SUCCESS && self.store.persist() {
            let ret = self.store.delete_data_after_rename(src);
            if ret != 0 {
                warn!("rename: dropping stale object {} failed", src);
            }
        } else if code != SUCCESS && self.store.persist() {
            let _ = self.store.delete_data_after_rename(dst);
        }
        code
    }

    /*---------------------- open / create ----------------------*/

    pub fn open(&self, path: &str, oflags: i32) -> Result<(u64, FileStat), i32> {
        self.stats.inc(StatItem::MetaOpen);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, Some(StatItem::MetaOpenLat));
        let conn = self.worker(path)?;

        let inst = match self.fd_table.wait_new_instance(true) {
            Some(inst) => inst,
            None => {
                error!("open: no instance available");
                return Err(-libc::EMFILE);
            }
        };

        let out = match self.retry_result(conn, |c| c.open(path)) {
            Ok(out) => out,
            Err(code) => {
                self.fd_table.release_instance(&inst);
                error!("open failed for {}: code {}", path, code);
                return Err(code);
            }
        };

        self.fill_instance(&inst, path, oflags, &out);

        if out.stat.st_size > 0
            && (out.stat.st_size as u64) < self.store.big_file_read_size() as u64
            && oflags & libc::O_ACCMODE == libc::O_RDONLY
        {
            // Small read-only file: the whole body lands in memory before
            // open returns.
            *inst.read_buffer.write().unwrap() = vec![0u8; out.stat.st_size as usize];
            let ret = self.store.read_small_files(&inst);
            if ret < 0 {
                self.fd_table.release_instance(&inst);
                return Err(ret);
            }
        }

        let fd = self.fd_table.attach(path, &inst);
        Ok((fd, out.stat))
    }

    pub fn create(&self, path: &str, oflags: i32) -> Result<(u64, FileStat), i32> {
        self.stats.inc(StatItem::MetaCreate);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, Some(StatItem::MetaCreateLat));
        let conn = self.worker(path)?;

        let out = self.retry_result(conn, |c| c.create(path))?;
        if out.code == FILE_EXISTS && oflags & libc::O_EXCL != 0 {
            return Err(FILE_EXISTS);
        }

        let inst = match self.fd_table.wait_new_instance(true) {
            Some(inst) => inst,
            None => {
                error!("create: no instance available");
                return Err(-libc::EMFILE);
            }
        };
        self.fill_instance(&inst, path, oflags, &out);
        let fd = self.fd_table.attach(path, &inst);
        Ok((fd, out.stat))
    }

    fn fill_instance(&self, inst: &Arc<OpenInstance>, path: &str, oflags: i32, out: &AttrOut) {
        inst.inode_id.store(out.stat.st_ino, Ordering::SeqCst);
        inst.original_size
            .store(out.stat.st_size as u64, Ordering::SeqCst);
        inst.current_size
            .store(out.stat.st_size as u64, Ordering::SeqCst);
        inst.node_id.store(out.node_id, Ordering::SeqCst);
        inst.oflags.store(oflags, Ordering::SeqCst);
        *inst.path.write().unwrap() = path.to_string();
    }

    /*---------------------- data path ----------------------*/

    pub fn read(&self, fd: u64, buf: &mut [u8], offset: i64) -> i64 {
        self.stats.inc(StatItem::FuseReadOps);
        self.stats.inc(StatItem::FuseOps);
        let _t = StatTimer::new(&self.stats, StatItem::FuseLat, Some(StatItem::FuseReadLat));
        let inst = match self.fd_table.get(fd) {
            Some(inst) => inst,
            None => {
                error!("read: fd {} not found", fd);
                return -libc::EBADF as i64;
            }
        };
        let ret = self.store.read_file(&inst, buf, offset);
        if ret > 0 {
            self.stats.add(StatItem::FuseRead, ret as u64);
        }
        ret
    }

    pub fn write(&self, fd: u64, buf: &[u8], offset: i64) -> i32 {
        self.stats.inc(StatItem::FuseWriteOps);
        self.stats.inc(StatItem::FuseOps);
        let _t = StatTimer::new(&self.stats, StatItem::FuseLat, Some(StatItem::FuseWriteLat));
        let inst = match self.fd_table.get(fd) {
            Some(inst) => inst,
            None => {
                error!("write: fd {} not found", fd);
                return -libc::EBADF;
            }
        };
        let ret = self.store.write_file(&inst, buf, offset);
        if ret == 0 {
            self.stats.add(StatItem::FuseWrite, buf.len() as u64);
        }
        ret
    }

    /*---------------------- close / fsync ----------------------*/

    /// Two-phase close: once with `is_flush`, once without. `datasync >= 0`
    /// requests an fsync of the cache file; `datasync > 0` additionally
    /// forces the metadata update to be skipped.
    pub fn close(&self, path: &str, fd: u64, is_flush: bool, datasync: i32) -> i32 {
        self.stats.inc(StatItem::MetaRelease);
        let _t = StatTimer::new(
            &self.stats,
            StatItem::MetaLat,
            Some(StatItem::MetaReleaseLat),
        );
        let inst = match self.fd_table.get(fd) {
            Some(inst) => inst,
            None => {
                error!("close: fd {} not found", fd);
                return NOT_FOUND_FD;
            }
        };

        let size = inst.current_size();
        // Read-only small files never opened a data path.
        if inst.is_opened.load(Ordering::SeqCst) {
            let inner = self.store.close_tmp_files(&inst, is_flush, datasync >= 0);
            if inner != 0 {
                if !is_flush {
                    self.fd_table.delete(fd, true);
                }
                return inner;
            }
        }

        // The metadata close is elided when nothing observable changed.
        if inst.read_fail.load(Ordering::SeqCst)
            || inst.write_fail.load(Ordering::SeqCst)
            || datasync > 0
            || (!inst.node_fail.load(Ordering::SeqCst) && size == inst.original_size())
        {
            let read_fail = inst.read_fail.load(Ordering::SeqCst);
            if !is_flush {
                self.fd_table.delete(fd, true);
            }
            if read_fail {
                return -libc::EIO;
            }
            return SUCCESS;
        }

        let code = match self.worker(path) {
            Ok(conn) => self.retry_code(conn, |c| c.close(path, size as i64, 0, inst.node_id())),
            Err(code) => code,
        };
        if code != SUCCESS {
            error!("close failed for {}: code {}", path, code);
        }
        inst.original_size.store(size, Ordering::SeqCst);
        if !is_flush {
            self.fd_table.delete(fd, true);
        }
        code
    }

    pub fn fsync(&self, path: &str, fd: u64, datasync: i32) -> i32 {
        self.stats.inc(StatItem::MetaFsync);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);
        self.close(path, fd, true, if datasync == 0 { 0 } else { 1 })
    }

    /*---------------------- unlink / truncate / statfs ----------------------*/

    pub fn unlink(&self, path: &str) -> i32 {
        self.stats.inc(StatItem::MetaUnlink);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);
        let conn = match self.worker(path) {
            Ok(conn) => conn,
            Err(code) => return code,
        };
        match self.retry_result(conn, |c| c.unlink(path)) {
            Ok(out) => {
                let ret = self.store.delete_files(out.inode_id, out.node_id, path);
                if ret != 0 {
                    warn!("unlink: dropping cached body of {} failed", path);
                }
                SUCCESS
            }
            Err(code) => {
                error!("unlink failed for {}: code {}", path, code);
                code
            }
        }
    }

    /// Truncate every sibling instance through its owning node, record the
    /// size with the metadata service, then flush-and-release.
    pub fn truncate(&self, path: &str, size: i64) -> i32 {
        self.stats.inc(StatItem::MetaTruncate);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);

        let (fd, _stat) = match self.open(path, libc::O_WRONLY) {
            Ok(out) => out,
            Err(code) => return code,
        };
        let inst = match self.fd_table.get(fd) {
            Some(inst) => inst,
            None => return NOT_FOUND_FD,
        };

        let mut ret = 0;
        for sibling in self.fd_table.get_by_inode(inst.inode_id()) {
            let r = self.store.truncate_open_instance(&sibling, size);
            if r != 0 {
                ret = r;
            }
        }
        if ret == 0 {
            // The cache file may not exist yet; sizes must be adjusted
            // before the backing body is cut.
            ret = self.store.truncate_file(&inst, size);
        }
        if ret == 0 {
            let code = match self.worker(path) {
                Ok(conn) => {
                    self.retry_code(conn, |c| c.close(path, size, 0, inst.node_id()))
                }
                Err(code) => code,
            };
            if code != SUCCESS {
                ret = code;
            }
        }

        let flush = self.close(path, fd, true, -1);
        let release = self.close(path, fd, false, -1);
        if ret != 0 {
            ret
        } else if flush != 0 {
            flush
        } else {
            release
        }
    }

    pub fn statfs(&self) -> Result<StatFsBuf, i32> {
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);
        self.store.stat_fs()
    }

    /*---------------------- directories ----------------------*/

    pub fn opendir(&self, path: &str) -> Result<u64, i32> {
        self.stats.inc(StatItem::MetaOpendir);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);
        let conn = self.worker(path)?;
        let inode = self.retry_result(conn, |c| c.open_dir(path))?;
        let fd = self.fd_table.obtain_fd();
        self.dirs.insert(fd, DirOpenInstance::new(fd, inode));
        Ok(fd)
    }

    /// Entries from `offset` onward. Offset 0 re-snapshots the workers and
    /// restarts the epochs.
    pub fn readdir(&self, path: &str, fd: u64, offset: usize) -> Result<Vec<DirEntryOut>, i32> {
        self.stats.inc(StatItem::MetaReaddir);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);
        let dir = match self.dirs.get(fd) {
            Some(dir) => dir,
            None => {
                error!("readdir: dir fd {} not found", fd);
                return Err(NOT_FOUND_FD);
            }
        };
        let mut dir = dir.lock().unwrap();
        if offset == 0 {
            dir.set_workers(self.router.all_worker_connections());
        }
        while dir.buffered().len() <= offset && dir.has_producers() {
            dir.fill_epoch(path)?;
        }
        let entries = dir.buffered();
        let start = offset.min(entries.len());
        let out = entries[start..].to_vec();
        dir.offset = entries.len();
        Ok(out)
    }

    pub fn closedir(&self, fd: u64) -> i32 {
        self.stats.inc(StatItem::MetaReleasedir);
        let _t = StatTimer::new(&self.stats, StatItem::MetaLat, None);
        if self.dirs.remove(fd) {
            SUCCESS
        } else {
            error!("closedir: dir fd {} not found", fd);
            NOT_FOUND_FD
        }
    }
}
