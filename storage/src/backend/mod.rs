// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Durable blob-store tier behind the cache. The engine only sees the
//! [`BlobBackend`] trait; concrete backends are chosen by the factory.

pub mod localfs;
pub mod obs;

use std::collections::HashMap;
use std::io::Result;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use falcon_utils::stats::FalconStats;

use crate::StatFsBuf;

pub trait BlobBackend: Send + Sync {
    /// Ranged read of an object. `size == 0` means "to the end". Bytes
    /// stream into `fd` (when given, at their object offsets relative to
    /// `offset`) and/or into `buf`. Returns the byte count.
    fn read_object(
        &self,
        key: &str,
        offset: u64,
        size: u64,
        fd: Option<RawFd>,
        buf: Option<&mut [u8]>,
    ) -> Result<usize>;

    fn put_file(&self, key: &str, path: &std::path::Path) -> Result<()>;

    fn put_buffer(&self, key: &str, buf: &[u8], offset: u64) -> Result<()>;

    fn delete_object(&self, key: &str) -> Result<()>;

    fn copy_object(&self, src: &str, dst: &str) -> Result<()>;

    fn stat_fs(&self) -> Result<StatFsBuf>;

    fn close(&self) {}
}

pub fn new_backend(
    kind: &str,
    config: &HashMap<String, String>,
    stats: Arc<FalconStats>,
) -> Result<Arc<dyn BlobBackend>> {
    match kind {
        "obs" => Ok(obs::new(config, stats)? as Arc<dyn BlobBackend>),
        "localfs" => Ok(localfs::new(config, stats)? as Arc<dyn BlobBackend>),
        _ => Err(einval!(format!("unsupported backend type '{}'", kind))),
    }
}
