// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The FalconFS client-side storage engine: a local LRU block cache backed
//! by peer storage nodes and an object store, driven through per-open
//! instances handed out by the fd table.

#[macro_use]
extern crate log;
#[macro_use]
extern crate falcon_utils;

use std::path::{Path, PathBuf};

pub mod backend;
pub mod buffer;
pub mod cache;
pub mod fd_table;
pub mod lock;
pub mod node;
pub mod server;
pub mod store;

/// Cap of the in-flight serial write buffer.
pub const STREAM_MAX_SIZE: usize = 256 * 1024;

/// Prefetch ring depth.
pub const PIPE_COUNT: usize = 3;

/// Timeout-retry policy for peer RPCs.
pub const RPC_RETRY_NUM: u32 = 3;
pub const RPC_RETRY_DELAY_SECS: u64 = 1;
pub const RPC_DEADLINE_SECS: u64 = 10;
pub const RPC_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Sentinel for "no backing descriptor yet".
pub const INVALID_FD: u64 = u64::MAX;

/// Aggregated filesystem usage, local or remote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatFsBuf {
    pub f_blocks: u64,
    pub f_bfree: u64,
    pub f_bavail: u64,
    pub f_files: u64,
    pub f_ffree: u64,
}

/// Cache file location: `root/{inode mod dir_num}/{inode}-large`. Shards
/// level out directory-entry contention.
pub fn cache_file_path(root: &Path, dir_num: u32, inode: u64) -> PathBuf {
    root.join(format!("{}", inode % dir_num as u64))
        .join(format!("{}-large", inode))
}

/// Object keys are the file path minus its leading '/'.
pub fn object_key(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_file_path() {
        let path = cache_file_path(Path::new("/var/cache/falcon"), 100, 1234);
        assert_eq!(path, PathBuf::from("/var/cache/falcon/34/1234-large"));
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("/a/b"), "a/b");
        assert_eq!(object_key("a/b"), "a/b");
        assert_eq!(object_key("/"), "");
    }
}
