// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A typed metadata connection to one server. Every call carries a 10 s
//! deadline, maps transport faults to `SERVER_FAULT` / `REMOTE_QUERY_FAILED`,
//! converts metadata timestamps into UNIX time, and refreshes the
//! connection's cached read-point from replies.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

use falcon_protocols::meta::meta_service_client::MetaServiceClient;
use falcon_protocols::meta::{
    Attr, ChmodRequest, ChownRequest, CloseRequest, PathRequest, ReadDirRequest, RenameRequest,
    ShardTableRequest, UtimeNsRequest,
};
use falcon_utils::expiring_cache::ExpiringCache;

/// Metadata success / failure codes (positive values cross the facade).
pub const SUCCESS: i32 = 0;
pub const FILE_EXISTS: i32 = 17;
pub const FILE_NOT_EXISTS: i32 = 2;
pub const SERVER_FAULT: i32 = 1000;
pub const REMOTE_QUERY_FAILED: i32 = 1001;
pub const PROGRAM_ERROR: i32 = 1002;
pub const NOT_FOUND_FD: i32 = 1003;

/// Seconds between the metadata epoch (2000-01-01) and the UNIX epoch.
const META_EPOCH_OFFSET_SECS: u64 = 946_684_800;

const META_DEADLINE: Duration = Duration::from_secs(10);
const META_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_POINT_TTL: Duration = Duration::from_secs(3);

const ST_BLKSIZE: u64 = 4096;
const ST_NBLOCKSIZE: u64 = 512;

pub fn error_code_to_errno(code: i32) -> i32 {
    match code {
        SUCCESS => 0,
        FILE_EXISTS => libc::EEXIST,
        FILE_NOT_EXISTS => libc::ENOENT,
        SERVER_FAULT | REMOTE_QUERY_FAILED => libc::EIO,
        PROGRAM_ERROR => libc::EFAULT,
        NOT_FOUND_FD => libc::EBADF,
        _ => libc::EIO,
    }
}

/// Fold a surface return (positive meta code or negative errno) into the
/// adapter's `-errno` shape.
pub fn to_neg_errno(ret: i32) -> i32 {
    if ret > 0 {
        -error_code_to_errno(ret)
    } else {
        ret
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerIdentifier {
    pub ip: String,
    pub port: u16,
    pub id: i32,
}

impl ServerIdentifier {
    pub fn new(ip: &str, port: u16, id: i32) -> Self {
        ServerIdentifier {
            ip: ip.to_string(),
            port,
            id,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

#[derive(Clone, Debug, Default)]
pub struct FileStat {
    pub st_ino: u64,
    pub st_dev: u64,
    pub st_mode: u32,
    pub st_nlink: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub st_size: i64,
    pub st_blksize: u64,
    pub st_blocks: u64,
    pub st_atim: TimeSpec,
    pub st_mtim: TimeSpec,
    pub st_ctim: TimeSpec,
}

fn convert_timestamp(t: u64) -> TimeSpec {
    TimeSpec {
        sec: (t / 1_000_000 + META_EPOCH_OFFSET_SECS) as i64,
        nsec: (t % 1_000_000) as i64,
    }
}

fn stat_from_attr(attr: &Attr) -> FileStat {
    let blocks = (attr.st_size as u64 + ST_BLKSIZE - 1) / ST_BLKSIZE * (ST_BLKSIZE / ST_NBLOCKSIZE);
    FileStat {
        st_ino: attr.st_ino,
        st_dev: attr.st_dev,
        st_mode: attr.st_mode,
        st_nlink: attr.st_nlink,
        st_uid: attr.st_uid,
        st_gid: attr.st_gid,
        st_rdev: attr.st_rdev,
        st_size: attr.st_size,
        st_blksize: ST_BLKSIZE,
        st_blocks: blocks,
        st_atim: convert_timestamp(attr.st_atim),
        st_mtim: convert_timestamp(attr.st_mtim),
        st_ctim: convert_timestamp(attr.st_ctim),
    }
}

/// `open` / `create` / `stat` payload.
pub struct AttrOut {
    /// `SUCCESS`, or `FILE_EXISTS` for a non-exclusive create.
    pub code: i32,
    pub stat: FileStat,
    pub node_id: i32,
}

pub struct ReadDirOut {
    pub entries: Vec<(String, u32)>,
    pub last_shard_index: i32,
    pub last_file_name: String,
}

pub struct UnlinkOut {
    pub inode_id: u64,
    pub size: i64,
    pub node_id: i32,
}

#[derive(Clone, Copy)]
pub struct ShardEntryOut {
    pub min_hash_key: i32,
    pub max_hash_key: i32,
    pub server_id: i32,
}

pub struct Connection {
    pub server: ServerIdentifier,
    channel: Channel,
    handle: Handle,
    // The leader's safe-to-read log position, cached per connection.
    read_point: ExpiringCache<i64>,
}

impl Connection {
    pub fn new(server: ServerIdentifier, handle: Handle) -> std::io::Result<Arc<Self>> {
        let uri = format!("http://{}", server.endpoint());
        let _guard = handle.enter();
        let channel = Endpoint::from_shared(uri)
            .map_err(|_| einval!(format!("bad metadata endpoint {}", server.endpoint())))?
            .connect_timeout(META_CONNECT_TIMEOUT)
            .timeout(META_DEADLINE)
            .connect_lazy();
        Ok(Arc::new(Connection {
            server,
            channel,
            handle,
            read_point: ExpiringCache::new(READ_POINT_TTL),
        }))
    }

    fn client(&self) -> MetaServiceClient<Channel> {
        MetaServiceClient::new(self.channel.clone())
    }

    pub fn read_point(&self) -> Option<i64> {
        self.read_point.get()
    }

    fn note_read_point(&self, read_point: i64) {
        if read_point != 0 {
            self.read_point.update(read_point);
        }
    }

    fn transport_fault(&self, status: &tonic::Status) -> i32 {
        error!(
            "metadata call to {} failed: code = {:?}, message = {}",
            self.server.endpoint(),
            status.code(),
            status.message()
        );
        match status.code() {
            Code::Unavailable | Code::DeadlineExceeded => SERVER_FAULT,
            _ => REMOTE_QUERY_FAILED,
        }
    }

    pub fn mkdir(&self, path: &str) -> i32 {
        let mut client = self.client();
        let request = PathRequest {
            path: path.to_string(),
        };
        match self.handle.block_on(client.mkdir(request)) {
            Ok(reply) => {
                let reply = reply.into_inner();
                self.note_read_point(reply.read_point);
                reply.error_code
            }
            Err(status) => self.transport_fault(&status),
        }
    }

    pub fn create(&self, path: &str) -> Result<AttrOut, i32> {
        let mut client = self.client();
        let request = PathRequest {
            path: path.to_string(),
        };
        let reply = self
            .handle
            .block_on(client.create(request))
            .map_err(|s| self.transport_fault(&s))?
            .into_inner();
        self.note_read_point(reply.read_point);
        // A create racing an existing file still carries the attributes.
        if reply.error_code != SUCCESS && reply.error_code != FILE_EXISTS {
            return Err(reply.error_code);
        }
        let attr = reply.attr.unwrap_or_default();
        Ok(AttrOut {
            code: reply.error_code,
            stat: stat_from_attr(&attr),
            node_id: reply.node_id,
        })
    }

    pub fn stat(&self, path: &str) -> Result<FileStat, i32> {
        let mut client = self.client();
        let request = PathRequest {
            path: path.to_string(),
        };
        let reply = self
            .handle
            .block_on(client.stat(request))
            .map_err(|s| self.transport_fault(&s))?
            .into_inner();
        self.note_read_point(reply.read_point);
        if reply.error_code != SUCCESS {
            return Err(reply.error_code);
        }
        Ok(stat_from_attr(&reply.attr.unwrap_or_default()))
    }

    pub fn open(&self, path: &str) -> Result<AttrOut, i32> {
        let mut client = self.client();
        let request = PathRequest {
            path: path.to_string(),
        };
        let reply = self
            .handle
            .block_on(client.open(request))
            .map_err(|s| self.transport_fault(&s))?
            .into_inner();
        self.note_read_point(reply.read_point);
        if reply.error_code != SUCCESS {
            return Err(reply.error_code);
        }
        Ok(AttrOut {
            code: SUCCESS,
            stat: stat_from_attr(&reply.attr.unwrap_or_default()),
            node_id: reply.node_id,
        })
    }

    pub fn close(&self, path: &str, size: i64, mtime: u64, node_id: i32) -> i32 {
        let mut client = self.client();
        let request = CloseRequest {
            path: path.to_string(),
            size,
            mtime,
            node_id,
        };
        match self.handle.block_on(client.close(request)) {
            Ok(reply) => {
                let reply = reply.into_inner();
                self.note_read_point(reply.read_point);
                reply.error_code
            }
            Err(status) => self.transport_fault(&status),
        }
    }

    pub fn unlink(&self, path: &str) -> Result<UnlinkOut, i32> {
        let mut client = self.client();
        let request = PathRequest {
            path: path.to_string(),
        };
        let reply = self
            .handle
            .block_on(client.unlink(request))
            .map_err(|s| self.transport_fault(&s))?
            .into_inner();
        self.note_read_point(reply.read_point);
        if reply.error_code != SUCCESS {
            return Err(reply.error_code);
        }
        Ok(UnlinkOut {
            inode_id: reply.st_ino,
            size: reply.st_size,
            node_id: reply.node_id,
        })
    }

    pub fn open_dir(&self, path: &str) -> Result<u64, i32> {
        let mut client = self.client();
        let request = PathRequest {
            path: path.to_string(),
        };
        let reply = self
            .handle
            .block_on(client.open_dir(request))
            .map_err(|s| self.transport_fault(&s))?
            .into_inner();
        self.note_read_point(reply.read_point);
        if reply.error_code != SUCCESS {
            return Err(reply.error_code);
        }
        Ok(reply.st_ino)
    }

    pub fn read_dir(
        &self,
        path: &str,
        max_read_count: i32,
        last_shard_index: i32,
        last_file_name: &str,
    ) -> Result<ReadDirOut, i32> {
        let mut client = self.client();
        let request = ReadDirRequest {
            path: path.to_string(),
            max_read_count,
            last_shard_index,
            last_file_name: last_file_name.to_string(),
        };
        let reply = self
            .handle
            .block_on(client.read_dir(request))
            .map_err(|s| self.transport_fault(&s))?
            .into_inner();
        self.note_read_point(reply.read_point);
        if reply.error_code != SUCCESS {
            return Err(reply.error_code);
        }
        Ok(ReadDirOut {
            entries: reply
                .entries
                .into_iter()
                .map(|e| (e.name, e.st_mode))
                .collect(),
            last_shard_index: reply.last_shard_index,
            last_file_name: reply.last_file_name,
        })
    }

    pub fn rmdir(&self, path: &str) -> i32 {
        let mut client = self.client();
        let request = PathRequest {
            path: path.to_string(),
        };
        match self.handle.block_on(client.rmdir(request)) {
            Ok(reply) => {
                let reply = reply.into_inner();
                self.note_read_point(reply.read_point);
                reply.error_code
            }
            Err(status) => self.transport_fault(&status),
        }
    }

    pub fn rename(&self, src: &str, dst: &str) -> i32 {
        let mut client = self.client();
        let request = RenameRequest {
            src: src.to_string(),
            dst: dst.to_string(),
        };
        match self.handle.block_on(client.rename(request)) {
            Ok(reply) => {
                let reply = reply.into_inner();
                self.note_read_point(reply.read_point);
                reply.error_code
            }
            Err(status) => self.transport_fault(&status),
        }
    }

    pub fn utimens(&self, path: &str, atime: i64, mtime: i64) -> i32 {
        let mut client = self.client();
        let request = UtimeNsRequest {
            path: path.to_string(),
            atime,
            mtime,
        };
        match self.handle.block_on(client.utime_ns(request)) {
            Ok(reply) => {
                let reply = reply.into_inner();
                self.note_read_point(reply.read_point);
                reply.error_code
            }
            Err(status) => self.transport_fault(&status),
        }
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> i32 {
        let mut client = self.client();
        let request = ChownRequest {
            path: path.to_string(),
            uid,
            gid,
        };
        match self.handle.block_on(client.chown(request)) {
            Ok(reply) => {
                let reply = reply.into_inner();
                self.note_read_point(reply.read_point);
                reply.error_code
            }
            Err(status) => self.transport_fault(&status),
        }
    }

    pub fn chmod(&self, path: &str, mode: u32) -> i32 {
        let mut client = self.client();
        let request = ChmodRequest {
            path: path.to_string(),
            mode,
        };
        match self.handle.block_on(client.chmod(request)) {
            Ok(reply) => {
                let reply = reply.into_inner();
                self.note_read_point(reply.read_point);
                reply.error_code
            }
            Err(status) => self.transport_fault(&status),
        }
    }

    /// The coordinator's shard table: contiguous upper-bound keys over the
    /// full `i32` range plus each shard's endpoint.
    pub fn fetch_shard_table(&self) -> Result<Vec<(ShardEntryOut, ServerIdentifier)>, i32> {
        let mut client = self.client();
        let reply = self
            .handle
            .block_on(client.fetch_shard_table(ShardTableRequest {}))
            .map_err(|s| self.transport_fault(&s))?
            .into_inner();
        if reply.error_code != SUCCESS {
            return Err(reply.error_code);
        }
        Ok(reply
            .shards
            .into_iter()
            .map(|s| {
                (
                    ShardEntryOut {
                        min_hash_key: s.min_hash_key,
                        max_hash_key: s.max_hash_key,
                        server_id: s.server_id,
                    },
                    ServerIdentifier::new(&s.host, s.port as u16, s.server_id),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_conversion() {
        let ts = convert_timestamp(0);
        assert_eq!(ts.sec, META_EPOCH_OFFSET_SECS as i64);
        assert_eq!(ts.nsec, 0);

        let ts = convert_timestamp(1_500_000);
        assert_eq!(ts.sec, META_EPOCH_OFFSET_SECS as i64 + 1);
        assert_eq!(ts.nsec, 500_000);
    }

    #[test]
    fn test_stat_block_accounting() {
        let attr = Attr {
            st_size: 4097,
            ..Default::default()
        };
        let stat = stat_from_attr(&attr);
        assert_eq!(stat.st_blksize, 4096);
        assert_eq!(stat.st_blocks, 16);
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(error_code_to_errno(SUCCESS), 0);
        assert_eq!(error_code_to_errno(FILE_EXISTS), libc::EEXIST);
        assert_eq!(error_code_to_errno(FILE_NOT_EXISTS), libc::ENOENT);
        assert_eq!(error_code_to_errno(SERVER_FAULT), libc::EIO);
        assert_eq!(to_neg_errno(FILE_NOT_EXISTS), -libc::ENOENT);
        assert_eq!(to_neg_errno(-libc::EMFILE), -libc::EMFILE);
        assert_eq!(to_neg_errno(0), 0);
    }
}
