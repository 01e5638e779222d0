// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Typed blocking client for the peer I/O service. Transport-level faults
//! fold into positive errnos (connection class); application-level failures
//! arrive as negative errnos inside the reply. Callers branch on the sign to
//! decide between node failover and surfacing the error.

use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle;
use tonic::transport::{Channel, Endpoint};

use falcon_protocols::peer::peer_io_client::PeerIoClient;
use falcon_protocols::peer::{
    CheckConnectionRequest, CloseRequest, DeleteRequest, OpenRequest, ReadRequest,
    ReadSmallFileRequest, StatClusterRequest, StatFsRequest, TruncateFileRequest,
    TruncateOpenInstanceRequest, WriteRequest,
};
use falcon_protocols::status_to_errno;

use crate::{StatFsBuf, RPC_CONNECT_TIMEOUT_SECS, RPC_DEADLINE_SECS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcError {
    /// Transport fault, carried as a positive errno.
    Transport(i32),
    /// Remote I/O fault, carried as a negative errno.
    Remote(i32),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Transport(e) if *e == libc::ETIMEDOUT)
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }

    pub fn to_neg_errno(&self) -> i32 {
        match self {
            RpcError::Transport(e) => -e,
            RpcError::Remote(e) => *e,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(e) => write!(f, "transport error (errno {})", e),
            RpcError::Remote(e) => write!(f, "remote error ({})", e),
        }
    }
}

fn reply_code(code: i32) -> Result<(), RpcError> {
    if code != 0 {
        Err(RpcError::Remote(code))
    } else {
        Ok(())
    }
}

pub struct FalconIoClient {
    endpoint: String,
    channel: Channel,
    handle: Handle,
}

impl FalconIoClient {
    pub fn new(handle: Handle, endpoint: &str) -> Result<Self, RpcError> {
        let uri = format!("http://{}", endpoint);
        let _guard = handle.enter();
        let channel = Endpoint::from_shared(uri)
            .map_err(|_| RpcError::Transport(libc::EINVAL))?
            .connect_timeout(Duration::from_secs(RPC_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(RPC_DEADLINE_SECS))
            .connect_lazy();
        Ok(FalconIoClient {
            endpoint: endpoint.to_string(),
            channel,
            handle,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn client(&self) -> PeerIoClient<Channel> {
        PeerIoClient::new(self.channel.clone())
    }

    pub fn check_connection(&self) -> Result<(), RpcError> {
        let mut client = self.client();
        let reply = self
            .handle
            .block_on(client.check_connection(CheckConnectionRequest {}))
            .map_err(|s| RpcError::Transport(status_to_errno(&s)))?
            .into_inner();
        reply_code(reply.error_code)
    }

    /// Open on the owning peer; returns the peer-assigned descriptor.
    pub fn open_file(
        &self,
        inode_id: u64,
        oflags: i32,
        size: u64,
        path: &str,
        node_fail: bool,
    ) -> Result<u64, RpcError> {
        let mut client = self.client();
        let request = OpenRequest {
            inode_id,
            oflags,
            path: path.to_string(),
            size,
            node_fail,
        };
        let reply = self
            .handle
            .block_on(client.open_file(request))
            .map_err(|s| {
                error!("open_file rpc to {} failed: {}", self.endpoint, s);
                RpcError::Transport(status_to_errno(&s))
            })?
            .into_inner();
        reply_code(reply.error_code)?;
        info!("opened remote file, peer fd = {}", reply.physical_fd);
        Ok(reply.physical_fd)
    }

    pub fn close_file(
        &self,
        physical_fd: u64,
        flush: bool,
        sync: bool,
        payload: &[u8],
        offset: i64,
    ) -> Result<(), RpcError> {
        let mut client = self.client();
        let request = CloseRequest {
            physical_fd,
            flush,
            sync,
            offset,
            payload: payload.to_vec(),
        };
        let reply = self
            .handle
            .block_on(client.close_file(request))
            .map_err(|s| {
                error!("close_file rpc to {} failed: {}", self.endpoint, s);
                RpcError::Transport(status_to_errno(&s))
            })?
            .into_inner();
        reply_code(reply.error_code)
    }

    /// Ranged read against an open peer descriptor. Short data is legal at
    /// end of file.
    pub fn read_file(
        &self,
        physical_fd: u64,
        read_size: usize,
        offset: i64,
        path: &str,
    ) -> Result<Vec<u8>, RpcError> {
        let mut client = self.client();
        let request = ReadRequest {
            physical_fd,
            offset,
            read_size: read_size as i64,
            path: path.to_string(),
        };
        let reply = self
            .handle
            .block_on(client.read_file(request))
            .map_err(|s| {
                error!("read_file rpc to {} failed: {}", self.endpoint, s);
                RpcError::Transport(status_to_errno(&s))
            })?
            .into_inner();
        reply_code(reply.error_code)?;
        if reply.payload.len() > read_size {
            error!("peer returned more bytes than requested");
            return Err(RpcError::Remote(-libc::EIO));
        }
        Ok(reply.payload)
    }

    /// Whole-body read of a small file; must return exactly `size` bytes.
    pub fn read_small_file(
        &self,
        inode_id: u64,
        size: usize,
        path: &str,
        oflags: i32,
        node_fail: bool,
    ) -> Result<Vec<u8>, RpcError> {
        let mut client = self.client();
        let request = ReadSmallFileRequest {
            inode_id,
            read_size: size as i64,
            path: path.to_string(),
            oflags,
            node_fail,
        };
        let reply = self
            .handle
            .block_on(client.read_small_file(request))
            .map_err(|s| {
                error!("read_small_file rpc to {} failed: {}", self.endpoint, s);
                RpcError::Transport(status_to_errno(&s))
            })?
            .into_inner();
        reply_code(reply.error_code)?;
        if reply.payload.len() != size {
            error!("peer small-file read returned {} bytes, wanted {}", reply.payload.len(), size);
            return Err(RpcError::Remote(-libc::EIO));
        }
        Ok(reply.payload)
    }

    pub fn write_file(&self, physical_fd: u64, buf: &[u8], offset: i64) -> Result<(), RpcError> {
        let mut client = self.client();
        let request = WriteRequest {
            physical_fd,
            offset,
            payload: buf.to_vec(),
        };
        let reply = self
            .handle
            .block_on(client.write_file(request))
            .map_err(|s| {
                error!("write_file rpc to {} failed: {}", self.endpoint, s);
                RpcError::Transport(status_to_errno(&s))
            })?
            .into_inner();
        reply_code(reply.error_code)?;
        if reply.write_size != buf.len() as i64 {
            error!("peer wrote {} bytes, wanted {}", reply.write_size, buf.len());
            return Err(RpcError::Remote(-libc::EIO));
        }
        Ok(())
    }

    pub fn delete_file(&self, inode_id: u64, node_id: i32, path: &str) -> Result<(), RpcError> {
        let mut client = self.client();
        let request = DeleteRequest {
            inode_id,
            node_id,
            path: path.to_string(),
        };
        let reply = self
            .handle
            .block_on(client.delete_file(request))
            .map_err(|s| {
                error!("delete_file rpc to {} failed: {}", self.endpoint, s);
                RpcError::Transport(status_to_errno(&s))
            })?
            .into_inner();
        reply_code(reply.error_code)
    }

    pub fn stat_fs(&self, path: &str) -> Result<StatFsBuf, RpcError> {
        let mut client = self.client();
        let request = StatFsRequest {
            path: path.to_string(),
        };
        let reply = self
            .handle
            .block_on(client.stat_fs(request))
            .map_err(|s| {
                error!("stat_fs rpc to {} failed: {}", self.endpoint, s);
                RpcError::Transport(status_to_errno(&s))
            })?
            .into_inner();
        reply_code(reply.error_code)?;
        Ok(StatFsBuf {
            f_blocks: reply.fblocks,
            f_bfree: reply.fbfree,
            f_bavail: reply.fbavail,
            f_files: reply.ffiles,
            f_ffree: reply.fffree,
        })
    }

    pub fn truncate_open_instance(&self, physical_fd: u64, size: i64) -> Result<(), RpcError> {
        let mut client = self.client();
        let request = TruncateOpenInstanceRequest { physical_fd, size };
        let reply = self
            .handle
            .block_on(client.truncate_open_instance(request))
            .map_err(|s| {
                error!("truncate_open_instance rpc to {} failed: {}", self.endpoint, s);
                RpcError::Transport(status_to_errno(&s))
            })?
            .into_inner();
        reply_code(reply.error_code)
    }

    pub fn truncate_file(&self, physical_fd: u64, size: i64) -> Result<(), RpcError> {
        let mut client = self.client();
        let request = TruncateFileRequest { physical_fd, size };
        let reply = self
            .handle
            .block_on(client.truncate_file(request))
            .map_err(|s| {
                error!("truncate_file rpc to {} failed: {}", self.endpoint, s);
                RpcError::Transport(status_to_errno(&s))
            })?
            .into_inner();
        reply_code(reply.error_code)
    }

    pub fn stat_cluster(&self, node_id: i32, scatter: bool) -> Result<Vec<u64>, RpcError> {
        let mut client = self.client();
        let request = StatClusterRequest { node_id, scatter };
        let reply = self
            .handle
            .block_on(client.stat_cluster(request))
            .map_err(|s| RpcError::Transport(status_to_errno(&s)))?
            .into_inner();
        reply_code(reply.error_code)?;
        Ok(reply.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_signs() {
        let transport = RpcError::Transport(libc::ETIMEDOUT);
        assert!(transport.is_timeout());
        assert!(transport.is_connection());
        assert_eq!(transport.to_neg_errno(), -libc::ETIMEDOUT);

        let remote = RpcError::Remote(-libc::ENOENT);
        assert!(!remote.is_connection());
        assert_eq!(remote.to_neg_errno(), -libc::ENOENT);
    }

    #[test]
    fn test_reply_code_passthrough() {
        assert!(reply_code(0).is_ok());
        assert_eq!(
            reply_code(-libc::EBADF).unwrap_err(),
            RpcError::Remote(-libc::EBADF)
        );
    }
}
