// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The peer I/O server: exposes the engine to other storage nodes with the
//! same typed calls the engine consumes. The listener comes up before the
//! engine (so peers can probe connectivity during startup) and starts
//! answering data calls once `set_ready` installs the engine context.

use std::io::Result;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tonic::{Request, Response, Status};

use falcon_protocols::peer::peer_io_server::{PeerIo, PeerIoServer};
use falcon_protocols::peer::{
    CheckConnectionRequest, CloseRequest, DeleteRequest, ErrorCodeReply, OpenRequest, OpenReply,
    ReadReply, ReadRequest, ReadSmallFileRequest, StatClusterReply, StatClusterRequest,
    StatFsReply, StatFsRequest, TruncateFileRequest, TruncateOpenInstanceRequest, WriteReply,
    WriteRequest,
};

use crate::store::FalconStore;

#[derive(Clone)]
struct PeerIoService {
    ready: Arc<RwLock<Option<Arc<FalconStore>>>>,
}

impl PeerIoService {
    fn store(&self) -> Option<Arc<FalconStore>> {
        self.ready.read().unwrap().clone()
    }
}

/// Runs the blocking engine call off the async worker.
async fn run_blocking<T, F>(job: F) -> std::result::Result<T, Status>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| Status::internal(format!("engine task failed: {}", e)))
}

#[tonic::async_trait]
impl PeerIo for PeerIoService {
    async fn open_file(
        &self,
        request: Request<OpenRequest>,
    ) -> std::result::Result<Response<OpenReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(OpenReply {
                    error_code: -libc::EAGAIN,
                    physical_fd: 0,
                }))
            }
        };
        let req = request.into_inner();
        info!(
            "peer open_file request, path = {}, size = {}",
            req.path, req.size
        );

        let reply = run_blocking(move || {
            let inst = match store.fd_table().wait_new_instance(false) {
                Some(inst) => inst,
                None => {
                    return OpenReply {
                        error_code: -libc::ENOMEM,
                        physical_fd: 0,
                    }
                }
            };
            inst.inode_id.store(req.inode_id, Ordering::SeqCst);
            *inst.path.write().unwrap() = req.path.clone();
            inst.oflags.store(req.oflags, Ordering::SeqCst);
            inst.original_size.store(req.size, Ordering::SeqCst);
            inst.current_size.store(req.size, Ordering::SeqCst);
            inst.direct_read_file.store(true, Ordering::SeqCst);
            inst.node_id
                .store(store.node().node_id(), Ordering::SeqCst);
            inst.is_remote_call.store(true, Ordering::SeqCst);
            inst.node_fail.store(req.node_fail, Ordering::SeqCst);

            let ret = store.open_file(&inst);
            if ret != 0 {
                error!("peer open_file failed, ret = {}", ret);
                return OpenReply {
                    error_code: ret,
                    physical_fd: 0,
                };
            }
            let fd = store.fd_table().attach(&req.path, &inst);
            inst.is_opened.store(true, Ordering::SeqCst);
            info!("peer open_file returns falcon fd = {}", fd);
            OpenReply {
                error_code: 0,
                physical_fd: fd,
            }
        })
        .await?;
        Ok(Response::new(reply))
    }

    async fn close_file(
        &self,
        request: Request<CloseRequest>,
    ) -> std::result::Result<Response<ErrorCodeReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(ErrorCodeReply {
                    error_code: -libc::EAGAIN,
                }))
            }
        };
        let req = request.into_inner();
        info!("peer close_file request, fd = {}", req.physical_fd);

        let reply = run_blocking(move || {
            let inst = match store.fd_table().get(req.physical_fd) {
                Some(inst) => inst,
                None => {
                    error!("close_file: fd {} not found", req.physical_fd);
                    return ErrorCodeReply {
                        error_code: -libc::EBADF,
                    };
                }
            };

            let _close_guard = inst.close_mutex.write().unwrap();
            if inst.is_closed.load(Ordering::SeqCst) {
                return ErrorCodeReply {
                    error_code: -libc::ETIMEDOUT,
                };
            }

            let mut ret = 0;
            if !req.payload.is_empty() {
                inst.write_cnt.fetch_add(1, Ordering::SeqCst);
                ret = store.write_local_for_peer(&inst, &req.payload, req.offset);
                if ret != 0 {
                    error!("close_file: trailing write failed, ret = {}", ret);
                }
            }

            let close_ret = store.close_tmp_files(&inst, req.flush, req.sync);
            if ret == 0 {
                ret = close_ret;
            }
            if ret != 0 {
                error!("peer close_file failed, ret = {}", ret);
            }
            if !req.flush {
                inst.is_closed.store(true, Ordering::SeqCst);
                store.fd_table().delete(req.physical_fd, false);
            }
            ErrorCodeReply { error_code: ret }
        })
        .await?;
        Ok(Response::new(reply))
    }

    async fn read_file(
        &self,
        request: Request<ReadRequest>,
    ) -> std::result::Result<Response<ReadReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(ReadReply {
                    error_code: -libc::EAGAIN,
                    payload: Vec::new(),
                }))
            }
        };
        let req = request.into_inner();
        info!(
            "peer read_file request, fd = {}, offset = {}, size = {}",
            req.physical_fd, req.offset, req.read_size
        );
        if req.read_size < 0 {
            return Ok(Response::new(ReadReply {
                error_code: -libc::EAGAIN,
                payload: Vec::new(),
            }));
        }

        let reply = run_blocking(move || {
            let inst = match store.fd_table().get(req.physical_fd) {
                Some(inst) => inst,
                None => {
                    error!("read_file: fd {} not found", req.physical_fd);
                    return ReadReply {
                        error_code: -libc::EBADF,
                        payload: Vec::new(),
                    };
                }
            };
            let _close_guard = inst.close_mutex.read().unwrap();
            if inst.is_closed.load(Ordering::SeqCst) {
                return ReadReply {
                    error_code: -libc::ETIMEDOUT,
                    payload: Vec::new(),
                };
            }

            let mut payload = vec![0u8; req.read_size as usize];
            let ret = store.read_file_lr(&inst, &mut payload, req.offset);
            if ret < 0 {
                error!("peer read_file failed, ret = {}", ret);
                return ReadReply {
                    error_code: ret as i32,
                    payload: Vec::new(),
                };
            }
            payload.truncate(ret as usize);
            ReadReply {
                error_code: 0,
                payload,
            }
        })
        .await?;
        Ok(Response::new(reply))
    }

    async fn read_small_file(
        &self,
        request: Request<ReadSmallFileRequest>,
    ) -> std::result::Result<Response<ReadReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(ReadReply {
                    error_code: -libc::EAGAIN,
                    payload: Vec::new(),
                }))
            }
        };
        let req = request.into_inner();
        info!(
            "peer read_small_file request, inode = {}, size = {}",
            req.inode_id, req.read_size
        );
        if req.read_size < 0 || req.read_size > store.big_file_read_size() as i64 {
            return Ok(Response::new(ReadReply {
                error_code: -libc::EAGAIN,
                payload: Vec::new(),
            }));
        }

        let reply = run_blocking(move || {
            match store.read_small_for_peer(
                req.inode_id,
                &req.path,
                req.read_size as usize,
                req.oflags,
                req.node_fail,
            ) {
                Ok(payload) => ReadReply {
                    error_code: 0,
                    payload,
                },
                Err(err) => {
                    error!(
                        "peer read_small_file failed, inode = {}, ret = {}",
                        req.inode_id, err
                    );
                    ReadReply {
                        error_code: err,
                        payload: Vec::new(),
                    }
                }
            }
        })
        .await?;
        Ok(Response::new(reply))
    }

    async fn write_file(
        &self,
        request: Request<WriteRequest>,
    ) -> std::result::Result<Response<WriteReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(WriteReply {
                    error_code: -libc::EAGAIN,
                    write_size: 0,
                }))
            }
        };
        let req = request.into_inner();
        info!("peer write_file request, fd = {}", req.physical_fd);

        let reply = run_blocking(move || {
            let inst = match store.fd_table().get(req.physical_fd) {
                Some(inst) => inst,
                None => {
                    error!("write_file: fd {} not found", req.physical_fd);
                    return WriteReply {
                        error_code: -libc::EBADF,
                        write_size: 0,
                    };
                }
            };
            let _close_guard = inst.close_mutex.read().unwrap();
            if inst.is_closed.load(Ordering::SeqCst) {
                return WriteReply {
                    error_code: -libc::ETIMEDOUT,
                    write_size: 0,
                };
            }

            inst.write_cnt.fetch_add(1, Ordering::SeqCst);
            let ret = store.write_local_for_peer(&inst, &req.payload, req.offset);
            if ret < 0 {
                return WriteReply {
                    error_code: ret,
                    write_size: 0,
                };
            }
            WriteReply {
                error_code: 0,
                write_size: req.payload.len() as i64,
            }
        })
        .await?;
        Ok(Response::new(reply))
    }

    async fn delete_file(
        &self,
        request: Request<DeleteRequest>,
    ) -> std::result::Result<Response<ErrorCodeReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(ErrorCodeReply {
                    error_code: -libc::EAGAIN,
                }))
            }
        };
        let req = request.into_inner();
        info!(
            "peer delete_file request, inode = {}, node = {}",
            req.inode_id, req.node_id
        );
        let reply = run_blocking(move || ErrorCodeReply {
            error_code: store.delete_files(req.inode_id, -1, &req.path),
        })
        .await?;
        Ok(Response::new(reply))
    }

    async fn stat_fs(
        &self,
        request: Request<StatFsRequest>,
    ) -> std::result::Result<Response<StatFsReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(StatFsReply {
                    error_code: -libc::EAGAIN,
                    ..Default::default()
                }))
            }
        };
        let req = request.into_inner();
        let reply = run_blocking(move || match store.stat_fs_for_peer(&req.path) {
            Ok(usage) => StatFsReply {
                error_code: 0,
                fblocks: usage.f_blocks,
                fbfree: usage.f_bfree,
                fbavail: usage.f_bavail,
                ffiles: usage.f_files,
                fffree: usage.f_ffree,
            },
            Err(err) => StatFsReply {
                error_code: err,
                ..Default::default()
            },
        })
        .await?;
        Ok(Response::new(reply))
    }

    async fn truncate_open_instance(
        &self,
        request: Request<TruncateOpenInstanceRequest>,
    ) -> std::result::Result<Response<ErrorCodeReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(ErrorCodeReply {
                    error_code: -libc::EAGAIN,
                }))
            }
        };
        let req = request.into_inner();
        info!(
            "peer truncate_open_instance request, fd = {}, size = {}",
            req.physical_fd, req.size
        );
        let reply = run_blocking(move || {
            let inst = match store.fd_table().get(req.physical_fd) {
                Some(inst) => inst,
                None => {
                    error!("truncate_open_instance: fd {} not found", req.physical_fd);
                    return ErrorCodeReply {
                        error_code: -libc::EBADF,
                    };
                }
            };
            let _close_guard = inst.close_mutex.read().unwrap();
            if inst.is_closed.load(Ordering::SeqCst) {
                return ErrorCodeReply {
                    error_code: -libc::ETIMEDOUT,
                };
            }
            ErrorCodeReply {
                error_code: store.truncate_open_instance(&inst, req.size),
            }
        })
        .await?;
        Ok(Response::new(reply))
    }

    async fn truncate_file(
        &self,
        request: Request<TruncateFileRequest>,
    ) -> std::result::Result<Response<ErrorCodeReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(ErrorCodeReply {
                    error_code: -libc::EAGAIN,
                }))
            }
        };
        let req = request.into_inner();
        info!(
            "peer truncate_file request, fd = {}, size = {}",
            req.physical_fd, req.size
        );
        let reply = run_blocking(move || {
            let inst = match store.fd_table().get(req.physical_fd) {
                Some(inst) => inst,
                None => {
                    error!("truncate_file: fd {} not found", req.physical_fd);
                    return ErrorCodeReply {
                        error_code: -libc::EBADF,
                    };
                }
            };
            let _close_guard = inst.close_mutex.read().unwrap();
            if inst.is_closed.load(Ordering::SeqCst) {
                return ErrorCodeReply {
                    error_code: -libc::ETIMEDOUT,
                };
            }
            inst.write_cnt.fetch_add(1, Ordering::SeqCst);
            ErrorCodeReply {
                error_code: store.truncate_file(&inst, req.size),
            }
        })
        .await?;
        Ok(Response::new(reply))
    }

    async fn check_connection(
        &self,
        _request: Request<CheckConnectionRequest>,
    ) -> std::result::Result<Response<ErrorCodeReply>, Status> {
        Ok(Response::new(ErrorCodeReply { error_code: 0 }))
    }

    async fn stat_cluster(
        &self,
        request: Request<StatClusterRequest>,
    ) -> std::result::Result<Response<StatClusterReply>, Status> {
        let store = match self.store() {
            Some(store) => store,
            None => {
                return Ok(Response::new(StatClusterReply {
                    error_code: -libc::EAGAIN,
                    stats: Vec::new(),
                }))
            }
        };
        let req = request.into_inner();
        let reply = run_blocking(move || StatClusterReply {
            error_code: 0,
            stats: store.stat_cluster(req.node_id, req.scatter),
        })
        .await?;
        Ok(Response::new(reply))
    }
}

pub struct RemoteIoServer {
    endpoint: String,
    ready: Arc<RwLock<Option<Arc<FalconStore>>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteIoServer {
    pub fn new(endpoint: &str) -> Self {
        RemoteIoServer {
            endpoint: endpoint.to_string(),
            ready: Arc::new(RwLock::new(None)),
            shutdown: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Bind and serve on a dedicated runtime thread. Data calls answer
    /// `-EAGAIN` until `set_ready` installs the engine.
    pub fn start(&self) -> Result<()> {
        let addr: std::net::SocketAddr = self
            .endpoint
            .parse()
            .map_err(|_| einval!(format!("bad rpc endpoint {}", self.endpoint)))?;
        let service = PeerIoService {
            ready: self.ready.clone(),
        };
        let (tx, rx) = oneshot::channel::<()>();
        let (bound_tx, bound_rx) = std::sync::mpsc::channel::<Result<()>>();

        let handle = std::thread::Builder::new()
            .name("falcon_rpc_server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(4)
                    .thread_name("falcon_rpc")
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = bound_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let incoming = match tokio::net::TcpListener::bind(addr).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = bound_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = bound_tx.send(Ok(()));
                    let stream = tokio_stream::wrappers::TcpListenerStream::new(incoming);
                    let result = tonic::transport::Server::builder()
                        .add_service(PeerIoServer::new(service))
                        .serve_with_incoming_shutdown(stream, async {
                            let _ = rx.await;
                        })
                        .await;
                    if let Err(e) = result {
                        error!("peer rpc server failed: {}", e);
                    }
                });
            })?;

        bound_rx
            .recv()
            .map_err(|_| eio!("rpc server thread died during bind"))??;
        *self.shutdown.lock().unwrap() = Some(tx);
        *self.thread.lock().unwrap() = Some(handle);
        info!("peer rpc server listening on {}", self.endpoint);
        Ok(())
    }

    pub fn set_ready(&self, store: Arc<FalconStore>) {
        *self.ready.write().unwrap() = Some(store);
    }

    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.ready.write().unwrap() = None;
    }
}

impl Drop for RemoteIoServer {
    fn drop(&mut self) {
        self.stop();
    }
}
