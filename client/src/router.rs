// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Resolves a file name to its owning metadata shard and keeps a pool of
//! keep-alive metadata connections. On `SERVER_FAULT` the coordinator is
//! re-resolved through the membership source and the shard table rebuilt,
//! preserving connections whose endpoints did not change.

use std::collections::{BTreeMap, HashMap};
use std::io::Result;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::runtime::Runtime;

use falcon_storage::node::MembershipSource;

use crate::connection::{Connection, ServerIdentifier, SERVER_FAULT, SUCCESS};
use crate::hash::shard_key;

pub const RETRY_CNT: u32 = 3;
pub const RETRY_SLEEP: Duration = Duration::from_secs(3);

pub struct Router {
    runtime: Arc<Runtime>,
    coordinator: RwLock<Arc<Connection>>,
    shard_table: RwLock<BTreeMap<i32, ServerIdentifier>>,
    route_map: RwLock<HashMap<ServerIdentifier, Arc<Connection>>>,
    membership: Option<Arc<dyn MembershipSource>>,
}

impl Router {
    pub fn new(
        coordinator: ServerIdentifier,
        membership: Option<Arc<dyn MembershipSource>>,
    ) -> Result<Arc<Self>> {
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("falcon_meta_rt")
                .enable_all()
                .build()?,
        );
        let conn = Connection::new(coordinator, runtime.handle().clone())?;
        let router = Arc::new(Router {
            runtime,
            coordinator: RwLock::new(conn),
            shard_table: RwLock::new(BTreeMap::new()),
            route_map: RwLock::new(HashMap::new()),
            membership,
        });
        let coordinator_conn = router.coordinator_conn();
        let code = router.fetch_shard_table(&coordinator_conn);
        if code != SUCCESS {
            return Err(eio!(format!("initial shard table fetch failed: {}", code)));
        }
        Ok(router)
    }

    pub fn coordinator_conn(&self) -> Arc<Connection> {
        self.coordinator.read().unwrap().clone()
    }

    /// Rebuild the shard table from the coordinator. Existing worker
    /// connections are kept when their endpoint survives the refresh.
    pub fn fetch_shard_table(&self, conn: &Arc<Connection>) -> i32 {
        let shards = match conn.fetch_shard_table() {
            Ok(shards) => shards,
            Err(code) => return code,
        };

        let mut table = self.shard_table.write().unwrap();
        let mut routes = self.route_map.write().unwrap();
        let old_routes = std::mem::take(&mut *routes);
        table.clear();

        let mut last_max: Option<i32> = None;
        for (entry, server) in shards {
            match last_max {
                Some(last) => {
                    if last.checked_add(1) != Some(entry.min_hash_key) {
                        error!("shard table is corrupt: gap after key {}", last);
                        table.clear();
                        return SERVER_FAULT;
                    }
                }
                None => {
                    if entry.min_hash_key != i32::MIN {
                        // Keys below the first shard's lower bound resolve
                        // to no server rather than to the first shard.
                        table.insert(
                            entry.min_hash_key - 1,
                            ServerIdentifier::new("", 0, -1),
                        );
                    }
                }
            }
            last_max = Some(entry.max_hash_key);

            let conn = match old_routes.get(&server) {
                Some(existing) => existing.clone(),
                None => match Connection::new(server.clone(), self.runtime.handle().clone()) {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("connection to {} failed: {}", server.endpoint(), e);
                        continue;
                    }
                },
            };
            routes.insert(server.clone(), conn);
            table.insert(entry.max_hash_key, server);
        }

        if last_max != Some(i32::MAX) {
            error!("shard table is corrupt: upper bound {:?}", last_max);
            table.clear();
            return SERVER_FAULT;
        }
        SUCCESS
    }

    /// Filename -> shard. Trailing slashes are stripped; the final path
    /// component seeds the hash.
    pub fn worker_by_path(&self, path: &str) -> Option<Arc<Connection>> {
        if path.is_empty() || !path.starts_with('/') {
            return None;
        }
        let mut path = path;
        if path.len() > 1 && path.ends_with('/') {
            path = &path[..path.len() - 1];
        }
        let file_name = match path.rfind('/') {
            Some(pos) if pos + 1 < path.len() => &path[pos + 1..],
            _ => "/",
        };

        let key = shard_key(file_name);
        let table = self.shard_table.read().unwrap();
        let server = table.range(key..).next().map(|(_, server)| server.clone())?;
        drop(table);
        self.route_map.read().unwrap().get(&server).cloned()
    }

    pub fn worker_by_server_id(&self, id: i32) -> Option<Arc<Connection>> {
        let routes = self.route_map.read().unwrap();
        routes
            .iter()
            .find(|(server, _)| server.id == id)
            .map(|(_, conn)| conn.clone())
    }

    /// Every worker connection keyed by `ip:port`, snapshotted for a
    /// directory-listing epoch.
    pub fn all_worker_connections(&self) -> HashMap<String, Arc<Connection>> {
        self.route_map
            .read()
            .unwrap()
            .iter()
            .map(|(server, conn)| (server.endpoint(), conn.clone()))
            .collect()
    }

    /// Re-resolve the coordinator through the membership source. Without a
    /// membership source the current connection stands.
    pub fn try_update_coordinator(&self, conn: &Arc<Connection>) -> Arc<Connection> {
        let mut coordinator = self.coordinator.write().unwrap();
        if coordinator.server != conn.server {
            warn!(
                "coordinator already updated to {}",
                coordinator.server.endpoint()
            );
            return coordinator.clone();
        }
        let membership = match &self.membership {
            Some(membership) => membership.clone(),
            None => return coordinator.clone(),
        };

        let mut cnt = 0;
        loop {
            match membership.fetch_coordinator() {
                Ok((ip, port)) => {
                    let candidate = ServerIdentifier::new(&ip, port, conn.server.id);
                    if candidate != conn.server {
                        match Connection::new(candidate, self.runtime.handle().clone()) {
                            Ok(new_conn) => {
                                warn!(
                                    "coordinator updated to {}",
                                    new_conn.server.endpoint()
                                );
                                *coordinator = new_conn.clone();
                                return new_conn;
                            }
                            Err(e) => error!("coordinator reconnect failed: {}", e),
                        }
                    }
                }
                Err(e) => error!("coordinator lookup failed: {}", e),
            }
            cnt += 1;
            if cnt > RETRY_CNT {
                warn!(
                    "coordinator info has not changed: {}",
                    coordinator.server.endpoint()
                );
                return coordinator.clone();
            }
            std::thread::sleep(RETRY_SLEEP);
        }
    }

    /// After a worker fault: refetch the shard table (updating the
    /// coordinator if it faulted too) and return the possibly-relocated
    /// connection for the same server id.
    pub fn try_update_worker_conn(&self, conn: &Arc<Connection>) -> Arc<Connection> {
        let mut cnt = 0;
        loop {
            if let Some(new_conn) = self.worker_by_server_id(conn.server.id) {
                if new_conn.server != conn.server {
                    warn!(
                        "worker {} updated to {}",
                        conn.server.id,
                        new_conn.server.endpoint()
                    );
                    return new_conn;
                }
            }
            cnt += 1;
            if cnt > RETRY_CNT {
                break;
            }
            std::thread::sleep(RETRY_SLEEP);
            let mut coordinator = self.coordinator_conn();
            let mut code = self.fetch_shard_table(&coordinator);
            if code == SERVER_FAULT {
                coordinator = self.try_update_coordinator(&coordinator);
                code = self.fetch_shard_table(&coordinator);
            }
            if code != SUCCESS {
                error!("shard table refresh failed: {}", code);
            }
        }
        warn!(
            "worker {} info has not changed: {}",
            conn.server.id,
            conn.server.endpoint()
        );
        conn.clone()
    }

    #[cfg(test)]
    pub(crate) fn install_shard_table(
        &self,
        entries: Vec<(i32, ServerIdentifier)>,
    ) -> Result<()> {
        let mut table = self.shard_table.write().unwrap();
        let mut routes = self.route_map.write().unwrap();
        for (max_key, server) in entries {
            // Empty-host entries are sentinels without a connection.
            if !server.ip.is_empty() {
                let conn = Connection::new(server.clone(), self.runtime.handle().clone())?;
                routes.insert(server.clone(), conn);
            }
            table.insert(max_key, server);
        }
        Ok(())
    }
}
