// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The node roster: `node_id -> (endpoint, rpc client)`. The roster either
//! comes from the static cluster view in the config or is kept in sync with
//! a membership source by a 3 s refresher. The local identity persists in
//! `cache_root/myid` so a restart re-registers under the same id.

pub mod io_client;

use std::collections::{BTreeMap, HashMap};
use std::io::Result;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Runtime;

use io_client::FalconIoClient;

const CONNECTION_RETRY_NUM: u32 = 300;
const REFRESH_PERIOD: Duration = Duration::from_secs(3);
const MEMBERSHIP_FATAL_FAILURES: u32 = 100;

/// splitmix64; places an inode on a roster slot.
pub fn hash64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// The host part of a `host:port` endpoint.
fn split_host(endpoint: &str) -> &str {
    endpoint.rsplit_once(':').map(|(h, _)| h).unwrap_or(endpoint)
}

/// External cluster membership, consumed as snapshots.
pub trait MembershipSource: Send + Sync {
    /// Register the local node; returns the (possibly newly allocated) id.
    fn register(&self, endpoint: &str, node_id: i32) -> Result<i32>;
    fn fetch_store_nodes(&self) -> Result<HashMap<i32, String>>;
    fn fetch_coordinator(&self) -> Result<(String, u16)>;
}

/// Membership fixed by the `falcon_cluster_view` config.
pub struct StaticMembership {
    view: Vec<String>,
    coordinator: Option<(String, u16)>,
}

impl StaticMembership {
    pub fn new(view: Vec<String>, coordinator: Option<(String, u16)>) -> Arc<Self> {
        Arc::new(StaticMembership { view, coordinator })
    }
}

impl MembershipSource for StaticMembership {
    fn register(&self, _endpoint: &str, node_id: i32) -> Result<i32> {
        Ok(node_id)
    }

    fn fetch_store_nodes(&self) -> Result<HashMap<i32, String>> {
        Ok(self
            .view
            .iter()
            .enumerate()
            .map(|(i, ep)| (i as i32, ep.clone()))
            .collect())
    }

    fn fetch_coordinator(&self) -> Result<(String, u16)> {
        self.coordinator
            .clone()
            .ok_or_else(|| enoent!("no coordinator in static membership"))
    }
}

pub fn read_myid(root: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(root.join("myid")).ok()?;
    content.trim().parse().ok()
}

pub fn write_myid(root: &Path, id: i32) -> Result<()> {
    std::fs::write(root.join("myid"), format!("{}", id))
}

/// The `cache_root/exit` control file gates the exit-on-fatal path: any
/// positive integer enables it.
pub fn exit_on_fatal(root: &Path) -> bool {
    match std::fs::read_to_string(root.join("exit")) {
        Ok(content) => content.trim().parse::<i32>().map(|v| v > 0).unwrap_or(false),
        Err(_) => false,
    }
}

struct NodeEntry {
    endpoint: String,
    client: Arc<FalconIoClient>,
}

pub struct StoreNode {
    node_id: AtomicI32,
    nodes: RwLock<BTreeMap<i32, NodeEntry>>,
    runtime: Arc<Runtime>,
    stop: Arc<AtomicBool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl StoreNode {
    pub fn new(runtime: Arc<Runtime>) -> Arc<Self> {
        Arc::new(StoreNode {
            node_id: AtomicI32::new(-1),
            nodes: RwLock::new(BTreeMap::new()),
            runtime,
            stop: Arc::new(AtomicBool::new(false)),
            refresher: Mutex::new(None),
        })
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn connect(&self, endpoint: &str) -> Result<Arc<FalconIoClient>> {
        let client = FalconIoClient::new(self.runtime.handle().clone(), endpoint)
            .map_err(|e| eio!(format!("channel init for {} failed: {}", endpoint, e)))?;
        Ok(Arc::new(client))
    }

    /// Static-view initialization: connect to every endpoint, verifying the
    /// link before it joins the roster.
    pub fn set_node_config(&self, node_id: i32, cluster_view: &[String]) -> Result<()> {
        self.node_id.store(node_id, Ordering::SeqCst);
        info!("falcon_store node_id = {}", node_id);
        let mut nodes = self.nodes.write().unwrap();
        for (i, endpoint) in cluster_view.iter().enumerate() {
            info!("node {} = {}", i, endpoint);
            let client = self.connect(endpoint)?;
            let mut retry = 0;
            loop {
                match client.check_connection() {
                    Ok(()) => break,
                    Err(_) if retry < CONNECTION_RETRY_NUM => {
                        retry += 1;
                        warn!("connect to {} failed, retry", endpoint);
                        std::thread::sleep(Duration::from_secs(1));
                    }
                    Err(e) => {
                        return Err(eio!(format!("connect to {} failed: {}", endpoint, e)));
                    }
                }
            }
            nodes.insert(
                i as i32,
                NodeEntry {
                    endpoint: endpoint.clone(),
                    client,
                },
            );
        }
        Ok(())
    }

    /// Membership-driven initialization: register under the persisted id,
    /// seed the roster, then keep it refreshed every 3 s.
    pub fn set_node_config_with_membership(
        self: &Arc<Self>,
        root: &Path,
        advertised: &str,
        membership: Arc<dyn MembershipSource>,
    ) -> Result<()> {
        let initial = read_myid(root).unwrap_or(-1);
        let assigned = membership.register(advertised, initial)?;
        self.node_id.store(assigned, Ordering::SeqCst);
        if initial != assigned {
            write_myid(root, assigned)?;
            info!("wrote myid = {}", assigned);
        }
        info!("registered as node {}", assigned);

        let snapshot = membership.fetch_store_nodes()?;
        self.apply_membership(snapshot);

        let node = self.clone();
        let stop = self.stop.clone();
        let root = root.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("falcon_roster".to_string())
            .spawn(move || {
                let mut failures = 0u32;
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(REFRESH_PERIOD);
                    match membership.fetch_store_nodes() {
                        Ok(snapshot) => {
                            failures = 0;
                            node.apply_membership(snapshot);
                        }
                        Err(e) => {
                            failures += 1;
                            error!("roster refresh failed, wait for next term: {}", e);
                            // A registration lost for good is fatal when the
                            // exit control file allows it.
                            if failures >= MEMBERSHIP_FATAL_FAILURES {
                                if exit_on_fatal(&root) {
                                    error!("membership lost, exiting");
                                    std::process::exit(1);
                                }
                                warn!("membership lost, running degraded");
                                failures = 0;
                            }
                        }
                    }
                }
            })?;
        *self.refresher.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Merge a membership snapshot, preserving connections whose host did
    /// not change.
    fn apply_membership(&self, mut snapshot: HashMap<i32, String>) {
        let mut nodes = self.nodes.write().unwrap();
        let mut to_delete = Vec::new();
        for (id, entry) in nodes.iter() {
            match snapshot.get(id) {
                None => to_delete.push(*id),
                Some(endpoint) if split_host(endpoint) != split_host(&entry.endpoint) => {
                    to_delete.push(*id)
                }
                Some(_) => {
                    snapshot.remove(id);
                }
            }
        }
        for id in to_delete {
            nodes.remove(&id);
        }
        for (id, endpoint) in snapshot {
            match self.connect(&endpoint) {
                Ok(client) => {
                    nodes.insert(id, NodeEntry { endpoint, client });
                }
                Err(e) => error!("connection to {} failed: {}", endpoint, e),
            }
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.refresher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn node_id(&self) -> i32 {
        self.node_id.load(Ordering::SeqCst)
    }

    pub fn is_local(&self, other: i32) -> bool {
        self.node_id() == other
    }

    pub fn is_local_endpoint(&self, endpoint: &str) -> bool {
        let nodes = self.nodes.read().unwrap();
        match nodes.get(&self.node_id()) {
            Some(entry) => split_host(endpoint) == split_host(&entry.endpoint),
            None => false,
        }
    }

    pub fn rpc_connection(&self, node_id: i32) -> Option<Arc<FalconIoClient>> {
        let nodes = self.nodes.read().unwrap();
        match nodes.get(&node_id) {
            Some(entry) => Some(entry.client.clone()),
            None => {
                error!("no rpc connection at node {}", node_id);
                None
            }
        }
    }

    pub fn endpoint(&self, node_id: i32) -> Option<String> {
        self.nodes
            .read()
            .unwrap()
            .get(&node_id)
            .map(|e| e.endpoint.clone())
    }

    /// Deterministic placement over the live roster.
    pub fn alloc_node(&self, key: u64) -> i32 {
        let nodes = self.nodes.read().unwrap();
        if nodes.is_empty() {
            return self.node_id();
        }
        let index = (hash64(key) % nodes.len() as u64) as usize;
        *nodes.keys().nth(index).unwrap()
    }

    /// The roster entry after `node_id`, wrapping; rehashes if the node is
    /// gone.
    pub fn next_node(&self, node_id: i32, key: u64) -> i32 {
        let nodes = self.nodes.read().unwrap();
        if nodes.is_empty() {
            return self.node_id();
        }
        if !nodes.contains_key(&node_id) {
            warn!("node {} is not in the roster, rehash", node_id);
            drop(nodes);
            return self.alloc_node(key);
        }
        nodes
            .range((
                std::ops::Bound::Excluded(node_id),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(id, _)| *id)
            .unwrap_or_else(|| *nodes.keys().next().unwrap())
    }

    pub fn delete_node(&self, node_id: i32) {
        self.nodes.write().unwrap().remove(&node_id);
    }

    pub fn all_node_ids(&self) -> Vec<i32> {
        self.nodes.read().unwrap().keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }
}

impl Drop for StoreNode {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.refresher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runtime() -> Arc<Runtime> {
        Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap(),
        )
    }

    fn roster_with(view: &[&str]) -> Arc<StoreNode> {
        let node = StoreNode::new(test_runtime());
        node.node_id.store(0, Ordering::SeqCst);
        {
            let mut nodes = node.nodes.write().unwrap();
            for (i, ep) in view.iter().enumerate() {
                let client = node.connect(ep).unwrap();
                nodes.insert(
                    i as i32,
                    NodeEntry {
                        endpoint: ep.to_string(),
                        client,
                    },
                );
            }
        }
        node
    }

    #[test]
    fn test_hash64_is_stable() {
        assert_eq!(hash64(0), 0);
        assert_ne!(hash64(1), hash64(2));
        assert_eq!(hash64(42), hash64(42));
    }

    #[test]
    fn test_alloc_node_covers_roster() {
        let node = roster_with(&["127.0.0.1:7001", "127.0.0.1:7002", "127.0.0.1:7003"]);
        for key in 0..64u64 {
            let id = node.alloc_node(key);
            assert!((0..3).contains(&id));
        }
    }

    #[test]
    fn test_next_node_wraps() {
        let node = roster_with(&["127.0.0.1:7001", "127.0.0.1:7002"]);
        assert_eq!(node.next_node(0, 5), 1);
        assert_eq!(node.next_node(1, 5), 0);
    }

    #[test]
    fn test_delete_node_shrinks_roster() {
        let node = roster_with(&["127.0.0.1:7001", "127.0.0.1:7002"]);
        node.delete_node(1);
        assert_eq!(node.all_node_ids(), vec![0]);
        assert_eq!(node.alloc_node(99), 0);
    }

    #[test]
    fn test_apply_membership_preserves_unchanged() {
        let node = roster_with(&["127.0.0.1:7001", "127.0.0.1:7002"]);
        let mut snapshot = HashMap::new();
        snapshot.insert(0, "127.0.0.1:7001".to_string());
        snapshot.insert(2, "127.0.0.2:7003".to_string());
        node.apply_membership(snapshot);
        let ids = node.all_node_ids();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn test_myid_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_myid(dir.path()), None);
        write_myid(dir.path(), 5).unwrap();
        assert_eq!(read_myid(dir.path()), Some(5));
    }

    #[test]
    fn test_exit_control_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!exit_on_fatal(dir.path()));
        std::fs::write(dir.path().join("exit"), "0").unwrap();
        assert!(!exit_on_fatal(dir.path()));
        std::fs::write(dir.path().join("exit"), "1").unwrap();
        assert!(exit_on_fatal(dir.path()));
    }
}
