// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! FalconFS storage daemon. Starts the peer I/O server, brings up the
//! engine and the metadata surface, then parks until killed. The `stats`
//! and `stats-all` subcommands poll a running daemon's `stat_cluster` once
//! per second and print the counters as a table.

#[macro_use]
extern crate log;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use falcon_client::connection::ServerIdentifier;
use falcon_client::router::Router;
use falcon_client::FalconFs;
use falcon_protocols::peer::peer_io_client::PeerIoClient;
use falcon_protocols::peer::StatClusterRequest;
use falcon_storage::fd_table::FalconFd;
use falcon_storage::node::StaticMembership;
use falcon_storage::server::RemoteIoServer;
use falcon_storage::store::{FalconStore, StoreOptions};
use falcon_utils::config::{FalconConfig, DEFAULT_RPC_PORT};
use falcon_utils::stats::{stats_header, stats_row, FalconStats, PrometheusMirror};

#[derive(Parser)]
#[command(name = "falcond", about = "FalconFS storage daemon", version)]
struct Cli {
    /// Peer RPC endpoint to bind or to query.
    #[arg(long, default_value_t = format!("0.0.0.0:{}", DEFAULT_RPC_PORT))]
    rpc_endpoint: String,

    /// Config file; falls back to the CONFIG_FILE environment variable.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll this node's per-second counters.
    Stats,
    /// Poll cluster-wide per-second counters.
    StatsAll,
}

fn log_level(config: &FalconConfig) -> log::LevelFilter {
    match config.get_string("falcon_log_level").as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warning" | "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

fn poll_stats(endpoint: &str, scatter: bool) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("runtime init failed: {}", e);
            return 1;
        }
    };

    let target = format!("http://{}", endpoint.replace("0.0.0.0", "127.0.0.1"));
    let mut client = match runtime.block_on(PeerIoClient::connect(target)) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to reach {}: {}", endpoint, e);
            return 1;
        }
    };

    // Drop the stale first interval.
    let _ = runtime.block_on(client.stat_cluster(StatClusterRequest {
        node_id: -1,
        scatter,
    }));
    let mut cnt = 0u32;
    loop {
        std::thread::sleep(Duration::from_secs(1));
        let reply = runtime.block_on(client.stat_cluster(StatClusterRequest {
            node_id: -1,
            scatter,
        }));
        match reply {
            Ok(reply) => {
                let reply = reply.into_inner();
                if reply.error_code != 0 {
                    eprintln!("stat_cluster failed: {}", reply.error_code);
                    continue;
                }
                if cnt % 30 == 0 {
                    print!("{}", stats_header());
                }
                cnt += 1;
                println!("{}", stats_row(&reply.stats));
            }
            Err(e) => eprintln!("stat_cluster failed: {}", e),
        }
    }
}

fn run_daemon(cli: &Cli) -> i32 {
    let config = match &cli.config {
        Some(path) => FalconConfig::from_file(path),
        None => FalconConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config load failed: {}", e);
            return 1;
        }
    };

    stderrlog::new()
        .verbosity(falcon_utils::log_level_to_verbosity(log_level(&config)))
        .timestamp(stderrlog::Timestamp::Second)
        .init()
        .expect("logger init");

    let server = RemoteIoServer::new(&cli.rpc_endpoint);
    if let Err(e) = server.start() {
        eprintln!("peer rpc server start failed: {}", e);
        return 1;
    }

    let stats = FalconStats::new();
    stats.set_stat_max(config.get_bool("falcon_stat_max"));
    let fd_table = FalconFd::new();

    let membership = match std::env::var("zk_endpoint") {
        // The membership service itself is external; the static view stands
        // in until one is wired up.
        Ok(_) => {
            let source: Arc<dyn falcon_storage::node::MembershipSource> =
                StaticMembership::new(config.get_array("falcon_cluster_view"), None);
            Some(source)
        }
        Err(_) => None,
    };
    let options = StoreOptions {
        membership,
        advertised: falcon_utils::config::pod_endpoint(),
        ..Default::default()
    };

    let store = match FalconStore::new(&config, fd_table, stats.clone(), options) {
        Ok(store) => store,
        Err(e) => {
            error!("falcon store init failed: {}", e);
            server.stop();
            return 1;
        }
    };
    server.set_ready(store.clone());

    let coordinator = ServerIdentifier::new(
        &config.get_string("falcon_server_ip"),
        config
            .get_string("falcon_server_port")
            .parse()
            .unwrap_or(0),
        -1,
    );
    let fs = match Router::new(coordinator, None) {
        Ok(router) => Some(FalconFs::new(router, store.clone())),
        Err(e) => {
            // The data plane still serves peers without a metadata plane.
            warn!("metadata router init failed, running data plane only: {}", e);
            None
        }
    };

    let mirror = if config.get_bool("falcon_use_prometheus") {
        PrometheusMirror::new().ok()
    } else {
        None
    };
    let collector = if config.get_bool("falcon_stat") {
        Some(stats.start_collector(mirror))
    } else {
        None
    };

    info!("falcond running on {}", server.endpoint());
    std::thread::park();

    if let Some(fs) = &fs {
        fs.destroy();
    }
    stats.stop_collector();
    if let Some(collector) = collector {
        let _ = collector.join();
    }
    server.stop();
    0
}

fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Some(Command::Stats) => poll_stats(&cli.rpc_endpoint, false),
        Some(Command::StatsAll) => poll_stats(&cli.rpc_endpoint, true),
        None => run_daemon(&cli),
    };
    std::process::exit(code);
}
