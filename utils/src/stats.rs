// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Operation counters and latency accounting. A collector thread exchanges
//! the live counters into a stored snapshot once per second so readers (the
//! `stats` CLI, the peer `stat_cluster` call) see per-second deltas.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use prometheus::{IntGauge, Registry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum StatItem {
    FuseOps = 0,
    FuseReadOps,
    FuseWriteOps,
    MetaOps,
    MetaOpen,
    MetaRelease,
    MetaStat,
    MetaLookup,
    MetaCreate,
    MetaUnlink,
    MetaMkdir,
    MetaRmdir,
    MetaOpendir,
    MetaReaddir,
    MetaRename,
    MetaAccess,
    MetaReleasedir,
    MetaTruncate,
    MetaFlush,
    MetaFsync,
    OpsEnd,
    FuseLat,
    FuseLatMax,
    FuseReadLat,
    FuseReadLatMax,
    FuseWriteLat,
    FuseWriteLatMax,
    MetaLat,
    MetaLatMax,
    MetaOpenLat,
    MetaOpenLatMax,
    MetaReleaseLat,
    MetaReleaseLatMax,
    MetaStatLat,
    MetaStatLatMax,
    MetaCreateLat,
    MetaCreateLatMax,
    LatEnd,
    FuseRead,
    FuseWrite,
    BlockcacheRead,
    BlockcacheWrite,
    ObjGet,
    ObjPut,
    StatsEnd,
}

pub const STATS_END: usize = StatItem::StatsEnd as usize;

pub struct FalconStats {
    pub stats: [AtomicU64; STATS_END],
    stored: [AtomicU64; STATS_END],
    stat_max: AtomicBool,
    stop: AtomicBool,
}

impl Default for FalconStats {
    fn default() -> Self {
        FalconStats {
            stats: std::array::from_fn(|_| AtomicU64::new(0)),
            stored: std::array::from_fn(|_| AtomicU64::new(0)),
            stat_max: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }
}

impl FalconStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_stat_max(&self, on: bool) {
        self.stat_max.store(on, Ordering::Relaxed);
    }

    pub fn stat_max(&self) -> bool {
        self.stat_max.load(Ordering::Relaxed)
    }

    pub fn inc(&self, item: StatItem) {
        self.stats[item as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, item: StatItem, value: u64) {
        self.stats[item as usize].fetch_add(value, Ordering::Relaxed);
    }

    /// Per-second deltas captured by the collector thread.
    pub fn snapshot(&self) -> Vec<u64> {
        self.stored
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect()
    }

    /// Exchange live counters into the stored table. Counting items reset to
    /// zero each round; latency maxima reset so each snapshot carries the
    /// per-interval peak.
    fn exchange(&self) {
        for i in 0..STATS_END {
            let value = self.stats[i].swap(0, Ordering::Relaxed);
            self.stored[i].store(value, Ordering::Relaxed);
        }
    }

    /// Run the one-second exchange loop until `stop_collector` is called.
    pub fn start_collector(self: &Arc<Self>, mirror: Option<PrometheusMirror>) -> JoinHandle<()> {
        let stats = self.clone();
        std::thread::Builder::new()
            .name("falcon_stats".to_string())
            .spawn(move || {
                while !stats.stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_secs(1));
                    stats.exchange();
                    if let Some(m) = &mirror {
                        m.sync(&stats.snapshot());
                    }
                }
            })
            .expect("spawn stats collector")
    }

    pub fn stop_collector(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Adds the elapsed time to one or two latency items when dropped, tracking
/// the maximum in the neighbouring `*_MAX` slot when enabled.
pub struct StatTimer<'a> {
    stats: &'a FalconStats,
    item1: StatItem,
    item2: Option<StatItem>,
    start: Instant,
}

impl<'a> StatTimer<'a> {
    pub fn new(stats: &'a FalconStats, item1: StatItem, item2: Option<StatItem>) -> Self {
        StatTimer {
            stats,
            item1,
            item2,
            start: Instant::now(),
        }
    }
}

impl Drop for StatTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_micros() as u64;
        self.stats.add(self.item1, elapsed);
        if let Some(item2) = self.item2 {
            self.stats.add(item2, elapsed);
        }
        if !self.stats.stat_max() {
            return;
        }
        let slot = self.item2.unwrap_or(self.item1) as usize + 1;
        let max = &self.stats.stats[slot];
        let mut old = max.load(Ordering::Acquire);
        while old < elapsed {
            match max.compare_exchange_weak(old, elapsed, Ordering::Release, Ordering::Acquire) {
                Ok(_) => break,
                Err(cur) => old = cur,
            }
        }
    }
}

/// Mirrors the snapshot into a prometheus registry.
pub struct PrometheusMirror {
    registry: Registry,
    gauges: Vec<IntGauge>,
}

impl PrometheusMirror {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let mut gauges = Vec::with_capacity(STATS_END);
        for i in 0..STATS_END {
            let gauge = IntGauge::new(format!("falcon_stat_{}", i), item_name(i))?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.push(gauge);
        }
        Ok(PrometheusMirror { registry, gauges })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn sync(&self, snapshot: &[u64]) {
        for (gauge, value) in self.gauges.iter().zip(snapshot) {
            gauge.set(*value as i64);
        }
    }
}

fn item_name(index: usize) -> String {
    format!("falcon stat item {}", index)
}

pub fn format_u64(size: u64) -> String {
    if size >= 10 * (1 << 30) {
        format!("{}G", size >> 30)
    } else if size >= 10 * (1 << 20) {
        format!("{}M", size >> 20)
    } else if size >= 10 * (1 << 10) {
        format!("{}K", size >> 10)
    } else {
        format!("{}", size)
    }
}

pub fn format_time(micros: u64, ops: u64) -> String {
    if ops == 0 {
        return "0".to_string();
    }
    let avg = micros as f64 / ops as f64;
    if avg >= 1000.0 {
        format!("{:.1}ms", avg / 1000.0)
    } else {
        format!("{:.0}us", avg)
    }
}

pub fn stats_header() -> String {
    let mut header = String::new();
    header.push_str(
        "----------------fuse---------------- ---------------------meta--------------------- -blockcache- ---object---\n",
    );
    header.push_str(
        " ops   lat | read  lat  | write lat  | ops   lat  | open  lat  | close lat  | stat  lat  | read  write| get   put\n",
    );
    header
}

/// One table row out of a `stat_cluster` / collector snapshot.
pub fn stats_row(s: &[u64]) -> String {
    let item = |i: StatItem| s.get(i as usize).copied().unwrap_or(0);
    format!(
        "{:>5} {:>5}|{:>5} {:>5}|{:>5} {:>5}|{:>5} {:>5}|{:>5} {:>5}|{:>5} {:>5}|{:>5} {:>5}|{:>5} {:>5}|{:>5} {:>5}",
        format_u64(item(StatItem::FuseOps)),
        format_time(item(StatItem::FuseLat), item(StatItem::FuseOps)),
        format_u64(item(StatItem::FuseRead)),
        format_time(item(StatItem::FuseReadLat), item(StatItem::FuseReadOps)),
        format_u64(item(StatItem::FuseWrite)),
        format_time(item(StatItem::FuseWriteLat), item(StatItem::FuseWriteOps)),
        format_u64(item(StatItem::MetaOps)),
        format_time(item(StatItem::MetaLat), item(StatItem::MetaOps)),
        format_u64(item(StatItem::MetaOpen)),
        format_time(item(StatItem::MetaOpenLat), item(StatItem::MetaOpen)),
        format_u64(item(StatItem::MetaRelease)),
        format_time(item(StatItem::MetaReleaseLat), item(StatItem::MetaRelease)),
        format_u64(item(StatItem::MetaStat)),
        format_time(item(StatItem::MetaStatLat), item(StatItem::MetaStat)),
        format_u64(item(StatItem::BlockcacheRead)),
        format_u64(item(StatItem::BlockcacheWrite)),
        format_u64(item(StatItem::ObjGet)),
        format_u64(item(StatItem::ObjPut)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = FalconStats::default();
        stats.inc(StatItem::FuseReadOps);
        stats.add(StatItem::FuseRead, 4096);
        stats.add(StatItem::FuseRead, 4096);
        assert_eq!(
            stats.stats[StatItem::FuseRead as usize].load(Ordering::Relaxed),
            8192
        );
        assert_eq!(
            stats.stats[StatItem::FuseReadOps as usize].load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_exchange_resets_live_counters() {
        let stats = FalconStats::default();
        stats.add(StatItem::ObjGet, 100);
        stats.exchange();
        assert_eq!(stats.snapshot()[StatItem::ObjGet as usize], 100);
        assert_eq!(
            stats.stats[StatItem::ObjGet as usize].load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_timer_records_latency() {
        let stats = FalconStats::default();
        stats.set_stat_max(true);
        {
            let _t = StatTimer::new(&stats, StatItem::MetaLat, Some(StatItem::MetaOpenLat));
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(stats.stats[StatItem::MetaLat as usize].load(Ordering::Relaxed) > 0);
        assert!(stats.stats[StatItem::MetaOpenLat as usize].load(Ordering::Relaxed) > 0);
        assert!(stats.stats[StatItem::MetaOpenLatMax as usize].load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_u64(512), "512");
        assert_eq!(format_u64(20 << 10), "20K");
        assert_eq!(format_u64(11 << 20), "11M");
        assert_eq!(format_time(0, 0), "0");
        assert_eq!(format_time(2000, 2), "1.0ms");
    }
}
