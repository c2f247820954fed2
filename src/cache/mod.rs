pub mod alloy;
pub mod banshee;
pub mod chamo;
pub mod hotness;
pub mod ideal;
pub mod ndc;
pub mod placement;
pub mod simple;
pub mod unison;
pub mod utilization;

#[cfg(test)]
mod unit_tests;

use serde::Serialize;

use crate::config::{ConfigError, SchemeKind, StratusConfig};
use crate::mem::backend::MemoryTiers;
use crate::mem::request::{CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

/// One tag entry. The tag is the canonical physical line (or page) address,
/// not a compressed field.
#[derive(Debug, Default, Clone, Copy)]
pub struct Way {
    pub tag: u64,
    pub valid: bool,
    pub dirty: bool,
}

/// Flat sets-by-ways tag store shared by every scheme.
#[derive(Debug)]
pub struct TagArray {
    sets: u64,
    ways: u64,
    entries: Vec<Way>,
}

impl TagArray {
    pub fn new(sets: u64, ways: u64) -> Self {
        let sets = sets.max(1);
        let ways = ways.max(1);
        Self {
            sets,
            ways,
            entries: vec![Way::default(); (sets * ways) as usize],
        }
    }

    pub fn num_sets(&self) -> u64 {
        self.sets
    }

    pub fn num_ways(&self) -> u64 {
        self.ways
    }

    fn idx(&self, set: u64, way: u64) -> usize {
        debug_assert!(set < self.sets && way < self.ways);
        (set * self.ways + way) as usize
    }

    pub fn way(&self, set: u64, way: u64) -> Way {
        self.entries[self.idx(set, way)]
    }

    pub fn way_mut(&mut self, set: u64, way: u64) -> &mut Way {
        let idx = self.idx(set, way);
        &mut self.entries[idx]
    }

    /// Index of the valid way holding `tag`, if any. At most one such way
    /// exists per set.
    pub fn lookup(&self, set: u64, tag: u64) -> Option<u64> {
        debug_assert!(self.tags_unique(set));
        (0..self.ways).find(|&w| {
            let entry = self.way(set, w);
            entry.valid && entry.tag == tag
        })
    }

    pub fn empty_way(&self, set: u64) -> Option<u64> {
        (0..self.ways).find(|&w| !self.way(set, w).valid)
    }

    pub fn tags_unique(&self, set: u64) -> bool {
        for a in 0..self.ways {
            let wa = self.way(set, a);
            if !wa.valid {
                continue;
            }
            for b in a + 1..self.ways {
                let wb = self.way(set, b);
                if wb.valid && wb.tag == wa.tag {
                    return false;
                }
            }
        }
        true
    }
}

/// Static parameters a scheme derives from the configuration snapshot.
#[derive(Debug, Clone)]
pub struct SchemeConfig {
    /// Cache allocation unit in bytes (64 for line caches, page size for
    /// page caches).
    pub granularity: u64,
    pub num_ways: u64,
    pub cache_size: u64,
    pub num_sets: u64,
    pub ext_size: u64,
    pub sram_tag: bool,
    pub llc_latency: u32,
    pub bw_balance: bool,
    pub mcdram_per_mc: u64,
    pub mcdram: crate::config::McdramConfig,
}

impl SchemeConfig {
    pub fn from_config(cfg: &StratusConfig) -> Self {
        let mcdram = cfg.mem.mcdram.clone();
        let granularity = mcdram.cache_granularity;
        let num_ways = mcdram.num_ways;
        let cache_size = mcdram.size * 1024 * 1024;
        Self {
            granularity,
            num_ways,
            cache_size,
            num_sets: cache_size / num_ways / granularity,
            ext_size: cfg.mem.ext_dram.size * 1024 * 1024,
            sram_tag: cfg.mem.sram_tag,
            llc_latency: cfg.caches.l3.latency,
            bw_balance: cfg.mem.bw_balance,
            mcdram_per_mc: cfg.mem.mcdram.mcdram_per_mc as u64,
            mcdram,
        }
    }

    pub fn lines_per_unit(&self) -> u64 {
        self.granularity / 64
    }
}

/// Counters every scheme exports; names match the stats surface upstream
/// tooling parses.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SchemeStats {
    pub load_hit: u64,
    pub load_miss: u64,
    pub store_hit: u64,
    pub store_miss: u64,
    pub clean_evict: u64,
    pub dirty_evict: u64,
    pub placement: u64,
    pub tag_load: u64,
    pub tag_store: u64,
    pub counter_access: u64,
}

impl SchemeStats {
    pub fn append_to(&self, group: &mut StatGroup) {
        group.add("loadHit", self.load_hit);
        group.add("loadMiss", self.load_miss);
        group.add("storeHit", self.store_hit);
        group.add("storeMiss", self.store_miss);
        group.add("cleanEvict", self.clean_evict);
        group.add("dirtyEvict", self.dirty_evict);
        group.add("placement", self.placement);
        group.add("tagLoad", self.tag_load);
        group.add("tagStore", self.tag_store);
        group.add("counterAccess", self.counter_access);
    }
}

/// A valid way the bandwidth balancer invalidated; schemes with auxiliary
/// tables use this to fix them up after a sweep.
#[derive(Debug, Clone, Copy)]
pub struct EvictedWay {
    pub set: u64,
    pub way: u64,
    pub tag: u64,
}

/// State and behavior shared by the whole scheme family: the tag array,
/// sliding per-step counters, and the ds_index bandwidth balancer.
#[derive(Debug)]
pub struct SchemeBase {
    pub cfg: SchemeConfig,
    pub tags: TagArray,
    /// Sets below this index bypass the near-memory cache.
    pub ds_index: u64,
    pub hits_per_step: u64,
    pub misses_per_step: u64,
    pub mc_bw_per_step: u64,
    pub ext_bw_per_step: u64,
    pub stats: SchemeStats,
}

const BW_TARGET_RATIO: f64 = 0.8;
const BW_DEAD_BAND: f64 = 0.02;

impl SchemeBase {
    pub fn new(cfg: SchemeConfig) -> Self {
        let tags = TagArray::new(cfg.num_sets, cfg.num_ways);
        Self {
            cfg,
            tags,
            ds_index: 0,
            hits_per_step: 0,
            misses_per_step: 0,
            mc_bw_per_step: 0,
            ext_bw_per_step: 0,
            stats: SchemeStats::default(),
        }
    }

    pub fn recent_miss_rate(&self) -> f64 {
        let total = self.hits_per_step + self.misses_per_step;
        if total == 0 {
            0.0
        } else {
            self.misses_per_step as f64 / total as f64
        }
    }

    pub fn decay_step_counters(&mut self) {
        self.hits_per_step /= 2;
        self.misses_per_step /= 2;
        self.mc_bw_per_step /= 2;
        self.ext_bw_per_step /= 2;
    }

    /// Shift ds_index toward the bandwidth target, writing back and
    /// invalidating the sets newly excluded from caching. Returns the valid
    /// ways that were dropped.
    pub fn rebalance(&mut self, req: &MemRequest, mem: &mut MemoryTiers) -> Vec<EvictedWay> {
        let mut dropped = Vec::new();
        if !self.cfg.bw_balance || self.mc_bw_per_step + self.ext_bw_per_step == 0 {
            return dropped;
        }
        let ratio =
            self.mc_bw_per_step as f64 / (self.mc_bw_per_step + self.ext_bw_per_step) as f64;
        let index_step = self.cfg.num_sets / 1000;
        let delta = if (ratio - BW_TARGET_RATIO).abs() <= BW_DEAD_BAND {
            0i64
        } else {
            (index_step as f64 * (ratio - BW_TARGET_RATIO) / 0.01) as i64
        };
        log::debug!("bw rebalance: ratio = {ratio:.3}, delta = {delta}");

        if delta > 0 {
            let burst = self.cfg.lines_per_unit() as u32 * 4;
            let end = (self.ds_index + delta as u64).min(self.cfg.num_sets);
            for set in self.ds_index..end {
                for way in 0..self.cfg.num_ways {
                    let meta = self.tags.way(set, way);
                    if meta.valid {
                        if meta.dirty {
                            let line = meta.tag * self.cfg.lines_per_unit();
                            let mut load = req.derived(line, CoherenceOp::GetShared);
                            mem.mcdram[0].access(&mut load, RecordKind::SideChain, burst);
                            let mut wb = req.derived(line, CoherenceOp::PutExclusive);
                            mem.ext.access(&mut wb, RecordKind::SideChain, burst);
                            self.mc_bw_per_step += burst as u64;
                            self.ext_bw_per_step += burst as u64;
                        }
                        dropped.push(EvictedWay {
                            set,
                            way,
                            tag: meta.tag,
                        });
                    }
                    let meta = self.tags.way_mut(set, way);
                    meta.valid = false;
                    meta.dirty = false;
                }
            }
        }
        let next = self.ds_index as i64 + delta;
        self.ds_index = if next <= 0 { 0 } else { next as u64 };
        log::debug!("ds_index = {}/{}", self.ds_index, self.cfg.num_sets);
        dropped
    }
}

/// The scheme contract: `access` is the only mutator, `period` the
/// smoothing/rebalancing hook, and `append_stats` the metrics export.
pub trait CacheScheme {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle;

    fn period(&mut self, req: &MemRequest, mem: &mut MemoryTiers);

    fn append_stats(&self, parent: &mut StatGroup);

    fn kind(&self) -> SchemeKind;

    fn base(&self) -> &SchemeBase;

    fn base_mut(&mut self) -> &mut SchemeBase;
}

/// Near-memory bank selection: lines interleave across the controller's
/// MCDRAM instances in 64-line chunks.
pub fn mcdram_select(line_addr: u64, per_mc: u64) -> usize {
    ((line_addr / 64) % per_mc) as usize
}

/// Address within the selected MCDRAM instance.
pub fn mcdram_line_addr(line_addr: u64, per_mc: u64) -> u64 {
    (line_addr / 64 / per_mc * 64) | (line_addr % 64)
}

pub fn build_scheme(cfg: &StratusConfig) -> Result<Box<dyn CacheScheme>, ConfigError> {
    cfg.validate()?;
    let scheme_cfg = SchemeConfig::from_config(cfg);
    Ok(match cfg.mem.cache_scheme {
        SchemeKind::AlloyCache => Box::new(alloy::AlloyCache::new(scheme_cfg)?),
        SchemeKind::UnisonCache => Box::new(unison::UnisonCache::new(scheme_cfg)?),
        SchemeKind::BansheeCache => Box::new(banshee::BansheeCache::new(scheme_cfg)?),
        SchemeKind::NoCache => Box::new(simple::NoCache::new(scheme_cfg)),
        SchemeKind::CacheOnly => Box::new(simple::CacheOnly::new(scheme_cfg)),
        SchemeKind::CopyCache => Box::new(simple::CopyCache::new(scheme_cfg)),
        SchemeKind::Ndc => Box::new(ndc::NdcCache::new(scheme_cfg)?),
        SchemeKind::IdealBalanced => {
            Box::new(ideal::IdealCache::new(scheme_cfg, ideal::IdealKind::Balanced)?)
        }
        SchemeKind::IdealAssociative => {
            Box::new(ideal::IdealCache::new(scheme_cfg, ideal::IdealKind::Associative)?)
        }
        SchemeKind::IdealFully => {
            Box::new(ideal::IdealCache::new(scheme_cfg, ideal::IdealKind::Fully)?)
        }
        SchemeKind::IdealHotness => Box::new(hotness::IdealHotness::new(scheme_cfg)?),
        SchemeKind::Chamo => Box::new(chamo::ChamoCache::new(scheme_cfg)?),
    })
}
