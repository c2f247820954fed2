use std::collections::HashMap;

use log::debug;

use crate::cache::placement::PagePlacement;
use crate::cache::unison::TlbEntry;
use crate::cache::{
    mcdram_line_addr, mcdram_select, CacheScheme, SchemeBase, SchemeConfig,
};
use crate::config::{ConfigError, SchemeKind};
use crate::mem::backend::MemoryTiers;
use crate::mem::request::{AccessKind, CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

#[derive(Debug, Clone, Copy)]
struct TagBufferEntry {
    tag: u64,
    remap: bool,
    lru: u32,
}

/// Set-associative buffer of recently remapped tags. Entries with
/// `remap=true` pin a pending tag-store; `remap=false` entries are
/// re-reference hints managed by LRU. Occupancy counts only remap entries.
pub struct TagBuffer {
    num_ways: u64,
    num_sets: u64,
    entries: Vec<TagBufferEntry>,
    entry_occupied: u64,
    last_clear_time: Cycle,
}

impl TagBuffer {
    pub fn new(size: u32) -> Self {
        let num_ways = 8u64;
        let num_sets = (size as u64 / num_ways).max(1);
        let mut entries = Vec::with_capacity((num_sets * num_ways) as usize);
        for _ in 0..num_sets {
            for way in 0..num_ways {
                entries.push(TagBufferEntry {
                    tag: 0,
                    remap: false,
                    lru: way as u32,
                });
            }
        }
        Self {
            num_ways,
            num_sets,
            entries,
            entry_occupied: 0,
            last_clear_time: 0,
        }
    }

    pub fn num_ways(&self) -> u64 {
        self.num_ways
    }

    pub fn occupancy(&self) -> f64 {
        self.entry_occupied as f64 / (self.num_ways * self.num_sets) as f64
    }

    pub fn set_clear_time(&mut self, time: Cycle) {
        self.last_clear_time = time;
    }

    pub fn clear_time(&self) -> Cycle {
        self.last_clear_time
    }

    fn idx(&self, set: u64, way: u64) -> usize {
        (set * self.num_ways + way) as usize
    }

    fn set_of(&self, tag: u64) -> u64 {
        tag % self.num_sets
    }

    pub fn exist_in_tb(&self, tag: u64) -> Option<u64> {
        let set = self.set_of(tag);
        (0..self.num_ways).find(|&w| self.entries[self.idx(set, w)].tag == tag)
    }

    pub fn can_insert(&self, tag: u64) -> bool {
        debug_assert_eq!(
            self.entries.iter().filter(|e| e.remap).count() as u64,
            self.entry_occupied
        );
        let set = self.set_of(tag);
        (0..self.num_ways).any(|w| {
            let e = &self.entries[self.idx(set, w)];
            !e.remap || e.tag == tag
        })
    }

    pub fn can_insert_pair(&self, tag1: u64, tag2: u64) -> bool {
        let set1 = self.set_of(tag1);
        let set2 = self.set_of(tag2);
        if set1 != set2 {
            self.can_insert(tag1) && self.can_insert(tag2)
        } else {
            let usable = (0..self.num_ways)
                .filter(|&w| {
                    let e = &self.entries[self.idx(set1, w)];
                    !e.remap || e.tag == tag1 || e.tag == tag2
                })
                .count();
            usable >= 2
        }
    }

    pub fn insert(&mut self, tag: u64, remap: bool) {
        let set = self.set_of(tag);
        debug_assert!(self.tags_unique(set));
        if let Some(way) = self.exist_in_tb(tag) {
            let idx = self.idx(set, way);
            if remap {
                if !self.entries[idx].remap {
                    self.entry_occupied += 1;
                }
                self.entries[idx].remap = true;
            } else if !self.entries[idx].remap {
                self.update_lru(set, way);
            }
            return;
        }

        // Replace the stalest non-remap entry.
        let mut max_lru = 0;
        let mut replace_way = self.num_ways;
        for way in 0..self.num_ways {
            let e = &self.entries[self.idx(set, way)];
            if !e.remap && e.lru >= max_lru {
                max_lru = e.lru;
                replace_way = way;
            }
        }
        assert!(replace_way != self.num_ways, "caller must check can_insert");
        let idx = self.idx(set, replace_way);
        self.entries[idx].tag = tag;
        self.entries[idx].remap = remap;
        if remap {
            self.entry_occupied += 1;
        } else {
            self.update_lru(set, replace_way);
        }
    }

    fn update_lru(&mut self, set: u64, way: u64) {
        debug_assert!(!self.entries[self.idx(set, way)].remap);
        let pivot = self.entries[self.idx(set, way)].lru;
        for w in 0..self.num_ways {
            let idx = self.idx(set, w);
            if !self.entries[idx].remap && self.entries[idx].lru < pivot {
                self.entries[idx].lru += 1;
            }
        }
        let idx = self.idx(set, way);
        self.entries[idx].lru = 0;
    }

    pub fn clear(&mut self) {
        self.entry_occupied = 0;
        for set in 0..self.num_sets {
            for way in 0..self.num_ways {
                let idx = self.idx(set, way);
                self.entries[idx] = TagBufferEntry {
                    tag: 0,
                    remap: false,
                    lru: way as u32,
                };
            }
        }
    }

    fn tags_unique(&self, set: u64) -> bool {
        for a in 0..self.num_ways {
            for b in a + 1..self.num_ways {
                let ea = &self.entries[self.idx(set, a)];
                let eb = &self.entries[self.idx(set, b)];
                if ea.tag == eb.tag && ea.tag != 0 {
                    return false;
                }
            }
        }
        true
    }
}

const TAG_BUFFER_FLUSH_OCCUPANCY: f64 = 0.7;

/// Page cache that defers tag updates through the tag buffer so dirty LLC
/// evictions usually skip the in-memory tag probe.
pub struct BansheeCache {
    base: SchemeBase,
    placement: PagePlacement,
    tlb: HashMap<u64, TlbEntry>,
    tag_buffer: TagBuffer,
    tag_buffer_flush: u64,
    tb_dirty_hit: u64,
    tb_dirty_miss: u64,
}

impl BansheeCache {
    pub fn new(cfg: SchemeConfig) -> Result<Self, ConfigError> {
        if cfg.granularity < 4096 {
            return Err(ConfigError::Invalid(format!(
                "BansheeCache is page-granular; cache_granularity = {}",
                cfg.granularity
            )));
        }
        let placement =
            PagePlacement::new(cfg.mcdram.placement_policy, cfg.num_sets, cfg.num_ways);
        let tag_buffer = TagBuffer::new(cfg.mcdram.tag_buffer_size);
        Ok(Self {
            base: SchemeBase::new(cfg),
            placement,
            tlb: HashMap::new(),
            tag_buffer,
            tag_buffer_flush: 0,
            tb_dirty_hit: 0,
            tb_dirty_miss: 0,
        })
    }

    pub fn tag_buffer(&self) -> &TagBuffer {
        &self.tag_buffer
    }

    pub fn tag_buffer_flushes(&self) -> u64 {
        self.tag_buffer_flush
    }

    pub fn tb_dirty_hits(&self) -> u64 {
        self.tb_dirty_hit
    }

    pub fn tb_dirty_misses(&self) -> u64 {
        self.tb_dirty_miss
    }

    fn flush_tag_buffer(&mut self, cycle: Cycle) {
        debug!(
            "tag buffer flush, occupancy = {:.3}",
            self.tag_buffer.occupancy()
        );
        self.tag_buffer.clear();
        self.tag_buffer.set_clear_time(cycle);
        self.tag_buffer_flush += 1;
    }
}

impl CacheScheme for BansheeCache {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        let kind = req.kind();
        let address = req.line_addr;
        let cfg = &self.base.cfg;
        let sel = mcdram_select(address, cfg.mcdram_per_mc);
        let mc_address = mcdram_line_addr(address, cfg.mcdram_per_mc);
        let lines_per_page = cfg.lines_per_unit();
        let tag = address / lines_per_page;
        let set_num = tag % cfg.num_sets;
        let num_ways = cfg.num_ways;
        let sram_tag = cfg.sram_tag;
        let llc_latency = cfg.llc_latency as Cycle;
        let mut hybrid_tag_probe = false;
        let mut counter_access = false;
        let data_ready_cycle;

        let entry = self.tlb.entry(tag).or_insert(TlbEntry {
            way: num_ways,
            ..TlbEntry::default()
        });
        entry.count += 1;
        let hit_way = entry.way;
        if hit_way != num_ways {
            let way = self.base.tags.way(set_num, hit_way);
            debug_assert!(way.valid && way.tag == tag);
        } else {
            debug_assert!(self.base.tags.lookup(set_num, tag).is_none());
        }

        // A dirty LLC eviction that misses the tag buffer must probe the
        // in-memory tags before its data write.
        if kind == AccessKind::Store {
            if self.tag_buffer.exist_in_tb(tag).is_none() && set_num >= self.base.ds_index {
                self.tb_dirty_miss += 1;
                if !sram_tag {
                    hybrid_tag_probe = true;
                }
            } else {
                self.tb_dirty_hit += 1;
            }
        }

        if sram_tag {
            req.cycle += llc_latency;
        }

        if hit_way != num_ways {
            let base = &mut self.base;
            base.hits_per_step += 1;
            if self.placement.handle_hit(set_num, hit_way) {
                counter_access = true;
            }
            if kind == AccessKind::Store {
                base.tags.way_mut(set_num, hit_way).dirty = true;
                base.stats.store_hit += 1;
            } else {
                base.stats.load_hit += 1;
            }

            if !hybrid_tag_probe {
                req.line_addr = mc_address;
                req.cycle = mem.mcdram[sel].access(req, RecordKind::NewRecord, 4);
                base.mc_bw_per_step += 4;
                req.line_addr = address;
                data_ready_cycle = req.cycle;
                if kind == AccessKind::Load && self.tag_buffer.can_insert(tag) {
                    self.tag_buffer.insert(tag, false);
                }
            } else {
                debug_assert!(!sram_tag);
                let mut probe = req.derived(mc_address, CoherenceOp::GetShared);
                req.cycle = mem.mcdram[sel].access(&mut probe, RecordKind::NewRecord, 2);
                base.mc_bw_per_step += 2;
                base.stats.tag_load += 1;
                req.line_addr = mc_address;
                req.cycle = mem.mcdram[sel].access(req, RecordKind::CriticalPath, 4);
                base.mc_bw_per_step += 4;
                req.line_addr = address;
                data_ready_cycle = req.cycle;
            }
        } else {
            let base = &mut self.base;
            base.misses_per_step += 1;
            if kind == AccessKind::Load {
                base.stats.load_miss += 1;
            } else {
                base.stats.store_miss += 1;
            }

            let replace_way =
                self.placement
                    .handle_miss(set_num, &base.tags, &mut counter_access);

            if hybrid_tag_probe {
                let mut probe = req.derived(mc_address, CoherenceOp::GetShared);
                req.cycle = mem.mcdram[sel].access(&mut probe, RecordKind::NewRecord, 2);
                base.mc_bw_per_step += 2;
                req.cycle = mem.ext.access(req, RecordKind::CriticalPath, 4);
                base.ext_bw_per_step += 4;
                base.stats.tag_load += 1;
                data_ready_cycle = req.cycle;
            } else {
                req.cycle = mem.ext.access(req, RecordKind::NewRecord, 4);
                base.ext_bw_per_step += 4;
                data_ready_cycle = req.cycle;
            }

            if replace_way < num_ways {
                let victim = base.tags.way(set_num, replace_way);
                if victim.valid {
                    let replaced_tag = victim.tag;
                    self.tlb
                        .get_mut(&replaced_tag)
                        .expect("resident page")
                        .way = num_ways;

                    let bursts = lines_per_page as u32 * 4;
                    if victim.dirty {
                        base.stats.dirty_evict += 1;
                        let mut load = req.derived(mc_address, CoherenceOp::GetShared);
                        mem.mcdram[sel].access(&mut load, RecordKind::SideChain, bursts);
                        base.mc_bw_per_step += bursts as u64;
                        let mut wb = req
                            .derived(replaced_tag * lines_per_page, CoherenceOp::PutExclusive);
                        mem.ext.access(&mut wb, RecordKind::SideChain, bursts);
                        base.ext_bw_per_step += bursts as u64;
                    } else {
                        base.stats.clean_evict += 1;
                    }

                    // Both the incoming and outgoing tags become pending
                    // remaps; flush if they cannot coexist.
                    if !self.tag_buffer.can_insert_pair(tag, replaced_tag) {
                        self.flush_tag_buffer(req.cycle);
                    }
                    debug_assert!(self.tag_buffer.can_insert_pair(tag, replaced_tag));
                    self.tag_buffer.insert(tag, true);
                    self.tag_buffer.insert(replaced_tag, true);
                }

                let base = &mut self.base;
                let bursts = lines_per_page as u32 * 4;
                let mut fetch = req.derived(tag * lines_per_page, CoherenceOp::GetShared);
                mem.ext.access(&mut fetch, RecordKind::SideChain, bursts);
                base.ext_bw_per_step += bursts as u64;

                let mut insert = req.derived(mc_address, CoherenceOp::PutExclusive);
                mem.mcdram[sel].access(&mut insert, RecordKind::SideChain, bursts);
                if !sram_tag {
                    let mut tag_store = req.derived(mc_address, CoherenceOp::PutExclusive);
                    mem.mcdram[sel].access(&mut tag_store, RecordKind::SideChain, 2);
                    base.mc_bw_per_step += 2;
                }
                base.mc_bw_per_step += bursts as u64;
                base.stats.tag_store += 1;
                base.stats.placement += 1;

                let way = base.tags.way_mut(set_num, replace_way);
                way.valid = true;
                way.tag = tag;
                way.dirty = kind == AccessKind::Store;
                self.tlb.get_mut(&tag).expect("entry ensured above").way = replace_way;
            } else if kind == AccessKind::Load && self.tag_buffer.can_insert(tag) {
                self.tag_buffer.insert(tag, false);
            }
        }

        if counter_access && !sram_tag {
            debug_assert!(set_num >= self.base.ds_index);
            let base = &mut self.base;
            base.stats.counter_access += 1;
            let mut counter = req.derived(mc_address, CoherenceOp::GetShared);
            mem.mcdram[sel].access(&mut counter, RecordKind::SideChain, 2);
            counter.op = CoherenceOp::PutExclusive;
            mem.mcdram[sel].access(&mut counter, RecordKind::SideChain, 2);
            base.mc_bw_per_step += 4;
        }

        if self.tag_buffer.occupancy() > TAG_BUFFER_FLUSH_OCCUPANCY {
            self.flush_tag_buffer(req.cycle);
        }

        data_ready_cycle
    }

    fn period(&mut self, req: &MemRequest, mem: &mut MemoryTiers) {
        self.base.decay_step_counters();
        let num_ways = self.base.cfg.num_ways;
        let dropped = self.base.rebalance(req, mem);
        for evicted in &dropped {
            if let Some(entry) = self.tlb.get_mut(&evicted.tag) {
                entry.way = num_ways;
            }
            if !self.tag_buffer.can_insert(evicted.tag) {
                self.flush_tag_buffer(req.cycle);
            }
            self.tag_buffer.insert(evicted.tag, true);
        }
        let mut last_set = None;
        for evicted in &dropped {
            if last_set != Some(evicted.set) {
                self.placement.flush_set(evicted.set);
                last_set = Some(evicted.set);
            }
        }
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new("bansheeCache");
        self.base.stats.append_to(&mut group);
        group.add("tagBufferFlush", self.tag_buffer_flush);
        group.add("TBDirtyHit", self.tb_dirty_hit);
        group.add("TBDirtyMiss", self.tb_dirty_miss);
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::BansheeCache
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}
