use std::collections::HashMap;

use crate::cache::placement::PagePlacement;
use crate::cache::{
    mcdram_line_addr, mcdram_select, CacheScheme, SchemeBase, SchemeConfig,
};
use crate::config::{ConfigError, SchemeKind};
use crate::mem::backend::MemoryTiers;
use crate::mem::request::{AccessKind, CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

/// Per-page metadata. One touch/dirty bit covers four lines of the page;
/// the bitvectors drive footprint writeback and prefetch sizing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TlbEntry {
    pub way: u64,
    pub count: u64,
    pub touch_bitvec: u64,
    pub dirty_bitvec: u64,
}

/// Set-associative page cache with TLB-resident footprint bitvectors.
/// Misses prefetch `footprint_size` lines; evictions write back only the
/// dirty part of the page.
pub struct UnisonCache {
    base: SchemeBase,
    placement: PagePlacement,
    tlb: HashMap<u64, TlbEntry>,
    footprint_size: u32,
    touched_lines: u64,
    evicted_lines: u64,
}

impl UnisonCache {
    pub fn new(cfg: SchemeConfig) -> Result<Self, ConfigError> {
        if cfg.granularity < 4096 {
            return Err(ConfigError::Invalid(format!(
                "UnisonCache is page-granular; cache_granularity = {}",
                cfg.granularity
            )));
        }
        let placement =
            PagePlacement::new(cfg.mcdram.placement_policy, cfg.num_sets, cfg.num_ways);
        let footprint_size = cfg.mcdram.footprint_size;
        Ok(Self {
            base: SchemeBase::new(cfg),
            placement,
            tlb: HashMap::new(),
            footprint_size,
            touched_lines: 0,
            evicted_lines: 0,
        })
    }

    fn line_bit(lines_per_page: u64, address: u64) -> u64 {
        let bit = (address % lines_per_page) / 4;
        debug_assert!(bit < 64);
        1u64 << bit
    }

    pub fn touched_line_count(&self) -> u64 {
        self.touched_lines
    }

    pub fn evicted_line_count(&self) -> u64 {
        self.evicted_lines
    }
}

impl CacheScheme for UnisonCache {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        let base = &mut self.base;
        let cfg = &base.cfg;
        let kind = req.kind();
        let address = req.line_addr % (cfg.ext_size / 64);
        let sel = mcdram_select(address, cfg.mcdram_per_mc);
        let mc_address = mcdram_line_addr(address, cfg.mcdram_per_mc);
        let lines_per_page = cfg.lines_per_unit();
        let tag = address / lines_per_page;
        let set_num = tag % cfg.num_sets;
        let num_ways = cfg.num_ways;
        let mut counter_access = false;
        let data_ready_cycle;

        let entry = self.tlb.entry(tag).or_insert(TlbEntry {
            way: num_ways,
            ..TlbEntry::default()
        });
        entry.count += 1;
        let hit_way = entry.way;
        if hit_way != num_ways {
            let way = base.tags.way(set_num, hit_way);
            debug_assert!(way.valid && way.tag == tag);
        } else {
            debug_assert!(base.tags.lookup(set_num, tag).is_none());
        }

        // Tag probe: a load streams tag+data, a store only checks the tag.
        if kind == AccessKind::Load {
            req.line_addr = mc_address;
            req.cycle = mem.mcdram[sel].access(req, RecordKind::NewRecord, 6);
            base.mc_bw_per_step += 6;
            base.stats.tag_load += 1;
            req.line_addr = address;
        } else {
            let mut probe = req.derived(mc_address, CoherenceOp::GetShared);
            req.cycle = mem.mcdram[sel].access(&mut probe, RecordKind::NewRecord, 2);
            base.mc_bw_per_step += 2;
            base.stats.tag_load += 1;
        }

        if hit_way != num_ways {
            base.hits_per_step += 1;
            if kind == AccessKind::Store {
                let mut write = req.derived(mc_address, CoherenceOp::PutExclusive);
                req.cycle = mem.mcdram[sel].access(&mut write, RecordKind::CriticalPath, 4);
                base.mc_bw_per_step += 4;
                base.stats.store_hit += 1;
            } else {
                base.stats.load_hit += 1;
            }
            data_ready_cycle = req.cycle;
            if self.placement.handle_hit(set_num, hit_way) {
                counter_access = true;
            }

            // LRU bits live with the in-memory tags.
            let mut tag_update = req.derived(mc_address, CoherenceOp::PutExclusive);
            mem.mcdram[sel].access(&mut tag_update, RecordKind::SideChain, 2);
            base.mc_bw_per_step += 2;
            base.stats.tag_store += 1;

            let bit = Self::line_bit(lines_per_page, address);
            let entry = self.tlb.get_mut(&tag).expect("entry ensured above");
            entry.touch_bitvec |= bit;
            if kind == AccessKind::Store {
                entry.dirty_bitvec |= bit;
            }
        } else {
            base.misses_per_step += 1;
            if kind == AccessKind::Load {
                base.stats.load_miss += 1;
            } else {
                base.stats.store_miss += 1;
            }

            let replace_way =
                self.placement
                    .handle_miss(set_num, &base.tags, &mut counter_access);

            if kind == AccessKind::Load || replace_way >= num_ways {
                req.cycle = mem.ext.access(req, RecordKind::CriticalPath, 4);
                base.ext_bw_per_step += 4;
            }
            data_ready_cycle = req.cycle;

            if replace_way < num_ways {
                let victim = base.tags.way(set_num, replace_way);
                if victim.valid {
                    let replaced_tag = victim.tag;
                    let evicted = self.tlb.get_mut(&replaced_tag).expect("resident page");
                    evicted.way = num_ways;
                    let dirty_lines = evicted.dirty_bitvec.count_ones() as u64 * 4;
                    let touch_lines = evicted.touch_bitvec.count_ones() as u64 * 4;
                    debug_assert!(touch_lines > 0 && touch_lines <= lines_per_page);
                    debug_assert!(dirty_lines <= lines_per_page);
                    self.touched_lines += touch_lines;
                    self.evicted_lines += dirty_lines;

                    if dirty_lines > 0 {
                        base.stats.dirty_evict += 1;
                        let bursts = dirty_lines as u32 * 4;
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
                }

                // Footprint prefetch from the far tier, then install.
                let bursts = self.footprint_size * 4;
                let mut fetch = req.derived(tag * lines_per_page, CoherenceOp::GetShared);
                mem.ext.access(&mut fetch, RecordKind::SideChain, bursts);
                base.ext_bw_per_step += bursts as u64;

                let mut insert = req.derived(mc_address, CoherenceOp::PutExclusive);
                mem.mcdram[sel].access(&mut insert, RecordKind::SideChain, bursts);
                if !cfg.sram_tag {
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

                let bit = Self::line_bit(lines_per_page, address);
                let entry = self.tlb.get_mut(&tag).expect("entry ensured above");
                entry.way = replace_way;
                entry.touch_bitvec = bit;
                entry.dirty_bitvec = if kind == AccessKind::Store { bit } else { 0 };
            }
        }

        if counter_access && !cfg.sram_tag {
            base.stats.counter_access += 1;
            let mut counter = req.derived(mc_address, CoherenceOp::GetShared);
            mem.mcdram[sel].access(&mut counter, RecordKind::SideChain, 2);
            counter.op = CoherenceOp::PutExclusive;
            mem.mcdram[sel].access(&mut counter, RecordKind::SideChain, 2);
            base.mc_bw_per_step += 4;
        }

        data_ready_cycle
    }

    fn period(&mut self, req: &MemRequest, mem: &mut MemoryTiers) {
        self.base.decay_step_counters();
        let num_ways = self.base.cfg.num_ways;
        for dropped in self.base.rebalance(req, mem) {
            if let Some(entry) = self.tlb.get_mut(&dropped.tag) {
                entry.way = num_ways;
            }
            self.placement.flush_set(dropped.set);
        }
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new("unisonCache");
        self.base.stats.append_to(&mut group);
        group.add("totalTouchLines", self.touched_lines);
        group.add("totalEvictLines", self.evicted_lines);
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::UnisonCache
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}
