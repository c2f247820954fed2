use crate::cache::placement::LinePlacement;
use crate::cache::{
    mcdram_line_addr, mcdram_select, CacheScheme, SchemeBase, SchemeConfig,
};
use crate::config::{ConfigError, SchemeKind};
use crate::mem::backend::MemoryTiers;
use crate::mem::request::{AccessKind, CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

/// Direct-mapped line cache with tags stored alongside data (TAD): a load
/// streams tag and data out of near memory in one 6-burst access; an SRAM
/// tag array replaces that with an L3-latency probe.
pub struct AlloyCache {
    base: SchemeBase,
    placement: LinePlacement,
}

impl AlloyCache {
    pub fn new(cfg: SchemeConfig) -> Result<Self, ConfigError> {
        if cfg.num_ways != 1 {
            return Err(ConfigError::Invalid(format!(
                "AlloyCache is direct-mapped; num_ways = {}",
                cfg.num_ways
            )));
        }
        let placement = LinePlacement::new(cfg.mcdram.placement_policy);
        Ok(Self {
            base: SchemeBase::new(cfg),
            placement,
        })
    }
}

impl CacheScheme for AlloyCache {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        let base = &mut self.base;
        let cfg = &base.cfg;
        let kind = req.kind();
        let address = req.line_addr;
        let sel = mcdram_select(address, cfg.mcdram_per_mc);
        let mc_address = mcdram_line_addr(address, cfg.mcdram_per_mc);
        let lines_per_unit = cfg.lines_per_unit();
        let tag = address / lines_per_unit;
        let set_num = tag % cfg.num_sets;
        let cached_set = set_num >= base.ds_index;
        let mut data_ready_cycle = req.cycle;

        let way0 = base.tags.way(set_num, 0);
        let hit = cached_set && way0.valid && way0.tag == tag;

        // A load probes the tag (and data, hit or not) up front.
        if kind == AccessKind::Load && cached_set {
            if cfg.sram_tag {
                req.cycle += cfg.llc_latency as Cycle;
            } else {
                req.line_addr = mc_address;
                req.cycle = mem.mcdram[sel].access(req, RecordKind::NewRecord, 6);
                base.mc_bw_per_step += 6;
                base.stats.tag_load += 1;
                req.line_addr = address;
            }
        }

        if hit {
            base.hits_per_step += 1;
            if kind == AccessKind::Load && cfg.sram_tag {
                let mut read = req.derived(mc_address, CoherenceOp::GetExclusive);
                req.cycle = mem.mcdram[sel].access(&mut read, RecordKind::NewRecord, 4);
                base.mc_bw_per_step += 4;
            }
            if kind == AccessKind::Store {
                let mut write = req.derived(mc_address, CoherenceOp::PutExclusive);
                req.cycle = mem.mcdram[sel].access(&mut write, RecordKind::NewRecord, 4);
                base.mc_bw_per_step += 4;
                base.tags.way_mut(set_num, 0).dirty = true;
                base.stats.store_hit += 1;
            } else {
                base.stats.load_hit += 1;
            }
            data_ready_cycle = req.cycle;
        } else {
            base.misses_per_step += 1;
            if kind == AccessKind::Load {
                base.stats.load_miss += 1;
            } else {
                base.stats.store_miss += 1;
            }

            let place = cached_set && self.placement.handle_miss(&way0);

            match kind {
                AccessKind::Load => {
                    // The external fetch chains after the failed tag+data
                    // probe unless the tag lives in SRAM.
                    let record = if !cfg.sram_tag && cached_set {
                        RecordKind::CriticalPath
                    } else {
                        RecordKind::NewRecord
                    };
                    req.cycle = mem.ext.access(req, record, 4);
                    base.ext_bw_per_step += 4;
                    data_ready_cycle = req.cycle;
                }
                AccessKind::Store if !place => {
                    req.cycle = mem.ext.access(req, RecordKind::NewRecord, 4);
                    base.ext_bw_per_step += 4;
                    data_ready_cycle = req.cycle;
                }
                AccessKind::Store => {
                    // Write-allocate: fetch the line before installing it.
                    let mut fill = req.derived(address, CoherenceOp::GetShared);
                    req.cycle = mem.ext.access(&mut fill, RecordKind::NewRecord, 4);
                    base.ext_bw_per_step += 4;
                    data_ready_cycle = req.cycle;
                }
            }

            if place {
                let mut insert = req.derived(mc_address, CoherenceOp::PutExclusive);
                let size = if cfg.sram_tag { 4 } else { 6 };
                mem.mcdram[sel].access(&mut insert, RecordKind::SideChain, size);
                base.mc_bw_per_step += size as u64;
                base.stats.tag_store += 1;
                base.stats.placement += 1;

                let victim = base.tags.way(set_num, 0);
                if victim.valid {
                    if victim.dirty {
                        base.stats.dirty_evict += 1;
                        if kind == AccessKind::Store && cfg.sram_tag {
                            let mut load = req.derived(mc_address, CoherenceOp::GetShared);
                            req.cycle =
                                mem.mcdram[sel].access(&mut load, RecordKind::SideChain, 4);
                            base.mc_bw_per_step += 4;
                        }
                        let mut wb = req
                            .derived(victim.tag * lines_per_unit, CoherenceOp::PutExclusive);
                        mem.ext.access(&mut wb, RecordKind::SideChain, 4);
                        base.ext_bw_per_step += 4;
                    } else {
                        base.stats.clean_evict += 1;
                    }
                }
                let entry = base.tags.way_mut(set_num, 0);
                entry.valid = true;
                entry.tag = tag;
                entry.dirty = req.op == CoherenceOp::PutExclusive;
            }
        }

        data_ready_cycle
    }

    fn period(&mut self, req: &MemRequest, mem: &mut MemoryTiers) {
        self.base.decay_step_counters();
        self.base.rebalance(req, mem);
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new("alloyCache");
        self.base.stats.append_to(&mut group);
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::AlloyCache
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}
