use crate::cache::utilization::UtilizationTracker;
use crate::cache::{
    mcdram_line_addr, mcdram_select, CacheScheme, SchemeBase, SchemeConfig,
};
use crate::config::SchemeKind;
use crate::mem::backend::MemoryTiers;
use crate::mem::request::{AccessKind, CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

/// Everything goes to the external tier; near memory is not allocated.
pub struct NoCache {
    base: SchemeBase,
}

impl NoCache {
    pub fn new(cfg: SchemeConfig) -> Self {
        Self {
            base: SchemeBase::new(cfg),
        }
    }
}

impl CacheScheme for NoCache {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        req.cycle = mem.ext.access(req, RecordKind::NewRecord, 4);
        self.base.ext_bw_per_step += 4;
        match req.kind() {
            AccessKind::Load => self.base.stats.load_hit += 1,
            AccessKind::Store => self.base.stats.store_hit += 1,
        }
        req.cycle
    }

    fn period(&mut self, _req: &MemRequest, _mem: &mut MemoryTiers) {
        self.base.decay_step_counters();
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new("noCache");
        self.base.stats.append_to(&mut group);
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::NoCache
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}

/// The whole working set lives in near memory; every access is a hit.
pub struct CacheOnly {
    base: SchemeBase,
    util: UtilizationTracker,
}

impl CacheOnly {
    pub fn new(cfg: SchemeConfig) -> Self {
        let util = UtilizationTracker::new(
            cfg.cache_size / 64,
            cfg.ext_size / 64,
            cfg.mcdram.page_size / 64,
        );
        Self {
            base: SchemeBase::new(cfg),
            util,
        }
    }
}

impl CacheScheme for CacheOnly {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        let address = req.line_addr;
        let sel = mcdram_select(address, self.base.cfg.mcdram_per_mc);
        let mc_address = mcdram_line_addr(address, self.base.cfg.mcdram_per_mc);

        req.line_addr = mc_address;
        req.cycle = mem.mcdram[sel].access(req, RecordKind::NewRecord, 4);
        req.line_addr = address;
        self.base.mc_bw_per_step += 4;
        self.base.stats.load_hit += 1;
        self.base.hits_per_step += 1;

        self.util.touch_ext_line(address);
        self.util
            .touch_cache_line(address % (self.base.cfg.cache_size / 64));

        req.cycle
    }

    fn period(&mut self, _req: &MemRequest, _mem: &mut MemoryTiers) {
        if self.base.cfg.mcdram.utilstats_period != 0 {
            self.util.log_summary("cacheOnly");
            self.util.smooth();
        }
        self.base.decay_step_counters();
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new("cacheOnly");
        self.base.stats.append_to(&mut group);
        self.util.append_to(&mut group);
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::CacheOnly
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}

/// Near memory holds a full mirror of the working set: reads are served
/// locally, writes update the mirror and propagate to the external tier
/// off the critical path.
pub struct CopyCache {
    base: SchemeBase,
}

impl CopyCache {
    pub fn new(cfg: SchemeConfig) -> Self {
        Self {
            base: SchemeBase::new(cfg),
        }
    }
}

impl CacheScheme for CopyCache {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        let address = req.line_addr;
        let sel = mcdram_select(address, self.base.cfg.mcdram_per_mc);
        let mc_address = mcdram_line_addr(address, self.base.cfg.mcdram_per_mc);

        req.line_addr = mc_address;
        req.cycle = mem.mcdram[sel].access(req, RecordKind::NewRecord, 4);
        req.line_addr = address;
        self.base.mc_bw_per_step += 4;
        self.base.hits_per_step += 1;

        match req.kind() {
            AccessKind::Load => self.base.stats.load_hit += 1,
            AccessKind::Store => {
                let mut mirror = req.derived(address, CoherenceOp::PutExclusive);
                mem.ext.access(&mut mirror, RecordKind::SideChain, 4);
                self.base.ext_bw_per_step += 4;
                self.base.stats.store_hit += 1;
            }
        }

        req.cycle
    }

    fn period(&mut self, _req: &MemRequest, _mem: &mut MemoryTiers) {
        self.base.decay_step_counters();
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new("copyCache");
        self.base.stats.append_to(&mut group);
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::CopyCache
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}
