use crate::cache::utilization::UtilizationTracker;
use crate::cache::{CacheScheme, SchemeBase, SchemeConfig};
use crate::config::{ConfigError, SchemeKind};
use crate::mem::backend::MemoryTiers;
use crate::mem::request::{AccessKind, CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdealKind {
    /// Round-robin replacement.
    Balanced,
    /// Prefer empty ways, then round-robin.
    Associative,
    /// True LRU over all ways.
    Fully,
}

#[derive(Debug, Clone, Copy, Default)]
struct LruNode {
    prev: u64,
    next: u64,
}

/// Doubly-linked ring over way indices with O(1) touch and O(1) LRU
/// lookup.
#[derive(Debug)]
struct LruRing {
    nodes: Vec<LruNode>,
    mru_way: u64,
    lru_way: u64,
}

impl LruRing {
    fn new(num_ways: u64) -> Self {
        let mut nodes = vec![LruNode::default(); num_ways as usize];
        for i in 0..num_ways {
            nodes[i as usize] = LruNode {
                prev: (i + num_ways - 1) % num_ways,
                next: (i + 1) % num_ways,
            };
        }
        Self {
            nodes,
            mru_way: 0,
            lru_way: num_ways - 1,
        }
    }

    fn lru_way(&self) -> u64 {
        self.lru_way
    }

    fn touch(&mut self, way: u64) {
        if way == self.mru_way {
            return;
        }
        let prev = self.nodes[way as usize].prev;
        let next = self.nodes[way as usize].next;
        self.nodes[prev as usize].next = next;
        self.nodes[next as usize].prev = prev;
        if way == self.lru_way {
            self.lru_way = prev;
        }
        let old_prev_of_mru = self.nodes[self.mru_way as usize].prev;
        self.nodes[way as usize].next = self.mru_way;
        self.nodes[way as usize].prev = old_prev_of_mru;
        self.nodes[self.mru_way as usize].prev = way;
        self.nodes[old_prev_of_mru as usize].next = way;
        self.mru_way = way;
    }
}

/// One huge set covering the whole near memory, with a dense side table
/// mapping every external line to its way (or `num_ways` for absent).
/// The three variants differ only in victim choice.
pub struct IdealCache {
    base: SchemeBase,
    kind: IdealKind,
    line_entries: Vec<u64>,
    current_way: u64,
    lru: Option<LruRing>,
    util: UtilizationTracker,
}

impl IdealCache {
    pub fn new(cfg: SchemeConfig, kind: IdealKind) -> Result<Self, ConfigError> {
        if cfg.mcdram_per_mc != 1 {
            return Err(ConfigError::Invalid(
                "ideal schemes use a single near-memory instance".to_string(),
            ));
        }
        if cfg.granularity != 64 {
            return Err(ConfigError::Invalid(format!(
                "ideal schemes are line-granular; cache_granularity = {}",
                cfg.granularity
            )));
        }
        if cfg.num_sets != 1 {
            return Err(ConfigError::Invalid(format!(
                "ideal schemes model one set; num_ways must equal the line \
                 capacity (num_sets = {})",
                cfg.num_sets
            )));
        }
        let num_line_entries = cfg.ext_size / 64;
        let lru = (kind == IdealKind::Fully).then(|| LruRing::new(cfg.num_ways));
        let util = UtilizationTracker::new(
            cfg.num_ways,
            num_line_entries,
            cfg.mcdram.page_size / 64,
        );
        log::info!(
            "ideal cache ({kind:?}): {} ways, {} line entries",
            cfg.num_ways,
            num_line_entries
        );
        Ok(Self {
            line_entries: vec![cfg.num_ways; num_line_entries as usize],
            base: SchemeBase::new(cfg),
            kind,
            current_way: 0,
            lru,
            util,
        })
    }

    fn select_victim(&mut self) -> u64 {
        match self.kind {
            IdealKind::Fully => self.lru.as_ref().expect("fully keeps LRU").lru_way(),
            IdealKind::Associative => {
                if let Some(way) = self.base.tags.empty_way(0) {
                    way
                } else {
                    let way = self.current_way;
                    self.current_way = (self.current_way + 1) % self.base.cfg.num_ways;
                    way
                }
            }
            IdealKind::Balanced => {
                let way = self.current_way;
                self.current_way = (self.current_way + 1) % self.base.cfg.num_ways;
                way
            }
        }
    }

    fn touch(&mut self, way: u64) {
        if let Some(lru) = self.lru.as_mut() {
            lru.touch(way);
        }
        self.util.touch_cache_line(way);
    }

    /// Way a line currently resides in, if any.
    pub fn line_entry(&self, line: u64) -> Option<u64> {
        let way = self.line_entries[line as usize];
        (way < self.base.cfg.num_ways).then_some(way)
    }

    fn scheme_name(&self) -> &'static str {
        match self.kind {
            IdealKind::Balanced => "idealBalancedCache",
            IdealKind::Associative => "idealAssociativeCache",
            IdealKind::Fully => "idealFullyCache",
        }
    }
}

impl CacheScheme for IdealCache {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        let num_ways = self.base.cfg.num_ways;
        let address = req.line_addr % (self.base.cfg.ext_size / 64);
        let line_num = address as usize;
        let tag = address;
        let is_load = req.kind() == AccessKind::Load;
        self.util.touch_ext_line(address);

        let mut hit_way = num_ways;
        if self.line_entries[line_num] < num_ways {
            hit_way = self.line_entries[line_num];
            let way = self.base.tags.way(0, hit_way);
            debug_assert!(way.valid && way.tag == tag);
        }

        // Near memory sees every request up front; the miss path then adds
        // the far-tier fetch on the critical path.
        let op = if is_load { CoherenceOp::GetShared } else { CoherenceOp::PutExclusive };
        let mut near = req.derived(address, op);
        req.cycle = mem.mcdram[0].access(&mut near, RecordKind::NewRecord, 4);
        self.base.mc_bw_per_step += 4;
        let mut data_ready_cycle = req.cycle;

        if hit_way < num_ways {
            self.base.hits_per_step += 1;
            if is_load {
                self.base.stats.load_hit += 1;
            } else {
                self.base.stats.store_hit += 1;
                self.base.tags.way_mut(0, hit_way).dirty = true;
            }
            self.touch(hit_way);
        } else {
            self.base.misses_per_step += 1;
            if is_load {
                self.base.stats.load_miss += 1;
            } else {
                self.base.stats.store_miss += 1;
            }

            let mut fetch = req.derived(address, CoherenceOp::GetShared);
            data_ready_cycle = mem.ext.access(&mut fetch, RecordKind::CriticalPath, 4);
            self.base.ext_bw_per_step += 4;

            let victim_way = self.select_victim();
            let victim = self.base.tags.way(0, victim_way);
            if victim.valid {
                // Keep the side table exact: the displaced line is no
                // longer resident.
                self.line_entries[victim.tag as usize] = num_ways;
                if victim.dirty {
                    self.base.stats.dirty_evict += 1;
                    let mut wb = req.derived(victim.tag, CoherenceOp::PutExclusive);
                    mem.ext.access(&mut wb, RecordKind::SideChain, 4);
                    self.base.ext_bw_per_step += 4;
                } else {
                    self.base.stats.clean_evict += 1;
                }
            }

            self.line_entries[line_num] = victim_way;
            let entry = self.base.tags.way_mut(0, victim_way);
            entry.tag = tag;
            entry.valid = true;
            entry.dirty = !is_load;
            self.touch(victim_way);
        }

        data_ready_cycle
    }

    fn period(&mut self, req: &MemRequest, mem: &mut MemoryTiers) {
        if self.base.cfg.mcdram.utilstats_period != 0 {
            self.util.log_summary(self.scheme_name());
            self.util.smooth();
        }
        self.base.decay_step_counters();
        for dropped in self.base.rebalance(req, mem) {
            self.line_entries[dropped.tag as usize] = self.base.cfg.num_ways;
        }
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new(self.scheme_name());
        self.base.stats.append_to(&mut group);
        self.util.append_to(&mut group);
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        match self.kind {
            IdealKind::Balanced => SchemeKind::IdealBalanced,
            IdealKind::Associative => SchemeKind::IdealAssociative,
            IdealKind::Fully => SchemeKind::IdealFully,
        }
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}
