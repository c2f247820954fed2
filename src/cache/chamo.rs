use log::debug;

use crate::cache::{CacheScheme, SchemeBase, SchemeConfig};
use crate::config::{ChamoIndexKind, ConfigError, SchemeKind};
use crate::hash::bit_mixing::BitMixHasher;
use crate::hash::cuckoo::{CuckooHasher, CuckooIndex};
use crate::hash::shuffle::ShuffleHasher;
use crate::hash::{xx_hash, LcgHash, NextLineHash};
use crate::mem::backend::MemoryTiers;
use crate::mem::request::{AccessKind, CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

#[derive(Debug, Default, Clone, Copy)]
struct RankMetrics {
    /// External lines ever touched.
    nr_touched: u64,
    /// Lines currently resolved through a cuckoo (next-line) mapping.
    nr_cuckoo: u64,
    nr_period_hash_change: u64,
    nr_period_access: u64,
    nr_period_newly_cached: u64,
}

/// Rank-arithmetic indexing over a `nr_dram_cache x dram_ratio` cell
/// matrix. Each near-memory column tracks how many of its own lines it
/// holds (self-contain rank) and how many it lent to its left neighbor
/// (overflow rank); a line's base rank orders the touched cells of its
/// column. Comparing the three ranks against the load-driven map limit
/// picks one of two next-line mappings or the hashed fallback.
struct RankIndex {
    nr_dram_cache: u64,
    nr_cxl_cache: u64,
    dram_ratio: u64,
    nr_map_limit: u64,
    load_ratio: u64,
    metrics: RankMetrics,
    overflow_rank: Vec<u64>,
    base_rank: Vec<Vec<u64>>,
    self_contain_rank: Vec<u64>,
    access_bit_map: Vec<Vec<bool>>,
    is_cuckoo_hash: Vec<Vec<bool>>,
    hash_idx: Vec<Vec<u8>>,
    lcg: LcgHash,
    next_line: NextLineHash,
}

const CHAMO_LOAD_RATIO: u64 = 95;

impl RankIndex {
    fn new(nr_dram_cache: u64, nr_cxl_cache: u64) -> Self {
        let dram_ratio = nr_cxl_cache / nr_dram_cache;
        Self {
            nr_dram_cache,
            nr_cxl_cache,
            dram_ratio,
            nr_map_limit: 1,
            load_ratio: CHAMO_LOAD_RATIO,
            metrics: RankMetrics::default(),
            overflow_rank: vec![0; nr_dram_cache as usize],
            base_rank: vec![vec![0; nr_dram_cache as usize]; dram_ratio as usize],
            self_contain_rank: vec![0; nr_dram_cache as usize],
            access_bit_map: vec![vec![false; nr_dram_cache as usize]; dram_ratio as usize],
            is_cuckoo_hash: vec![vec![false; nr_dram_cache as usize]; dram_ratio as usize],
            hash_idx: vec![vec![u8::MAX; nr_dram_cache as usize]; dram_ratio as usize],
            lcg: LcgHash::new(nr_cxl_cache),
            next_line: NextLineHash::new(nr_dram_cache),
        }
    }

    /// Touched cells in one column across all levels.
    fn col_cap(&self, col: u64) -> u64 {
        (0..self.dram_ratio)
            .filter(|&level| self.access_bit_map[level as usize][col as usize])
            .count() as u64
    }

    fn base_rank_of(&self, col: u64, target_level: u64) -> u64 {
        let mut base_rank = 1;
        for level in 0..self.dram_ratio {
            if level == target_level {
                debug_assert!(self.access_bit_map[level as usize][col as usize]);
                break;
            }
            if self.access_bit_map[level as usize][col as usize] {
                base_rank += 1;
            }
        }
        debug_assert!(base_rank <= self.dram_ratio);
        debug_assert!(self.col_cap(col) >= base_rank);
        base_rank
    }

    fn update_map_limit(&mut self) {
        let raw = (self.metrics.nr_cuckoo * 100 / self.load_ratio + self.nr_dram_cache - 1)
            / self.nr_dram_cache;
        self.nr_map_limit = raw.clamp(1, self.dram_ratio);
    }

    /// First seen: claim a slot in the right neighbor's budget if it has
    /// room, else in the own column's.
    fn update_mapping_info(&mut self, col: u64, level: u64) {
        debug_assert!(!self.is_cuckoo_hash[level as usize][col as usize]);
        let next_col = (col + 1) % self.nr_dram_cache;
        if self.self_contain_rank[next_col as usize] + self.overflow_rank[next_col as usize]
            < self.nr_map_limit
        {
            self.overflow_rank[next_col as usize] += 1;
            self.is_cuckoo_hash[level as usize][col as usize] = true;
            self.metrics.nr_cuckoo += 1;
            return;
        }
        if self.self_contain_rank[col as usize] + self.overflow_rank[col as usize]
            < self.nr_map_limit
        {
            self.self_contain_rank[col as usize] += 1;
            self.is_cuckoo_hash[level as usize][col as usize] = true;
            self.metrics.nr_cuckoo += 1;
        }
    }

    fn hash_idx_to_addr(&mut self, col: u64, level: u64, hash_idx: u64) -> u64 {
        let target_addr;
        if hash_idx < 2 {
            if !self.is_cuckoo_hash[level as usize][col as usize] {
                self.is_cuckoo_hash[level as usize][col as usize] = true;
                self.metrics.nr_cuckoo += 1;
            }
            target_addr = self.next_line.hash(col, hash_idx);
        } else {
            debug_assert_eq!(hash_idx, 2);
            if self.is_cuckoo_hash[level as usize][col as usize] {
                self.is_cuckoo_hash[level as usize][col as usize] = false;
                self.metrics.nr_cuckoo -= 1;
            }
            debug_assert!(col + level * self.nr_dram_cache < self.nr_cxl_cache);
            target_addr = xx_hash(col + level * self.nr_dram_cache) % self.nr_dram_cache;
        }
        debug_assert!(self.metrics.nr_cuckoo <= self.metrics.nr_touched);

        if self.hash_idx[level as usize][col as usize] != hash_idx as u8 {
            self.metrics.nr_period_hash_change += 1;
            self.hash_idx[level as usize][col as usize] = hash_idx as u8;
        }
        target_addr
    }

    fn rank_to_addr(&mut self, base_rank: u64, col: u64, level: u64) -> u64 {
        let next_col = (col + 1) % self.nr_dram_cache;
        let target_hash_idx = if base_rank <= self.overflow_rank[next_col as usize] {
            // Fits in the budget borrowed from the neighbor column.
            1
        } else if base_rank - self.overflow_rank[next_col as usize]
            <= self.self_contain_rank[col as usize]
        {
            0
        } else {
            2
        };
        self.hash_idx_to_addr(col, level, target_hash_idx)
    }

    fn index(&mut self, cache_addr: u64) -> u64 {
        let phy_line_addr = self.lcg.hash(cache_addr, 0);
        debug_assert!(phy_line_addr < self.nr_cxl_cache);
        self.metrics.nr_period_access += 1;

        let level = phy_line_addr / self.nr_dram_cache;
        let col = phy_line_addr % self.nr_dram_cache;

        if !self.access_bit_map[level as usize][col as usize] {
            debug_assert_eq!(self.base_rank[level as usize][col as usize], 0);
            self.base_rank[level as usize][col as usize] = self.col_cap(col) + 1;
            self.access_bit_map[level as usize][col as usize] = true;
            self.metrics.nr_touched += 1;
            self.metrics.nr_period_newly_cached += 1;
            debug_assert_eq!(
                self.base_rank[level as usize][col as usize],
                self.col_cap(col)
            );
            self.update_mapping_info(col, level);
        }

        self.update_map_limit();
        let base_rank = self.base_rank_of(col, level);
        self.rank_to_addr(base_rank, col, level)
    }

    fn reset_period_metrics(&mut self) {
        debug!(
            "chamo period: {} accesses, {} newly cached, {} hash changes, map limit {}",
            self.metrics.nr_period_access,
            self.metrics.nr_period_newly_cached,
            self.metrics.nr_period_hash_change,
            self.nr_map_limit
        );
        self.metrics.nr_period_access = 0;
        self.metrics.nr_period_newly_cached = 0;
        self.metrics.nr_period_hash_change = 0;
    }
}

/// Mapping engine behind the CHAMO tag array: the rank arithmetic above, or
/// a per-mapping-unit cuckoo index with a selectable bucket hasher.
enum ChamoIndex {
    Rank(RankIndex),
    Cuckoo {
        units: Vec<CuckooIndex>,
        nr_set_per_unit: u64,
        nr_dram_cache: u64,
    },
}

/// Cuckoo-indexed overflow cache over the whole near memory. Lines keep
/// their identity as tags (one way per set); the index engine decides which
/// set a line lands in.
pub struct ChamoCache {
    base: SchemeBase,
    index: ChamoIndex,
}

impl ChamoCache {
    pub fn new(cfg: SchemeConfig) -> Result<Self, ConfigError> {
        if cfg.num_ways != 1 || cfg.granularity != 64 {
            return Err(ConfigError::Invalid(
                "CHAMO models one line per set at 64 B granularity".to_string(),
            ));
        }
        let nr_dram_cache = cfg.cache_size / 64;
        let nr_cxl_cache = cfg.ext_size / 64;
        if nr_cxl_cache % nr_dram_cache != 0 || nr_cxl_cache / nr_dram_cache < 2 {
            return Err(ConfigError::Invalid(format!(
                "external size must be a >= 2x multiple of the near memory \
                 (near {nr_dram_cache} lines, external {nr_cxl_cache} lines)"
            )));
        }

        let m = &cfg.mcdram;
        let index = match m.index_scheme {
            ChamoIndexKind::Rank => ChamoIndex::Rank(RankIndex::new(nr_dram_cache, nr_cxl_cache)),
            kind => {
                if m.bucket_assoc != 1 {
                    return Err(ConfigError::Invalid(
                        "CHAMO's one-way sets need bucket_assoc = 1".to_string(),
                    ));
                }
                let nr_set_per_unit = m.page_size / 64;
                if nr_dram_cache % nr_set_per_unit != 0 {
                    return Err(ConfigError::Invalid(format!(
                        "near memory ({nr_dram_cache} lines) must split into \
                         whole mapping units of {nr_set_per_unit} sets"
                    )));
                }
                let nr_units = nr_dram_cache / nr_set_per_unit;
                let mut units = Vec::with_capacity(nr_units as usize);
                for unit in 0..nr_units {
                    let hasher = match kind {
                        ChamoIndexKind::Cuckoo => CuckooHasher::Default,
                        ChamoIndexKind::BitMix => CuckooHasher::BitMix(BitMixHasher::new(
                            nr_set_per_unit,
                            nr_units.max(1),
                        )),
                        ChamoIndexKind::Shuffle => CuckooHasher::Shuffle(ShuffleHasher::new(
                            nr_set_per_unit,
                            m.nr_shuffle_entry.min(nr_set_per_unit),
                            m.shuffle_seed,
                        )),
                        ChamoIndexKind::Rank => unreachable!(),
                    };
                    units.push(CuckooIndex::new(
                        unit * nr_set_per_unit,
                        m.page_size,
                        64,
                        nr_set_per_unit,
                        m.hash_assoc,
                        1,
                        m.target_load_ratio,
                        hasher,
                    ));
                }
                ChamoIndex::Cuckoo {
                    units,
                    nr_set_per_unit,
                    nr_dram_cache,
                }
            }
        };

        Ok(Self {
            base: SchemeBase::new(cfg),
            index,
        })
    }

    fn map(&mut self, address: u64) -> u64 {
        match &mut self.index {
            ChamoIndex::Rank(rank) => rank.index(address),
            ChamoIndex::Cuckoo {
                units,
                nr_set_per_unit,
                nr_dram_cache,
            } => {
                let unit = (address % *nr_dram_cache) / *nr_set_per_unit;
                units[unit as usize].get_target_set_idx(address, unit)
            }
        }
    }

    /// Drop every mapping under a huge page; the OS model calls this when
    /// it unmaps one. The page's lines spread across every mapping unit.
    pub fn remove_page(&mut self, hp_addr: u64) {
        if let ChamoIndex::Cuckoo { units, .. } = &mut self.index {
            for (unit_idx, unit) in units.iter_mut().enumerate() {
                unit.remove_entry(hp_addr, unit_idx as u64);
            }
        }
    }
}

impl CacheScheme for ChamoCache {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        let address = req.line_addr % (self.base.cfg.ext_size / 64);
        let is_load = req.kind() == AccessKind::Load;
        let mc_address = self.map(address);
        let set_num = mc_address;
        let tag = address;
        debug_assert!(mc_address < self.base.cfg.cache_size / 64);

        let base = &mut self.base;
        let way0 = base.tags.way(set_num, 0);
        let hit = way0.valid && way0.tag == tag;
        let data_ready_cycle;

        // Near memory always serves the first access: a read probes, a
        // write lands in place.
        let op = if is_load { CoherenceOp::GetShared } else { CoherenceOp::PutExclusive };
        let mut near = req.derived(mc_address, op);
        req.cycle = mem.mcdram[0].access(&mut near, RecordKind::NewRecord, 4);
        base.mc_bw_per_step += 4;

        if hit {
            base.hits_per_step += 1;
            if is_load {
                base.stats.load_hit += 1;
            } else {
                base.stats.store_hit += 1;
                base.tags.way_mut(set_num, 0).dirty = true;
            }
            data_ready_cycle = req.cycle;
        } else {
            base.misses_per_step += 1;
            if is_load {
                base.stats.load_miss += 1;
                let mut fetch = req.derived(address, CoherenceOp::GetShared);
                data_ready_cycle = mem.ext.access(&mut fetch, RecordKind::CriticalPath, 4);
                base.ext_bw_per_step += 4;
            } else {
                base.stats.store_miss += 1;
                data_ready_cycle = req.cycle;
            }

            let victim = base.tags.way(set_num, 0);
            if victim.valid {
                if victim.dirty {
                    base.stats.dirty_evict += 1;
                    let mut wb = req.derived(victim.tag, CoherenceOp::PutExclusive);
                    mem.ext.access(&mut wb, RecordKind::SideChain, 4);
                    base.ext_bw_per_step += 4;
                } else {
                    base.stats.clean_evict += 1;
                }
            }

            let entry = base.tags.way_mut(set_num, 0);
            entry.tag = tag;
            entry.valid = true;
            entry.dirty = !is_load;
        }

        data_ready_cycle
    }

    fn period(&mut self, req: &MemRequest, mem: &mut MemoryTiers) {
        self.base.decay_step_counters();
        self.base.rebalance(req, mem);
        if let ChamoIndex::Rank(rank) = &mut self.index {
            rank.reset_period_metrics();
        }
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new("chamoCache");
        self.base.stats.append_to(&mut group);
        match &self.index {
            ChamoIndex::Rank(rank) => {
                group.add("touchedLines", rank.metrics.nr_touched);
                group.add("cuckooMapped", rank.metrics.nr_cuckoo);
                group.add("mapLimit", rank.nr_map_limit);
            }
            ChamoIndex::Cuckoo { units, .. } => {
                let mut cuckoo_map = 0;
                let mut direct_map = 0;
                let mut kick_out = 0;
                let mut path_len = 0;
                for unit in units {
                    cuckoo_map += unit.metrics.nr_cuckoo_map;
                    direct_map += unit.metrics.nr_direct_map;
                    kick_out += unit.metrics.nr_kick_out;
                    path_len += unit.metrics.cum_cuckoo_path_len;
                }
                group.add("cuckooMapped", cuckoo_map);
                group.add("directMapped", direct_map);
                group.add("kickOuts", kick_out);
                group.add("cumCuckooPathLen", path_len);
            }
        }
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::Chamo
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}
