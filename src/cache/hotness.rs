use std::collections::HashMap;

use log::info;

use crate::cache::{CacheScheme, SchemeBase, SchemeConfig};
use crate::config::{ConfigError, SchemeKind};
use crate::mem::backend::MemoryTiers;
use crate::mem::request::{AccessKind, CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

#[derive(Debug, Default, Clone, Copy)]
struct PageEntry {
    tag: u64,
    frequency: u32,
    valid: bool,
    dirty: bool,
}

/// Accesses between frequency decays.
const MIGRATION_PERIOD: u64 = 10_000;

/// Page-granular frequency cache: hits bump a saturating per-page counter,
/// misses evict the coldest page wholesale, and all counters halve every
/// migration period so old heat drains away.
pub struct IdealHotness {
    base: SchemeBase,
    page_table: Vec<PageEntry>,
    page_location: HashMap<u64, u64>,
    num_pages: u64,
    lines_per_page: u64,
    period_counter: u64,
}

impl IdealHotness {
    pub fn new(cfg: SchemeConfig) -> Result<Self, ConfigError> {
        let page_size = cfg.mcdram.page_size;
        if cfg.cache_size % page_size != 0 {
            return Err(ConfigError::CacheNotPageMultiple {
                cache: cfg.cache_size,
                page: page_size,
            });
        }
        let num_pages = cfg.cache_size / page_size;
        let lines_per_page = page_size / cfg.granularity;
        info!(
            "IdealHotness: {num_pages} pages of {page_size} bytes, {lines_per_page} lines per page"
        );
        Ok(Self {
            page_table: vec![PageEntry::default(); num_pages as usize],
            base: SchemeBase::new(cfg),
            page_location: HashMap::new(),
            num_pages,
            lines_per_page,
            period_counter: 0,
        })
    }

    fn find_victim(&self) -> u64 {
        for (idx, entry) in self.page_table.iter().enumerate() {
            if !entry.valid {
                return idx as u64;
            }
        }
        let mut victim = 0;
        let mut min_freq = u32::MAX;
        for (idx, entry) in self.page_table.iter().enumerate() {
            if entry.frequency < min_freq {
                min_freq = entry.frequency;
                victim = idx as u64;
            }
        }
        victim
    }

    fn decay_frequencies(&mut self) {
        for entry in self.page_table.iter_mut() {
            entry.frequency >>= 1;
        }
    }

    pub fn frequency_of(&self, page_number: u64) -> Option<u32> {
        self.page_location
            .get(&page_number)
            .map(|&idx| self.page_table[idx as usize].frequency)
    }
}

impl CacheScheme for IdealHotness {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        let page_number = req.line_addr / self.lines_per_page;
        let is_store = req.kind() == AccessKind::Store;
        let mut data_ready_cycle = req.cycle;

        match self.page_location.get(&page_number) {
            Some(&page_index) => {
                let entry = &mut self.page_table[page_index as usize];
                entry.frequency = entry.frequency.saturating_add(1);
                if is_store {
                    entry.dirty = true;
                    self.base.stats.store_hit += 1;
                } else {
                    self.base.stats.load_hit += 1;
                }
                self.base.hits_per_step += 1;
            }
            None => {
                if is_store {
                    self.base.stats.store_miss += 1;
                } else {
                    self.base.stats.load_miss += 1;
                }
                self.base.misses_per_step += 1;

                let victim_index = self.find_victim();
                let victim = self.page_table[victim_index as usize];
                if victim.valid {
                    if victim.dirty {
                        self.base.stats.dirty_evict += 1;
                        // The whole page goes back line by line.
                        for i in 0..self.lines_per_page {
                            let addr = victim.tag * self.lines_per_page + i;
                            let mut wb = req.derived(addr, CoherenceOp::PutExclusive);
                            wb.cycle = data_ready_cycle;
                            data_ready_cycle =
                                mem.ext.access(&mut wb, RecordKind::SideChain, 4);
                            self.base.ext_bw_per_step += 4;
                        }
                    } else {
                        self.base.stats.clean_evict += 1;
                    }
                    self.page_location.remove(&victim.tag);
                }

                for i in 0..self.lines_per_page {
                    let addr = page_number * self.lines_per_page + i;
                    let mut load = req.derived(addr, CoherenceOp::GetShared);
                    load.cycle = data_ready_cycle;
                    data_ready_cycle = mem.ext.access(&mut load, RecordKind::CriticalPath, 4);
                    self.base.ext_bw_per_step += 4;
                }

                let entry = &mut self.page_table[victim_index as usize];
                entry.valid = true;
                entry.dirty = is_store;
                entry.tag = page_number;
                entry.frequency = 1;
                self.page_location.insert(page_number, victim_index);
                self.base.stats.placement += 1;
            }
        }

        self.period_counter += 1;
        if self.period_counter >= MIGRATION_PERIOD {
            self.decay_frequencies();
            self.period_counter = 0;
        }

        data_ready_cycle
    }

    fn period(&mut self, req: &MemRequest, mem: &mut MemoryTiers) {
        self.base.decay_step_counters();
        self.base.rebalance(req, mem);
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new("idealHotnessCache");
        self.base.stats.append_to(&mut group);
        group.add("residentPages", self.page_location.len() as u64);
        group.add("totalPages", self.num_pages);
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::IdealHotness
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}
