use std::collections::VecDeque;

use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::{CacheScheme, SchemeBase, SchemeConfig};
use crate::config::{ConfigError, SchemeKind};
use crate::mem::backend::MemoryTiers;
use crate::mem::request::{AccessKind, CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

/// Address bits after dropping the 6-bit line offset.
const MAX_ADDR_BITS: u32 = 58;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DramAddress {
    pub channel: u32,
    pub rank: u32,
    pub bankgroup: u32,
    pub bank: u32,
    pub row: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct VictimEntry {
    pub address: u64,
    pub set: u64,
    pub way: u64,
}

/// Bounded FIFO of deferred dirty writebacks with slot reservation, so an
/// eviction can claim space before it commits to deferring.
pub struct VictimBuffer {
    entries: VecDeque<VictimEntry>,
    size: usize,
    reserved: usize,
}

impl VictimBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(size),
            size,
            reserved: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reserve_slot(&mut self) -> bool {
        if self.entries.len() + self.reserved >= self.size {
            return false;
        }
        self.reserved += 1;
        true
    }

    pub fn release_slot(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    pub fn add_entry(&mut self, address: u64, set: u64, way: u64) -> bool {
        if self.entries.len() >= self.size {
            return false;
        }
        self.entries.push_back(VictimEntry { address, set, way });
        self.reserved = self.reserved.saturating_sub(1);
        true
    }

    pub fn get_entry(&mut self) -> Option<VictimEntry> {
        self.entries.pop_front()
    }
}

/// In-subarray tag-match cache: index and tag share the row bits, so one
/// activation delivers both; a hit pays the subarray compare (tPCD + tCOMP)
/// on top of the column access.
pub struct NdcCache {
    base: SchemeBase,
    ch_pos: u32,
    ra_pos: u32,
    bg_pos: u32,
    ba_pos: u32,
    ro_pos: u32,
    co_pos: u32,
    ch_mask: u64,
    ra_mask: u64,
    bg_mask: u64,
    ba_mask: u64,
    ro_mask: u64,
    co_mask: u64,
    index_mask: u64,
    set_bits: u32,
    num_banks: u64,
    open_rows: Vec<Option<u64>>,
    victim_buffer: VictimBuffer,
    rng: StdRng,
    t_cl: Cycle,
    t_cwl: Cycle,
    t_rcd: Cycle,
    t_rp: Cycle,
    t_pcd: Cycle,
    t_comp: Cycle,
}

impl NdcCache {
    pub fn new(cfg: SchemeConfig) -> Result<Self, ConfigError> {
        if cfg.mcdram_per_mc != 1 {
            return Err(ConfigError::Invalid(
                "NDC uses a single near-memory instance".to_string(),
            ));
        }
        if cfg.granularity != 64 {
            return Err(ConfigError::Invalid(format!(
                "NDC is line-granular; cache_granularity = {}",
                cfg.granularity
            )));
        }
        if !cfg.num_sets.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "NDC needs a power-of-two set count, got {}",
                cfg.num_sets
            )));
        }
        let m = &cfg.mcdram;
        let mut index_mask =
            ((m.index_mask_upper as u64) << 32) | m.index_mask_lower as u64;
        let set_bits = cfg.num_sets.ilog2();
        let bits_set = index_mask.count_ones();
        match bits_set.cmp(&set_bits) {
            std::cmp::Ordering::Less => {
                return Err(ConfigError::IndexMask {
                    got: bits_set,
                    want: set_bits,
                });
            }
            std::cmp::Ordering::Greater => {
                warn!(
                    "index mask has {bits_set} bits set but the cache needs {set_bits}; \
                     keeping the lowest {set_bits}"
                );
                let mut trimmed = 0u64;
                let mut used = 0;
                for bit in 0..64 {
                    if index_mask & (1 << bit) != 0 {
                        trimmed |= 1 << bit;
                        used += 1;
                        if used == set_bits {
                            break;
                        }
                    }
                }
                index_mask = trimmed;
            }
            std::cmp::Ordering::Equal => {}
        }

        let num_banks = m.num_banks.max(1) as u64;
        let victim_buffer = VictimBuffer::new(m.victim_buffer_size as usize);
        let timing = (
            m.t_cl as Cycle,
            m.t_cwl as Cycle,
            m.t_rcd as Cycle,
            m.t_rp as Cycle,
            m.t_pcd as Cycle,
            m.t_comp as Cycle,
        );
        Ok(Self {
            ch_pos: m.ch_pos,
            ra_pos: m.ra_pos,
            bg_pos: m.bg_pos,
            ba_pos: m.ba_pos,
            ro_pos: m.ro_pos,
            co_pos: m.co_pos,
            ch_mask: m.ch_mask as u64,
            ra_mask: m.ra_mask as u64,
            bg_mask: m.bg_mask as u64,
            ba_mask: m.ba_mask as u64,
            ro_mask: m.ro_mask as u64,
            co_mask: m.co_mask as u64,
            index_mask,
            set_bits,
            num_banks,
            open_rows: vec![None; num_banks as usize],
            victim_buffer,
            rng: StdRng::seed_from_u64(0x6e64_63),
            t_cl: timing.0,
            t_cwl: timing.1,
            t_rcd: timing.2,
            t_rp: timing.3,
            t_pcd: timing.4,
            t_comp: timing.5,
            base: SchemeBase::new(cfg),
        })
    }

    pub fn map_address(&self, line_addr: u64) -> DramAddress {
        DramAddress {
            channel: ((line_addr >> self.ch_pos) & self.ch_mask) as u32,
            rank: ((line_addr >> self.ra_pos) & self.ra_mask) as u32,
            bankgroup: ((line_addr >> self.bg_pos) & self.bg_mask) as u32,
            bank: ((line_addr >> self.ba_pos) & self.ba_mask) as u32,
            row: ((line_addr >> self.ro_pos) & self.ro_mask) as u32,
            column: ((line_addr >> self.co_pos) & self.co_mask) as u32,
        }
    }

    /// Compact the bits selected by `mask`, low to high.
    fn gather(addr: u64, mask: u64) -> u64 {
        let mut out = 0u64;
        let mut out_pos = 0;
        for bit in 0..MAX_ADDR_BITS {
            if mask & (1 << bit) != 0 {
                if addr & (1 << bit) != 0 {
                    out |= 1 << out_pos;
                }
                out_pos += 1;
            }
        }
        out
    }

    pub fn set_of_line(&self, line_addr: u64) -> u64 {
        Self::gather(line_addr, self.index_mask) % self.base.cfg.num_sets
    }

    pub fn tag_of_line(&self, line_addr: u64) -> u64 {
        Self::gather(line_addr, !self.index_mask)
    }

    /// Packed cache address: tag in the high bits, set index in the low
    /// `set_bits`. A bijection of the line address.
    pub fn phy_addr_to_cache_addr(&self, line_addr: u64) -> u64 {
        (self.tag_of_line(line_addr) << self.set_bits) | self.set_of_line(line_addr)
    }

    pub fn get_set_num(&self, cache_addr: u64) -> u64 {
        cache_addr & ((1 << self.set_bits) - 1)
    }

    pub fn get_tag(&self, cache_addr: u64) -> u64 {
        cache_addr >> self.set_bits
    }

    /// Inverse of the set/tag gathers: rebuild the line address of a
    /// resident way for writeback.
    fn line_of(&self, set: u64, tag: u64) -> u64 {
        let mut out = 0u64;
        let mut set_pos = 0;
        let mut tag_pos = 0;
        for bit in 0..MAX_ADDR_BITS {
            let selected = if self.index_mask & (1 << bit) != 0 {
                let v = (set >> set_pos) & 1;
                set_pos += 1;
                v
            } else {
                let v = (tag >> tag_pos) & 1;
                tag_pos += 1;
                v
            };
            out |= selected << bit;
        }
        out
    }

    pub fn victim_buffer(&self) -> &VictimBuffer {
        &self.victim_buffer
    }

    /// Invalid first, then a clean way at random, then a dirty way at
    /// random.
    fn select_victim(&mut self, set: u64) -> u64 {
        if let Some(way) = self.base.tags.empty_way(set) {
            return way;
        }
        let clean: Vec<u64> = (0..self.base.cfg.num_ways)
            .filter(|&w| !self.base.tags.way(set, w).dirty)
            .collect();
        if !clean.is_empty() {
            return clean[self.rng.gen_range(0..clean.len())];
        }
        self.rng.gen_range(0..self.base.cfg.num_ways)
    }

    /// Defer a dirty victim into the buffer if a slot can be reserved, else
    /// write it back directly.
    fn evict(
        &mut self,
        req: &MemRequest,
        mem: &mut MemoryTiers,
        set: u64,
        way: u64,
    ) {
        let victim = self.base.tags.way(set, way);
        if !victim.valid {
            return;
        }
        if !victim.dirty {
            self.base.stats.clean_evict += 1;
            return;
        }
        self.base.stats.dirty_evict += 1;
        let victim_addr = self.line_of(set, victim.tag);
        if self.victim_buffer.reserve_slot() {
            self.victim_buffer.add_entry(victim_addr, set, way);
        } else {
            let mut wb = req.derived(victim_addr, CoherenceOp::PutExclusive);
            mem.ext.access(&mut wb, RecordKind::SideChain, 4);
            self.base.ext_bw_per_step += 4;
        }
    }

    fn drain_victim_buffer(&mut self, req: &MemRequest, mem: &mut MemoryTiers) {
        if let Some(entry) = self.victim_buffer.get_entry() {
            let mut wb = req.derived(entry.address, CoherenceOp::PutExclusive);
            mem.ext.access(&mut wb, RecordKind::SideChain, 4);
            self.base.ext_bw_per_step += 4;
        }
    }
}

impl CacheScheme for NdcCache {
    fn access(&mut self, req: &mut MemRequest, mem: &mut MemoryTiers) -> Cycle {
        let address = req.line_addr;
        let index = self.set_of_line(address);
        let tag = self.tag_of_line(address);
        let mut latency: Cycle = 0;

        // Row-buffer state of the home bank; the activation brings tag and
        // data together.
        let bank = (index % self.num_banks) as usize;
        let row_hit = self.open_rows[bank] == Some(index);
        if !row_hit {
            if self.open_rows[bank].is_some() {
                latency += self.t_rp;
            }
            latency += self.t_rcd;
            self.open_rows[bank] = Some(index);
        }
        latency += self.t_pcd + self.t_comp;

        let hit_way = self.base.tags.lookup(index, tag);
        let is_load = req.kind() == AccessKind::Load;

        match hit_way {
            Some(way) => {
                latency += if is_load { self.t_cl } else { self.t_cwl };
                self.base.hits_per_step += 1;
                if is_load {
                    self.base.stats.load_hit += 1;
                } else {
                    self.base.stats.store_hit += 1;
                    self.base.tags.way_mut(index, way).dirty = true;
                }
                self.base.mc_bw_per_step += 4;
            }
            None => {
                self.base.misses_per_step += 1;
                if is_load {
                    self.base.stats.load_miss += 1;
                } else {
                    self.base.stats.store_miss += 1;
                }

                // Fetch the line from the far tier (read-modify-write for
                // store misses).
                let mut fetch = req.derived(address, CoherenceOp::GetShared);
                let resp = mem.ext.access(&mut fetch, RecordKind::CriticalPath, 4);
                latency += resp.saturating_sub(req.cycle);
                self.base.ext_bw_per_step += 4;

                let victim_way = self.select_victim(index);
                self.evict(req, mem, index, victim_way);

                let entry = self.base.tags.way_mut(index, victim_way);
                entry.tag = tag;
                entry.valid = true;
                entry.dirty = !is_load;
                self.base.mc_bw_per_step += 4;
            }
        }

        // Hits leave the external bus idle; use the slack to drain one
        // deferred writeback.
        if hit_way.is_some() && !self.victim_buffer.is_empty() {
            self.drain_victim_buffer(req, mem);
        }

        req.cycle + latency
    }

    fn period(&mut self, req: &MemRequest, mem: &mut MemoryTiers) {
        self.base.decay_step_counters();
        self.base.rebalance(req, mem);
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new("ndc");
        self.base.stats.append_to(&mut group);
        group.add("victimBufferEntries", self.victim_buffer.len() as u64);
        parent.push_group(group);
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::Ndc
    }

    fn base(&self) -> &SchemeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SchemeBase {
        &mut self.base
    }
}
