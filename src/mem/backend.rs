use serde::Serialize;

use crate::mem::request::{CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

/// Timing back-end for one memory tier. `access` is the bound phase: it
/// returns the optimistic response cycle and queues any weave-phase work.
/// `tick` is the weave phase: it advances the device to `sys_cycle` and
/// returns the next cycle at which it wants to be ticked again.
pub trait MemBackend {
    fn access(&mut self, req: &mut MemRequest, record: RecordKind, bursts: u32) -> Cycle;

    fn tick(&mut self, _sys_cycle: Cycle) -> Option<Cycle> {
        None
    }

    fn append_stats(&self, parent: &mut StatGroup);

    fn name(&self) -> &str;
}

/// The controller's back-ends, lent to the cache scheme for the duration of
/// one access. The scheme never owns or stores these.
pub struct MemoryTiers {
    pub ext: Box<dyn MemBackend>,
    pub mcdram: Vec<Box<dyn MemBackend>>,
}

impl MemoryTiers {
    pub fn tick(&mut self, sys_cycle: Cycle) {
        self.ext.tick(sys_cycle);
        for mc in self.mcdram.iter_mut() {
            mc.tick(sys_cycle);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct FlatStats {
    reads: u64,
    writes: u64,
    read_bursts: u64,
    write_bursts: u64,
}

impl FlatStats {
    fn record(&mut self, write: bool, bursts: u32) {
        if write {
            self.writes += 1;
            self.write_bursts += bursts as u64;
        } else {
            self.reads += 1;
            self.read_bursts += bursts as u64;
        }
    }

    fn append_to(&self, group: &mut StatGroup) {
        group.add("rd", self.reads);
        group.add("wr", self.writes);
        group.add("tot_rd", self.read_bursts * 16);
        group.add("tot_wr", self.write_bursts * 16);
    }
}

/// Fixed-latency memory; the zero-contention baseline back-end.
pub struct SimpleMemory {
    name: String,
    latency: Cycle,
    stats: FlatStats,
}

impl SimpleMemory {
    pub fn new(latency: u32, name: &str) -> Self {
        Self {
            name: name.to_string(),
            latency: latency as Cycle,
            stats: FlatStats::default(),
        }
    }
}

impl MemBackend for SimpleMemory {
    fn access(&mut self, req: &mut MemRequest, _record: RecordKind, bursts: u32) -> Cycle {
        req.apply_mesi();
        if req.op == CoherenceOp::PutShared {
            return req.cycle;
        }
        let write = req.op == CoherenceOp::PutExclusive;
        self.stats.record(write, bursts);
        req.cycle + self.latency
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new(&self.name);
        self.stats.append_to(&mut group);
        parent.push_group(group);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// M/D/1 queueing memory: latency grows with utilization of the configured
/// bandwidth, recomputed over fixed windows of system cycles.
pub struct Md1Memory {
    name: String,
    line_size: u32,
    zero_load_latency: Cycle,
    /// Peak lines the device can move per window.
    window_capacity: f64,
    window_cycles: Cycle,
    window_start: Cycle,
    window_accesses: u64,
    cur_latency: Cycle,
    stats: FlatStats,
}

const MD1_WINDOW: Cycle = 10_000;
const MD1_MAX_RHO: f64 = 0.99;

impl Md1Memory {
    pub fn new(
        line_size: u32,
        sys_freq_mhz: u32,
        bandwidth_mbps: u32,
        zero_load_latency: u32,
        name: &str,
    ) -> Self {
        // bytes/cycle = MB/s / (cycles/s) * 1e6
        let bytes_per_cycle = bandwidth_mbps as f64 / (sys_freq_mhz as f64);
        let window_capacity = bytes_per_cycle * MD1_WINDOW as f64 / line_size as f64;
        Self {
            name: name.to_string(),
            line_size,
            zero_load_latency: zero_load_latency as Cycle,
            window_capacity,
            window_cycles: MD1_WINDOW,
            window_start: 0,
            window_accesses: 0,
            cur_latency: zero_load_latency as Cycle,
            stats: FlatStats::default(),
        }
    }

    fn update_latency(&mut self, now: Cycle) {
        if now < self.window_start + self.window_cycles {
            return;
        }
        let rho = (self.window_accesses as f64 / self.window_capacity).min(MD1_MAX_RHO);
        // M/D/1 waiting time: rho / (2 * (1 - rho)) service units on top of
        // the unloaded latency.
        let queueing = rho / (2.0 * (1.0 - rho));
        self.cur_latency =
            self.zero_load_latency + (queueing * self.zero_load_latency as f64) as Cycle;
        self.window_start = now;
        self.window_accesses = 0;
    }
}

impl MemBackend for Md1Memory {
    fn access(&mut self, req: &mut MemRequest, _record: RecordKind, bursts: u32) -> Cycle {
        req.apply_mesi();
        if req.op == CoherenceOp::PutShared {
            return req.cycle;
        }
        let write = req.op == CoherenceOp::PutExclusive;
        // One access per line moved, independent of burst split.
        self.window_accesses += (bursts as u64 * 16).div_ceil(self.line_size as u64).max(1);
        self.update_latency(req.cycle);
        self.stats.record(write, bursts);
        req.cycle + self.cur_latency
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new(&self.name);
        self.stats.append_to(&mut group);
        group.add("lat", self.cur_latency);
        parent.push_group(group);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::request::CoherenceOp;

    #[test]
    fn simple_memory_adds_fixed_latency() {
        let mut mem = SimpleMemory::new(50, "test");
        let mut req = MemRequest::new(0, CoherenceOp::GetShared, 100);
        assert_eq!(mem.access(&mut req, RecordKind::NewRecord, 4), 150);
    }

    #[test]
    fn silent_writeback_returns_input_cycle() {
        use crate::mem::request::MesiState;
        let mut mem = SimpleMemory::new(50, "test");
        let mut req = MemRequest::new(0, CoherenceOp::PutShared, 42);
        assert_eq!(mem.access(&mut req, RecordKind::NewRecord, 4), 42);
        assert_eq!(req.state, MesiState::Invalid);
    }

    #[test]
    fn md1_latency_rises_under_load() {
        let mut mem = Md1Memory::new(64, 2000, 6400, 100, "md1");
        // Saturate one window, then observe the recomputed latency.
        for i in 0..100_000u64 {
            let mut req = MemRequest::new(i, CoherenceOp::GetShared, i / 4);
            mem.access(&mut req, RecordKind::NewRecord, 4);
        }
        let mut req = MemRequest::new(0, CoherenceOp::GetShared, 200_000);
        let resp = mem.access(&mut req, RecordKind::NewRecord, 4);
        assert!(resp - 200_000 > 100, "latency should exceed zero-load");
    }
}
