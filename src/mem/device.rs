use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::info;

use crate::config::ConfigError;
use crate::mem::backend::MemBackend;
use crate::mem::request::{CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

/// Completion callback registered with the device library; the library
/// reports the transaction address when its data is on the bus.
pub type CompletionFn = Box<dyn FnMut(u64) + Send>;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceGeometry {
    pub channels: u64,
    pub ranks: u64,
    pub bankgroups: u64,
    pub banks: u64,
    pub rows: u64,
    pub columns: u64,
    pub ch_mask: u64,
    pub ra_mask: u64,
    pub bg_mask: u64,
    pub ba_mask: u64,
    pub ro_mask: u64,
    pub co_mask: u64,
    pub ch_pos: u64,
    pub ra_pos: u64,
    pub bg_pos: u64,
    pub ba_pos: u64,
    pub ro_pos: u64,
    pub co_pos: u64,
}

/// Interface of the external cycle-accurate DRAM device library. A linked
/// build provides a concrete implementation behind `new_memory_system`;
/// this crate only depends on the surface.
pub trait DeviceLib: Send {
    fn register_callbacks(&mut self, read_cb: CompletionFn, write_cb: CompletionFn);
    fn clock_tick(&mut self);
    fn will_accept_transaction(&self, addr: u64, is_write: bool) -> bool;
    fn add_transaction(&mut self, addr: u64, is_write: bool) -> bool;
    fn print_stats(&self);
    fn reset_stats(&mut self);
    fn tck(&self) -> f64;
    fn cl(&self) -> u64;
    fn burst_length(&self) -> u64;
    fn queue_size(&self) -> u64;
    fn geometry(&self) -> DeviceGeometry;
}

/// Factory mirroring the library's entry point. The stock build carries no
/// device library, so this is a linkage error at init; embedders link a
/// real implementation and swap this symbol's body.
pub fn new_memory_system(
    _config_ini: &str,
    _output_dir: &str,
    _prefix: &str,
) -> Result<Box<dyn DeviceLib>, ConfigError> {
    Err(ConfigError::DeviceMissing)
}

/// Linkage probe for build systems that cannot check non-C symbols.
#[no_mangle]
pub extern "C" fn lib_present() {}

#[derive(Debug, Clone, Copy)]
struct InflightAccess {
    start_sys_cycle: Cycle,
    write: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct DeviceStats {
    reads: u64,
    writes: u64,
    total_rd_lat: u64,
    total_wr_lat: u64,
    rejected: u64,
}

/// Thin shim in front of a `DeviceLib`: bound-phase `access` answers with
/// the minimum latency and hands the transaction to the device; weave-phase
/// `tick` advances the device clock across the frequency boundary and
/// drains its completion callbacks.
pub struct DeviceMemory {
    name: String,
    core: Box<dyn DeviceLib>,
    completed: Arc<Mutex<VecDeque<u64>>>,
    inflight: HashMap<u64, VecDeque<InflightAccess>>,
    retry: VecDeque<(u64, bool)>,
    min_rd_latency: Cycle,
    min_wr_latency: Cycle,
    line_bits: u32,
    device_ps_per_clk: u64,
    cpu_ps_per_clk: u64,
    device_ps: u64,
    cpu_ps: u64,
    last_sys_cycle: Cycle,
    stats: DeviceStats,
}

impl DeviceMemory {
    pub fn new(
        mut core: Box<dyn DeviceLib>,
        cpu_freq_mhz: u32,
        controller_sys_latency: u32,
        line_bits: u32,
        name: &str,
    ) -> Result<Self, ConfigError> {
        let completed: Arc<Mutex<VecDeque<u64>>> = Arc::new(Mutex::new(VecDeque::new()));
        // Reads and writes complete through the same path.
        let read_done = completed.clone();
        let write_done = completed.clone();
        core.register_callbacks(
            Box::new(move |addr| read_done.lock().unwrap().push_back(addr)),
            Box::new(move |addr| write_done.lock().unwrap().push_back(addr)),
        );

        let device_ps_per_clk = (core.tck() * 1000.0) as u64;
        let cpu_ps_per_clk = 1_000_000 / cpu_freq_mhz as u64;
        if cpu_ps_per_clk >= device_ps_per_clk {
            return Err(ConfigError::FrequencyRatio {
                mem_khz: 1_000_000_000 / device_ps_per_clk,
                sys_khz: 1000 * cpu_freq_mhz as u64,
            });
        }
        let geom = core.geometry();
        info!(
            "{name}: device channels={} ranks={} bankgroups={} banks={} rows={} columns={}",
            geom.channels, geom.ranks, geom.bankgroups, geom.banks, geom.rows, geom.columns
        );
        let min_rd_latency = controller_sys_latency as Cycle + core.cl();

        Ok(Self {
            name: name.to_string(),
            core,
            completed,
            inflight: HashMap::new(),
            retry: VecDeque::new(),
            min_rd_latency,
            min_wr_latency: controller_sys_latency as Cycle,
            line_bits,
            device_ps_per_clk,
            cpu_ps_per_clk,
            device_ps: 0,
            cpu_ps: 0,
            last_sys_cycle: 0,
            stats: DeviceStats::default(),
        })
    }

    fn submit(&mut self, addr: u64, is_write: bool) {
        if self.core.will_accept_transaction(addr, is_write)
            && self.core.add_transaction(addr, is_write)
        {
            return;
        }
        self.stats.rejected += 1;
        self.retry.push_back((addr, is_write));
    }

    fn drain_completions(&mut self, sys_cycle: Cycle) {
        loop {
            let addr = {
                let mut q = self.completed.lock().unwrap();
                match q.pop_front() {
                    Some(a) => a,
                    None => break,
                }
            };
            if let Some(list) = self.inflight.get_mut(&addr) {
                if let Some(acc) = list.pop_front() {
                    let lat = sys_cycle.saturating_sub(acc.start_sys_cycle);
                    if acc.write {
                        self.stats.total_wr_lat += lat;
                    } else {
                        self.stats.total_rd_lat += lat;
                    }
                }
                if list.is_empty() {
                    self.inflight.remove(&addr);
                }
            }
        }
    }
}

impl MemBackend for DeviceMemory {
    fn access(&mut self, req: &mut MemRequest, _record: RecordKind, bursts: u32) -> Cycle {
        req.apply_mesi();
        if req.op == CoherenceOp::PutShared {
            return req.cycle;
        }
        let is_write = req.op == CoherenceOp::PutExclusive;
        let min_latency = if is_write { self.min_wr_latency } else { self.min_rd_latency };
        let resp_cycle = req.cycle + min_latency.max(bursts as Cycle);

        let addr = req.line_addr << self.line_bits;
        self.inflight.entry(addr).or_default().push_back(InflightAccess {
            start_sys_cycle: req.cycle,
            write: is_write,
        });
        self.submit(addr, is_write);
        if is_write {
            self.stats.writes += 1;
        } else {
            self.stats.reads += 1;
        }
        resp_cycle
    }

    fn tick(&mut self, sys_cycle: Cycle) -> Option<Cycle> {
        debug_assert!(sys_cycle >= self.last_sys_cycle);
        self.cpu_ps += (sys_cycle - self.last_sys_cycle) * self.cpu_ps_per_clk;
        self.last_sys_cycle = sys_cycle;
        while self.device_ps < self.cpu_ps {
            self.core.clock_tick();
            self.device_ps += self.device_ps_per_clk;
        }
        while let Some(&(addr, is_write)) = self.retry.front() {
            if !self.core.will_accept_transaction(addr, is_write)
                || !self.core.add_transaction(addr, is_write)
            {
                break;
            }
            self.retry.pop_front();
        }
        self.drain_completions(sys_cycle);
        if self.inflight.is_empty() && self.retry.is_empty() {
            None
        } else {
            Some(sys_cycle + 1)
        }
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new(&self.name);
        group.add("rd", self.stats.reads);
        group.add("wr", self.stats.writes);
        group.add("rdlat", self.stats.total_rd_lat);
        group.add("wrlat", self.stats.total_wr_lat);
        group.add("rejected", self.stats.rejected);
        parent.push_group(group);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Fixed-latency device double standing in for the linked library.
    pub struct FixedLatencyDevice {
        read_cb: Option<CompletionFn>,
        write_cb: Option<CompletionFn>,
        queue: VecDeque<(u64, bool, u64)>,
        latency_clks: u64,
        clock: u64,
        capacity: usize,
    }

    impl FixedLatencyDevice {
        pub fn new(latency_clks: u64, capacity: usize) -> Self {
            Self {
                read_cb: None,
                write_cb: None,
                queue: VecDeque::new(),
                latency_clks,
                clock: 0,
                capacity,
            }
        }
    }

    impl DeviceLib for FixedLatencyDevice {
        fn register_callbacks(&mut self, read_cb: CompletionFn, write_cb: CompletionFn) {
            self.read_cb = Some(read_cb);
            self.write_cb = Some(write_cb);
        }

        fn clock_tick(&mut self) {
            self.clock += 1;
            while let Some(&(addr, is_write, due)) = self.queue.front() {
                if due > self.clock {
                    break;
                }
                self.queue.pop_front();
                let cb = if is_write { &mut self.write_cb } else { &mut self.read_cb };
                if let Some(cb) = cb {
                    cb(addr);
                }
            }
        }

        fn will_accept_transaction(&self, _addr: u64, _is_write: bool) -> bool {
            self.queue.len() < self.capacity
        }

        fn add_transaction(&mut self, addr: u64, is_write: bool) -> bool {
            if self.queue.len() >= self.capacity {
                return false;
            }
            self.queue.push_back((addr, is_write, self.clock + self.latency_clks));
            true
        }

        fn print_stats(&self) {}
        fn reset_stats(&mut self) {}

        fn tck(&self) -> f64 {
            1.25
        }

        fn cl(&self) -> u64 {
            14
        }

        fn burst_length(&self) -> u64 {
            8
        }

        fn queue_size(&self) -> u64 {
            self.capacity as u64
        }

        fn geometry(&self) -> DeviceGeometry {
            DeviceGeometry {
                channels: 1,
                ranks: 2,
                bankgroups: 4,
                banks: 4,
                rows: 32768,
                columns: 1024,
                ..DeviceGeometry::default()
            }
        }
    }
}
