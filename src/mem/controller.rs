use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::info;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::{build_scheme, CacheScheme};
use crate::config::{BackendKind, ConfigError, PageMapScheme, SchemeKind, StratusConfig};
use crate::mem::backend::{MemBackend, MemoryTiers, Md1Memory, SimpleMemory};
use crate::mem::ddr::DdrMemory;
use crate::mem::device::{new_memory_system, DeviceMemory};
use crate::mem::request::{CoherenceOp, MemRequest};
use crate::mem::SimContext;
use crate::stats::StatGroup;
use crate::trace::TraceCollector;
use crate::Cycle;

/// Virtual-to-physical line mapping in front of the cache scheme. Johnny
/// hands out physical granules in order; Random draws them from a
/// per-controller deterministic PRNG.
struct PageMapper {
    scheme: PageMapScheme,
    lines_per_granule: u64,
    total_granules: u64,
    total_lines: u64,
    table: HashMap<u64, u64>,
    assigned: HashSet<u64>,
    johnny_ptr: u64,
    rng: StdRng,
}

impl PageMapper {
    fn new(scheme: PageMapScheme, ext_size: u64, map_granu: u64, controller_index: u32) -> Self {
        let lines_per_granule = (map_granu / 64).max(1);
        let total_lines = ext_size / 64;
        Self {
            scheme,
            lines_per_granule,
            total_granules: (total_lines / lines_per_granule).max(1),
            total_lines,
            table: HashMap::new(),
            assigned: HashSet::new(),
            johnny_ptr: 0,
            rng: StdRng::seed_from_u64(0x70616765 ^ controller_index as u64),
        }
    }

    fn map(&mut self, v_line_addr: u64) -> u64 {
        match self.scheme {
            PageMapScheme::Identical => v_line_addr % self.total_lines,
            PageMapScheme::Johnny | PageMapScheme::Random => {
                let v_page = v_line_addr / self.lines_per_granule;
                let offset = v_line_addr % self.lines_per_granule;
                let p_page = match self.table.get(&v_page) {
                    Some(&p) => p,
                    None => {
                        let p = self.assign(v_page);
                        self.table.insert(v_page, p);
                        self.assigned.insert(p);
                        p
                    }
                };
                p_page * self.lines_per_granule + offset
            }
        }
    }

    fn assign(&mut self, _v_page: u64) -> u64 {
        match self.scheme {
            PageMapScheme::Johnny => {
                // Next free granule in allocation order, wrapping at the
                // external capacity; reuse in order once exhausted.
                let mut p = self.johnny_ptr;
                if (self.assigned.len() as u64) < self.total_granules {
                    while self.assigned.contains(&p) {
                        p = (p + 1) % self.total_granules;
                    }
                }
                self.johnny_ptr = (p + 1) % self.total_granules;
                p
            }
            PageMapScheme::Random => {
                if self.assigned.len() as u64 >= self.total_granules {
                    // Address space exhausted; reuse uniformly.
                    return self.rng.gen_range(0..self.total_granules);
                }
                loop {
                    let p = self.rng.gen_range(0..self.total_granules);
                    if !self.assigned.contains(&p) {
                        return p;
                    }
                }
            }
            PageMapScheme::Identical => unreachable!(),
        }
    }
}

struct ControllerInner {
    scheme: Box<dyn CacheScheme>,
    mem: MemoryTiers,
    page_map: PageMapper,
    tracer: Option<TraceCollector>,
    num_requests: u64,
}

/// One memory controller: translates addresses, drives its cache scheme,
/// owns the per-tier back-ends, and optionally records its access stream.
pub struct MemoryController {
    name: String,
    scheme_kind: SchemeKind,
    step_length: u64,
    inner: Mutex<ControllerInner>,
}

/// Build a DDR timing back-end from the parameter set under one prefix.
pub fn build_ddr_memory(
    ctx: &SimContext,
    params: &crate::config::DdrParams,
    name: &str,
    t_bl: u32,
    timing_scale: f64,
) -> Result<DdrMemory, ConfigError> {
    DdrMemory::new(ctx.line_size, ctx.sys_freq_mhz, params, name, t_bl, timing_scale)
}

fn build_backend(
    kind: BackendKind,
    ctx: &SimContext,
    cfg: &StratusConfig,
    name: &str,
    is_ext: bool,
    timing_scale: f64,
) -> Result<Box<dyn MemBackend>, ConfigError> {
    Ok(match kind {
        BackendKind::Simple => {
            let latency = if is_ext { cfg.mem.ext_dram.latency } else { cfg.mem.mcdram.latency };
            Box::new(SimpleMemory::new(latency, name))
        }
        BackendKind::Md1 => {
            let (latency, bandwidth) = if is_ext {
                (cfg.mem.ext_dram.latency, cfg.mem.ext_dram.bandwidth)
            } else {
                (cfg.mem.mcdram.latency, cfg.mem.mcdram.bandwidth)
            };
            Box::new(Md1Memory::new(
                ctx.line_size,
                ctx.sys_freq_mhz,
                bandwidth,
                latency,
                name,
            ))
        }
        BackendKind::Ddr => {
            let params = if is_ext { &cfg.mem.ext_dram.ddr } else { &cfg.mem.mcdram.ddr };
            let scale = if is_ext { 1.0 } else { timing_scale };
            Box::new(build_ddr_memory(ctx, params, name, 4, scale)?)
        }
        BackendKind::Device => {
            let ext = &cfg.mem.ext_dram;
            let core = new_memory_system(&ext.config_ini, &ext.output_dir, name)?;
            let line_bits = ctx.line_size.ilog2();
            Box::new(DeviceMemory::new(
                core,
                ctx.sys_freq_mhz,
                ext.ddr.controller_latency,
                line_bits,
                name,
            )?)
        }
    })
}

impl MemoryController {
    pub fn new(
        name: &str,
        index: u32,
        cfg: &StratusConfig,
        ctx: &SimContext,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let scheme_kind = cfg.mem.cache_scheme;
        let timing_scale = cfg.mem.dram_timing_scale;

        // Trace collection happens on the first controller only.
        let tracer = if cfg.mem.enable_trace && name == "mem-0" {
            Some(TraceCollector::new(Path::new(&cfg.mem.trace_dir), name)?)
        } else {
            None
        };

        let ext_name = format!("{name}-ext");
        let ext = build_backend(
            cfg.mem.ext_dram.backend,
            ctx,
            cfg,
            &ext_name,
            true,
            timing_scale,
        )?;

        // A NoCache controller skips near-memory allocation entirely.
        let mcdram = if scheme_kind == SchemeKind::NoCache {
            Vec::new()
        } else {
            let mut backends: Vec<Box<dyn MemBackend>> = Vec::new();
            for i in 0..cfg.mem.mcdram.mcdram_per_mc {
                let mc_name = format!("{name}-mc-{i}");
                backends.push(build_backend(
                    cfg.mem.mcdram.backend,
                    ctx,
                    cfg,
                    &mc_name,
                    false,
                    timing_scale,
                )?);
            }
            backends
        };

        let scheme = build_scheme(cfg)?;
        let cache_size = cfg.mem.mcdram.size * 1024 * 1024;
        let step_length = (cache_size / 64 / 10).max(1);
        info!("{name}: cache_size = {cache_size}, step_length = {step_length}");

        let map_granu = if cfg.mem.map_granu != 0 { cfg.mem.map_granu } else { cfg.mem.page_size };
        let page_map = PageMapper::new(
            cfg.mem.pagemap_scheme,
            cfg.mem.ext_dram.size * 1024 * 1024,
            map_granu,
            index,
        );

        Ok(Self {
            name: name.to_string(),
            scheme_kind,
            step_length,
            inner: Mutex::new(ControllerInner {
                scheme,
                mem: MemoryTiers { ext, mcdram },
                page_map,
                tracer,
                num_requests: 0,
            }),
        })
    }

    /// Bound-phase entry point; serialized per controller, so concurrent
    /// callers into different controllers never contend.
    pub fn access(&self, req: &mut MemRequest) -> Cycle {
        req.apply_mesi();
        // Clean writebacks are silent: state already updated, no timing.
        if req.op == CoherenceOp::PutShared {
            return req.cycle;
        }

        let entry_cycle = req.cycle;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        if let Some(tracer) = inner.tracer.as_mut() {
            tracer.record(req);
        }

        inner.num_requests += 1;
        let v_line_addr = req.line_addr;
        req.line_addr = inner.page_map.map(v_line_addr);
        let result = inner.scheme.access(req, &mut inner.mem);
        req.line_addr = v_line_addr;

        if inner.num_requests % self.step_length == 0 {
            inner.scheme.period(req, &mut inner.mem);
        }

        debug_assert!(result >= entry_cycle);
        result
    }

    /// Weave-phase hook: advance every back-end to `sys_cycle`.
    pub fn tick(&self, sys_cycle: Cycle) {
        let mut inner = self.inner.lock();
        inner.mem.tick(sys_cycle);
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn scheme_kind(&self) -> SchemeKind {
        self.scheme_kind
    }

    pub fn num_requests(&self) -> u64 {
        self.inner.lock().num_requests
    }

    pub fn init_stats(&self, parent: &mut StatGroup) {
        let inner = self.inner.lock();
        let mut group = StatGroup::new(&self.name);
        inner.scheme.append_stats(&mut group);
        inner.mem.ext.append_stats(&mut group);
        for mc in &inner.mem.mcdram {
            mc.append_stats(&mut group);
        }
        parent.push_group(group);
    }

    /// Run a closure against the scheme; test and driver hook.
    pub fn with_scheme<R>(&self, f: impl FnOnce(&mut dyn CacheScheme, &mut MemoryTiers) -> R) -> R {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        f(inner.scheme.as_mut(), &mut inner.mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_mapping_wraps_at_capacity() {
        let mut mapper = PageMapper::new(PageMapScheme::Identical, 1 << 20, 4096, 0);
        let total_lines = (1u64 << 20) / 64;
        assert_eq!(mapper.map(5), 5);
        assert_eq!(mapper.map(total_lines + 5), 5);
    }

    #[test]
    fn johnny_assigns_granules_in_order() {
        let mut mapper = PageMapper::new(PageMapScheme::Johnny, 1 << 20, 4096, 0);
        let lines = 4096 / 64;
        // Virtual pages 7 and 3 get physical granules 0 and 1 in first-use
        // order.
        assert_eq!(mapper.map(7 * lines), 0);
        assert_eq!(mapper.map(3 * lines), lines);
        assert_eq!(mapper.map(7 * lines + 1), 1);
    }

    #[test]
    fn random_mapping_is_stable_and_deterministic() {
        let mut a = PageMapper::new(PageMapScheme::Random, 1 << 20, 4096, 3);
        let mut b = PageMapper::new(PageMapScheme::Random, 1 << 20, 4096, 3);
        for v in 0..64u64 {
            let pa = a.map(v * 64);
            assert_eq!(pa, a.map(v * 64), "mapping must persist");
            assert_eq!(pa, b.map(v * 64), "same seed, same mapping");
        }
    }

    #[test]
    fn random_mapping_avoids_collisions() {
        let mut mapper = PageMapper::new(PageMapScheme::Random, 1 << 18, 4096, 1);
        let lines = 4096 / 64;
        let granules = (1u64 << 18) / 4096;
        let mut seen = std::collections::HashSet::new();
        for v in 0..granules {
            let p = mapper.map(v * lines) / lines;
            assert!(seen.insert(p), "granule {p} assigned twice");
        }
    }
}
