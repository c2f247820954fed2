#[cfg(test)]
mod chamo_tests;
#[cfg(test)]
mod hotness_tests;
#[cfg(test)]
mod ndc_tests;
#[cfg(test)]
mod unison_tests;

use crate::cache::SchemeConfig;
use crate::config::McdramConfig;
use crate::mem::backend::{MemoryTiers, SimpleMemory};
use crate::mem::request::{CoherenceOp, MemRequest};

/// Scheme configuration in raw bytes, bypassing the MB-granular config
/// surface so tests can build tiny caches.
pub(crate) fn cfg_raw(
    granularity: u64,
    num_ways: u64,
    cache_size: u64,
    ext_size: u64,
) -> SchemeConfig {
    let mut mcdram = McdramConfig::default();
    mcdram.cache_granularity = granularity;
    mcdram.num_ways = num_ways;
    mcdram.mcdram_per_mc = 1;
    SchemeConfig {
        granularity,
        num_ways,
        cache_size,
        num_sets: cache_size / num_ways / granularity,
        ext_size,
        sram_tag: false,
        llc_latency: 30,
        bw_balance: false,
        mcdram_per_mc: 1,
        mcdram,
    }
}

/// One fixed-latency back-end per tier; near memory is faster than far.
pub(crate) fn simple_tiers(mcdram_count: usize) -> MemoryTiers {
    let mcdram = (0..mcdram_count)
        .map(|i| {
            Box::new(SimpleMemory::new(50, &format!("mc-{i}")))
                as Box<dyn crate::mem::backend::MemBackend>
        })
        .collect();
    MemoryTiers {
        ext: Box::new(SimpleMemory::new(100, "ext")),
        mcdram,
    }
}

pub(crate) fn load(line_addr: u64, cycle: u64) -> MemRequest {
    MemRequest::new(line_addr, CoherenceOp::GetShared, cycle)
}

pub(crate) fn store(line_addr: u64, cycle: u64) -> MemRequest {
    MemRequest::new(line_addr, CoherenceOp::PutExclusive, cycle)
}
