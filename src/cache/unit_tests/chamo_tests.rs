use crate::cache::chamo::ChamoCache;
use crate::cache::unit_tests::{cfg_raw, load, simple_tiers, store};
use crate::cache::{CacheScheme, SchemeConfig};
use crate::config::ChamoIndexKind;
use crate::stats::StatGroup;

/// 4 KiB near memory in front of a 64 KiB external tier (ratio 16).
fn chamo_cfg(kind: ChamoIndexKind) -> SchemeConfig {
    let mut cfg = cfg_raw(64, 1, 4 * 1024, 64 * 1024);
    cfg.mcdram.index_scheme = kind;
    // One mapping unit per 4 KiB of near memory.
    cfg.mcdram.page_size = 4096;
    cfg
}

#[test]
fn rank_index_maps_into_near_memory() {
    let mut scheme = ChamoCache::new(chamo_cfg(ChamoIndexKind::Rank)).unwrap();
    let mut tiers = simple_tiers(1);
    for i in 0..256u64 {
        let mut req = load(i * 3 + 1, i * 10);
        let resp = scheme.access(&mut req, &mut tiers);
        assert!(resp >= i * 10);
    }
    let stats = collect(&scheme);
    let touched = stats.find_counter("touchedLines").unwrap();
    let cuckoo = stats.find_counter("cuckooMapped").unwrap();
    assert!(touched > 0);
    assert!(cuckoo <= touched);
}

#[test]
fn rank_immediate_reaccess_hits() {
    let mut scheme = ChamoCache::new(chamo_cfg(ChamoIndexKind::Rank)).unwrap();
    let mut tiers = simple_tiers(1);
    let mut first = load(0x123, 0);
    scheme.access(&mut first, &mut tiers);
    let mut second = load(0x123, 100);
    scheme.access(&mut second, &mut tiers);
    assert_eq!(scheme.base().stats.load_hit, 1);
}

#[test]
fn cuckoo_index_keeps_mapping_stable() {
    let mut scheme = ChamoCache::new(chamo_cfg(ChamoIndexKind::Cuckoo)).unwrap();
    let mut tiers = simple_tiers(1);
    for round in 0..3u64 {
        for addr in 0..48u64 {
            let mut req = load(addr, round * 1000 + addr);
            scheme.access(&mut req, &mut tiers);
        }
    }
    // Stable mapping means re-accesses hit unless a conflicting line
    // displaced them; the index itself never remaps silently.
    let stats = collect(&scheme);
    let cuckoo = stats.find_counter("cuckooMapped").unwrap();
    let direct = stats.find_counter("directMapped").unwrap();
    assert_eq!(cuckoo + direct, 48);
    assert!(scheme.base().stats.load_hit > 0);
}

#[test]
fn shuffle_and_bitmix_variants_construct() {
    for kind in [ChamoIndexKind::Shuffle, ChamoIndexKind::BitMix] {
        let mut scheme = ChamoCache::new(chamo_cfg(kind)).unwrap();
        let mut tiers = simple_tiers(1);
        for addr in 0..32u64 {
            let mut req = load(addr * 5, addr);
            scheme.access(&mut req, &mut tiers);
        }
        for set in 0..scheme.base().cfg.num_sets {
            assert!(scheme.base().tags.tags_unique(set));
        }
    }
}

#[test]
fn store_miss_installs_dirty_line() {
    let mut scheme = ChamoCache::new(chamo_cfg(ChamoIndexKind::Rank)).unwrap();
    let mut tiers = simple_tiers(1);
    let mut st = store(0x77, 0);
    scheme.access(&mut st, &mut tiers);
    assert_eq!(scheme.base().stats.store_miss, 1);
    // The follow-up dirty eviction goes back to the external tier.
    let displaced = conflicting_store(&mut scheme, &mut tiers, 0x77);
    if displaced {
        assert!(scheme.base().stats.dirty_evict >= 1);
    }
}

/// Store lines until one lands on 0x77's set; returns whether a dirty
/// eviction happened.
fn conflicting_store(
    scheme: &mut ChamoCache,
    tiers: &mut crate::mem::backend::MemoryTiers,
    _target: u64,
) -> bool {
    for addr in 0x100..0x300u64 {
        let mut st = store(addr, 1000 + addr);
        scheme.access(&mut st, tiers);
        if scheme.base().stats.dirty_evict > 0 {
            return true;
        }
    }
    false
}

#[test]
fn undersized_external_ratio_is_rejected() {
    // External tier equal to near memory: no levels to index.
    let cfg = cfg_raw(64, 1, 4 * 1024, 4 * 1024);
    assert!(ChamoCache::new(cfg).is_err());
}

fn collect(scheme: &ChamoCache) -> StatGroup {
    let mut root = StatGroup::new("root");
    scheme.append_stats(&mut root);
    root
}
