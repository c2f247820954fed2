use crate::cache::ndc::NdcCache;
use crate::cache::unit_tests::{cfg_raw, load, simple_tiers, store};
use crate::cache::CacheScheme;
use crate::stats::StatGroup;

/// 256 sets x 4 ways of 64 B lines, set index gathered from the low 8
/// bits.
fn ndc(victim_buffer_size: u32) -> NdcCache {
    let mut cfg = cfg_raw(64, 4, 256 * 4 * 64, 64 * 1024 * 1024);
    cfg.mcdram.index_mask_upper = 0;
    cfg.mcdram.index_mask_lower = 0xFF;
    cfg.mcdram.victim_buffer_size = victim_buffer_size;
    cfg.mcdram.num_banks = 8;
    NdcCache::new(cfg).unwrap()
}

#[test]
fn cache_address_round_trips() {
    let scheme = ndc(8);
    for line in (0..1u64 << 20).step_by(4097) {
        let cache_addr = scheme.phy_addr_to_cache_addr(line);
        assert_eq!(scheme.get_set_num(cache_addr), scheme.set_of_line(line));
        assert_eq!(scheme.get_tag(cache_addr), scheme.tag_of_line(line));
    }
}

#[test]
fn cache_addresses_are_unique() {
    let scheme = ndc(8);
    let mut seen = std::collections::HashSet::new();
    for line in 0..4096u64 {
        assert!(
            seen.insert(scheme.phy_addr_to_cache_addr(line)),
            "line {line} collided"
        );
    }
}

#[test]
fn oversized_index_mask_is_trimmed() {
    // Default mask has 32 bits set; the 1024-set cache needs 10.
    let mut cfg = cfg_raw(64, 1, 1024 * 64, 64 * 1024 * 1024);
    cfg.mcdram.victim_buffer_size = 4;
    let scheme = NdcCache::new(cfg).unwrap();
    for line in [0u64, 1023, 1024, 99999] {
        assert!(scheme.set_of_line(line) < 1024);
    }
}

#[test]
fn undersized_index_mask_is_fatal() {
    let mut cfg = cfg_raw(64, 4, 256 * 4 * 64, 64 * 1024 * 1024);
    cfg.mcdram.index_mask_upper = 0;
    cfg.mcdram.index_mask_lower = 0xF; // 4 bits for a 256-set cache
    assert!(NdcCache::new(cfg).is_err());
}

#[test]
fn row_hit_skips_activation_latency() {
    let mut scheme = ndc(8);
    let mut tiers = simple_tiers(1);
    // Same set twice: the second access finds the row open and a valid
    // tag, so it pays only compare + column latency.
    let mut a = load(0x11, 0);
    scheme.access(&mut a, &mut tiers);
    let mut b = load(0x11, 1000);
    let resp = scheme.access(&mut b, &mut tiers);
    let m = &scheme.base().cfg.mcdram;
    let expected = 1000 + (m.t_pcd + m.t_comp + m.t_cl) as u64;
    assert_eq!(resp, expected);
}

#[test]
fn victim_buffer_overflow_falls_back_to_direct_writeback() {
    let mut scheme = ndc(2);
    let mut tiers = simple_tiers(1);

    // Fill set 0x22 with four dirty lines, then three more store misses
    // each evict a dirty victim.
    for k in 0..4u64 {
        let mut st = store(0x22 + (k << 8), k * 10);
        scheme.access(&mut st, &mut tiers);
    }
    assert_eq!(scheme.base().stats.dirty_evict, 0);

    for k in 4..7u64 {
        let mut st = store(0x22 + (k << 8), k * 10);
        scheme.access(&mut st, &mut tiers);
    }
    assert_eq!(scheme.base().stats.dirty_evict, 3);
    // First two deferred, third written back directly.
    assert_eq!(scheme.victim_buffer().len(), 2);
    let mut stats = StatGroup::new("tiers");
    tiers.ext.append_stats(&mut stats);
    assert_eq!(stats.find_counter("wr"), Some(1));
}

#[test]
fn hits_drain_deferred_writebacks() {
    let mut scheme = ndc(2);
    let mut tiers = simple_tiers(1);
    for k in 0..5u64 {
        let mut st = store(0x30 + (k << 8), k * 10);
        scheme.access(&mut st, &mut tiers);
    }
    assert_eq!(scheme.victim_buffer().len(), 1);
    // A hit leaves the external bus idle and drains one entry.
    let mut hit = load(0x30 + (4 << 8), 1000);
    scheme.access(&mut hit, &mut tiers);
    assert_eq!(scheme.victim_buffer().len(), 0);
    let mut stats = StatGroup::new("tiers");
    tiers.ext.append_stats(&mut stats);
    assert_eq!(stats.find_counter("wr"), Some(1));
}

#[test]
fn store_miss_is_read_modify_write() {
    let mut scheme = ndc(4);
    let mut tiers = simple_tiers(1);
    let mut st = store(0x40, 0);
    scheme.access(&mut st, &mut tiers);
    let mut stats = StatGroup::new("tiers");
    tiers.ext.append_stats(&mut stats);
    // The line is fetched before being overwritten; nothing written yet.
    assert_eq!(stats.find_counter("rd"), Some(1));
    assert_eq!(stats.find_counter("wr"), Some(0));
    let ways = &scheme.base().tags;
    let set = scheme.set_of_line(0x40);
    let way = ways.lookup(set, scheme.tag_of_line(0x40)).unwrap();
    assert!(ways.way(set, way).dirty);
}

#[test]
fn tags_stay_unique_per_set() {
    let mut scheme = ndc(8);
    let mut tiers = simple_tiers(1);
    for i in 0..512u64 {
        let addr = (i * 37) % 4096;
        let mut req = if i % 2 == 0 { load(addr, i * 5) } else { store(addr, i * 5) };
        scheme.access(&mut req, &mut tiers);
    }
    for set in 0..scheme.base().cfg.num_sets {
        assert!(scheme.base().tags.tags_unique(set));
    }
}
