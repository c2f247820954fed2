use crate::config::{BackendKind, PageMapScheme, SchemeKind, StratusConfig};
use crate::mem::request::{flags, CoherenceOp, MemRequest, MesiState};
use crate::mem::{MemoryController, SimContext};
use crate::stats::StatGroup;

fn ctx() -> SimContext {
    SimContext::default()
}

/// Smallest config that can host any scheme: 1 MB near memory over a
/// 16 MB external tier, per-scheme geometry tweaks applied on top.
fn config_for(scheme: SchemeKind) -> StratusConfig {
    let mut cfg = StratusConfig::default();
    cfg.mem.cache_scheme = scheme;
    cfg.mem.mcdram.size = 1;
    cfg.mem.ext_dram.size = 16;
    cfg.mem.mcdram.mcdram_per_mc = 1;
    match scheme {
        SchemeKind::AlloyCache | SchemeKind::Chamo => {
            cfg.mem.mcdram.cache_granularity = 64;
            cfg.mem.mcdram.num_ways = 1;
        }
        SchemeKind::UnisonCache | SchemeKind::BansheeCache => {
            cfg.mem.mcdram.cache_granularity = 4096;
            cfg.mem.mcdram.num_ways = 4;
        }
        SchemeKind::Ndc => {
            cfg.mem.mcdram.cache_granularity = 64;
            cfg.mem.mcdram.num_ways = 4;
        }
        SchemeKind::IdealBalanced | SchemeKind::IdealAssociative | SchemeKind::IdealFully => {
            cfg.mem.mcdram.cache_granularity = 64;
            cfg.mem.mcdram.num_ways = (1 * 1024 * 1024) / 64;
        }
        _ => {}
    }
    cfg
}

const ALL_SCHEMES: [SchemeKind; 12] = [
    SchemeKind::AlloyCache,
    SchemeKind::UnisonCache,
    SchemeKind::BansheeCache,
    SchemeKind::NoCache,
    SchemeKind::CacheOnly,
    SchemeKind::CopyCache,
    SchemeKind::Ndc,
    SchemeKind::IdealBalanced,
    SchemeKind::IdealAssociative,
    SchemeKind::IdealFully,
    SchemeKind::IdealHotness,
    SchemeKind::Chamo,
];

#[test]
fn mesi_table_applies_for_every_op() {
    let cfg = config_for(SchemeKind::NoCache);
    let mc = MemoryController::new("mem-0", 0, &cfg, &ctx()).unwrap();
    let cases = [
        (CoherenceOp::PutShared, 0, MesiState::Invalid),
        (CoherenceOp::PutExclusive, 0, MesiState::Invalid),
        (CoherenceOp::GetShared, 0, MesiState::Exclusive),
        (CoherenceOp::GetShared, flags::NO_EXCL, MesiState::Shared),
        (CoherenceOp::GetExclusive, 0, MesiState::Modified),
    ];
    for (op, f, want) in cases {
        let mut req = MemRequest::new(0x10, op, 0);
        req.flags = f;
        mc.access(&mut req);
        assert_eq!(req.state, want, "{op:?}");
    }
}

#[test]
fn silent_writeback_returns_input_cycle_for_every_scheme() {
    for scheme in ALL_SCHEMES {
        let cfg = config_for(scheme);
        let mc = MemoryController::new("mem-0", 0, &cfg, &ctx()).unwrap();
        let mut req = MemRequest::new(0x40, CoherenceOp::PutShared, 777);
        assert_eq!(mc.access(&mut req), 777, "{scheme:?}");
        assert_eq!(req.state, MesiState::Invalid);
        assert_eq!(mc.num_requests(), 0, "silent writebacks skip the scheme");
    }
}

#[test]
fn every_scheme_services_a_mixed_stream() {
    for scheme in ALL_SCHEMES {
        let cfg = config_for(scheme);
        let mc = MemoryController::new("mem-0", 0, &cfg, &ctx()).unwrap();
        for i in 0..64u64 {
            let op = if i % 4 == 3 { CoherenceOp::PutExclusive } else { CoherenceOp::GetShared };
            let mut req = MemRequest::new((i * 11) % 2048, op, i * 10);
            let resp = mc.access(&mut req);
            assert!(resp >= i * 10, "{scheme:?} went back in time");
        }
        let mut root = StatGroup::new("mem");
        mc.init_stats(&mut root);
        assert!(root.group("mem-0").is_some());
    }
}

#[test]
fn virtual_address_is_restored_after_access() {
    let mut cfg = config_for(SchemeKind::AlloyCache);
    cfg.mem.pagemap_scheme = PageMapScheme::Random;
    let mc = MemoryController::new("mem-0", 0, &cfg, &ctx()).unwrap();
    let mut req = MemRequest::new(0xABCDE, CoherenceOp::GetShared, 0);
    mc.access(&mut req);
    assert_eq!(req.line_addr, 0xABCDE);
}

#[test]
fn page_mapping_preserves_hits() {
    for scheme_kind in [PageMapScheme::Johnny, PageMapScheme::Random] {
        let mut cfg = config_for(SchemeKind::AlloyCache);
        cfg.mem.pagemap_scheme = scheme_kind;
        let mc = MemoryController::new("mem-0", 0, &cfg, &ctx()).unwrap();
        let mut first = MemRequest::new(0x5000, CoherenceOp::GetShared, 0);
        mc.access(&mut first);
        let mut second = MemRequest::new(0x5000, CoherenceOp::GetShared, 100);
        mc.access(&mut second);
        let mut root = StatGroup::new("mem");
        mc.init_stats(&mut root);
        assert_eq!(root.find_counter("loadHit"), Some(1), "{scheme_kind:?}");
    }
}

#[test]
fn trace_collection_only_on_first_controller() {
    let dir = std::env::temp_dir().join("stratus-ctrl-trace");
    let _ = std::fs::remove_dir_all(&dir);
    let mut cfg = config_for(SchemeKind::NoCache);
    cfg.mem.enable_trace = true;
    cfg.mem.trace_dir = dir.to_string_lossy().into_owned();

    let mc0 = MemoryController::new("mem-0", 0, &cfg, &ctx()).unwrap();
    let _mc1 = MemoryController::new("mem-1", 1, &cfg, &ctx()).unwrap();
    assert!(dir.join("mem-0trace.bin").exists());
    assert!(!dir.join("mem-1trace.bin").exists());

    for i in 0..10_000u64 {
        let op = if i % 2 == 0 { CoherenceOp::GetShared } else { CoherenceOp::PutExclusive };
        let mut req = MemRequest::new(i, op, i);
        mc0.access(&mut req);
    }
    let entries = crate::trace::read_trace(&dir.join("mem-0trace.bin")).unwrap();
    assert_eq!(entries.len(), 10_000);
    assert_eq!(entries[1], (1, true));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn ddr_backends_wire_into_the_controller() {
    let mut cfg = config_for(SchemeKind::AlloyCache);
    cfg.mem.ext_dram.backend = BackendKind::Ddr;
    cfg.mem.mcdram.backend = BackendKind::Ddr;
    let mc = MemoryController::new("mem-0", 0, &cfg, &ctx()).unwrap();
    let mut req = MemRequest::new(0x99, CoherenceOp::GetShared, 50);
    let resp = mc.access(&mut req);
    assert!(resp > 50);
    mc.tick(100_000);
}

#[test]
fn device_backend_without_library_is_fatal() {
    let mut cfg = config_for(SchemeKind::NoCache);
    cfg.mem.ext_dram.backend = BackendKind::Device;
    assert!(MemoryController::new("mem-0", 0, &cfg, &ctx()).is_err());
}

#[test]
fn unknown_ddr_technology_is_fatal_at_init() {
    let mut cfg = config_for(SchemeKind::NoCache);
    cfg.mem.ext_dram.backend = BackendKind::Ddr;
    cfg.mem.ext_dram.ddr.tech = "HBM9".to_string();
    assert!(MemoryController::new("mem-0", 0, &cfg, &ctx()).is_err());
}
