use crate::config::{ConfigError, DdrParams};
use crate::mem::backend::MemBackend;
use crate::mem::ddr::DdrMemory;
use crate::mem::request::{CoherenceOp, MemRequest, RecordKind};

const SYS_MHZ: u32 = 4000;

fn ddr(params: DdrParams) -> DdrMemory {
    let mut mem = DdrMemory::new(64, SYS_MHZ, &params, "ddr-test", 4, 1.0).unwrap();
    mem.trace_commands(true);
    mem
}

fn default_params() -> DdrParams {
    DdrParams::default()
}

/// Line address for (rank, bank, col, row) under the default
/// rank:col:bank mapping (bank lowest, row on top).
fn addr_of(rank: u64, bank: u64, col: u64, row: u64) -> u64 {
    bank | (col << 3) | (rank << 13) | (row << 15)
}

fn read_at(mem: &mut DdrMemory, addr: u64, cycle: u64) {
    let mut req = MemRequest::new(addr, CoherenceOp::GetShared, cycle);
    mem.access(&mut req, RecordKind::NewRecord, 4);
}

fn write_at(mem: &mut DdrMemory, addr: u64, cycle: u64) {
    let mut req = MemRequest::new(addr, CoherenceOp::PutExclusive, cycle);
    mem.access(&mut req, RecordKind::NewRecord, 4);
}

fn drain(mem: &mut DdrMemory) {
    let mut sys_cycle = 1_000;
    for _ in 0..10_000 {
        match mem.tick(sys_cycle) {
            Some(next) => sys_cycle = next.max(sys_cycle + 1),
            None => return,
        }
    }
    panic!("DDR model failed to drain");
}

#[test]
fn unknown_technology_is_fatal() {
    let mut params = default_params();
    params.tech = "DDR9-9999".to_string();
    let err = DdrMemory::new(64, SYS_MHZ, &params, "ddr", 4, 1.0).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownTech(_)));
}

#[test]
fn too_fast_memory_clock_is_fatal() {
    // 1333 MHz memory needs a > 2666 MHz system clock.
    let err = DdrMemory::new(64, 2000, &default_params(), "ddr", 4, 1.0).unwrap_err();
    assert!(matches!(err, ConfigError::FrequencyRatio { .. }));
}

#[test]
fn bound_phase_response_exceeds_request_cycle() {
    let mut mem = ddr(default_params());
    let mut req = MemRequest::new(addr_of(0, 0, 0, 0), CoherenceOp::GetShared, 500);
    let resp = mem.access(&mut req, RecordKind::NewRecord, 4);
    assert!(resp > 500);
}

#[test]
fn silent_writeback_bypasses_the_queues() {
    let mut mem = ddr(default_params());
    let mut req = MemRequest::new(addr_of(0, 0, 0, 0), CoherenceOp::PutShared, 123);
    assert_eq!(mem.access(&mut req, RecordKind::NewRecord, 4), 123);
    assert!(mem.tick(1_000).is_none());
    assert!(mem.cmd_log().is_empty());
}

#[test]
fn row_hit_streak_respects_the_limit() {
    let mut mem = ddr(default_params());
    // Six reads to the same row of one bank; max_row_hits = 4.
    for i in 0..6u64 {
        read_at(&mut mem, addr_of(0, 0, i, 7), i);
    }
    drain(&mut mem);

    let log = mem.cmd_log();
    assert_eq!(log.len(), 6);
    let hits = log.iter().filter(|c| c.row_hit).count();
    assert_eq!(hits, 4, "streak caps at max_row_hits");
    assert!(!log[0].row_hit, "first access opens the row");
    assert!(!log[5].row_hit, "sixth starts a new streak");
    assert_eq!(mem.read_row_hits(), 4);
}

#[test]
fn same_bank_commands_never_share_a_cycle() {
    let mut mem = ddr(default_params());
    for i in 0..12u64 {
        read_at(&mut mem, addr_of(0, i % 2, i, i % 3), i * 2);
    }
    drain(&mut mem);

    let log = mem.cmd_log();
    assert_eq!(log.len(), 12);
    for a in 0..log.len() {
        for b in a + 1..log.len() {
            if log[a].rank == log[b].rank && log[a].bank == log[b].bank {
                assert_ne!(log[a].cmd_cycle, log[b].cmd_cycle);
            }
        }
    }
}

#[test]
fn activation_to_command_respects_trcd() {
    let t_rcd = 10; // DDR3-1333-CL10
    let mut mem = ddr(default_params());
    for i in 0..8u64 {
        read_at(&mut mem, addr_of(0, 0, 0, i), i * 3);
    }
    drain(&mut mem);
    for cmd in mem.cmd_log() {
        if let Some(act) = cmd.act_cycle {
            assert!(cmd.cmd_cycle >= act + t_rcd, "{cmd:?}");
        }
    }
}

#[test]
fn same_bank_activations_respect_trrd() {
    let t_rrd = 4;
    let mut mem = ddr(default_params());
    for i in 0..8u64 {
        read_at(&mut mem, addr_of(0, 0, 0, i), i);
    }
    drain(&mut mem);
    let acts: Vec<u64> = mem
        .cmd_log()
        .iter()
        .filter(|c| c.bank == 0 && c.rank == 0)
        .filter_map(|c| c.act_cycle)
        .collect();
    for pair in acts.windows(2) {
        assert!(pair[1] >= pair[0] + t_rrd, "{pair:?}");
    }
}

#[test]
fn four_activation_window_respects_tfaw() {
    let t_faw = 20;
    let mut mem = ddr(default_params());
    // Different banks of one rank, all row misses.
    for i in 0..8u64 {
        read_at(&mut mem, addr_of(0, i % 8, 0, i), i);
    }
    drain(&mut mem);
    let mut acts: Vec<u64> = mem
        .cmd_log()
        .iter()
        .filter(|c| c.rank == 0)
        .filter_map(|c| c.act_cycle)
        .collect();
    acts.sort_unstable();
    for window in acts.windows(5) {
        assert!(window[4] >= window[0] + t_faw, "{window:?}");
    }
}

#[test]
fn write_to_read_turnaround_respects_twtr() {
    let (t_cl, t_wtr, data) = (10u64, 5u64, 4u64);
    let mut params = default_params();
    params.defer_writes = false;
    let mut mem = ddr(params);
    write_at(&mut mem, addr_of(0, 0, 0, 0), 0);
    read_at(&mut mem, addr_of(0, 1, 0, 0), 1);
    drain(&mut mem);

    let log = mem.cmd_log();
    assert_eq!(log.len(), 2);
    assert!(log[0].write && !log[1].write);
    assert!(
        log[1].cmd_cycle >= log[0].cmd_cycle + t_cl + data + t_wtr,
        "read too close behind write: {log:?}"
    );
}

#[test]
fn full_write_queue_takes_priority() {
    let mut mem = ddr(default_params());
    // 13 writes (> 3/4 of depth 16) against one read.
    for i in 0..13u64 {
        write_at(&mut mem, addr_of(0, i % 8, i, i), i);
    }
    read_at(&mut mem, addr_of(1, 0, 0, 0), 0);
    drain(&mut mem);
    let log = mem.cmd_log();
    assert!(log[0].write, "writes drain first when the queue is full");
    assert_eq!(log.iter().filter(|c| !c.write).count(), 1);
}

#[test]
fn queue_overflow_degrades_without_drops() {
    let mut params = default_params();
    params.queue_depth = 2;
    let mut mem = ddr(params);
    for i in 0..10u64 {
        read_at(&mut mem, addr_of(0, i % 4, i, i), i);
    }
    drain(&mut mem);
    assert_eq!(mem.cmd_log().iter().filter(|c| !c.write).count(), 10);
}

#[test]
fn activation_after_refresh_waits_for_trfc() {
    let (t_refi, t_rfc) = (5200u64, 74u64);
    let mut mem = ddr(default_params());
    // Arrive just after the first refresh boundary (in memory cycles).
    let arrival_sys = (t_refi + 10) * 3; // sys:mem ratio = 3
    read_at(&mut mem, addr_of(0, 0, 0, 1), arrival_sys);
    drain(&mut mem);
    let cmd = mem.cmd_log()[0];
    let act = cmd.act_cycle.expect("bank was closed by refresh");
    assert!(act >= t_refi + t_rfc, "act {act} inside refresh window");
}

#[test]
fn completions_cover_reads_and_writes() {
    let mut mem = ddr(default_params());
    mem.collect_completions(true);
    write_at(&mut mem, addr_of(0, 0, 0, 0), 0);
    read_at(&mut mem, addr_of(0, 1, 0, 0), 5);
    drain(&mut mem);
    let completions = mem.take_completions();
    assert_eq!(completions.len(), 2);
    assert!(completions.iter().any(|c| c.write));
    assert!(completions.iter().any(|c| !c.write));
}
