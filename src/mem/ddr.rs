use std::collections::VecDeque;

use log::info;

use crate::config::{ConfigError, DdrParams};
use crate::mem::request::{CoherenceOp, MemRequest, RecordKind};
use crate::stats::StatGroup;
use crate::Cycle;

/// JEDEC data bus width in bytes per burst beat.
const JEDEC_BEAT_BYTES: u32 = 8;

#[derive(Debug, Clone, Copy)]
struct TechPreset {
    tck_ps: u64,
    t_bl: u64,
    t_cl: u64,
    t_rcd: u64,
    t_rtp: u64,
    t_rp: u64,
    t_rrd: u64,
    t_ras: u64,
    t_faw: u64,
    t_wtr: u64,
    t_wr: u64,
    t_rfc: u64,
    t_refi: u64,
}

// Ordered fast to slow. The CXL preset doubles every constraint to stand in
// for a far-memory expander behind a link.
static TECH_PRESETS: phf::Map<&'static str, TechPreset> = phf::phf_map! {
    "DDR3-1333-CL10" => TechPreset {
        tck_ps: 750, t_bl: 4, t_cl: 10, t_rcd: 10, t_rtp: 5, t_rp: 10,
        t_rrd: 4, t_ras: 24, t_faw: 20, t_wtr: 5, t_wr: 10, t_rfc: 74,
        t_refi: 5200,
    },
    "DDR3-1333-CL10-CXL" => TechPreset {
        tck_ps: 750, t_bl: 4, t_cl: 20, t_rcd: 20, t_rtp: 10, t_rp: 20,
        t_rrd: 8, t_ras: 48, t_faw: 40, t_wtr: 10, t_wr: 20, t_rfc: 148,
        t_refi: 10400,
    },
    "DDR3-1066-CL7" => TechPreset {
        tck_ps: 1875, t_bl: 4, t_cl: 7, t_rcd: 7, t_rtp: 4, t_rp: 7,
        t_rrd: 4, t_ras: 18, t_faw: 18, t_wtr: 4, t_wr: 7, t_rfc: 59,
        t_refi: 4160,
    },
    "DDR3-1066-CL8" => TechPreset {
        tck_ps: 1875, t_bl: 4, t_cl: 8, t_rcd: 8, t_rtp: 4, t_rp: 8,
        t_rrd: 4, t_ras: 20, t_faw: 20, t_wtr: 4, t_wr: 8, t_rfc: 59,
        t_refi: 4160,
    },
};

#[derive(Debug, Clone, Copy)]
struct DdrTiming {
    t_bl: u64,
    t_cl: u64,
    t_rcd: u64,
    t_rtp: u64,
    t_rp: u64,
    t_rrd: u64,
    t_ras: u64,
    t_faw: u64,
    t_wtr: u64,
    t_wr: u64,
    t_rfc: u64,
    t_refi: u64,
    mem_freq_khz: u64,
}

impl DdrTiming {
    fn from_tech(
        tech: &str,
        line_size: u32,
        time_scale: f64,
    ) -> Result<Self, ConfigError> {
        let preset = TECH_PRESETS
            .get(tech)
            .ok_or_else(|| ConfigError::UnknownTech(tech.to_string()))?;
        let scale = |v: u64| -> u64 { ((v as f64 / time_scale) as u64).max(1) };
        let mut t_bl = preset.t_bl;
        // Burst length presets assume 64-byte lines.
        if line_size.is_power_of_two() && line_size >= 64 {
            t_bl = t_bl * line_size as u64 / 64;
        } else if line_size == 32 {
            t_bl /= 2;
        } else {
            return Err(ConfigError::Invalid(format!(
                "unsupported line size {line_size}"
            )));
        }
        Ok(Self {
            t_bl,
            t_cl: scale(preset.t_cl),
            t_rcd: scale(preset.t_rcd),
            t_rtp: scale(preset.t_rtp),
            t_rp: scale(preset.t_rp),
            t_rrd: scale(preset.t_rrd),
            t_ras: scale(preset.t_ras),
            t_faw: scale(preset.t_faw),
            t_wtr: scale(preset.t_wtr),
            t_wr: scale(preset.t_wr),
            t_rfc: scale(preset.t_rfc),
            t_refi: scale(preset.t_refi),
            mem_freq_khz: 1_000_000_000 / preset.tck_ps,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AddrLoc {
    row: u64,
    col: u64,
    rank: u32,
    bank: u32,
}

#[derive(Debug, Clone, Default)]
struct Bank {
    open: bool,
    open_row: u64,
    min_pre_cycle: Cycle,
    last_act_cycle: Cycle,
    last_cmd_cycle: Cycle,
    cur_row_hits: u32,
    rd_q: VecDeque<usize>,
    wr_q: VecDeque<usize>,
}

/// Sliding window of the last four ACT cycles per rank; enforces tFAW.
#[derive(Debug, Clone)]
struct ActWindow {
    acts: VecDeque<Cycle>,
}

impl ActWindow {
    fn new() -> Self {
        Self {
            acts: VecDeque::from(vec![0; 4]),
        }
    }

    fn min_act_cycle(&self) -> Cycle {
        *self.acts.front().expect("window never empty")
    }

    fn add_activation(&mut self, cycle: Cycle) {
        self.acts.pop_front();
        self.acts.push_back(cycle);
    }
}

#[derive(Debug, Clone, Copy)]
struct DdrRequest {
    addr: u64,
    loc: AddrLoc,
    data_size: u32,
    write: bool,
    arrival_cycle: Cycle,
    start_sys_cycle: Cycle,
    row_hit_seq: u32,
}

/// A bound-phase access waiting to enter the weave-phase queues.
#[derive(Debug, Clone, Copy)]
struct PendingAccess {
    addr: u64,
    write: bool,
    data_size: u32,
    start_sys_cycle: Cycle,
}

#[derive(Debug, Clone, Copy)]
pub struct DdrCompletion {
    pub addr: u64,
    pub write: bool,
    pub done_sys_cycle: Cycle,
}

/// One issued column command, for constraint checking in tests.
#[derive(Debug, Clone, Copy)]
pub struct CmdRecord {
    pub rank: u32,
    pub bank: u32,
    pub row: u64,
    pub cmd_cycle: Cycle,
    pub act_cycle: Option<Cycle>,
    pub pre_cycle: Option<Cycle>,
    pub write: bool,
    pub row_hit: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct DdrStats {
    reads: u64,
    writes: u64,
    bytes_read: u64,
    bytes_written: u64,
    total_rd_lat: u64,
    total_wr_lat: u64,
    rd_row_hits: u64,
    wr_row_hits: u64,
}

/// Event-driven FR-FCFS memory controller model running at memory clock.
/// The bound phase (`access`) returns an optimistic response cycle; the
/// weave phase (`tick`) replays requests against bank timing state.
#[derive(Debug)]
pub struct DdrMemory {
    name: String,
    ranks_per_channel: u32,
    banks_per_rank: u32,
    controller_sys_latency: Cycle,
    queue_depth: usize,
    row_hit_limit: u32,
    deferred_writes: bool,
    closed_page: bool,
    warmup_done: bool,

    timing: DdrTiming,
    sys_freq_khz: u64,
    min_rd_latency: Cycle,
    min_wr_latency: Cycle,

    col_shift: u32,
    col_mask: u64,
    rank_shift: u32,
    rank_mask: u64,
    bank_shift: u32,
    bank_mask: u64,
    row_shift: u32,

    banks: Vec<Vec<Bank>>,
    rank_act_windows: Vec<ActWindow>,

    reqs: Vec<Option<DdrRequest>>,
    free_ids: Vec<usize>,
    rd_order: Vec<usize>,
    wr_order: Vec<usize>,
    overflow: VecDeque<PendingAccess>,
    pending: VecDeque<PendingAccess>,

    min_resp_cycle: Cycle,
    last_cmd_was_write: bool,
    next_refresh_cycle: Cycle,
    next_sched_cycle: Option<Cycle>,

    stats: DdrStats,
    collect_completions: bool,
    completions: Vec<DdrCompletion>,
    trace_commands: bool,
    cmd_log: Vec<CmdRecord>,
}

impl DdrMemory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        line_size: u32,
        sys_freq_mhz: u32,
        params: &DdrParams,
        name: &str,
        t_bl: u32,
        time_scale: f64,
    ) -> Result<Self, ConfigError> {
        let sys_freq_khz = 1000 * sys_freq_mhz as u64;
        let mut timing = DdrTiming::from_tech(&params.tech, line_size, time_scale)?;
        timing.t_bl = t_bl as u64;
        if timing.mem_freq_khz >= sys_freq_khz / 2 {
            // Events run on system cycles; they must be able to hit every
            // memory cycle.
            return Err(ConfigError::FrequencyRatio {
                mem_khz: timing.mem_freq_khz,
                sys_khz: sys_freq_khz,
            });
        }

        let col_bits = (params.page_size / JEDEC_BEAT_BYTES * 64 / line_size).ilog2();
        let bank_bits = params.banks_per_rank.ilog2();
        let rank_bits = params.ranks_per_channel.ilog2();

        // Row always takes the top bits; the mapping string orders the rest.
        let mut col_shift = 0;
        let mut col_mask = 0u64;
        let mut rank_shift = 0;
        let mut rank_mask = 0u64;
        let mut bank_shift = 0;
        let mut bank_mask = 0u64;
        let mut start_bit = 0u32;
        let tokens: Vec<&str> = params.addr_mapping.split(':').collect();
        if tokens.len() != 3 {
            return Err(ConfigError::Invalid(format!(
                "invalid addr_mapping {}, need rank/col/bank separated by colons",
                params.addr_mapping
            )));
        }
        for token in tokens.iter().rev() {
            let (bits, shift, mask): (u32, &mut u32, &mut u64) = match *token {
                "col" => (col_bits, &mut col_shift, &mut col_mask),
                "rank" => (rank_bits, &mut rank_shift, &mut rank_mask),
                "bank" => (bank_bits, &mut bank_shift, &mut bank_mask),
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "invalid token {other} in addr_mapping {}",
                        params.addr_mapping
                    )))
                }
            };
            if *mask != 0 {
                return Err(ConfigError::Invalid(format!(
                    "repeated field {token} in addr_mapping {}",
                    params.addr_mapping
                )));
            }
            *shift = start_bit;
            *mask = (1 << bits) - 1;
            start_bit += bits;
        }
        let row_shift = start_bit;

        let min_rd_latency = params.controller_latency as Cycle
            + mem_to_sys_dur(timing.t_cl + 1, sys_freq_khz, timing.mem_freq_khz);
        let min_wr_latency = params.controller_latency as Cycle;

        info!(
            "{name}: {} ranks/ch {} banks/rank, tech {}, boundLat {} rd / {} wr",
            params.ranks_per_channel, params.banks_per_rank, params.tech,
            min_rd_latency, min_wr_latency
        );

        let banks = vec![
            vec![Bank::default(); params.banks_per_rank as usize];
            params.ranks_per_channel as usize
        ];
        let rank_act_windows = vec![ActWindow::new(); params.ranks_per_channel as usize];
        let t_refi = timing.t_refi;
        // Subtracting tCL + tBL from this on some checks must not overflow.
        let min_resp_cycle = timing.t_cl + timing.t_bl + 1;

        Ok(Self {
            name: name.to_string(),
            ranks_per_channel: params.ranks_per_channel,
            banks_per_rank: params.banks_per_rank,
            controller_sys_latency: params.controller_latency as Cycle,
            queue_depth: params.queue_depth as usize,
            row_hit_limit: params.max_row_hits,
            deferred_writes: params.defer_writes,
            closed_page: params.closed_page,
            warmup_done: true,
            timing,
            sys_freq_khz,
            min_rd_latency,
            min_wr_latency,
            col_shift,
            col_mask,
            rank_shift,
            rank_mask,
            bank_shift,
            bank_mask,
            row_shift,
            banks,
            rank_act_windows,
            reqs: Vec::new(),
            free_ids: Vec::new(),
            rd_order: Vec::new(),
            wr_order: Vec::new(),
            overflow: VecDeque::new(),
            pending: VecDeque::new(),
            min_resp_cycle,
            last_cmd_was_write: false,
            next_refresh_cycle: t_refi,
            next_sched_cycle: None,
            stats: DdrStats::default(),
            collect_completions: false,
            completions: Vec::new(),
            trace_commands: false,
            cmd_log: Vec::new(),
        })
    }

    pub fn set_warmup_done(&mut self, done: bool) {
        self.warmup_done = done;
    }

    pub fn collect_completions(&mut self, on: bool) {
        self.collect_completions = on;
    }

    pub fn take_completions(&mut self) -> Vec<DdrCompletion> {
        std::mem::take(&mut self.completions)
    }

    pub fn trace_commands(&mut self, on: bool) {
        self.trace_commands = on;
    }

    pub fn cmd_log(&self) -> &[CmdRecord] {
        &self.cmd_log
    }

    pub fn read_row_hits(&self) -> u64 {
        self.stats.rd_row_hits
    }

    fn sys_to_mem(&self, sys_cycle: Cycle) -> Cycle {
        sys_cycle * self.timing.mem_freq_khz / self.sys_freq_khz
    }

    fn mem_to_sys(&self, mem_cycle: Cycle) -> Cycle {
        (mem_cycle * self.sys_freq_khz).div_ceil(self.timing.mem_freq_khz)
    }

    fn mem_to_sys_dur(&self, mem_cycles: Cycle) -> Cycle {
        mem_to_sys_dur(mem_cycles, self.sys_freq_khz, self.timing.mem_freq_khz)
    }

    fn map_line_addr(&self, line_addr: u64) -> AddrLoc {
        let loc = AddrLoc {
            col: (line_addr >> self.col_shift) & self.col_mask,
            rank: ((line_addr >> self.rank_shift) & self.rank_mask) as u32,
            bank: ((line_addr >> self.bank_shift) & self.bank_mask) as u32,
            row: line_addr >> self.row_shift,
        };
        debug_assert!(loc.rank < self.ranks_per_channel);
        debug_assert!(loc.bank < self.banks_per_rank);
        loc
    }

    fn alloc_req(&mut self, req: DdrRequest) -> usize {
        if let Some(id) = self.free_ids.pop() {
            self.reqs[id] = Some(req);
            id
        } else {
            self.reqs.push(Some(req));
            self.reqs.len() - 1
        }
    }

    fn req(&self, id: usize) -> &DdrRequest {
        self.reqs[id].as_ref().expect("live request")
    }

    fn bank_of(&self, loc: AddrLoc) -> &Bank {
        &self.banks[loc.rank as usize][loc.bank as usize]
    }

    /// Queue a request into its bank in FR order: after the last same-row
    /// request while the row-hit streak is below the limit, else FCFS.
    fn queue(&mut self, id: usize, mem_cycle: Cycle) {
        let (loc, write, start_sys) = {
            let r = self.req(id);
            (r.loc, r.write, r.start_sys_cycle)
        };

        // Writes respond as soon as they are accepted; the queue entry only
        // models bandwidth from here on.
        if write && self.collect_completions {
            let done = self.mem_to_sys(mem_cycle) + self.min_wr_latency;
            self.completions.push(DdrCompletion {
                addr: self.req(id).addr,
                write: true,
                done_sys_cycle: done.max(start_sys),
            });
        }

        self.reqs[id].as_mut().unwrap().arrival_cycle = mem_cycle;

        let use_wr_queue = self.deferred_writes && write;
        let row = self.req(id).loc.row;
        let row_hit_limit = self.row_hit_limit;
        let bank = &mut self.banks[loc.rank as usize][loc.bank as usize];
        let q: Vec<usize> = {
            let queue = if use_wr_queue { &bank.wr_q } else { &bank.rd_q };
            queue.iter().copied().collect()
        };

        let mut inserted = false;
        for (pos, &other_id) in q.iter().enumerate().rev() {
            let other = self.reqs[other_id].as_ref().unwrap();
            if other.loc.row == row {
                let seq = if other.row_hit_seq < row_hit_limit {
                    inserted = true;
                    other.row_hit_seq + 1
                } else {
                    0
                };
                let bank = &mut self.banks[loc.rank as usize][loc.bank as usize];
                let queue = if use_wr_queue { &mut bank.wr_q } else { &mut bank.rd_q };
                if inserted {
                    self.reqs[id].as_mut().unwrap().row_hit_seq = seq;
                    queue.insert(pos + 1, id);
                } else {
                    self.reqs[id].as_mut().unwrap().row_hit_seq = 0;
                    queue.push_back(id);
                    inserted = true;
                }
                break;
            }
        }

        if !inserted {
            let bank = &mut self.banks[loc.rank as usize][loc.bank as usize];
            let queue_empty =
                if use_wr_queue { bank.wr_q.is_empty() } else { bank.rd_q.is_empty() };
            if bank.open
                && row == bank.open_row
                && bank.cur_row_hits < row_hit_limit
                && queue_empty
            {
                // Row already open and nothing queued: bypass as a row hit.
                let seq = bank.cur_row_hits + 1;
                let queue = if use_wr_queue { &mut bank.wr_q } else { &mut bank.rd_q };
                self.reqs[id].as_mut().unwrap().row_hit_seq = seq;
                queue.push_front(id);
            } else {
                let queue = if use_wr_queue { &mut bank.wr_q } else { &mut bank.rd_q };
                self.reqs[id].as_mut().unwrap().row_hit_seq = 0;
                queue.push_back(id);
            }
        }
    }

    fn is_bank_head(&self, id: usize) -> bool {
        let r = self.req(id);
        let bank = self.bank_of(r.loc);
        let q = if self.deferred_writes && r.write { &bank.wr_q } else { &bank.rd_q };
        q.front() == Some(&id)
    }

    fn find_min_cmd_cycle(&self, r: &DdrRequest) -> Cycle {
        let t = &self.timing;
        let bank = self.bank_of(r.loc);
        let mut min_cmd = r.arrival_cycle.max(bank.last_cmd_cycle + 1);
        if !(bank.open && r.loc.row == bank.open_row) {
            let pre_cycle = if !bank.open {
                bank.min_pre_cycle
            } else {
                r.arrival_cycle.max(bank.min_pre_cycle)
            };
            let mut act_cycle = r
                .arrival_cycle
                .max((pre_cycle + t.t_rp).max(bank.last_act_cycle + t.t_rrd));
            act_cycle = act_cycle
                .max(self.rank_act_windows[r.loc.rank as usize].min_act_cycle() + t.t_faw);
            min_cmd = act_cycle + t.t_rcd;
        }
        min_cmd
    }

    fn enqueue(&mut self, ev: PendingAccess) {
        let mem_cycle = self.sys_to_mem(ev.start_sys_cycle);
        let overflow = self.rd_order.len() >= self.queue_depth
            || self.wr_order.len() >= self.queue_depth;
        if overflow {
            self.overflow.push_back(ev);
            return;
        }

        let loc = self.map_line_addr(ev.addr);
        let id = self.alloc_req(DdrRequest {
            addr: ev.addr,
            loc,
            data_size: ev.data_size,
            write: ev.write,
            arrival_cycle: mem_cycle,
            start_sys_cycle: ev.start_sys_cycle,
            row_hit_seq: 0,
        });
        if self.deferred_writes && ev.write {
            self.wr_order.push(id);
        } else {
            self.rd_order.push(id);
        }
        self.queue(id, mem_cycle);

        if self.is_bank_head(id) {
            let t = self.timing;
            let mut min_sched = mem_cycle.max(self.min_resp_cycle - t.t_cl - t.t_bl);
            if self.next_sched_cycle.map_or(true, |c| c > min_sched) {
                min_sched = min_sched.max(self.find_min_cmd_cycle(self.req(id)));
            }
            if self.next_sched_cycle.map_or(true, |c| c > min_sched) {
                self.next_sched_cycle = Some(min_sched);
            }
        }
    }

    fn drain_overflow(&mut self) {
        while !self.overflow.is_empty()
            && self.rd_order.len() < self.queue_depth
            && self.wr_order.len() < self.queue_depth
        {
            let ev = self.overflow.pop_front().unwrap();
            self.enqueue(ev);
        }
    }

    fn admit_pending(&mut self, sys_cycle: Cycle) {
        while let Some(front) = self.pending.front() {
            if front.start_sys_cycle > sys_cycle {
                break;
            }
            let ev = self.pending.pop_front().unwrap();
            self.enqueue(ev);
        }
    }

    fn run_refresh(&mut self, mem_now: Cycle) {
        let t_refi = self.timing.t_refi;
        while self.next_refresh_cycle <= mem_now {
            let mem_cycle = self.next_refresh_cycle;
            self.refresh_at(mem_cycle);
            self.next_refresh_cycle += t_refi;
        }
    }

    fn refresh_at(&mut self, mem_cycle: Cycle) {
        let mut min_refresh = mem_cycle;
        for rank in &self.banks {
            for bank in rank {
                min_refresh = min_refresh.max(bank.min_pre_cycle.max(bank.last_cmd_cycle));
            }
        }
        let refresh_done = min_refresh + self.timing.t_rfc;
        debug_assert!(self.timing.t_rfc >= self.timing.t_rp);
        for rank in self.banks.iter_mut() {
            for bank in rank.iter_mut() {
                // PRE <-tRP-> ACT, so discount tRP from the refresh window.
                bank.min_pre_cycle = refresh_done - self.timing.t_rp;
                bank.open = false;
            }
        }
    }

    /// FR-FCFS: prefer writes when the write queue is filling (or we just
    /// wrote and it is non-trivially full), then pick the first bank-head
    /// request whose column command can issue at `cur_cycle`.
    /// Returns the next interesting memory cycle, or None when idle.
    fn try_schedule(&mut self, cur_cycle: Cycle) -> Option<Cycle> {
        let t = self.timing;
        if self.rd_order.is_empty() && self.wr_order.is_empty() {
            return None;
        }
        if cur_cycle + t.t_cl < self.min_resp_cycle {
            return Some(self.min_resp_cycle - t.t_cl); // too far ahead
        }

        let prio_writes = self.wr_order.len() > 3 * self.queue_depth / 4
            || (self.last_cmd_was_write && self.wr_order.len() > self.queue_depth / 4);
        let is_write_queue = self.rd_order.is_empty() || prio_writes;
        let order = if is_write_queue { &self.wr_order } else { &self.rd_order };

        let mut chosen: Option<(usize, usize)> = None;
        let mut min_sched_cycle = Cycle::MAX;
        for (pos, &id) in order.iter().enumerate() {
            if !self.is_bank_head(id) {
                continue;
            }
            let min_cmd = self.find_min_cmd_cycle(self.req(id));
            min_sched_cycle = min_sched_cycle.min(min_cmd);
            if min_cmd <= cur_cycle {
                chosen = Some((pos, id));
                break;
            }
        }
        let Some((pos, id)) = chosen else {
            // Nothing ready yet; refreshes commonly cause this.
            return Some(min_sched_cycle);
        };

        let r = *self.req(id);
        let mut min_cmd_cycle = cur_cycle.max(self.min_resp_cycle - t.t_cl);
        if self.last_cmd_was_write && !r.write {
            min_cmd_cycle = min_cmd_cycle.max(self.min_resp_cycle + t.t_wtr);
        }

        let mut row_hit = false;
        let mut act_record = None;
        let mut pre_record = None;
        {
            let window_min = self.rank_act_windows[r.loc.rank as usize].min_act_cycle();
            let bank = &mut self.banks[r.loc.rank as usize][r.loc.bank as usize];
            if bank.open && r.loc.row == bank.open_row {
                row_hit = true;
            } else {
                let pre_issued = bank.open;
                let pre_cycle = if !bank.open {
                    bank.min_pre_cycle
                } else {
                    r.arrival_cycle.max(bank.min_pre_cycle)
                };
                let mut act_cycle = r
                    .arrival_cycle
                    .max((pre_cycle + t.t_rp).max(bank.last_act_cycle + t.t_rrd));
                act_cycle = act_cycle.max(window_min + t.t_faw);

                bank.open = true;
                bank.open_row = r.loc.row;
                if pre_issued {
                    bank.min_pre_cycle = pre_cycle + t.t_ras;
                    pre_record = Some(pre_cycle);
                }
                bank.last_act_cycle = act_cycle;
                act_record = Some(act_cycle);
                min_cmd_cycle = min_cmd_cycle.max(act_cycle + t.t_rcd);
            }
        }
        if let Some(act) = act_record {
            self.rank_act_windows[r.loc.rank as usize].add_activation(act);
        }

        let cmd_cycle = min_cmd_cycle.max(self.min_resp_cycle - t.t_cl);
        self.min_resp_cycle = cmd_cycle + t.t_cl + r.data_size as u64;
        self.last_cmd_was_write = r.write;

        // Auto-precharge under closed-page policy when no queued row hit
        // follows; otherwise keep the row open for the streak.
        {
            let bank = &mut self.banks[r.loc.rank as usize][r.loc.bank as usize];
            let q = if self.deferred_writes && r.write { &bank.wr_q } else { &bank.rd_q };
            let next_is_row_hit = q
                .get(1)
                .map(|&nid| self.reqs[nid].as_ref().unwrap().row_hit_seq != 0)
                .unwrap_or(false);
            if self.closed_page && !next_is_row_hit {
                bank.open = false;
            }
            bank.min_pre_cycle = bank.min_pre_cycle.max(
                (bank.last_act_cycle + t.t_ras).max(if r.write {
                    self.min_resp_cycle + t.t_wr
                } else {
                    cmd_cycle + t.t_rtp
                }),
            );
            debug_assert!(bank.last_cmd_cycle < cmd_cycle);
            bank.last_cmd_cycle = cmd_cycle;
            bank.cur_row_hits = r.row_hit_seq;
        }

        if self.trace_commands {
            self.cmd_log.push(CmdRecord {
                rank: r.loc.rank,
                bank: r.loc.bank,
                row: r.loc.row,
                cmd_cycle,
                act_cycle: act_record,
                pre_cycle: pre_record,
                write: r.write,
                row_hit,
            });
        }

        let done_sys_cycle = self.mem_to_sys(self.min_resp_cycle) + self.controller_sys_latency;
        if r.write {
            let delay = done_sys_cycle.saturating_sub(r.start_sys_cycle);
            self.stats.writes += 1;
            self.stats.bytes_written += 16 * r.data_size as u64;
            self.stats.total_wr_lat += delay;
            if row_hit {
                self.stats.wr_row_hits += 1;
            }
        } else {
            let delay = done_sys_cycle.saturating_sub(r.start_sys_cycle);
            self.stats.reads += 1;
            self.stats.bytes_read += 16 * r.data_size as u64;
            self.stats.total_rd_lat += delay;
            if row_hit {
                self.stats.rd_row_hits += 1;
            }
            if self.collect_completions {
                self.completions.push(DdrCompletion {
                    addr: r.addr,
                    write: false,
                    done_sys_cycle,
                });
            }
        }

        // Dequeue.
        let order = if is_write_queue { &mut self.wr_order } else { &mut self.rd_order };
        order.remove(pos);
        {
            let bank = &mut self.banks[r.loc.rank as usize][r.loc.bank as usize];
            let q = if self.deferred_writes && r.write { &mut bank.wr_q } else { &mut bank.rd_q };
            let popped = q.pop_front();
            debug_assert_eq!(popped, Some(id));
        }
        self.reqs[id] = None;
        self.free_ids.push(id);

        if self.rd_order.is_empty() && self.wr_order.is_empty() {
            None
        } else {
            Some(self.min_resp_cycle - t.t_cl)
        }
    }
}

fn mem_to_sys_dur(mem_cycles: Cycle, sys_khz: u64, mem_khz: u64) -> Cycle {
    (mem_cycles * sys_khz).div_ceil(mem_khz)
}

impl crate::mem::backend::MemBackend for DdrMemory {
    /// Bound phase: MESI update, silent-writeback shortcut, optimistic
    /// response cycle, and a weave event queued for `tick`.
    fn access(&mut self, req: &mut MemRequest, _record: RecordKind, bursts: u32) -> Cycle {
        req.apply_mesi();
        debug_assert!(bursts % 2 == 0);

        if !self.warmup_done || req.op == CoherenceOp::PutShared {
            return req.cycle;
        }

        let is_write = req.op == CoherenceOp::PutExclusive;
        let resp_cycle = req.cycle
            + if is_write { self.min_wr_latency } else { self.min_rd_latency }
            + self.mem_to_sys_dur(bursts as u64 - 1);

        let ev = PendingAccess {
            addr: req.line_addr,
            write: is_write,
            data_size: bursts,
            start_sys_cycle: req.cycle + self.controller_sys_latency,
        };
        // Arrivals come in roughly increasing cycle order; insertion keeps
        // the pending list sorted for admission.
        let at = self
            .pending
            .partition_point(|p| p.start_sys_cycle <= ev.start_sys_cycle);
        self.pending.insert(at, ev);

        resp_cycle
    }

    /// Weave phase: admit due arrivals, run refreshes, then issue every
    /// column command schedulable up to `sys_cycle`. Returns the next
    /// system cycle at which this device wants a tick.
    fn tick(&mut self, sys_cycle: Cycle) -> Option<Cycle> {
        let mem_now = self.sys_to_mem(sys_cycle);
        self.run_refresh(mem_now);
        self.admit_pending(sys_cycle);

        let mut cur = self.next_sched_cycle.unwrap_or(mem_now).min(mem_now);
        let next_mem = loop {
            match self.try_schedule(cur) {
                None => {
                    // The last dequeue may have freed room for parked
                    // requests.
                    self.drain_overflow();
                    if self.rd_order.is_empty() && self.wr_order.is_empty() {
                        break None;
                    }
                }
                Some(c) => {
                    self.drain_overflow();
                    if c <= mem_now {
                        cur = c.max(cur + 1);
                    } else {
                        break Some(c);
                    }
                }
            }
        };
        self.next_sched_cycle = next_mem;

        let sched_sys = next_mem.map(|c| self.mem_to_sys(c).max(sys_cycle + 1));
        let pending_sys = self.pending.front().map(|p| p.start_sys_cycle.max(sys_cycle + 1));
        match (sched_sys, pending_sys) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        }
    }

    fn append_stats(&self, parent: &mut StatGroup) {
        let mut group = StatGroup::new(&self.name);
        group.add("rd", self.stats.reads);
        group.add("wr", self.stats.writes);
        group.add("tot_rd", self.stats.bytes_read);
        group.add("tot_wr", self.stats.bytes_written);
        group.add("rdlat", self.stats.total_rd_lat);
        group.add("wrlat", self.stats.total_wr_lat);
        group.add("rdhits", self.stats.rd_row_hits);
        group.add("wrhits", self.stats.wr_row_hits);
        parent.push_group(group);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
