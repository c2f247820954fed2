use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use stratus::config::StratusConfig;
use stratus::mem::request::{CoherenceOp, MemRequest};
use stratus::mem::{MemoryController, SimContext};
use stratus::stats::StatGroup;
use stratus::trace::read_trace;

#[derive(Parser)]
#[command(version, about)]
struct StratusArgs {
    config_path: PathBuf,
    output_dir: PathBuf,

    /// Suffix appended to output file names.
    #[arg(long)]
    suffix: Option<String>,

    /// Replay a previously captured access trace through controller 0.
    #[arg(long)]
    replay: Option<PathBuf>,
}

const TICK_INTERVAL: u64 = 1000;

fn main() -> Result<()> {
    env_logger::init();
    let argv = StratusArgs::parse();

    let cfg = StratusConfig::from_path(&argv.config_path)
        .with_context(|| format!("loading {}", argv.config_path.display()))?;
    let ctx = SimContext {
        line_size: 64,
        sys_freq_mhz: cfg.sim.sys_freq_mhz,
        warmup_done: true,
    };

    std::fs::create_dir_all(&argv.output_dir)
        .with_context(|| format!("creating {}", argv.output_dir.display()))?;

    let mut controllers = Vec::new();
    for i in 0..cfg.mem.controllers.max(1) {
        let name = format!("mem-{i}");
        controllers.push(MemoryController::new(&name, i, &cfg, &ctx)?);
    }
    info!(
        "built {} controller(s), scheme {:?}",
        controllers.len(),
        controllers[0].scheme_kind()
    );

    if let Some(trace_path) = &argv.replay {
        let entries = read_trace(trace_path)
            .with_context(|| format!("reading {}", trace_path.display()))?;
        info!("replaying {} accesses from {}", entries.len(), trace_path.display());
        let mut cycle = 0u64;
        let mut last_tick = 0u64;
        for (addr, is_write) in entries {
            let op = if is_write { CoherenceOp::PutExclusive } else { CoherenceOp::GetShared };
            let mut req = MemRequest::new(addr, op, cycle);
            let done = controllers[0].access(&mut req);
            // Pace the request stream by the observed latency.
            cycle = cycle.max(done.saturating_sub(64)) + 1;
            if cycle - last_tick >= TICK_INTERVAL {
                for mc in &controllers {
                    mc.tick(cycle);
                }
                last_tick = cycle;
            }
        }
        for mc in &controllers {
            mc.tick(cycle + TICK_INTERVAL);
        }
        info!("replay finished at cycle {cycle}");
    }

    let mut root = StatGroup::new("mem");
    for mc in &controllers {
        mc.init_stats(&mut root);
    }
    let suffix = argv.suffix.as_deref().unwrap_or("");
    let stats_path = argv.output_dir.join(format!("stats{suffix}.toml"));
    let rendered = toml::to_string_pretty(&root).context("serializing stats")?;
    std::fs::write(&stats_path, rendered)
        .with_context(|| format!("writing {}", stats_path.display()))?;
    info!("stats written to {}", stats_path.display());

    Ok(())
}
