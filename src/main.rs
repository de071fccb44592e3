// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use scx_bsd4::config::read_json;
use scx_bsd4::sim::Sim;
use scx_bsd4::sim::SimConfig;
use scx_bsd4::sim::Workload;
use scx_bsd4::TopologySpec;

/// scx_bsd4: a per-CPU user process scheduler after the classic bsd4 usched
///
/// Entities wait on 32 priority buckets per class. Each CPU designates at
/// most one current entity and a per-CPU Helper Task picks the next one when
/// the CPU goes idle or is asked to reschedule. Placement prefers fully idle
/// cores, then parked CPUs, then CPUs running something worse.
///
/// Priorities follow nice and estcpu, a decayed estimate of recent cpu use.
/// A slower batch score keeps interactive entities ahead of cpu hogs.
///
/// This binary drives the scheduler from a deterministic tick loop over a
/// configurable set of synthetic workloads and reports per-entity cpu time
/// and scheduler event counters.
#[derive(Debug, Parser)]
struct Opts {
    /// Simulation config. Either inline JSON or a file prefixed with "f:".
    #[clap(short = 'c', long)]
    config: Option<String>,

    /// Workload list overriding the one in the config. Either inline JSON
    /// or a file prefixed with "f:".
    #[clap(short = 'w', long)]
    workloads: Option<String>,

    /// Number of packages in a synthetic topology.
    #[clap(long, requires = "cores")]
    packages: Option<usize>,

    /// Number of cores per package in a synthetic topology.
    #[clap(long)]
    cores: Option<usize>,

    /// Number of hardware threads per core in a synthetic topology.
    #[clap(long, default_value = "1")]
    threads: usize,

    /// Read the topology from this sysfs root (e.g. /sys).
    #[clap(long, conflicts_with = "cores")]
    sysfs: Option<PathBuf>,

    /// Use the cache-aware candidate selector.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    cache_coherent: bool,

    /// Enable SMT-aware placement.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    smt: bool,

    /// Set a tunable, e.g. --knob rrinterval=10. May be repeated.
    #[clap(short = 'k', long)]
    knob: Vec<String>,

    /// Number of ticks to simulate. Overrides the config.
    #[clap(short = 't', long)]
    ticks: Option<u64>,

    /// Print an interim report every this many ticks. 0 disables.
    #[clap(short = 'i', long, default_value = "0")]
    report_interval: u64,

    /// Print the final report as JSON.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,

    /// Print the effective config as JSON and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_config: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn build_config(opts: &Opts) -> Result<SimConfig> {
    let mut cfg = match &opts.config {
        Some(input) => SimConfig::parse(input).context("Failed to load config")?,
        None => SimConfig::default(),
    };

    if let Some(input) = &opts.workloads {
        cfg.workloads = read_json::<Vec<Workload>>(input).context("Failed to load workloads")?;
    }
    if let Some(root) = &opts.sysfs {
        cfg.sched.topology = TopologySpec::Sysfs { root: root.clone() };
    } else if let Some(cores) = opts.cores {
        cfg.sched.topology = TopologySpec::Synthetic {
            packages: opts.packages.unwrap_or(1),
            cores,
            threads: opts.threads,
        };
    }
    if opts.cache_coherent {
        cfg.sched.cache_coherent = true;
    }
    if opts.smt {
        cfg.sched.tunables.smt = true;
    }
    if let Some(ticks) = opts.ticks {
        cfg.ticks = ticks;
    }
    cfg.sched.validate()?;
    Ok(cfg)
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let cfg = build_config(&opts)?;
    if opts.dump_config {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let mut sim = Sim::from_config(&cfg)?;
    for knob in opts.knob.iter() {
        sim.sched()
            .tunables()
            .set_knob(knob)
            .with_context(|| format!("Invalid knob {:?}", knob))?;
    }
    info!("bsd4: tunables {:?}", sim.sched().tunables().snapshot());

    let chunk = match opts.report_interval {
        0 => cfg.ticks,
        n => n,
    };
    let mut stdout = std::io::stdout();
    let mut prev = sim.sched().stats();
    while sim.tick() < cfg.ticks && !shutdown.load(Ordering::Relaxed) {
        let ticks = chunk.min(cfg.ticks - sim.tick());
        sim.run(ticks, Some(&shutdown));
        if opts.report_interval > 0 && sim.tick() < cfg.ticks && !opts.json {
            // Interim reports show the counters of the last interval only.
            let mut report = sim.report();
            let cur = report.stats.clone();
            report.stats = cur.delta(&prev);
            prev = cur;
            report.format(&mut stdout)?;
            writeln!(stdout)?;
        }
    }

    let report = sim.report();
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.format(&mut stdout)?;
    }
    info!("bsd4: simulated {} ticks", report.ticks);
    Ok(())
}
