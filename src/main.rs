// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;

use scx_walt::driver::Driver;
use scx_walt::driver::DriverOpts;
use scx_walt::types::NSEC_PER_MSEC;
use scx_walt::EnergyModel;
use scx_walt::ManualClock;
use scx_walt::Topology;
use scx_walt::Walt;
use scx_walt::WaltConfig;

/// scx_walt: window-assisted load tracking with energy-aware placement.
///
/// Runs a seeded synthetic workload on a simulated heterogeneous system and
/// reports per-core load, placement decisions and forced migrations. Tasks
/// alternate between run bursts and sleeps; every wakeup is placed by the
/// energy-aware selector and misfit tasks are pushed to bigger cores.
#[derive(Debug, Parser)]
struct Opts {
    /// Original capacity of each CPU, in CPU id order. CPUs sharing a
    /// capacity form a cluster.
    #[clap(
        short = 'c',
        long,
        value_delimiter = ',',
        default_value = "512,512,512,512,768,768,768,1024"
    )]
    capacities: Vec<u64>,

    /// Tracker configuration, inline JSON or "f:PATH".
    #[clap(short = 'C', long)]
    config: Option<String>,

    /// Energy model, inline JSON or "f:PATH". A synthetic model derived
    /// from the capacities is used when not given.
    #[clap(short = 'e', long)]
    energy_model: Option<String>,

    /// Run without an energy model. Placement falls back to the previous
    /// CPU or the least loaded allowed CPU.
    #[clap(long, action = clap::ArgAction::SetTrue, conflicts_with = "energy_model")]
    no_energy_model: bool,

    /// Simulated duration in milliseconds.
    #[clap(short = 'd', long, default_value = "1000")]
    duration_ms: u64,

    /// Load report interval in milliseconds.
    #[clap(short = 'i', long, default_value = "100")]
    interval_ms: u64,

    /// Number of simulated tasks.
    #[clap(short = 't', long, default_value = "12")]
    tasks: usize,

    /// Workload seed. The same seed always produces the same run.
    #[clap(short = 's', long, default_value = "0")]
    seed: u64,

    /// Chance per millisecond and CPU of an interrupt, in percent.
    #[clap(long, default_value = "2")]
    irq_pct: u32,

    /// Enable rotation of starved misfit tasks with long-running tasks on
    /// bigger CPUs.
    #[clap(short = 'r', long, action = clap::ArgAction::SetTrue)]
    rotation: bool,

    /// Write the final report as JSON to this file.
    #[clap(long)]
    dump_json: Option<String>,

    /// Enable verbose output, including placement and migration traces.
    /// Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
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

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let topo = Topology::new(&opts.capacities)?;
    let mut cfg = match opts.config.as_ref() {
        Some(input) => WaltConfig::parse(input)?,
        None => WaltConfig::default(),
    };
    if opts.rotation {
        cfg.rotation_enable = true;
    }

    let energy = if opts.no_energy_model {
        None
    } else {
        Some(match opts.energy_model.as_ref() {
            Some(input) => EnergyModel::parse(topo.nr_cpus(), input)?,
            None => EnergyModel::synthetic(&topo),
        })
    };
    if let Some(em) = energy.as_ref() {
        info!("Energy model:\n{}", em);
    }

    let clock = Arc::new(ManualClock::new(0));
    let walt = Walt::new(topo, cfg, energy, clock.clone())?;

    let driver_opts = DriverOpts {
        duration_ns: opts.duration_ms.saturating_mul(NSEC_PER_MSEC),
        report_interval_ns: opts.interval_ms.max(1) * NSEC_PER_MSEC,
        nr_tasks: opts.tasks,
        seed: opts.seed,
        irq_pct: opts.irq_pct,
    };
    let report = Driver::new(&walt, &clock, driver_opts)?.run(&shutdown)?;

    info!(
        "Done after {}ms: {} placements, {} active balances, {} rotations, {} clock anomalies",
        report.elapsed_ns / NSEC_PER_MSEC,
        report.stats.placements(),
        report.stats.active_balance_done,
        report.stats.rotation_done,
        report.stats.clock_anomalies,
    );

    if let Some(path) = opts.dump_json.as_ref() {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("Failed to write report to {path:?}"))?;
        info!("Report written to {}", path);
    }

    Ok(())
}
