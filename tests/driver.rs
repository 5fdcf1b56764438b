// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Seeded synthetic workloads run end to end.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use scx_walt::driver::Driver;
use scx_walt::driver::DriverOpts;
use scx_walt::driver::DriverReport;
use scx_walt::tracker::TaskLoad;
use scx_walt::Clock;
use scx_walt::CpuId;
use scx_walt::EnergyModel;
use scx_walt::ManualClock;
use scx_walt::Topology;
use scx_walt::Walt;
use scx_walt::WaltConfig;

mod common;

use common::setup_test;
use common::MS;

const CAPACITIES: [u64; 6] = [512, 512, 512, 512, 1024, 1024];

fn opts(seed: u64) -> DriverOpts {
    DriverOpts {
        duration_ns: 400 * MS,
        report_interval_ns: 100 * MS,
        nr_tasks: 10,
        seed,
        irq_pct: 2,
    }
}

fn simulate(cfg: WaltConfig, opts: DriverOpts) -> (Arc<Walt>, Arc<ManualClock>, DriverReport) {
    setup_test();
    let topo = Topology::new(&CAPACITIES).unwrap();
    let em = EnergyModel::synthetic(&topo);
    let clock = Arc::new(ManualClock::new(0));
    let walt = Walt::new(topo, cfg, Some(em), clock.clone()).unwrap();

    let report = Driver::new(&walt, &clock, opts)
        .unwrap()
        .run(&AtomicBool::new(false))
        .unwrap();
    (walt, clock, report)
}

#[test]
fn test_runnable_demand_is_conserved() {
    let cfg = WaltConfig {
        rotation_enable: true,
        ..WaltConfig::default()
    };
    let (walt, _clock, report) = simulate(cfg, opts(7));
    assert_eq!(report.elapsed_ns, 400 * MS);
    assert!(report.stats.placements() > 0);

    for cpu in walt.topology().cpus() {
        let expected: u64 = walt
            .runnable_tasks(cpu)
            .iter()
            .map(|id| walt.task_load(*id).unwrap().demand)
            .sum();
        let core = walt.core_load(cpu).unwrap();
        assert_eq!(core.cumulative_runnable_avg, expected, "{cpu}");
        assert!(!walt.is_reserved(cpu));
    }
    assert_eq!(report.stats.clock_anomalies, 0);
}

/// Window contributions of `task` as of the window starting at `ws`.
fn contributions(load: &TaskLoad, ws: u64, window: u64) -> (u64, u64) {
    let Some(mark_start) = load.mark_start else {
        return (0, 0);
    };
    let task_ws = mark_start / window * window;
    if task_ws == ws {
        (load.curr_window, load.prev_window)
    } else if task_ws + window == ws {
        (0, load.curr_window)
    } else {
        (0, 0)
    }
}

#[test]
fn test_window_sums_follow_resident_tasks() {
    setup_test();
    let cfg = WaltConfig {
        rotation_enable: true,
        ..WaltConfig::default()
    };
    let window = cfg.window_ns;
    let topo = Topology::new(&CAPACITIES).unwrap();
    let em = EnergyModel::synthetic(&topo);
    let clock = Arc::new(ManualClock::new(0));
    let walt = Walt::new(topo, cfg, Some(em), clock.clone()).unwrap();

    let mut driver = Driver::new(
        &walt,
        &clock,
        DriverOpts {
            irq_pct: 0,
            ..opts(5)
        },
    )
    .unwrap();
    driver.start().unwrap();

    let cpus: Vec<CpuId> = walt.topology().cpus().collect();
    let mut last_ws: Vec<Option<u64>> = cpus
        .iter()
        .map(|cpu| walt.core_load(*cpu).unwrap().window_start)
        .collect();

    for _ in 0..300 {
        driver.step();

        let loads: Vec<(CpuId, TaskLoad)> = walt
            .task_ids()
            .into_iter()
            .filter_map(|id| Some((walt.task_cpu(id)?, walt.task_load(id)?)))
            .collect();

        for (i, cpu) in cpus.iter().enumerate() {
            let core = walt.core_load(*cpu).unwrap();
            let ws = core.window_start.unwrap();

            let prev_ws = last_ws[i].unwrap();
            assert!(ws >= prev_ws, "{cpu} window went back");
            assert_eq!((ws - prev_ws) % window, 0, "{cpu}");
            last_ws[i] = Some(ws);

            let (curr, prev) = loads
                .iter()
                .filter(|(c, _)| c == cpu)
                .map(|(_, load)| contributions(load, ws, window))
                .fold((0, 0), |(c, p), (tc, tp)| (c + tc, p + tp));
            assert_eq!(core.curr_runnable_sum, curr, "{cpu} at {}", clock.now_ns());
            assert_eq!(core.prev_runnable_sum, prev, "{cpu} at {}", clock.now_ns());
            assert_eq!(core.migration_clamps, 0);
        }
    }
    assert!(walt.stats_snapshot().placements() > 0);
}

#[test]
fn test_windows_stay_aligned() {
    let (walt, clock, _report) = simulate(WaltConfig::default(), opts(3));
    let window = walt.config().window_ns;
    let now = clock.now_ns();

    let starts: Vec<Option<u64>> = walt
        .topology()
        .cpus()
        .map(|cpu| walt.core_load(cpu).unwrap().window_start)
        .collect();
    let first = starts[0].unwrap();
    assert!(starts.iter().all(|ws| *ws == Some(first)));
    assert_eq!(first % window, 0);
    assert!(now - first < window);
}

#[test]
fn test_same_seed_same_run() {
    let (_, _, a) = simulate(WaltConfig::default(), opts(11));
    let (_, _, b) = simulate(WaltConfig::default(), opts(11));

    assert_eq!(
        serde_json::to_value(&a.stats).unwrap(),
        serde_json::to_value(&b.stats).unwrap()
    );
    assert_eq!(
        serde_json::to_value(&a.tasks).unwrap(),
        serde_json::to_value(&b.tasks).unwrap()
    );
}

#[test]
fn test_driver_needs_tasks() {
    let topo = Topology::new(&CAPACITIES).unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let walt = Walt::new(topo, WaltConfig::default(), None, clock.clone()).unwrap();
    let opts = DriverOpts {
        nr_tasks: 0,
        ..DriverOpts::default()
    };
    assert!(Driver::new(&walt, &clock, opts).is_err());
}
