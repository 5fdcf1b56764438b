// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
#![allow(dead_code)]

use std::sync::Arc;

use scx_walt::tracker::EnqueueKind;
use scx_walt::Clock;
use scx_walt::CpuId;
use scx_walt::EnergyModel;
use scx_walt::ManualClock;
use scx_walt::SchedHooks;
use scx_walt::TaskId;
use scx_walt::TaskSpec;
use scx_walt::Topology;
use scx_walt::Walt;
use scx_walt::WaltConfig;

pub const MS: u64 = 1_000_000;

/// Initialize logging once per test binary. Later calls are ignored.
pub fn setup_test() {
    let _ = simplelog::TestLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

/// An activated tracker on a manual clock starting at zero.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub walt: Arc<Walt>,
}

impl Harness {
    /// Tracker with the synthetic energy model of `capacities`.
    pub fn new(capacities: &[u64], cfg: WaltConfig) -> Harness {
        let topo = Topology::new(capacities).unwrap();
        let em = EnergyModel::synthetic(&topo);
        Harness::with_energy(topo, cfg, Some(em))
    }

    pub fn with_energy(topo: Topology, cfg: WaltConfig, em: Option<EnergyModel>) -> Harness {
        setup_test();
        let clock = Arc::new(ManualClock::new(0));
        let walt = Walt::new(topo, cfg, em, clock.clone()).unwrap();
        walt.activate();
        Harness { clock, walt }
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Fork task `id` on `cpu` and switch to it right away.
    pub fn spawn_running(&self, id: u64, cpu: usize) -> TaskId {
        self.spawn_running_with(id, cpu, TaskSpec::default())
    }

    pub fn spawn_running_with(&self, id: u64, cpu: usize, spec: TaskSpec) -> TaskId {
        let (id, cpu) = (TaskId(id), CpuId(cpu));
        self.walt.task_forked(id, cpu, spec).unwrap();
        self.walt.task_woken(id);
        self.walt.task_enqueued(cpu, id, EnqueueKind::Wakeup);
        let curr = self.walt.curr_task(cpu);
        self.walt.context_switch(cpu, curr, Some(id));
        id
    }

    /// Advance to `until`, ticking every core at each tick boundary on the
    /// way and waiting for the resulting migrations.
    pub fn run_until(&self, until: u64) {
        let tick = self.walt.config().tick_ns;
        loop {
            let now = self.now();
            if now >= until {
                break;
            }
            let next = (now / tick + 1) * tick;
            self.clock.set(next.min(until));
            if next <= until {
                for cpu in self.walt.topology().cpus() {
                    self.walt.tick(cpu);
                }
                self.walt.quiesce();
            }
        }
    }
}
