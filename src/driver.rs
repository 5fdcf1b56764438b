// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Deterministic workload driver.
//!
//! Plays the host scheduler against a [`Walt`] instance on a manual clock:
//! tasks alternate run bursts and sleeps, wakeups go through `select_cpu()`,
//! ticks drive misfit detection and each core round-robins its runnable
//! tasks at every tick. The same seed always yields the same run.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use serde::Serialize;

use crate::clock::Clock;
use crate::clock::ManualClock;
use crate::group::TOPAPP_NAME;
use crate::stats::CpuLoadStat;
use crate::stats::StatsSnapshot;
use crate::task::TaskSpec;
use crate::tracker::DequeueKind;
use crate::tracker::EnqueueKind;
use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::SchedClass;
use crate::types::TaskId;
use crate::types::TimeNs;
use crate::types::NSEC_PER_MSEC;
use crate::walt::SchedHooks;
use crate::walt::Walt;

const STEP_NS: TimeNs = NSEC_PER_MSEC;
const TOPAPP_GROUP: GroupId = GroupId(1);
const BACKGROUND_GROUP: GroupId = GroupId(2);

/// Run/sleep pattern of a simulated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    /// Never sleeps.
    CpuBound,
    /// Runs `run_ms` out of every `period_ms`.
    Periodic { run_ms: u64, period_ms: u64 },
    /// Short bursts separated by long sleeps.
    IoBound { run_ms: u64, sleep_ms: u64 },
}

impl Workload {
    fn random(rng: &mut StdRng) -> Workload {
        match rng.random_range(0..4) {
            0 => Workload::CpuBound,
            1 | 2 => {
                let period_ms = rng.random_range(4..=32);
                Workload::Periodic {
                    run_ms: rng.random_range(1..period_ms),
                    period_ms,
                }
            }
            _ => Workload::IoBound {
                run_ms: rng.random_range(1..=3),
                sleep_ms: rng.random_range(10..=60),
            },
        }
    }

    fn burst_ns(&self) -> TimeNs {
        match *self {
            Workload::CpuBound => TimeNs::MAX,
            Workload::Periodic { run_ms, .. } | Workload::IoBound { run_ms, .. } => {
                run_ms * NSEC_PER_MSEC
            }
        }
    }

    fn sleep_ns(&self) -> TimeNs {
        match *self {
            Workload::CpuBound => 0,
            Workload::Periodic { run_ms, period_ms } => (period_ms - run_ms) * NSEC_PER_MSEC,
            Workload::IoBound { sleep_ms, .. } => sleep_ms * NSEC_PER_MSEC,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverOpts {
    pub duration_ns: TimeNs,
    pub report_interval_ns: TimeNs,
    pub nr_tasks: usize,
    pub seed: u64,
    /// Chance per step and core of an interrupt, in percent.
    pub irq_pct: u32,
}

impl Default for DriverOpts {
    fn default() -> Self {
        DriverOpts {
            duration_ns: 1000 * NSEC_PER_MSEC,
            report_interval_ns: 100 * NSEC_PER_MSEC,
            nr_tasks: 8,
            seed: 0,
            irq_pct: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub workload: Workload,
    pub cpu: CpuId,
    pub demand_scale: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverReport {
    pub elapsed_ns: TimeNs,
    pub stats: StatsSnapshot,
    pub cpuload: Vec<CpuLoadStat>,
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug)]
struct SimTask {
    workload: Workload,
    /// Remaining run time of the current burst.
    remaining: TimeNs,
    /// Wake up time while sleeping.
    wake_at: Option<TimeNs>,
}

pub struct Driver<'a> {
    walt: &'a Walt,
    clock: &'a ManualClock,
    opts: DriverOpts,
    rng: StdRng,
    tasks: BTreeMap<TaskId, SimTask>,
    start: TimeNs,
    next_tick: TimeNs,
    next_report: TimeNs,
}

impl<'a> Driver<'a> {
    pub fn new(walt: &'a Walt, clock: &'a ManualClock, opts: DriverOpts) -> Result<Driver<'a>> {
        if opts.nr_tasks == 0 {
            bail!("At least one task is required");
        }
        let rng = StdRng::seed_from_u64(opts.seed);
        Ok(Driver {
            walt,
            clock,
            opts,
            rng,
            tasks: BTreeMap::new(),
            start: 0,
            next_tick: 0,
            next_report: 0,
        })
    }

    fn fork_tasks(&mut self) -> Result<()> {
        self.walt.group_online(TOPAPP_GROUP, TOPAPP_NAME);
        self.walt.group_online(BACKGROUND_GROUP, "background");

        let nr_cpus = self.walt.nr_cpus();
        for i in 0..self.opts.nr_tasks {
            let id = TaskId(i as u64 + 1);
            let workload = Workload::random(&mut self.rng);
            let spec = TaskSpec {
                group: Some(if i % 3 == 0 { TOPAPP_GROUP } else { BACKGROUND_GROUP }),
                class: if i % 8 == 7 {
                    SchedClass::Rt {
                        prio: self.rng.random_range(1..99),
                    }
                } else {
                    SchedClass::Fair
                },
                latency_sensitive: i % 5 == 0,
                ..Default::default()
            };

            self.walt.task_forked(id, CpuId(i % nr_cpus), spec)?;
            debug!("forked {id} as {:?}", workload);
            self.tasks.insert(
                id,
                SimTask {
                    workload,
                    remaining: 0,
                    wake_at: Some(self.clock.now_ns()),
                },
            );
        }
        Ok(())
    }

    fn wake(&mut self, id: TaskId) {
        let Some(prev) = self.walt.task_cpu(id) else {
            return;
        };
        self.walt.task_woken(id);
        let cpu = self.walt.select_cpu(id, prev, None);
        self.walt.task_enqueued(cpu, id, EnqueueKind::Wakeup);

        if let Some(task) = self.tasks.get_mut(&id) {
            task.remaining = task.workload.burst_ns();
            task.wake_at = None;
        }
    }

    /// Next runnable task on `cpu` after `after`, wrapping around.
    fn next_runnable(&self, cpu: CpuId, after: Option<TaskId>) -> Option<TaskId> {
        let runnable = self.walt.runnable_tasks(cpu);
        match after {
            Some(after) => runnable
                .iter()
                .copied()
                .find(|id| *id > after)
                .or_else(|| runnable.first().copied()),
            None => runnable.first().copied(),
        }
    }

    /// Charge one step to every running task and put finished bursts to
    /// sleep.
    fn run_step(&mut self, now: TimeNs) {
        for cpu in self.walt.topology().cpus() {
            let Some(curr) = self.walt.curr_task(cpu) else {
                continue;
            };
            let Some(task) = self.tasks.get_mut(&curr) else {
                continue;
            };
            task.remaining = task.remaining.saturating_sub(STEP_NS);
            if task.remaining > 0 {
                continue;
            }

            task.wake_at = Some(now + task.workload.sleep_ns());
            self.walt.task_dequeued(cpu, curr, DequeueKind::Sleep);
            let next = self.next_runnable(cpu, Some(curr));
            self.walt.context_switch(cpu, Some(curr), next);
        }
    }

    fn fill_idle(&self) {
        for cpu in self.walt.topology().cpus() {
            if self.walt.curr_task(cpu).is_none() {
                if let Some(next) = self.next_runnable(cpu, None) {
                    self.walt.context_switch(cpu, None, Some(next));
                }
            }
        }
    }

    fn tick(&self) {
        let cpus: Vec<CpuId> = self.walt.topology().cpus().collect();
        for cpu in cpus.iter() {
            self.walt.tick(*cpu);
        }
        self.walt.quiesce();

        for cpu in cpus.iter() {
            let curr = self.walt.curr_task(*cpu);
            let next = self.next_runnable(*cpu, curr);
            if next.is_some() && next != curr {
                self.walt.context_switch(*cpu, curr, next);
            }
        }
    }

    fn maybe_irq(&mut self) {
        for cpu in self.walt.topology().cpus() {
            if self.rng.random_range(0..100) < self.opts.irq_pct {
                let delta = self.rng.random_range(20_000..200_000);
                self.walt.irq_time_charged(cpu, delta);
            }
        }
    }

    fn report_load(&self) {
        let loads: Vec<String> = self
            .walt
            .cpuload()
            .iter()
            .map(|l| format!("{}:{}/{}", l.cpu.0, l.cpu_load, l.running_tasks))
            .collect();
        let stats = self.walt.stats_snapshot();
        info!(
            "load[{}] placements={} misfit_ticks={} active_balance={}/{} rotation={}/{}",
            loads.join(" "),
            stats.placements(),
            stats.misfit_ticks,
            stats.active_balance_done,
            stats.active_balance_issued,
            stats.rotation_done,
            stats.rotation_issued,
        );
    }

    /// Activate the tracker and fork the workload at the current time.
    pub fn start(&mut self) -> Result<()> {
        self.start = self.clock.now_ns();
        self.walt.activate();
        self.fork_tasks()?;

        self.next_tick = self.start + self.walt.config().tick_ns;
        self.next_report = self.start + self.opts.report_interval_ns;
        Ok(())
    }

    /// Advance the simulation by one step. Every migration issued by a tick
    /// has completed on return. Returns the new time.
    pub fn step(&mut self) -> TimeNs {
        let now = self.clock.now_ns();
        let waking: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.wake_at.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in waking {
            self.wake(id);
        }
        self.fill_idle();

        let now = self.clock.advance(STEP_NS);
        self.run_step(now);
        self.maybe_irq();

        if now >= self.next_tick {
            self.tick();
            self.next_tick += self.walt.config().tick_ns;
        }
        if now >= self.next_report {
            self.report_load();
            self.next_report += self.opts.report_interval_ns;
        }
        now
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<DriverReport> {
        self.start()?;
        let end = self.start.saturating_add(self.opts.duration_ns);

        let mut now = self.start;
        while now < end && !shutdown.load(Ordering::Relaxed) {
            now = self.step();
        }

        self.walt.quiesce();
        Ok(self.report(now - self.start))
    }

    pub fn report(&self, elapsed_ns: TimeNs) -> DriverReport {
        let tasks = self
            .tasks
            .iter()
            .filter_map(|(id, t)| {
                Some(TaskReport {
                    id: *id,
                    workload: t.workload,
                    cpu: self.walt.task_cpu(*id)?,
                    demand_scale: self.walt.task_utilization(*id),
                })
            })
            .collect();

        DriverReport {
            elapsed_ns,
            stats: self.walt.stats_snapshot(),
            cpuload: self.walt.cpuload(),
            tasks,
        }
    }
}
