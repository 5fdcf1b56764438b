// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Energy-aware placement
//!
//! Placement decisions are computed from a point-in-time snapshot of every
//! core ([`CpuSnapshot`]) and of the task being placed ([`TaskView`]). The
//! snapshot is taken one core at a time without holding more than one core
//! lock, so the result may be stale by the time it is acted upon. That is
//! fine: a placement is a hint, and the paths that move running tasks
//! re-validate under the real locks.
//!
//! Fair tasks go through [`select_cpu_fair`]:
//!
//! 1. A sync wakeup from a little core whose waker is about to block may
//!    stay on the waker's core.
//!
//! 2. Per performance domain, the core with the most spare capacity and the
//!    previous core are evaluated for the energy they would add to the
//!    domain.
//!
//! 3. The previous core is kept unless the best candidate saves more than
//!    1/16 (by default) of the energy involved. Energy ties favor the
//!    smaller cluster, or for boosted tasks a less loaded core in the same
//!    cluster.
//!
//! When nothing fits anywhere the system is overutilized and
//! [`select_fallback`] picks the biggest idle core or the busy core with the
//! most room. RT tasks go through [`select_cpu_rt`].

use log::trace;
use serde::Serialize;

use crate::config::WaltConfig;
use crate::cpumask::Cpumask;
use crate::energy::EnergyModel;
use crate::energy::PerfDomain;
use crate::topology::Topology;
use crate::types::CpuId;
use crate::types::TaskId;
use crate::types::SCHED_CAPACITY_SCALE;
use crate::uclamp::group_boosted_util;
use crate::uclamp::rq_util_with;
use crate::uclamp::task_util;
use crate::uclamp::RqClampValues;
use crate::uclamp::UclampReq;

/// `util` fits `capacity` with `margin` (in 1/1024 units) of headroom.
pub fn fits_capacity(util: u64, capacity: u64, margin: u64) -> bool {
    util * margin < capacity * SCHED_CAPACITY_SCALE
}

/// Placement-relevant state of one core.
#[derive(Debug, Clone)]
pub struct CpuSnapshot {
    pub cpu: CpuId,
    pub online: bool,
    pub reserved: bool,
    pub capacity_orig: u64,
    pub thermal_pressure: u64,
    /// Utilization of the runnable demand.
    pub cpu_util: u64,
    /// Utilization without the task being placed.
    pub wake_util: u64,
    pub is_idle: bool,
    pub nr_running: usize,
    pub exit_latency: u32,
    pub clamp: RqClampValues,
    pub curr_rt_prio: Option<u32>,
    pub highest_rt_prio: Option<u32>,
}

impl CpuSnapshot {
    pub fn capacity(&self) -> u64 {
        self.capacity_orig.saturating_sub(self.thermal_pressure)
    }
}

/// Placement-relevant state of the task being placed.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub id: TaskId,
    /// Tracked demand in capacity units.
    pub util: u64,
    pub uclamp: UclampReq,
    /// Group boost in percent.
    pub boost: u32,
    pub affinity: Cpumask,
    pub latency_sensitive: bool,
    pub rt_prio: Option<u32>,
}

impl TaskView {
    /// Demand with the task's own utilization clamps applied.
    pub fn clamped_util(&self, cfg: &WaltConfig) -> u64 {
        task_util(self.util, &self.uclamp, cfg)
    }

    /// Demand used to size the task against a core.
    pub fn placement_util(&self, cfg: &WaltConfig) -> u64 {
        group_boosted_util(self.clamped_util(cfg), self.boost)
    }

    pub fn boosted(&self) -> bool {
        self.uclamp.boosted() || self.boost > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlacementReason {
    SyncWaker,
    Blocked,
    LatencySensitive,
    EnergyEfficient,
    PrevCpu,
    Overutilized,
    NoEnergyModel,
    Rt,
    RtStay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub cpu: CpuId,
    pub reason: PlacementReason,
}

impl Placement {
    fn new(cpu: CpuId, reason: PlacementReason) -> Placement {
        trace!("placement: {cpu} {reason:?}");
        Placement { cpu, reason }
    }
}

pub struct PlacementEnv<'a> {
    pub topo: &'a Topology,
    pub energy: Option<&'a EnergyModel>,
    pub cfg: &'a WaltConfig,
    /// Some task carries a non-default clamp.
    pub uclamp_used: bool,
    /// Indexed by core id.
    pub cpus: &'a [CpuSnapshot],
}

impl PlacementEnv<'_> {
    fn snap(&self, cpu: CpuId) -> Option<&CpuSnapshot> {
        self.cpus.get(cpu.0)
    }

    /// Snapshot of `cpu` if the task may be placed there at all.
    fn usable(&self, task: &TaskView, cpu: CpuId) -> Option<&CpuSnapshot> {
        self.snap(cpu)
            .filter(|snap| snap.online && !snap.reserved && task.affinity.test_cpu(cpu.0))
    }

    /// Utilization of `snap` with `task` added, clamped by both the task's
    /// and the runqueue's requests.
    fn util_with(&self, snap: &CpuSnapshot, task: &TaskView, util: u64) -> u64 {
        rq_util_with(snap.clamp, util, Some(&task.uclamp), self.uclamp_used, self.cfg)
    }

    fn task_can_place_on(&self, task: &TaskView, snap: &CpuSnapshot) -> bool {
        // An idle big core takes anything.
        if snap.is_idle && self.topo.is_max_capacity_cpu(snap.cpu) {
            return true;
        }
        let util = self.util_with(snap, task, snap.wake_util + task.placement_util(self.cfg));
        fits_capacity(util, snap.capacity(), self.cfg.fair_cap_margin)
    }

    /// Energy spent by `pd` with the task placed on `dst`, or with the task
    /// nowhere in the domain.
    fn compute_energy(&self, pd: &PerfDomain, task: &TaskView, dst: Option<CpuId>) -> u64 {
        let mut max_util = 0;
        let mut sum_util = 0;
        let mut allowed_cap = None;

        for cpu in pd.span.iter() {
            let Some(snap) = self.snap(CpuId(cpu)).filter(|snap| snap.online) else {
                continue;
            };
            let with_task = dst == Some(snap.cpu);
            let util = if with_task {
                snap.wake_util + task.util
            } else {
                snap.wake_util
            };
            let cap = snap.capacity();
            allowed_cap = Some(allowed_cap.map_or(cap, |c: u64| c.min(cap)));

            sum_util += util.min(cap);
            let freq_util = rq_util_with(
                snap.clamp,
                util,
                with_task.then_some(&task.uclamp),
                self.uclamp_used,
                self.cfg,
            );
            max_util = max_util.max(freq_util.min(cap));
        }

        match allowed_cap {
            Some(cap) => pd.compute_energy(max_util, sum_util, cap),
            None => 0,
        }
    }
}

/// Core to use when energy-aware placement has no answer: the biggest idle
/// core, else the busy core with the most spare capacity.
pub fn select_fallback(env: &PlacementEnv, task: &TaskView, prev: CpuId) -> CpuId {
    let mut best_idle: Option<&CpuSnapshot> = None;
    let mut best_busy: Option<(i64, &CpuSnapshot)> = None;

    for snap in env.cpus.iter() {
        if env.usable(task, snap.cpu).is_none() {
            continue;
        }

        if snap.is_idle {
            let better = best_idle.map_or(true, |best| {
                snap.capacity_orig > best.capacity_orig
                    || (snap.capacity_orig == best.capacity_orig
                        && snap.exit_latency < best.exit_latency)
            });
            if better {
                best_idle = Some(snap);
            }
            continue;
        }

        // Negative once the core is oversubscribed.
        let spare = snap.capacity() as i64 - snap.wake_util as i64;
        let better = best_busy.map_or(true, |(best_spare, best)| {
            spare > best_spare || (spare == best_spare && snap.nr_running < best.nr_running)
        });
        if better {
            best_busy = Some((spare, snap));
        }
    }

    if let Some(snap) = best_idle.or(best_busy.map(|(_, snap)| snap)) {
        return snap.cpu;
    }

    if env.usable(task, prev).is_some() {
        return prev;
    }
    env.cpus
        .iter()
        .find(|snap| snap.online && task.affinity.test_cpu(snap.cpu.0))
        .map(|snap| snap.cpu)
        .unwrap_or(prev)
}

/// Choose a core for a waking fair task last run on `prev`. `sync_waker` is
/// the waker's core when the waker is about to block.
pub fn select_cpu_fair(
    env: &PlacementEnv,
    task: &TaskView,
    prev: CpuId,
    sync_waker: Option<CpuId>,
) -> Placement {
    let cfg = env.cfg;
    let topo = env.topo;
    let task_util = task.placement_util(cfg);

    if let Some(waker) = sync_waker {
        if let Some(snap) = env.usable(task, waker) {
            if snap.nr_running == 1
                && topo.is_min_capacity_cpu(waker)
                && env.task_can_place_on(task, snap)
            {
                return Placement::new(waker, PlacementReason::SyncWaker);
            }
        }
    }

    let Some(em) = env.energy else {
        return Placement::new(
            select_fallback(env, task, prev),
            PlacementReason::NoEnergyModel,
        );
    };

    let mut best: Option<(CpuId, u64)> = None;
    let mut prev_delta: Option<u64> = None;
    let mut base_energy: u64 = 0;
    let mut best_idle_ls: Option<&CpuSnapshot> = None;
    let mut max_spare_ls: Option<(u64, CpuId)> = None;

    for pd in em.perf_doms.values() {
        let mut max_spare = 0;
        let mut max_spare_cpu = None;
        let mut prev_in_pd = false;

        for cpu in pd.span.iter().map(CpuId) {
            let Some(snap) = env.usable(task, cpu) else {
                continue;
            };

            let util = snap.wake_util + task_util;
            let cap = snap.capacity();
            let spare = cap.saturating_sub(util);
            let big_is_idle = snap.is_idle && topo.is_max_capacity_cpu(cpu);

            if !big_is_idle && !fits_capacity(env.util_with(snap, task, util), cap, cfg.fair_cap_margin)
            {
                continue;
            }

            if task.uclamp.blocked() && topo.is_min_capacity_cpu(cpu) {
                return Placement::new(cpu, PlacementReason::Blocked);
            }

            if task.latency_sensitive {
                if snap.is_idle {
                    let better = best_idle_ls.map_or(true, |best| {
                        snap.capacity_orig < best.capacity_orig
                            || (snap.capacity_orig == best.capacity_orig
                                && snap.exit_latency < best.exit_latency)
                    });
                    if better {
                        best_idle_ls = Some(snap);
                    }
                    if best_idle_ls.map(|best| best.cpu) == Some(prev) {
                        return Placement::new(prev, PlacementReason::LatencySensitive);
                    }
                } else if spare > max_spare_ls.map_or(0, |(spare, _)| spare) {
                    max_spare_ls = Some((spare, cpu));
                }
                continue;
            }

            if cpu == prev {
                prev_in_pd = true;
                continue;
            }

            if spare > max_spare || (spare == 0 && big_is_idle && max_spare == 0) {
                max_spare = spare;
                max_spare_cpu = Some(cpu);
            }
        }

        if task.latency_sensitive || (!prev_in_pd && max_spare_cpu.is_none()) {
            continue;
        }

        let base_energy_pd = env.compute_energy(pd, task, None);
        base_energy += base_energy_pd;

        if prev_in_pd {
            let delta = env
                .compute_energy(pd, task, Some(prev))
                .saturating_sub(base_energy_pd);
            prev_delta = Some(delta);
        }

        if let Some(cpu) = max_spare_cpu {
            let delta = env
                .compute_energy(pd, task, Some(cpu))
                .saturating_sub(base_energy_pd);
            if best.map_or(true, |(_, best_delta)| delta <= best_delta) {
                best = Some((cpu, delta));
            }
        }
    }

    if task.latency_sensitive {
        if let Some(snap) = best_idle_ls {
            return Placement::new(snap.cpu, PlacementReason::LatencySensitive);
        }
        if let Some((_, cpu)) = max_spare_ls {
            return Placement::new(cpu, PlacementReason::LatencySensitive);
        }
        return Placement::new(
            select_fallback(env, task, prev),
            PlacementReason::Overutilized,
        );
    }

    let Some(prev_delta) = prev_delta else {
        return match best {
            Some((cpu, _)) => Placement::new(cpu, PlacementReason::EnergyEfficient),
            None => Placement::new(
                select_fallback(env, task, prev),
                PlacementReason::Overutilized,
            ),
        };
    };

    let Some((best_cpu, best_delta)) = best.filter(|(cpu, delta)| *cpu != prev && *delta <= prev_delta)
    else {
        return Placement::new(prev, PlacementReason::PrevCpu);
    };

    let margin = (prev_delta + base_energy) >> cfg.energy_hysteresis_shift;
    if prev_delta - best_delta > margin {
        return Placement::new(best_cpu, PlacementReason::EnergyEfficient);
    }

    // Within the hysteresis band.
    if let (Some(best_snap), Some(prev_snap)) = (env.snap(best_cpu), env.snap(prev)) {
        let pick_best = if task.boosted() {
            best_snap.capacity_orig == prev_snap.capacity_orig
                && best_snap.wake_util < prev_snap.wake_util
        } else {
            prev_snap.capacity_orig > best_snap.capacity_orig
        };
        if pick_best {
            return Placement::new(best_cpu, PlacementReason::EnergyEfficient);
        }
    }

    Placement::new(prev, PlacementReason::PrevCpu)
}

fn rt_task_fits(snap: &CpuSnapshot, util: u64) -> bool {
    snap.capacity() > util
}

/// Cores running something an RT task of the given priority would preempt,
/// narrowed to those that fit the task if any do.
pub fn rt_lowest_mask(env: &PlacementEnv, task: &TaskView) -> Cpumask {
    let prio = task.rt_prio.unwrap_or(u32::MAX);
    let util = task.clamped_util(env.cfg);
    let nr_cpus = env.cpus.len();

    let lowest: Vec<&CpuSnapshot> = env
        .cpus
        .iter()
        .filter(|snap| env.usable(task, snap.cpu).is_some())
        .filter(|snap| snap.is_idle || snap.curr_rt_prio.map_or(true, |curr| prio < curr))
        .collect();

    let fitting: Vec<usize> = lowest
        .iter()
        .filter(|snap| rt_task_fits(snap, util))
        .map(|snap| snap.cpu.0)
        .collect();

    let cpus = if fitting.is_empty() {
        lowest.iter().map(|snap| snap.cpu.0).collect()
    } else {
        fitting
    };
    Cpumask::from_cpus(nr_cpus, cpus).unwrap_or_else(|_| Cpumask::new(nr_cpus))
}

/// Pick a core out of `mask` for an RT task: prefer little cores and, within
/// the same capacity, idle ones with a shallow idle state.
fn rt_filter(env: &PlacementEnv, task: &TaskView, mask: &Cpumask, prev: CpuId) -> Option<CpuId> {
    let topo = env.topo;
    let task_util = task.clamped_util(env.cfg);

    if mask.test_cpu(prev.0)
        && env.snap(prev).is_some_and(|snap| snap.is_idle)
        && topo.is_min_capacity_cpu(prev)
    {
        return Some(prev);
    }

    let mut best_idle: Option<&CpuSnapshot> = None;
    let mut best_busy: Option<(u64, &CpuSnapshot)> = None;

    for cpu in mask.iter().map(CpuId) {
        let Some(snap) = env.snap(cpu) else {
            continue;
        };
        let util = snap.cpu_util + task_util;
        let margin = env.cfg.margin_up(topo.cluster_of(cpu).id);
        if util * margin > snap.capacity_orig * SCHED_CAPACITY_SCALE {
            continue;
        }

        if snap.is_idle {
            if cpu == prev && topo.is_min_capacity_cpu(cpu) {
                return Some(prev);
            }
            let better = best_idle.map_or(true, |best| {
                snap.capacity_orig < best.capacity_orig
                    || (snap.capacity_orig == best.capacity_orig
                        && snap.exit_latency < best.exit_latency)
            });
            if better {
                best_idle = Some(snap);
            }
        } else {
            let better = best_busy.map_or(true, |(best_util, best)| {
                snap.capacity_orig < best.capacity_orig
                    || (snap.capacity_orig == best.capacity_orig && util < best_util)
            });
            if better {
                best_busy = Some((util, snap));
            }
        }
    }

    let best_busy = best_busy.map(|(_, snap)| snap);
    let on_little = |snap: &&CpuSnapshot| topo.is_min_capacity_cpu(snap.cpu);
    best_idle
        .filter(on_little)
        .or(best_busy.filter(on_little))
        .or(best_idle)
        .or(best_busy)
        .map(|snap| snap.cpu)
}

/// Choose a core for a waking RT task last run on `prev`.
pub fn select_cpu_rt(env: &PlacementEnv, task: &TaskView, prev: CpuId) -> Placement {
    let prio = task.rt_prio.unwrap_or(u32::MAX);
    let util = task.clamped_util(env.cfg);
    let prev_usable = env.usable(task, prev).is_some();
    let prev_snap = env.snap(prev);

    // The task would not preempt what runs on prev.
    let contended = prev_snap
        .and_then(|snap| snap.curr_rt_prio)
        .is_some_and(|curr| curr <= prio);
    let prev_fits = prev_snap.is_some_and(|snap| rt_task_fits(snap, util));

    if prev_usable && !contended && prev_fits {
        return Placement::new(prev, PlacementReason::RtStay);
    }

    let mask = rt_lowest_mask(env, task);
    let target = rt_filter(env, task, &mask, prev).or_else(|| {
        if mask.test_cpu(prev.0) {
            Some(prev)
        } else {
            mask.first().map(CpuId)
        }
    });

    if let Some(snap) = target.and_then(|cpu| env.snap(cpu)) {
        if !contended && prev_usable && !rt_task_fits(snap, util) {
            return Placement::new(prev, PlacementReason::RtStay);
        }
        if snap.highest_rt_prio.map_or(true, |highest| prio < highest) {
            return Placement::new(snap.cpu, PlacementReason::Rt);
        }
    }

    if prev_usable {
        Placement::new(prev, PlacementReason::RtStay)
    } else {
        Placement::new(select_fallback(env, task, prev), PlacementReason::Overutilized)
    }
}
