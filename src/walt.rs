// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # The WALT system object
//!
//! [`Walt`] owns every core's runqueue record, the task table, the topology,
//! the energy model and the per-core workers, and exposes the host-facing
//! [`SchedHooks`].
//!
//! Locking rules:
//!
//! - Core locks are taken in ascending core id order. Operations spanning
//!   two cores go through `lock_pair()`.
//!
//! - A task lock may be taken while holding core locks, never the other way
//!   around, and at most one task lock is held at a time.
//!
//! - The task table, group table, configuration and energy model locks are
//!   only held long enough to clone what is needed out of them.
//!
//! The `reserved` flags are advisory. Placement skips reserved cores; the
//! workers re-validate everything under the core locks before moving tasks.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::RwLock;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::balance;
use crate::balance::CoreView;
use crate::balance::RotationPlan;
use crate::clock::Clock;
use crate::clock::WaltClock;
use crate::config::WaltConfig;
use crate::cpumask::Cpumask;
use crate::energy::EnergyModel;
use crate::group::TaskGroup;
use crate::placement;
use crate::placement::CpuSnapshot;
use crate::placement::Placement;
use crate::placement::PlacementEnv;
use crate::placement::TaskView;
use crate::rq::Rq;
use crate::stats::CpuLoadStat;
use crate::stats::StatsSnapshot;
use crate::stats::WaltStats;
use crate::task::OnRq;
use crate::task::Task;
use crate::task::TaskHandle;
use crate::task::TaskSpec;
use crate::task::TaskState;
use crate::topology::Topology;
use crate::topology::TopologyCell;
use crate::tracker;
use crate::tracker::CoreLoad;
use crate::tracker::DequeueKind;
use crate::tracker::EnqueueKind;
use crate::tracker::TaskCtx;
use crate::tracker::TaskEvent;
use crate::tracker::TaskLoad;
use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::SchedClass;
use crate::types::TaskId;
use crate::types::TimeNs;
use crate::types::SCHED_CAPACITY_SCALE;
use crate::uclamp::rq_util_with;
use crate::uclamp::task_util;
use crate::uclamp::UclampReq;
use crate::worker::Intent;
use crate::worker::IntentHandler;
use crate::worker::Workers;

/// Entry points called by the host scheduler. Event hooks never fail:
/// unknown ids are stale state and ignored.
pub trait SchedHooks {
    /// `task` is being woken up, before a core is selected for it.
    fn task_woken(&self, task: TaskId);
    /// `task` joins `cpu`'s runqueue. A task still assigned to another core
    /// is migrated first.
    fn task_enqueued(&self, cpu: CpuId, task: TaskId, kind: EnqueueKind);
    fn task_dequeued(&self, cpu: CpuId, task: TaskId, kind: DequeueKind);
    /// Reassign a task that is not running to `dst`.
    fn task_migrated(&self, task: TaskId, dst: CpuId);
    fn tick(&self, cpu: CpuId);
    /// `cpu` switches from `prev` to `next`, `None` being the idle task.
    fn context_switch(&self, cpu: CpuId, prev: Option<TaskId>, next: Option<TaskId>);
    fn irq_time_charged(&self, cpu: CpuId, delta: TimeNs);

    /// Utilization used for frequency selection, 0..=1024.
    fn core_utilization(&self, cpu: CpuId) -> u64;
    fn task_utilization(&self, task: TaskId) -> u64;
    fn is_core_overutilized(&self, cpu: CpuId) -> bool;
    /// Core for a waking task. `sync_waker` is the waker's core when the
    /// waker is about to block.
    fn select_cpu(&self, task: TaskId, prev: CpuId, sync_waker: Option<CpuId>) -> CpuId;
}

struct Env {
    cfg: Arc<WaltConfig>,
    topo: Arc<Topology>,
}

/// What placement needs to know about a task, sampled under its lock.
struct TaskSample {
    view: TaskView,
    cpu: CpuId,
    queued: bool,
    class: SchedClass,
}

pub struct Walt {
    config: RwLock<Arc<WaltConfig>>,
    topo: TopologyCell,
    energy: RwLock<Option<Arc<EnergyModel>>>,
    clock: WaltClock,
    cores: Vec<Mutex<Rq>>,
    reserved: Vec<AtomicBool>,
    tasks: RwLock<BTreeMap<TaskId, Arc<TaskHandle>>>,
    groups: RwLock<BTreeMap<GroupId, TaskGroup>>,
    stats: WaltStats,
    workers: OnceLock<Workers>,
    uclamp_used: AtomicBool,
    active: AtomicBool,
}

impl Walt {
    pub fn new(
        topo: Topology,
        cfg: WaltConfig,
        energy: Option<EnergyModel>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Walt>> {
        cfg.validate()?;

        let nr_cpus = topo.nr_cpus();
        if let Some(em) = energy.as_ref() {
            let uncovered: Vec<usize> = topo
                .cpus()
                .filter(|cpu| !em.covers(*cpu))
                .map(|cpu| cpu.0)
                .collect();
            if !uncovered.is_empty() {
                warn!("CPUs {:?} are not covered by the energy model", uncovered);
            }
        }

        info!("Topology:\n{}", topo);

        let walt = Arc::new(Walt {
            clock: WaltClock::new(clock, cfg.tick_ns),
            config: RwLock::new(Arc::new(cfg)),
            topo: TopologyCell::new(topo),
            energy: RwLock::new(energy.map(Arc::new)),
            cores: (0..nr_cpus).map(|cpu| Mutex::new(Rq::new(CpuId(cpu)))).collect(),
            reserved: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
            tasks: RwLock::new(BTreeMap::new()),
            groups: RwLock::new(BTreeMap::new()),
            stats: WaltStats::default(),
            workers: OnceLock::new(),
            uclamp_used: AtomicBool::new(false),
            active: AtomicBool::new(false),
        });

        let workers = Workers::spawn(nr_cpus, Arc::downgrade(&walt))?;
        walt.workers
            .set(workers)
            .map_err(|_| anyhow!("Workers already started"))?;

        Ok(walt)
    }

    fn env(&self) -> Env {
        Env {
            cfg: self.config(),
            topo: self.topo.load(),
        }
    }

    pub fn config(&self) -> Arc<WaltConfig> {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.topo.load()
    }

    fn energy_model(&self) -> Option<Arc<EnergyModel>> {
        self.energy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn nr_cpus(&self) -> usize {
        self.cores.len()
    }

    pub fn now(&self) -> TimeNs {
        self.clock.now()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_reserved(&self, cpu: CpuId) -> bool {
        self.reserved
            .get(cpu.0)
            .is_some_and(|r| r.load(Ordering::Acquire))
    }

    fn lock_core(&self, cpu: CpuId) -> Option<MutexGuard<'_, Rq>> {
        match self.cores.get(cpu.0) {
            Some(core) => Some(core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())),
            None => {
                debug!("ignoring unknown {cpu}");
                None
            }
        }
    }

    /// Lock `a` and `b` in ascending order, returned in argument order.
    fn lock_pair(&self, a: CpuId, b: CpuId) -> Option<(MutexGuard<'_, Rq>, MutexGuard<'_, Rq>)> {
        if a == b || a.0 >= self.cores.len() || b.0 >= self.cores.len() {
            return None;
        }
        if a < b {
            let ga = self.lock_core(a)?;
            let gb = self.lock_core(b)?;
            Some((ga, gb))
        } else {
            let gb = self.lock_core(b)?;
            let ga = self.lock_core(a)?;
            Some((ga, gb))
        }
    }

    fn task_handle(&self, task: TaskId) -> Option<Arc<TaskHandle>> {
        let handle = self
            .tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&task)
            .cloned();
        if handle.is_none() {
            debug!("ignoring unknown {task}");
        }
        handle
    }

    /// Lock the core `handle` currently belongs to.
    fn lock_task_rq(&self, handle: &TaskHandle) -> Option<MutexGuard<'_, Rq>> {
        loop {
            let cpu = handle.cpu();
            let rq = self.lock_core(cpu)?;
            if handle.cpu() == cpu {
                return Some(rq);
            }
        }
    }

    fn group(&self, group: Option<GroupId>) -> Option<TaskGroup> {
        let group = group?;
        self.groups
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&group)
            .cloned()
    }

    fn group_wait_time(&self, group: Option<GroupId>) -> bool {
        self.group(group).is_some_and(|g| g.account_wait_time)
    }

    //
    // Accounting primitives. The caller holds the lock of `rq`.
    //

    fn account_idle(&self, rq: &mut Rq, env: &Env, event: TaskEvent, now: TimeNs, irqtime: u64) {
        let cctx = rq.core_ctx(&env.cfg, env.topo.capacity_orig(rq.cpu));
        let tctx = TaskCtx {
            is_idle: true,
            is_curr: rq.curr.is_none(),
            ..Default::default()
        };
        rq.load
            .on_task_update(&mut rq.idle, &tctx, &cctx, event, now, irqtime);
    }

    fn account_task(&self, rq: &mut Rq, task: &mut Task, env: &Env, event: TaskEvent, now: TimeNs) {
        let cctx = rq.core_ctx(&env.cfg, env.topo.capacity_orig(rq.cpu));
        let tctx = TaskCtx {
            id: Some(task.id),
            is_idle: false,
            exiting: task.state == TaskState::Exiting,
            is_curr: rq.curr == Some(task.id),
            queued: task.is_queued() && task.cpu == rq.cpu,
            group_wait_time: self.group_wait_time(task.group),
        };
        rq.load
            .on_task_update(&mut task.load, &tctx, &cctx, event, now, 0);
    }

    /// Bring whatever runs on `rq` up to date.
    fn account_curr(&self, rq: &mut Rq, env: &Env, event: TaskEvent, now: TimeNs, irqtime: u64) {
        match rq.curr {
            None => self.account_idle(rq, env, event, now, irqtime),
            Some(id) => {
                if let Some(handle) = self.task_handle(id) {
                    let mut task = handle.lock();
                    self.account_task(rq, &mut task, env, event, now);
                }
            }
        }
    }

    fn enqueue_locked(&self, rq: &mut Rq, task: &mut Task, kind: EnqueueKind, now: TimeNs) {
        if !rq.runnable.insert(task.id) {
            debug!("{} already queued on {}", task.id, rq.cpu);
            return;
        }

        task.on_rq = OnRq::Queued;
        if task.state != TaskState::Exiting {
            task.state = TaskState::Runnable;
        }
        task.load.last_enqueue_ts = now;

        rq.load.on_enqueue(&task.load, kind);
        rq.clamp.inc(&task.uclamp);
        if let Some(prio) = task.rt_prio() {
            rq.inc_rt(prio);
        }
    }

    fn dequeue_locked(&self, rq: &mut Rq, task: &mut Task, kind: DequeueKind) -> bool {
        if !rq.runnable.remove(&task.id) {
            debug!("{} not queued on {}", task.id, rq.cpu);
            return false;
        }

        task.on_rq = if kind == DequeueKind::Migrate {
            OnRq::Migrating
        } else {
            OnRq::No
        };
        if kind == DequeueKind::Sleep && task.state != TaskState::Exiting {
            task.state = TaskState::Sleeping;
        }

        rq.load.on_dequeue(&task.load, kind);
        rq.clamp.dec(&task.uclamp);
        if let Some(prio) = task.rt_prio() {
            rq.dec_rt(prio);
        }
        true
    }

    fn update_misfit(&self, rq: &mut Rq, env: &Env) {
        rq.misfit_task_load = 0;

        let Some(id) = rq.curr else {
            return;
        };
        let Some(handle) = self.task_handle(id) else {
            return;
        };
        let task = handle.lock();
        if task.class.is_rt() || task.state == TaskState::Exiting {
            return;
        }

        let cap_orig = env.topo.capacity_orig(rq.cpu);
        let util = task_util(task.load.demand_scale, &task.uclamp, &env.cfg);
        rq.misfit_task_load =
            balance::check_misfit(&env.topo, &env.cfg, rq.cpu, rq.capacity(cap_orig), util);
    }

    /// Switch `rq` to `next`. A task that is no longer queued when switched
    /// out has gone to sleep.
    fn switch_locked(&self, rq: &mut Rq, env: &Env, next: Option<TaskId>, now: TimeNs) {
        if rq.curr == next {
            self.account_curr(rq, env, TaskEvent::TaskUpdate, now, 0);
            return;
        }

        let next_handle = match next {
            Some(id) => match self.task_handle(id) {
                Some(handle) if handle.cpu() == rq.cpu => Some(handle),
                Some(_) => {
                    debug!("{id} switched in on {} but belongs elsewhere", rq.cpu);
                    return;
                }
                None => return,
            },
            None => None,
        };

        match rq.curr.and_then(|id| self.task_handle(id)) {
            Some(handle) => {
                let mut prev = handle.lock();
                if !prev.is_queued() {
                    prev.load.last_sleep_ts = Some(now);
                }
                self.account_task(rq, &mut prev, env, TaskEvent::PutPrevTask, now);
            }
            None => self.account_idle(rq, env, TaskEvent::PutPrevTask, now, 0),
        }

        let class = match next_handle {
            Some(handle) => {
                let mut next = handle.lock();
                self.account_task(rq, &mut next, env, TaskEvent::PickNextTask, now);
                next.class
            }
            None => {
                self.account_idle(rq, env, TaskEvent::PickNextTask, now, 0);
                SchedClass::Fair
            }
        };

        rq.curr = next;
        rq.curr_class = class;
        rq.curr_start = now;
        self.update_misfit(rq, env);
    }

    /// Move a task that is not running from `src` to `dst`. Both cores are
    /// locked by the caller.
    fn migrate_locked(
        &self,
        src: &mut Rq,
        dst: &mut Rq,
        handle: &TaskHandle,
        env: &Env,
        now: TimeNs,
    ) -> bool {
        let (queued, in_flight, waking) = {
            let mut task = handle.lock();
            if task.cpu != src.cpu || src.curr == Some(task.id) {
                debug!("{} cannot migrate from {}", task.id, src.cpu);
                return false;
            }
            let queued = task.is_queued();
            if queued {
                self.dequeue_locked(src, &mut task, DequeueKind::Migrate);
            }
            (
                queued,
                task.on_rq == OnRq::Migrating,
                task.state == TaskState::Waking,
            )
        };

        // Only tasks carrying load in the source core's counters need their
        // contributions moved.
        let accounted = in_flight || waking;
        if accounted {
            self.account_curr(src, env, TaskEvent::TaskUpdate, now, 0);
            self.account_curr(dst, env, TaskEvent::TaskUpdate, now, 0);
        }

        let mut task = handle.lock();
        if accounted {
            self.account_task(src, &mut task, env, TaskEvent::TaskMigrate, now);
            let xfer = tracker::on_migrate(&task.load, task.id, &mut src.load, &mut dst.load, waking);
            trace!(
                "migrate {} {} -> {}: curr_window={} prev_window={} window_demand={}",
                task.id,
                src.cpu,
                dst.cpu,
                xfer.curr_window,
                xfer.prev_window,
                xfer.moved_window_demand
            );
        }

        handle.set_cpu(&mut task, dst.cpu);
        if queued {
            self.enqueue_locked(dst, &mut task, EnqueueKind::Migrate, now);
        }
        true
    }

    //
    // Lifecycle
    //

    /// Start or restart tracking. Windows are aligned to multiples of the
    /// window size, all tracked loads restart from zero.
    pub fn activate(&self) {
        let env = self.env();
        let now = self.now();
        let window_start = now - now % env.cfg.window_ns;

        let handles: Vec<Arc<TaskHandle>> = self
            .tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        let mut cores: Vec<MutexGuard<'_, Rq>> = self
            .cores
            .iter()
            .map(|core| core.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
            .collect();

        for rq in cores.iter_mut() {
            rq.load.activate(window_start);
            rq.idle = TaskLoad::existing_task();
            rq.idle.mark_start = Some(now);
            rq.misfit_task_load = 0;
        }

        for handle in handles.iter() {
            let mut task = handle.lock();
            task.load = TaskLoad {
                init_load_pct: task.load.init_load_pct,
                ..TaskLoad::existing_task()
            };
        }

        self.active.store(true, Ordering::Release);
        info!(
            "WALT activated: window {}ns window_start {} policy {:?}",
            env.cfg.window_ns, window_start, env.cfg.window_stats_policy
        );
    }

    /// Register a new task on `cpu`. Its initial demand comes from its
    /// parent, its group or the global default, in that order of precedence.
    pub fn task_forked(&self, id: TaskId, cpu: CpuId, spec: TaskSpec) -> Result<()> {
        let env = self.env();
        if cpu.0 >= self.nr_cpus() {
            bail!("{} out of range for {}", cpu, id);
        }
        if let Some(affinity) = spec.affinity.as_ref() {
            if affinity.len() != self.nr_cpus() || affinity.is_empty() {
                bail!("Invalid affinity {} for {}", affinity, id);
            }
        }

        let load = if self.is_active() {
            let parent_pct = spec
                .parent
                .and_then(|parent| self.task_handle(parent))
                .map(|handle| handle.lock().load.init_load_pct)
                .unwrap_or(0);
            let group_pct = self.group(spec.group).map_or(0, |g| g.init_task_load_pct);
            let pct = match parent_pct.max(group_pct) {
                0 => env.cfg.init_task_load_pct,
                pct => pct,
            };
            let mut load = TaskLoad::new_task(env.cfg.init_load_windows(pct), env.cfg.window_ns);
            load.mark_start = Some(self.now());
            load
        } else {
            TaskLoad::existing_task()
        };

        if !spec.uclamp.is_default() {
            self.uclamp_used.store(true, Ordering::Release);
        }

        let task = Task::new(id, cpu, self.nr_cpus(), spec, load);
        let mut tasks = self
            .tasks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if tasks.contains_key(&id) {
            bail!("{} already exists", id);
        }
        tasks.insert(id, Arc::new(TaskHandle::new(task)));
        Ok(())
    }

    pub fn task_exiting(&self, id: TaskId) {
        let Some(handle) = self.task_handle(id) else {
            return;
        };
        let Some(_rq) = self.lock_task_rq(&handle) else {
            return;
        };
        handle.lock().state = TaskState::Exiting;
    }

    /// Forget a task. A task still queued or running is taken off its core
    /// first.
    pub fn task_removed(&self, id: TaskId) {
        let env = self.env();
        let now = self.now();
        let Some(handle) = self.task_handle(id) else {
            return;
        };

        if let Some(mut rq) = self.lock_task_rq(&handle) {
            {
                let mut task = handle.lock();
                task.state = TaskState::Exiting;
                if task.is_queued() {
                    self.dequeue_locked(&mut rq, &mut task, DequeueKind::Sleep);
                }
            }
            if rq.curr == Some(id) {
                let next = rq.runnable.iter().next().copied();
                self.switch_locked(&mut rq, &env, next, now);
            }
        }

        self.tasks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }

    pub fn suspend(&self) {
        self.clock.suspend();
    }

    pub fn resume(&self) {
        self.clock.resume();
    }

    pub fn rebuild_topology(&self, topo: Topology, energy: Option<EnergyModel>) -> Result<()> {
        if topo.nr_cpus() != self.nr_cpus() {
            bail!(
                "New topology has {} CPUs, expected {}",
                topo.nr_cpus(),
                self.nr_cpus()
            );
        }
        info!("Topology rebuilt:\n{}", topo);
        self.topo.store(topo);
        *self
            .energy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = energy.map(Arc::new);
        Ok(())
    }

    /// Apply a new configuration. Changing the window geometry restarts
    /// tracking from scratch.
    pub fn update_config(&self, cfg: WaltConfig) -> Result<()> {
        cfg.validate()?;

        let old = self.config();
        let reactivate = old.needs_reactivation(&cfg);
        self.clock.set_tick_ns(cfg.tick_ns);
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(cfg);

        if reactivate && self.is_active() {
            info!("Window geometry changed, reactivating");
            self.activate();
        }
        Ok(())
    }

    //
    // Environment
    //

    pub fn set_cpu_online(&self, cpu: CpuId, online: bool) {
        if let Some(mut rq) = self.lock_core(cpu) {
            rq.online = online;
        }
    }

    /// Charge the time run so far at the old frequency, then switch.
    pub fn set_freq_capacity(&self, cpu: CpuId, freq_capacity: u64) {
        let env = self.env();
        let now = self.now();
        if let Some(mut rq) = self.lock_core(cpu) {
            self.account_curr(&mut rq, &env, TaskEvent::TaskUpdate, now, 0);
            rq.freq_capacity = freq_capacity.min(SCHED_CAPACITY_SCALE);
        }
    }

    pub fn set_thermal_pressure(&self, cpu: CpuId, pressure: u64) {
        if let Some(mut rq) = self.lock_core(cpu) {
            rq.thermal_pressure = pressure;
        }
    }

    pub fn set_idle_exit_latency(&self, cpu: CpuId, latency: u32) {
        if let Some(mut rq) = self.lock_core(cpu) {
            rq.idle_exit_latency = latency;
        }
    }

    pub fn set_nr_iowait(&self, cpu: CpuId, nr_iowait: u32) {
        let env = self.env();
        let now = self.now();
        if let Some(mut rq) = self.lock_core(cpu) {
            self.account_curr(&mut rq, &env, TaskEvent::TaskUpdate, now, 0);
            rq.nr_iowait = nr_iowait;
        }
    }

    //
    // Task attributes
    //

    pub fn set_task_uclamp(&self, id: TaskId, uclamp: UclampReq) {
        let Some(handle) = self.task_handle(id) else {
            return;
        };
        let Some(mut rq) = self.lock_task_rq(&handle) else {
            return;
        };
        let mut task = handle.lock();
        if task.is_queued() {
            rq.clamp.dec(&task.uclamp);
            rq.clamp.inc(&uclamp);
        }
        task.uclamp = uclamp;
        if !uclamp.is_default() {
            self.uclamp_used.store(true, Ordering::Release);
        }
    }

    pub fn set_task_latency_sensitive(&self, id: TaskId, latency_sensitive: bool) {
        if let Some(handle) = self.task_handle(id) {
            handle.lock().latency_sensitive = latency_sensitive;
        }
    }

    /// Initial load percentage handed down to the task's children.
    pub fn set_task_init_load_pct(&self, id: TaskId, pct: u32) -> Result<()> {
        if pct > 100 {
            bail!("init_load_pct {} exceeds 100", pct);
        }
        if let Some(handle) = self.task_handle(id) {
            handle.lock().load.init_load_pct = pct;
        }
        Ok(())
    }

    /// Restrict where a task may run. A task left outside its mask is moved
    /// unless it is running, in which case the host moves it when it stops.
    pub fn set_task_affinity(&self, id: TaskId, affinity: Cpumask) -> Result<()> {
        if affinity.len() != self.nr_cpus() || affinity.is_empty() {
            bail!("Invalid affinity {} for {}", affinity, id);
        }
        let Some(handle) = self.task_handle(id) else {
            return Ok(());
        };

        let move_from = {
            let Some(rq) = self.lock_task_rq(&handle) else {
                return Ok(());
            };
            let mut task = handle.lock();
            task.affinity = affinity;
            (!task.allowed_on(rq.cpu) && rq.curr != Some(id)).then_some(rq.cpu)
        };

        if let Some(prev) = move_from {
            let dst = self.placement(id, prev, None).cpu;
            self.task_migrated(id, dst);
        }
        Ok(())
    }

    /// Apply `change` to a task, taking it off its runqueue meanwhile.
    fn requeue_with(&self, id: TaskId, change: impl FnOnce(&mut Task)) {
        let now = self.now();
        let Some(handle) = self.task_handle(id) else {
            return;
        };
        let Some(mut rq) = self.lock_task_rq(&handle) else {
            return;
        };
        let mut task = handle.lock();
        let queued = task.is_queued() && self.dequeue_locked(&mut rq, &mut task, DequeueKind::Requeue);
        change(&mut task);
        if queued {
            self.enqueue_locked(&mut rq, &mut task, EnqueueKind::Requeue, now);
        }
        if rq.curr == Some(id) {
            rq.curr_class = task.class;
        }
    }

    pub fn set_task_group(&self, id: TaskId, group: Option<GroupId>) {
        self.requeue_with(id, |task| task.group = group);
    }

    pub fn set_task_class(&self, id: TaskId, class: SchedClass) {
        self.requeue_with(id, |task| task.class = class);
    }

    //
    // Groups
    //

    /// Create a task group. A group named "top-app" starts its new tasks
    /// with a larger initial load.
    pub fn group_online(&self, id: GroupId, name: &str) -> TaskGroup {
        let group = TaskGroup::new(id, name);
        debug!("{} online as {:?}", id, name);
        self.groups
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, group.clone());
        group
    }

    fn update_group(&self, id: GroupId, change: impl FnOnce(&mut TaskGroup)) -> Result<()> {
        let mut groups = self
            .groups
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match groups.get_mut(&id) {
            Some(group) => {
                change(group);
                Ok(())
            }
            None => bail!("Unknown {}", id),
        }
    }

    pub fn set_group_boost(&self, id: GroupId, boost: u32) -> Result<()> {
        if boost > 100 {
            bail!("Group boost {} exceeds 100", boost);
        }
        self.update_group(id, |g| g.boost = boost)
    }

    pub fn set_group_init_load_pct(&self, id: GroupId, pct: u32) -> Result<()> {
        if pct > 100 {
            bail!("Group init_task_load_pct {} exceeds 100", pct);
        }
        self.update_group(id, |g| g.init_task_load_pct = pct)
    }

    pub fn set_group_account_wait_time(&self, id: GroupId, account: bool) -> Result<()> {
        self.update_group(id, |g| g.account_wait_time = account)
    }

    //
    // Placement
    //

    fn sample_task(&self, id: TaskId) -> Option<TaskSample> {
        let handle = self.task_handle(id)?;
        let task = handle.lock();
        let boost = self.group(task.group).map_or(0, |g| g.boost);
        Some(TaskSample {
            view: TaskView {
                id,
                util: task.load.demand_scale,
                uclamp: task.uclamp,
                boost,
                affinity: task.affinity.clone(),
                latency_sensitive: task.latency_sensitive,
                rt_prio: task.rt_prio(),
            },
            cpu: task.cpu,
            queued: task.is_queued(),
            class: task.class,
        })
    }

    /// Snapshot every core, one lock at a time. Utilization without the
    /// sampled task excludes its demand from the core it is queued on.
    fn snapshot(&self, env: &Env, sample: Option<&TaskSample>) -> Vec<CpuSnapshot> {
        self.cores
            .iter()
            .enumerate()
            .map(|(i, core)| {
                let cpu = CpuId(i);
                let rq = core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let capacity_orig = env.topo.capacity_orig(cpu);
                let cpu_util = rq.load.cpu_util(env.cfg.window_ns, capacity_orig);
                let wake_util = match sample {
                    Some(s) if s.queued && s.cpu == cpu => cpu_util.saturating_sub(s.view.util),
                    _ => cpu_util,
                };
                CpuSnapshot {
                    cpu,
                    online: rq.online,
                    reserved: self.is_reserved(cpu),
                    capacity_orig,
                    thermal_pressure: rq.thermal_pressure,
                    cpu_util,
                    wake_util,
                    is_idle: rq.is_idle(),
                    nr_running: rq.nr_running(),
                    exit_latency: rq.idle_exit_latency,
                    clamp: rq.clamp.values(),
                    curr_rt_prio: rq.curr_rt_prio(),
                    highest_rt_prio: rq.highest_rt_prio(),
                }
            })
            .collect()
    }

    fn place_sample(&self, sample: &TaskSample, prev: CpuId, sync_waker: Option<CpuId>) -> Placement {
        let env = self.env();
        let em = self.energy_model();
        let cpus = self.snapshot(&env, Some(sample));
        let penv = PlacementEnv {
            topo: &env.topo,
            energy: em.as_deref(),
            cfg: &env.cfg,
            uclamp_used: self.uclamp_used.load(Ordering::Acquire),
            cpus: &cpus,
        };

        if sample.class.is_rt() {
            placement::select_cpu_rt(&penv, &sample.view, prev)
        } else {
            placement::select_cpu_fair(&penv, &sample.view, prev, sync_waker)
        }
    }

    /// Placement decision for `task` along with why it was made.
    pub fn placement(&self, task: TaskId, prev: CpuId, sync_waker: Option<CpuId>) -> Placement {
        let Some(sample) = self.sample_task(task) else {
            return Placement {
                cpu: prev,
                reason: placement::PlacementReason::PrevCpu,
            };
        };
        let prev = if prev.0 < self.nr_cpus() { prev } else { sample.cpu };
        let placement = self.place_sample(&sample, prev, sync_waker);
        self.stats.record_placement(placement.reason);
        placement
    }

    /// Core for a waking RT task.
    pub fn select_cpu_rt(&self, task: TaskId, prev: CpuId) -> CpuId {
        let Some(mut sample) = self.sample_task(task) else {
            return prev;
        };
        sample.class = match sample.view.rt_prio {
            Some(prio) => SchedClass::Rt { prio },
            None => SchedClass::Rt { prio: u32::MAX },
        };
        let placement = self.place_sample(&sample, prev, None);
        self.stats.record_placement(placement.reason);
        placement.cpu
    }

    //
    // Forced migrations
    //

    /// Hand the misfit `task` running on `src` to a worker if a bigger core
    /// wants it. Returns whether an intent was queued.
    fn try_active_balance(&self, src: CpuId, task: TaskId) -> bool {
        let Some(sample) = self.sample_task(task) else {
            return false;
        };
        let topo = self.topology();
        let dst = self.place_sample(&sample, src, None).cpu;
        if !balance::is_upmigration(&topo, src, dst) {
            return false;
        }

        if self.reserved[dst.0]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        {
            let Some(mut rq) = self.lock_core(src) else {
                self.reserved[dst.0].store(false, Ordering::Release);
                return false;
            };
            if rq.curr != Some(task) || rq.active_balance {
                self.reserved[dst.0].store(false, Ordering::Release);
                return false;
            }
            rq.active_balance = true;
            rq.load.push_task = Some(task);
        }

        let sent = self
            .workers
            .get()
            .map(|w| w.send(src, Intent::ActiveBalance { src, dst, task }).is_ok())
            .unwrap_or(false);
        if !sent {
            if let Some(mut rq) = self.lock_core(src) {
                rq.active_balance = false;
                rq.load.push_task = None;
            }
            self.reserved[dst.0].store(false, Ordering::Release);
            WaltStats::inc(&self.stats.active_balance_aborted);
            return false;
        }

        debug!("active balance: {task} {src} -> {dst} queued");
        WaltStats::inc(&self.stats.active_balance_issued);
        true
    }

    fn active_balance_locked(
        &self,
        src: &mut Rq,
        dst: &mut Rq,
        id: TaskId,
        env: &Env,
        now: TimeNs,
    ) -> bool {
        if !src.online || !dst.online || src.curr != Some(id) {
            return false;
        }
        let Some(handle) = self.task_handle(id) else {
            return false;
        };
        {
            let task = handle.lock();
            if task.cpu != src.cpu
                || !task.allowed_on(dst.cpu)
                || task.state != TaskState::Runnable
                || !task.is_queued()
            {
                return false;
            }
        }

        let next = src.runnable.iter().copied().find(|t| *t != id);
        self.switch_locked(src, env, next, now);
        if !self.migrate_locked(src, dst, &handle, env, now) {
            return false;
        }
        if dst.curr.is_none() {
            self.switch_locked(dst, env, Some(id), now);
        }
        true
    }

    fn run_active_balance(&self, src: CpuId, dst: CpuId, task: TaskId) {
        let env = self.env();
        let now = self.now();

        let done = match self.lock_pair(src, dst) {
            Some((mut s, mut d)) => {
                let done = self.active_balance_locked(&mut s, &mut d, task, &env, now);
                s.active_balance = false;
                s.load.push_task = None;
                done
            }
            None => {
                if let Some(mut s) = self.lock_core(src) {
                    s.active_balance = false;
                    s.load.push_task = None;
                }
                false
            }
        };
        if let Some(reserved) = self.reserved.get(dst.0) {
            reserved.store(false, Ordering::Release);
        }

        if done {
            debug!("active balance: moved {task} {src} -> {dst}");
            WaltStats::inc(&self.stats.active_balance_done);
        } else {
            debug!("active balance: {task} {src} -> {dst} went stale");
            WaltStats::inc(&self.stats.active_balance_aborted);
        }
    }

    fn core_views(&self) -> Vec<CoreView> {
        self.cores
            .iter()
            .enumerate()
            .map(|(i, core)| {
                let cpu = CpuId(i);
                let rq = core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let curr_enqueue_ts = rq
                    .curr
                    .and_then(|id| self.task_handle(id))
                    .map_or(0, |handle| handle.lock().load.last_enqueue_ts);
                CoreView {
                    cpu,
                    online: rq.online,
                    reserved: self.is_reserved(cpu),
                    misfit_task_load: rq.misfit_task_load,
                    curr: rq.curr,
                    curr_is_fair: !rq.curr_class.is_rt(),
                    curr_enqueue_ts,
                    nr_running: rq.nr_running(),
                }
            })
            .collect()
    }

    fn try_rotation(&self, cpu: CpuId, now: TimeNs) {
        let env = self.env();
        let views = self.core_views();
        let Some(plan) = balance::find_rotation(&env.topo, &env.cfg, &views, cpu, now) else {
            return;
        };

        {
            let Some((src, dst)) = self.lock_pair(plan.src_cpu, plan.dst_cpu) else {
                return;
            };
            if src.curr != Some(plan.src_task) || dst.curr != Some(plan.dst_task) {
                return;
            }
            if self.reserved[plan.src_cpu.0]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            if self.reserved[plan.dst_cpu.0]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.reserved[plan.src_cpu.0].store(false, Ordering::Release);
                return;
            }
        }

        let sent = self
            .workers
            .get()
            .map(|w| w.send(plan.src_cpu, Intent::Rotation(plan)).is_ok())
            .unwrap_or(false);
        if !sent {
            self.release_rotation(&plan);
            WaltStats::inc(&self.stats.rotation_aborted);
            return;
        }

        debug!(
            "rotation: {} on {} <-> {} on {} queued",
            plan.src_task, plan.src_cpu, plan.dst_task, plan.dst_cpu
        );
        WaltStats::inc(&self.stats.rotation_issued);
    }

    fn release_rotation(&self, plan: &RotationPlan) {
        self.reserved[plan.src_cpu.0].store(false, Ordering::Release);
        self.reserved[plan.dst_cpu.0].store(false, Ordering::Release);
    }

    fn rotation_locked(&self, src: &mut Rq, dst: &mut Rq, plan: &RotationPlan, env: &Env, now: TimeNs) -> bool {
        if !src.online
            || !dst.online
            || src.curr != Some(plan.src_task)
            || dst.curr != Some(plan.dst_task)
        {
            return false;
        }
        let (Some(src_handle), Some(dst_handle)) = (
            self.task_handle(plan.src_task),
            self.task_handle(plan.dst_task),
        ) else {
            return false;
        };

        let movable = |handle: &TaskHandle, to: CpuId| {
            let task = handle.lock();
            task.allowed_on(to) && task.state == TaskState::Runnable && task.is_queued()
        };
        if !movable(&src_handle, dst.cpu) || !movable(&dst_handle, src.cpu) {
            return false;
        }

        self.switch_locked(src, env, None, now);
        self.switch_locked(dst, env, None, now);

        let swapped = if !self.migrate_locked(src, dst, &src_handle, env, now) {
            false
        } else if !self.migrate_locked(dst, src, &dst_handle, env, now) {
            // Undo the half swap.
            self.migrate_locked(dst, src, &src_handle, env, now);
            false
        } else {
            true
        };

        if swapped {
            self.switch_locked(dst, env, Some(plan.src_task), now);
            self.switch_locked(src, env, Some(plan.dst_task), now);
        } else {
            self.switch_locked(src, env, Some(plan.src_task), now);
            self.switch_locked(dst, env, Some(plan.dst_task), now);
        }
        swapped
    }

    fn run_rotation(&self, plan: RotationPlan) {
        let env = self.env();
        let now = self.now();

        let done = match self.lock_pair(plan.src_cpu, plan.dst_cpu) {
            Some((mut src, mut dst)) => self.rotation_locked(&mut src, &mut dst, &plan, &env, now),
            None => false,
        };
        self.release_rotation(&plan);

        if done {
            debug!(
                "rotation: swapped {} and {} between {} and {}",
                plan.src_task, plan.dst_task, plan.src_cpu, plan.dst_cpu
            );
            WaltStats::inc(&self.stats.rotation_done);
        } else {
            WaltStats::inc(&self.stats.rotation_aborted);
        }
    }

    /// Wait for every queued migration and rotation to complete.
    pub fn quiesce(&self) {
        if let Some(workers) = self.workers.get() {
            workers.barrier();
        }
    }

    //
    // Queries
    //

    pub fn curr_task(&self, cpu: CpuId) -> Option<TaskId> {
        self.lock_core(cpu)?.curr
    }

    pub fn runnable_tasks(&self, cpu: CpuId) -> Vec<TaskId> {
        self.lock_core(cpu)
            .map(|rq| rq.runnable.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn task_cpu(&self, task: TaskId) -> Option<CpuId> {
        self.task_handle(task).map(|handle| handle.cpu())
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.task_handle(task).map(|handle| handle.lock().state)
    }

    pub fn task_load(&self, task: TaskId) -> Option<TaskLoad> {
        self.task_handle(task).map(|handle| handle.lock().load.clone())
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn core_load(&self, cpu: CpuId) -> Option<CoreLoad> {
        self.lock_core(cpu).map(|rq| rq.load.clone())
    }

    pub fn misfit_task_load(&self, cpu: CpuId) -> u64 {
        self.lock_core(cpu).map_or(0, |rq| rq.misfit_task_load)
    }

    pub fn cpu_util(&self, cpu: CpuId) -> u64 {
        let env = self.env();
        self.lock_core(cpu).map_or(0, |rq| {
            rq.load
                .cpu_util(env.cfg.window_ns, env.topo.capacity_orig(cpu))
        })
    }

    /// Utilization including the previous window, without clamping.
    pub fn effective_cpu_util(&self, cpu: CpuId) -> u64 {
        let env = self.env();
        self.lock_core(cpu).map_or(0, |rq| {
            rq.load
                .effective_cpu_util(env.cfg.window_ns, env.topo.capacity_orig(cpu))
        })
    }

    pub fn cpu_high_irqload(&self, cpu: CpuId) -> bool {
        let cfg = self.config();
        let jiffies = self.clock.jiffies();
        self.lock_core(cpu)
            .is_some_and(|rq| rq.load.is_high_irqload(jiffies, cfg.cpu_high_irqload_ns))
    }

    pub fn cpuload(&self) -> Vec<CpuLoadStat> {
        let env = self.env();
        self.cores
            .iter()
            .enumerate()
            .map(|(i, core)| {
                let cpu = CpuId(i);
                let rq = core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                CpuLoadStat {
                    cpu,
                    cpu_load: rq
                        .load
                        .prev_window_util(env.cfg.window_ns, env.topo.capacity_orig(cpu)),
                    running_tasks: rq.nr_running(),
                    iowait_tasks: rq.nr_iowait,
                    busy: rq.load.busy,
                }
            })
            .collect()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let mut snap = self.stats.snapshot();
        for core in self.cores.iter() {
            let rq = core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            snap.migration_clamps += rq.load.migration_clamps;
            snap.clock_anomalies += rq.load.clock_anomalies;
        }
        snap
    }
}

impl IntentHandler for Walt {
    fn handle_intent(&self, _worker: CpuId, intent: Intent) {
        match intent {
            Intent::ActiveBalance { src, dst, task } => self.run_active_balance(src, dst, task),
            Intent::Rotation(plan) => self.run_rotation(plan),
            Intent::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

impl SchedHooks for Walt {
    fn task_woken(&self, id: TaskId) {
        let env = self.env();
        let now = self.now();
        let Some(handle) = self.task_handle(id) else {
            return;
        };
        let Some(mut rq) = self.lock_task_rq(&handle) else {
            return;
        };

        if rq.curr != Some(id) {
            self.account_curr(&mut rq, &env, TaskEvent::TaskUpdate, now, 0);
        }

        let mut task = handle.lock();
        if task.is_queued() {
            debug!("{id} woken while queued");
            return;
        }
        self.account_task(&mut rq, &mut task, &env, TaskEvent::TaskWake, now);
        if task.state != TaskState::Exiting {
            task.state = TaskState::Waking;
        }
    }

    fn task_enqueued(&self, cpu: CpuId, id: TaskId, kind: EnqueueKind) {
        let now = self.now();
        let Some(handle) = self.task_handle(id) else {
            return;
        };
        if handle.cpu() != cpu {
            self.task_migrated(id, cpu);
        }

        let Some(mut rq) = self.lock_task_rq(&handle) else {
            return;
        };
        if rq.cpu != cpu {
            debug!("{id} could not be moved to {cpu} for enqueue");
            return;
        }
        let mut task = handle.lock();
        self.enqueue_locked(&mut rq, &mut task, kind, now);
    }

    fn task_dequeued(&self, cpu: CpuId, id: TaskId, kind: DequeueKind) {
        let Some(handle) = self.task_handle(id) else {
            return;
        };
        let Some(mut rq) = self.lock_task_rq(&handle) else {
            return;
        };
        if rq.cpu != cpu {
            debug!("{id} dequeued from {cpu} but lives on {}", rq.cpu);
            return;
        }
        let mut task = handle.lock();
        self.dequeue_locked(&mut rq, &mut task, kind);
    }

    fn task_migrated(&self, id: TaskId, dst: CpuId) {
        let env = self.env();
        let now = self.now();
        let Some(handle) = self.task_handle(id) else {
            return;
        };
        if dst.0 >= self.nr_cpus() {
            debug!("ignoring migration of {id} to unknown {dst}");
            return;
        }

        loop {
            let src = handle.cpu();
            if src == dst {
                return;
            }
            let Some((mut s, mut d)) = self.lock_pair(src, dst) else {
                return;
            };
            if handle.cpu() != src {
                continue;
            }
            self.migrate_locked(&mut s, &mut d, &handle, &env, now);
            return;
        }
    }

    fn tick(&self, cpu: CpuId) {
        let env = self.env();
        let now = self.now();

        let (curr, misfit, active_balance) = {
            let Some(mut rq) = self.lock_core(cpu) else {
                return;
            };
            self.account_curr(&mut rq, &env, TaskEvent::TaskUpdate, now, 0);
            self.update_misfit(&mut rq, &env);
            (rq.curr, rq.misfit_task_load, rq.active_balance)
        };

        if misfit > 0 {
            WaltStats::inc(&self.stats.misfit_ticks);
            if let Some(task) = curr.filter(|_| !active_balance) {
                if self.try_active_balance(cpu, task) {
                    return;
                }
            }
        }

        if env.cfg.rotation_enable {
            self.try_rotation(cpu, now);
        }
    }

    fn context_switch(&self, cpu: CpuId, prev: Option<TaskId>, next: Option<TaskId>) {
        let env = self.env();
        let now = self.now();
        let Some(mut rq) = self.lock_core(cpu) else {
            return;
        };
        if rq.curr != prev {
            debug!(
                "{cpu} switching from {:?} but {:?} is running",
                prev, rq.curr
            );
        }
        self.switch_locked(&mut rq, &env, next, now);
    }

    fn irq_time_charged(&self, cpu: CpuId, delta: TimeNs) {
        let env = self.env();
        let now = self.now();
        let jiffies = self.clock.jiffies();
        let Some(mut rq) = self.lock_core(cpu) else {
            return;
        };
        if env.cfg.account_irq_time && rq.curr.is_none() {
            self.account_idle(&mut rq, &env, TaskEvent::IrqUpdate, now, delta);
        }
        rq.load.account_irqtime(jiffies, delta);
    }

    fn core_utilization(&self, cpu: CpuId) -> u64 {
        let env = self.env();
        let uclamp_used = self.uclamp_used.load(Ordering::Acquire);
        let Some(rq) = self.lock_core(cpu) else {
            return 0;
        };
        let capacity_orig = env.topo.capacity_orig(cpu);
        let util = rq.load.cpu_util_freq(&env.cfg, capacity_orig);
        rq_util_with(rq.clamp.values(), util, None, uclamp_used, &env.cfg).min(capacity_orig)
    }

    fn task_utilization(&self, task: TaskId) -> u64 {
        self.task_handle(task)
            .map_or(0, |handle| handle.lock().load.demand_scale)
    }

    fn is_core_overutilized(&self, cpu: CpuId) -> bool {
        let env = self.env();
        let Some(rq) = self.lock_core(cpu) else {
            return false;
        };
        let capacity_orig = env.topo.capacity_orig(cpu);
        let util = rq.load.cpu_util(env.cfg.window_ns, capacity_orig);
        !placement::fits_capacity(util, rq.capacity(capacity_orig), env.cfg.fair_cap_margin)
    }

    fn select_cpu(&self, task: TaskId, prev: CpuId, sync_waker: Option<CpuId>) -> CpuId {
        self.placement(task, prev, sync_waker).cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn running_pair() -> Arc<Walt> {
        let topo = Topology::new(&[512, 1024]).unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let walt = Walt::new(topo, WaltConfig::default(), None, clock).unwrap();
        walt.activate();
        for (id, cpu) in [(1, 0), (2, 1)] {
            let (id, cpu) = (TaskId(id), CpuId(cpu));
            walt.task_forked(id, cpu, TaskSpec::default()).unwrap();
            walt.task_woken(id);
            walt.task_enqueued(cpu, id, EnqueueKind::Wakeup);
            walt.context_switch(cpu, None, Some(id));
        }
        walt
    }

    #[test]
    fn test_failed_rotation_restores_both_cores() {
        let walt = running_pair();
        let plan = RotationPlan {
            src_cpu: CpuId(0),
            src_task: TaskId(1),
            dst_cpu: CpuId(1),
            dst_task: TaskId(2),
        };

        // The second task claims to live elsewhere, so it cannot leave cpu1.
        let stray = walt.task_handle(TaskId(2)).unwrap();
        stray.lock().cpu = CpuId(0);

        let env = walt.env();
        let now = walt.now();
        {
            let (mut src, mut dst) = walt.lock_pair(CpuId(0), CpuId(1)).unwrap();
            assert!(!walt.rotation_locked(&mut src, &mut dst, &plan, &env, now));
            assert_eq!(src.curr, Some(TaskId(1)));
            assert_eq!(dst.curr, Some(TaskId(2)));
            assert!(src.runnable.contains(&TaskId(1)));
            assert!(!dst.runnable.contains(&TaskId(1)));
        }
        stray.lock().cpu = CpuId(1);

        assert_eq!(walt.task_cpu(TaskId(1)), Some(CpuId(0)));
        let src = walt.core_load(CpuId(0)).unwrap();
        let dst = walt.core_load(CpuId(1)).unwrap();
        assert_eq!(src.cumulative_runnable_avg, walt.task_load(TaskId(1)).unwrap().demand);
        assert_eq!(dst.cumulative_runnable_avg, walt.task_load(TaskId(2)).unwrap().demand);
    }

    #[test]
    fn test_rotation_swaps_running_tasks() {
        let walt = running_pair();
        let plan = RotationPlan {
            src_cpu: CpuId(0),
            src_task: TaskId(1),
            dst_cpu: CpuId(1),
            dst_task: TaskId(2),
        };

        let env = walt.env();
        let now = walt.now();
        {
            let (mut src, mut dst) = walt.lock_pair(CpuId(0), CpuId(1)).unwrap();
            assert!(walt.rotation_locked(&mut src, &mut dst, &plan, &env, now));
            assert_eq!(src.curr, Some(TaskId(2)));
            assert_eq!(dst.curr, Some(TaskId(1)));
        }
        assert_eq!(walt.task_cpu(TaskId(1)), Some(CpuId(1)));
        assert_eq!(walt.task_cpu(TaskId(2)), Some(CpuId(0)));
    }
}
