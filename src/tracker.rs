// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Windowed demand tracking
//!
//! Time is cut into fixed-size windows that start at the same instants on
//! every core. For each task the tracker accumulates how long it was busy in
//! the current window (`sum`), pushes the sum of every closed window into a
//! short history and derives the task's `demand` from that history. For each
//! core it accumulates the busy time of all tasks that ran there in the
//! current and previous window (`curr_runnable_sum`, `prev_runnable_sum`)
//! and the summed demand of the runnable tasks (`cumulative_runnable_avg`).
//!
//! All busy time is scaled by the core's capacity and current frequency, so
//! a window's worth of busy time on a little core running at half speed is
//! worth a fraction of the same wall time on the biggest core at full speed.
//!
//! Every function here runs with the owning core's lock held and never
//! fails. A clock going backwards is treated as zero elapsed time. A
//! cumulative average dropping below zero is a logic error and is escalated
//! through [`invariant_violation`].

use std::fmt;

use log::error;
use log::trace;
use log::warn;
use serde::Serialize;

use crate::busy::busy_limit;
use crate::busy::BusyState;
use crate::config::WaltConfig;
use crate::config::WindowStatsPolicy;
use crate::config::RAVG_HIST_SIZE_MAX;
use crate::types::TaskId;
use crate::types::TimeNs;
use crate::types::SCHED_CAPACITY_SHIFT;

/// IRQ load older than this many ticks no longer flags a core.
pub const HIGH_IRQ_TIMEOUT: u64 = 3;

/// Task state transitions reported to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskEvent {
    PutPrevTask,
    PickNextTask,
    TaskWake,
    TaskMigrate,
    TaskUpdate,
    IrqUpdate,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskEvent::PutPrevTask => "PUT_PREV_TASK",
            TaskEvent::PickNextTask => "PICK_NEXT_TASK",
            TaskEvent::TaskWake => "TASK_WAKE",
            TaskEvent::TaskMigrate => "TASK_MIGRATE",
            TaskEvent::TaskUpdate => "TASK_UPDATE",
            TaskEvent::IrqUpdate => "IRQ_UPDATE",
        };
        f.write_str(name)
    }
}

/// Why a task joins a runqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueKind {
    /// Woken up or newly created.
    Wakeup,
    /// Arriving from another core.
    Migrate,
    /// Re-inserted after a priority, class or group change.
    Requeue,
}

/// Why a task leaves a runqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueKind {
    /// Going to sleep or exiting.
    Sleep,
    /// Leaving for another core.
    Migrate,
    /// Removed to change priority, class or group; enqueued again right after.
    Requeue,
}

/// Escalate a broken accounting invariant: fatal with debug assertions,
/// logged otherwise. The caller clamps the offending value.
pub fn invariant_violation(args: fmt::Arguments) {
    if cfg!(debug_assertions) {
        panic!("walt invariant violated: {args}");
    }
    error!("walt invariant violated: {args}");
}

/// Per-task load tracking state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskLoad {
    /// Start of the interval not yet accounted. `None` until the task is
    /// first seen after activation.
    pub mark_start: Option<TimeNs>,
    /// Scaled busy time in the current window.
    pub sum: u64,
    /// Busy time since the task last stopped being busy, carried across an
    /// open window when cross-window accounting is enabled.
    pub sum_latest: u64,
    /// Contribution to the core's `curr_runnable_sum`.
    pub curr_window: u64,
    /// Contribution to the core's `prev_runnable_sum`.
    pub prev_window: u64,
    /// Busy time of recently closed windows, most recent first.
    pub sum_history: [u64; RAVG_HIST_SIZE_MAX],
    pub demand: u64,
    /// `demand` in capacity units.
    pub demand_scale: u64,
    /// Initial load percentage handed to children of this task.
    pub init_load_pct: u32,
    /// When the task last went to sleep. `None` until it first does.
    pub last_sleep_ts: Option<TimeNs>,
    pub last_enqueue_ts: TimeNs,
}

impl TaskLoad {
    /// Load of a task created while the tracker is active.
    pub fn new_task(init_load: u64, window_ns: TimeNs) -> TaskLoad {
        TaskLoad {
            sum_history: [init_load; RAVG_HIST_SIZE_MAX],
            demand: init_load,
            demand_scale: scale_demand(init_load, window_ns),
            ..Default::default()
        }
    }

    /// Load of a task that existed before activation, or of an idle task.
    pub fn existing_task() -> TaskLoad {
        TaskLoad::default()
    }
}

/// How the task being accounted relates to the core.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskCtx {
    pub id: Option<TaskId>,
    /// The core's idle task.
    pub is_idle: bool,
    pub exiting: bool,
    /// Currently running on the core.
    pub is_curr: bool,
    /// Queued on the core's runqueue.
    pub queued: bool,
    /// The task's group counts wait time as demand.
    pub group_wait_time: bool,
}

/// Core-wide inputs sampled under the core lock.
#[derive(Debug, Clone, Copy)]
pub struct CoreCtx<'a> {
    pub cfg: &'a WaltConfig,
    pub capacity_orig: u64,
    /// Current frequency in capacity units, 1024 at the highest frequency.
    pub freq_capacity: u64,
    pub nr_iowait: u32,
}

impl CoreCtx<'_> {
    /// Translate wall time on this core to time on the biggest core running
    /// at its highest frequency.
    pub fn scale_exec_time(&self, delta: u64) -> u64 {
        let cap_curr = (self.capacity_orig * self.freq_capacity) >> SCHED_CAPACITY_SHIFT;
        (delta * cap_curr) >> SCHED_CAPACITY_SHIFT
    }

    fn waiting_on_io(&self) -> bool {
        self.cfg.io_is_busy && self.nr_iowait > 0
    }
}

pub fn scale_demand(demand: u64, window_ns: TimeNs) -> u64 {
    demand / (window_ns >> SCHED_CAPACITY_SHIFT).max(1)
}

/// Scaled busy time expressed as utilization.
pub fn util_of(busy: u64, window_ns: TimeNs) -> u64 {
    (busy << SCHED_CAPACITY_SHIFT) / window_ns.max(1)
}

/// Per-core load tracking state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoreLoad {
    /// Start of the current window. `None` until activation.
    pub window_start: Option<TimeNs>,
    pub curr_runnable_sum: u64,
    pub prev_runnable_sum: u64,
    /// Summed demand of runnable tasks.
    pub cumulative_runnable_avg: u64,
    /// Demand of the tasks that were runnable at some point of the current
    /// window.
    pub cum_window_demand: u64,
    pub busy: BusyState,
    pub cur_irqload: u64,
    pub avg_irqload: u64,
    /// Tick count of the last IRQ.
    pub irqload_ts: u64,
    /// Task handed to an in-flight active balance from this core.
    pub push_task: Option<TaskId>,
    pub clock_anomalies: u64,
    pub migration_clamps: u64,
    #[serde(skip)]
    clock_warned: bool,
}

impl CoreLoad {
    pub fn activate(&mut self, window_start: TimeNs) {
        *self = CoreLoad {
            window_start: Some(window_start),
            ..Default::default()
        };
    }

    fn clock_anomaly(&mut self, what: &str, now: TimeNs, reference: TimeNs) {
        self.clock_anomalies += 1;
        if !self.clock_warned {
            self.clock_warned = true;
            warn!("WALT wallclock appears to have gone backwards or reset: {what} {reference} > now {now}");
        }
    }

    /// Advance `window_start` by every whole window elapsed up to `now`.
    /// Returns the number of windows advanced. On rollover the cumulative
    /// window demand restarts from the runnable demand.
    pub fn on_window_maybe_roll(&mut self, now: TimeNs, window_ns: TimeNs) -> u64 {
        let Some(window_start) = self.window_start else {
            return 0;
        };

        if now < window_start {
            self.clock_anomaly("window_start", now, window_start);
            return 0;
        }

        let nr_windows = (now - window_start) / window_ns;
        if nr_windows == 0 {
            return 0;
        }

        self.window_start = Some(window_start + nr_windows * window_ns);
        self.cum_window_demand = self.cumulative_runnable_avg;
        nr_windows
    }

    /// Re-evaluate the busy hysteresis with the window that just closed.
    pub fn classify_busy(&mut self, core: &CoreCtx) {
        let limit = busy_limit(core.cfg.window_ns, core.cfg.busy_threshold_pct, core.capacity_orig);
        self.busy = self.busy.advance(self.prev_runnable_sum, limit);
    }

    /// Account the interval since `task.mark_start` for `event` and leave
    /// `task.mark_start` at `now`.
    pub fn on_task_update(
        &mut self,
        task: &mut TaskLoad,
        tctx: &TaskCtx,
        core: &CoreCtx,
        event: TaskEvent,
        now: TimeNs,
        irqtime: u64,
    ) {
        let Some(window_start) = self.window_start else {
            return;
        };

        let now = if now < window_start {
            self.clock_anomaly("window_start", now, window_start);
            window_start
        } else {
            now
        };

        let rolled = self.on_window_maybe_roll(now, core.cfg.window_ns) > 0;

        if let Some(mark_start) = task.mark_start {
            let mark_start = if mark_start > now {
                self.clock_anomaly("mark_start", now, mark_start);
                now
            } else {
                mark_start
            };
            self.update_task_demand(task, tctx, core, event, now, mark_start);
            self.update_cpu_busy_time(task, tctx, core, event, now, mark_start, irqtime);
        }

        if rolled {
            self.classify_busy(core);
        }

        trace!(
            "update_task_ravg: task={:?} idle={} event={} now={} ws={:?} ms={:?} \
             sum={} demand={} cs={} ps={} cur_window={} prev_window={} cra={} cwd={}",
            tctx.id,
            tctx.is_idle,
            event,
            now,
            self.window_start,
            task.mark_start,
            task.sum,
            task.demand,
            self.curr_runnable_sum,
            self.prev_runnable_sum,
            task.curr_window,
            task.prev_window,
            self.cumulative_runnable_avg,
            self.cum_window_demand
        );

        task.mark_start = Some(now);
    }

    fn fixup_cum_window_demand(&mut self, delta: i128) {
        let value = self.cum_window_demand as i128 + delta;
        self.cum_window_demand = value.max(0) as u64;
    }

    /// Replace the contribution of a queued task's `old` demand to the
    /// cumulative averages with `new`.
    fn fixup_cumulative_runnable_avg(&mut self, old: u64, new: u64) {
        let delta = new as i128 - old as i128;
        let cra = self.cumulative_runnable_avg as i128 + delta;
        if cra < 0 {
            invariant_violation(format_args!(
                "cumulative_runnable_avg below zero: cra={} delta={}",
                self.cumulative_runnable_avg, delta
            ));
        }
        self.cumulative_runnable_avg = cra.max(0) as u64;
        self.fixup_cum_window_demand(delta);
    }

    /// Add a task's demand to the runnable aggregate.
    pub fn on_enqueue(&mut self, task: &TaskLoad, kind: EnqueueKind) {
        self.cumulative_runnable_avg += task.demand;

        // A task still counted as on the runqueue, or waking for the first
        // time in this window, has not been counted in the window demand.
        let window_start = self.window_start.unwrap_or(0);
        let slept_in_window = task.last_sleep_ts.is_some_and(|ts| ts >= window_start);
        if kind != EnqueueKind::Wakeup || !slept_in_window {
            self.fixup_cum_window_demand(task.demand as i128);
        }
    }

    /// Remove a task's demand from the runnable aggregate.
    pub fn on_dequeue(&mut self, task: &TaskLoad, kind: DequeueKind) {
        match self.cumulative_runnable_avg.checked_sub(task.demand) {
            Some(cra) => self.cumulative_runnable_avg = cra,
            None => {
                invariant_violation(format_args!(
                    "cumulative_runnable_avg {} below task demand {}",
                    self.cumulative_runnable_avg, task.demand
                ));
                self.cumulative_runnable_avg = 0;
            }
        }

        // A sleeping task keeps counting towards this window's demand.
        if kind != DequeueKind::Sleep {
            self.fixup_cum_window_demand(-(task.demand as i128));
        }
    }

    fn account_busy_for_task_demand(tctx: &TaskCtx, core: &CoreCtx, event: TaskEvent) -> bool {
        if tctx.exiting || tctx.is_idle {
            return false;
        }

        let account_wait_time = tctx.group_wait_time || core.cfg.account_wait_time;

        // Waking up, and starting to run or migrating while wait time is not
        // busy time, all close a segment of non-busy time.
        !(event == TaskEvent::TaskWake
            || (!account_wait_time
                && (event == TaskEvent::PickNextTask || event == TaskEvent::TaskMigrate)))
    }

    fn add_to_task_demand(task: &mut TaskLoad, core: &CoreCtx, delta: u64) {
        let window = core.cfg.window_ns;
        let delta = core.scale_exec_time(delta);
        task.sum = (task.sum + delta).min(window);

        if core.cfg.cross_window_util {
            task.sum_latest = (task.sum_latest + delta).min(window);
        }
    }

    fn update_task_demand(
        &mut self,
        task: &mut TaskLoad,
        tctx: &TaskCtx,
        core: &CoreCtx,
        event: TaskEvent,
        now: TimeNs,
        mark_start: TimeNs,
    ) {
        let window_start = self.window_start.unwrap_or(0);
        let window = core.cfg.window_ns;
        let cross_window = core.cfg.cross_window_util;
        let new_window = mark_start < window_start;

        if !Self::account_busy_for_task_demand(tctx, core, event) {
            // Only the window in which the task was last busy needs closing.
            // Empty windows are not recorded.
            if new_window {
                let runtime = task.sum;
                self.predict_demand(task, tctx, core, runtime, 1, event);
            }
            if cross_window {
                task.sum_latest = 0;
            }
            return;
        }

        if !new_window {
            Self::add_to_task_demand(task, core, now - mark_start);
        } else {
            // Busy time spans at least two windows: close the window
            // mark_start falls in, record any fully busy windows, then start
            // the current one.
            let nr_full_windows = (window_start - mark_start) / window;
            let first_boundary = window_start - nr_full_windows * window;

            Self::add_to_task_demand(task, core, first_boundary - mark_start);
            let runtime = task.sum;
            self.predict_demand(task, tctx, core, runtime, 1, event);
            if cross_window {
                task.sum = task.sum_latest;
            }

            if nr_full_windows > 0 {
                let window_scale = core.scale_exec_time(window);
                self.predict_demand(task, tctx, core, window_scale, nr_full_windows, event);
                if cross_window {
                    task.sum = window_scale;
                    task.sum_latest = window_scale;
                }
            }

            Self::add_to_task_demand(task, core, now - window_start);
        }

        // Let demand follow a window in progress that already exceeds it.
        if task.sum > task.demand && core.cfg.window_stats_policy == WindowStatsPolicy::Max {
            let sum = task.sum;
            self.refresh_aggregates(task, tctx, sum);
            task.demand = sum;
            task.demand_scale = scale_demand(sum, window);
        }
    }

    /// Propagate a change of `task`'s demand to `new_demand` to this core's
    /// aggregates.
    fn refresh_aggregates(&mut self, task: &TaskLoad, tctx: &TaskCtx, new_demand: u64) {
        if tctx.queued {
            self.fixup_cumulative_runnable_avg(task.demand, new_demand);
        } else if tctx.is_curr {
            // Running but already dequeued: the rollover snapshot of the
            // runnable demand did not include it.
            self.fixup_cum_window_demand(new_demand as i128);
        }
    }

    /// Push `samples` copies of `runtime` into the task's history and
    /// recompute its demand according to the configured policy.
    pub fn predict_demand(
        &mut self,
        task: &mut TaskLoad,
        tctx: &TaskCtx,
        core: &CoreCtx,
        runtime: u64,
        samples: u64,
        event: TaskEvent,
    ) {
        // Windows with no activity are ignored.
        if runtime == 0 || tctx.is_idle || tctx.exiting || samples == 0 {
            return;
        }

        let hist_size = core.cfg.hist_size.clamp(1, RAVG_HIST_SIZE_MAX);
        let hist = &mut task.sum_history[..hist_size];
        let shift = (samples as usize).min(hist_size);
        hist.rotate_right(shift);
        hist[..shift].fill(runtime);

        let max = hist.iter().copied().max().unwrap_or(0);
        let sum: u64 = hist.iter().sum();

        task.sum = 0;

        let demand = match core.cfg.window_stats_policy {
            WindowStatsPolicy::Recent => runtime,
            WindowStatsPolicy::Max => max,
            WindowStatsPolicy::Avg => sum / hist_size as u64,
            WindowStatsPolicy::MaxRecentAvg => (sum / hist_size as u64).max(runtime),
        };

        self.refresh_aggregates(task, tctx, demand);

        task.demand = demand;
        task.demand_scale = scale_demand(demand, core.cfg.window_ns);

        trace!(
            "update_history: task={:?} runtime={} samples={} event={} demand={} hist={:?}",
            tctx.id,
            runtime,
            samples,
            event,
            task.demand,
            &task.sum_history[..hist_size]
        );
    }

    fn account_busy_for_cpu_time(
        tctx: &TaskCtx,
        core: &CoreCtx,
        event: TaskEvent,
        irqtime: u64,
    ) -> bool {
        if tctx.is_idle {
            // The idle task is never woken or migrated.
            if event == TaskEvent::PickNextTask {
                return false;
            }
            return irqtime > 0 || core.waiting_on_io();
        }

        matches!(
            event,
            TaskEvent::PutPrevTask | TaskEvent::IrqUpdate | TaskEvent::TaskUpdate
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn update_cpu_busy_time(
        &mut self,
        task: &mut TaskLoad,
        tctx: &TaskCtx,
        core: &CoreCtx,
        event: TaskEvent,
        now: TimeNs,
        mark_start: TimeNs,
        irqtime: u64,
    ) {
        let window_start = self.window_start.unwrap_or(0);
        let window = core.cfg.window_ns;
        let new_window = mark_start < window_start;
        let nr_full_windows = if new_window {
            (window_start - mark_start) / window
        } else {
            0
        };
        let tracks_task = !tctx.is_idle && !tctx.exiting;

        // Roll the task's own window contributions.
        if new_window && tracks_task {
            task.prev_window = if nr_full_windows == 0 {
                task.curr_window
            } else {
                0
            };
            task.curr_window = 0;
        }

        if !Self::account_busy_for_cpu_time(tctx, core, event, irqtime) {
            // The core's counters roll over with the running task only.
            if new_window && tctx.is_curr {
                self.prev_runnable_sum = if nr_full_windows == 0 {
                    self.curr_runnable_sum
                } else {
                    0
                };
                self.curr_runnable_sum = 0;
            }
            return;
        }

        let irq_only = irqtime > 0 && tctx.is_idle && !core.waiting_on_io();

        if !new_window {
            let delta = if irq_only { irqtime } else { now - mark_start };
            let delta = core.scale_exec_time(delta);
            self.curr_runnable_sum += delta;
            if tracks_task {
                task.curr_window += delta;
            }
            return;
        }

        if !tctx.is_curr {
            // Split across the boundary without rolling the core's counters;
            // that happens with the running task.
            let delta = if nr_full_windows == 0 {
                let delta = core.scale_exec_time(window_start - mark_start);
                if !tctx.exiting {
                    task.prev_window += delta;
                }
                delta
            } else {
                let delta = core.scale_exec_time(window);
                if !tctx.exiting {
                    task.prev_window = delta;
                }
                delta
            };
            self.prev_runnable_sum += delta;

            let delta = core.scale_exec_time(now - window_start);
            self.curr_runnable_sum += delta;
            if !tctx.exiting {
                task.curr_window = delta;
            }
            return;
        }

        if !irq_only {
            let prev = if nr_full_windows == 0 {
                let delta = core.scale_exec_time(window_start - mark_start);
                if tracks_task {
                    task.prev_window += delta;
                }
                delta + self.curr_runnable_sum
            } else {
                let delta = core.scale_exec_time(window);
                if tracks_task {
                    task.prev_window = delta;
                }
                delta
            };
            self.prev_runnable_sum = prev;

            let delta = core.scale_exec_time(now - window_start);
            self.curr_runnable_sum = delta;
            if tracks_task {
                task.curr_window = delta;
            }
            return;
        }

        // IRQ time on an idle core that crossed a boundary. The IRQ busy
        // period started at now - irqtime.
        let irq_start = now.saturating_sub(irqtime);
        self.prev_runnable_sum = self.curr_runnable_sum;
        if irq_start > window_start {
            self.curr_runnable_sum = core.scale_exec_time(irqtime);
            return;
        }

        let delta = (window_start - irq_start).min(window);
        self.prev_runnable_sum += core.scale_exec_time(delta);
        self.curr_runnable_sum = core.scale_exec_time(now - window_start);
    }

    /// Fold `delta` ns of IRQ time into the decayed IRQ load. `jiffies` is
    /// the current tick count.
    pub fn account_irqtime(&mut self, jiffies: u64, delta: u64) {
        let nr_windows = jiffies.saturating_sub(self.irqload_ts);

        if nr_windows > 0 {
            if nr_windows < 10 {
                // Decay by 3/4 per elapsed tick.
                self.avg_irqload = self.avg_irqload * (3 * nr_windows) / (4 * nr_windows);
            } else {
                self.avg_irqload = 0;
            }
            self.avg_irqload += self.cur_irqload;
            self.cur_irqload = 0;
        }

        self.cur_irqload += delta;
        self.irqload_ts = jiffies;
    }

    pub fn is_high_irqload(&self, jiffies: u64, threshold: u64) -> bool {
        let irq_load = if jiffies.saturating_sub(self.irqload_ts) < HIGH_IRQ_TIMEOUT {
            self.avg_irqload
        } else {
            0
        };
        irq_load >= threshold
    }

    /// Utilization of the runnable demand.
    pub fn cpu_util(&self, window_ns: TimeNs, capacity_orig: u64) -> u64 {
        util_of(self.cumulative_runnable_avg, window_ns).min(capacity_orig)
    }

    /// Utilization used for frequency selection. A busy core, or any core
    /// when I/O wait counts as busy, reports at least its previous window.
    pub fn cpu_util_freq(&self, cfg: &WaltConfig, capacity_orig: u64) -> u64 {
        let mut util = util_of(self.cumulative_runnable_avg, cfg.window_ns);
        if self.busy.is_set() || cfg.io_is_busy {
            util = util.max(util_of(self.prev_runnable_sum, cfg.window_ns));
        }
        util.min(capacity_orig)
    }

    pub fn effective_cpu_util(&self, window_ns: TimeNs, capacity_orig: u64) -> u64 {
        util_of(self.cumulative_runnable_avg, window_ns)
            .max(util_of(self.prev_runnable_sum, window_ns))
            .min(capacity_orig)
    }

    /// Previous window busy time as utilization.
    pub fn prev_window_util(&self, window_ns: TimeNs, capacity_orig: u64) -> u64 {
        util_of(self.prev_runnable_sum, window_ns).min(capacity_orig)
    }
}

/// Outcome of moving a task's window contributions between two cores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationTransfer {
    pub curr_window: u64,
    pub prev_window: u64,
    /// The waking task's window demand moved along.
    pub moved_window_demand: bool,
    /// A source counter would have gone negative and was clamped.
    pub clamped: bool,
}

/// Move `task`'s contributions from `src` to `dst`. Both cores must be
/// locked and both must have been brought up to date at the same instant.
pub fn on_migrate(
    task: &TaskLoad,
    task_id: TaskId,
    src: &mut CoreLoad,
    dst: &mut CoreLoad,
    waking: bool,
) -> MigrationTransfer {
    let mut xfer = MigrationTransfer {
        curr_window: task.curr_window,
        prev_window: task.prev_window,
        ..Default::default()
    };

    // A waking task's demand only moves if it was counted in the source
    // window, i.e. it went to sleep after the window started.
    let src_window_start = src.window_start.unwrap_or(0);
    if waking && task.last_sleep_ts.is_some_and(|ts| ts >= src_window_start) {
        src.fixup_cum_window_demand(-(task.demand as i128));
        dst.fixup_cum_window_demand(task.demand as i128);
        xfer.moved_window_demand = true;
    }

    for (value, src_sum, dst_sum, name) in [
        (
            task.curr_window,
            &mut src.curr_runnable_sum,
            &mut dst.curr_runnable_sum,
            "curr_runnable_sum",
        ),
        (
            task.prev_window,
            &mut src.prev_runnable_sum,
            &mut dst.prev_runnable_sum,
            "prev_runnable_sum",
        ),
    ] {
        if value == 0 {
            continue;
        }
        *dst_sum += value;
        match src_sum.checked_sub(value) {
            Some(left) => *src_sum = left,
            None => {
                warn!(
                    "{task_id}: source {name} {} below migrating contribution {}, clamping",
                    src_sum, value
                );
                *src_sum = 0;
                xfer.clamped = true;
            }
        }
    }

    if xfer.clamped {
        src.migration_clamps += 1;
    }

    trace!(
        "migration_update_sum: {task_id} src cs={} ps={} dst cs={} ps={}",
        src.curr_runnable_sum,
        src.prev_runnable_sum,
        dst.curr_runnable_sum,
        dst.prev_runnable_sum
    );

    xfer
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn cfg() -> WaltConfig {
        WaltConfig::default()
    }

    fn core_ctx(cfg: &WaltConfig, cap: u64) -> CoreCtx<'_> {
        CoreCtx {
            cfg,
            capacity_orig: cap,
            freq_capacity: 1024,
            nr_iowait: 0,
        }
    }

    fn running() -> TaskCtx {
        TaskCtx {
            id: Some(TaskId(1)),
            is_curr: true,
            queued: true,
            ..Default::default()
        }
    }

    fn active_core(start: TimeNs) -> CoreLoad {
        let mut core = CoreLoad::default();
        core.activate(start);
        core
    }

    #[test]
    fn test_scale_exec_time() {
        let cfg = cfg();
        let mut ctx = core_ctx(&cfg, 512);
        assert_eq!(ctx.scale_exec_time(8 * MS), 4 * MS);
        ctx.freq_capacity = 512;
        assert_eq!(ctx.scale_exec_time(8 * MS), 2 * MS);
    }

    #[test]
    fn test_continuous_run_fills_history() {
        let cfg = cfg();
        let ctx = core_ctx(&cfg, 1024);
        let mut core = active_core(0);
        let mut task = TaskLoad::new_task(cfg.init_load_windows(10), cfg.window_ns);
        task.mark_start = Some(0);
        core.on_enqueue(&task, EnqueueKind::Wakeup);
        let tctx = running();

        let mut now = 0;
        while now < 48 * MS {
            now += 4 * MS;
            core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::TaskUpdate, now, 0);
        }
        core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::PutPrevTask, 50 * MS, 0);

        assert_eq!(core.window_start, Some(48 * MS));
        assert_eq!(&task.sum_history[..3], &[16 * MS; 3]);
        assert_eq!(task.curr_window, 2 * MS);
        assert_eq!(task.prev_window, 16 * MS);
        assert_eq!(task.demand, 16 * MS);
        assert_eq!(task.demand_scale, 1024);
        assert_eq!(core.cumulative_runnable_avg, 16 * MS);
        assert_eq!(core.prev_runnable_sum, 16 * MS);
        assert_eq!(core.curr_runnable_sum, 2 * MS);
    }

    #[test]
    fn test_same_timestamp_is_idempotent() {
        let cfg = cfg();
        let ctx = core_ctx(&cfg, 1024);
        let mut core = active_core(0);
        let mut task = TaskLoad::existing_task();
        task.mark_start = Some(0);
        let tctx = running();

        core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::TaskUpdate, 3 * MS, 0);
        let (sum, cs) = (task.sum, core.curr_runnable_sum);
        core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::TaskUpdate, 3 * MS, 0);
        assert_eq!(task.sum, sum);
        assert_eq!(core.curr_runnable_sum, cs);
        assert_eq!(task.mark_start, Some(3 * MS));
    }

    #[test]
    fn test_backwards_clock_charges_nothing() {
        let cfg = cfg();
        let ctx = core_ctx(&cfg, 1024);
        let mut core = active_core(16 * MS);
        let mut task = TaskLoad::existing_task();
        task.mark_start = Some(20 * MS);
        let tctx = running();

        core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::TaskUpdate, 18 * MS, 0);
        assert_eq!(task.sum, 0);
        assert_eq!(core.curr_runnable_sum, 0);
        assert_eq!(core.clock_anomalies, 1);

        core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::TaskUpdate, 10 * MS, 0);
        assert_eq!(core.window_start, Some(16 * MS));
        assert_eq!(core.curr_runnable_sum, 0);
        assert_eq!(task.mark_start, Some(16 * MS));
        assert_eq!(core.clock_anomalies, 3);
    }

    #[test]
    fn test_wake_closes_window_without_busy_time() {
        let cfg = cfg();
        let ctx = core_ctx(&cfg, 1024);
        let mut core = active_core(0);
        let mut task = TaskLoad::existing_task();
        task.mark_start = Some(0);
        let tctx = running();

        core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::PutPrevTask, 6 * MS, 0);
        assert_eq!(task.sum, 6 * MS);

        let sleeping = TaskCtx {
            id: Some(TaskId(1)),
            ..Default::default()
        };
        core.on_task_update(&mut task, &sleeping, &ctx, TaskEvent::TaskWake, 40 * MS, 0);
        assert_eq!(task.sum_history[0], 6 * MS);
        assert_eq!(task.sum_history[1], 0);
        assert_eq!(task.sum, 0);
        assert_eq!(task.demand, 6 * MS);
    }

    #[test]
    fn test_policies() {
        for (policy, expected) in [
            (WindowStatsPolicy::Recent, 2 * MS),
            (WindowStatsPolicy::Max, 12 * MS),
            (WindowStatsPolicy::Avg, 3 * MS),
            (WindowStatsPolicy::MaxRecentAvg, 3 * MS),
        ] {
            let cfg = WaltConfig {
                window_stats_policy: policy,
                ..Default::default()
            };
            let ctx = core_ctx(&cfg, 1024);
            let mut core = active_core(0);
            let mut task = TaskLoad::existing_task();
            let tctx = TaskCtx::default();
            core.predict_demand(&mut task, &tctx, &ctx, 12 * MS, 1, TaskEvent::TaskUpdate);
            core.predict_demand(&mut task, &tctx, &ctx, 4 * MS, 1, TaskEvent::TaskUpdate);
            core.predict_demand(&mut task, &tctx, &ctx, 2 * MS, 1, TaskEvent::TaskUpdate);
            assert_eq!(task.demand, expected, "{policy:?}");
        }
    }

    #[test]
    fn test_predict_demand_fixes_up_queued_aggregate() {
        let cfg = cfg();
        let ctx = core_ctx(&cfg, 1024);
        let mut core = active_core(16 * MS);
        let mut task = TaskLoad::new_task(2 * MS, cfg.window_ns);
        core.on_enqueue(&task, EnqueueKind::Wakeup);
        assert_eq!(core.cumulative_runnable_avg, 2 * MS);
        assert_eq!(core.cum_window_demand, 2 * MS);

        let tctx = TaskCtx {
            queued: true,
            ..Default::default()
        };
        core.predict_demand(&mut task, &tctx, &ctx, 10 * MS, 1, TaskEvent::TaskUpdate);
        assert_eq!(task.demand, 10 * MS);
        assert_eq!(core.cumulative_runnable_avg, 10 * MS);
        assert_eq!(core.cum_window_demand, 10 * MS);

        core.on_dequeue(&task, DequeueKind::Sleep);
        assert_eq!(core.cumulative_runnable_avg, 0);
        assert_eq!(core.cum_window_demand, 10 * MS);
    }

    #[test]
    #[should_panic(expected = "invariant")]
    fn test_cra_underflow_is_fatal_in_debug() {
        let mut core = active_core(0);
        let task = TaskLoad::new_task(MS, 16 * MS);
        core.on_dequeue(&task, DequeueKind::Sleep);
    }

    #[test]
    fn test_irq_time_on_idle_core() {
        let cfg = cfg();
        let ctx = core_ctx(&cfg, 1024);
        let mut core = active_core(0);
        let mut idle = TaskLoad::existing_task();
        idle.mark_start = Some(0);
        let idle_ctx = TaskCtx {
            is_idle: true,
            is_curr: true,
            ..Default::default()
        };

        core.on_task_update(&mut idle, &idle_ctx, &ctx, TaskEvent::IrqUpdate, 5 * MS, MS);
        assert_eq!(core.curr_runnable_sum, MS);

        // Spans the boundary at 16ms: 2ms before it, 1ms after.
        core.on_task_update(&mut idle, &idle_ctx, &ctx, TaskEvent::IrqUpdate, 17 * MS, 3 * MS);
        assert_eq!(core.prev_runnable_sum, 3 * MS);
        assert_eq!(core.curr_runnable_sum, MS);
        assert_eq!(idle.curr_window, 0);
    }

    #[test]
    fn test_irqload_decay() {
        let mut core = CoreLoad::default();
        core.account_irqtime(10, 4 * MS);
        assert_eq!(core.cur_irqload, 4 * MS);
        core.account_irqtime(11, 8 * MS);
        assert_eq!(core.avg_irqload, 4 * MS);
        assert_eq!(core.cur_irqload, 8 * MS);
        core.account_irqtime(12, 0);
        assert_eq!(core.avg_irqload, 3 * MS + 8 * MS);
        assert!(core.is_high_irqload(13, 10 * MS));
        assert!(!core.is_high_irqload(15, 10 * MS));
        core.account_irqtime(30, 0);
        assert_eq!(core.avg_irqload, 0);
    }

    #[test]
    fn test_migration_transfer_and_clamp() {
        let mut src = active_core(0);
        let mut dst = active_core(0);
        src.curr_runnable_sum = 6 * MS;
        src.prev_runnable_sum = MS;
        src.cum_window_demand = 5 * MS;
        let mut task = TaskLoad::new_task(5 * MS, 16 * MS);
        task.curr_window = 4 * MS;
        task.prev_window = 2 * MS;
        task.last_sleep_ts = Some(3 * MS);

        let xfer = on_migrate(&task, TaskId(7), &mut src, &mut dst, true);
        assert!(xfer.moved_window_demand);
        assert!(xfer.clamped);
        assert_eq!(src.curr_runnable_sum, 2 * MS);
        assert_eq!(src.prev_runnable_sum, 0);
        assert_eq!(dst.curr_runnable_sum, 4 * MS);
        assert_eq!(dst.prev_runnable_sum, 2 * MS);
        assert_eq!(src.cum_window_demand, 0);
        assert_eq!(dst.cum_window_demand, 5 * MS);
        assert_eq!(src.migration_clamps, 1);
    }

    #[test]
    fn test_stale_sleep_does_not_move_window_demand() {
        let mut src = active_core(16 * MS);
        let mut dst = active_core(16 * MS);
        src.cum_window_demand = 5 * MS;
        let mut task = TaskLoad::new_task(5 * MS, 16 * MS);
        task.last_sleep_ts = Some(10 * MS);

        let xfer = on_migrate(&task, TaskId(7), &mut src, &mut dst, true);
        assert!(!xfer.moved_window_demand);
        assert_eq!(src.cum_window_demand, 5 * MS);
        assert_eq!(dst.cum_window_demand, 0);
    }

    #[test]
    fn test_cross_window_util_carries_busy_run() {
        // Runs 0-12ms, then on across the 16ms boundary until 20ms.
        let run = |cross_window_util: bool| {
            let cfg = WaltConfig {
                cross_window_util,
                ..cfg()
            };
            let ctx = core_ctx(&cfg, 1024);
            let mut core = active_core(0);
            let mut task = TaskLoad::new_task(cfg.init_load_windows(10), cfg.window_ns);
            task.mark_start = Some(0);
            core.on_enqueue(&task, EnqueueKind::Wakeup);
            let tctx = running();
            core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::TaskUpdate, 12 * MS, 0);
            core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::PutPrevTask, 20 * MS, 0);
            task
        };

        let on = run(true);
        assert_eq!(on.sum_history[0], 16 * MS);
        assert_eq!(on.demand, 16 * MS);
        assert_eq!(on.sum, 16 * MS);
        assert_eq!(on.sum_latest, 16 * MS);

        let off = run(false);
        assert_eq!(off.sum_history[0], 16 * MS);
        assert_eq!(off.demand, 16 * MS);
        assert_eq!(off.sum, 4 * MS);
        assert_eq!(off.sum_latest, 0);
    }

    #[test]
    fn test_busy_hysteresis_on_rollover() {
        let cfg = cfg();
        let ctx = core_ctx(&cfg, 1024);
        let mut core = active_core(0);
        let mut task = TaskLoad::existing_task();
        task.mark_start = Some(0);
        let tctx = running();

        core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::TaskUpdate, 16 * MS, 0);
        assert_eq!(core.busy, BusyState::Prepare);
        core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::TaskUpdate, 32 * MS, 0);
        assert_eq!(core.busy, BusyState::Set);
        assert_eq!(core.cpu_util_freq(&cfg, 1024), 1024);

        core.on_task_update(&mut task, &tctx, &ctx, TaskEvent::PutPrevTask, 33 * MS, 0);
        let mut idle = TaskLoad::existing_task();
        idle.mark_start = Some(33 * MS);
        let idle_ctx = TaskCtx {
            is_idle: true,
            is_curr: true,
            ..Default::default()
        };
        core.on_task_update(&mut idle, &idle_ctx, &ctx, TaskEvent::TaskUpdate, 48 * MS, 0);
        assert_eq!(core.prev_runnable_sum, MS);
        assert_eq!(core.busy, BusyState::Clear);
    }
}
