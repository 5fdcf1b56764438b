// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-core runqueue record: the core's load tracking state plus the part of
//! the host runqueue the tracker and placement logic look at.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::config::WaltConfig;
use crate::tracker::CoreCtx;
use crate::tracker::CoreLoad;
use crate::tracker::TaskLoad;
use crate::types::CpuId;
use crate::types::SchedClass;
use crate::types::TaskId;
use crate::types::TimeNs;
use crate::types::SCHED_CAPACITY_SCALE;
use crate::uclamp::RqClamp;

#[derive(Debug)]
pub struct Rq {
    pub cpu: CpuId,
    pub online: bool,
    /// Running task, `None` while idle.
    pub curr: Option<TaskId>,
    pub curr_class: SchedClass,
    /// When `curr` was switched in.
    pub curr_start: TimeNs,
    /// Queued tasks, including a running one that has not been dequeued.
    pub runnable: BTreeSet<TaskId>,
    /// Queued RT tasks by priority.
    rt_prios: BTreeMap<u32, u32>,
    pub nr_iowait: u32,
    /// Current frequency in capacity units.
    pub freq_capacity: u64,
    pub thermal_pressure: u64,
    pub idle_exit_latency: u32,
    /// Utilization of the running misfit task, zero when none.
    pub misfit_task_load: u64,
    pub active_balance: bool,
    pub clamp: RqClamp,
    pub load: CoreLoad,
    /// Load of the core's idle task.
    pub idle: TaskLoad,
}

impl Rq {
    pub fn new(cpu: CpuId) -> Rq {
        Rq {
            cpu,
            online: true,
            curr: None,
            curr_class: SchedClass::Fair,
            curr_start: 0,
            runnable: BTreeSet::new(),
            rt_prios: BTreeMap::new(),
            nr_iowait: 0,
            freq_capacity: SCHED_CAPACITY_SCALE,
            thermal_pressure: 0,
            idle_exit_latency: 0,
            misfit_task_load: 0,
            active_balance: false,
            clamp: RqClamp::default(),
            load: CoreLoad::default(),
            idle: TaskLoad::existing_task(),
        }
    }

    pub fn nr_running(&self) -> usize {
        self.runnable.len()
    }

    pub fn is_idle(&self) -> bool {
        self.curr.is_none() && self.runnable.is_empty()
    }

    /// Thermally derated capacity.
    pub fn capacity(&self, capacity_orig: u64) -> u64 {
        capacity_orig.saturating_sub(self.thermal_pressure)
    }

    pub fn core_ctx<'a>(&self, cfg: &'a WaltConfig, capacity_orig: u64) -> CoreCtx<'a> {
        CoreCtx {
            cfg,
            capacity_orig,
            freq_capacity: self.freq_capacity,
            nr_iowait: self.nr_iowait,
        }
    }

    pub fn inc_rt(&mut self, prio: u32) {
        *self.rt_prios.entry(prio).or_insert(0) += 1;
    }

    pub fn dec_rt(&mut self, prio: u32) {
        if let Some(count) = self.rt_prios.get_mut(&prio) {
            *count -= 1;
            if *count == 0 {
                self.rt_prios.remove(&prio);
            }
        }
    }

    /// Highest queued RT priority, lower values being more important.
    pub fn highest_rt_prio(&self) -> Option<u32> {
        self.rt_prios.keys().next().copied()
    }

    pub fn curr_rt_prio(&self) -> Option<u32> {
        match (self.curr, self.curr_class) {
            (Some(_), SchedClass::Rt { prio }) => Some(prio),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rt_prio_tracking() {
        let mut rq = Rq::new(CpuId(0));
        assert!(rq.is_idle());
        rq.inc_rt(50);
        rq.inc_rt(10);
        rq.inc_rt(10);
        assert_eq!(rq.highest_rt_prio(), Some(10));
        rq.dec_rt(10);
        assert_eq!(rq.highest_rt_prio(), Some(10));
        rq.dec_rt(10);
        assert_eq!(rq.highest_rt_prio(), Some(50));

        rq.curr = Some(TaskId(1));
        rq.curr_class = SchedClass::Rt { prio: 50 };
        assert_eq!(rq.curr_rt_prio(), Some(50));
        assert_eq!(rq.capacity(512), 512);
        rq.thermal_pressure = 600;
        assert_eq!(rq.capacity(512), 0);
    }
}
