// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Misfit detection, active balance and rotation decisions.
//!
//! Everything here decides; nothing here moves tasks. The moves are carried
//! out by the per-core workers, which re-validate the decision under the
//! locks of both cores involved.

use serde::Serialize;

use crate::config::WaltConfig;
use crate::topology::Topology;
use crate::types::CpuId;
use crate::types::TaskId;
use crate::types::TimeNs;
use crate::types::SCHED_CAPACITY_SCALE;

/// `util` fits `capacity` with `margin` (in 1/1024 units) of headroom.
pub fn task_fits_capacity(util: u64, capacity: u64, margin: u64) -> bool {
    capacity * SCHED_CAPACITY_SCALE > util * margin
}

/// Misfit load of `cpu` running a task of utilization `util`. Never zero
/// for a misfit task. Tasks on the biggest cores never misfit.
pub fn check_misfit(topo: &Topology, cfg: &WaltConfig, cpu: CpuId, capacity: u64, util: u64) -> u64 {
    if topo.is_max_capacity_cpu(cpu) {
        return 0;
    }

    let margin = cfg.margin_down(topo.cluster_of(cpu).id);
    if task_fits_capacity(util, capacity, margin) {
        0
    } else {
        util.max(1)
    }
}

/// A misfit on `src` may only be pushed to a strictly bigger core.
pub fn is_upmigration(topo: &Topology, src: CpuId, dst: CpuId) -> bool {
    src != dst && topo.capacity_orig(dst) > topo.capacity_orig(src)
}

/// What the rotation logic needs to know about a core.
#[derive(Debug, Clone)]
pub struct CoreView {
    pub cpu: CpuId,
    pub online: bool,
    pub reserved: bool,
    pub misfit_task_load: u64,
    pub curr: Option<TaskId>,
    pub curr_is_fair: bool,
    /// When the running task was last enqueued.
    pub curr_enqueue_ts: TimeNs,
    pub nr_running: usize,
}

/// Swap of a starved misfit task on a little core with a task that has
/// held a bigger core uncontended for long enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RotationPlan {
    pub src_cpu: CpuId,
    pub src_task: TaskId,
    pub dst_cpu: CpuId,
    pub dst_task: TaskId,
}

/// Evaluate the rotation trigger on behalf of `calling`. Only the little
/// core whose misfit task has waited longest may start a rotation.
pub fn find_rotation(
    topo: &Topology,
    cfg: &WaltConfig,
    views: &[CoreView],
    calling: CpuId,
    now: TimeNs,
) -> Option<RotationPlan> {
    if !cfg.rotation_enable || !topo.is_min_capacity_cpu(calling) {
        return None;
    }

    let nr_misfit = views
        .iter()
        .filter(|v| v.online && v.misfit_task_load > 0)
        .count();
    if nr_misfit < cfg.rotation_misfit_threshold.max(1) {
        return None;
    }

    let mut src: Option<(TimeNs, &CoreView, TaskId)> = None;
    for v in views.iter() {
        if !v.online || v.reserved || v.misfit_task_load == 0 || !topo.is_min_capacity_cpu(v.cpu) {
            continue;
        }
        let Some(task) = v.curr else {
            continue;
        };
        let wait = now.saturating_sub(v.curr_enqueue_ts);
        if src.map_or(true, |(max_wait, _, _)| wait > max_wait) {
            src = Some((wait, v, task));
        }
    }

    let (_, src, src_task) = src?;
    if src.cpu != calling {
        return None;
    }

    let threshold = cfg.rotation_threshold_ns();
    let mut dst: Option<(TimeNs, &CoreView, TaskId)> = None;
    for v in views.iter() {
        if !v.online || v.reserved || topo.is_min_capacity_cpu(v.cpu) || v.nr_running > 1 {
            continue;
        }
        let Some(task) = v.curr.filter(|_| v.curr_is_fair) else {
            continue;
        };
        let run = now.saturating_sub(v.curr_enqueue_ts);
        if run < threshold {
            continue;
        }
        if dst.map_or(true, |(max_run, _, _)| run > max_run) {
            dst = Some((run, v, task));
        }
    }

    let (_, dst, dst_task) = dst?;
    Some(RotationPlan {
        src_cpu: src.cpu,
        src_task,
        dst_cpu: dst.cpu,
        dst_task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn topo() -> Topology {
        Topology::new(&[512, 512, 1024, 1024]).unwrap()
    }

    fn view(cpu: usize, curr: u64, enqueued: TimeNs, misfit: u64) -> CoreView {
        CoreView {
            cpu: CpuId(cpu),
            online: true,
            reserved: false,
            misfit_task_load: misfit,
            curr: Some(TaskId(curr)),
            curr_is_fair: true,
            curr_enqueue_ts: enqueued,
            nr_running: 1,
        }
    }

    #[test]
    fn test_check_misfit() {
        let topo = topo();
        let cfg = WaltConfig::default();
        assert_eq!(check_misfit(&topo, &cfg, CpuId(0), 512, 300), 0);
        assert_eq!(check_misfit(&topo, &cfg, CpuId(0), 512, 450), 450);
        assert_eq!(check_misfit(&topo, &cfg, CpuId(2), 1024, 1024), 0);
        // Thermal pressure shrinks the capacity a task must fit in.
        assert_eq!(check_misfit(&topo, &cfg, CpuId(1), 200, 300), 300);
        assert!(is_upmigration(&topo, CpuId(0), CpuId(3)));
        assert!(!is_upmigration(&topo, CpuId(2), CpuId(3)));
    }

    #[test]
    fn test_rotation_picks_longest_waiter_and_runner() {
        let topo = topo();
        let cfg = WaltConfig {
            rotation_enable: true,
            ..Default::default()
        };
        let now = 100 * MS;
        let views = vec![
            view(0, 10, 40 * MS, 500),
            view(1, 11, 20 * MS, 500),
            view(2, 12, 50 * MS, 0),
            view(3, 13, 70 * MS, 0),
        ];

        // Only the longest waiting little core may rotate.
        assert_eq!(find_rotation(&topo, &cfg, &views, CpuId(0), now), None);

        let plan = find_rotation(&topo, &cfg, &views, CpuId(1), now).unwrap();
        assert_eq!(
            plan,
            RotationPlan {
                src_cpu: CpuId(1),
                src_task: TaskId(11),
                dst_cpu: CpuId(2),
                dst_task: TaskId(12),
            }
        );
    }

    #[test]
    fn test_rotation_requires_uncontended_long_runner() {
        let topo = topo();
        let mut cfg = WaltConfig {
            rotation_enable: true,
            ..Default::default()
        };
        let now = 100 * MS;
        let mut views = vec![
            view(0, 10, 40 * MS, 500),
            view(1, 11, 90 * MS, 0),
            view(2, 12, 50 * MS, 0),
            view(3, 13, 95 * MS, 0),
        ];
        views[2].nr_running = 2;
        assert_eq!(find_rotation(&topo, &cfg, &views, CpuId(0), now), None);

        views[2].nr_running = 1;
        views[2].reserved = true;
        assert_eq!(find_rotation(&topo, &cfg, &views, CpuId(0), now), None);

        views[2].reserved = false;
        cfg.rotation_misfit_threshold = 2;
        assert_eq!(find_rotation(&topo, &cfg, &views, CpuId(0), now), None);

        cfg.rotation_misfit_threshold = 1;
        cfg.rotation_enable = false;
        assert_eq!(find_rotation(&topo, &cfg, &views, CpuId(0), now), None);
    }
}
