// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Utilization clamping.
//!
//! Tasks may request a minimum and maximum utilization. Runqueues aggregate
//! the requests of their runnable tasks by taking the maximum of each bound.
//! With `uclamp_min_to_boost` enabled the minimum is not applied as a hard
//! floor but as a proportional boost, see [`transform_boost`].

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::config::WaltConfig;
use crate::types::SCHED_CAPACITY_SCALE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UclampReq {
    pub min: u64,
    pub max: u64,
}

impl Default for UclampReq {
    fn default() -> Self {
        Self {
            min: 0,
            max: SCHED_CAPACITY_SCALE,
        }
    }
}

impl UclampReq {
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            min: min.min(SCHED_CAPACITY_SCALE),
            max: max.min(SCHED_CAPACITY_SCALE),
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// A minimum request marks the task as boosted.
    pub fn boosted(&self) -> bool {
        self.min > 0
    }

    /// A maximum below full capacity marks the task as blocked from big
    /// cores whenever a small one will do.
    pub fn blocked(&self) -> bool {
        self.max < SCHED_CAPACITY_SCALE
    }
}

/// Boost `util` towards `max` by a `min`-weighted fraction of either the
/// utilization itself (small tasks) or the remaining headroom (large tasks).
pub fn transform_boost(util: u64, min: u64, max: u64, threshold: u64) -> u64 {
    if min > max {
        return util;
    }
    if util >= max {
        return max;
    }

    let boost = if util < threshold { util } else { max - util };
    let margin = (min * boost + SCHED_CAPACITY_SCALE / 2) / SCHED_CAPACITY_SCALE;

    util + margin
}

fn apply(util: u64, min: u64, max: u64, cfg: &WaltConfig) -> u64 {
    if cfg.uclamp_min_to_boost {
        transform_boost(util, min, max, cfg.uclamp_threshold)
    } else {
        util.clamp(min, max.max(min))
    }
}

/// Clamped utilization of a task.
pub fn task_util(util: u64, req: &UclampReq, cfg: &WaltConfig) -> u64 {
    apply(util, req.min, req.max, cfg)
}

/// Per-runqueue aggregation of the requests of its runnable tasks.
#[derive(Debug, Default, Clone)]
pub struct RqClamp {
    min: BTreeMap<u64, u32>,
    max: BTreeMap<u64, u32>,
}

/// Point-in-time values of a [`RqClamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RqClampValues {
    pub min: u64,
    pub max: u64,
    /// No runnable task contributes.
    pub idle: bool,
}

impl Default for RqClampValues {
    fn default() -> Self {
        Self {
            min: 0,
            max: SCHED_CAPACITY_SCALE,
            idle: true,
        }
    }
}

impl RqClamp {
    pub fn inc(&mut self, req: &UclampReq) {
        *self.min.entry(req.min).or_insert(0) += 1;
        *self.max.entry(req.max).or_insert(0) += 1;
    }

    pub fn dec(&mut self, req: &UclampReq) {
        for (map, value) in [(&mut self.min, req.min), (&mut self.max, req.max)] {
            if let Some(count) = map.get_mut(&value) {
                *count -= 1;
                if *count == 0 {
                    map.remove(&value);
                }
            }
        }
    }

    pub fn values(&self) -> RqClampValues {
        match (self.min.keys().next_back(), self.max.keys().next_back()) {
            (Some(min), Some(max)) => RqClampValues {
                min: *min,
                max: *max,
                idle: false,
            },
            _ => RqClampValues::default(),
        }
    }
}

/// Clamp a runqueue utilization by the runqueue's aggregated requests and,
/// when given, the requests of a task about to be placed there.
pub fn rq_util_with(
    rq: RqClampValues,
    util: u64,
    task: Option<&UclampReq>,
    uclamp_used: bool,
    cfg: &WaltConfig,
) -> u64 {
    if !uclamp_used {
        return util;
    }

    let (mut min, mut max) = (0, 0);
    if let Some(req) = task {
        min = req.min;
        max = req.max;
    }

    // An idle runqueue's stale max clamp is reset by the incoming task.
    if task.is_none() || !rq.idle {
        min = min.max(rq.min);
        max = max.max(rq.max);
    }

    if min >= max {
        return min;
    }

    apply(util, min, max, cfg)
}

/// SchedTune-style group boost: add `boost` percent of the headroom.
pub fn group_boosted_util(util: u64, boost: u32) -> u64 {
    if boost == 0 || util >= SCHED_CAPACITY_SCALE {
        return util;
    }
    util + (SCHED_CAPACITY_SCALE - util) * boost.min(100) as u64 / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_boost() {
        // Small utilization boosts proportionally to itself.
        assert_eq!(transform_boost(50, 512, 1024, 100), 75);
        // Large utilization boosts proportionally to the headroom.
        assert_eq!(transform_boost(512, 512, 1024, 100), 768);
        // Saturated.
        assert_eq!(transform_boost(900, 0, 800, 100), 800);
        // Inverted request is ignored.
        assert_eq!(transform_boost(300, 900, 800, 100), 300);
    }

    #[test]
    fn test_task_util_plain_clamp() {
        let cfg = WaltConfig {
            uclamp_min_to_boost: false,
            ..Default::default()
        };
        let req = UclampReq::new(300, 600);
        assert_eq!(task_util(100, &req, &cfg), 300);
        assert_eq!(task_util(700, &req, &cfg), 600);
        assert_eq!(task_util(400, &req, &cfg), 400);
    }

    #[test]
    fn test_rq_aggregation() {
        let mut rq = RqClamp::default();
        assert!(rq.values().idle);

        let a = UclampReq::new(200, 512);
        let b = UclampReq::new(100, 1024);
        rq.inc(&a);
        rq.inc(&b);
        assert_eq!(
            rq.values(),
            RqClampValues {
                min: 200,
                max: 1024,
                idle: false
            }
        );

        rq.dec(&b);
        assert_eq!(rq.values().max, 512);
        rq.dec(&a);
        assert!(rq.values().idle);
    }

    #[test]
    fn test_rq_util_with() {
        let cfg = WaltConfig {
            uclamp_min_to_boost: false,
            ..Default::default()
        };
        let values = RqClampValues {
            min: 0,
            max: 400,
            idle: false,
        };
        assert_eq!(rq_util_with(values, 700, None, false, &cfg), 700);
        assert_eq!(rq_util_with(values, 700, None, true, &cfg), 400);

        let idle = RqClampValues {
            min: 0,
            max: 400,
            idle: true,
        };
        let req = UclampReq::default();
        assert_eq!(rq_util_with(idle, 700, Some(&req), true, &cfg), 700);
    }

    #[test]
    fn test_group_boost() {
        assert_eq!(group_boosted_util(24, 0), 24);
        assert_eq!(group_boosted_util(24, 50), 524);
        assert_eq!(group_boosted_util(1024, 50), 1024);
    }
}
