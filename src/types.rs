// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers and type aliases for domain concepts.
//!
//! Cores, tasks and task groups are referenced by stable integer ids. Their
//! load-tracking state lives in side tables indexed by these ids, so nothing
//! here depends on how the host embeds its own scheduling entities.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Nanosecond timestamp or duration.
pub type TimeNs = u64;

pub const NSEC_PER_MSEC: u64 = 1_000_000;

/// Capacity and utilization are normalized so that the fastest core at its
/// maximum frequency is `SCHED_CAPACITY_SCALE`.
pub const SCHED_CAPACITY_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;

/// Processing core identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CpuId(pub usize);

/// Task identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TaskId(pub u64);

/// Task group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group{}", self.0)
    }
}

/// Scheduling class of a task as far as placement is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchedClass {
    #[default]
    Fair,
    /// Real-time task. Lower `prio` values are more important.
    Rt { prio: u32 },
}

impl SchedClass {
    pub fn is_rt(&self) -> bool {
        matches!(self, SchedClass::Rt { .. })
    }
}
