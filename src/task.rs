// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host task records.
//!
//! A task is referenced everywhere by its [`TaskId`]; the record itself lives
//! in a [`TaskHandle`] owned by the task table. The core a task belongs to is
//! mirrored in an atomic so that a caller can find and lock that core first,
//! then confirm the task did not move in between.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

use serde::Serialize;

use crate::cpumask::Cpumask;
use crate::tracker::TaskLoad;
use crate::types::CpuId;
use crate::types::GroupId;
use crate::types::SchedClass;
use crate::types::TaskId;
use crate::uclamp::UclampReq;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Running or waiting on a runqueue.
    Runnable,
    /// Woken up, not yet enqueued.
    Waking,
    Sleeping,
    Exiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OnRq {
    No,
    Queued,
    /// Detached from one runqueue on its way to another.
    Migrating,
}

/// Attributes of a task being created.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub parent: Option<TaskId>,
    pub group: Option<GroupId>,
    pub class: SchedClass,
    pub uclamp: UclampReq,
    /// Allowed cores, all of them when `None`.
    pub affinity: Option<Cpumask>,
    pub latency_sensitive: bool,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub cpu: CpuId,
    pub state: TaskState,
    pub on_rq: OnRq,
    pub class: SchedClass,
    pub group: Option<GroupId>,
    pub uclamp: UclampReq,
    pub affinity: Cpumask,
    pub latency_sensitive: bool,
    pub load: TaskLoad,
}

impl Task {
    pub fn new(id: TaskId, cpu: CpuId, nr_cpus: usize, spec: TaskSpec, load: TaskLoad) -> Task {
        Task {
            id,
            cpu,
            state: TaskState::Runnable,
            on_rq: OnRq::No,
            class: spec.class,
            group: spec.group,
            uclamp: spec.uclamp,
            affinity: spec.affinity.unwrap_or_else(|| Cpumask::full(nr_cpus)),
            latency_sensitive: spec.latency_sensitive,
            load,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.on_rq == OnRq::Queued
    }

    pub fn allowed_on(&self, cpu: CpuId) -> bool {
        self.affinity.test_cpu(cpu.0)
    }

    pub fn rt_prio(&self) -> Option<u32> {
        match self.class {
            SchedClass::Rt { prio } => Some(prio),
            SchedClass::Fair => None,
        }
    }
}

#[derive(Debug)]
pub struct TaskHandle {
    cpu: AtomicUsize,
    inner: Mutex<Task>,
}

impl TaskHandle {
    pub fn new(task: Task) -> TaskHandle {
        TaskHandle {
            cpu: AtomicUsize::new(task.cpu.0),
            inner: Mutex::new(task),
        }
    }

    /// Core the task currently belongs to. Stable only while that core is
    /// locked.
    pub fn cpu(&self) -> CpuId {
        CpuId(self.cpu.load(Ordering::Acquire))
    }

    pub fn lock(&self) -> MutexGuard<'_, Task> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move `task`, the locked content of this handle, to `cpu`. The source
    /// and destination cores must both be locked.
    pub fn set_cpu(&self, task: &mut Task, cpu: CpuId) {
        task.cpu = cpu;
        self.cpu.store(cpu.0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_tracks_cpu() {
        let task = Task::new(
            TaskId(3),
            CpuId(1),
            4,
            TaskSpec::default(),
            TaskLoad::existing_task(),
        );
        assert!(task.allowed_on(CpuId(3)));
        assert_eq!(task.rt_prio(), None);

        let handle = TaskHandle::new(task);
        assert_eq!(handle.cpu(), CpuId(1));
        {
            let mut task = handle.lock();
            handle.set_cpu(&mut task, CpuId(2));
        }
        assert_eq!(handle.cpu(), CpuId(2));
        assert_eq!(handle.lock().cpu, CpuId(2));
    }
}
