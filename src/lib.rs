// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # scx_walt
//!
//! Window-assisted load tracking (WALT) and energy-aware CPU placement for
//! heterogeneous multi-cluster systems.
//!
//! Time is cut into fixed-size windows. Every task and core accumulates
//! frequency and capacity scaled busy time per window, and a task's demand
//! is derived from the history of its recent windows. Placement uses those
//! demands and an energy model to pick the cheapest core a waking task fits
//! on. Misfit tasks stuck on small cores are pushed up by per-core workers,
//! and starved misfits may be rotated with long-running big core tasks.
//!
//! The host scheduler drives everything through the [`SchedHooks`] entry
//! points of [`Walt`].

#[macro_use]
extern crate static_assertions;

pub mod balance;
pub mod busy;
pub mod clock;
pub mod config;
pub mod cpumask;
pub mod driver;
pub mod energy;
pub mod group;
pub mod placement;
pub mod rq;
pub mod stats;
pub mod task;
pub mod topology;
pub mod tracker;
pub mod types;
pub mod uclamp;
pub mod walt;
pub mod worker;

pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::MonotonicClock;
pub use config::WaltConfig;
pub use config::WindowStatsPolicy;
pub use cpumask::Cpumask;
pub use energy::EnergyModel;
pub use task::TaskSpec;
pub use topology::Topology;
pub use tracker::DequeueKind;
pub use tracker::EnqueueKind;
pub use types::CpuId;
pub use types::GroupId;
pub use types::SchedClass;
pub use types::TaskId;
pub use walt::SchedHooks;
pub use walt::Walt;

const_assert!(config::RAVG_HIST_SIZE_MAX >= 1);
const_assert_eq!(types::SCHED_CAPACITY_SCALE, 1024);
const_assert!(tracker::HIGH_IRQ_TIMEOUT > 0);
