// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::busy::BusyState;
use crate::placement::PlacementReason;
use crate::types::CpuId;

#[derive(Debug, Default)]
pub struct WaltStats {
    pub place_sync: AtomicU64,
    pub place_blocked: AtomicU64,
    pub place_latency_sensitive: AtomicU64,
    pub place_energy: AtomicU64,
    pub place_prev: AtomicU64,
    pub place_overutilized: AtomicU64,
    pub place_no_em: AtomicU64,
    pub place_rt: AtomicU64,
    pub misfit_ticks: AtomicU64,
    pub active_balance_issued: AtomicU64,
    pub active_balance_done: AtomicU64,
    pub active_balance_aborted: AtomicU64,
    pub rotation_issued: AtomicU64,
    pub rotation_done: AtomicU64,
    pub rotation_aborted: AtomicU64,
}

impl WaltStats {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_placement(&self, reason: PlacementReason) {
        let counter = match reason {
            PlacementReason::SyncWaker => &self.place_sync,
            PlacementReason::Blocked => &self.place_blocked,
            PlacementReason::LatencySensitive => &self.place_latency_sensitive,
            PlacementReason::EnergyEfficient => &self.place_energy,
            PlacementReason::PrevCpu => &self.place_prev,
            PlacementReason::Overutilized => &self.place_overutilized,
            PlacementReason::NoEnergyModel => &self.place_no_em,
            PlacementReason::Rt | PlacementReason::RtStay => &self.place_rt,
        };
        Self::inc(counter);
    }

    /// Snapshot of the counters. Defects counted per core are filled in by
    /// the caller.
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            place_sync: get(&self.place_sync),
            place_blocked: get(&self.place_blocked),
            place_latency_sensitive: get(&self.place_latency_sensitive),
            place_energy: get(&self.place_energy),
            place_prev: get(&self.place_prev),
            place_overutilized: get(&self.place_overutilized),
            place_no_em: get(&self.place_no_em),
            place_rt: get(&self.place_rt),
            misfit_ticks: get(&self.misfit_ticks),
            active_balance_issued: get(&self.active_balance_issued),
            active_balance_done: get(&self.active_balance_done),
            active_balance_aborted: get(&self.active_balance_aborted),
            rotation_issued: get(&self.rotation_issued),
            rotation_done: get(&self.rotation_done),
            rotation_aborted: get(&self.rotation_aborted),
            migration_clamps: 0,
            clock_anomalies: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub place_sync: u64,
    pub place_blocked: u64,
    pub place_latency_sensitive: u64,
    pub place_energy: u64,
    pub place_prev: u64,
    pub place_overutilized: u64,
    pub place_no_em: u64,
    pub place_rt: u64,
    pub misfit_ticks: u64,
    pub active_balance_issued: u64,
    pub active_balance_done: u64,
    pub active_balance_aborted: u64,
    pub rotation_issued: u64,
    pub rotation_done: u64,
    pub rotation_aborted: u64,
    pub migration_clamps: u64,
    pub clock_anomalies: u64,
}

impl StatsSnapshot {
    pub fn placements(&self) -> u64 {
        self.place_sync
            + self.place_blocked
            + self.place_latency_sensitive
            + self.place_energy
            + self.place_prev
            + self.place_overutilized
            + self.place_no_em
            + self.place_rt
    }
}

/// Per-core load report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuLoadStat {
    pub cpu: CpuId,
    /// Previous window busy time in capacity units.
    pub cpu_load: u64,
    pub running_tasks: usize,
    pub iowait_tasks: u32,
    pub busy: BusyState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_counters() {
        let stats = WaltStats::default();
        stats.record_placement(PlacementReason::PrevCpu);
        stats.record_placement(PlacementReason::RtStay);
        stats.record_placement(PlacementReason::Rt);
        let snap = stats.snapshot();
        assert_eq!(snap.place_prev, 1);
        assert_eq!(snap.place_rt, 2);
        assert_eq!(snap.placements(), 3);
    }
}
