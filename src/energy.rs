// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Energy Model
//!
//! A simplified per-cluster energy model: every performance domain carries a
//! table of performance states, each with the power it draws. The placement
//! engine only needs one operation from it, [`PerfDomain::compute_energy`],
//! which estimates the energy a domain spends for a given utilization
//! landscape.
//!
//! The model is either loaded from JSON:
//!
//! ```json
//! { "domains": [
//!     { "cpus": "0-3", "states": [
//!         { "frequency": 614400, "performance": 256, "power": 40 },
//!         { "frequency": 1228800, "performance": 512, "power": 150 } ] },
//!     { "cpus": "4-7", "states": [
//!         { "frequency": 1200000, "performance": 512, "power": 300 },
//!         { "frequency": 2400000, "performance": 1024, "power": 1100 } ] } ] }
//! ```
//!
//! or synthesized from the topology when no description is available.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::cpumask::Cpumask;
use crate::topology::Topology;
use crate::types::CpuId;

const SYNTHETIC_NR_STATES: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PerfState {
    /// Cost of running at this state: power scaled by max performance over
    /// this state's performance.
    pub cost: u64,
    pub frequency: u64,
    /// Capacity delivered at this state.
    pub performance: u64,
    pub power: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct PerfDomain {
    pub id: usize,
    /// Cpumask of all CPUs in this performance domain.
    pub span: Cpumask,
    /// Table of performance states indexed by performance.
    pub perf_table: BTreeMap<u64, Arc<PerfState>>,
}

#[derive(Debug)]
pub struct EnergyModel {
    /// Performance domains indexed by domain id
    pub perf_doms: BTreeMap<usize, Arc<PerfDomain>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfStateDesc {
    pub frequency: u64,
    pub performance: u64,
    pub power: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfDomainDesc {
    pub cpus: String,
    pub states: Vec<PerfStateDesc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyModelDesc {
    pub domains: Vec<PerfDomainDesc>,
}

impl EnergyModel {
    pub fn new(nr_cpus: usize, desc: &EnergyModelDesc) -> Result<EnergyModel> {
        if desc.domains.is_empty() {
            bail!("There is no performance domain.");
        }

        let mut perf_doms = BTreeMap::new();
        let mut covered = Cpumask::new(nr_cpus);
        for (id, pd_desc) in desc.domains.iter().enumerate() {
            let pd = PerfDomain::new(id, nr_cpus, pd_desc)
                .with_context(|| format!("Invalid performance domain {id}"))?;
            if !covered.and(&pd.span).is_empty() {
                bail!("Performance domain {} overlaps another domain", id);
            }
            covered = covered.or(&pd.span);
            perf_doms.insert(pd.id, Arc::new(pd));
        }

        Ok(EnergyModel { perf_doms })
    }

    /// Parse a model given inline as JSON or as "f:PATH"/"file:PATH".
    pub fn parse(nr_cpus: usize, input: &str) -> Result<EnergyModel> {
        let desc: EnergyModelDesc = if input.starts_with("f:") || input.starts_with("file:") {
            let path = input.split_once(':').map(|(_, path)| path).unwrap_or("");
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read energy model {path:?}"))?;
            serde_json::from_str(&content)?
        } else {
            serde_json::from_str(input)?
        };
        EnergyModel::new(nr_cpus, &desc)
    }

    /// Build a plausible model from the topology alone: one domain per
    /// cluster, evenly spaced performance states, and power growing with
    /// both performance and the size of the core so that at equal
    /// performance a smaller core is always cheaper.
    pub fn synthetic(topo: &Topology) -> EnergyModel {
        let mut perf_doms = BTreeMap::new();
        for cluster in topo.clusters() {
            let mut perf_table = BTreeMap::new();
            let cap = cluster.capacity;
            for i in 1..=SYNTHETIC_NR_STATES {
                let performance = (cap * i / SYNTHETIC_NR_STATES).max(1);
                let power = (performance * (cap + performance) / 1024).max(1);
                perf_table.insert(
                    performance,
                    PerfState {
                        cost: 0,
                        frequency: performance * 2_000,
                        performance,
                        power,
                    },
                );
            }
            let pd = PerfDomain {
                id: cluster.id,
                span: cluster.cpus.clone(),
                perf_table: PerfDomain::with_costs(perf_table),
            };
            perf_doms.insert(pd.id, Arc::new(pd));
        }
        EnergyModel { perf_doms }
    }

    pub fn get_pd_by_cpu_id(&self, cpu: CpuId) -> Option<&Arc<PerfDomain>> {
        self.perf_doms.values().find(|pd| pd.span.test_cpu(cpu.0))
    }

    pub fn covers(&self, cpu: CpuId) -> bool {
        self.get_pd_by_cpu_id(cpu).is_some()
    }
}

impl PerfDomain {
    fn new(id: usize, nr_cpus: usize, desc: &PerfDomainDesc) -> Result<PerfDomain> {
        let span = Cpumask::from_cpulist(nr_cpus, &desc.cpus)?;
        if span.is_empty() {
            bail!("Performance domain {} spans no CPU", id);
        }
        if desc.states.is_empty() {
            bail!("Performance domain {} has no performance state", id);
        }

        let mut perf_table = BTreeMap::new();
        for st in desc.states.iter() {
            if st.performance == 0 {
                bail!("Performance state with zero performance in domain {}", id);
            }
            perf_table.insert(
                st.performance,
                PerfState {
                    cost: 0,
                    frequency: st.frequency,
                    performance: st.performance,
                    power: st.power,
                },
            );
        }

        Ok(PerfDomain {
            id,
            span,
            perf_table: Self::with_costs(perf_table),
        })
    }

    fn with_costs(table: BTreeMap<u64, PerfState>) -> BTreeMap<u64, Arc<PerfState>> {
        let max_perf = table.keys().next_back().copied().unwrap_or(1);
        table
            .into_iter()
            .map(|(perf, mut ps)| {
                ps.cost = ps.power * max_perf / perf;
                (perf, Arc::new(ps))
            })
            .collect()
    }

    /// Capacity of the domain's CPUs at their highest performance state.
    pub fn capacity(&self) -> u64 {
        self.perf_table.keys().next_back().copied().unwrap_or(0)
    }

    /// Lowest performance state able to serve `util`, or the highest state
    /// when none is.
    pub fn select_perf_state(&self, util: u64) -> Option<&Arc<PerfState>> {
        self.perf_table
            .range(util..)
            .next()
            .map(|(_, ps)| ps)
            .or_else(|| self.perf_table.values().next_back())
    }

    /// Energy spent by the domain when its busiest CPU runs at `max_util`
    /// and its CPUs sum up to `sum_util`. `allowed_cap` caps the selected
    /// performance level, e.g. under thermal pressure.
    pub fn compute_energy(&self, max_util: u64, sum_util: u64, allowed_cap: u64) -> u64 {
        let scale_cpu = self.capacity();
        if scale_cpu == 0 {
            return 0;
        }

        // Leave ~20% headroom the way frequency selection does.
        let max_util = (max_util + (max_util >> 2)).min(allowed_cap);
        match self.select_perf_state(max_util) {
            Some(ps) => ps.cost * sum_util / scale_cpu,
            None => 0,
        }
    }
}

impl fmt::Display for EnergyModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (_, pd) in self.perf_doms.iter() {
            writeln!(f, "{pd:#}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PerfDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "# perf domain: {:#}, cpus: {:#}", self.id, self.span)?;
        writeln!(f, "cost, frequency, performance, power")?;
        for (_, ps) in self.perf_table.iter() {
            writeln!(f, "{ps:#}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PerfState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}",
            self.cost, self.frequency, self.performance, self.power
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_little() -> Topology {
        Topology::new(&[512, 512, 512, 512, 1024, 1024]).unwrap()
    }

    #[test]
    fn test_synthetic_model_shape() {
        let em = EnergyModel::synthetic(&big_little());
        assert_eq!(em.perf_doms.len(), 2);
        let little = em.get_pd_by_cpu_id(CpuId(1)).unwrap();
        let big = em.get_pd_by_cpu_id(CpuId(5)).unwrap();
        assert_eq!(little.capacity(), 512);
        assert_eq!(big.capacity(), 1024);
    }

    #[test]
    fn test_energy_monotone_in_util() {
        let em = EnergyModel::synthetic(&big_little());
        for pd in em.perf_doms.values() {
            let cap = pd.capacity();
            let mut last = 0;
            for util in (0..=cap).step_by(32) {
                let energy = pd.compute_energy(util, util, cap);
                assert!(energy >= last, "energy dropped at util {util}");
                last = energy;
            }
        }
    }

    #[test]
    fn test_small_core_cheaper_at_same_load() {
        let em = EnergyModel::synthetic(&big_little());
        let little = em.get_pd_by_cpu_id(CpuId(0)).unwrap();
        let big = em.get_pd_by_cpu_id(CpuId(4)).unwrap();
        assert!(little.compute_energy(200, 200, 512) < big.compute_energy(200, 200, 1024));
    }

    #[test]
    fn test_select_perf_state() {
        let em = EnergyModel::synthetic(&big_little());
        let big = em.get_pd_by_cpu_id(CpuId(4)).unwrap();
        assert_eq!(big.select_perf_state(205).unwrap().performance, 409);
        assert_eq!(big.select_perf_state(5000).unwrap().performance, 1024);
    }

    #[test]
    fn test_parse_json() {
        let em = EnergyModel::parse(
            4,
            r#"{"domains": [
                {"cpus": "0-1", "states": [{"frequency": 1, "performance": 256, "power": 10},
                                           {"frequency": 2, "performance": 512, "power": 50}]},
                {"cpus": "2-3", "states": [{"frequency": 3, "performance": 1024, "power": 400}]}
            ]}"#,
        )
        .unwrap();
        let pd = em.get_pd_by_cpu_id(CpuId(0)).unwrap();
        assert_eq!(pd.perf_table[&256].cost, 20);
        assert!(em.covers(CpuId(3)));

        assert!(EnergyModel::parse(4, r#"{"domains": []}"#).is_err());
        assert!(EnergyModel::parse(
            4,
            r#"{"domains": [
                {"cpus": "0-2", "states": [{"frequency": 1, "performance": 1, "power": 1}]},
                {"cpus": "2-3", "states": [{"frequency": 1, "performance": 1, "power": 1}]}
            ]}"#
        )
        .is_err());
    }
}
