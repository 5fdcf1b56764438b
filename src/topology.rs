// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cluster topology.
//!
//! Cores with identical original capacity form a cluster. Clusters are
//! numbered by ascending capacity, so cluster 0 is always the most efficient
//! one. A `Topology` is immutable once built; rebuilding produces a new
//! snapshot that is published through [`TopologyCell`] with a single pointer
//! swap, so readers always see either the old or the new layout in full.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::bail;
use anyhow::Result;
use log::warn;

use crate::cpumask::Cpumask;
use crate::types::CpuId;
use crate::types::SCHED_CAPACITY_SCALE;

pub const MAX_CLUSTERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Position in ascending capacity order.
    pub id: usize,
    pub cpus: Cpumask,
    /// Original capacity shared by every member core.
    pub capacity: u64,
}

impl Cluster {
    pub fn first_cpu(&self) -> Option<CpuId> {
        self.cpus.first().map(CpuId)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    clusters: Vec<Cluster>,
    /// Cluster index of every core.
    cpu_cluster: Vec<usize>,
    cpu_capacity: Vec<u64>,
}

impl Topology {
    /// Build a topology from the original capacity of each core, indexed by
    /// core id.
    pub fn new(capacities: &[u64]) -> Result<Topology> {
        if capacities.is_empty() {
            bail!("Topology needs at least one CPU");
        }
        if let Some(cpu) = capacities.iter().position(|c| *c == 0) {
            bail!("CPU {} has zero capacity", cpu);
        }
        if let Some(cpu) = capacities.iter().position(|c| *c > SCHED_CAPACITY_SCALE) {
            bail!(
                "CPU {} capacity {} exceeds {}",
                cpu,
                capacities[cpu],
                SCHED_CAPACITY_SCALE
            );
        }

        let nr_cpus = capacities.len();
        let mut by_capacity: BTreeMap<u64, Cpumask> = BTreeMap::new();
        for (cpu, cap) in capacities.iter().enumerate() {
            by_capacity
                .entry(*cap)
                .or_insert_with(|| Cpumask::new(nr_cpus))
                .set_cpu(cpu)?;
        }

        let mut clusters = Vec::with_capacity(by_capacity.len());
        let mut cpu_cluster = vec![0; nr_cpus];
        for (id, (capacity, cpus)) in by_capacity.into_iter().enumerate() {
            for cpu in cpus.iter() {
                cpu_cluster[cpu] = id;
            }
            clusters.push(Cluster { id, cpus, capacity });
        }

        if clusters.len() > MAX_CLUSTERS {
            warn!(
                "{} clusters found, more than the {} this policy is tuned for",
                clusters.len(),
                MAX_CLUSTERS
            );
        }

        Ok(Topology {
            clusters,
            cpu_cluster,
            cpu_capacity: capacities.to_vec(),
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpu_capacity.len()
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn cpus(&self) -> impl Iterator<Item = CpuId> {
        (0..self.nr_cpus()).map(CpuId)
    }

    pub fn cluster_of(&self, cpu: CpuId) -> &Cluster {
        &self.clusters[self.cpu_cluster[cpu.0]]
    }

    pub fn capacity_orig(&self, cpu: CpuId) -> u64 {
        self.cpu_capacity[cpu.0]
    }

    pub fn min_capacity(&self) -> u64 {
        self.clusters[0].capacity
    }

    pub fn max_capacity(&self) -> u64 {
        self.clusters[self.clusters.len() - 1].capacity
    }

    pub fn is_min_capacity_cpu(&self, cpu: CpuId) -> bool {
        self.capacity_orig(cpu) == self.min_capacity()
    }

    pub fn is_max_capacity_cpu(&self, cpu: CpuId) -> bool {
        self.capacity_orig(cpu) == self.max_capacity()
    }

    pub fn is_min_capacity_cluster(&self, cluster: &Cluster) -> bool {
        cluster.capacity == self.min_capacity()
    }

    pub fn same_cluster(&self, a: CpuId, b: CpuId) -> bool {
        self.cpu_cluster[a.0] == self.cpu_cluster[b.0]
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for cluster in self.clusters.iter() {
            writeln!(
                f,
                "cluster {}: capacity {:4} cpus {:#}",
                cluster.id, cluster.capacity, cluster.cpus
            )?;
        }
        Ok(())
    }
}

/// Holder of the current topology snapshot.
#[derive(Debug)]
pub struct TopologyCell {
    current: RwLock<Arc<Topology>>,
}

impl TopologyCell {
    pub fn new(topo: Topology) -> TopologyCell {
        TopologyCell {
            current: RwLock::new(Arc::new(topo)),
        }
    }

    pub fn load(&self) -> Arc<Topology> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn store(&self, topo: Topology) {
        let topo = Arc::new(topo);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = topo;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clusters_ordered_by_capacity() {
        let topo = Topology::new(&[1024, 512, 512, 768, 512, 768]).unwrap();
        let caps: Vec<u64> = topo.clusters().iter().map(|c| c.capacity).collect();
        assert_eq!(caps, vec![512, 768, 1024]);
        assert_eq!(topo.cluster_of(CpuId(0)).id, 2);
        assert_eq!(topo.cluster_of(CpuId(4)).id, 0);
        assert_eq!(
            topo.clusters()[0].cpus.iter().collect::<Vec<_>>(),
            vec![1, 2, 4]
        );
        assert!(topo.is_min_capacity_cpu(CpuId(1)));
        assert!(topo.is_max_capacity_cpu(CpuId(0)));
        assert!(!topo.is_max_capacity_cpu(CpuId(3)));
        assert!(topo.same_cluster(CpuId(3), CpuId(5)));
        assert!(!topo.same_cluster(CpuId(0), CpuId(5)));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Topology::new(&[]).is_err());
        assert!(Topology::new(&[512, 0]).is_err());
        assert!(Topology::new(&[2048]).is_err());
    }

    #[test]
    fn test_cell_swap() {
        let cell = TopologyCell::new(Topology::new(&[512, 1024]).unwrap());
        let old = cell.load();
        cell.store(Topology::new(&[1024, 1024]).unwrap());
        assert_eq!(old.clusters().len(), 2);
        assert_eq!(cell.load().clusters().len(), 1);
    }
}
