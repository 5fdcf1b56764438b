// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A Cpumask is a BitVec of u64's sized to the number of cores the tracker
//! was activated with. It backs task affinity masks and cluster spans.
//!
//!```
//!     use scx_walt::Cpumask;
//!     let mut mask = Cpumask::new(8);
//!     assert!(!mask.test_cpu(0));
//!     mask.set_cpu(0).unwrap();
//!     assert!(mask.test_cpu(0));
//!
//!     let little = Cpumask::from_cpulist(8, "0-3").unwrap();
//!     assert!(little.test_cpu(3) && !little.test_cpu(4));
//!```

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask covering `nr_cpus` cores.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with every one of the `nr_cpus` cores set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask from a cpulist string such as "0-3,6".
    pub fn from_cpulist(nr_cpus: usize, cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    pub fn from_cpus(nr_cpus: usize, cpus: impl IntoIterator<Item = usize>) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in cpus {
            mask.set_cpu(cpu)?;
        }

        Ok(mask)
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. If the CPU
    /// exceeds the size of the mask, false is returned.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The total size of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Index of the lowest set bit.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= &other.mask;
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= &other.mask;
        new
    }

    /// Iterate over the indices of the bits set in the Cpumask.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }

    fn fmt_hex(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nr_cpus = self.mask.len().max(1);
        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(nr_cpus.div_ceil(32));

        // Print the highest 32bit. Trim digits beyond the mask size.
        let width = match nr_cpus.div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        write!(f, "{:0width$x}", top, width = width)?;

        // The rest in descending order.
        for submask in masks.iter().rev() {
            write!(f, ",{submask:08x}")?;
        }
        Ok(())
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim().trim_end_matches('\0');
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        if min > max {
            bail!("Invalid cpulist range {}", group.trim());
        }
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_hex(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpulist_ranges() {
        let mask = Cpumask::from_cpulist(8, "0-2,5").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 5]);
        assert_eq!(mask.first(), Some(0));
        assert_eq!(format!("{mask}"), "27");
    }

    #[test]
    fn test_cpulist_rejects_garbage() {
        assert!(read_cpulist("0-x").is_err());
        assert!(read_cpulist("3-1").is_err());
        assert!(Cpumask::from_cpulist(4, "0-7").is_err());
    }

    #[test]
    fn test_set_ops() {
        let a = Cpumask::from_cpulist(8, "0-3").unwrap();
        let b = Cpumask::from_cpulist(8, "2-5").unwrap();
        assert_eq!(a.and(&b).iter().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(a.or(&b).iter().count(), 6);

        let mut c = Cpumask::new(4);
        c.set_cpu(2).unwrap();
        assert!(!c.test_cpu(1));
        assert!(!c.test_cpu(9));
        assert!(c.set_cpu(4).is_err());
        assert!(Cpumask::new(4).is_empty());
    }
}
