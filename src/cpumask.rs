// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU sets
//!
//! A `CpuSet` is a fixed-width bitmask with one bit per CPU, sized for at
//! most `MAX_CPUS` CPUs so that every set operation the scheduler performs
//! under its lock is a single integer operation with no allocation.
//!
//! Sets can be built from a hexadecimal string or a cpulist:
//!
//!```
//!     use scx_bsd4::CpuSet;
//!     let mask = CpuSet::from_str("0xf0").unwrap();
//!     assert_eq!(mask, CpuSet::from_cpulist("4-7").unwrap());
//!```
//!
//! `AtomicCpuSet` is the shared flavor used for the global running and
//! ready masks: single bits are set and cleared with atomic RMW operations
//! so remote CPUs can sample the masks without taking the scheduler lock.

use std::fmt;
use std::ops::BitAnd;
use std::ops::BitAndAssign;
use std::ops::BitOr;
use std::ops::BitOrAssign;
use std::ops::BitXor;
use std::ops::Not;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use sscanf::sscanf;

use crate::types::CpuId;
use crate::types::MAX_CPUS;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuSet(u64);

impl CpuSet {
    fn check_cpu(cpu: usize) -> Result<()> {
        if cpu >= MAX_CPUS {
            bail!("Invalid CPU {} passed, max {}", cpu, MAX_CPUS - 1);
        }
        Ok(())
    }

    /// Build a new empty set.
    pub const fn new() -> CpuSet {
        CpuSet(0)
    }

    /// Build a set containing CPUs `0..nr_cpus`.
    pub fn first_n(nr_cpus: usize) -> CpuSet {
        match nr_cpus {
            0 => CpuSet(0),
            n if n >= MAX_CPUS => CpuSet(u64::MAX),
            n => CpuSet((1u64 << n) - 1),
        }
    }

    /// Build a set containing a single CPU.
    pub fn from_cpu(cpu: CpuId) -> CpuSet {
        debug_assert!(cpu.index() < MAX_CPUS, "cpu {} out of range", cpu);
        CpuSet(1u64 << cpu.0)
    }

    pub const fn from_bits(bits: u64) -> CpuSet {
        CpuSet(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Build a set from a hexadecimal string. The special values "none" and
    /// "all" give the empty and the full set.
    pub fn from_str(cpumask: &str) -> Result<CpuSet> {
        match cpumask {
            "none" => return Ok(CpuSet(0)),
            "all" => return Ok(CpuSet(u64::MAX)),
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace('_', "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = CpuSet::new();
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= MAX_CPUS {
                    bail!(
                        "Found cpu ({}) in cpumask ({}) which is larger than the supported maximum ({})",
                        cpu,
                        cpumask,
                        MAX_CPUS
                    );
                }
                mask.0 |= 1u64 << cpu;
            }
        }
        Ok(mask)
    }

    /// Build a set from a cpulist such as "0-3,8,10-11".
    pub fn from_cpulist(cpulist: &str) -> Result<CpuSet> {
        let mut mask = CpuSet::new();
        for cpu in read_cpulist(cpulist)? {
            mask.set_cpu(cpu)?;
        }
        Ok(mask)
    }

    /// Set a bit. Returns an error if the CPU exceeds the set's width.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        Self::check_cpu(cpu)?;
        self.0 |= 1u64 << cpu;
        Ok(())
    }

    /// Clear a bit. Returns an error if the CPU exceeds the set's width.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        Self::check_cpu(cpu)?;
        self.0 &= !(1u64 << cpu);
        Ok(())
    }

    pub fn with(self, cpu: CpuId) -> CpuSet {
        self | CpuSet::from_cpu(cpu)
    }

    pub fn without(self, cpu: CpuId) -> CpuSet {
        self & !CpuSet::from_cpu(cpu)
    }

    pub fn test(&self, cpu: CpuId) -> bool {
        cpu.index() < MAX_CPUS && self.0 & (1u64 << cpu.0) != 0
    }

    pub fn intersects(&self, other: CpuSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Count the number of bits set.
    pub fn weight(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest CPU in the set (bit scan forward).
    pub fn first(&self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(CpuId(self.0.trailing_zeros()))
        }
    }

    /// The `n`th CPU of the set in ascending order.
    pub fn nth(&self, n: usize) -> Option<CpuId> {
        self.iter().nth(n)
    }

    /// Iterate CPUs in ascending order.
    pub fn iter(&self) -> CpuSetIter {
        CpuSetIter { bits: self.0 }
    }

    /// Iterate all CPUs of the set starting at `start` and wrapping around,
    /// so repeated scans can begin at a rotating position.
    pub fn iter_from(&self, start: CpuId) -> impl Iterator<Item = CpuId> {
        let split = match start.0 {
            0 => 0,
            s if s as usize >= MAX_CPUS => u64::MAX,
            s => (1u64 << s) - 1,
        };
        CpuSetIter {
            bits: self.0 & !split,
        }
        .chain(CpuSetIter {
            bits: self.0 & split,
        })
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl BitAnd for CpuSet {
    type Output = CpuSet;
    fn bitand(self, rhs: Self) -> CpuSet {
        CpuSet(self.0 & rhs.0)
    }
}

impl BitOr for CpuSet {
    type Output = CpuSet;
    fn bitor(self, rhs: Self) -> CpuSet {
        CpuSet(self.0 | rhs.0)
    }
}

impl BitXor for CpuSet {
    type Output = CpuSet;
    fn bitxor(self, rhs: Self) -> CpuSet {
        CpuSet(self.0 ^ rhs.0)
    }
}

impl Not for CpuSet {
    type Output = CpuSet;
    fn not(self) -> CpuSet {
        CpuSet(!self.0)
    }
}

impl BitAndAssign for CpuSet {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl BitOrAssign for CpuSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

pub struct CpuSetIter {
    bits: u64,
}

impl Iterator for CpuSetIter {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        if self.bits == 0 {
            return None;
        }
        let cpu = self.bits.trailing_zeros();
        self.bits &= self.bits - 1;
        Some(CpuId(cpu))
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
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
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }
    Ok(cpu_ids)
}

/// A `CpuSet` shared between CPUs.
#[derive(Debug, Default)]
pub struct AtomicCpuSet(AtomicU64);

impl AtomicCpuSet {
    pub fn new(set: CpuSet) -> Self {
        Self(AtomicU64::new(set.0))
    }

    pub fn load(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, set: CpuSet) {
        self.0.store(set.0, Ordering::Release);
    }

    pub fn set_cpu(&self, cpu: CpuId) {
        self.0.fetch_or(CpuSet::from_cpu(cpu).0, Ordering::AcqRel);
    }

    pub fn clear_cpu(&self, cpu: CpuId) {
        self.0.fetch_and(!CpuSet::from_cpu(cpu).0, Ordering::AcqRel);
    }

    pub fn test(&self, cpu: CpuId) -> bool {
        self.load().test(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str() {
        assert_eq!(CpuSet::from_str("none").unwrap(), CpuSet::new());
        assert_eq!(CpuSet::from_str("0x_f0").unwrap().bits(), 0xf0);
        assert_eq!(CpuSet::from_str("101").unwrap().bits(), 0x101);
        assert!(CpuSet::from_str("0xzz").is_err());
    }

    #[test]
    fn test_cpulist() {
        let mask = CpuSet::from_cpulist("0-2,5").unwrap();
        let cpus: Vec<u32> = mask.iter().map(|c| c.0).collect();
        assert_eq!(cpus, vec![0, 1, 2, 5]);
        assert!(CpuSet::from_cpulist("3-x").is_err());
        assert!(CpuSet::from_cpulist("64").is_err());
    }

    #[test]
    fn test_iter_from_wraps() {
        let mask = CpuSet::from_cpulist("1,3,6").unwrap();
        let cpus: Vec<u32> = mask.iter_from(CpuId(3)).map(|c| c.0).collect();
        assert_eq!(cpus, vec![3, 6, 1]);
        let cpus: Vec<u32> = mask.iter_from(CpuId(7)).map(|c| c.0).collect();
        assert_eq!(cpus, vec![1, 3, 6]);
    }

    #[test]
    fn test_atomic_set() {
        let set = AtomicCpuSet::new(CpuSet::first_n(2));
        set.clear_cpu(CpuId(0));
        set.set_cpu(CpuId(5));
        assert_eq!(set.load().bits(), 0b100010);
        assert!(set.test(CpuId(5)));
        assert_eq!(set.load().first(), Some(CpuId(1)));
        assert_eq!(set.load().nth(1), Some(CpuId(5)));
    }
}
