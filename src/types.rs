// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Identifiers and the fixed priority geometry of the run queues.
//!
//! Each scheduling class owns `NQS` run queues and `MAXPRI` priorities, so
//! every queue covers `PPQ` adjacent priority levels. A priority value
//! carries its class in the bits above `PRIMASK`, which lets a single
//! numeric comparison order entities across classes.

use std::fmt;

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Schedulable entity identifier. This is the entity's slot in the
/// scheduler's arena and is reused after the entity exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LwpId(pub u32);

impl LwpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LwpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamps handed to the scheduler clock, in nanoseconds.
pub type TimeNs = u64;

pub const MAX_CPUS: usize = 64;

pub const MAXPRI: u32 = 128;
pub const PRIMASK: u32 = MAXPRI - 1;
pub const PRIBASE_REALTIME: u32 = 0;
pub const PRIBASE_NORMAL: u32 = MAXPRI;
pub const PRIBASE_IDLE: u32 = MAXPRI * 2;
/// Priority recorded for a CPU that has no current entity. Worse than
/// anything an entity can have.
pub const PRIBASE_NULL: u32 = MAXPRI * 4;

pub const NQS: usize = 32;
pub const NR_CLASSES: usize = 3;
pub const PPQ: u32 = MAXPRI / NQS as u32;
pub const PPQMASK: u32 = PPQ - 1;

pub const PRIO_MIN: i32 = -20;
pub const PRIO_MAX: i32 = 20;
pub const PRIO_RANGE: i32 = PRIO_MAX - PRIO_MIN + 1;

/// Nice units per run queue.
pub const NICEPPQ: u32 = 2;
/// Estcpu units per run queue.
pub const ESTCPUPPQ: u32 = 512;
pub const ESTCPUMAX: u32 = ESTCPUPPQ * NQS as u32;
/// Scheduler clock frequency, ticks per second.
pub const ESTCPUFREQ: u32 = 50;
/// It takes about 30 cpu-seconds of sustained load to saturate `batch`.
pub const BATCHMAX: i32 = ESTCPUFREQ as i32 * 30;

const_assert_eq!(PPQ as usize * NQS, MAXPRI as usize);
const_assert!(PRIBASE_IDLE + MAXPRI <= PRIBASE_NULL);
const_assert!(NQS <= u32::BITS as usize);
const_assert!(MAX_CPUS <= u64::BITS as usize);

pub fn estcpu_lim(v: u32) -> u32 {
    v.min(ESTCPUMAX)
}

/// Strip the intra-queue bits, leaving a value that compares at run queue
/// granularity.
pub fn pri_bucket(pri: u32) -> u32 {
    pri & !PPQMASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_geometry() {
        assert_eq!(PPQ, 4);
        assert_eq!(ESTCPUMAX, 16384);
        assert_eq!(BATCHMAX, 1500);
        assert_eq!(pri_bucket(PRIBASE_NORMAL + 7), PRIBASE_NORMAL + 4);
        assert_eq!(estcpu_lim(ESTCPUMAX + 1), ESTCPUMAX);
    }
}
