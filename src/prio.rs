// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Priority and estcpu arithmetic.
//!
//! `estcpu` is a decayed estimate of recent cpu consumption and `batch` a
//! slower score telling cpu-bound entities from interactive ones. Normal
//! class priority grows with both nice and estcpu, with estcpu weighted by
//! batch: a fully batchy entity pays for all of its estcpu, a fully
//! interactive one for half of it.
//!
//! None of this needs the scheduler lock.

use crate::lwp::QueueClass;
use crate::lwp::RtPrio;
use crate::lwp::RtpType;
use crate::types::*;

/// Priority and queue class for the given attributes.
pub fn compute_priority(rtprio: RtPrio, nice: i32, estcpu: u32, batch: i32) -> (QueueClass, u32) {
    let sub = rtprio.prio as u32 & PRIMASK;
    match rtprio.kind {
        RtpType::Realtime | RtpType::Fifo => (QueueClass::Realtime, PRIBASE_REALTIME + sub),
        RtpType::Idle => (QueueClass::Idle, PRIBASE_IDLE + sub),
        RtpType::Normal => {
            let nice = (nice.clamp(PRIO_MIN, PRIO_MAX) - PRIO_MIN) as u64;
            let batch = batch.clamp(0, BATCHMAX) as u64;
            let batchmax = BATCHMAX as u64;
            let estcpu = estcpu_lim(estcpu) as u64 * (batch + batchmax) / (2 * batchmax);

            let ppq = PPQ as u64;
            let mut p = nice * ppq / NICEPPQ as u64 + estcpu * ppq / ESTCPUPPQ as u64;
            p = p * MAXPRI as u64
                / (PRIO_RANGE as u64 * ppq / NICEPPQ as u64
                    + ESTCPUMAX as u64 * ppq / ESTCPUPPQ as u64);
            (QueueClass::Normal, PRIBASE_NORMAL + (p as u32 & PRIMASK))
        }
    }
}

/// Charge one scheduler tick of cpu to `estcpu`.
pub fn tick_estcpu(estcpu: u32) -> u32 {
    estcpu_lim(estcpu + ESTCPUMAX / ESTCPUFREQ + 1)
}

/// Coarse correction applied after a long sleep.
pub fn sleep_correction(estcpu: u32, batch: i32) -> (u32, i32) {
    (estcpu >> 1, (batch - ESTCPUFREQ as i32).max(0))
}

/// Inputs of one estcpu decay step.
#[derive(Debug, Clone, Copy)]
pub struct DecayInput {
    pub estcpu: u32,
    pub batch: i32,
    pub pctcpu: u32,
    /// Ticks consumed during the window.
    pub cpticks: u32,
    /// Length of the window in ticks.
    pub nticks: u32,
    /// Entities waiting on the run queues.
    pub runq_count: usize,
    pub ncpus: usize,
    pub decay: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecayOutput {
    pub estcpu: u32,
    pub batch: i32,
    pub pctcpu: u32,
}

/// Blend the consumption measured over the last window into `estcpu`.
///
/// Consumption is scaled by `(runq_count + ncpus) / ncpus` so queued load
/// counts as used cpu. Without that, every entity's estcpu would stay low
/// under overload and their priorities would bunch up at the top.
pub fn decay_estcpu(inp: DecayInput) -> DecayOutput {
    let nticks = inp.nticks.max(1) as u64;
    let ncpus = inp.ncpus.max(1) as u64;
    let decay = inp.decay.max(1) as u64;

    let est = inp.cpticks as u64 * ESTCPUMAX as u64 * (inp.runq_count as u64 + ncpus)
        / (ncpus * nticks);
    let est = est.min(ESTCPUMAX as u64);

    let nticks_i = nticks.min(BATCHMAX as u64) as i32;
    let batch = if est > ESTCPUMAX as u64 / 2 {
        inp.batch.saturating_add(nticks_i)
    } else {
        inp.batch.saturating_sub(nticks_i)
    }
    .clamp(0, BATCHMAX);

    let estcpu = (inp.estcpu as u64 * decay + est) / (decay + 1);

    let used = (inp.cpticks as u64 * 10000 / nticks).min(10000);
    let pctcpu = (inp.pctcpu as u64 * decay + used) / (decay + 1);

    DecayOutput {
        estcpu: estcpu_lim(estcpu as u32),
        batch,
        pctcpu: pctcpu as u32,
    }
}

/// Initial estcpu of a child. Slightly worse than the parent so fork
/// storms do not starve everything else.
pub fn fork_child_estcpu(parent: u32) -> u32 {
    estcpu_lim(parent + ESTCPUPPQ * 4)
}

/// Parent estcpu after forking.
pub fn fork_parent_estcpu(parent: u32) -> u32 {
    estcpu_lim(parent + ESTCPUPPQ / 16)
}

/// Batch score a child starts with.
pub const FORK_CHILD_BATCH: i32 = BATCHMAX / 2;
