// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU scheduler records and the cross-CPU notification primitive.
//!
//! The record's `current` and `upri` fields are read without the scheduler
//! lock by remote CPUs deciding whether to notify this one. They are only
//! written by the owning CPU or under the lock.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crossbeam::channel::unbounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;

use crate::cpumask::CpuSet;
use crate::types::*;

const NIL: u32 = u32::MAX;

/// Asynchronous notification posted to a CPU's inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMsg {
    /// Wake the Helper Task.
    Wakeup,
    /// Ask the CPU to reschedule its current entity, then run the Helper
    /// Task.
    Resched,
}

/// Notifications gathered under the scheduler lock and posted once it is
/// dropped. A reschedule supersedes a wakeup for the same CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Notify {
    pub wakeup: CpuSet,
    pub resched: CpuSet,
}

impl Notify {
    pub fn wakeup(&mut self, cpu: CpuId) {
        if !self.resched.test(cpu) {
            self.wakeup = self.wakeup.with(cpu);
        }
    }

    pub fn resched(&mut self, cpu: CpuId) {
        self.wakeup = self.wakeup.without(cpu);
        self.resched = self.resched.with(cpu);
    }

    pub fn iter(&self) -> impl Iterator<Item = (CpuId, CpuMsg)> {
        self.resched
            .iter()
            .map(|cpu| (cpu, CpuMsg::Resched))
            .chain(self.wakeup.iter().map(|cpu| (cpu, CpuMsg::Wakeup)))
    }
}

#[derive(Debug)]
pub struct PerCpu {
    cpu: CpuId,
    current: AtomicU32,
    upri: AtomicU32,
    rrcount: AtomicU32,
    resched: AtomicBool,
    // Timestamp of the last scheduler clock and the clock period.
    clock: AtomicU64,
    periodic: AtomicU64,
    tx: Sender<CpuMsg>,
    rx: Receiver<CpuMsg>,
}

impl PerCpu {
    pub fn new(cpu: CpuId) -> Self {
        let (tx, rx) = unbounded();
        Self {
            cpu,
            current: AtomicU32::new(NIL),
            upri: AtomicU32::new(PRIBASE_NULL),
            rrcount: AtomicU32::new(0),
            resched: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            periodic: AtomicU64::new(0),
            tx,
            rx,
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn current(&self) -> Option<LwpId> {
        match self.current.load(Ordering::Acquire) {
            NIL => None,
            id => Some(LwpId(id)),
        }
    }

    pub(crate) fn set_current(&self, lwp: Option<LwpId>) {
        self.current
            .store(lwp.map_or(NIL, |id| id.0), Ordering::Release);
    }

    /// Priority of the current entity, `PRIBASE_NULL` when there is none.
    pub fn upri(&self) -> u32 {
        self.upri.load(Ordering::Relaxed)
    }

    pub(crate) fn set_upri(&self, pri: u32) {
        self.upri.store(pri, Ordering::Relaxed);
    }

    pub fn rrcount(&self) -> u32 {
        self.rrcount.load(Ordering::Relaxed)
    }

    /// Advance the round-robin counter. Returns true and restarts the count
    /// once `interval` ticks have elapsed.
    pub(crate) fn tick_rrcount(&self, interval: u32) -> bool {
        let count = self.rrcount.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= interval {
            self.rrcount.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_rrcount(&self) {
        self.rrcount.store(0, Ordering::Relaxed);
    }

    pub fn need_resched(&self) -> bool {
        self.resched.load(Ordering::Acquire)
    }

    pub(crate) fn set_need_resched(&self) {
        self.resched.store(true, Ordering::Release);
    }

    /// Clear the reschedule flag, returning whether it was set.
    pub(crate) fn take_need_resched(&self) -> bool {
        self.resched.swap(false, Ordering::AcqRel)
    }

    pub fn clock(&self) -> TimeNs {
        self.clock.load(Ordering::Relaxed)
    }

    pub fn periodic(&self) -> TimeNs {
        self.periodic.load(Ordering::Relaxed)
    }

    pub(crate) fn record_clock(&self, period: TimeNs, now: TimeNs) {
        self.periodic.store(period, Ordering::Relaxed);
        self.clock.store(now, Ordering::Relaxed);
    }

    pub(crate) fn post(&self, msg: CpuMsg) {
        // The receiver lives as long as the record, so this cannot fail.
        let _ = self.tx.send(msg);
    }

    pub fn try_recv(&self) -> Option<CpuMsg> {
        self.rx.try_recv().ok()
    }

    /// The receiving end of the inbox, for a Helper Task to block on.
    pub(crate) fn inbox(&self) -> &Receiver<CpuMsg> {
        &self.rx
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_merge() {
        let mut n = Notify::default();
        n.wakeup(CpuId(1));
        n.resched(CpuId(1));
        n.wakeup(CpuId(1));
        n.wakeup(CpuId(2));
        let msgs: Vec<(CpuId, CpuMsg)> = n.iter().collect();
        assert_eq!(
            msgs,
            vec![(CpuId(1), CpuMsg::Resched), (CpuId(2), CpuMsg::Wakeup)]
        );
    }

    #[test]
    fn test_record() {
        let pc = PerCpu::new(CpuId(0));
        assert_eq!(pc.current(), None);
        assert_eq!(pc.upri(), PRIBASE_NULL);
        pc.set_current(Some(LwpId(4)));
        assert_eq!(pc.current(), Some(LwpId(4)));
        assert!(!pc.tick_rrcount(2));
        assert!(pc.tick_rrcount(2));
        assert_eq!(pc.rrcount(), 0);
        pc.set_need_resched();
        assert!(pc.take_need_resched());
        assert!(!pc.need_resched());
        pc.post(CpuMsg::Wakeup);
        assert_eq!(pc.pending(), 1);
        assert_eq!(pc.try_recv(), Some(CpuMsg::Wakeup));
        assert_eq!(pc.try_recv(), None);
        assert!(pc.inbox().is_empty());
    }
}
