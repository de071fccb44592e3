// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Schedulable entities.
//!
//! An `Lwp` is owned by the thread subsystem; the scheduler only reads and
//! writes its scheduling attributes. All attributes are atomics so that the
//! priority arithmetic can run without the scheduler lock. Queue linkage
//! (`on_queue`, class and index) is only changed with the lock held.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::cpumask::AtomicCpuSet;
use crate::cpumask::CpuSet;
use crate::types::*;

pub type LwpRef = Arc<Lwp>;

const NO_TICK: u64 = u64::MAX;

/// Scheduling policy type. `Fifo` shares the realtime queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtpType {
    Realtime,
    Fifo,
    #[default]
    Normal,
    Idle,
}

impl RtpType {
    /// Raw values follow the rtprio(2) numbering.
    pub fn from_raw(v: u8) -> Result<RtpType> {
        Ok(match v {
            0 => RtpType::Realtime,
            1 => RtpType::Normal,
            2 => RtpType::Idle,
            4 => RtpType::Fifo,
            _ => bail!("Bad RTP_PRIO type {}", v),
        })
    }

    pub fn as_raw(self) -> u8 {
        match self {
            RtpType::Realtime => 0,
            RtpType::Normal => 1,
            RtpType::Idle => 2,
            RtpType::Fifo => 4,
        }
    }

    pub fn queue_class(self) -> QueueClass {
        match self {
            RtpType::Realtime | RtpType::Fifo => QueueClass::Realtime,
            RtpType::Normal => QueueClass::Normal,
            RtpType::Idle => QueueClass::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtPrio {
    pub kind: RtpType,
    /// Sub-priority within the realtime and idle classes, ignored for
    /// `Normal`. Only the low 7 bits are used.
    #[serde(default)]
    pub prio: u16,
}

impl RtPrio {
    pub fn normal() -> Self {
        Self::default()
    }

    pub fn realtime(prio: u16) -> Self {
        Self {
            kind: RtpType::Realtime,
            prio,
        }
    }

    pub fn idle(prio: u16) -> Self {
        Self {
            kind: RtpType::Idle,
            prio,
        }
    }
}

/// Run queue class, in the order classes are scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueClass {
    Realtime = 0,
    Normal = 1,
    Idle = 2,
}

impl QueueClass {
    pub const ALL: [QueueClass; NR_CLASSES] =
        [QueueClass::Realtime, QueueClass::Normal, QueueClass::Idle];

    pub fn index(self) -> usize {
        self as usize
    }

    fn from_index(v: u8) -> QueueClass {
        match v {
            0 => QueueClass::Realtime,
            1 => QueueClass::Normal,
            2 => QueueClass::Idle,
            _ => panic!("bsd4: run queue class {} out of range", v),
        }
    }
}

pub struct Lwp {
    id: LwpId,
    name: String,

    rtp_kind: AtomicU8,
    rtp_prio: AtomicU16,
    nice: AtomicI32,

    priority: AtomicU32,
    rqtype: AtomicU8,
    rqindex: AtomicU8,
    on_queue: AtomicBool,

    estcpu: AtomicU32,
    origcpu: AtomicU32,
    batch: AtomicI32,
    batchy_since: AtomicU64,
    defer_count: AtomicU32,

    home_cpu: AtomicU32,
    affinity: AtomicCpuSet,

    cpticks: AtomicU32,
    cpbase: AtomicU64,
    slptime: AtomicU32,
    pctcpu: AtomicU32,

    exited: AtomicBool,
}

impl Lwp {
    pub(crate) fn new(
        id: LwpId,
        name: &str,
        rtprio: RtPrio,
        nice: i32,
        affinity: CpuSet,
        home_cpu: CpuId,
        cpbase: TimeNs,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            rtp_kind: AtomicU8::new(rtprio.kind.as_raw()),
            rtp_prio: AtomicU16::new(rtprio.prio),
            nice: AtomicI32::new(nice.clamp(PRIO_MIN, PRIO_MAX)),
            priority: AtomicU32::new(PRIBASE_NULL),
            rqtype: AtomicU8::new(rtprio.kind.queue_class() as u8),
            rqindex: AtomicU8::new(0),
            on_queue: AtomicBool::new(false),
            estcpu: AtomicU32::new(0),
            origcpu: AtomicU32::new(0),
            batch: AtomicI32::new(0),
            batchy_since: AtomicU64::new(NO_TICK),
            defer_count: AtomicU32::new(0),
            home_cpu: AtomicU32::new(home_cpu.0),
            affinity: AtomicCpuSet::new(affinity),
            cpticks: AtomicU32::new(0),
            cpbase: AtomicU64::new(cpbase),
            slptime: AtomicU32::new(0),
            pctcpu: AtomicU32::new(0),
            exited: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> LwpId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rtprio(&self) -> RtPrio {
        let raw = self.rtp_kind.load(Ordering::Relaxed);
        let kind = match RtpType::from_raw(raw) {
            Ok(kind) => kind,
            Err(e) => panic!("bsd4: lwp {}: {}", self.id, e),
        };
        RtPrio {
            kind,
            prio: self.rtp_prio.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn store_rtprio(&self, rtprio: RtPrio) {
        self.rtp_prio.store(rtprio.prio, Ordering::Relaxed);
        self.rtp_kind.store(rtprio.kind.as_raw(), Ordering::Relaxed);
    }

    pub fn nice(&self) -> i32 {
        self.nice.load(Ordering::Relaxed)
    }

    pub(crate) fn store_nice(&self, nice: i32) {
        self.nice
            .store(nice.clamp(PRIO_MIN, PRIO_MAX), Ordering::Relaxed);
    }

    /// Combined class and level, lower is better.
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn queue_class(&self) -> QueueClass {
        QueueClass::from_index(self.rqtype.load(Ordering::Relaxed))
    }

    pub fn queue_index(&self) -> usize {
        self.rqindex.load(Ordering::Relaxed) as usize
    }

    /// Record the queue placement for `pri`. Lock must be held if the entity
    /// may be queued.
    pub(crate) fn set_placement(&self, class: QueueClass, pri: u32) {
        self.priority.store(pri, Ordering::Relaxed);
        self.rqtype.store(class as u8, Ordering::Relaxed);
        self.rqindex
            .store(((pri & PRIMASK) / PPQ) as u8, Ordering::Relaxed);
    }

    pub fn on_queue(&self) -> bool {
        self.on_queue.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_queue(&self, v: bool) {
        self.on_queue.store(v, Ordering::Release);
    }

    pub fn estcpu(&self) -> u32 {
        self.estcpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_estcpu(&self, v: u32) {
        self.estcpu.store(estcpu_lim(v), Ordering::Relaxed);
    }

    pub fn origcpu(&self) -> u32 {
        self.origcpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_origcpu(&self, v: u32) {
        self.origcpu.store(v, Ordering::Relaxed);
    }

    pub fn batch(&self) -> i32 {
        self.batch.load(Ordering::Relaxed)
    }

    pub(crate) fn set_batch(&self, v: i32) {
        self.batch.store(v.clamp(0, BATCHMAX), Ordering::Relaxed);
    }

    /// Track when `batch` crossed `batch_time`, `tick` being the current
    /// scheduler tick.
    pub(crate) fn update_batchy(&self, batch_time: i32, tick: u64) {
        if self.batch() >= batch_time {
            let _ = self.batchy_since.compare_exchange(
                NO_TICK,
                tick,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        } else {
            self.batchy_since.store(NO_TICK, Ordering::Relaxed);
        }
    }

    /// Whether the entity has been batchy for at least one full tick.
    pub fn batchy_since_before(&self, tick: u64) -> bool {
        let since = self.batchy_since.load(Ordering::Relaxed);
        since != NO_TICK && since < tick
    }

    pub fn defer_count(&self) -> u32 {
        self.defer_count.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_defer_count(&self) {
        self.defer_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_defer_count(&self) {
        self.defer_count.store(0, Ordering::Relaxed);
    }

    /// Last CPU this entity executed on.
    pub fn home_cpu(&self) -> CpuId {
        CpuId(self.home_cpu.load(Ordering::Relaxed))
    }

    pub(crate) fn set_home_cpu(&self, cpu: CpuId) {
        self.home_cpu.store(cpu.0, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> CpuSet {
        self.affinity.load()
    }

    pub(crate) fn store_affinity(&self, mask: CpuSet) {
        self.affinity.store(mask);
    }

    pub fn cpticks(&self) -> u32 {
        self.cpticks.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_cpticks(&self) {
        self.cpticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cpbase(&self) -> TimeNs {
        self.cpbase.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_cpbase(&self, cpbase: TimeNs) {
        self.cpbase.store(cpbase, Ordering::Relaxed);
        self.cpticks.store(0, Ordering::Relaxed);
    }

    /// Seconds the entity has been asleep. Maintained by the thread
    /// subsystem.
    pub fn slptime(&self) -> u32 {
        self.slptime.load(Ordering::Relaxed)
    }

    pub fn set_slptime(&self, secs: u32) {
        self.slptime.store(secs, Ordering::Relaxed);
    }

    /// Decayed cpu usage in basis points of one CPU.
    pub fn pctcpu(&self) -> u32 {
        self.pctcpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pctcpu(&self, v: u32) {
        self.pctcpu.store(v, Ordering::Relaxed);
    }

    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Lwp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lwp")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority())
            .field("estcpu", &self.estcpu())
            .field("batch", &self.batch())
            .field("on_queue", &self.on_queue())
            .field("home_cpu", &self.home_cpu())
            .field("affinity", &self.affinity())
            .finish()
    }
}

impl fmt::Display for Lwp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.id)
    }
}
