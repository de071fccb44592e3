// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # The bsd4 scheduler
//!
//! `Bsd4` owns the global run queues, the per-CPU records and the two
//! global masks:
//!
//! - `curprocmask`: CPUs that have a current entity.
//! - `rdyprocmask`: CPUs that are idle with their Helper Task parked.
//!
//! A CPU is never in both masks outside a critical section. Both masks, the
//! run queues and every per-CPU `current` are only modified with the
//! scheduler lock held. Critical sections never allocate, log or notify;
//! notifications and dispatch callbacks are collected in a `Deferred` and
//! issued once the lock has been dropped.
//!
//! Entities move through these states relative to a CPU:
//!
//!```text
//!   unscheduled --setrunqueue--> queued --chosen/claimed--> current
//!        ^                                                    |
//!        +------------- release / preempted / stolen ---------+
//!```
//!
//! An entity is current on at most one CPU and queued at most once; a
//! current entity is never queued.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;
use log::trace;

use crate::config::Config;
use crate::cpumask::AtomicCpuSet;
use crate::cpumask::CpuSet;
use crate::lwp::Lwp;
use crate::lwp::LwpRef;
use crate::lwp::RtPrio;
use crate::percpu::CpuMsg;
use crate::percpu::Notify;
use crate::percpu::PerCpu;
use crate::prio;
use crate::runq::RunQueues;
use crate::select;
use crate::select::CandidateSelector;
use crate::select::SelectCtx;
use crate::stats::Stats;
use crate::stats::StatsSnapshot;
use crate::topology::Topology;
use crate::tunables::Tunables;
use crate::types::*;

/// The seam to the thread subsystem.
pub trait Dispatch: Send + Sync {
    /// `lwp` was made current on `cpu` and should be run there.
    fn switch_in(&self, lwp: &LwpRef, cpu: CpuId);

    /// `lwp` lost its designation on `cpu` and was put back on the run
    /// queues.
    fn switch_out(&self, lwp: &LwpRef, cpu: CpuId);
}

/// Dispatch for callers that poll `Bsd4::current()` instead.
#[derive(Debug, Default)]
pub struct NullDispatch;

impl Dispatch for NullDispatch {
    fn switch_in(&self, _lwp: &LwpRef, _cpu: CpuId) {}
    fn switch_out(&self, _lwp: &LwpRef, _cpu: CpuId) {}
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The entity is current on the given CPU. It is the calling CPU unless
    /// the entity was meanwhile designated elsewhere and must migrate.
    Current(CpuId),
    /// The entity was queued and must give up the processor until it is
    /// designated somewhere.
    Queued,
}

/// Side effects collected under the lock.
#[derive(Default)]
struct Deferred {
    notify: Notify,
    switch_in: Option<(LwpRef, CpuId)>,
    switch_out: Option<(LwpRef, CpuId)>,
}

impl Deferred {
    fn switched_in(&mut self, lp: LwpRef, cpu: CpuId) {
        debug_assert!(self.switch_in.is_none());
        self.switch_in = Some((lp, cpu));
    }

    fn switched_out(&mut self, lp: LwpRef, cpu: CpuId) {
        debug_assert!(self.switch_out.is_none());
        self.switch_out = Some((lp, cpu));
    }
}

/// Which step of the placement heuristic picked the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    FreeCore,
    Ready,
    Preempt,
    RoundRobin,
}

pub struct Bsd4 {
    topo: Topology,
    active: CpuSet,
    global: CpuSet,
    cpus: Vec<PerCpu>,
    curprocmask: AtomicCpuSet,
    rdyprocmask: AtomicCpuSet,
    rq: Mutex<RunQueues>,
    selector: Box<dyn CandidateSelector>,
    tunables: Tunables,
    stats: Stats,
    dispatch: Arc<dyn Dispatch>,
    scancpu: AtomicU32,
    sched_ticks: AtomicU64,
}

impl Bsd4 {
    pub fn new(config: &Config, dispatch: Arc<dyn Dispatch>) -> Result<Self> {
        let topo = config.topology.build()?;
        Self::with_topology(topo, config, dispatch)
    }

    pub fn with_topology(
        topo: Topology,
        config: &Config,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<Self> {
        config.validate()?;
        let global = config.global_mask(&topo)?;
        let active = topo.span();
        let tunables = Tunables::new(&config.tunables)?;
        let selector = select::selector(config.cache_coherent);

        info!(
            "bsd4: {} CPUs active={} global={} selector={} max_lwps={}",
            topo.nr_cpus(),
            active,
            global,
            selector.name(),
            config.max_lwps
        );

        Ok(Self {
            cpus: (0..MAX_CPUS as u32).map(|c| PerCpu::new(CpuId(c))).collect(),
            curprocmask: AtomicCpuSet::new(CpuSet::new()),
            // Every helper starts out parked.
            rdyprocmask: AtomicCpuSet::new(active),
            rq: Mutex::new(RunQueues::new(config.max_lwps)),
            topo,
            active,
            global,
            selector,
            tunables,
            stats: Stats::default(),
            dispatch,
            scancpu: AtomicU32::new(0),
            sched_ticks: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RunQueues> {
        match self.rq.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("bsd4: scheduler lock poisoned"),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn selector_name(&self) -> &'static str {
        self.selector.name()
    }

    pub fn active_cpus(&self) -> CpuSet {
        self.active
    }

    pub fn global_cpumask(&self) -> CpuSet {
        self.global
    }

    pub fn running_mask(&self) -> CpuSet {
        self.curprocmask.load()
    }

    pub fn ready_mask(&self) -> CpuSet {
        self.rdyprocmask.load()
    }

    pub fn percpu(&self, cpu: CpuId) -> &PerCpu {
        match self.cpus.get(cpu.index()) {
            Some(pc) => pc,
            None => panic!("bsd4: cpu {} out of range", cpu),
        }
    }

    pub fn sched_ticks(&self) -> u64 {
        self.sched_ticks.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of queued entities.
    pub fn runq_count(&self) -> usize {
        self.lock().count()
    }

    pub fn lwp(&self, id: LwpId) -> Option<LwpRef> {
        self.lock().get(id).cloned()
    }

    /// The entity `cpu` currently designates.
    pub fn current(&self, cpu: CpuId) -> Option<LwpRef> {
        let rq = self.lock();
        self.percpu(cpu).current().and_then(|id| rq.get(id).cloned())
    }

    fn select_ctx(&self, cpu: CpuId) -> SelectCtx<'_> {
        SelectCtx {
            cpu,
            topo: &self.topo,
            cpus: &self.cpus,
            running: self.curprocmask.load(),
            tunables: &self.tunables,
            sched_ticks: self.sched_ticks(),
            stats: &self.stats,
            kick: CpuSet::new(),
        }
    }

    /// Post the collected notifications and run the dispatch callbacks.
    /// Must be called without the lock.
    fn complete(&self, d: Deferred) {
        for (cpu, msg) in d.notify.iter() {
            debug_assert!(self.active.test(cpu), "bsd4: {:?} to inactive cpu{}", msg, cpu);
            trace!("bsd4: {:?} -> cpu{}", msg, cpu);
            self.percpu(cpu).post(msg);
        }
        if let Some((lp, cpu)) = d.switch_out {
            self.dispatch.switch_out(&lp, cpu);
        }
        if let Some((lp, cpu)) = d.switch_in {
            self.dispatch.switch_in(&lp, cpu);
        }
    }

    /*
     * Registration.
     */

    /// Register a new entity. `home_cpu` is where it is first placed; if it
    /// is not an active CPU of `affinity` the first one that is is used.
    pub fn new_lwp(
        &self,
        name: &str,
        rtprio: RtPrio,
        nice: i32,
        affinity: CpuSet,
        home_cpu: CpuId,
    ) -> Result<LwpRef> {
        let allowed = affinity & self.active;
        let home = if allowed.test(home_cpu) {
            home_cpu
        } else {
            allowed
                .first()
                .ok_or_else(|| anyhow!("lwp {:?}: affinity {} has no active CPU", name, affinity))?
        };

        let id = {
            let mut rq = self.lock();
            let cap = rq.capacity();
            rq.reserve()
                .ok_or_else(|| anyhow!("Too many lwps, the maximum is {}", cap))?
        };

        let pc = self.percpu(home);
        let cpbase = pc.clock().saturating_sub(pc.periodic());
        let lp = Arc::new(Lwp::new(id, name, rtprio, nice, affinity, home, cpbase));
        let (class, pri) = prio::compute_priority(lp.rtprio(), lp.nice(), 0, 0);
        lp.set_placement(class, pri);

        self.lock().install(lp.clone());
        debug!("bsd4: new lwp {} pri={} home=cpu{}", lp, pri, home);
        Ok(lp)
    }

    pub fn set_nice(&self, lp: &LwpRef, nice: i32) {
        lp.store_nice(nice);
        self.resetpriority(lp);
    }

    pub fn set_rtprio(&self, lp: &LwpRef, rtprio: RtPrio) {
        lp.store_rtprio(rtprio);
        self.resetpriority(lp);
    }

    /// Change the CPUs `lp` may run on. A queued `lp` is placed again so a
    /// CPU of the new mask notices it. If it is current on a CPU it may no
    /// longer use, that CPU is asked to reschedule.
    pub fn set_affinity(&self, lp: &LwpRef, affinity: CpuSet) -> Result<()> {
        if (affinity & self.active).is_empty() {
            bail!("lwp {}: affinity {} has no active CPU", lp, affinity);
        }

        let mut d = Deferred::default();
        {
            let mut rq = self.lock();
            lp.store_affinity(affinity);
            let home = lp.home_cpu();
            if lp.on_queue() {
                rq.dequeue(lp);
                self.setrunqueue_locked(&mut rq, home, lp, &mut d);
            } else if self.percpu(home).current() == Some(lp.id()) && !affinity.test(home) {
                self.percpu(home).set_need_resched();
            }
        }
        self.complete(d);
        Ok(())
    }

    /*
     * setrunqueue and placement.
     */

    /// Make `lp` runnable. `cpu_self` is the CPU doing it.
    pub fn setrunqueue(&self, cpu_self: CpuId, lp: &LwpRef) {
        let mut d = Deferred::default();
        let (target, how) = {
            let mut rq = self.lock();
            self.setrunqueue_locked(&mut rq, cpu_self, lp, &mut d)
        };
        self.complete(d);
        debug!(
            "cpu{}: setrunqueue {} pri={} -> cpu{} ({:?})",
            cpu_self,
            lp,
            lp.priority(),
            target,
            how
        );
    }

    fn setrunqueue_locked(
        &self,
        rq: &mut RunQueues,
        cpu_self: CpuId,
        lp: &LwpRef,
        d: &mut Deferred,
    ) -> (CpuId, Placement) {
        assert!(!lp.exited(), "bsd4: setrunqueue of exited lwp {}", lp);
        let home = lp.home_cpu();
        assert!(
            self.percpu(home).current() != Some(lp.id()),
            "bsd4: setrunqueue of lwp {} which is current on cpu{}",
            lp,
            home
        );

        rq.enqueue(lp);
        Stats::inc(&self.stats.setrunqueue);

        let (target, how) = self.place(lp);
        let tpc = self.percpu(target);
        let better = pri_bucket(lp.priority()) < pri_bucket(tpc.upri());

        if target == cpu_self {
            if better {
                if tpc.current().is_none() {
                    self.rdyprocmask.clear_cpu(target);
                    d.notify.wakeup(target);
                } else {
                    tpc.set_need_resched();
                    Stats::inc(&self.stats.resched_local);
                }
            }
        } else {
            self.rdyprocmask.clear_cpu(target);
            if tpc.current().is_some() && better {
                d.notify.resched(target);
                if lp.affinity().test(target) {
                    Stats::inc(&self.stats.resched_remote_affine);
                } else {
                    Stats::inc(&self.stats.resched_remote_nonaffine);
                }
            } else {
                d.notify.wakeup(target);
                Stats::inc(&self.stats.wakeup_remote);
            }
        }
        (target, how)
    }

    /// Pick the CPU that should notice `lp`. Every step only considers
    /// active CPUs of the global mask that `lp` may run on.
    fn place(&self, lp: &Lwp) -> (CpuId, Placement) {
        let lpri = pri_bucket(lp.priority());
        let eligible = lp.affinity() & self.active & self.global;
        let running = self.curprocmask.load();
        let ready = self.rdyprocmask.load() & !running & eligible;
        let start = CpuId(self.scancpu.fetch_add(1, Ordering::Relaxed) % MAX_CPUS as u32);

        if self.tunables.smt() && !ready.is_empty() {
            // A CPU whose siblings are all idle is a free core. Failing
            // that, the CPU whose busy sibling has the best priority.
            let mut best: Option<(u32, CpuId)> = None;
            for cpu in ready.iter_from(start) {
                let busy = self.topo.smt_siblings(cpu) & running;
                if busy.is_empty() {
                    Stats::inc(&self.stats.place_smt);
                    return (cpu, Placement::FreeCore);
                }
                let sib_upri = busy
                    .iter()
                    .map(|sib| self.percpu(sib).upri())
                    .min()
                    .unwrap_or(PRIBASE_NULL);
                if best.map_or(true, |(upri, _)| sib_upri < upri) {
                    best = Some((sib_upri, cpu));
                }
            }
            if let Some((_, cpu)) = best {
                Stats::inc(&self.stats.place_smt);
                return (cpu, Placement::FreeCore);
            }
        }

        for cpu in ready.iter_from(start) {
            if pri_bucket(self.percpu(cpu).upri()) >= lpri {
                Stats::inc(&self.stats.place_ready);
                return (cpu, Placement::Ready);
            }
        }

        for cpu in (running & eligible).iter_from(start) {
            if pri_bucket(self.percpu(cpu).upri()) > lpri {
                Stats::inc(&self.stats.place_running);
                return (cpu, Placement::Preempt);
            }
        }

        Stats::inc(&self.stats.place_rr);
        let pool = if !eligible.is_empty() {
            eligible
        } else {
            self.global & self.active
        };
        let target = pool
            .nth(start.index() % pool.weight().max(1))
            .unwrap_or_else(|| lp.home_cpu());
        (target, Placement::RoundRobin)
    }

    /*
     * Acquire and release.
     */

    fn install_locked(&self, cpu: CpuId, lp: &LwpRef) {
        assert!(!lp.on_queue(), "bsd4: installing queued lwp {}", lp);
        let home = lp.home_cpu();
        assert!(
            home == cpu || self.percpu(home).current() != Some(lp.id()),
            "bsd4: lwp {} is already current on cpu{}",
            lp,
            home
        );
        let pc = self.percpu(cpu);
        pc.set_current(Some(lp.id()));
        pc.set_upri(lp.priority());
        lp.set_home_cpu(cpu);
        self.curprocmask.set_cpu(cpu);
        self.rdyprocmask.clear_cpu(cpu);
    }

    /// Called on the way back to user mode. Recomputes `lp`'s estcpu,
    /// honors a pending reschedule request, then tries to make `lp` the
    /// current entity of `cpu`.
    pub fn acquire_curproc(&self, cpu: CpuId, lp: &LwpRef) -> Acquire {
        self.recalculate_estcpu(lp);
        let pc = self.percpu(cpu);
        if pc.need_resched() {
            // Only a request aimed at lp itself is honored here. lp may
            // already have been displaced and picked up by another CPU.
            let mut d = Deferred::default();
            {
                let mut rq = self.lock();
                if pc.current() == Some(lp.id()) && pc.take_need_resched() {
                    self.release_locked(&mut rq, cpu, lp, &mut d);
                }
            }
            self.complete(d);
        }

        let res = self.acquire_resume(cpu, lp);
        match res {
            Acquire::Current(c) if c == cpu => Stats::inc(&self.stats.acquire_optimal),
            Acquire::Current(_) => Stats::inc(&self.stats.acquire_nonoptimal),
            Acquire::Queued => {}
        }
        res
    }

    /// One pass of the acquire loop, used when `lp` resumes after having
    /// given up the processor.
    pub fn acquire_resume(&self, cpu: CpuId, lp: &LwpRef) -> Acquire {
        assert!(!lp.exited(), "bsd4: acquire of exited lwp {}", lp);
        let mut d = Deferred::default();
        let res = {
            let mut rq = self.lock();
            self.try_claim_locked(&mut rq, cpu, lp, &mut d)
        };
        let stolen = d.switch_out.as_ref().map(|(olp, _)| olp.clone());
        self.complete(d);
        if let Some(olp) = stolen {
            debug!("cpu{}: {} stole the cpu from {}", cpu, lp, olp);
        }
        res
    }

    /// The blocking form of acquire. `park` gives up the processor until
    /// `lp` is designated somewhere and returns the CPU it resumed on.
    pub fn acquire_curproc_wait<F>(&self, cpu: CpuId, lp: &LwpRef, mut park: F) -> CpuId
    where
        F: FnMut(&LwpRef) -> CpuId,
    {
        let mut res = self.acquire_curproc(cpu, lp);
        loop {
            match res {
                Acquire::Current(c) => return c,
                Acquire::Queued => {
                    let resumed = park(lp);
                    res = self.acquire_resume(resumed, lp);
                }
            }
        }
    }

    fn try_claim_locked(
        &self,
        rq: &mut RunQueues,
        cpu: CpuId,
        lp: &LwpRef,
        d: &mut Deferred,
    ) -> Acquire {
        // A queued entry is stale once the entity is trying to run.
        if lp.on_queue() {
            rq.dequeue(lp);
        }

        let home = lp.home_cpu();
        if self.percpu(home).current() == Some(lp.id()) {
            return Acquire::Current(home);
        }

        if !lp.affinity().test(cpu) {
            self.setrunqueue_locked(rq, cpu, lp, d);
            return Acquire::Queued;
        }

        let pc = self.percpu(cpu);
        let oid = match pc.current() {
            None => {
                self.install_locked(cpu, lp);
                return Acquire::Current(cpu);
            }
            Some(oid) => oid,
        };
        let olp = match rq.get(oid) {
            Some(olp) => olp.clone(),
            None => panic!("bsd4: cpu{} current lwp {} is not registered", cpu, oid),
        };

        if pri_bucket(pc.upri()) > pri_bucket(lp.priority()) {
            self.install_locked(cpu, lp);
            Stats::inc(&self.stats.steals);
            self.setrunqueue_locked(rq, cpu, &olp, d);
            d.switched_out(olp, cpu);
            Acquire::Current(cpu)
        } else {
            self.setrunqueue_locked(rq, cpu, lp, d);
            Acquire::Queued
        }
    }

    /// Called when `lp` enters the kernel to block or be rescheduled. If it
    /// is current on `cpu` the designation is dropped and a replacement
    /// chosen. Releasing an entity that lost its designation is a no-op.
    pub fn release_curproc(&self, cpu: CpuId, lp: &LwpRef) {
        let mut d = Deferred::default();
        {
            let mut rq = self.lock();
            self.release_locked(&mut rq, cpu, lp, &mut d);
        }
        self.complete(d);
    }

    fn release_locked(&self, rq: &mut RunQueues, cpu: CpuId, lp: &LwpRef, d: &mut Deferred) {
        let pc = self.percpu(cpu);
        if pc.current() == Some(lp.id()) {
            pc.set_current(None);
            pc.set_upri(PRIBASE_NULL);
            self.curprocmask.clear_cpu(cpu);
            self.select_curproc_locked(rq, cpu, d);
            return;
        }

        if let Some(other) = self
            .active
            .iter()
            .find(|&c| self.percpu(c).current() == Some(lp.id()))
        {
            panic!(
                "bsd4: cpu{} releasing lwp {} which is current on cpu{}",
                cpu, lp, other
            );
        }
    }

    /// Install the best candidate on `cpu`, which has no current entity.
    /// Returns whether one was found.
    fn select_curproc_locked(&self, rq: &mut RunQueues, cpu: CpuId, d: &mut Deferred) -> bool {
        let mut ctx = self.select_ctx(cpu);
        let nlp = self.selector.choose(rq, &mut ctx, None);
        let kick = ctx.kick;

        let found = match nlp {
            Some(nlp) => {
                self.install_locked(cpu, &nlp);
                d.switched_in(nlp, cpu);
                true
            }
            None => {
                self.rdyprocmask.set_cpu(cpu);
                self.chain_locked(rq, cpu, d);
                false
            }
        };
        self.kick_locked(kick, cpu, d);
        found
    }

    /// Hand queued work `cpu` could not take to another parked helper that
    /// some queued entity may run on.
    fn chain_locked(&self, rq: &RunQueues, cpu: CpuId, d: &mut Deferred) {
        if rq.is_empty() {
            return;
        }
        let wanted = rq
            .iter()
            .fold(CpuSet::new(), |mask, lp| mask | lp.affinity());
        let idle = self.rdyprocmask.load() & !self.curprocmask.load() & self.active & wanted;
        if let Some(target) = idle.without(cpu).iter_from(cpu).next() {
            self.rdyprocmask.clear_cpu(target);
            d.notify.wakeup(target);
            Stats::inc(&self.stats.helper_chains);
        }
    }

    /// Wake the parked helpers of `kick`.
    fn kick_locked(&self, kick: CpuSet, cpu: CpuId, d: &mut Deferred) {
        let targets = kick & self.rdyprocmask.load() & !self.curprocmask.load() & self.active;
        for target in targets.without(cpu).iter() {
            self.rdyprocmask.clear_cpu(target);
            d.notify.wakeup(target);
            Stats::inc(&self.stats.kicks);
        }
    }

    /*
     * Helper Task.
     */

    /// One iteration of `cpu`'s Helper Task for a delivered message.
    pub fn helper_step(&self, cpu: CpuId, msg: CpuMsg) {
        let pc = self.percpu(cpu);
        if msg == CpuMsg::Resched {
            pc.set_need_resched();
        }

        let mut d = Deferred::default();
        {
            let mut rq = self.lock();
            self.rdyprocmask.clear_cpu(cpu);
            pc.take_need_resched();
            pc.reset_rrcount();

            match pc.current() {
                None => {
                    if self.select_curproc_locked(&mut rq, cpu, &mut d) {
                        Stats::inc(&self.stats.helper_picks);
                    }
                }
                Some(cid) if !rq.is_empty() => {
                    let clp = match rq.get(cid) {
                        Some(clp) => clp.clone(),
                        None => panic!("bsd4: cpu{} current lwp {} is not registered", cpu, cid),
                    };
                    let mut ctx = self.select_ctx(cpu);
                    let nlp = self.selector.choose(&mut rq, &mut ctx, Some(&clp));
                    let kick = ctx.kick;
                    match nlp {
                        Some(nlp) => {
                            pc.set_current(None);
                            self.install_locked(cpu, &nlp);
                            self.setrunqueue_locked(&mut rq, cpu, &clp, &mut d);
                            d.switched_out(clp, cpu);
                            d.switched_in(nlp, cpu);
                            Stats::inc(&self.stats.helper_picks);
                        }
                        None => self.chain_locked(&rq, cpu, &mut d),
                    }
                    self.kick_locked(kick, cpu, &mut d);
                }
                Some(_) => {}
            }
        }
        self.complete(d);
    }

    /*
     * Priority maintenance.
     */

    /// Recompute `lp`'s priority from its scheduling class, nice and
    /// estcpu, moving it to its new queue if it is queued.
    pub fn resetpriority(&self, lp: &LwpRef) {
        if lp.exited() {
            return;
        }
        let (class, pri) =
            prio::compute_priority(lp.rtprio(), lp.nice(), lp.estcpu(), lp.batch());
        let index = ((pri & PRIMASK) / PPQ) as usize;

        let mut d = Deferred::default();
        {
            let mut rq = self.lock();
            let moved = class != lp.queue_class() || index != lp.queue_index();
            if moved && lp.on_queue() {
                rq.dequeue(lp);
                lp.set_placement(class, pri);
                rq.enqueue(lp);

                let rcpu = lp.home_cpu();
                if self.rdyprocmask.test(rcpu)
                    && pri_bucket(self.percpu(rcpu).upri()) > pri_bucket(pri)
                {
                    self.rdyprocmask.clear_cpu(rcpu);
                    d.notify.resched(rcpu);
                }
            } else {
                lp.set_placement(class, pri);
            }

            let home = lp.home_cpu();
            let pc = self.percpu(home);
            if pc.current() == Some(lp.id()) {
                pc.set_upri(pri);
                if let Some(best) = rq.best_queued_pri(CpuSet::from_cpu(home)) {
                    if best < pri_bucket(pri) {
                        pc.set_need_resched();
                    }
                }
            }
        }
        self.complete(d);
    }

    /// Per-tick accounting for the entity running on `cpu`. `period` is the
    /// clock period and `now` the tick's timestamp.
    pub fn schedulerclock(&self, cpu: CpuId, lp: Option<&LwpRef>, period: TimeNs, now: TimeNs) {
        let pc = self.percpu(cpu);
        pc.record_clock(period, now);
        if period > 0 {
            self.sched_ticks.fetch_max(now / period, Ordering::Relaxed);
        }

        let lp = match lp {
            Some(lp) => lp,
            None => return,
        };

        if pc.tick_rrcount(self.tunables.rrinterval()) {
            pc.set_need_resched();
        }

        lp.set_estcpu(prio::tick_estcpu(lp.estcpu()));
        if lp.origcpu() > 0 {
            lp.set_origcpu(lp.origcpu() - 1);
        }
        lp.inc_cpticks();
        lp.update_batchy(self.tunables.batch_time(), self.sched_ticks());
        trace!(
            "cpu{}: clock {} estcpu={} cpticks={}",
            cpu,
            lp,
            lp.estcpu(),
            lp.cpticks()
        );

        self.resetpriority(lp);
    }

    /// Fold the cpu `lp` consumed since its last recalculation into its
    /// estcpu and batch scores.
    pub fn recalculate_estcpu(&self, lp: &LwpRef) {
        let pc = self.percpu(lp.home_cpu());
        let periodic = pc.periodic();
        // The last clock tick, not the upcoming one.
        let cpbase = pc.clock().saturating_sub(periodic);

        if lp.slptime() > 1 {
            let (estcpu, batch) = prio::sleep_correction(lp.estcpu(), lp.batch());
            lp.set_estcpu(estcpu);
            lp.set_batch(batch);
            lp.update_batchy(self.tunables.batch_time(), self.sched_ticks());
            lp.reset_cpbase(cpbase);
            self.resetpriority(lp);
        } else if lp.cpbase() != cpbase {
            let nticks = match periodic {
                0 => 1,
                p => (cpbase.saturating_sub(lp.cpbase()) / p).clamp(1, u32::MAX as u64) as u32,
            };
            let out = prio::decay_estcpu(prio::DecayInput {
                estcpu: lp.estcpu(),
                batch: lp.batch(),
                pctcpu: lp.pctcpu(),
                cpticks: lp.cpticks(),
                nticks,
                runq_count: self.runq_count(),
                ncpus: self.active.weight(),
                decay: self.tunables.decay(),
            });
            trace!(
                "bsd4: recalc {} cpticks={} nticks={} estcpu {}->{} batch {}->{}",
                lp,
                lp.cpticks(),
                nticks,
                lp.estcpu(),
                out.estcpu,
                lp.batch(),
                out.batch
            );
            lp.set_estcpu(out.estcpu);
            lp.set_batch(out.batch);
            lp.set_pctcpu(out.pctcpu);
            lp.update_batchy(self.tunables.batch_time(), self.sched_ticks());
            lp.reset_cpbase(cpbase);
            self.resetpriority(lp);
        }
    }

    /// Once-per-second housekeeping.
    pub fn schedcpu(&self) {
        for cpu in self.active.iter() {
            if let Some(lp) = self.current(cpu) {
                self.recalculate_estcpu(&lp);
            }
        }
    }

    /*
     * Lifecycle hooks.
     */

    /// `child` was forked from `parent`.
    pub fn forking(&self, parent: &LwpRef, child: &LwpRef) {
        let est = parent.estcpu();
        child.set_estcpu(prio::fork_child_estcpu(est));
        child.set_origcpu(child.estcpu());
        child.set_batch(prio::FORK_CHILD_BATCH);
        parent.set_estcpu(prio::fork_parent_estcpu(est));
        self.resetpriority(child);
        self.resetpriority(parent);
    }

    /// `child` was reaped by `parent`. Whatever estcpu the child built up
    /// beyond what it inherited is charged back to the parent, unless the
    /// parent is init.
    pub fn reaped(&self, parent: &LwpRef, child: &LwpRef, parent_is_init: bool) {
        if parent_is_init {
            return;
        }
        let delta = child.estcpu() as i64 - child.origcpu() as i64;
        if delta > 0 {
            parent.set_estcpu(parent.estcpu().saturating_add(delta as u32));
            self.resetpriority(parent);
        }
    }

    /// Remove `lp` from all scheduler bookkeeping.
    pub fn exiting(&self, lp: &LwpRef) {
        if lp.exited() {
            debug!("bsd4: lwp {} exited twice", lp);
            return;
        }
        let mut d = Deferred::default();
        {
            let mut rq = self.lock();
            if lp.on_queue() {
                rq.dequeue(lp);
            }
            let home = lp.home_cpu();
            if self.percpu(home).current() == Some(lp.id()) {
                self.release_locked(&mut rq, home, lp, &mut d);
            }
            rq.remove(lp.id());
            lp.mark_exited();
        }
        self.complete(d);
        debug!("bsd4: lwp {} exited", lp);
    }

    /// Voluntary yield: ask `cpu` to reschedule if `lp` is its current
    /// entity.
    pub fn yield_curproc(&self, cpu: CpuId, lp: &LwpRef) {
        let pc = self.percpu(cpu);
        if pc.current() == Some(lp.id()) {
            pc.set_need_resched();
        }
    }

    /// Check the cross-CPU invariants, panicking on the first violation.
    pub fn verify(&self) {
        let rq = self.lock();
        let running = self.curprocmask.load();
        let ready = self.rdyprocmask.load();
        let mut currents: Vec<LwpId> = vec![];

        for cpu in self.active.iter() {
            let pc = self.percpu(cpu);
            assert_eq!(
                running.test(cpu),
                pc.current().is_some(),
                "bsd4: cpu{} running bit out of sync",
                cpu
            );
            assert!(
                !(ready.test(cpu) && running.test(cpu)),
                "bsd4: cpu{} both ready and running",
                cpu
            );
            if let Some(id) = pc.current() {
                assert!(
                    !currents.contains(&id),
                    "bsd4: lwp {} current on two cpus",
                    id
                );
                currents.push(id);
                let lp = match rq.get(id) {
                    Some(lp) => lp,
                    None => panic!("bsd4: cpu{} current lwp {} not registered", cpu, id),
                };
                assert!(!lp.on_queue(), "bsd4: current lwp {} is queued", lp);
                assert_eq!(lp.home_cpu(), cpu, "bsd4: current lwp {} home mismatch", lp);
                assert_eq!(pc.upri(), lp.priority(), "bsd4: cpu{} stale upri", cpu);
            } else {
                assert_eq!(pc.upri(), PRIBASE_NULL, "bsd4: idle cpu{} has a upri", cpu);
            }
        }

        let queued = rq.iter().count();
        assert_eq!(queued, rq.count(), "bsd4: runq count mismatch");
        assert!(rq.iter().all(|lp| lp.on_queue()));
        let flagged = rq.lwps().filter(|lp| lp.on_queue()).count();
        assert_eq!(flagged, queued, "bsd4: on_queue flags out of sync");
        for class in crate::lwp::QueueClass::ALL {
            for index in 0..NQS {
                assert_eq!(
                    rq.bits(class) & (1 << index) != 0,
                    rq.bucket_len(class, index) > 0,
                    "bsd4: occupancy bit {:?}/{} out of sync",
                    class,
                    index
                );
            }
        }
    }
}
