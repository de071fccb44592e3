// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Candidate selection: which queued entity a CPU should run next.
//!
//! Two algorithms share one contract. Given the CPU asking and optionally
//! the entity it currently runs, either remove and return the entity to
//! run, or return `None` to keep the incumbent. Both are called with the
//! scheduler lock held.

use crate::cpumask::CpuSet;
use crate::lwp::Lwp;
use crate::lwp::LwpRef;
use crate::percpu::PerCpu;
use crate::runq::RunQueues;
use crate::stats::Stats;
use crate::topology::Topology;
use crate::tunables::Tunables;
use crate::types::*;

/// Everything a selector may look at besides the run queues.
pub struct SelectCtx<'a> {
    pub cpu: CpuId,
    pub topo: &'a Topology,
    pub cpus: &'a [PerCpu],
    /// CPUs that currently have a current entity.
    pub running: CpuSet,
    pub tunables: &'a Tunables,
    pub sched_ticks: u64,
    pub stats: &'a Stats,
    /// CPUs the selector wants woken once the lock is dropped.
    pub kick: CpuSet,
}

pub trait CandidateSelector: Send + Sync {
    fn name(&self) -> &'static str;

    fn choose(
        &self,
        rq: &mut RunQueues,
        ctx: &mut SelectCtx<'_>,
        chklp: Option<&Lwp>,
    ) -> Option<LwpRef>;
}

/// Best priority first. Prefers the entity queued right behind the winner
/// if that one last ran on this CPU.
#[derive(Debug, Default)]
pub struct PlainSelector;

impl CandidateSelector for PlainSelector {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn choose(
        &self,
        rq: &mut RunQueues,
        ctx: &mut SelectCtx<'_>,
        chklp: Option<&Lwp>,
    ) -> Option<LwpRef> {
        let cpu = ctx.cpu;
        let mut lp = rq.pick_best(CpuSet::from_cpu(cpu), chklp)?;

        if lp.home_cpu() != cpu {
            let alt = rq
                .next_in_queue(&lp)
                .filter(|next| next.home_cpu() == cpu && next.affinity().test(cpu))
                .cloned();
            if let Some(alt) = alt {
                Stats::inc(&ctx.stats.choose_affinity);
                lp = alt;
            }
        }

        rq.dequeue(&lp);
        lp.reset_defer_count();
        Some(lp)
    }
}

/// Prefers entities that last ran close to the asking CPU.
///
/// A batchy entity whose home is outside the asking CPU's sibling set is
/// skipped, and its home CPU is kicked so it can pick up its own work. Only
/// `queue_checks` such skips are allowed per call, after which the closest
/// skipped entity is taken anyway. An entity is also skipped at most
/// `queue_checks` times in total before it is no longer considered
/// deferrable, so nothing waits more than `queue_checks + 1` calls.
#[derive(Debug, Default)]
pub struct CacheCoherentSelector;

impl CacheCoherentSelector {
    /// Whether no running CPU holds something far enough below `lp` that
    /// `lp` should win regardless of locality.
    fn batchy_looser_pri_test(lp: &Lwp, ctx: &SelectCtx<'_>) -> bool {
        let gap = (ctx.tunables.upri_affinity() * PPQ) as i64;
        ctx.running
            .iter()
            .filter_map(|cpu| ctx.cpus.get(cpu.index()))
            .all(|pc| (pc.upri() as i64 - lp.priority() as i64) <= gap)
    }

    fn deferrable(lp: &Lwp, ctx: &SelectCtx<'_>) -> bool {
        lp.defer_count() < ctx.tunables.queue_checks()
            && lp.batchy_since_before(ctx.sched_ticks)
            && Self::batchy_looser_pri_test(lp, ctx)
    }
}

impl CandidateSelector for CacheCoherentSelector {
    fn name(&self) -> &'static str {
        "cache_coherent"
    }

    fn choose(
        &self,
        rq: &mut RunQueues,
        ctx: &mut SelectCtx<'_>,
        chklp: Option<&Lwp>,
    ) -> Option<LwpRef> {
        let cpu = ctx.cpu;
        let local = ctx.topo.siblings(cpu, ctx.tunables.stick_to_level());
        let budget = ctx.tunables.queue_checks();
        let kick_source = ctx.tunables.kick_source();

        let mut checks = 0;
        let mut chosen: Option<LwpRef> = None;
        // (distance, priority, entity) of the best skipped candidate
        let mut fallback: Option<(u32, u32, LwpRef)> = None;

        for lp in rq.iter() {
            if !lp.affinity().test(cpu) {
                continue;
            }
            let home = lp.home_cpu();
            if local.test(home) || !Self::deferrable(lp, ctx) {
                chosen = Some(lp.clone());
                break;
            }

            lp.inc_defer_count();
            Stats::inc(&ctx.stats.cache_defers);
            let dist = ctx.topo.distance(cpu, home);
            let better = match &fallback {
                Some((d, p, _)) => (dist, lp.priority()) < (*d, *p),
                None => true,
            };
            if better {
                fallback = Some((dist, lp.priority(), lp.clone()));
            }
            if kick_source && home != cpu {
                ctx.kick = ctx.kick.with(home);
            }

            checks += 1;
            if checks >= budget {
                break;
            }
        }

        let lp = match (chosen, fallback) {
            (Some(lp), _) => lp,
            (None, Some((_, _, lp))) if checks >= budget => {
                Stats::inc(&ctx.stats.cache_forced);
                lp
            }
            _ => return None,
        };

        if let Some(chk) = chklp {
            if chk.priority() < lp.priority() + PPQ {
                return None;
            }
        }

        rq.dequeue(&lp);
        lp.reset_defer_count();
        Some(lp)
    }
}

/// The selector for the configuration, picked once at construction.
pub fn selector(cache_coherent: bool) -> Box<dyn CandidateSelector> {
    if cache_coherent {
        Box::new(CacheCoherentSelector)
    } else {
        Box::new(PlainSelector)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lwp::QueueClass;
    use crate::lwp::RtPrio;
    use crate::topology::TopoLevel;
    use crate::tunables::TunablesConfig;

    struct Fixture {
        rq: RunQueues,
        topo: Topology,
        cpus: Vec<PerCpu>,
        tunables: Tunables,
        stats: Stats,
    }

    impl Fixture {
        fn new(queue_checks: u32) -> Self {
            let topo = Topology::synthetic(2, 2, 1).unwrap();
            let cpus = (0..MAX_CPUS as u32).map(|c| PerCpu::new(CpuId(c))).collect();
            let tunables = Tunables::new(&TunablesConfig {
                queue_checks,
                ..Default::default()
            })
            .unwrap();
            Self {
                rq: RunQueues::new(16),
                topo,
                cpus,
                tunables,
                stats: Stats::default(),
            }
        }

        fn add(&mut self, pri: u32, home: u32, batchy: bool) -> LwpRef {
            let id = self.rq.reserve().unwrap();
            let lp = Arc::new(Lwp::new(
                id,
                "t",
                RtPrio::normal(),
                0,
                CpuSet::first_n(4),
                CpuId(home),
                0,
            ));
            lp.set_placement(QueueClass::Normal, pri);
            if batchy {
                lp.set_batch(BATCHMAX);
                lp.update_batchy(10, 0);
            }
            self.rq.install(lp.clone());
            self.rq.enqueue(&lp);
            lp
        }

        fn choose(&mut self, sel: &dyn CandidateSelector, cpu: u32) -> (Option<LwpRef>, CpuSet) {
            let mut ctx = SelectCtx {
                cpu: CpuId(cpu),
                topo: &self.topo,
                cpus: &self.cpus,
                running: CpuSet::new(),
                tunables: &self.tunables,
                sched_ticks: 10,
                stats: &self.stats,
                kick: CpuSet::new(),
            };
            let lp = sel.choose(&mut self.rq, &mut ctx, None);
            (lp, ctx.kick)
        }
    }

    #[test]
    fn test_plain_affinity_lookahead() {
        let mut fx = Fixture::new(5);
        let a = fx.add(PRIBASE_NORMAL + 8, 2, false);
        let b = fx.add(PRIBASE_NORMAL + 9, 0, false);
        let (lp, _) = fx.choose(&PlainSelector, 0);
        assert_eq!(lp.unwrap().id(), b.id());
        assert_eq!(fx.stats.choose_affinity.get(), 1);
        assert!(a.on_queue() && !b.on_queue());
    }

    #[test]
    fn test_plain_keeps_incumbent() {
        let mut fx = Fixture::new(5);
        let a = fx.add(PRIBASE_NORMAL + 8, 0, false);
        let cur = Lwp::new(LwpId(15), "cur", RtPrio::normal(), 0, CpuSet::first_n(4), CpuId(0), 0);
        cur.set_placement(QueueClass::Normal, PRIBASE_NORMAL + 10);
        let mut ctx = SelectCtx {
            cpu: CpuId(0),
            topo: &fx.topo,
            cpus: &fx.cpus,
            running: CpuSet::new(),
            tunables: &fx.tunables,
            sched_ticks: 0,
            stats: &fx.stats,
            kick: CpuSet::new(),
        };
        assert!(PlainSelector.choose(&mut fx.rq, &mut ctx, Some(&cur)).is_none());
        assert!(a.on_queue());
    }

    #[test]
    fn test_cache_prefers_local_and_kicks() {
        let mut fx = Fixture::new(5);
        fx.tunables
            .set("stick_to_level", TopoLevel::Package.as_raw() as i64)
            .unwrap();
        let remote = fx.add(PRIBASE_NORMAL + 8, 2, true);
        let local = fx.add(PRIBASE_NORMAL + 40, 1, true);
        let (lp, kick) = fx.choose(&CacheCoherentSelector, 0);
        assert_eq!(lp.unwrap().id(), local.id());
        assert_eq!(kick, CpuSet::from_cpu(CpuId(2)));
        assert_eq!(remote.defer_count(), 1);
        assert!(remote.on_queue());
    }

    #[test]
    fn test_cache_nothing_local() {
        let mut fx = Fixture::new(5);
        let remote = fx.add(PRIBASE_NORMAL + 8, 1, true);
        let (lp, kick) = fx.choose(&CacheCoherentSelector, 0);
        assert!(lp.is_none());
        assert_eq!(kick, CpuSet::from_cpu(CpuId(1)));
        assert!(remote.on_queue());

        fx.tunables.set("kick_source", 0).unwrap();
        let (lp, kick) = fx.choose(&CacheCoherentSelector, 0);
        assert!(lp.is_none());
        assert!(kick.is_empty());
        assert_eq!(remote.defer_count(), 2);
    }

    #[test]
    fn test_cache_interactive_not_deferred() {
        let mut fx = Fixture::new(5);
        let lp = fx.add(PRIBASE_NORMAL, 3, false);
        let (got, _) = fx.choose(&CacheCoherentSelector, 0);
        assert_eq!(got.unwrap().id(), lp.id());
    }

    #[test]
    fn test_cache_bounded_latency() {
        let k = 3;
        let mut fx = Fixture::new(k);
        let lp = fx.add(PRIBASE_NORMAL, 3, true);
        let mut calls = 0;
        loop {
            calls += 1;
            if let (Some(got), _) = fx.choose(&CacheCoherentSelector, 0) {
                assert_eq!(got.id(), lp.id());
                break;
            }
            assert!(calls <= k);
        }
        assert!(calls <= k + 1);
        assert_eq!(lp.defer_count(), 0);
    }

    #[test]
    fn test_cache_budget_forces_closest() {
        let mut fx = Fixture::new(2);
        let far = fx.add(PRIBASE_NORMAL, 2, true);
        let near = fx.add(PRIBASE_NORMAL + 4, 3, true);
        fx.add(PRIBASE_NORMAL + 8, 1, true);
        let (got, kick) = fx.choose(&CacheCoherentSelector, 0);
        // both skipped candidates are in the other package, priority breaks
        // the tie
        assert_eq!(got.unwrap().id(), far.id());
        assert!(near.on_queue());
        assert_eq!(kick.bits(), 0b1100);
        assert_eq!(fx.stats.cache_forced.get(), 1);
    }
}
