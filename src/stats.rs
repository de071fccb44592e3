// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt;
use std::io::Write;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::Result;
use metrics::counter;
use metrics::Counter;
use serde::Deserialize;
use serde::Serialize;

/// One scheduler event counter. The running total is kept locally for
/// reports and mirrored to the installed `metrics` recorder, if any, as
/// `bsd4_events_total{type="<name>"}`.
pub struct StatCounter {
    value: AtomicU64,
    counter: Counter,
}

impl StatCounter {
    fn new(kind: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            counter: counter!("bsd4_events_total", "type" => kind),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for StatCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

macro_rules! sched_stats {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Scheduler event counters. Incremented lock-free from any CPU.
        ///
        /// The `metrics` handles bind to the recorder installed when the
        /// counters are created, so install it before building a `Bsd4`.
        #[derive(Debug)]
        pub struct Stats {
            $($(#[$doc])* pub $name: StatCounter,)*
        }

        #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl Stats {
            pub fn new() -> Self {
                Self {
                    $($name: StatCounter::new(stringify!($name)),)*
                }
            }

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.get(),)*
                }
            }
        }

        impl StatsSnapshot {
            /// Counter increments since `rhs` was taken.
            pub fn delta(&self, rhs: &Self) -> Self {
                Self {
                    $($name: self.$name.wrapping_sub(rhs.$name),)*
                }
            }
        }
    };
}

sched_stats! {
    /// Calls to setrunqueue.
    setrunqueue,
    /// Placements on a fully idle core.
    place_smt,
    /// Placements on a ready CPU.
    place_ready,
    /// Placements that preempt a worse running entity.
    place_running,
    /// Round-robin fallbacks.
    place_rr,
    /// Local reschedule requests.
    resched_local,
    /// Remote reschedules where the target was in the entity's affinity.
    resched_remote_affine,
    /// Remote reschedules outside the entity's affinity.
    resched_remote_nonaffine,
    /// Remote helper wakeups.
    wakeup_remote,
    /// Picks that took the next entity in a queue because it last ran here.
    choose_affinity,
    /// Acquires that returned with the entity still on its home CPU.
    acquire_optimal,
    /// Acquires that migrated the entity.
    acquire_nonoptimal,
    /// Designations taken from a worse entity.
    steals,
    /// Entities the cache-aware selector skipped for locality.
    cache_defers,
    /// Non-local entities taken after the check budget ran out.
    cache_forced,
    /// Home CPUs woken on behalf of skipped entities.
    kicks,
    /// Helper iterations that installed an entity.
    helper_picks,
    /// Helper iterations that handed the work to another idle CPU.
    helper_chains,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn inc(counter: &StatCounter) {
        counter.value.fetch_add(1, Ordering::Relaxed);
        counter.counter.increment(1);
    }
}

impl StatsSnapshot {
    fn pct(&self, v: u64) -> f64 {
        if self.setrunqueue == 0 {
            0.0
        } else {
            v as f64 / self.setrunqueue as f64 * 100.0
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "runq={} smt={:5.2} ready={:5.2} running={:5.2} rr={:5.2}",
            self.setrunqueue,
            self.pct(self.place_smt),
            self.pct(self.place_ready),
            self.pct(self.place_running),
            self.pct(self.place_rr),
        )?;
        writeln!(
            w,
            "resched local={} remote={}/{} wakeup={}",
            self.resched_local,
            self.resched_remote_affine,
            self.resched_remote_nonaffine,
            self.wakeup_remote,
        )?;
        writeln!(
            w,
            "acquire optimal={} nonoptimal={} steals={} choose_affinity={}",
            self.acquire_optimal, self.acquire_nonoptimal, self.steals, self.choose_affinity,
        )?;
        writeln!(
            w,
            "cache defers={} forced={} kicks={} helper picks={} chains={}",
            self.cache_defers, self.cache_forced, self.kicks, self.helper_picks, self.helper_chains,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_format() {
        let stats = Stats::default();
        Stats::inc(&stats.setrunqueue);
        Stats::inc(&stats.setrunqueue);
        Stats::inc(&stats.place_ready);
        let snap = stats.snapshot();
        assert_eq!(snap.setrunqueue, 2);
        assert_eq!(snap.delta(&StatsSnapshot::default()), snap);

        let mut out = vec![];
        snap.format(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("runq=2 "));
        assert!(out.contains("ready=50.00"));

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"place_ready\":1"));
    }

    #[test]
    fn test_counters_reach_recorder() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let stats = metrics::with_local_recorder(&recorder, Stats::new);
        Stats::inc(&stats.steals);
        Stats::inc(&stats.steals);
        Stats::inc(&stats.kicks);

        let out = handle.render();
        assert!(out.contains("bsd4_events_total{type=\"steals\"} 2"), "{}", out);
        assert!(out.contains("bsd4_events_total{type=\"kicks\"} 1"), "{}", out);
        assert_eq!(stats.snapshot().steals, 2);
    }
}
