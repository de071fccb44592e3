// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Deterministic tick-driven simulator
//!
//! `Sim` plays the thread subsystem and the timer for a `Bsd4`. Each
//! simulated task alternates between bursts of `run_ticks` on a CPU and
//! `sleep_ticks` asleep (cpu-bound when `sleep_ticks` is zero). Every tick:
//!
//! 1. Sleep timers advance and expired sleepers, and tasks whose start
//!    tick has come, are made runnable with `setrunqueue`.
//! 2. Pending CPU notifications are delivered to the Helper Tasks.
//! 3. On each CPU, a task that lost its designation notices and calls
//!    `acquire_curproc`, the designated task is switched in, and the running
//!    task is charged one tick. A task switched in right after waking goes
//!    through `acquire_curproc` so its sleep is folded into its estcpu. A task whose burst ends blocks through
//!    `release_curproc`; one with a pending reschedule request goes through
//!    `acquire_curproc` again.
//! 4. Once per simulated second, `schedcpu` runs.
//!
//! Everything happens on the calling thread in a fixed order, so two runs
//! of the same configuration produce identical results.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use serde::Deserialize;
use serde::Serialize;

use crate::config::read_json;
use crate::config::Config;
use crate::cpumask::CpuSet;
use crate::lwp::LwpRef;
use crate::lwp::RtPrio;
use crate::sched::Acquire;
use crate::sched::Bsd4;
use crate::sched::NullDispatch;
use crate::stats::StatsSnapshot;
use crate::types::*;

/// A group of identical simulated tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Workload {
    pub name: String,
    pub count: usize,
    pub nice: i32,
    pub rtprio: RtPrio,
    /// Ticks of cpu per burst.
    pub run_ticks: u32,
    /// Ticks asleep after each burst. Zero means cpu-bound.
    pub sleep_ticks: u32,
    /// Hex cpumask. All CPUs when unset.
    pub affinity: Option<String>,
    /// Tick at which the tasks first become runnable.
    pub start_tick: u64,
    /// Exit after this many ticks of cpu. Zero runs forever.
    pub exit_after: u64,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            name: "task".into(),
            count: 1,
            nice: 0,
            rtprio: RtPrio::normal(),
            run_ticks: 10,
            sleep_ticks: 0,
            affinity: None,
            start_tick: 0,
            exit_after: 0,
        }
    }
}

impl Workload {
    pub fn cpu_hog(name: &str, count: usize) -> Self {
        Self {
            name: name.into(),
            count,
            ..Default::default()
        }
    }

    pub fn interactive(name: &str, count: usize, run_ticks: u32, sleep_ticks: u32) -> Self {
        Self {
            name: name.into(),
            count,
            run_ticks,
            sleep_ticks,
            ..Default::default()
        }
    }

    /// One more cpu hog than there are CPUs plus a couple of interactive
    /// tasks.
    pub fn default_mix(nr_cpus: usize) -> Vec<Self> {
        vec![
            Self::cpu_hog("hog", nr_cpus + 1),
            Self::interactive("shell", 2, 1, 9),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    pub sched: Config,
    pub workloads: Vec<Workload>,
    pub ticks: u64,
    /// Scheduler clock period in nanoseconds.
    pub period_ns: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sched: Config::default(),
            workloads: vec![],
            ticks: 1000,
            period_ns: 1_000_000_000 / ESTCPUFREQ as u64,
        }
    }
}

impl SimConfig {
    pub fn parse(input: &str) -> Result<Self> {
        read_json(input)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Runnable,
    Running(CpuId),
    Sleeping,
    Exited,
}

#[derive(Debug)]
struct Task {
    lwp: LwpRef,
    burst: u32,
    sleep: u32,
    start_tick: u64,
    exit_after: u64,
    state: TaskState,
    /// Woke since it last ran, so its next return to user mode goes
    /// through the full acquire.
    woke: bool,
    burst_left: u32,
    sleep_left: u32,
    slept: u64,
    run_ticks: u64,
    switches: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub name: String,
    pub id: u32,
    pub run_ticks: u64,
    pub switches: u64,
    pub estcpu: u32,
    pub batch: i32,
    pub priority: u32,
    /// Decayed cpu usage in basis points.
    pub pctcpu: u32,
    pub exited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimReport {
    pub ticks: u64,
    pub nr_cpus: usize,
    pub selector: String,
    pub idle_ticks: u64,
    pub tasks: Vec<TaskReport>,
    pub stats: StatsSnapshot,
}

impl SimReport {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let total = (self.ticks * self.nr_cpus as u64).max(1);
        writeln!(
            w,
            "ticks={} cpus={} selector={} idle={:5.2}%",
            self.ticks,
            self.nr_cpus,
            self.selector,
            self.idle_ticks as f64 / total as f64 * 100.0
        )?;
        writeln!(
            w,
            "{:<16} {:>4} {:>7} {:>6} {:>6} {:>5} {:>4} {:>6}",
            "NAME", "ID", "RUN", "SW", "ESTCPU", "BATCH", "PRI", "%CPU"
        )?;
        for t in self.tasks.iter() {
            writeln!(
                w,
                "{:<16} {:>4} {:>7} {:>6} {:>6} {:>5} {:>4} {:>6.2}{}",
                t.name,
                t.id,
                t.run_ticks,
                t.switches,
                t.estcpu,
                t.batch,
                t.priority,
                t.pctcpu as f64 / 100.0,
                if t.exited { " (exited)" } else { "" }
            )?;
        }
        self.stats.format(w)
    }
}

pub struct Sim {
    sched: Arc<Bsd4>,
    tasks: Vec<Task>,
    by_lwp: BTreeMap<LwpId, usize>,
    running: Vec<Option<usize>>,
    period: TimeNs,
    tick: u64,
    idle_ticks: u64,
    verify: bool,
}

impl Sim {
    pub fn from_config(cfg: &SimConfig) -> Result<Self> {
        let sched = Arc::new(Bsd4::new(&cfg.sched, Arc::new(NullDispatch))?);
        let workloads = if cfg.workloads.is_empty() {
            Workload::default_mix(sched.topology().nr_cpus())
        } else {
            cfg.workloads.clone()
        };
        Self::new(sched, &workloads, cfg.period_ns)
    }

    pub fn new(sched: Arc<Bsd4>, workloads: &[Workload], period: TimeNs) -> Result<Self> {
        if period == 0 {
            bail!("Clock period must be positive");
        }
        let mut sim = Self {
            sched,
            tasks: vec![],
            by_lwp: BTreeMap::new(),
            running: vec![None; MAX_CPUS],
            period,
            tick: 0,
            idle_ticks: 0,
            verify: false,
        };
        for w in workloads.iter() {
            sim.add_workload(w)?;
        }
        Ok(sim)
    }

    fn add_workload(&mut self, w: &Workload) -> Result<()> {
        if w.run_ticks == 0 {
            bail!("Workload {:?} needs a positive run_ticks", w.name);
        }
        let affinity = match &w.affinity {
            Some(mask) => CpuSet::from_str(mask)?,
            None => self.sched.active_cpus(),
        };
        let homes = affinity & self.sched.active_cpus();
        for i in 0..w.count {
            let name = if w.count > 1 {
                format!("{}-{}", w.name, i)
            } else {
                w.name.clone()
            };
            // Spread initial homes over the allowed CPUs.
            let home = homes
                .nth(self.tasks.len() % homes.weight().max(1))
                .unwrap_or(CpuId(0));
            let lwp = self.sched.new_lwp(&name, w.rtprio, w.nice, affinity, home)?;
            self.by_lwp.insert(lwp.id(), self.tasks.len());
            self.tasks.push(Task {
                lwp,
                burst: w.run_ticks,
                sleep: w.sleep_ticks,
                start_tick: w.start_tick,
                exit_after: w.exit_after,
                state: TaskState::Pending,
                woke: false,
                burst_left: w.run_ticks,
                sleep_left: 0,
                slept: 0,
                run_ticks: 0,
                switches: 0,
            });
        }
        Ok(())
    }

    /// Check the scheduler's invariants after every tick.
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    pub fn sched(&self) -> &Arc<Bsd4> {
        &self.sched
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Ticks of cpu the task named `name` received.
    pub fn run_ticks(&self, name: &str) -> Option<u64> {
        self.tasks
            .iter()
            .find(|t| t.lwp.name() == name)
            .map(|t| t.run_ticks)
    }

    /// Tasks currently executing, indexed by CPU.
    pub fn running(&self) -> BTreeMap<CpuId, String> {
        self.running
            .iter()
            .enumerate()
            .filter_map(|(cpu, idx)| {
                idx.map(|idx| (CpuId(cpu as u32), self.tasks[idx].lwp.name().to_string()))
            })
            .collect()
    }

    pub fn run(&mut self, ticks: u64, shutdown: Option<&AtomicBool>) {
        for _ in 0..ticks {
            if let Some(shutdown) = shutdown {
                if shutdown.load(Ordering::Relaxed) {
                    debug!("sim: stopping early at tick {}", self.tick);
                    break;
                }
            }
            self.step();
        }
    }

    pub fn step(&mut self) {
        self.tick += 1;
        let now = self.tick * self.period;

        self.wake_tasks();
        self.deliver();

        for cpu in self.sched.active_cpus().iter() {
            self.run_cpu(cpu, now);
        }

        if self.tick % ESTCPUFREQ as u64 == 0 {
            self.sched.schedcpu();
        }

        if self.verify {
            self.sched.verify();
            let mut seen = CpuSet::new();
            for t in self.tasks.iter() {
                if let TaskState::Running(cpu) = t.state {
                    assert!(!seen.test(cpu), "sim: two tasks running on cpu{}", cpu);
                    seen = seen.with(cpu);
                }
            }
        }
    }

    fn wake_tasks(&mut self) {
        for t in self.tasks.iter_mut() {
            let wake = match t.state {
                TaskState::Pending => self.tick >= t.start_tick,
                TaskState::Sleeping => {
                    t.sleep_left = t.sleep_left.saturating_sub(1);
                    t.slept += 1;
                    t.sleep_left == 0
                }
                _ => false,
            };
            if wake {
                t.lwp.set_slptime((t.slept / ESTCPUFREQ as u64) as u32);
                t.slept = 0;
                t.woke = true;
                t.state = TaskState::Runnable;
                self.sched.setrunqueue(t.lwp.home_cpu(), &t.lwp);
            }
        }
    }

    /// Run the Helper Tasks until no notification is pending. Each pass
    /// handles at most one message per CPU and the number of passes is
    /// bounded.
    fn deliver(&self) {
        for _ in 0..MAX_CPUS * 4 {
            let mut delivered = false;
            for cpu in self.sched.active_cpus().iter() {
                if let Some(msg) = self.sched.percpu(cpu).try_recv() {
                    self.sched.helper_step(cpu, msg);
                    delivered = true;
                }
            }
            if !delivered {
                break;
            }
        }
    }

    fn run_cpu(&mut self, cpu: CpuId, now: TimeNs) {
        let slot = cpu.index();
        let designated = self.sched.percpu(cpu).current();

        // The running task lost its designation and finds out on its way
        // back to user mode.
        if let Some(idx) = self.running[slot] {
            let lwp = self.tasks[idx].lwp.clone();
            if designated != Some(lwp.id()) {
                self.running[slot] = None;
                self.tasks[idx].state = TaskState::Runnable;
                if self.sched.acquire_curproc(cpu, &lwp) == Acquire::Current(cpu) {
                    self.running[slot] = Some(idx);
                    self.tasks[idx].state = TaskState::Running(cpu);
                }
            }
        }

        if self.running[slot].is_none() {
            let designated = self.sched.percpu(cpu).current();
            if let Some(&idx) = designated.and_then(|id| self.by_lwp.get(&id)) {
                if self.tasks[idx].state == TaskState::Runnable {
                    let lwp = self.tasks[idx].lwp.clone();
                    let res = if self.tasks[idx].woke {
                        self.tasks[idx].woke = false;
                        let res = self.sched.acquire_curproc(cpu, &lwp);
                        lwp.set_slptime(0);
                        res
                    } else {
                        self.sched.acquire_resume(cpu, &lwp)
                    };
                    if res == Acquire::Current(cpu) {
                        self.running[slot] = Some(idx);
                        self.tasks[idx].state = TaskState::Running(cpu);
                        self.tasks[idx].switches += 1;
                    }
                }
            }
        }

        match self.running[slot] {
            Some(idx) => self.charge_tick(cpu, idx, now),
            None => {
                self.sched.schedulerclock(cpu, None, self.period, now);
                self.idle_ticks += 1;
            }
        }
    }

    fn charge_tick(&mut self, cpu: CpuId, idx: usize, now: TimeNs) {
        let slot = cpu.index();
        let lwp = self.tasks[idx].lwp.clone();
        self.sched
            .schedulerclock(cpu, Some(&lwp), self.period, now);

        let t = &mut self.tasks[idx];
        t.run_ticks += 1;
        t.burst_left = t.burst_left.saturating_sub(1);

        if t.exit_after > 0 && t.run_ticks >= t.exit_after {
            t.state = TaskState::Exited;
            self.running[slot] = None;
            self.by_lwp.remove(&lwp.id());
            self.sched.exiting(&lwp);
            return;
        }

        if t.burst_left == 0 {
            t.burst_left = t.burst;
            if t.sleep > 0 {
                t.state = TaskState::Sleeping;
                t.sleep_left = t.sleep;
                self.running[slot] = None;
                self.sched.release_curproc(cpu, &lwp);
                return;
            }
        }

        if self.sched.percpu(cpu).need_resched()
            && self.sched.acquire_curproc(cpu, &lwp) != Acquire::Current(cpu)
        {
            self.running[slot] = None;
            self.tasks[idx].state = TaskState::Runnable;
        }
    }

    pub fn report(&self) -> SimReport {
        SimReport {
            ticks: self.tick,
            nr_cpus: self.sched.active_cpus().weight(),
            selector: self.sched.selector_name().to_string(),
            idle_ticks: self.idle_ticks,
            tasks: self
                .tasks
                .iter()
                .map(|t| TaskReport {
                    name: t.lwp.name().to_string(),
                    id: t.lwp.id().0,
                    run_ticks: t.run_ticks,
                    switches: t.switches,
                    estcpu: t.lwp.estcpu(),
                    batch: t.lwp.batch(),
                    priority: t.lwp.priority(),
                    pctcpu: t.lwp.pctcpu(),
                    exited: t.state == TaskState::Exited,
                })
                .collect(),
            stats: self.sched.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologySpec;

    fn sim(cpus: usize, workloads: &[Workload]) -> Sim {
        let cfg = SimConfig {
            sched: Config {
                topology: TopologySpec::Synthetic {
                    packages: 1,
                    cores: cpus,
                    threads: 1,
                },
                ..Default::default()
            },
            workloads: workloads.to_vec(),
            ..Default::default()
        };
        let mut sim = Sim::from_config(&cfg).unwrap();
        sim.set_verify(true);
        sim
    }

    #[test]
    fn test_single_hog_runs_every_tick() {
        let mut sim = sim(1, &[Workload::cpu_hog("hog", 1)]);
        sim.run(100, None);
        assert_eq!(sim.run_ticks("hog"), Some(100));
        let report = sim.report();
        assert_eq!(report.idle_ticks, 0);
        assert_eq!(report.tasks[0].switches, 1);
    }

    #[test]
    fn test_sleeper_idles_cpu() {
        let mut sim = sim(1, &[Workload::interactive("sh", 1, 1, 4)]);
        sim.run(100, None);
        let ran = sim.run_ticks("sh").unwrap();
        assert!((15..=25).contains(&ran), "ran {}", ran);
        assert!(sim.report().idle_ticks >= 75);
    }

    #[test]
    fn test_exit_after() {
        let mut sim = sim(
            1,
            &[Workload {
                name: "short".into(),
                exit_after: 7,
                ..Default::default()
            }],
        );
        sim.run(20, None);
        let report = sim.report();
        assert_eq!(report.tasks[0].run_ticks, 7);
        assert!(report.tasks[0].exited);
        assert!(sim.sched().current(CpuId(0)).is_none());
    }

    #[test]
    fn test_shutdown_stops_early() {
        let mut sim = sim(1, &[Workload::cpu_hog("hog", 1)]);
        let shutdown = AtomicBool::new(true);
        sim.run(10, Some(&shutdown));
        assert_eq!(sim.tick(), 0);
    }

    #[test]
    fn test_report_format() {
        let mut sim = sim(2, &Workload::default_mix(2));
        sim.run(50, None);
        let mut out = vec![];
        sim.report().format(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("ticks=50 cpus=2 selector=plain"));
        assert!(out.contains("hog-2"));
        assert!(out.contains("shell-1"));
    }

    #[test]
    fn test_parse_sim_config() {
        let cfg = SimConfig::parse(
            r#"{"ticks": 10, "workloads": [{"name": "a", "count": 2, "sleep_ticks": 3}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.ticks, 10);
        assert_eq!(cfg.workloads[0].count, 2);
        assert_eq!(cfg.workloads[0].run_ticks, 10);
        assert!(SimConfig::parse(r#"{"workloads": [{"bogus": 1}]}"#).is_err());
    }
}
