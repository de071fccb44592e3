// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Whole-system properties checked by driving the scheduler from the
//! simulator.

use std::sync::Arc;

use scx_bsd4::sim::Sim;
use scx_bsd4::sim::SimConfig;
use scx_bsd4::sim::Workload;
use scx_bsd4::Bsd4;
use scx_bsd4::Config;
use scx_bsd4::NullDispatch;
use scx_bsd4::TopoLevel;
use scx_bsd4::ESTCPUFREQ;

mod common;
use common::*;

const PERIOD: u64 = 1_000_000_000 / ESTCPUFREQ as u64;

fn sim(cfg: &Config, workloads: &[Workload]) -> Sim {
    let sched = Arc::new(Bsd4::new(cfg, Arc::new(NullDispatch)).unwrap());
    let mut sim = Sim::new(sched, workloads, PERIOD).unwrap();
    sim.set_verify(true);
    sim
}

#[test]
fn test_round_robin_liveness() {
    setup_test();
    let cfg = config(1, 1, 1);
    let mut sim = sim(&cfg, &[Workload::cpu_hog("hog", 2)]);
    let rr = sim.sched().tunables().rrinterval() as u64;

    sim.run(rr * 2, None);
    assert!(sim.run_ticks("hog-0").unwrap() > 0);
    assert!(sim.run_ticks("hog-1").unwrap() > 0);

    sim.run(1000, None);
    let total = sim.tick();
    for name in ["hog-0", "hog-1"] {
        let ran = sim.run_ticks(name).unwrap();
        assert!(ran * 5 >= total, "{} only ran {} of {} ticks", name, ran, total);
    }
    assert_eq!(sim.report().idle_ticks, 0);
}

#[test]
fn test_single_current_under_load() {
    setup_test();
    let workloads = vec![
        Workload::cpu_hog("hog", 6),
        Workload::interactive("ia", 4, 2, 7),
        Workload {
            name: "pinned".into(),
            count: 2,
            affinity: Some("0x1".into()),
            run_ticks: 3,
            sleep_ticks: 3,
            ..Default::default()
        },
        Workload {
            name: "late".into(),
            count: 2,
            start_tick: 100,
            exit_after: 50,
            ..Default::default()
        },
    ];

    for (cache_coherent, smt) in [(false, false), (true, false), (false, true), (true, true)] {
        let mut cfg = config(2, 2, 2);
        cfg.cache_coherent = cache_coherent;
        cfg.tunables.smt = smt;
        let mut sim = sim(&cfg, &workloads);
        // Every tick is verified by the simulator.
        sim.run(600, None);

        let report = sim.report();
        assert!(report.tasks.iter().all(|t| t.run_ticks > 0));
        assert!(report
            .tasks
            .iter()
            .filter(|t| t.name.starts_with("late"))
            .all(|t| t.exited && t.run_ticks == 50));
        // 6 hogs alone keep most of the 8 CPUs busy.
        assert!(report.idle_ticks * 2 < report.ticks * 8);
    }
}

#[test]
fn test_cache_aware_never_starves() {
    setup_test();
    let mut cfg = config(2, 2, 1);
    cfg.cache_coherent = true;
    cfg.tunables.queue_checks = 2;
    cfg.tunables.batch_time = 0;
    cfg.tunables.stick_to_level = TopoLevel::Thread;

    let mut sim = sim(&cfg, &[Workload::cpu_hog("hog", 7)]);
    sim.run(2000, None);
    let report = sim.report();
    for t in report.tasks.iter() {
        assert!(t.run_ticks > 0, "{} starved", t.name);
    }
    assert_eq!(report.selector, "cache_coherent");
}

#[test]
fn test_interactive_beats_hogs() {
    setup_test();
    let cfg = config(1, 1, 1);
    let mut sim = sim(
        &cfg,
        &[
            Workload::cpu_hog("hog", 3),
            Workload::interactive("shell", 1, 1, 9),
        ],
    );
    sim.run(2000, None);
    let report = sim.report();
    let shell = report.tasks.iter().find(|t| t.name == "shell").unwrap();
    let hog = report.tasks.iter().find(|t| t.name == "hog-0").unwrap();
    // The shell wants a tenth of the cpu and gets most of it.
    assert!(shell.run_ticks * 20 >= 2000, "shell ran {}", shell.run_ticks);
    assert!(shell.priority < hog.priority);
    assert!(shell.batch < hog.batch);
}

#[test]
fn test_deterministic() {
    setup_test();
    let cfg = SimConfig {
        sched: config(1, 3, 1),
        workloads: Workload::default_mix(3),
        ..Default::default()
    };
    let run = || {
        let mut sim = Sim::from_config(&cfg).unwrap();
        sim.run(500, None);
        sim.report()
    };
    assert_eq!(run(), run());
}
