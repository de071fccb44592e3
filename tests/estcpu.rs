// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Priority and estcpu behavior through the scheduler entry points.

use scx_bsd4::prio::compute_priority;
use scx_bsd4::Acquire;
use scx_bsd4::CpuId;
use scx_bsd4::QueueClass;
use scx_bsd4::RtPrio;
use scx_bsd4::BATCHMAX;
use scx_bsd4::ESTCPUFREQ;
use scx_bsd4::ESTCPUMAX;
use scx_bsd4::PRIBASE_IDLE;
use scx_bsd4::PRIBASE_NORMAL;

mod common;
use common::*;

const PERIOD: u64 = 1_000_000_000 / ESTCPUFREQ as u64;

#[test]
fn test_batch_detune() {
    let (class, interactive) = compute_priority(RtPrio::normal(), 0, ESTCPUMAX, 0);
    assert_eq!(class, QueueClass::Normal);
    let (_, batchy) = compute_priority(RtPrio::normal(), 0, ESTCPUMAX, BATCHMAX);
    assert!(interactive < batchy, "{} >= {}", interactive, batchy);
    assert!(interactive >= PRIBASE_NORMAL && batchy < PRIBASE_IDLE);
}

#[test]
fn test_ticks_raise_priority() {
    setup_test();
    let s = sched(1, 1, 1);
    let a = lwp(&s, "a", RtPrio::normal(), any_cpu(), 0);
    s.acquire_curproc(CpuId(0), &a);
    let start = a.priority();

    for tick in 1..=ESTCPUFREQ as u64 {
        s.schedulerclock(CpuId(0), Some(&a), PERIOD, tick * PERIOD);
        s.verify();
    }
    assert_eq!(a.estcpu(), ESTCPUMAX);
    assert_eq!(a.cpticks(), ESTCPUFREQ);
    assert!(a.priority() > start);
    // upri follows the running entity's priority.
    assert_eq!(s.percpu(CpuId(0)).upri(), a.priority());
}

#[test]
fn test_decay_without_load() {
    setup_test();
    let s = sched(1, 1, 1);
    let a = lwp(&s, "a", RtPrio::normal(), any_cpu(), 0);
    s.acquire_curproc(CpuId(0), &a);

    let mut now = 0;
    for _ in 0..ESTCPUFREQ * 2 {
        now += PERIOD;
        s.schedulerclock(CpuId(0), Some(&a), PERIOD, now);
    }
    s.release_curproc(CpuId(0), &a);
    assert!(s.current(CpuId(0)).is_none());
    // Fold in what it consumed while running.
    s.recalculate_estcpu(&a);

    // Idle clock ticks while a consumes nothing.
    let mut last = (a.estcpu(), a.priority());
    assert!(last.0 > 0);
    for _ in 0..200 {
        for _ in 0..ESTCPUFREQ {
            now += PERIOD;
            s.schedulerclock(CpuId(0), None, PERIOD, now);
        }
        s.recalculate_estcpu(&a);
        let cur = (a.estcpu(), a.priority());
        assert!(cur.0 <= last.0, "estcpu grew {} -> {}", last.0, cur.0);
        assert!(cur.1 <= last.1, "priority worsened {} -> {}", last.1, cur.1);
        last = cur;
    }
    assert_eq!(a.estcpu(), 0);
    assert_eq!(a.batch(), 0);
    assert_eq!(a.pctcpu(), 0);
}

#[test]
fn test_long_sleep_halves_estcpu() {
    setup_test();
    let s = sched(1, 1, 1);
    let a = lwp(&s, "a", RtPrio::normal(), any_cpu(), 0);
    s.acquire_curproc(CpuId(0), &a);
    for tick in 1..=20 {
        s.schedulerclock(CpuId(0), Some(&a), PERIOD, tick * PERIOD);
    }
    s.release_curproc(CpuId(0), &a);
    let est = a.estcpu();

    a.set_slptime(5);
    assert_eq!(s.acquire_curproc(CpuId(0), &a), Acquire::Current(CpuId(0)));
    assert_eq!(a.estcpu(), est / 2);
}

#[test]
fn test_nice_and_class_changes() {
    setup_test();
    let s = sched(1, 2, 1);
    let a = lwp(&s, "a", RtPrio::normal(), any_cpu(), 0);
    let b = lwp(&s, "b", RtPrio::normal(), any_cpu(), 0);
    s.acquire_curproc(CpuId(0), &a);
    s.setrunqueue(CpuId(0), &b);
    let _ = notified(&s);

    s.set_nice(&b, 20);
    assert!(b.priority() > a.priority());
    assert!(b.on_queue());

    s.set_rtprio(&b, RtPrio::idle(0));
    assert_eq!(b.queue_class(), QueueClass::Idle);
    assert_eq!(b.priority(), PRIBASE_IDLE);

    s.set_rtprio(&b, RtPrio::realtime(0));
    assert_eq!(b.queue_class(), QueueClass::Realtime);
    assert_eq!(b.priority(), 0);
    assert!(b.on_queue());
    s.verify();
}

#[test]
fn test_current_rescheduled_by_better_queued() {
    setup_test();
    let s = sched(1, 1, 1);
    let a = lwp(&s, "a", RtPrio::normal(), any_cpu(), 0);
    let b = lwp(&s, "b", RtPrio::normal(), any_cpu(), 0);
    s.tunables().set("rrinterval", 1000).unwrap();
    s.acquire_curproc(CpuId(0), &a);
    s.setrunqueue(CpuId(0), &b);
    assert!(!s.percpu(CpuId(0)).need_resched());

    // Charge a until it falls below b.
    let mut tick = 0;
    while !s.percpu(CpuId(0)).need_resched() {
        tick += 1;
        assert!(tick < ESTCPUFREQ as u64, "a was never rescheduled");
        s.schedulerclock(CpuId(0), Some(&a), PERIOD, tick * PERIOD);
    }

    // a gives the cpu to b on its way back to user mode.
    assert_eq!(s.acquire_curproc(CpuId(0), &a), Acquire::Queued);
    assert_eq!(s.current(CpuId(0)).unwrap().id(), b.id());
    assert!(a.on_queue());
    s.verify();
}
