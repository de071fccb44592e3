// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Helper Tasks running as threads, with the blocking acquire.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use scx_bsd4::Bsd4;
use scx_bsd4::CpuId;
use scx_bsd4::CpuSet;
use scx_bsd4::HelperPool;
use scx_bsd4::RtPrio;

mod common;
use common::*;

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_helper_switches_in() {
    setup_test();
    let (dispatch, rx) = RecordingDispatch::new();
    let s = Arc::new(Bsd4::new(&config(1, 2, 1), dispatch).unwrap());
    let mut pool = HelperPool::start(s.clone()).unwrap();
    assert_eq!(pool.nr_helpers(), 2);

    let a = lwp(&s, "a", RtPrio::normal(), any_cpu(), 0);
    s.setrunqueue(CpuId(0), &a);

    match rx.recv_timeout(TIMEOUT).unwrap() {
        Switch::In(id, cpu) => {
            assert_eq!(id, a.id());
            assert_eq!(s.current(cpu).unwrap().id(), a.id());
            assert_eq!(a.home_cpu(), cpu);
        }
        other => panic!("unexpected {:?}", other),
    }
    pool.stop();
    assert_eq!(pool.nr_helpers(), 0);
    s.verify();
}

#[test]
fn test_stop_wakes_idle_helpers() {
    setup_test();
    let s = Arc::new(Bsd4::new(&config(1, 4, 1), Arc::new(scx_bsd4::NullDispatch)).unwrap());
    let mut pool = HelperPool::start(s.clone()).unwrap();
    assert_eq!(pool.nr_helpers(), 4);

    // Parked helpers leave the inboxes alone until told to stop.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(s.ready_mask().bits(), 0b1111);

    let started = Instant::now();
    pool.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.nr_helpers(), 0);

    // Notifications after stop stay queued.
    let a = lwp(&s, "a", RtPrio::normal(), any_cpu(), 0);
    s.setrunqueue(CpuId(0), &a);
    assert_eq!(notified(&s).weight(), 1);
    assert!(a.on_queue());
}

#[test]
fn test_helper_displaces_worse_current() {
    setup_test();
    let (dispatch, rx) = RecordingDispatch::new();
    let s = Arc::new(Bsd4::new(&config(1, 2, 1), dispatch).unwrap());
    let a = lwp(&s, "a", RtPrio::realtime(100), any_cpu(), 0);
    let b = lwp(&s, "b", RtPrio::realtime(1), CpuSet::from_cpu(CpuId(0)), 0);
    s.acquire_curproc(CpuId(0), &a);
    let _pool = HelperPool::start(s.clone()).unwrap();

    // b may only run on cpu0, whose helper is told to reschedule. a is
    // displaced and picked up by the idle cpu1.
    s.setrunqueue(CpuId(1), &b);
    let events: Vec<Switch> = (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    assert!(events.contains(&Switch::Out(a.id(), CpuId(0))), "{:?}", events);
    assert!(events.contains(&Switch::In(b.id(), CpuId(0))), "{:?}", events);
    assert!(events.contains(&Switch::In(a.id(), CpuId(1))), "{:?}", events);

    assert_eq!(s.current(CpuId(0)).unwrap().id(), b.id());
    assert_eq!(s.current(CpuId(1)).unwrap().id(), a.id());
    assert!(!a.on_queue());
    s.verify();
}

#[test]
fn test_acquire_wait() {
    setup_test();
    let (dispatch, rx) = RecordingDispatch::new();
    let s = Arc::new(Bsd4::new(&config(1, 1, 1), dispatch).unwrap());
    let _pool = HelperPool::start(s.clone()).unwrap();

    let a = lwp(&s, "a", RtPrio::normal(), any_cpu(), 0);
    let b = lwp(&s, "b", RtPrio::normal(), any_cpu(), 0);
    s.acquire_curproc(CpuId(0), &a);

    let releaser = {
        let s = s.clone();
        let a = a.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            s.release_curproc(CpuId(0), &a);
        })
    };

    let mut parks = 0;
    let cpu = s.acquire_curproc_wait(CpuId(0), &b, |lp| {
        parks += 1;
        loop {
            match rx.recv_timeout(TIMEOUT) {
                Ok(Switch::In(id, cpu)) if id == lp.id() => return cpu,
                Ok(_) => continue,
                Err(e) => panic!("lwp {} was never switched in: {}", lp, e),
            }
        }
    });
    releaser.join().unwrap();

    assert_eq!(cpu, CpuId(0));
    assert_eq!(parks, 1);
    assert_eq!(s.current(CpuId(0)).unwrap().id(), b.id());
    s.verify();
}
