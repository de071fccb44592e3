// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use std::sync::Arc;

use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use scx_bsd4::Bsd4;
use scx_bsd4::Config;
use scx_bsd4::CpuId;
use scx_bsd4::CpuMsg;
use scx_bsd4::CpuSet;
use scx_bsd4::Dispatch;
use scx_bsd4::LwpId;
use scx_bsd4::LwpRef;
use scx_bsd4::NullDispatch;
use scx_bsd4::RtPrio;
use scx_bsd4::TopologySpec;

/// Route log output through the test harness. Safe to call from every test.
pub fn setup_test() {
    let _ = simplelog::TestLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

pub fn config(packages: usize, cores: usize, threads: usize) -> Config {
    Config {
        topology: TopologySpec::Synthetic {
            packages,
            cores,
            threads,
        },
        ..Default::default()
    }
}

pub fn sched(packages: usize, cores: usize, threads: usize) -> Bsd4 {
    Bsd4::new(&config(packages, cores, threads), Arc::new(NullDispatch)).unwrap()
}

pub fn lwp(s: &Bsd4, name: &str, rtprio: RtPrio, affinity: CpuSet, home: u32) -> LwpRef {
    s.new_lwp(name, rtprio, 0, affinity, CpuId(home)).unwrap()
}

pub fn any_cpu() -> CpuSet {
    CpuSet::from_bits(u64::MAX)
}

/// Drain and return the notifications pending for `cpu`.
pub fn inbox(s: &Bsd4, cpu: u32) -> Vec<CpuMsg> {
    let pc = s.percpu(CpuId(cpu));
    std::iter::from_fn(|| pc.try_recv()).collect()
}

/// CPUs with pending notifications, draining them.
pub fn notified(s: &Bsd4) -> CpuSet {
    let mut set = CpuSet::new();
    for cpu in s.active_cpus().iter() {
        if !inbox(s, cpu.0).is_empty() {
            set = set.with(cpu);
        }
    }
    set
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    In(LwpId, CpuId),
    Out(LwpId, CpuId),
}

/// Dispatch that forwards every callback over a channel.
pub struct RecordingDispatch {
    tx: Sender<Switch>,
}

impl RecordingDispatch {
    pub fn new() -> (Arc<Self>, Receiver<Switch>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }
}

impl Dispatch for RecordingDispatch {
    fn switch_in(&self, lwp: &LwpRef, cpu: CpuId) {
        let _ = self.tx.send(Switch::In(lwp.id(), cpu));
    }

    fn switch_out(&self, lwp: &LwpRef, cpu: CpuId) {
        let _ = self.tx.send(Switch::Out(lwp.id(), cpu));
    }
}
