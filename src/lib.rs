// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # scx_bsd4
//!
//! A per-CPU user process scheduler modeled on the classic bsd4 usched.
//!
//! Schedulable entities ("lwps") wait on 32 priority buckets in each of
//! three classes (realtime, normal, idle). Each CPU designates at most one
//! current entity. Placement of newly runnable entities prefers fully idle
//! cores, then parked CPUs, then CPUs running something worse, and finally
//! falls back to round robin. A Helper Task per CPU picks work when that CPU
//! goes idle or is asked to reschedule.
//!
//! Normal class priority is derived from nice and from `estcpu`, a decayed
//! estimate of recent cpu use. A slower `batch` score separates cpu-bound
//! entities from interactive ones so the latter keep their priority.
//!
//! The thread subsystem is abstracted behind the [`Dispatch`] trait. The
//! [`sim`] module drives the scheduler from a deterministic tick loop and
//! [`HelperPool`] runs the Helper Tasks as OS threads.

pub mod config;
pub use config::Config;
pub use config::TopologySpec;

mod cpumask;
pub use cpumask::AtomicCpuSet;
pub use cpumask::CpuSet;

mod helper;
pub use helper::HelperPool;

pub mod lwp;
pub use lwp::Lwp;
pub use lwp::LwpRef;
pub use lwp::QueueClass;
pub use lwp::RtPrio;
pub use lwp::RtpType;

mod percpu;
pub use percpu::CpuMsg;
pub use percpu::PerCpu;

pub mod prio;

pub mod runq;

pub mod sched;
pub use sched::Acquire;
pub use sched::Bsd4;
pub use sched::Dispatch;
pub use sched::NullDispatch;
pub use sched::Placement;

pub mod select;

pub mod sim;

mod stats;
pub use stats::StatCounter;
pub use stats::Stats;
pub use stats::StatsSnapshot;

pub mod topology;
pub use topology::TopoLevel;
pub use topology::Topology;

pub mod tunables;
pub use tunables::Tunables;
pub use tunables::TunablesConfig;

mod types;
pub use types::*;
