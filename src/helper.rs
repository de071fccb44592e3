// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Helper Tasks as OS threads.
//!
//! One thread per active CPU blocks on that CPU's inbox and runs
//! `Bsd4::helper_step` for every notification it receives. A helper only
//! wakes for a notification or for `stop()`, which disconnects the shared
//! shutdown channel.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::bounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use crossbeam::select;
use log::debug;
use log::warn;

use crate::sched::Bsd4;
use crate::types::CpuId;

pub struct HelperPool {
    shutdown: Option<Sender<()>>,
    handles: Vec<(CpuId, JoinHandle<()>)>,
}

impl HelperPool {
    pub fn start(sched: Arc<Bsd4>) -> Result<Self> {
        // Nothing is ever sent. Dropping the sender wakes every helper.
        let (tx, rx) = bounded::<()>(0);
        let mut pool = Self {
            shutdown: Some(tx),
            handles: vec![],
        };

        for cpu in sched.active_cpus().iter() {
            let sched = sched.clone();
            let shutdown = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("bsd4_helper/{}", cpu))
                .spawn(move || helper_main(&sched, cpu, &shutdown))
                .with_context(|| format!("Failed to spawn helper for cpu{}", cpu))?;
            pool.handles.push((cpu, handle));
        }
        debug!("bsd4: started {} helpers", pool.handles.len());
        Ok(pool)
    }

    pub fn nr_helpers(&self) -> usize {
        self.handles.len()
    }

    pub fn stop(&mut self) {
        self.shutdown.take();
        for (cpu, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("bsd4: helper for cpu{} panicked", cpu);
            }
        }
    }
}

impl Drop for HelperPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn helper_main(sched: &Bsd4, cpu: CpuId, shutdown: &Receiver<()>) {
    let inbox = sched.percpu(cpu).inbox();
    loop {
        select! {
            recv(inbox) -> msg => match msg {
                Ok(msg) => sched.helper_step(cpu, msg),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("bsd4: helper for cpu{} stopped", cpu);
}
