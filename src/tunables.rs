// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Live scheduler knobs.
//!
//! Every knob can be read and written by name while the scheduler runs,
//! the way the kernel exposes them as sysctls. Values are stored in atomics
//! and sampled at the point of use, so a change takes effect at the next
//! decision that reads it.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::topology::TopoLevel;

/// Initial knob values, as found in a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunablesConfig {
    /// Round-robin interval in scheduler ticks.
    pub rrinterval: u32,
    /// Estcpu decay factor. Higher values converge more slowly.
    pub decay: u32,
    /// Batch score at which an entity counts as batchy.
    pub batch_time: u32,
    /// Priority gap, in run queues, that overrides cache locality.
    pub upri_affinity: u32,
    /// Locality checks per call of the cache-aware selector.
    pub queue_checks: u32,
    /// Prefer fully idle cores when placing.
    pub smt: bool,
    /// Topology level inside which CPUs count as local.
    pub stick_to_level: TopoLevel,
    /// Wake the home CPU of an entity the cache-aware selector skipped.
    pub kick_source: bool,
}

impl Default for TunablesConfig {
    fn default() -> Self {
        Self {
            rrinterval: 5,
            decay: 8,
            batch_time: 10,
            upri_affinity: 16,
            queue_checks: 5,
            smt: false,
            stick_to_level: TopoLevel::Core,
            kick_source: true,
        }
    }
}

#[derive(Debug)]
pub struct Tunables {
    rrinterval: AtomicU32,
    decay: AtomicU32,
    batch_time: AtomicU32,
    upri_affinity: AtomicU32,
    queue_checks: AtomicU32,
    smt: AtomicBool,
    stick_to_level: AtomicU8,
    kick_source: AtomicBool,
}

impl Tunables {
    pub const NAMES: [&'static str; 8] = [
        "rrinterval",
        "decay",
        "batch_time",
        "upri_affinity",
        "queue_checks",
        "smt",
        "stick_to_level",
        "kick_source",
    ];

    pub fn new(cfg: &TunablesConfig) -> Result<Self> {
        let tun = Self {
            rrinterval: AtomicU32::new(0),
            decay: AtomicU32::new(0),
            batch_time: AtomicU32::new(0),
            upri_affinity: AtomicU32::new(0),
            queue_checks: AtomicU32::new(0),
            smt: AtomicBool::new(false),
            stick_to_level: AtomicU8::new(0),
            kick_source: AtomicBool::new(false),
        };
        tun.apply(cfg)?;
        Ok(tun)
    }

    /// Validate and store all knobs of `cfg`.
    pub fn apply(&self, cfg: &TunablesConfig) -> Result<()> {
        self.set("rrinterval", cfg.rrinterval as i64)?;
        self.set("decay", cfg.decay as i64)?;
        self.set("batch_time", cfg.batch_time as i64)?;
        self.set("upri_affinity", cfg.upri_affinity as i64)?;
        self.set("queue_checks", cfg.queue_checks as i64)?;
        self.set("smt", cfg.smt as i64)?;
        self.set("stick_to_level", cfg.stick_to_level.as_raw() as i64)?;
        self.set("kick_source", cfg.kick_source as i64)?;
        Ok(())
    }

    pub fn rrinterval(&self) -> u32 {
        self.rrinterval.load(Ordering::Relaxed)
    }

    pub fn decay(&self) -> u32 {
        self.decay.load(Ordering::Relaxed)
    }

    pub fn batch_time(&self) -> i32 {
        self.batch_time.load(Ordering::Relaxed) as i32
    }

    pub fn upri_affinity(&self) -> u32 {
        self.upri_affinity.load(Ordering::Relaxed)
    }

    pub fn queue_checks(&self) -> u32 {
        self.queue_checks.load(Ordering::Relaxed)
    }

    pub fn smt(&self) -> bool {
        self.smt.load(Ordering::Relaxed)
    }

    pub fn stick_to_level(&self) -> TopoLevel {
        TopoLevel::from_raw(self.stick_to_level.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn kick_source(&self) -> bool {
        self.kick_source.load(Ordering::Relaxed)
    }

    pub fn get(&self, name: &str) -> Result<i64> {
        Ok(match name {
            "rrinterval" => self.rrinterval() as i64,
            "decay" => self.decay() as i64,
            "batch_time" => self.batch_time() as i64,
            "upri_affinity" => self.upri_affinity() as i64,
            "queue_checks" => self.queue_checks() as i64,
            "smt" => self.smt() as i64,
            "stick_to_level" => self.stick_to_level().as_raw() as i64,
            "kick_source" => self.kick_source() as i64,
            _ => bail!("Unknown tunable {:?}", name),
        })
    }

    pub fn set(&self, name: &str, value: i64) -> Result<()> {
        let ranged = |min: i64, max: i64| -> Result<u32> {
            if value < min || value > max {
                bail!("{} must be in [{}, {}], got {}", name, min, max, value);
            }
            Ok(value as u32)
        };
        match name {
            "rrinterval" => self.rrinterval.store(ranged(1, 1000)?, Ordering::Relaxed),
            "decay" => self.decay.store(ranged(1, 1024)?, Ordering::Relaxed),
            "batch_time" => self
                .batch_time
                .store(ranged(0, crate::types::BATCHMAX as i64)?, Ordering::Relaxed),
            "upri_affinity" => self
                .upri_affinity
                .store(ranged(0, crate::types::NQS as i64)?, Ordering::Relaxed),
            "queue_checks" => self.queue_checks.store(ranged(0, 1024)?, Ordering::Relaxed),
            "smt" => self.smt.store(ranged(0, 1)? != 0, Ordering::Relaxed),
            "stick_to_level" => {
                let level = TopoLevel::from_raw(ranged(0, 2)? as u8)
                    .ok_or_else(|| anyhow!("Bad topology level {}", value))?;
                self.stick_to_level
                    .store(level.as_raw(), Ordering::Relaxed)
            }
            "kick_source" => self
                .kick_source
                .store(ranged(0, 1)? != 0, Ordering::Relaxed),
            _ => bail!("Unknown tunable {:?}", name),
        }
        Ok(())
    }

    /// Parse and apply a "name=value" assignment.
    pub fn set_knob(&self, knob: &str) -> Result<()> {
        let (name, value) = knob
            .split_once('=')
            .ok_or_else(|| anyhow!("Knob {:?} is not in name=value form", knob))?;
        let value = match value.trim() {
            "true" | "on" => 1,
            "false" | "off" => 0,
            v => v
                .parse::<i64>()
                .map_err(|e| anyhow!("Bad value for {}: {}", name, e))?,
        };
        self.set(name.trim(), value)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, i64> {
        Self::NAMES
            .iter()
            .filter_map(|&name| self.get(name).ok().map(|v| (name, v)))
            .collect()
    }
}
