// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU topology
//!
//! A read-only tree describing which CPUs share a physical core and which
//! cores share a package:
//!
//!```text
//!                    Topology
//!                       |
//!            o----------o----------o
//!            |                     |
//!         Package 0    ...      Package N
//!            |
//!     o------o------o
//!     |             |
//!   Core 0   ...  Core M
//!     |
//!   o-o-o
//!   |   |
//!  Cpu Cpu   (hardware threads)
//!```
//!
//! Every node carries a `CpuSet` spanning all CPUs below it. A Topology is
//! either built synthetically (`packages x cores x threads`) or read from
//! sysfs. It never changes after construction; if the host topology changes
//! a new Topology must be built.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::bail;
use anyhow::Result;
use glob::glob;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use sscanf::sscanf;

use crate::cpumask::read_cpulist;
use crate::cpumask::CpuSet;
use crate::types::CpuId;
use crate::types::MAX_CPUS;

/// Tree level used to decide whether two CPUs are "local" to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopoLevel {
    /// Only the CPU itself.
    Thread,
    /// All hardware threads of the same physical core.
    #[default]
    Core,
    /// All CPUs of the same package.
    Package,
}

impl TopoLevel {
    pub fn from_raw(v: u8) -> Option<TopoLevel> {
        match v {
            0 => Some(TopoLevel::Core),
            1 => Some(TopoLevel::Thread),
            2 => Some(TopoLevel::Package),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            TopoLevel::Core => 0,
            TopoLevel::Thread => 1,
            TopoLevel::Package => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cpu {
    id: CpuId,
    core_id: usize,
    package_id: usize,
}

impl Cpu {
    /// Get the ID of this Cpu
    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }

    pub fn package_id(&self) -> usize {
        self.package_id
    }
}

#[derive(Debug, Clone)]
pub struct Core {
    id: usize,
    cpus: BTreeMap<CpuId, Cpu>,
    span: CpuSet,
}

impl Core {
    /// Get the ID of this Core, unique within its package.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get the map of hardware threads inside this Core
    pub fn cpus(&self) -> &BTreeMap<CpuId, Cpu> {
        &self.cpus
    }

    /// Get a CpuSet of all SMT siblings in this Core
    pub fn span(&self) -> CpuSet {
        self.span
    }
}

#[derive(Debug, Clone)]
pub struct Package {
    id: usize,
    cores: BTreeMap<usize, Core>,
    span: CpuSet,
}

impl Package {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cores(&self) -> &BTreeMap<usize, Core> {
        &self.cores
    }

    pub fn span(&self) -> CpuSet {
        self.span
    }
}

#[derive(Debug)]
pub struct Topology {
    packages: BTreeMap<usize, Package>,
    cpus: BTreeMap<CpuId, Cpu>,
    // Flattened per-CPU spans for lookups from the scheduler hot paths.
    core_spans: Vec<CpuSet>,
    package_spans: Vec<CpuSet>,
    span: CpuSet,
}

impl Topology {
    /// Build a Topology from `(cpu, core, package)` triples.
    pub fn from_entries(entries: &[(usize, usize, usize)]) -> Result<Topology> {
        if entries.is_empty() {
            bail!("Topology must contain at least one CPU");
        }

        let mut packages: BTreeMap<usize, Package> = BTreeMap::new();
        let mut cpus = BTreeMap::new();
        let mut span = CpuSet::new();
        for &(cpu_id, core_id, package_id) in entries.iter() {
            if span.test(CpuId(cpu_id as u32)) || cpu_id >= MAX_CPUS {
                bail!("Found duplicate or out of range CPU ID {}", cpu_id);
            }
            span.set_cpu(cpu_id)?;

            let cpu = Cpu {
                id: CpuId(cpu_id as u32),
                core_id,
                package_id,
            };
            let package = packages.entry(package_id).or_insert_with(|| Package {
                id: package_id,
                cores: BTreeMap::new(),
                span: CpuSet::new(),
            });
            package.span.set_cpu(cpu_id)?;
            let core = package.cores.entry(core_id).or_insert_with(|| Core {
                id: core_id,
                cpus: BTreeMap::new(),
                span: CpuSet::new(),
            });
            core.span.set_cpu(cpu_id)?;
            core.cpus.insert(cpu.id, cpu.clone());
            cpus.insert(cpu.id, cpu);
        }

        let mut core_spans = vec![CpuSet::new(); MAX_CPUS];
        let mut package_spans = vec![CpuSet::new(); MAX_CPUS];
        for package in packages.values() {
            for core in package.cores.values() {
                for cpu in core.cpus.keys() {
                    core_spans[cpu.index()] = core.span;
                    package_spans[cpu.index()] = package.span;
                }
            }
        }

        Ok(Topology {
            packages,
            cpus,
            core_spans,
            package_spans,
            span,
        })
    }

    /// Build a uniform topology. CPU ids are assigned package-major, then
    /// core, then thread, so `threads` consecutive ids share a core.
    pub fn synthetic(packages: usize, cores: usize, threads: usize) -> Result<Topology> {
        if packages * cores * threads > MAX_CPUS {
            bail!(
                "{}x{}x{} CPUs exceeds the maximum of {}",
                packages,
                cores,
                threads,
                MAX_CPUS
            );
        }
        let mut entries = vec![];
        for p in 0..packages {
            for c in 0..cores {
                for t in 0..threads {
                    entries.push(((p * cores + c) * threads + t, c, p));
                }
            }
        }
        Self::from_entries(&entries)
    }

    /// One package of single-threaded cores.
    pub fn flat(nr_cpus: usize) -> Result<Topology> {
        Self::synthetic(1, nr_cpus, 1)
    }

    /// Build the Topology of the host from `<root>/devices/system/cpu`,
    /// normally with `root` set to "/sys".
    pub fn from_sysfs(root: &Path) -> Result<Topology> {
        let cpu_root = root.join("devices/system/cpu");
        let online = match std::fs::read_to_string(cpu_root.join("online")) {
            Ok(s) => read_cpulist(&s)?
                .into_iter()
                .filter(|&cpu| cpu < MAX_CPUS)
                .fold(CpuSet::new(), |mask, cpu| mask.with(CpuId(cpu as u32))),
            Err(_) => CpuSet::from_bits(u64::MAX),
        };

        let mut entries = vec![];
        let mut ignored = 0;
        let pattern = cpu_root.join("cpu[0-9]*");
        for cpu_path in glob(pattern.to_string_lossy().as_ref())?.filter_map(Result::ok) {
            let name = match cpu_path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let cpu_id = match sscanf!(name.as_str(), "cpu{usize}") {
                Ok(val) => val,
                Err(_) => {
                    bail!("Failed to parse cpu ID {}", name);
                }
            };
            if cpu_id >= MAX_CPUS {
                ignored += 1;
                continue;
            }
            if !online.test(CpuId(cpu_id as u32)) {
                continue;
            }

            let top_path = cpu_path.join("topology");
            let core_id = match read_file_usize(&top_path.join("core_id")) {
                Ok(v) => v,
                Err(e) => {
                    warn!("cpu{}: {:#}, treating it as its own core", cpu_id, e);
                    usize::MAX - cpu_id
                }
            };
            let package_id = read_file_usize(&top_path.join("physical_package_id")).unwrap_or(0);
            entries.push((cpu_id, core_id, package_id));
        }
        entries.sort();
        if ignored > 0 {
            warn!(
                "Ignoring {} CPUs beyond the supported maximum of {}",
                ignored, MAX_CPUS
            );
        }

        Self::from_entries(&entries)
    }

    pub fn packages(&self) -> &BTreeMap<usize, Package> {
        &self.packages
    }

    pub fn cpus(&self) -> &BTreeMap<CpuId, Cpu> {
        &self.cpus
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Get a CpuSet of all CPUs in the topology
    pub fn span(&self) -> CpuSet {
        self.span
    }

    /// The sibling set of `cpu` at `level`. A CPU the topology does not know
    /// about is only ever its own sibling.
    pub fn siblings(&self, cpu: CpuId, level: TopoLevel) -> CpuSet {
        let alone = CpuSet::from_cpu(cpu);
        if !self.span.test(cpu) {
            return alone;
        }
        match level {
            TopoLevel::Thread => alone,
            TopoLevel::Core => self.core_spans[cpu.index()],
            TopoLevel::Package => self.package_spans[cpu.index()],
        }
    }

    /// Other hardware threads of the core `cpu` belongs to.
    pub fn smt_siblings(&self, cpu: CpuId) -> CpuSet {
        self.siblings(cpu, TopoLevel::Core).without(cpu)
    }

    /// 0 for the same CPU, 1 for SMT siblings, 2 for the same package and 3
    /// otherwise.
    pub fn distance(&self, a: CpuId, b: CpuId) -> u32 {
        if a == b {
            0
        } else if self.siblings(a, TopoLevel::Core).test(b) {
            1
        } else if self.siblings(a, TopoLevel::Package).test(b) {
            2
        } else {
            3
        }
    }
}

fn read_file_usize(path: &Path) -> Result<usize> {
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };

    match val.trim().parse::<usize>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse {}", val);
        }
    }
}
