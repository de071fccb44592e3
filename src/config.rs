// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Construction-time configuration.
//!
//! A `Config` is plain JSON. It can be given inline or, with an `f:` or
//! `file:` prefix, as the path of a file holding it:
//!
//!```text
//!   {
//!     "topology": { "synthetic": { "packages": 1, "cores": 4, "threads": 2 } },
//!     "max_lwps": 256,
//!     "cache_coherent": true,
//!     "global_cpumask": "0xff",
//!     "tunables": { "smt": true, "queue_checks": 3 }
//!   }
//!```

use std::fs;
use std::io::Read;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::cpumask::CpuSet;
use crate::topology::Topology;
use crate::tunables::TunablesConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologySpec {
    /// A uniform machine, `packages x cores x threads`.
    Synthetic {
        packages: usize,
        cores: usize,
        threads: usize,
    },
    /// Read the host layout from sysfs mounted at `root`.
    Sysfs { root: PathBuf },
}

impl Default for TopologySpec {
    fn default() -> Self {
        TopologySpec::Synthetic {
            packages: 1,
            cores: 4,
            threads: 1,
        }
    }
}

impl TopologySpec {
    pub fn build(&self) -> Result<Topology> {
        match self {
            TopologySpec::Synthetic {
                packages,
                cores,
                threads,
            } => Topology::synthetic(*packages, *cores, *threads),
            TopologySpec::Sysfs { root } => Topology::from_sysfs(root),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub topology: TopologySpec,
    /// Maximum number of live entities.
    pub max_lwps: usize,
    /// Use the cache and SMT aware candidate selector.
    pub cache_coherent: bool,
    /// CPUs the scheduler may place entities on, as a hex mask. Defaults to
    /// every CPU of the topology.
    pub global_cpumask: Option<String>,
    pub tunables: TunablesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: TopologySpec::default(),
            max_lwps: 1024,
            cache_coherent: false,
            global_cpumask: None,
            tunables: TunablesConfig::default(),
        }
    }
}

impl Config {
    pub fn parse(input: &str) -> Result<Self> {
        read_json(input)
    }

    /// Resolve the global mask against `topo`. The result is never empty.
    pub fn global_mask(&self, topo: &Topology) -> Result<CpuSet> {
        let mask = match &self.global_cpumask {
            Some(s) => CpuSet::from_str(s)? & topo.span(),
            None => topo.span(),
        };
        if mask.is_empty() {
            bail!(
                "global_cpumask {:?} selects no CPU of {}",
                self.global_cpumask,
                topo.span()
            );
        }
        Ok(mask)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_lwps == 0 || self.max_lwps >= u32::MAX as usize {
            bail!("max_lwps must be in [1, {})", u32::MAX);
        }
        Ok(())
    }
}

/// Deserialize JSON given inline or, when prefixed with `f:` or `file:`,
/// from a file.
pub fn read_json<T: DeserializeOwned>(input: &str) -> Result<T> {
    let content = match input.split_once(':') {
        Some(("f", path)) | Some(("file", path)) => {
            let mut f = fs::OpenOptions::new()
                .read(true)
                .open(path)
                .with_context(|| format!("Failed to open config file {:?}", path))?;
            let mut content = String::new();
            f.read_to_string(&mut content)?;
            content
        }
        _ => input.to_string(),
    };
    serde_json::from_str(&content).context("Failed to parse config")
}
