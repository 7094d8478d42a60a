// LEALT DEVICE CONFIGURATION
// START-TIME DESCRIPTION OF ONE GOVERNED DEVICE: OPERATING POINTS, GOVERNOR
// TUNABLES, HWMON NODES, CPU-FREQUENCY DOMAINS, EMS TABLE, LLC REGION.
// LOADED ONCE FROM TOML; EVERYTHING AFTER THAT GOES THROUGH THE REGISTRY.
//
// NUMERIC KNOBS ARE CLAMPED EXACTLY LIKE RUNTIME WRITES. STRUCTURAL MISTAKES
// (UNSORTED TABLES, UNKNOWN NAMES, DANGLING LINKS) ARE FATAL HERE SO THEY
// CAN NEVER SURFACE MID-OPERATION.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;

use crate::llc::{DEFAULT_LLC_REGION, DEFAULT_LLC_WAYS};
use crate::node::{Capabilities, FreqMapEntry};
use crate::tuning::{
    self, DomainTunables, EmsEntry, NodeTunables, Tunables, DOMAIN_FIELDS, GOVERNOR_FIELDS,
    NODE_FIELDS,
};

pub const BUILTIN_CONFIG: &str = r#"
# REFERENCE BOARD: 11 MEMORY OPPS, LITTLE + BIG CLUSTER
opp_table = [421000, 676000, 845000, 1014000, 1352000, 1539000,
             1716000, 2028000, 2288000, 2730000, 3172000]

[tunables]
polling_ms_min = 10
polling_ms_max = 320
max_freq = 3172000
hold_time_freq = 50000
hold_time_llc = 100000

[llc]
region = 0
ways = 16

[[node]]
name = "little"
cores = [0, 1, 2, 3]
ratio_ceil = 60
freq_map = [[1000000, 90], [1500000, 80], [2000000, 70]]

[[node]]
name = "big"
cores = [4, 5, 6, 7]
capabilities = ["minlock", "maxlock", "llc_on_th"]
ratio_ceil = 40
minlock_ratio = 20
maxlock_ratio = 100
llc_on_th = 2400000
freq_map = [[1200000, 80], [2000000, 60], [2800000, 40]]

[[domain]]
id = 0
node = "little"
stability_th = 60

[[domain]]
id = 4
node = "big"
prepare_cond = 2400000
prepare_freq = 1539000
stability_th = 60
"#;

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlcConfig {
    #[serde(default)]
    pub region: u32,
    #[serde(default = "default_ways")]
    pub ways: u32,
}

fn default_ways() -> u32 {
    DEFAULT_LLC_WAYS
}

impl Default for LlcConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_LLC_REGION,
            ways: DEFAULT_LLC_WAYS,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub cores: Vec<u32>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub freq_map: Vec<[u64; 2]>,
    pub ratio_ceil: Option<u64>,
    pub minlock_ratio: Option<u64>,
    pub maxlock_ratio: Option<u64>,
    pub llc_on_th: Option<u64>,
}

impl NodeConfig {
    pub fn capabilities(&self) -> Result<Capabilities> {
        Capabilities::from_names(&self.capabilities)
            .with_context(|| format!("node `{}`", self.name))
    }

    pub fn freq_map(&self) -> Vec<FreqMapEntry> {
        self.freq_map
            .iter()
            .map(|&[core_freq, target_load]| FreqMapEntry { core_freq, target_load })
            .collect()
    }

    pub fn tunables(&self) -> NodeTunables {
        let mut t = NodeTunables::default();
        let knobs = [
            ("ratio_ceil", self.ratio_ceil),
            ("minlock_ratio", self.minlock_ratio),
            ("maxlock_ratio", self.maxlock_ratio),
            ("llc_on_th", self.llc_on_th),
        ];
        for (name, value) in knobs {
            if let (Some(v), Ok(field)) = (value, tuning::lookup(NODE_FIELDS, name)) {
                field.write(&mut t, v);
            }
        }
        t
    }

    // HIGHEST CORE FREQUENCY THE TABLE DESCRIBES
    pub fn peak_core_freq(&self) -> u64 {
        self.freq_map.last().map(|r| r[0]).unwrap_or(0)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    pub id: u32,
    // HWMON NODE WHOSE CORES THIS DOMAIN CLOCKS (SIMULATION WIRING)
    pub node: Option<String>,
    pub prepare_cond: Option<u64>,
    pub prepare_freq: Option<u64>,
    pub stability_th: Option<u64>,
}

impl DomainConfig {
    pub fn tunables(&self) -> DomainTunables {
        let mut t = DomainTunables::default();
        let knobs = [
            ("prepare_cond", self.prepare_cond),
            ("prepare_freq", self.prepare_freq),
            ("stability_th", self.stability_th),
        ];
        for (name, value) in knobs {
            if let (Some(v), Ok(field)) = (value, tuning::lookup(DOMAIN_FIELDS, name)) {
                field.write(&mut t, v);
            }
        }
        t
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub opp_table: Vec<u64>,
    #[serde(default)]
    pub tunables: BTreeMap<String, u64>,
    #[serde(default)]
    pub ems_table: Vec<EmsEntry>,
    #[serde(default)]
    pub llc: LlcConfig,
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,
    #[serde(default, rename = "domain")]
    pub domains: Vec<DomainConfig>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(text).context("parsing device configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_CONFIG)
    }

    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Self::builtin(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.opp_table.is_empty(), "opp_table is empty");
        ensure!(
            self.opp_table.windows(2).all(|w| w[0] < w[1]),
            "opp_table must be strictly ascending"
        );
        ensure!(!self.nodes.is_empty(), "at least one [[node]] is required");

        let mut names = HashSet::new();
        for node in &self.nodes {
            ensure!(names.insert(node.name.as_str()), "duplicate node `{}`", node.name);
            node.capabilities()?;
            ensure!(
                node.freq_map.windows(2).all(|w| w[0][0] < w[1][0]),
                "node `{}`: freq_map core frequencies must be strictly ascending",
                node.name
            );
            for &[freq, load] in &node.freq_map {
                ensure!(
                    (1..=100).contains(&load),
                    "node `{}`: target load {} at {} kHz outside 1..=100",
                    node.name, load, freq
                );
            }
        }

        let mut ids = HashSet::new();
        for d in &self.domains {
            ensure!(ids.insert(d.id), "duplicate domain {}", d.id);
            if let Some(n) = &d.node {
                ensure!(names.contains(n.as_str()), "domain {} links unknown node `{}`", d.id, n);
            }
        }

        // ORDERING IS CHECKED ON THE CLAMPED VALUES
        let t = self.governor_tunables()?;
        ensure!(
            t.polling_ms_min <= t.polling_ms_max,
            "polling_ms_min ({}) exceeds polling_ms_max ({})",
            t.polling_ms_min, t.polling_ms_max
        );
        ensure!(
            t.llc_off_th <= t.llc_on_th,
            "llc_off_th ({}) exceeds llc_on_th ({})",
            t.llc_off_th, t.llc_on_th
        );
        Ok(())
    }

    // WRITES BYPASS THE PAIRED-BOUND NUDGING: A FILE STATES BOTH ENDS AT ONCE
    pub fn governor_tunables(&self) -> Result<Tunables> {
        let mut t = Tunables::default();
        for (name, &value) in &self.tunables {
            let Ok(field) = tuning::lookup(GOVERNOR_FIELDS, name) else {
                bail!("unknown tunable `{}` in [tunables]", name);
            };
            field.write(&mut t, value);
        }
        let mut ems: Vec<EmsEntry> = self
            .ems_table
            .iter()
            .map(|e| EmsEntry {
                mem_freq: e.mem_freq.min(tuning::FREQ_CEIL_KHZ),
                target_load: e.target_load.clamp(1, 100),
                maxlock: e.maxlock.min(tuning::FREQ_CEIL_KHZ),
            })
            .collect();
        ems.sort_by_key(|e| e.mem_freq);
        t.ems_table = ems;
        Ok(t)
    }

    pub fn domain_tunables(&self) -> Vec<(u32, DomainTunables)> {
        self.domains.iter().map(|d| (d.id, d.tunables())).collect()
    }
}
