// LEALT SIMULATED COLLABORATORS
// A SMALL SEEDED WORLD STANDING IN FOR THE HARDWARE: CPU CLUSTERS RUNNING
// PHASED WORKLOADS, A MEMORY CONTROLLER WITH A BUSY ACCUMULATOR, AN LLC
// REGION. THE GOVERNOR SEES IT ONLY THROUGH ITS COLLABORATOR TRAITS.
//
// PHASE         CPU UTIL   INST/MEM   MEMORY DEMAND (FRACTION OF TOP OPP)
// IDLE            30%        200          10%
// COMPUTE         90%        150          25%
// STREAMING       70%         80          80%
// LATENCY         95%         20          50%   (LLC ON TRIMS DEMAND 15%)
//
// TIME IS WHATEVER THE CALLER PASSES TO step(); THE CLI FEEDS WALL TIME,
// TESTS FEED FIXED INCREMENTS.

use std::sync::Arc;

use anyhow::{bail, Result};
use log::{debug, trace};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bridge::CpufreqNotifier;
use crate::config::Config;
use crate::engine::LoadStatus;
use crate::governor::DevfreqDevice;
use crate::llc::CacheAllocator;
use crate::node::{CoreCounts, HwMonitor};

const PHASE_MIN_US: u64 = 200_000;
const PHASE_MAX_US: u64 = 1_500_000;
const CPUFREQ_STEP_PCT: u64 = 5;    // SMALLER CLUSTER MOVES ARE NOT REPORTED

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Compute,
    Streaming,
    LatencyBound,
}

impl Phase {
    const ALL: [Phase; 4] = [Phase::Idle, Phase::Compute, Phase::Streaming, Phase::LatencyBound];

    // (CPU UTIL %, INST PER MEM ACCESS, MEMORY DEMAND %)
    fn profile(self) -> (u64, u64, u64) {
        match self {
            Phase::Idle => (30, 200, 10),
            Phase::Compute => (90, 150, 25),
            Phase::Streaming => (70, 80, 80),
            Phase::LatencyBound => (95, 20, 50),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Compute => "COMPUTE",
            Phase::Streaming => "STREAMING",
            Phase::LatencyBound => "LATENCY",
        }
    }
}

#[derive(Clone, Copy, Default)]
struct SimCore {
    id: u32,
    inst: u64,
    mem: u64,
}

struct Cluster {
    domain: Option<u32>,
    peak_freq: u64,
    freq: u64,
    reported_freq: u64,
    cores: Vec<SimCore>,
    latched: Vec<CoreCounts>,
    started: bool,
}

struct WorldState {
    rng: StdRng,
    phase: Phase,
    phase_left_us: u64,
    pinned: bool,
    top_opp: u64,
    mem_freq: u64,
    busy_us: u64,
    total_us: u64,
    clusters: Vec<Cluster>,
    llc_on: bool,
    llc_flips: u64,
    commits: u64,
    cpufreq: Option<CpufreqNotifier>,
}

impl WorldState {
    fn jitter(&mut self, value: u64, pct: u64) -> u64 {
        let lo = value * (100 - pct) / 100;
        let hi = value * (100 + pct) / 100;
        if lo >= hi {
            return value;
        }
        self.rng.gen_range(lo..=hi)
    }

    fn next_phase(&mut self) {
        let idx = self.rng.gen_range(0..Phase::ALL.len());
        self.phase = Phase::ALL[idx];
        self.phase_left_us = self.rng.gen_range(PHASE_MIN_US..=PHASE_MAX_US);
        debug!("SIM: PHASE {} FOR {}MS", self.phase.label(), self.phase_left_us / 1000);
    }

    fn step(&mut self, dt_us: u64) {
        if dt_us == 0 {
            return;
        }
        if !self.pinned {
            if self.phase_left_us <= dt_us {
                self.next_phase();
            } else {
                self.phase_left_us -= dt_us;
            }
        }
        let (util, ratio, demand) = self.phase.profile();

        for i in 0..self.clusters.len() {
            let target = self.clusters[i].peak_freq * util / 100;
            let freq = self.jitter(target, 10).max(1);
            let ratio = self.jitter(ratio, 20).max(1);
            let cl = &mut self.clusters[i];
            cl.freq = freq;
            for core in cl.cores.iter_mut() {
                // KHZ * US / 1000 = CYCLES
                let inst = freq * dt_us / 1000 * util / 100;
                core.inst += inst;
                core.mem += inst / ratio;
            }
            let moved = cl.freq.abs_diff(cl.reported_freq) * 100 > cl.reported_freq * CPUFREQ_STEP_PCT;
            if moved {
                cl.reported_freq = cl.freq;
                if let (Some(domain), Some(tx)) = (cl.domain, self.cpufreq.as_ref()) {
                    tx.notify(domain, cl.freq);
                }
            }
        }

        let mut demand_khz = self.top_opp * demand / 100;
        if self.llc_on && self.phase == Phase::LatencyBound {
            demand_khz = demand_khz * 85 / 100;
        }
        let demand_khz = self.jitter(demand_khz, 10);
        let busy = if self.mem_freq == 0 {
            dt_us
        } else {
            (dt_us * demand_khz / self.mem_freq).min(dt_us)
        };
        self.busy_us += busy;
        self.total_us += dt_us;
    }
}

// HANDLE ON THE SHARED WORLD. CLONES SHARE STATE.
#[derive(Clone)]
pub struct SimWorld {
    state: Arc<Mutex<WorldState>>,
}

impl SimWorld {
    pub fn new(cfg: &Config, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let clusters = cfg
            .nodes
            .iter()
            .map(|n| {
                let domain = cfg
                    .domains
                    .iter()
                    .find(|d| d.node.as_deref() == Some(n.name.as_str()))
                    .map(|d| d.id);
                let peak = n.peak_core_freq().max(1_000_000);
                Cluster {
                    domain,
                    peak_freq: peak,
                    freq: 0,
                    reported_freq: 0,
                    cores: n.cores.iter().map(|&id| SimCore { id, ..SimCore::default() }).collect(),
                    latched: Vec::new(),
                    started: false,
                }
            })
            .collect();
        let top_opp = cfg.opp_table.last().copied().unwrap_or(0);
        let phase_left_us = rng.gen_range(PHASE_MIN_US..=PHASE_MAX_US);
        let state = WorldState {
            rng,
            phase: Phase::Idle,
            phase_left_us,
            pinned: false,
            top_opp,
            mem_freq: cfg.opp_table.first().copied().unwrap_or(0),
            busy_us: 0,
            total_us: 0,
            clusters,
            llc_on: false,
            llc_flips: 0,
            commits: 0,
            cpufreq: None,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn attach_cpufreq(&self, notifier: CpufreqNotifier) {
        self.state.lock().cpufreq = Some(notifier);
    }

    pub fn step(&self, dt_us: u64) {
        self.state.lock().step(dt_us);
    }

    // HOLD ONE PHASE UNTIL THE NEXT CALL (None RESUMES RANDOM PHASES)
    pub fn pin_phase(&self, phase: Option<Phase>) {
        let mut s = self.state.lock();
        match phase {
            Some(p) => {
                s.phase = p;
                s.pinned = true;
            }
            None => s.pinned = false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn mem_freq(&self) -> u64 {
        self.state.lock().mem_freq
    }

    pub fn llc_on(&self) -> bool {
        self.state.lock().llc_on
    }

    pub fn llc_flips(&self) -> u64 {
        self.state.lock().llc_flips
    }

    pub fn commits(&self) -> u64 {
        self.state.lock().commits
    }

    pub fn monitors_running(&self) -> usize {
        self.state.lock().clusters.iter().filter(|c| c.started).count()
    }

    pub fn device(&self, opp_table: Vec<u64>) -> SimDevice {
        SimDevice {
            world: self.state.clone(),
            opp_table,
        }
    }

    pub fn monitor(&self, cluster: usize) -> SimMonitor {
        SimMonitor {
            world: self.state.clone(),
            cluster,
            fail_start: false,
        }
    }

    // MONITOR WHOSE start() ALWAYS FAILS
    pub fn broken_monitor(&self, cluster: usize) -> SimMonitor {
        SimMonitor {
            fail_start: true,
            ..self.monitor(cluster)
        }
    }

    pub fn cache(&self) -> SimCache {
        SimCache {
            world: self.state.clone(),
        }
    }
}

pub struct SimDevice {
    world: Arc<Mutex<WorldState>>,
    opp_table: Vec<u64>,
}

impl DevfreqDevice for SimDevice {
    fn load_status(&mut self) -> LoadStatus {
        let mut s = self.world.lock();
        let status = LoadStatus {
            busy_time_us: s.busy_us,
            total_time_us: s.total_us,
            current_freq: s.mem_freq,
        };
        s.busy_us = 0;
        s.total_us = 0;
        status
    }

    fn opp_table(&self) -> &[u64] {
        &self.opp_table
    }

    fn commit(&mut self, freq: u64) {
        let mut s = self.world.lock();
        if s.mem_freq != freq {
            trace!("SIM: MEM {} -> {}", s.mem_freq, freq);
        }
        s.mem_freq = freq;
        s.commits += 1;
    }
}

pub struct SimMonitor {
    world: Arc<Mutex<WorldState>>,
    cluster: usize,
    fail_start: bool,
}

impl HwMonitor for SimMonitor {
    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            bail!("counter backend unavailable for cluster {}", self.cluster);
        }
        let mut s = self.world.lock();
        let Some(cl) = s.clusters.get_mut(self.cluster) else {
            bail!("no simulated cluster {}", self.cluster);
        };
        cl.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cl) = self.world.lock().clusters.get_mut(self.cluster) {
            cl.started = false;
            cl.latched.clear();
        }
    }

    // LATCH DELTAS SINCE THE PREVIOUS REFRESH
    fn refresh(&mut self) {
        let mut s = self.world.lock();
        let Some(cl) = s.clusters.get_mut(self.cluster) else {
            return;
        };
        if !cl.started {
            return;
        }
        let freq = cl.freq;
        cl.latched = cl
            .cores
            .iter_mut()
            .map(|c| {
                let counts = CoreCounts {
                    id: c.id,
                    inst_count: c.inst,
                    mem_count: c.mem,
                    freq,
                };
                c.inst = 0;
                c.mem = 0;
                counts
            })
            .collect();
    }

    fn get_counts(&mut self) -> Vec<CoreCounts> {
        let s = self.world.lock();
        match s.clusters.get(self.cluster) {
            Some(cl) if cl.started => cl.latched.clone(),
            _ => Vec::new(),
        }
    }
}

pub struct SimCache {
    world: Arc<Mutex<WorldState>>,
}

impl CacheAllocator for SimCache {
    fn set_region(&mut self, region: u32, enabled: bool, ways: u32) {
        let mut s = self.world.lock();
        trace!("SIM: LLC REGION {} enabled={} ways={}", region, enabled, ways);
        if s.llc_on != enabled {
            s.llc_flips += 1;
        }
        s.llc_on = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> (SimWorld, Config) {
        let cfg = Config::builtin().unwrap();
        (SimWorld::new(&cfg, 7), cfg)
    }

    #[test]
    fn device_reports_and_clears_load() {
        let (w, cfg) = world();
        w.pin_phase(Some(Phase::Streaming));
        let mut dev = w.device(cfg.opp_table.clone());
        w.step(10_000);
        let st = dev.load_status();
        assert_eq!(st.total_time_us, 10_000);
        assert!(st.busy_time_us <= st.total_time_us);
        assert_eq!(st.current_freq, 421_000);
        assert_eq!(dev.load_status().total_time_us, 0);
        dev.commit(3_172_000);
        assert_eq!(w.mem_freq(), 3_172_000);
    }

    #[test]
    fn monitor_counts_only_while_started() {
        let (w, _) = world();
        let mut m = w.monitor(1);
        w.step(10_000);
        m.refresh();
        assert!(m.get_counts().is_empty());

        m.start().unwrap();
        assert_eq!(w.monitors_running(), 1);
        w.step(10_000);
        m.refresh();
        let counts = m.get_counts();
        assert_eq!(counts.len(), 4);
        assert!(counts.iter().all(|c| c.inst_count > 0 && c.freq > 0));
        m.stop();
        assert!(m.get_counts().is_empty());
    }

    #[test]
    fn latency_phase_cores_are_latency_bound() {
        let (w, cfg) = world();
        w.pin_phase(Some(Phase::LatencyBound));
        let mut m = w.monitor(1);
        m.start().unwrap();
        w.step(20_000);
        m.refresh();
        let ceil = cfg.nodes[1].tunables().ratio_ceil;
        assert!(m.get_counts().iter().all(|c| c.is_latency_bound(ceil)));
    }

    #[test]
    fn broken_monitor_fails_start() {
        let (w, _) = world();
        assert!(w.broken_monitor(0).start().is_err());
        assert!(w.monitor(9).start().is_err());
    }

    #[test]
    fn cache_counts_flips() {
        let (w, _) = world();
        let mut c = w.cache();
        c.set_region(0, true, 16);
        c.set_region(0, true, 16);
        c.set_region(0, false, 0);
        assert_eq!(w.llc_flips(), 2);
        assert!(!w.llc_on());
    }
}
