// LEALT HWMON NODES
// ONE NODE PER HARDWARE-MONITOR SOURCE (TYPICALLY ONE CPU CLUSTER).
// EACH TICK A NODE PULLS PER-CORE COUNTERS, PICKS ITS FASTEST LATENCY-BOUND
// CORE, AND TURNS THAT INTO A TARGET LOAD AND BASE MIN/MAX LOCKS.
//
// A CORE IS LATENCY-BOUND WHEN IT RETIRES FEW INSTRUCTIONS PER MEMORY ACCESS:
// INST / MEM <= RATIO_CEIL. CORES WITH ZERO MEMORY ACCESSES NEVER QUALIFY.

use anyhow::{bail, Result};
use bitflags::bitflags;

use crate::tuning::NodeTunables;

bitflags! {
    // OPTIONAL BEHAVIORS A NODE OPTS INTO
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const MINLOCK   = 1 << 0;
        const MAXLOCK   = 1 << 1;
        const LLC_ON_TH = 1 << 2;
    }
}

impl Capabilities {
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut caps = Self::empty();
        for name in names {
            caps |= match name.as_ref() {
                "minlock" => Self::MINLOCK,
                "maxlock" => Self::MAXLOCK,
                "llc_on_th" => Self::LLC_ON_TH,
                other => bail!("unknown node capability `{}`", other),
            };
        }
        Ok(caps)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreCounts {
    pub id: u32,
    pub inst_count: u64,
    pub mem_count: u64,
    pub freq: u64,
}

impl CoreCounts {
    // INST / MEM <= CEIL, CROSS-MULTIPLIED SO NO FRACTION IS LOST
    pub fn is_latency_bound(&self, ratio_ceil: u64) -> bool {
        self.mem_count > 0
            && u128::from(self.inst_count) <= u128::from(ratio_ceil) * u128::from(self.mem_count)
    }
}

// HARDWARE-MONITOR COLLABORATOR
pub trait HwMonitor: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    // LATCH FRESH COUNTERS. CALLED BY THE WORK ITEM BEFORE THE DECISION.
    fn refresh(&mut self) {}
    fn get_counts(&mut self) -> Vec<CoreCounts>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreqMapEntry {
    pub core_freq: u64,
    pub target_load: u64,
}

// MONOTONIC CORE-FREQ -> TARGET-LOAD TABLE. FIRST ROW AT/ABOVE FREQ WINS;
// BELOW THE FIRST ROW OR PAST THE LAST ROW CLAMPS TO THAT ROW.
pub fn lookup_target_load(map: &[FreqMapEntry], freq: u64) -> Option<u64> {
    let last = map.last()?;
    Some(map.iter().find(|e| freq <= e.core_freq).unwrap_or(last).target_load)
}

// (FASTEST LATENCY-BOUND CORE FREQ, FASTEST CORE FREQ OVERALL)
pub fn classify_cores(counts: &[CoreCounts], ratio_ceil: u64) -> (Option<u64>, u64) {
    let lat = counts
        .iter()
        .filter(|c| c.is_latency_bound(ratio_ceil))
        .map(|c| c.freq)
        .max();
    let raw_max = counts.iter().map(|c| c.freq).max().unwrap_or(0);
    (lat, raw_max)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub caps: Capabilities,
    pub freq_map: Vec<FreqMapEntry>,
    pub tunables: NodeTunables,
    monitor: Box<dyn HwMonitor>,
    // PER-TICK, TOUCHED ONLY BY THE DECISION TICK
    pub raw_max_freq: u64,
    pub lat_freq: Option<u64>,
}

impl Node {
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        caps: Capabilities,
        freq_map: Vec<FreqMapEntry>,
        tunables: NodeTunables,
        monitor: Box<dyn HwMonitor>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            caps,
            freq_map,
            tunables,
            monitor,
            raw_max_freq: 0,
            lat_freq: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.monitor.start()
    }

    pub fn stop(&mut self) {
        self.monitor.stop();
    }

    pub fn refresh(&mut self) {
        self.monitor.refresh();
    }

    // PULL COUNTERS, RECOMPUTE TRANSIENT FIELDS
    pub fn sample(&mut self) {
        let counts = self.monitor.get_counts();
        let (lat, raw_max) = classify_cores(&counts, self.tunables.ratio_ceil);
        self.lat_freq = lat;
        self.raw_max_freq = raw_max;
    }

    // NO REPRESENTATIVE OR NO TABLE: NO CONSTRAINT
    pub fn target_load(&self) -> Option<u64> {
        self.lat_freq
            .and_then(|f| lookup_target_load(&self.freq_map, f))
    }

    pub fn minlock(&self) -> u64 {
        if self.caps.contains(Capabilities::MINLOCK) {
            self.raw_max_freq * self.tunables.minlock_ratio / 100
        } else {
            0
        }
    }

    // A NODE THAT SAW NO CORES THIS TICK MUST NOT PIN THE CEILING TO ZERO
    pub fn maxlock(&self) -> Option<u64> {
        (self.caps.contains(Capabilities::MAXLOCK) && self.raw_max_freq > 0)
            .then(|| self.raw_max_freq * self.tunables.maxlock_ratio / 100)
    }

    pub fn wants_llc(&self) -> bool {
        self.caps.contains(Capabilities::LLC_ON_TH)
            && self.lat_freq.is_some_and(|f| f >= self.tunables.llc_on_th)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<CoreCounts>);

    impl HwMonitor for Fixed {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn stop(&mut self) {}
        fn get_counts(&mut self) -> Vec<CoreCounts> {
            self.0.clone()
        }
    }

    fn core(id: u32, inst: u64, mem: u64, freq: u64) -> CoreCounts {
        CoreCounts { id, inst_count: inst, mem_count: mem, freq }
    }

    fn map() -> Vec<FreqMapEntry> {
        vec![
            FreqMapEntry { core_freq: 1_000_000, target_load: 90 },
            FreqMapEntry { core_freq: 2_000_000, target_load: 70 },
            FreqMapEntry { core_freq: 3_000_000, target_load: 50 },
        ]
    }

    #[test]
    fn lookup_clamps_to_bounds() {
        let m = map();
        assert_eq!(lookup_target_load(&m, 500_000), Some(90));
        assert_eq!(lookup_target_load(&m, 1_000_000), Some(90));
        assert_eq!(lookup_target_load(&m, 1_500_000), Some(70));
        assert_eq!(lookup_target_load(&m, 9_000_000), Some(50));
        assert_eq!(lookup_target_load(&[], 1_000_000), None);
    }

    #[test]
    fn zero_memory_access_is_not_latency_bound() {
        assert!(!core(0, 100, 0, 1).is_latency_bound(u64::MAX));
        assert!(core(0, 100, 10, 1).is_latency_bound(10));
        assert!(!core(0, 100, 10, 1).is_latency_bound(9));
    }

    #[test]
    fn fractional_ratio_is_not_truncated() {
        // 105 / 10 = 10.5: ABOVE A CEILING OF 10
        assert!(!core(0, 105, 10, 1).is_latency_bound(10));
        assert!(core(0, 105, 10, 1).is_latency_bound(11));
        assert!(core(0, u64::MAX, u64::MAX, 1).is_latency_bound(1));
    }

    #[test]
    fn representative_is_fastest_latency_bound_core() {
        let counts = [
            core(0, 1000, 100, 1_800_000), // RATIO 10: BOUND
            core(1, 1000, 10, 2_400_000),  // RATIO 100: COMPUTE
            core(2, 500, 100, 1_200_000),  // RATIO 5: BOUND
        ];
        assert_eq!(classify_cores(&counts, 20), (Some(1_800_000), 2_400_000));
        assert_eq!(classify_cores(&counts, 1), (None, 2_400_000));
    }

    #[test]
    fn locks_follow_capabilities() {
        let counts = vec![core(0, 10, 10, 2_000_000)];
        let tun = NodeTunables { minlock_ratio: 25, maxlock_ratio: 50, ..NodeTunables::default() };
        let mut n = Node::new(NodeId(0), "cl0", Capabilities::MINLOCK, map(), tun, Box::new(Fixed(counts)));
        n.sample();
        assert_eq!(n.minlock(), 500_000);
        assert_eq!(n.maxlock(), None);
        n.caps |= Capabilities::MAXLOCK;
        assert_eq!(n.maxlock(), Some(1_000_000));
        assert_eq!(n.target_load(), Some(70));
    }

    #[test]
    fn idle_node_contributes_nothing() {
        let mut n = Node::new(
            NodeId(1), "cl1", Capabilities::all(), map(), NodeTunables::default(), Box::new(Fixed(vec![])),
        );
        n.sample();
        assert_eq!(n.target_load(), None);
        assert_eq!(n.minlock(), 0);
        assert_eq!(n.maxlock(), None);
        assert!(!n.wants_llc());
    }

    #[test]
    fn capability_names() {
        let caps = Capabilities::from_names(&["minlock", "llc_on_th"]).unwrap();
        assert_eq!(caps, Capabilities::MINLOCK | Capabilities::LLC_ON_TH);
        assert!(Capabilities::from_names(&["turbo"]).is_err());
    }
}
