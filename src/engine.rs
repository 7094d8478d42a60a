// LEALT DECISION ENGINE
// ONE CALL PER TICK. COUNTERS + LOCKS + TARGET LOAD -> TENTATIVE DECISION,
// HOLD-SMOOTHED THROUGH THE SAMPLE RING, THEN FLOORS AND CEILINGS:
//
//   SYSBUSY ABOVE BASELINE ......... FORCE MAX + LLC ON (SKIPS SAMPLING)
//   NOT A REAL SAMPLE .............. RETURN LAST COMMITTED FREQUENCY
//   NEXT = LOAD * FREQ / TARGET .... CLAMPED TO [BASE_MIN, BASE_MAX]
//   BACKTRACE ...................... MAX OVER THE HOLD WINDOWS
//   EFFICIENT FLOOR, MAX CEILING, LLC TRANSITION, LLC FLOOR, PREPARE FLOOR
//   OPP ............................ LOWEST OPERATING POINT AT/ABOVE, <= MAX
//
// NO ERROR PATH: EVERY MISSING INPUT DEGRADES TO A SAFE DEFAULT.

use log::debug;

use crate::llc::{CacheState, LlcControl};
use crate::node::Node;
use crate::sample::{SampleLog, SampleRing};
use crate::tuning::{EmsEntry, Tunables};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadStatus {
    pub busy_time_us: u64,
    pub total_time_us: u64,
    pub current_freq: u64,
}

pub struct TickInput<'a> {
    pub status: LoadStatus,
    pub sysbusy: u64,
    pub ems_mode: bool,
    pub real_sample: bool,
    pub prepare_freq: u64,
    pub opp_table: &'a [u64],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub ticks: u64,
    pub sampled_ticks: u64,
    pub forced_max_ticks: u64,
    pub freq_transitions: u64,
}

// --- PURE HELPERS ---

pub fn active_load(busy_us: u64, total_us: u64) -> u64 {
    if total_us == 0 {
        return 0;
    }
    (busy_us.min(total_us) * 100) / total_us
}

pub fn compute_next_freq(load: u64, freq: u64, target_load: u64, base_min: u64, base_max: u64) -> u64 {
    let raw = load * freq / target_load.max(1);
    raw.min(base_max).max(base_min)
}

pub fn next_cache_state(active_freq: u64, node_wants_llc: bool, on_th: u64, off_th: u64) -> CacheState {
    if active_freq > on_th || node_wants_llc {
        CacheState::On
    } else if active_freq < off_th {
        CacheState::Off
    } else {
        CacheState::NoChange
    }
}

// FIRST ROW AT/ABOVE THE OBSERVED FREQUENCY, CLAMPED TO THE LAST ROW
pub fn ems_lookup(table: &[EmsEntry], freq: u64) -> Option<&EmsEntry> {
    let last = table.last()?;
    Some(table.iter().find(|e| freq <= e.mem_freq).unwrap_or(last))
}

// LOWEST OPP AT/ABOVE FREQ THAT DOES NOT EXCEED MAX. WHEN NOTHING FITS,
// THE HIGHEST OPP UNDER MAX. MAX BELOW EVERY OPP: THE CEILING WINS, THE
// VALUE PASSES THROUGH UNTRANSLATED.
pub fn opp_ceil(opp: &[u64], freq: u64, max: u64) -> u64 {
    if let Some(&f) = opp.iter().find(|&&f| f >= freq && f <= max) {
        return f;
    }
    opp.iter()
        .copied()
        .filter(|&f| f <= max)
        .max()
        .unwrap_or(freq.min(max))
}

// --- ENGINE ---

pub struct DecisionEngine {
    ring: SampleRing,
    log: SampleLog,
    llc: LlcControl,
    last_freq: u64,
    first_tick: bool,
    stats: EngineStats,
}

impl DecisionEngine {
    pub fn new(llc: LlcControl) -> Self {
        Self {
            ring: SampleRing::new(),
            log: SampleLog::new(),
            llc,
            last_freq: 0,
            first_tick: true,
            stats: EngineStats::default(),
        }
    }

    // GOVERNOR START: NEXT CALL SAMPLES REGARDLESS OF WHO ASKED
    pub fn restart(&mut self) {
        self.first_tick = true;
    }

    // NOT A REAL SAMPLE AND NOTHING FORCES ONE: THE LAST DECISION STANDS.
    // CHECKED BEFORE THE DEVICE COUNTERS ARE READ SO THEY KEEP ACCRUING.
    pub fn holds_last(&self, forced: bool, real_sample: bool) -> bool {
        !forced && !self.first_tick && !real_sample
    }

    pub fn held_tick(&mut self) -> u64 {
        self.stats.ticks += 1;
        self.last_freq
    }

    pub fn get_target_frequency(
        &mut self,
        input: &TickInput<'_>,
        nodes: &mut [Node],
        tun: &Tunables,
    ) -> u64 {
        let forced = input.sysbusy > tun.sysbusy_baseline;
        if self.holds_last(forced, input.real_sample) {
            return self.held_tick();
        }
        self.stats.ticks += 1;
        let status = input.status;
        let load = active_load(status.busy_time_us, status.total_time_us);
        let active_freq = status.current_freq * load / 100;

        let mut target_load = 0;
        let mut base_min = 0;
        let mut base_max = tun.max_freq;
        let (next_freq, next_llc) = if forced {
            self.stats.forced_max_ticks += 1;
            (tun.max_freq, CacheState::On)
        } else {
            for node in nodes.iter_mut() {
                node.sample();
            }
            target_load = nodes
                .iter()
                .filter_map(|n| n.target_load())
                .min()
                .unwrap_or(tun.default_target_load);
            base_min = nodes.iter().map(|n| n.minlock()).max().unwrap_or(0);
            base_max = nodes
                .iter()
                .filter_map(|n| n.maxlock())
                .max()
                .unwrap_or(tun.max_freq);

            // EMS MODE OWNS THE CACHE; THE TABLE (IF ANY) OWNS LOAD + CEILING
            if input.ems_mode {
                if let Some(row) = ems_lookup(&tun.ems_table, status.current_freq) {
                    target_load = row.target_load;
                    base_max = row.maxlock;
                }
            }
            base_max = base_max.max(base_min);

            let next = compute_next_freq(load, status.current_freq, target_load, base_min, base_max);
            let llc = if input.ems_mode {
                CacheState::Off
            } else {
                let node_wants = nodes.iter().any(|n| n.wants_llc());
                next_cache_state(active_freq, node_wants, tun.llc_on_th, tun.llc_off_th)
            };
            (next, llc)
        };

        let sample = self.ring.next_sample();
        sample.duration_us = status.total_time_us;
        sample.freq = status.current_freq;
        sample.active_load = load;
        sample.target_load = target_load;
        sample.active_freq = active_freq;
        sample.base_minlock = base_min;
        sample.base_maxlock = base_max;
        sample.next_freq = next_freq;
        sample.next_llc = next_llc;
        let sample = *sample;

        let (mut freq, llc) = self.ring.backtrace(tun.hold_time_freq, tun.hold_time_llc);

        if active_freq >= tun.efficient_freq_th {
            freq = freq.max(tun.efficient_freq);
        }
        freq = freq.min(tun.max_freq);

        self.llc.apply(llc);
        if self.llc.is_on() {
            freq = freq.max(tun.llc_freq);
        }
        freq = freq.max(input.prepare_freq).min(tun.max_freq);

        let committed = opp_ceil(input.opp_table, freq, tun.max_freq);

        debug!(
            "TICK #{} load={}% freq={} act={} tgt={}% lock=[{},{}] next={}/{} -> hold={}/{} commit={}{}",
            sample.seq_no, load, status.current_freq, active_freq, target_load, base_min, base_max,
            next_freq, next_llc.label(), freq, llc.label(), committed,
            if forced { " [SYSBUSY]" } else { "" },
        );

        if committed != self.last_freq {
            self.stats.freq_transitions += 1;
        }
        self.stats.sampled_ticks += 1;
        self.log.record(sample, committed);
        self.last_freq = committed;
        self.first_tick = false;
        committed
    }

    pub fn release_llc(&mut self) {
        self.llc.release();
    }

    pub fn llc_state(&self) -> CacheState {
        self.llc.state()
    }

    pub fn llc_transitions(&self) -> u64 {
        self.llc.transitions()
    }

    pub fn last_freq(&self) -> u64 {
        self.last_freq
    }

    pub fn ring(&self) -> &SampleRing {
        &self.ring
    }

    pub fn log(&self) -> &SampleLog {
        &self.log
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_load_guards_zero_total() {
        assert_eq!(active_load(10, 0), 0);
        assert_eq!(active_load(50, 100), 50);
        assert_eq!(active_load(150, 100), 100);
    }

    #[test]
    fn next_freq_respects_locks() {
        assert_eq!(compute_next_freq(50, 1000, 80, 0, 10_000), 625);
        assert_eq!(compute_next_freq(50, 1000, 80, 700, 10_000), 700);
        assert_eq!(compute_next_freq(100, 1000, 10, 0, 4000), 4000);
        assert_eq!(compute_next_freq(100, 1000, 0, 0, u64::MAX), 100_000);
    }

    #[test]
    fn cache_state_thresholds() {
        assert_eq!(next_cache_state(1200, false, 1000, 500), CacheState::On);
        assert_eq!(next_cache_state(400, false, 1000, 500), CacheState::Off);
        assert_eq!(next_cache_state(700, false, 1000, 500), CacheState::NoChange);
        assert_eq!(next_cache_state(400, true, 1000, 500), CacheState::On);
    }

    #[test]
    fn opp_translation() {
        let opp = [421_000, 845_000, 1_539_000, 3_172_000];
        assert_eq!(opp_ceil(&opp, 0, 3_172_000), 421_000);
        assert_eq!(opp_ceil(&opp, 900_000, 3_172_000), 1_539_000);
        assert_eq!(opp_ceil(&opp, 1_539_000, 3_172_000), 1_539_000);
        assert_eq!(opp_ceil(&opp, 2_000_000, 2_000_000), 1_539_000);
        assert_eq!(opp_ceil(&opp, 2_000_000, 100_000), 100_000);
        assert_eq!(opp_ceil(&opp, 50_000, 100_000), 50_000);
        assert_eq!(opp_ceil(&[], 2_000, 1_000), 1_000);
    }

    #[test]
    fn ems_lookup_clamps() {
        let table = [
            EmsEntry { mem_freq: 1000, target_load: 90, maxlock: 1500 },
            EmsEntry { mem_freq: 2000, target_load: 70, maxlock: 2500 },
        ];
        assert_eq!(ems_lookup(&table, 500).map(|e| e.target_load), Some(90));
        assert_eq!(ems_lookup(&table, 1500).map(|e| e.target_load), Some(70));
        assert_eq!(ems_lookup(&table, 5000).map(|e| e.target_load), Some(70));
        assert!(ems_lookup(&[], 5000).is_none());
    }
}
