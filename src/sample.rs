// LEALT SAMPLE RING
// ONE SAMPLE PER GOVERNOR TICK: MEASUREMENT + DECISION.
// FIXED-CAPACITY RING, OVERWRITTEN IN PLACE. NO ALLOCATION AFTER CONSTRUCTION.
// SINGLE WRITER (THE WORK ITEM), READ BACK SYNCHRONOUSLY IN THE SAME TICK.
//
// BACKTRACE WALKS NEWEST -> OLDEST AND TAKES THE MAX DECISION OVER A HOLD
// WINDOW, SO ONE SHORT QUIET TICK CANNOT DROP THE FREQUENCY ON ITS OWN.

use crate::llc::CacheState;
use crate::tuning::SAMPLE_RING_SIZE;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    pub seq_no: u32,
    pub duration_us: u64,
    pub freq: u64,
    pub active_load: u64,
    pub target_load: u64,
    pub active_freq: u64,
    pub base_minlock: u64,
    pub base_maxlock: u64,
    pub next_freq: u64,
    pub next_llc: CacheState,
}

pub struct SampleRing {
    samples: [Sample; SAMPLE_RING_SIZE],
    cursor: usize,
    seq: u32,
}

impl SampleRing {
    pub fn new() -> Self {
        Self {
            samples: [Sample::default(); SAMPLE_RING_SIZE],
            cursor: 0,
            seq: 0,
        }
    }

    // ZEROED SLOT AT THE CURSOR, CURSOR ADVANCES. SEQUENCE WRAPS.
    pub fn next_sample(&mut self) -> &mut Sample {
        let slot = self.cursor;
        self.samples[slot] = Sample {
            seq_no: self.seq,
            ..Sample::default()
        };
        self.seq = self.seq.wrapping_add(1);
        self.cursor = (self.cursor + 1) % SAMPLE_RING_SIZE;
        &mut self.samples[slot]
    }

    pub fn latest(&self) -> &Sample {
        &self.samples[(self.cursor + SAMPLE_RING_SIZE - 1) % SAMPLE_RING_SIZE]
    }

    // NEWEST FIRST, AT MOST ONE FULL LAP
    pub fn iter_recent(&self) -> impl Iterator<Item = &Sample> {
        (0..SAMPLE_RING_SIZE).map(move |i| {
            &self.samples[(self.cursor + 2 * SAMPLE_RING_SIZE - 1 - i) % SAMPLE_RING_SIZE]
        })
    }

    // A SAMPLE IS INSIDE A WINDOW IF THE TIME ELAPSED BEFORE IT (NEWER SAMPLES
    // ONLY) HAS NOT YET PASSED THE HOLD TIME. THE SAMPLE THAT CROSSES THE LINE
    // COUNTS; THE NEWEST SAMPLE ALWAYS COUNTS. WALK ENDS WHEN BOTH WINDOWS ARE
    // EXCEEDED OR AFTER ONE LAP.
    pub fn backtrace(&self, hold_time_freq: u64, hold_time_llc: u64) -> (u64, CacheState) {
        let mut elapsed = 0u64;
        let mut freq = 0u64;
        let mut llc = CacheState::Off;

        for (i, s) in self.iter_recent().enumerate() {
            if i == 0 || elapsed <= hold_time_freq {
                freq = freq.max(s.next_freq);
            }
            if i == 0 || elapsed <= hold_time_llc {
                llc = llc.max(s.next_llc);
            }
            elapsed = elapsed.saturating_add(s.duration_us);
            if elapsed > hold_time_freq && elapsed > hold_time_llc {
                break;
            }
        }

        (freq, llc)
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new()
    }
}

// --- SAMPLE LOG ---
// LONG-LIVED TRACE OF EVERY TICK FOR DUMP/SUMMARY AFTER A RUN.
// PRE-ALLOCATED; OLDEST ENTRIES OVERWRITTEN AT CAPACITY.

const MAX_TRACE: usize = 4096;

#[derive(Clone, Copy, Default)]
pub struct TraceEntry {
    pub ts_ns: u64,
    pub sample: Sample,
    pub committed: u64,
}

pub struct SampleLog {
    entries: Vec<TraceEntry>,
    head: usize,
    len: usize,
}

impl SampleLog {
    pub fn new() -> Self {
        Self {
            entries: vec![TraceEntry::default(); MAX_TRACE],
            head: 0,
            len: 0,
        }
    }

    pub fn record(&mut self, sample: Sample, committed: u64) {
        self.entries[self.head] = TraceEntry {
            ts_ns: now_ns(),
            sample,
            committed,
        };
        self.head = (self.head + 1) % MAX_TRACE;
        if self.len < MAX_TRACE {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter_chronological(&self) -> impl Iterator<Item = &TraceEntry> {
        let start = if self.len < MAX_TRACE { 0 } else { self.head };
        (0..self.len).map(move |i| &self.entries[(start + i) % MAX_TRACE])
    }

    pub fn dump(&self) {
        let mut iter = self.iter_chronological();
        let Some(first) = iter.next() else {
            return;
        };
        let base_ts = first.ts_ns;

        println!(
            "\n{:<9} {:<7} {:<9} {:<6} {:<6} {:<9} {:<9} {:<9} {:<9} {:<5} {:<9}",
            "TIME_S", "SEQ", "FREQ", "LOAD%", "TGT%", "ACT_FREQ", "MINLOCK", "MAXLOCK",
            "NEXT", "LLC", "COMMIT"
        );
        println!("{}", "-".repeat(100));

        for e in std::iter::once(first).chain(iter) {
            let s = &e.sample;
            let elapsed_s = (e.ts_ns - base_ts) as f64 / 1_000_000_000.0;
            println!(
                "{:<9.3} {:<7} {:<9} {:<6} {:<6} {:<9} {:<9} {:<9} {:<9} {:<5} {:<9}",
                elapsed_s, s.seq_no, s.freq, s.active_load, s.target_load, s.active_freq,
                s.base_minlock, s.base_maxlock, s.next_freq, s.next_llc.label(), e.committed,
            );
        }

        if self.len == MAX_TRACE {
            println!("\n(TRACE WRAPPED -- SHOWING MOST RECENT {} TICKS)", MAX_TRACE);
        }
        println!("TOTAL TICKS: {}", self.len);
    }

    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }
        let entries: Vec<&TraceEntry> = self.iter_chronological().collect();

        let total: u64 = entries.iter().map(|e| e.committed).sum();
        let peak = entries.iter().map(|e| e.committed).max().unwrap_or(0);
        let llc_on = entries.iter().filter(|e| e.sample.next_llc == CacheState::On).count();
        let transitions = entries.windows(2).filter(|w| w[0].committed != w[1].committed).count();
        let elapsed_ns = entries[entries.len() - 1].ts_ns - entries[0].ts_ns;

        println!("\n{}", "=".repeat(50));
        println!("LEALT SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  TICKS:             {}", self.len);
        println!("  AVG COMMIT KHZ:    {}", total / self.len as u64);
        println!("  PEAK COMMIT KHZ:   {}", peak);
        println!("  FREQ TRANSITIONS:  {}", transitions);
        println!("  LLC ON DECISIONS:  {:.1}%", llc_on as f64 / self.len as f64 * 100.0);
        println!("  ELAPSED:           {:.1}s", elapsed_ns as f64 / 1_000_000_000.0);
    }
}

impl Default for SampleLog {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(ring: &mut SampleRing, duration_us: u64, next_freq: u64, next_llc: CacheState) {
        let s = ring.next_sample();
        s.duration_us = duration_us;
        s.next_freq = next_freq;
        s.next_llc = next_llc;
    }

    #[test]
    fn next_sample_is_zeroed_and_advances() {
        let mut ring = SampleRing::new();
        push(&mut ring, 100, 500, CacheState::On);
        for _ in 1..SAMPLE_RING_SIZE {
            push(&mut ring, 1, 1, CacheState::Off);
        }
        assert_eq!(ring.cursor, 0); // FULL LAP

        let s = ring.next_sample();
        assert_eq!(s.next_freq, 0);
        assert_eq!(s.duration_us, 0);
        assert_eq!(s.next_llc, CacheState::Off);
        assert_eq!(s.seq_no, SAMPLE_RING_SIZE as u32);
        assert_eq!(ring.cursor, 1);
    }

    #[test]
    fn sequence_wraps() {
        let mut ring = SampleRing::new();
        ring.seq = u32::MAX;
        assert_eq!(ring.next_sample().seq_no, u32::MAX);
        assert_eq!(ring.next_sample().seq_no, 0);
    }

    #[test]
    fn newest_sample_always_counts() {
        let mut ring = SampleRing::new();
        push(&mut ring, 1_000, 700, CacheState::NoChange);
        assert_eq!(ring.backtrace(0, 0), (700, CacheState::NoChange));
    }

    #[test]
    fn windows_are_independent() {
        let mut ring = SampleRing::new();
        push(&mut ring, 100, 900, CacheState::On);   // OLDEST
        push(&mut ring, 100, 100, CacheState::Off);
        push(&mut ring, 100, 100, CacheState::Off);  // NEWEST
        // FREQ WINDOW 150US: NEWEST TWO. LLC WINDOW 250US: ALL THREE.
        assert_eq!(ring.backtrace(150, 250), (100, CacheState::On));
        assert_eq!(ring.backtrace(250, 150), (900, CacheState::Off));
    }

    #[test]
    fn sample_starting_on_the_hold_boundary_counts() {
        let mut ring = SampleRing::new();
        push(&mut ring, 100, 900, CacheState::On);   // STARTS 200US BACK
        push(&mut ring, 100, 100, CacheState::Off);
        push(&mut ring, 100, 100, CacheState::Off);
        assert_eq!(ring.backtrace(200, 200), (900, CacheState::On));
        assert_eq!(ring.backtrace(199, 199), (100, CacheState::Off));
    }

    #[test]
    fn iter_recent_is_newest_first() {
        let mut ring = SampleRing::new();
        for f in 1..=3 {
            push(&mut ring, 1, f, CacheState::Off);
        }
        let order: Vec<u64> = ring.iter_recent().take(3).map(|s| s.next_freq).collect();
        assert_eq!(order, vec![3, 2, 1]);
        assert_eq!(ring.latest().next_freq, 3);
    }

    #[test]
    fn log_wraps() {
        let mut log = SampleLog::new();
        for i in 0..MAX_TRACE {
            log.record(Sample::default(), i as u64);
        }
        assert_eq!(log.head, 0);
        log.record(Sample::default(), 9999);
        assert_eq!(log.len(), MAX_TRACE);
        let ordered: Vec<u64> = log.iter_chronological().map(|e| e.committed).collect();
        assert_eq!(ordered[0], 1);
        assert_eq!(*ordered.last().unwrap(), 9999);
    }

    #[test]
    fn summary_and_dump_no_panic() {
        let mut log = SampleLog::new();
        log.summary();
        log.dump();
        log.record(Sample::default(), 100);
        log.record(Sample { next_llc: CacheState::On, ..Sample::default() }, 200);
        log.summary();
        log.dump();
    }
}
