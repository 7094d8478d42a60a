// LEALT STABILITY TRACKER + PREPARE-HOLD
// PER CPU-FREQUENCY DOMAIN: ROLLING HIGH/LOW ENVELOPE AND A STABILITY SCORE.
//
// THE CPUFREQ NOTIFIER MAY FIRE FROM ANY THREAD AND MUST NOT BLOCK:
// IT ONLY PUSHES A FreqChange ONTO AN UNBOUNDED QUEUE. THE TIMER TICK AND
// THE DECISION TICK DRAIN THE QUEUE UNDER ONE SHORT CRITICAL SECTION.
// THE QUEUE IS GATED: WHILE THE GOVERNOR IS STOPPED NOTHING DRAINS IT,
// SO EVENTS ARE DROPPED AT THE SENDER.
//
// STABILITY = 100 - 100 * (HIGH - LOW) / HIGH, 100 WHEN HIGH == 0.
// ALERT: STABILITY <= DOMAIN THRESHOLD.   HOLD: GLOBAL PREPARE FREQ ROSE.
// EITHER ONE FORCES FAST RE-POLLING.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::tuning::DomainTunables;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreqChange {
    pub domain: u32,
    pub freq: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Verdict {
    pub alert: bool,
    pub hold: bool,
}

impl Verdict {
    pub fn needs_fast_poll(self) -> bool {
        self.alert || self.hold
    }

    fn merge(&mut self, other: Verdict) {
        self.alert |= other.alert;
        self.hold |= other.hold;
    }
}

pub fn compute_stability(high: u64, low: u64) -> u64 {
    if high == 0 {
        return 100;
    }
    let spread = high.saturating_sub(low) as u128;
    100 - (spread * 100 / high as u128) as u64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StabilityRecord {
    pub domain: u32,
    pub cur: u64,
    pub high: u64,
    pub low: u64,
    pub stability: u64,
    pub tunables: DomainTunables,
    seen: bool,
}

impl StabilityRecord {
    pub fn new(domain: u32, tunables: DomainTunables) -> Self {
        Self {
            domain,
            cur: 0,
            high: 0,
            low: 0,
            stability: 100,
            tunables,
            seen: false,
        }
    }

    // FIRST OBSERVATION SEEDS THE ENVELOPE. HIGH >= CUR >= LOW AFTERWARDS.
    pub fn update(&mut self, freq: u64) {
        self.cur = freq;
        if self.seen {
            self.high = self.high.max(freq);
            self.low = self.low.min(freq);
        } else {
            self.high = freq;
            self.low = freq;
            self.seen = true;
        }
        self.stability = compute_stability(self.high, self.low);
    }

    pub fn reset(&mut self) {
        self.high = self.cur;
        self.low = self.cur;
        self.stability = 100;
    }

    pub fn is_alert(&self) -> bool {
        self.stability <= self.tunables.stability_th
    }

    fn prepare_request(&self) -> u64 {
        if self.seen && self.cur >= self.tunables.prepare_cond {
            self.tunables.prepare_freq
        } else {
            0
        }
    }
}

#[derive(Debug, Default)]
pub struct StabilityState {
    records: Vec<StabilityRecord>,
    prepare_freq: u64,
}

impl StabilityState {
    pub fn new(domains: impl IntoIterator<Item = (u32, DomainTunables)>) -> Self {
        Self {
            records: domains
                .into_iter()
                .map(|(id, t)| StabilityRecord::new(id, t))
                .collect(),
            prepare_freq: 0,
        }
    }

    // UNREGISTERED DOMAINS ARE IGNORED, NOT AN ERROR
    pub fn apply(&mut self, ev: FreqChange) -> Verdict {
        let Some(rec) = self.records.iter_mut().find(|r| r.domain == ev.domain) else {
            trace!("CPUFREQ: IGNORING UNREGISTERED DOMAIN {}", ev.domain);
            return Verdict::default();
        };
        rec.update(ev.freq);
        let alert = rec.is_alert();
        let stability = rec.stability;

        let prev = self.prepare_freq;
        self.prepare_freq = self.records.iter().map(|r| r.prepare_request()).max().unwrap_or(0);
        let hold = self.prepare_freq > prev;

        if alert || hold {
            debug!(
                "CPUFREQ: DOMAIN {} FREQ {} STABILITY {}% PREPARE {} -> {}{}{}",
                ev.domain, ev.freq, stability, prev, self.prepare_freq,
                if alert { " [ALERT]" } else { "" },
                if hold { " [HOLD]" } else { "" },
            );
        }
        Verdict { alert, hold }
    }

    pub fn reset_all(&mut self) {
        for r in &mut self.records {
            r.reset();
        }
    }

    pub fn prepare_freq(&self) -> u64 {
        self.prepare_freq
    }

    pub fn record(&self, domain: u32) -> Option<&StabilityRecord> {
        self.records.iter().find(|r| r.domain == domain)
    }

    pub fn record_mut(&mut self, domain: u32) -> Option<&mut StabilityRecord> {
        self.records.iter_mut().find(|r| r.domain == domain)
    }

    pub fn records(&self) -> &[StabilityRecord] {
        &self.records
    }
}

// PRODUCER SIDE FOR THE CPUFREQ BRIDGE
#[derive(Clone)]
pub struct FreqChangeSender {
    tx: Sender<FreqChange>,
    open: Arc<AtomicBool>,
}

impl FreqChangeSender {
    // FALSE WHEN THE EVENT WAS DROPPED (GATE CLOSED OR TRACKER GONE)
    pub fn send(&self, ev: FreqChange) -> bool {
        self.open.load(Ordering::Acquire) && self.tx.send(ev).is_ok()
    }
}

pub struct StabilityTracker {
    state: Mutex<StabilityState>,
    tx: Sender<FreqChange>,
    rx: Receiver<FreqChange>,
    open: Arc<AtomicBool>,
}

impl StabilityTracker {
    // STARTS CLOSED
    pub fn new(domains: impl IntoIterator<Item = (u32, DomainTunables)>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            state: Mutex::new(StabilityState::new(domains)),
            tx,
            rx,
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sender(&self) -> FreqChangeSender {
        FreqChangeSender {
            tx: self.tx.clone(),
            open: Arc::clone(&self.open),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    // CLOSE THE GATE AND DISCARD WHATEVER IS STILL QUEUED
    pub fn close(&self) -> usize {
        self.open.store(false, Ordering::Release);
        let dropped = self.rx.try_iter().count();
        if dropped > 0 {
            debug!("CPUFREQ: DISCARDED {} QUEUED EVENTS", dropped);
        }
        dropped
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    // APPLY EVERYTHING QUEUED SO FAR. VERDICT IS THE UNION OVER ALL EVENTS.
    pub fn drain(&self) -> Verdict {
        let mut verdict = Verdict::default();
        if self.rx.is_empty() {
            return verdict;
        }
        let mut state = self.state.lock();
        for ev in self.rx.try_iter() {
            verdict.merge(state.apply(ev));
        }
        verdict
    }

    pub fn reset(&self) {
        self.state.lock().reset_all();
    }

    pub fn prepare_freq(&self) -> u64 {
        self.state.lock().prepare_freq()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut StabilityState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(prepare_cond: u64, prepare_freq: u64, stability_th: u64) -> DomainTunables {
        DomainTunables { prepare_cond, prepare_freq, stability_th }
    }

    #[test]
    fn stability_zero_high_is_stable() {
        assert_eq!(compute_stability(0, 0), 100);
    }

    #[test]
    fn stability_in_range() {
        assert_eq!(compute_stability(1600, 800), 50);
        assert_eq!(compute_stability(1600, 0), 0);
        assert_eq!(compute_stability(1600, 1600), 100);
    }

    #[test]
    fn first_update_seeds_envelope() {
        let mut r = StabilityRecord::new(0, DomainTunables::default());
        r.update(800);
        assert_eq!((r.cur, r.high, r.low, r.stability), (800, 800, 800, 100));
    }

    #[test]
    fn reset_collapses_to_current() {
        let mut r = StabilityRecord::new(0, DomainTunables::default());
        r.update(800);
        r.update(1600);
        r.update(1200);
        assert!(r.high >= r.cur && r.cur >= r.low);
        r.reset();
        assert_eq!((r.high, r.low, r.stability), (1200, 1200, 100));
    }

    #[test]
    fn unregistered_domain_ignored() {
        let mut s = StabilityState::new([(0, domain(0, 900, 60))]);
        assert_eq!(s.apply(FreqChange { domain: 7, freq: 2000 }), Verdict::default());
        assert_eq!(s.prepare_freq(), 0);
    }

    #[test]
    fn prepare_only_holds_on_increase() {
        let mut s = StabilityState::new([
            (0, domain(1000, 900, 0)),
            (4, domain(2000, 1200, 0)),
        ]);
        assert!(s.apply(FreqChange { domain: 0, freq: 1000 }).hold);
        assert_eq!(s.prepare_freq(), 900);
        // SAME VALUE AGAIN: NO HOLD
        assert!(!s.apply(FreqChange { domain: 0, freq: 1100 }).hold);
        assert!(s.apply(FreqChange { domain: 4, freq: 2100 }).hold);
        assert_eq!(s.prepare_freq(), 1200);
        // DROPS ARE RECOMPUTED BUT NEVER HOLD
        assert!(!s.apply(FreqChange { domain: 4, freq: 500 }).hold);
        assert_eq!(s.prepare_freq(), 900);
    }

    #[test]
    fn tracker_drain_merges_verdicts() {
        let t = StabilityTracker::new([(0, domain(u64::MAX, 0, 60))]);
        t.open();
        let tx = t.sender();
        assert!(tx.send(FreqChange { domain: 0, freq: 800 }));
        assert!(tx.send(FreqChange { domain: 0, freq: 1600 }));
        assert!(tx.send(FreqChange { domain: 0, freq: 1600 }));
        let v = t.drain();
        assert!(v.alert);
        assert!(!v.hold);
        assert_eq!(t.drain(), Verdict::default()); // QUEUE EMPTY
    }

    #[test]
    fn closed_tracker_drops_events() {
        let t = StabilityTracker::new([(0, DomainTunables::default())]);
        let tx = t.sender();
        assert!(!tx.send(FreqChange { domain: 0, freq: 800 }));
        assert_eq!(t.pending(), 0);

        t.open();
        assert!(tx.send(FreqChange { domain: 0, freq: 800 }));
        assert!(tx.send(FreqChange { domain: 0, freq: 900 }));
        assert_eq!(t.close(), 2);
        assert_eq!(t.pending(), 0);
        assert!(!tx.send(FreqChange { domain: 0, freq: 1000 }));
        assert_eq!(t.pending(), 0);
    }
}
