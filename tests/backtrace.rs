// LEALT SAMPLE RING / BACKTRACE TESTS
// HOLD WINDOWS, RING CAPACITY, CACHE-STATE ORDINALS
//
// ALL TESTS USE PURE-RUST TYPES FROM lealt::sample. RUN OFFLINE.

use lealt::llc::CacheState;
use lealt::sample::SampleRing;
use lealt::tuning::SAMPLE_RING_SIZE;
use proptest::prelude::*;

fn push(ring: &mut SampleRing, duration_us: u64, next_freq: u64, next_llc: CacheState) {
    let s = ring.next_sample();
    s.duration_us = duration_us;
    s.next_freq = next_freq;
    s.next_llc = next_llc;
}

// REFERENCE: NEWEST FIRST, A SAMPLE COUNTS IF IT IS THE NEWEST OR THE TIME
// BEFORE IT HAS NOT PASSED THE HOLD
fn reference(samples: &[(u64, u64, CacheState)], hold_freq: u64, hold_llc: u64) -> (u64, CacheState) {
    let mut elapsed = 0u64;
    let mut freq = 0;
    let mut llc = CacheState::Off;
    for (i, &(dur, f, c)) in samples.iter().rev().take(SAMPLE_RING_SIZE).enumerate() {
        if i == 0 || elapsed <= hold_freq {
            freq = freq.max(f);
        }
        if i == 0 || elapsed <= hold_llc {
            llc = llc.max(c);
        }
        elapsed += dur;
    }
    (freq, llc)
}

// === HOLD WINDOW SCENARIOS ===

#[test]
fn rising_sequence_tracks_newest() {
    // 5 X 100US, NEXT_FREQ 100..500, HOLD 500
    let mut ring = SampleRing::new();
    for k in 1..=5u64 {
        push(&mut ring, 100, k * 100, CacheState::Off);
        assert_eq!(ring.backtrace(500, 500).0, k * 100);
    }
}

#[test]
fn falling_sequence_held_for_window() {
    let mut ring = SampleRing::new();
    for f in [500, 400, 300, 200, 100] {
        push(&mut ring, 100, f, CacheState::Off);
    }
    // ALL FIVE TOTAL EXACTLY 500: THE OLDEST (500) IS STILL INSIDE
    assert_eq!(ring.backtrace(500, 0).0, 500);
    // 250US: 100, 200 AND THE SAMPLE CROSSING THE LINE (300)
    assert_eq!(ring.backtrace(250, 0).0, 300);
    // 300US: THE FOURTH NEWEST STARTS EXACTLY AT 300, STILL INSIDE
    assert_eq!(ring.backtrace(300, 0).0, 400);
    // 299US: THE FOURTH NEWEST STARTS PAST THE HOLD
    assert_eq!(ring.backtrace(299, 0).0, 300);
    // ZERO HOLD: NEWEST ONLY
    assert_eq!(ring.backtrace(0, 0).0, 100);
}

#[test]
fn one_short_quiet_tick_does_not_drop() {
    let mut ring = SampleRing::new();
    for _ in 0..4 {
        push(&mut ring, 20_000, 1_539_000, CacheState::On);
    }
    push(&mut ring, 20_000, 421_000, CacheState::Off);
    assert_eq!(ring.backtrace(50_000, 100_000), (1_539_000, CacheState::On));
}

// === CAPACITY ===

#[test]
fn oldest_unreachable_after_capacity_plus_one() {
    let mut ring = SampleRing::new();
    push(&mut ring, 1, 9_999, CacheState::On);
    for _ in 0..SAMPLE_RING_SIZE {
        push(&mut ring, 1, 10, CacheState::Off);
    }
    assert_eq!(ring.backtrace(u64::MAX, u64::MAX), (10, CacheState::Off));
}

#[test]
fn walk_stops_after_one_lap() {
    let mut ring = SampleRing::new();
    for i in 0..SAMPLE_RING_SIZE as u64 {
        push(&mut ring, 0, i, CacheState::Off);
    }
    // ZERO DURATIONS NEVER SPEND THE WINDOW; EVERY SLOT COUNTS EXACTLY ONCE
    assert_eq!(ring.backtrace(1, 1).0, SAMPLE_RING_SIZE as u64 - 1);
    assert_eq!(ring.iter_recent().count(), SAMPLE_RING_SIZE);
}

#[test]
fn fresh_ring_reads_as_zero() {
    let ring = SampleRing::new();
    assert_eq!(ring.backtrace(u64::MAX, u64::MAX), (0, CacheState::Off));
}

// === CACHE-STATE ORDINALS ===

#[test]
fn cache_max_prefers_on_over_no_change() {
    let mut ring = SampleRing::new();
    push(&mut ring, 100, 0, CacheState::On);
    push(&mut ring, 100, 0, CacheState::NoChange);
    push(&mut ring, 100, 0, CacheState::Off);
    assert_eq!(ring.backtrace(0, 150).1, CacheState::NoChange);
    assert_eq!(ring.backtrace(0, 250).1, CacheState::On);
}

// === PROPERTIES ===

fn cache_state() -> impl Strategy<Value = CacheState> {
    prop_oneof![Just(CacheState::Off), Just(CacheState::NoChange), Just(CacheState::On)]
}

proptest! {
    #[test]
    fn backtrace_matches_window_max(
        samples in prop::collection::vec((0u64..2_000, 0u64..4_000_000, cache_state()), 1..40),
        hold_freq in 0u64..10_000,
        hold_llc in 0u64..10_000,
    ) {
        let mut ring = SampleRing::new();
        for &(d, f, c) in &samples {
            push(&mut ring, d, f, c);
        }
        prop_assert_eq!(ring.backtrace(hold_freq, hold_llc), reference(&samples, hold_freq, hold_llc));
    }

    #[test]
    fn backtrace_never_below_newest(
        samples in prop::collection::vec((0u64..2_000, 0u64..4_000_000), 1..40),
        hold in 0u64..10_000,
    ) {
        let mut ring = SampleRing::new();
        for &(d, f) in &samples {
            push(&mut ring, d, f, CacheState::Off);
        }
        let newest = samples[samples.len() - 1].1;
        prop_assert!(ring.backtrace(hold, hold).0 >= newest);
    }
}
