// LEALT SCHEDULING CORE
// ONE REPEATING TIMER THREAD + ONE WORK THREAD. THE TIMER NEVER DECIDES
// ANYTHING: IT ONLY QUEUES THE SINGLE WORK ITEM WHEN THE POLL DEADLINE PASSES.
//
// TIMER: EVERY 10MS. IF STARTED AND NOW >= EXPIRES: QUEUE WORK, EXPIRES =
//        NOW + POLLING_MS, THEN DOUBLE POLLING_MS (CAPPED). CALM PERIODS
//        BACK OFF GEOMETRICALLY; A STABILITY ALERT, PREPARE-HOLD OR RESUME
//        SNAPS POLLING_MS BACK TO THE FLOOR AND PULLS THE DEADLINE IN.
//
// WORK:  BLOCKS ON A BOUNDED(1) CHANNEL. A FULL CHANNEL MEANS THE ITEM IS
//        ALREADY PENDING, SO QUEUEING TWICE COLLAPSES INTO ONE RUN.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, trace, warn};

use crate::governor::GovernorContext;
use crate::tuning::TIMER_PERIOD_MS;

// --- POLL STATE (GUARDED BY THE CONTEXT'S POLL LOCK) ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollState {
    started: bool,
    polling_ms: u64,
    expires: Instant,
}

impl PollState {
    pub fn new(now: Instant, polling_ms_min: u64) -> Self {
        Self {
            started: false,
            polling_ms: polling_ms_min,
            expires: now,
        }
    }

    // FIRST TICK AFTER START/RESUME REACTS IMMEDIATELY
    pub fn start(&mut self, now: Instant, polling_ms_min: u64) {
        self.started = true;
        self.polling_ms = polling_ms_min;
        self.expires = now;
    }

    pub fn stop(&mut self) {
        self.started = false;
    }

    // TIMER BODY. TRUE MEANS "QUEUE THE WORK ITEM NOW".
    pub fn on_timer(&mut self, now: Instant, polling_ms_max: u64) -> bool {
        if !self.started || now < self.expires {
            return false;
        }
        self.expires = now + Duration::from_millis(self.polling_ms);
        self.polling_ms = (self.polling_ms * 2).min(polling_ms_max.max(1));
        true
    }

    // FAST PATH: FLOOR THE INTERVAL, PULL THE DEADLINE IN IF THAT IS EARLIER.
    // TRUE IF THE DEADLINE MOVED. NO-OP WHILE STOPPED: start() RE-ARMS.
    pub fn accelerate(&mut self, now: Instant, polling_ms_min: u64) -> bool {
        if !self.started {
            return false;
        }
        self.polling_ms = polling_ms_min;
        let deadline = now + Duration::from_millis(polling_ms_min);
        if deadline < self.expires {
            self.expires = deadline;
            return true;
        }
        false
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn polling_ms(&self) -> u64 {
        self.polling_ms
    }

    pub fn expires(&self) -> Instant {
        self.expires
    }
}

// --- WORK QUEUE ---

pub struct WorkQueue {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    // FALSE IF THE ITEM WAS ALREADY PENDING
    pub fn queue(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Disconnected(())) => false,
        }
    }

    pub fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }

    pub fn is_pending(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

// --- THREADS ---

pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(ctx: Arc<GovernorContext>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            let rx = ctx.work_receiver();
            std::thread::Builder::new()
                .name("lealt-work".into())
                .spawn(move || work_thread(ctx, rx, shutdown))
                .context("spawning work thread")?
        };

        let timer = {
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("lealt-timer".into())
                .spawn(move || timer_thread(ctx, shutdown))
        };
        let timer = match timer {
            Ok(t) => t,
            Err(e) => {
                shutdown.store(true, Ordering::Relaxed);
                let _ = worker.join();
                return Err(e).context("spawning timer thread");
            }
        };

        Ok(Self {
            shutdown,
            timer: Some(timer),
            worker: Some(worker),
        })
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in [self.timer.take(), self.worker.take()].into_iter().flatten() {
            if handle.join().is_err() {
                warn!("SCHEDULER THREAD PANICKED");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// RE-ARMS EVERY 10MS REGARDLESS OF WHETHER WORK WAS QUEUED
fn timer_thread(ctx: Arc<GovernorContext>, shutdown: Arc<AtomicBool>) {
    let period = Duration::from_millis(TIMER_PERIOD_MS);
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(period);
        if ctx.timer_tick(Instant::now()) {
            trace!("TIMER: WORK QUEUED");
        }
    }
}

// POLLS SHUTDOWN EVERY 100MS WHILE IDLE
fn work_thread(ctx: Arc<GovernorContext>, rx: Receiver<()>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                ctx.run_work();
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("WORK QUEUE CLOSED");
                break;
            }
        }
    }
}
