// LEALT GOVERNOR CONTEXT
// ONE OBJECT OWNS EVERY PIECE OF MUTABLE GOVERNOR STATE. COMPONENTS RECEIVE
// IT EXPLICITLY; NOTHING LIVES IN GLOBALS.
//
// LOCK ORDER (OUTER -> INNER): DEVICE, ENGINE, NODES, TUNABLES, POLL, STABILITY.
// THE DEVICE LOCK IS THE FRAMEWORK'S UPDATE LOCK: HOLDING IT SERIALIZES
// DECISION TICKS, SO PER-TICK NODE FIELDS NEED NO FURTHER PROTECTION.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::engine::{DecisionEngine, EngineStats, LoadStatus, TickInput};
use crate::llc::{CacheState, LlcControl};
use crate::node::{Capabilities, FreqMapEntry, HwMonitor, Node, NodeId};
use crate::sample::SampleLog;
use crate::scheduler::{PollState, Scheduler, WorkQueue};
use crate::stability::{FreqChangeSender, StabilityRecord, StabilityTracker};
use crate::tuning::{
    self, parse_path, DomainTunables, NodeTunables, TunableError, TunablePath, Tunables,
};

// FREQUENCY-SCALING FRAMEWORK SIDE OF ONE DEVICE
pub trait DevfreqDevice: Send {
    // BUSY/TOTAL SINCE THE PREVIOUS CALL, PLUS THE CURRENT FREQUENCY
    fn load_status(&mut self) -> LoadStatus;
    // SUPPORTED OPERATING POINTS, ASCENDING
    fn opp_table(&self) -> &[u64];
    fn commit(&mut self, freq: u64);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GovernorStats {
    pub engine: EngineStats,
    pub llc_transitions: u64,
    pub llc_state: CacheState,
    pub accelerations: u64,
    pub work_runs: u64,
    pub last_freq: u64,
}

pub struct GovernorContext {
    device: Mutex<Box<dyn DevfreqDevice>>,
    engine: Mutex<DecisionEngine>,
    nodes: Mutex<Vec<Node>>,
    tunables: RwLock<Tunables>,
    poll: Mutex<PollState>,
    stability: StabilityTracker,
    work: WorkQueue,
    next_node_id: AtomicU32,
    sysbusy: AtomicU64,
    ems_mode: AtomicBool,
    real_sample: AtomicBool,
    active: AtomicBool,
    suspended: AtomicBool,
    accelerations: AtomicU64,
    work_runs: AtomicU64,
}

impl GovernorContext {
    pub fn new(
        device: Box<dyn DevfreqDevice>,
        llc: LlcControl,
        tunables: Tunables,
        domains: impl IntoIterator<Item = (u32, DomainTunables)>,
    ) -> Self {
        let poll = PollState::new(Instant::now(), tunables.polling_ms_min);
        Self {
            device: Mutex::new(device),
            engine: Mutex::new(DecisionEngine::new(llc)),
            nodes: Mutex::new(Vec::new()),
            tunables: RwLock::new(tunables),
            poll: Mutex::new(poll),
            stability: StabilityTracker::new(domains),
            work: WorkQueue::new(),
            next_node_id: AtomicU32::new(0),
            sysbusy: AtomicU64::new(0),
            ems_mode: AtomicBool::new(false),
            real_sample: AtomicBool::new(false),
            active: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            accelerations: AtomicU64::new(0),
            work_runs: AtomicU64::new(0),
        }
    }

    // --- NODE REGISTRY ---

    pub fn register_node(
        &self,
        name: impl Into<String>,
        caps: Capabilities,
        freq_map: Vec<FreqMapEntry>,
        tunables: NodeTunables,
        monitor: Box<dyn HwMonitor>,
    ) -> NodeId {
        let id = NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed));
        let node = Node::new(id, name, caps, freq_map, tunables, monitor);
        info!("NODE {} REGISTERED: {} caps={:?}", id.0, node.name, caps);
        self.nodes.lock().push(node);
        id
    }

    pub fn unregister_node(&self, id: NodeId) -> bool {
        let mut nodes = self.nodes.lock();
        let Some(pos) = nodes.iter().position(|n| n.id == id) else {
            return false;
        };
        let mut node = nodes.remove(pos);
        if self.active.load(Ordering::Relaxed) {
            node.stop();
        }
        info!("NODE {} UNREGISTERED: {}", id.0, node.name);
        true
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    // --- LIFECYCLE ---
    // start()/stop() ARM AND DISARM THE STATE; Governor ADDS THE THREADS.

    // FAILS WITHOUT SIDE EFFECTS: MONITORS STARTED BEFORE A FAILURE ARE STOPPED
    pub fn start(&self) -> Result<()> {
        {
            let dev = self.device.lock();
            if dev.opp_table().is_empty() {
                bail!("device exposes no operating points");
            }
        }
        let mut nodes = self.nodes.lock();
        if nodes.is_empty() {
            bail!("no hwmon nodes registered");
        }
        for i in 0..nodes.len() {
            if let Err(e) = nodes[i].start() {
                for started in nodes[..i].iter_mut() {
                    started.stop();
                }
                return Err(e).with_context(|| format!("starting hwmon node {}", nodes[i].name));
            }
        }
        drop(nodes);

        self.engine.lock().restart();
        self.stability.reset();
        self.stability.open();
        self.suspended.store(false, Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
        // ALREADY BUSY: NO POLLING, ONE FORCED-MAX TICK
        if self.is_sysbusy() {
            self.work.queue();
        } else {
            let min = self.tunables.read().polling_ms_min;
            self.poll.lock().start(Instant::now(), min);
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.poll.lock().stop();
        self.active.store(false, Ordering::Relaxed);
        self.stability.close();
        for node in self.nodes.lock().iter_mut() {
            node.stop();
        }
        let _dev = self.device.lock();
        self.engine.lock().release_llc();
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Relaxed);
        self.poll.lock().stop();
        info!("SUSPENDED");
    }

    // STABILITY CLEARED, INTERVAL FLOORED: FIRST TICK AFTER RESUME REACTS AT ONCE
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Relaxed);
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        self.stability.reset();
        if !self.is_sysbusy() {
            let min = self.tunables.read().polling_ms_min;
            self.poll.lock().start(Instant::now(), min);
        }
        info!("RESUMED");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    // --- SCHEDULING CORE HOOKS ---

    fn drain_freq_changes(&self, now: Instant) {
        let verdict = self.stability.drain();
        if verdict.needs_fast_poll() {
            let min = self.tunables.read().polling_ms_min;
            if self.poll.lock().accelerate(now, min) {
                self.accelerations.fetch_add(1, Ordering::Relaxed);
            }
            debug!("FAST POLL: alert={} hold={}", verdict.alert, verdict.hold);
        }
    }

    // ONE TIMER FIRING. TRUE IF THE WORK ITEM WAS QUEUED.
    pub fn timer_tick(&self, now: Instant) -> bool {
        self.drain_freq_changes(now);
        let max = self.tunables.read().polling_ms_max;
        let due = self.poll.lock().on_timer(now, max);
        due && self.work.queue()
    }

    pub fn queue_work(&self) -> bool {
        self.work.queue()
    }

    pub(crate) fn work_receiver(&self) -> Receiver<()> {
        self.work.receiver()
    }

    // THE WORK ITEM: FRESH STABILITY WINDOW, FRESH COUNTERS, ONE REAL SAMPLE
    pub fn run_work(&self) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        self.work_runs.fetch_add(1, Ordering::Relaxed);
        self.drain_freq_changes(Instant::now());
        self.stability.reset();
        for node in self.nodes.lock().iter_mut() {
            node.refresh();
        }

        let mut dev = self.device.lock();
        self.real_sample.store(true, Ordering::Relaxed);
        let freq = self.get_target_frequency(&mut **dev);
        dev.commit(freq);
        self.real_sample.store(false, Ordering::Relaxed);
    }

    // FRAMEWORK-INITIATED UPDATE (NOT A REAL SAMPLE): REPORTS THE LAST DECISION
    pub fn update_devfreq(&self) -> u64 {
        let mut dev = self.device.lock();
        let freq = self.get_target_frequency(&mut **dev);
        dev.commit(freq);
        freq
    }

    // --- DECISION ENGINE ENTRY ---

    // CALLER HOLDS THE DEVICE (UPDATE) LOCK. A HELD TICK NEVER TOUCHES THE
    // DEVICE COUNTERS: THE NEXT REAL SAMPLE SEES THE WHOLE WINDOW.
    pub fn get_target_frequency(&self, dev: &mut dyn DevfreqDevice) -> u64 {
        self.drain_freq_changes(Instant::now());
        let sysbusy = self.sysbusy.load(Ordering::Relaxed);
        let real_sample = self.real_sample.load(Ordering::Relaxed);
        let baseline = self.tunables.read().sysbusy_baseline;

        let mut engine = self.engine.lock();
        if engine.holds_last(sysbusy > baseline, real_sample) {
            return engine.held_tick();
        }
        let input = TickInput {
            status: dev.load_status(),
            sysbusy,
            ems_mode: self.ems_mode.load(Ordering::Relaxed),
            real_sample,
            prepare_freq: self.stability.prepare_freq(),
            opp_table: dev.opp_table(),
        };
        let mut nodes = self.nodes.lock();
        let tun = self.tunables.read();
        engine.get_target_frequency(&input, &mut nodes, &tun)
    }

    // --- EVENT BRIDGE TARGETS ---

    pub fn freq_change_sender(&self) -> FreqChangeSender {
        self.stability.sender()
    }

    pub fn pending_freq_changes(&self) -> usize {
        self.stability.pending()
    }

    // ABOVE BASELINE: SAMPLING STOPS, ONE IMMEDIATE FORCED-MAX TICK.
    // BACK AT/BELOW BASELINE: STABILITY RESET, POLLING RESTARTS AT THE FLOOR.
    pub fn set_sysbusy(&self, level: u64) {
        let baseline = self.tunables.read().sysbusy_baseline;
        let prev = self.sysbusy.swap(level, Ordering::Relaxed);
        let was_busy = prev > baseline;
        let busy = level > baseline;
        if busy == was_busy {
            return;
        }
        if busy {
            info!("SYSBUSY LEVEL {}: FORCING MAX", level);
            self.poll.lock().stop();
            if self.active.load(Ordering::Relaxed) {
                self.work.queue();
            }
        } else {
            info!("SYSBUSY LEVEL {}: SAMPLING RESUMED", level);
            self.stability.reset();
            if self.active.load(Ordering::Relaxed) && !self.suspended.load(Ordering::Relaxed) {
                let min = self.tunables.read().polling_ms_min;
                self.poll.lock().start(Instant::now(), min);
            }
        }
    }

    pub fn is_sysbusy(&self) -> bool {
        self.sysbusy.load(Ordering::Relaxed) > self.tunables.read().sysbusy_baseline
    }

    pub fn set_ems_mode(&self, on: bool) {
        if self.ems_mode.swap(on, Ordering::Relaxed) != on {
            info!("EMS MODE {}", if on { "ON" } else { "OFF" });
        }
    }

    // --- PARAMETER STORE ---

    pub fn get_tunable(&self, path: &str) -> Result<String, TunableError> {
        match parse_path(path)? {
            TunablePath::Governor(name) => self.tunables.read().get(name),
            TunablePath::Node(idx, field) => {
                let nodes = self.nodes.lock();
                let node = nodes
                    .iter()
                    .find(|n| n.id.0 == idx)
                    .ok_or_else(|| TunableError::Unknown(path.to_string()))?;
                Ok(tuning::lookup(tuning::NODE_FIELDS, field)?.read(&node.tunables).to_string())
            }
            TunablePath::Domain(idx, field) => self.stability.with_state(|s| {
                let rec = s.record(idx).ok_or_else(|| TunableError::Unknown(path.to_string()))?;
                Ok(tuning::lookup(tuning::DOMAIN_FIELDS, field)?.read(&rec.tunables).to_string())
            }),
        }
    }

    pub fn set_tunable(&self, path: &str, raw: &str) -> Result<(), TunableError> {
        let res = match parse_path(path)? {
            TunablePath::Governor(name) => self.tunables.write().set(name, raw),
            TunablePath::Node(idx, field) => {
                let mut nodes = self.nodes.lock();
                let node = nodes
                    .iter_mut()
                    .find(|n| n.id.0 == idx)
                    .ok_or_else(|| TunableError::Unknown(path.to_string()))?;
                tuning::write_field(tuning::NODE_FIELDS, &mut node.tunables, field, raw).map(|_| ())
            }
            TunablePath::Domain(idx, field) => self.stability.with_state(|s| {
                let rec = s
                    .record_mut(idx)
                    .ok_or_else(|| TunableError::Unknown(path.to_string()))?;
                tuning::write_field(tuning::DOMAIN_FIELDS, &mut rec.tunables, field, raw).map(|_| ())
            }),
        };
        match &res {
            Ok(()) => debug!("TUNABLE {} <- {}", path, raw),
            Err(e) => warn!("TUNABLE WRITE REJECTED: {}", e),
        }
        res
    }

    pub fn tunables(&self) -> Tunables {
        self.tunables.read().clone()
    }

    // --- INTROSPECTION ---

    pub fn poll_state(&self) -> PollState {
        *self.poll.lock()
    }

    pub fn prepare_freq(&self) -> u64 {
        self.stability.prepare_freq()
    }

    pub fn stability_record(&self, domain: u32) -> Option<StabilityRecord> {
        self.stability.with_state(|s| s.record(domain).copied())
    }

    pub fn stats(&self) -> GovernorStats {
        let engine = self.engine.lock();
        GovernorStats {
            engine: engine.stats(),
            llc_transitions: engine.llc_transitions(),
            llc_state: engine.llc_state(),
            accelerations: self.accelerations.load(Ordering::Relaxed),
            work_runs: self.work_runs.load(Ordering::Relaxed),
            last_freq: engine.last_freq(),
        }
    }

    pub fn with_log<R>(&self, f: impl FnOnce(&SampleLog) -> R) -> R {
        f(self.engine.lock().log())
    }
}

// --- GOVERNOR INSTANCE ---
// BOUND TO ONE FREQUENCY-SCALING CLIENT. start() SPAWNS THE SCHEDULING CORE,
// stop() JOINS IT. DROPPING A RUNNING GOVERNOR STOPS IT.

pub struct Governor {
    ctx: Arc<GovernorContext>,
    sched: Option<Scheduler>,
}

impl Governor {
    pub fn new(ctx: GovernorContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            sched: None,
        }
    }

    pub fn context(&self) -> &Arc<GovernorContext> {
        &self.ctx
    }

    pub fn start(&mut self) -> Result<()> {
        if self.sched.is_some() {
            return Ok(());
        }
        self.ctx.start()?;
        match Scheduler::spawn(self.ctx.clone()) {
            Ok(s) => self.sched = Some(s),
            Err(e) => {
                self.ctx.stop();
                return Err(e);
            }
        }
        info!("GOVERNOR STARTED ({} nodes)", self.ctx.node_count());
        Ok(())
    }

    pub fn stop(&mut self) {
        let Some(mut sched) = self.sched.take() else {
            return;
        };
        self.ctx.poll.lock().stop();
        sched.stop();
        self.ctx.stop();
        info!("GOVERNOR STOPPED");
    }

    pub fn suspend(&self) {
        self.ctx.suspend();
    }

    pub fn resume(&self) {
        self.ctx.resume();
    }

    pub fn is_running(&self) -> bool {
        self.sched.is_some()
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        self.stop();
    }
}
