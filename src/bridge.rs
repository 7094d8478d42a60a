// LEALT EVENT BRIDGES
// THIN ADAPTERS FROM EXTERNAL NOTIFIERS INTO THE GOVERNOR.
//
// CPUFREQ:  NEVER BLOCKS, NEVER TAKES A GOVERNOR LOCK. ONE SEND ON AN
//           UNBOUNDED QUEUE; THE NEXT TIMER OR DECISION TICK DRAINS IT.
//           DROPPED WHILE THE GOVERNOR IS STOPPED.
// SYSBUSY:  NORMAL / BUSY LEVELS. ABOVE THE BASELINE THE GOVERNOR STOPS
//           SAMPLING AND FORCES MAX; BACK AT NORMAL IT RESUMES POLLING.
// EMS MODE: ON/OFF TOGGLE FOR THE ALTERNATE TARGET-LOAD TABLE.
//
// THE BUSY/EMS BRIDGES HOLD A WEAK REFERENCE: A NOTIFIER THAT OUTLIVES
// THE GOVERNOR BECOMES A NO-OP INSTEAD OF KEEPING IT ALIVE.

use std::sync::{Arc, Weak};

use log::trace;

use crate::governor::GovernorContext;
use crate::stability::{FreqChange, FreqChangeSender};

#[derive(Clone)]
pub struct CpufreqNotifier {
    tx: FreqChangeSender,
}

impl CpufreqNotifier {
    pub fn new(ctx: &GovernorContext) -> Self {
        Self {
            tx: ctx.freq_change_sender(),
        }
    }

    // SAFE FROM ANY THREAD
    pub fn notify(&self, domain: u32, freq: u64) {
        if !self.tx.send(FreqChange { domain, freq }) {
            trace!("CPUFREQ: GOVERNOR STOPPED, DROPPING DOMAIN {} FREQ {}", domain, freq);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SysbusyState {
    Normal,
    Busy1,
    Busy2,
    Busy3,
}

impl SysbusyState {
    pub fn level(self) -> u64 {
        match self {
            Self::Normal => 0,
            Self::Busy1 => 1,
            Self::Busy2 => 2,
            Self::Busy3 => 3,
        }
    }

    // LEVELS PAST THE TOP CLAMP TO THE TOP
    pub fn from_level(level: u64) -> Self {
        match level {
            0 => Self::Normal,
            1 => Self::Busy1,
            2 => Self::Busy2,
            _ => Self::Busy3,
        }
    }
}

#[derive(Clone)]
pub struct SysbusyNotifier {
    ctx: Weak<GovernorContext>,
}

impl SysbusyNotifier {
    pub fn new(ctx: &Arc<GovernorContext>) -> Self {
        Self {
            ctx: Arc::downgrade(ctx),
        }
    }

    pub fn notify(&self, state: SysbusyState) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.set_sysbusy(state.level());
        }
    }
}

#[derive(Clone)]
pub struct EmsModeNotifier {
    ctx: Weak<GovernorContext>,
}

impl EmsModeNotifier {
    pub fn new(ctx: &Arc<GovernorContext>) -> Self {
        Self {
            ctx: Arc::downgrade(ctx),
        }
    }

    pub fn notify(&self, on: bool) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.set_ems_mode(on);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysbusy_levels_clamp_to_top() {
        for s in [SysbusyState::Normal, SysbusyState::Busy1, SysbusyState::Busy2, SysbusyState::Busy3] {
            assert_eq!(SysbusyState::from_level(s.level()), s);
        }
        assert_eq!(SysbusyState::from_level(99), SysbusyState::Busy3);
        assert!(SysbusyState::Busy1 > SysbusyState::Normal);
    }
}
