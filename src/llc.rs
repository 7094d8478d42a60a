// LEALT LLC CONTROL
// TWO-STATE MACHINE (OFF/ON) OVER THE SHARED LAST-LEVEL CACHE REGION.
// NO_CHANGE IS A DECISION, NOT A STATE: IT NEVER REACHES THE ALLOCATOR.
// THE ALLOCATOR IS ONLY CALLED WHEN THE APPLIED STATE ACTUALLY FLIPS.

use log::info;

pub const DEFAULT_LLC_REGION: u32 = 0;
pub const DEFAULT_LLC_WAYS: u32   = 16;   // FULL-WAY ALLOCATION WHEN ON

// ORDINALS MATTER: BACKTRACE TAKES THE MAX, SO ON BEATS NO_CHANGE BEATS OFF.
// ZEROED RING SLOTS READ AS OFF AND CAN NEVER RAISE THE MAX.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheState {
    #[default]
    Off = 0,
    NoChange = 1,
    On = 2,
}

impl CacheState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::NoChange => "NONE",
            Self::On => "ON",
        }
    }
}

// CACHE-REGION ALLOCATOR COLLABORATOR
pub trait CacheAllocator: Send {
    fn set_region(&mut self, region: u32, enabled: bool, ways: u32);
}

pub struct LlcControl {
    allocator: Box<dyn CacheAllocator>,
    region: u32,
    ways: u32,
    applied: CacheState,
    transitions: u64,
}

impl LlcControl {
    pub fn new(allocator: Box<dyn CacheAllocator>, region: u32, ways: u32) -> Self {
        Self {
            allocator,
            region,
            ways,
            applied: CacheState::Off,
            transitions: 0,
        }
    }

    // RETURNS TRUE IF THE ALLOCATOR WAS CALLED
    pub fn apply(&mut self, decision: CacheState) -> bool {
        if decision == CacheState::NoChange || decision == self.applied {
            return false;
        }
        let enable = decision == CacheState::On;
        let ways = if enable { self.ways } else { 0 };
        self.allocator.set_region(self.region, enable, ways);
        self.applied = decision;
        self.transitions += 1;
        info!("LLC REGION {} -> {} (ways={})", self.region, decision.label(), ways);
        true
    }

    // GOVERNOR STOP: NEVER LEAVE THE REGION RESERVED BEHIND US
    pub fn release(&mut self) {
        self.apply(CacheState::Off);
    }

    pub fn state(&self) -> CacheState {
        self.applied
    }

    pub fn is_on(&self) -> bool {
        self.applied == CacheState::On
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }
}
