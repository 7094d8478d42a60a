// LEALT TUNABLES
// PURE-RUST MODULE: DEFAULTS, CLAMP RANGES, TYPED CONFIGURATION REGISTRY
// SHARED BETWEEN THE GOVERNOR CORE, THE CONFIG LOADER AND THE CLI
//
// EVERY KNOB IS RUNTIME-WRITABLE THROUGH ONE NAME-KEYED ENTRY POINT.
// NUMERIC WRITES THAT PARSE ARE CLAMPED TO [MIN, MAX], NEVER REJECTED.
// WRITES THAT FAIL TO PARSE ARE REJECTED AND LEAVE THE OLD VALUE IN FORCE.
//
// FREQUENCIES ARE KHZ, DURATIONS ARE MICROSECONDS UNLESS NAMED _MS.

use serde::Deserialize;
use thiserror::Error;

// SCHEDULING CORE

pub const TIMER_PERIOD_MS: u64        = 10;     // TIMER RE-ARM PERIOD: WORST-CASE REACTION BOUND
pub const DEFAULT_POLLING_MS_MIN: u64 = 10;
pub const DEFAULT_POLLING_MS_MAX: u64 = 320;    // 5 DOUBLINGS FROM THE FLOOR
pub const POLLING_MS_FLOOR: u64       = 4;
pub const POLLING_MS_MIN_CEIL: u64    = 1_000;
pub const POLLING_MS_CEIL: u64        = 10_000;

// SAMPLE RING

pub const SAMPLE_RING_SIZE: usize = 10;

// HOLD WINDOWS (DEBOUNCE, IN ACCUMULATED SAMPLE DURATION)

pub const DEFAULT_HOLD_TIME_FREQ_US: u64 = 50_000;    // 50MS
pub const DEFAULT_HOLD_TIME_LLC_US: u64  = 100_000;   // 100MS: CACHE FLIPS ARE EXPENSIVE
pub const HOLD_TIME_CEIL_US: u64         = 10_000_000;

// FREQUENCY LIMITS

pub const FREQ_CEIL_KHZ: u64         = 10_000_000;  // ANY REAL MEMORY CLOCK FITS
pub const DEFAULT_MAX_FREQ: u64      = 3_172_000;
pub const DEFAULT_LLC_FREQ: u64      = 845_000;     // SAFE FLOOR WHILE THE LLC REGION IS ON
pub const DEFAULT_EFFICIENT_TH: u64  = 1_352_000;
pub const DEFAULT_EFFICIENT_FREQ: u64 = 1_539_000;

// LLC THRESHOLDS (ON ACTIVE FREQUENCY)

pub const DEFAULT_LLC_ON_TH: u64  = 1_539_000;
pub const DEFAULT_LLC_OFF_TH: u64 = 1_014_000;

// TARGET LOAD

pub const DEFAULT_TARGET_LOAD: u64 = 80;

// SYSBUSY: LEVELS ABOVE THE BASELINE BYPASS SAMPLING AND FORCE MAX

pub const DEFAULT_SYSBUSY_BASELINE: u64 = 0;
pub const SYSBUSY_LEVEL_CEIL: u64       = 3;

// PER-NODE DEFAULTS

pub const DEFAULT_RATIO_CEIL: u64    = 60;    // INSTRUCTIONS PER MEMORY ACCESS
pub const RATIO_CEIL_MAX: u64        = 100_000;
pub const DEFAULT_MINLOCK_RATIO: u64 = 0;
pub const DEFAULT_MAXLOCK_RATIO: u64 = 100;

// PER-DOMAIN DEFAULTS

pub const DEFAULT_STABILITY_TH: u64 = 60;

// --- ERRORS ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunableError {
    #[error("unknown tunable `{0}`")]
    Unknown(String),
    #[error("invalid value {value:?} for `{name}`")]
    Parse { name: String, value: String },
}

// --- REGISTRY ---

// ONE ENTRY PER KNOB. GET/SET ARE PLAIN FN POINTERS SO THE TABLES ARE STATIC.
pub struct Field<T> {
    pub name: &'static str,
    pub min: u64,
    pub max: u64,
    get: fn(&T) -> u64,
    set: fn(&mut T, u64),
}

impl<T> Field<T> {
    pub fn read(&self, target: &T) -> u64 {
        (self.get)(target)
    }

    // CLAMP AND STORE. RETURNS THE VALUE ACTUALLY WRITTEN.
    pub fn write(&self, target: &mut T, value: u64) -> u64 {
        let v = value.clamp(self.min, self.max);
        (self.set)(target, v);
        v
    }
}

macro_rules! field {
    ($ty:ty, $name:ident, $min:expr, $max:expr) => {
        Field::<$ty> {
            name: stringify!($name),
            min: $min,
            max: $max,
            get: |t: &$ty| t.$name,
            set: |t: &mut $ty, v: u64| t.$name = v,
        }
    };
}

pub fn lookup<'a, T>(fields: &'a [Field<T>], name: &str) -> Result<&'a Field<T>, TunableError> {
    fields
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| TunableError::Unknown(name.to_string()))
}

pub fn parse_value(name: &str, raw: &str) -> Result<u64, TunableError> {
    raw.trim().parse::<u64>().map_err(|_| TunableError::Parse {
        name: name.to_string(),
        value: raw.to_string(),
    })
}

// PARSE, CLAMP, STORE. A PARSE FAILURE TOUCHES NOTHING.
pub fn write_field<T>(
    fields: &[Field<T>],
    target: &mut T,
    name: &str,
    raw: &str,
) -> Result<u64, TunableError> {
    let field = lookup(fields, name)?;
    let value = parse_value(name, raw)?;
    Ok(field.write(target, value))
}

// --- GOVERNOR SCALARS ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct EmsEntry {
    pub mem_freq: u64,
    pub target_load: u64,
    pub maxlock: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunables {
    pub polling_ms_min: u64,
    pub polling_ms_max: u64,
    pub max_freq: u64,
    pub hold_time_freq: u64,
    pub hold_time_llc: u64,
    pub llc_on_th: u64,
    pub llc_off_th: u64,
    pub llc_freq: u64,
    pub efficient_freq_th: u64,
    pub efficient_freq: u64,
    pub default_target_load: u64,
    pub sysbusy_baseline: u64,
    pub ems_table: Vec<EmsEntry>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            polling_ms_min: DEFAULT_POLLING_MS_MIN,
            polling_ms_max: DEFAULT_POLLING_MS_MAX,
            max_freq: DEFAULT_MAX_FREQ,
            hold_time_freq: DEFAULT_HOLD_TIME_FREQ_US,
            hold_time_llc: DEFAULT_HOLD_TIME_LLC_US,
            llc_on_th: DEFAULT_LLC_ON_TH,
            llc_off_th: DEFAULT_LLC_OFF_TH,
            llc_freq: DEFAULT_LLC_FREQ,
            efficient_freq_th: DEFAULT_EFFICIENT_TH,
            efficient_freq: DEFAULT_EFFICIENT_FREQ,
            default_target_load: DEFAULT_TARGET_LOAD,
            sysbusy_baseline: DEFAULT_SYSBUSY_BASELINE,
            ems_table: Vec::new(),
        }
    }
}

pub static GOVERNOR_FIELDS: &[Field<Tunables>] = &[
    field!(Tunables, polling_ms_min, POLLING_MS_FLOOR, POLLING_MS_MIN_CEIL),
    field!(Tunables, polling_ms_max, POLLING_MS_FLOOR, POLLING_MS_CEIL),
    field!(Tunables, max_freq, 0, FREQ_CEIL_KHZ),
    field!(Tunables, hold_time_freq, 0, HOLD_TIME_CEIL_US),
    field!(Tunables, hold_time_llc, 0, HOLD_TIME_CEIL_US),
    field!(Tunables, llc_on_th, 0, FREQ_CEIL_KHZ),
    field!(Tunables, llc_off_th, 0, FREQ_CEIL_KHZ),
    field!(Tunables, llc_freq, 0, FREQ_CEIL_KHZ),
    field!(Tunables, efficient_freq_th, 0, FREQ_CEIL_KHZ),
    field!(Tunables, efficient_freq, 0, FREQ_CEIL_KHZ),
    field!(Tunables, default_target_load, 1, 100),
    field!(Tunables, sysbusy_baseline, 0, SYSBUSY_LEVEL_CEIL),
];

pub const EMS_TABLE_KEY: &str = "ems_table";

impl Tunables {
    pub fn get(&self, name: &str) -> Result<String, TunableError> {
        if name == EMS_TABLE_KEY {
            return Ok(format_ems_table(&self.ems_table));
        }
        Ok(lookup(GOVERNOR_FIELDS, name)?.read(self).to_string())
    }

    pub fn set(&mut self, name: &str, raw: &str) -> Result<(), TunableError> {
        if name == EMS_TABLE_KEY {
            self.ems_table = parse_ems_table(raw)?;
            return Ok(());
        }
        write_field(GOVERNOR_FIELDS, self, name, raw)?;
        self.keep_ordered(name);
        Ok(())
    }

    pub fn set_value(&mut self, name: &str, value: u64) -> Result<u64, TunableError> {
        let field = lookup(GOVERNOR_FIELDS, name)?;
        field.write(self, value);
        self.keep_ordered(name);
        Ok(field.read(self))
    }

    // PAIRED BOUNDS STAY ORDERED: THE FIELD JUST WRITTEN YIELDS TO ITS PARTNER
    fn keep_ordered(&mut self, changed: &str) {
        match changed {
            "polling_ms_min" => self.polling_ms_min = self.polling_ms_min.min(self.polling_ms_max),
            "polling_ms_max" => self.polling_ms_max = self.polling_ms_max.max(self.polling_ms_min),
            "llc_off_th" => self.llc_off_th = self.llc_off_th.min(self.llc_on_th),
            "llc_on_th" => self.llc_on_th = self.llc_on_th.max(self.llc_off_th),
            _ => {}
        }
    }
}

// EMS TABLE WIRE FORMAT: "MEM_FREQ:TARGET_LOAD:MAXLOCK ..." (WHITESPACE SEPARATED)
// EMPTY STRING CLEARS THE TABLE. ROWS ARE KEPT SORTED BY MEM_FREQ.
pub fn parse_ems_table(raw: &str) -> Result<Vec<EmsEntry>, TunableError> {
    let bad = || TunableError::Parse {
        name: EMS_TABLE_KEY.to_string(),
        value: raw.to_string(),
    };
    let mut rows = Vec::new();
    for tok in raw.split_whitespace() {
        let parts: Vec<&str> = tok.split(':').collect();
        if parts.len() != 3 {
            return Err(bad());
        }
        let nums: Vec<u64> = parts
            .iter()
            .map(|p| p.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|_| bad())?;
        rows.push(EmsEntry {
            mem_freq: nums[0].min(FREQ_CEIL_KHZ),
            target_load: nums[1].clamp(1, 100),
            maxlock: nums[2].min(FREQ_CEIL_KHZ),
        });
    }
    rows.sort_by_key(|r| r.mem_freq);
    Ok(rows)
}

pub fn format_ems_table(rows: &[EmsEntry]) -> String {
    rows.iter()
        .map(|r| format!("{}:{}:{}", r.mem_freq, r.target_load, r.maxlock))
        .collect::<Vec<_>>()
        .join(" ")
}

// --- PER-NODE KNOBS ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeTunables {
    pub ratio_ceil: u64,
    pub minlock_ratio: u64,
    pub maxlock_ratio: u64,
    pub llc_on_th: u64,     // CPU FREQUENCY: LATENCY-BOUND CORE AT/ABOVE THIS ASKS FOR LLC
}

impl Default for NodeTunables {
    fn default() -> Self {
        Self {
            ratio_ceil: DEFAULT_RATIO_CEIL,
            minlock_ratio: DEFAULT_MINLOCK_RATIO,
            maxlock_ratio: DEFAULT_MAXLOCK_RATIO,
            llc_on_th: 0,
        }
    }
}

pub static NODE_FIELDS: &[Field<NodeTunables>] = &[
    field!(NodeTunables, ratio_ceil, 0, RATIO_CEIL_MAX),
    field!(NodeTunables, minlock_ratio, 0, 100),
    field!(NodeTunables, maxlock_ratio, 0, 100),
    field!(NodeTunables, llc_on_th, 0, FREQ_CEIL_KHZ),
];

// --- PER-DOMAIN KNOBS ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainTunables {
    pub prepare_cond: u64,    // CPU FREQUENCY AT/ABOVE WHICH THE DOMAIN ARMS PREPARE-HOLD
    pub prepare_freq: u64,    // MEMORY FLOOR REQUESTED WHILE ARMED (0 = NEVER)
    pub stability_th: u64,
}

impl Default for DomainTunables {
    fn default() -> Self {
        Self {
            prepare_cond: FREQ_CEIL_KHZ,
            prepare_freq: 0,
            stability_th: DEFAULT_STABILITY_TH,
        }
    }
}

pub static DOMAIN_FIELDS: &[Field<DomainTunables>] = &[
    field!(DomainTunables, prepare_cond, 0, FREQ_CEIL_KHZ),
    field!(DomainTunables, prepare_freq, 0, FREQ_CEIL_KHZ),
    field!(DomainTunables, stability_th, 0, 100),
];

// --- PATHS ---

// "name" | "node<N>/<field>" | "domain<N>/<field>"
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunablePath<'a> {
    Governor(&'a str),
    Node(u32, &'a str),
    Domain(u32, &'a str),
}

pub fn parse_path(path: &str) -> Result<TunablePath<'_>, TunableError> {
    let unknown = || TunableError::Unknown(path.to_string());
    let Some((scope, field)) = path.split_once('/') else {
        return Ok(TunablePath::Governor(path));
    };
    if let Some(idx) = scope.strip_prefix("node") {
        let idx = idx.parse().map_err(|_| unknown())?;
        return Ok(TunablePath::Node(idx, field));
    }
    if let Some(idx) = scope.strip_prefix("domain") {
        let idx = idx.parse().map_err(|_| unknown())?;
        return Ok(TunablePath::Domain(idx, field));
    }
    Err(unknown())
}
