//! Tunables (spec §6) as `serde`-able configuration structs, following the
//! teacher's `RamdiskConfig` pattern: plain data structs with `Default`
//! impls that encode the engine's built-in constants. [`WqConfig::to_json`]/
//! [`WqConfig::from_json`] use `serde_json` the same way the teacher loads
//! its own JSON config files (e.g. `candle::memory::api::middleware`'s
//! `serde_json::from_str` over a config file's contents).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling on `max_active`, matching the kernel's `WQ_MAX_ACTIVE`.
pub const MAX_ACTIVE_CEILING: u32 = 512;

/// Default per-binding concurrency limit when the caller doesn't specify
/// one explicitly (kernel default is also unbounded-ish but conventionally
/// callers pass a small number; we pick the same default the kernel's
/// `alloc_workqueue` macro falls back to for unspecified `max_active`).
pub const DEFAULT_MAX_ACTIVE: u32 = 256;

/// How long a CPU-bound work item may run before the tick sampler marks
/// its worker `CPU_INTENSIVE` (spec §4.2). Default 10ms, matching the
/// kernel's `wq_cpu_intensive_thresh_us`.
pub const DEFAULT_CPU_INTENSIVE_THRESH: Duration = Duration::from_millis(10);

/// How long an idle worker may sit before the cull timer marks it `DIE`.
/// Matches the kernel's `IDLE_WORKER_TIMEOUT` (5 minutes).
pub const IDLE_WORKER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Delay before a stalled pool's manager posts the first mayday, matching
/// `MAYDAY_INITIAL_TIMEOUT` (roughly two scheduler ticks in the kernel;
/// we use a fixed 20ms which is conservative on modern hardware).
pub const MAYDAY_INITIAL_TIMEOUT: Duration = Duration::from_millis(20);

/// Interval between repeated maydays while a pool remains stalled, matching
/// `MAYDAY_INTERVAL` (100ms).
pub const MAYDAY_INTERVAL: Duration = Duration::from_millis(100);

/// Cooldown after a failed worker creation before the manager retries,
/// matching `CREATE_COOLDOWN` (1s).
pub const CREATE_COOLDOWN: Duration = Duration::from_secs(1);

/// Number of work-item colors in the flush protocol (spec §4.4). Matches
/// the kernel's `WORK_NR_COLORS`.
pub const NR_COLORS: u8 = 16;

/// Affinity scope for unbound pools (spec §6 tunables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityScope {
    Cpu,
    Smt,
    Cache,
    Numa,
    System,
}

impl Default for AffinityScope {
    fn default() -> Self {
        AffinityScope::Cache
    }
}

/// Flags a workqueue can be created with (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WqFlags {
    pub unbound: bool,
    pub highpri: bool,
    pub cpu_intensive: bool,
    pub mem_reclaim: bool,
    pub freezable: bool,
    pub ordered: bool,
    pub power_efficient: bool,
    pub sysfs: bool,
}

impl WqFlags {
    pub fn unbound() -> Self {
        Self {
            unbound: true,
            ..Default::default()
        }
    }

    pub fn ordered() -> Self {
        Self {
            unbound: true,
            ordered: true,
            ..Default::default()
        }
    }
}

/// Per-pool attributes: nice value, CPU mask, affinity scope, strictness.
/// Two pools with equal `PoolAttrs` (by [`PoolAttrs::fingerprint`]) share
/// the same unbound worker pool (spec §3, Worker Pool lifecycle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolAttrs {
    pub nice: i32,
    pub cpumask: Vec<usize>,
    pub affinity_scope: AffinityScope,
    pub affinity_strict: bool,
}

impl Default for PoolAttrs {
    fn default() -> Self {
        Self {
            nice: 0,
            cpumask: (0..num_cpus::get()).collect(),
            affinity_scope: AffinityScope::default(),
            affinity_strict: false,
        }
    }
}

impl PoolAttrs {
    /// A stable hash of the attributes used to key the unbound-pool table.
    /// Two `PoolAttrs` that are `==` always produce the same fingerprint.
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.nice.hash(&mut hasher);
        self.cpumask.hash(&mut hasher);
        (self.affinity_scope as u8 as i32 as u8).hash(&mut hasher);
        self.affinity_strict.hash(&mut hasher);
        hasher.finish()
    }

    pub fn highpri(mut self) -> Self {
        self.nice = -20;
        self
    }
}

/// Configuration for a single workqueue (spec §3 Workqueue, §6 tunables).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WqConfig {
    pub name: String,
    pub flags: WqFlags,
    pub max_active: u32,
    pub cpu_intensive_thresh: Duration,
}

impl WqConfig {
    pub fn new(name: impl Into<String>, flags: WqFlags, max_active: u32) -> Self {
        let max_active = if flags.ordered {
            1
        } else {
            max_active.clamp(1, MAX_ACTIVE_CEILING)
        };
        Self {
            name: name.into(),
            flags,
            max_active,
            cpu_intensive_thresh: DEFAULT_CPU_INTENSIVE_THRESH,
        }
    }

    /// Serialize this tunable set to JSON, for a host that wants to persist
    /// or log the attributes a workqueue was created with.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Load a `WqConfig` from a JSON document (e.g. a host's config file),
    /// re-clamping `max_active` the same way [`WqConfig::new`] does so a
    /// hand-edited file can't smuggle in an out-of-range or
    /// `ORDERED`-violating value.
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        let raw: WqConfig = serde_json::from_str(s)?;
        Ok(WqConfig::new(raw.name, raw.flags, raw.max_active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_forces_max_active_one() {
        let cfg = WqConfig::new("ord", WqFlags::ordered(), 64);
        assert_eq!(cfg.max_active, 1);
    }

    #[test]
    fn max_active_clamped_to_ceiling() {
        let cfg = WqConfig::new("big", WqFlags::default(), 100_000);
        assert_eq!(cfg.max_active, MAX_ACTIVE_CEILING);
    }

    #[test]
    fn fingerprint_is_stable_for_equal_attrs() {
        let a = PoolAttrs::default();
        let b = PoolAttrs::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn json_round_trip_preserves_attributes() {
        let cfg = WqConfig::new("from-disk", WqFlags::ordered(), 8);
        let json = cfg.to_json().unwrap();
        let loaded = WqConfig::from_json(&json).unwrap();
        assert_eq!(loaded.name, cfg.name);
        assert_eq!(loaded.flags, cfg.flags);
        assert_eq!(loaded.max_active, cfg.max_active);
    }

    #[test]
    fn json_load_reclamps_a_hand_edited_max_active() {
        let json = r#"{"name":"edited","flags":{"unbound":false,"highpri":false,"cpu_intensive":false,"mem_reclaim":false,"freezable":false,"ordered":true,"power_efficient":false,"sysfs":false},"max_active":64,"cpu_intensive_thresh":{"secs":0,"nanos":10000000}}"#;
        let loaded = WqConfig::from_json(json).unwrap();
        assert_eq!(loaded.max_active, 1, "ORDERED must still force max_active=1 after a JSON load");
    }
}
