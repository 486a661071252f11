//! The worker (spec §3 "Worker", §4.6 "Worker lifecycle").
//!
//! Each worker is a genuine OS thread (spec §5: "the engine does not
//! multiplex work items onto a shared thread"). Lifecycle is modeled as a
//! plain enum with explicit transition methods rather than a
//! macro-generated state machine — the same hand-rolled style the
//! teacher's own `ExecutionFlow` (`cylo/src/state.rs`) uses for its
//! pipeline states.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::work::Work;

/// Bits of [`WorkerFlags`]. A worker with any of
/// `PREP | CPU_INTENSIVE | UNBOUND | REBOUND` set does not count toward
/// `nr_running` (spec §3 Worker invariants: "NOT_RUNNING is any of
/// {PREP, CPU_INTENSIVE, UNBOUND, REBOUND}").
pub(crate) mod flag {
    pub const IDLE: u32 = 1 << 0;
    pub const PREP: u32 = 1 << 1;
    pub const CPU_INTENSIVE: u32 = 1 << 2;
    pub const UNBOUND: u32 = 1 << 3;
    pub const REBOUND: u32 = 1 << 4;
    pub const DIE: u32 = 1 << 5;
    pub const NOT_RUNNING: u32 = PREP | CPU_INTENSIVE | UNBOUND | REBOUND;
}

/// Atomic flag word for a worker. A single `fetch_update` resolves the
/// spec's noted race between the tick sampler setting `CPU_INTENSIVE` and
/// the sleep hook's own NOT_RUNNING transition (SPEC_FULL §9).
#[derive(Debug)]
pub(crate) struct WorkerFlags(AtomicU32);

impl WorkerFlags {
    pub fn new(bits: u32) -> Self {
        WorkerFlags(AtomicU32::new(bits))
    }

    pub fn bits(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_set(&self, mask: u32) -> bool {
        self.bits() & mask != 0
    }

    pub fn not_running(&self) -> bool {
        self.is_set(flag::NOT_RUNNING)
    }

    pub fn set(&self, mask: u32) {
        self.0.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear(&self, mask: u32) {
        self.0.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Set `set_mask` and clear `clear_mask` atomically, returning the
    /// flags as they were immediately before. Used to flip UNBOUND ->
    /// REBOUND on CPU online without a window where neither bit is set
    /// (spec §4.2 "atomically flipped from UNBOUND to REBOUND").
    pub fn swap_flags(&self, clear_mask: u32, set_mask: u32) -> u32 {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((bits & !clear_mask) | set_mask)
            })
            .expect("fetch_update closure always returns Some")
    }
}

/// The work a worker is currently executing, for `busy_hash` lookups and
/// rescuer/flush redirection (spec §3 Worker attributes).
pub(crate) struct CurrentWork {
    pub work: Work,
    pub binding_id: u32,
    pub color: u8,
    pub started_at: Instant,
}

/// Coarse worker lifecycle (spec §4.6): `Created -> Prep -> Idle <-> Busy
/// -> Die -> Detached`. `Idle <-> Busy` self-loops dominate; `Die` is
/// reached only from `Idle` under the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Prep,
    Idle,
    Busy,
    Die,
    Detached,
}

impl Lifecycle {
    /// Validate (and perform, by returning the new state) a transition.
    /// Returns `None` for any edge not in the spec's state diagram.
    pub fn transition(self, to: Lifecycle) -> Option<Lifecycle> {
        use Lifecycle::*;
        let allowed = matches!(
            (self, to),
            (Created, Prep)
                | (Prep, Idle)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Die)
                | (Die, Detached)
        );
        allowed.then_some(to)
    }
}

/// A long-lived execution context attached to exactly one pool (spec §3).
pub struct Worker {
    pub id: u64,
    pub pool_id: u32,
    pub(crate) flags: WorkerFlags,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) last_active: Mutex<Instant>,
    pub(crate) current: Mutex<Option<CurrentWork>>,
    /// Work transferred here by the rescuer or a barrier splice (spec §3
    /// Worker attributes: "a `scheduled` list"). Carries the same binding/
    /// color context as a worklist entry so a drained barrier still
    /// completes its binding's `nr_in_flight` accounting correctly.
    pub(crate) scheduled: Mutex<std::collections::VecDeque<crate::pool::QueuedWork>>,
    pub(crate) is_rescuer: bool,
}

impl Worker {
    pub(crate) fn new(id: u64, pool_id: u32, is_rescuer: bool) -> Arc<Self> {
        // A rescuer keeps PREP forever (spec §4.3: "must never participate
        // in concurrency management").
        let initial_flags = if is_rescuer { flag::PREP } else { 0 };
        Arc::new(Worker {
            id,
            pool_id,
            flags: WorkerFlags::new(initial_flags),
            lifecycle: Mutex::new(Lifecycle::Created),
            last_active: Mutex::new(Instant::now()),
            current: Mutex::new(None),
            scheduled: Mutex::new(std::collections::VecDeque::new()),
            is_rescuer,
        })
    }

    pub fn is_idle(&self) -> bool {
        self.flags.is_set(flag::IDLE)
    }

    pub fn counts_toward_running(&self) -> bool {
        !self.is_idle() && !self.flags.not_running()
    }

    /// `Created -> Prep`, the step a freshly spawned worker takes before
    /// its first `enter_idle()` (spec §4.6: "CREATED -> PREP -> IDLE").
    /// A no-op if the worker has already left `Created` (e.g. a re-armed
    /// worker looping back from `Busy`).
    pub(crate) fn enter_prep(&self) {
        let mut lc = self.lifecycle.lock();
        if let Some(next) = lc.transition(Lifecycle::Prep) {
            *lc = next;
        }
    }

    pub(crate) fn enter_idle(&self) {
        self.flags.set(flag::IDLE);
        *self.last_active.lock() = Instant::now();
        let mut lc = self.lifecycle.lock();
        if let Some(next) = lc.transition(Lifecycle::Idle) {
            *lc = next;
        }
    }

    pub(crate) fn enter_busy(&self, current: CurrentWork) {
        self.flags.clear(flag::IDLE);
        *self.current.lock() = Some(current);
        let mut lc = self.lifecycle.lock();
        if let Some(next) = lc.transition(Lifecycle::Busy) {
            *lc = next;
        }
    }

    pub(crate) fn finish_busy(&self) {
        *self.current.lock() = None;
        self.flags.clear(flag::CPU_INTENSIVE);
        self.enter_idle();
    }

    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.last_active.lock().elapsed()
    }

    pub(crate) fn mark_die(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        if let Some(next) = lc.transition(Lifecycle::Die) {
            *lc = next;
            self.flags.set(flag::DIE);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_rejects_skipped_states() {
        assert_eq!(Lifecycle::Created.transition(Lifecycle::Busy), None);
        assert_eq!(
            Lifecycle::Created.transition(Lifecycle::Prep),
            Some(Lifecycle::Prep)
        );
    }

    #[test]
    fn not_running_set_excludes_from_running_count() {
        let w = Worker::new(1, 0, false);
        w.flags.set(flag::CPU_INTENSIVE);
        w.flags.clear(flag::IDLE);
        assert!(!w.counts_toward_running());
    }

    #[test]
    fn rescuer_starts_with_prep_and_never_counts_as_running() {
        let w = Worker::new(2, 0, true);
        assert!(w.flags.is_set(flag::PREP));
        assert!(!w.counts_toward_running());
    }

    #[test]
    fn swap_flags_is_atomic_unbound_to_rebound() {
        let w = Worker::new(3, 0, false);
        w.flags.set(flag::UNBOUND);
        let prev = w.flags.swap_flags(flag::UNBOUND, flag::REBOUND);
        assert!(prev & flag::UNBOUND != 0);
        assert!(w.flags.is_set(flag::REBOUND));
        assert!(!w.flags.is_set(flag::UNBOUND));
    }
}
