//! The work item (spec §3 "Work Item", §4.1 "Work-Item State Protocol").
//!
//! The single atomic `data` word is the CAS lock described in §4.1: the
//! PENDING bit is the ownership bit, and the remaining bits are
//! interpreted differently depending on whether PENDING is set. Rust's
//! ownership model already guarantees a work item lives in at most one
//! list at a time (the spec's `entry` invariant), so there is no intrusive
//! link field here — only the tagged state word plus the callable.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const NR_COLORS: u8 = crate::config::NR_COLORS;

const PENDING: u64 = 1 << 0;
const LINKED: u64 = 1 << 1;
const INACTIVE: u64 = 1 << 2;
const CANCELING: u64 = 1 << 3;
const COLOR_SHIFT: u32 = 4;
const COLOR_BITS: u64 = 0xF;
const COLOR_MASK: u64 = COLOR_BITS << COLOR_SHIFT;
const ID_SHIFT: u32 = 32;
const ID_MASK: u64 = 0xFFFF_FFFFu64 << ID_SHIFT;

/// Sentinel pool id meaning "never executed" — the initial Idle encoding.
pub const NO_POOL: u32 = 0;

/// A snapshot/builder for the `data` word. Never stored except inside the
/// `AtomicU64`; all mutation goes through compare-exchange on
/// [`WorkInner::data`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkData(pub u64);

impl WorkData {
    pub fn idle(pool_id: u32) -> Self {
        WorkData((pool_id as u64) << ID_SHIFT)
    }

    pub fn pending(binding_id: u32, color: u8, linked: bool, inactive: bool) -> Self {
        let mut bits = PENDING | ((binding_id as u64) << ID_SHIFT);
        bits |= ((color as u64) & COLOR_BITS) << COLOR_SHIFT;
        if linked {
            bits |= LINKED;
        }
        if inactive {
            bits |= INACTIVE;
        }
        bits |= 0; // flags merge point for future offq bits
        WorkData(bits)
    }

    pub fn is_pending(&self) -> bool {
        self.0 & PENDING != 0
    }

    pub fn is_linked(&self) -> bool {
        self.0 & LINKED != 0
    }

    pub fn is_inactive(&self) -> bool {
        self.0 & INACTIVE != 0
    }

    pub fn is_canceling(&self) -> bool {
        self.0 & CANCELING != 0
    }

    pub fn with_canceling(self) -> Self {
        WorkData(self.0 | CANCELING)
    }

    pub fn color(&self) -> u8 {
        ((self.0 & COLOR_MASK) >> COLOR_SHIFT) as u8
    }

    /// The pool id (if not pending) or binding id (if pending) packed in
    /// the high 32 bits, per spec §4.1's three encodings.
    pub fn id(&self) -> u32 {
        ((self.0 & ID_MASK) >> ID_SHIFT) as u32
    }
}

impl fmt::Debug for WorkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkData")
            .field("pending", &self.is_pending())
            .field("linked", &self.is_linked())
            .field("inactive", &self.is_inactive())
            .field("canceling", &self.is_canceling())
            .field("color", &self.color())
            .field("id", &self.id())
            .finish()
    }
}

/// Outcome of an attempt to claim PENDING ownership of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimError {
    /// PENDING was already set by a normal enqueue/cancel owner.
    AlreadyPending,
    /// PENDING was set and the item is currently being canceled; the
    /// caller should wait on the cancel wait-queue (spec §4.5/§5).
    Canceling,
}

pub(crate) struct WorkInner {
    pub(crate) func: Arc<dyn Fn() + Send + Sync + 'static>,
    data: AtomicU64,
}

/// A submittable unit of work: a callable plus the atomic ownership word
/// described in spec §3/§4.1. Cheap to clone (an `Arc` bump) — clones
/// refer to the same underlying item, matching the kernel's single
/// `struct work_struct` identity semantics.
#[derive(Clone)]
pub struct Work(pub(crate) Arc<WorkInner>);

/// Stable identity for a work item for the lifetime of the process,
/// derived from its allocation address the same way the kernel keys
/// `busy_hash` off `work_struct *`.
pub type WorkId = usize;

impl Work {
    /// Wrap `func` as a new, initially-Idle work item.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Work(Arc::new(WorkInner {
            func: Arc::new(func),
            data: AtomicU64::new(WorkData::idle(NO_POOL).0),
        }))
    }

    pub fn id(&self) -> WorkId {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Invoke the callable. Only ever called by the executor
    /// ([`crate::pool::Pool::run_one`]) after the PENDING-clear fence.
    pub(crate) fn call(&self) {
        (self.0.func)();
    }

    pub(crate) fn snapshot(&self) -> WorkData {
        WorkData(self.0.data.load(Ordering::Acquire))
    }

    /// Attempt to claim PENDING ownership for a fresh enqueue onto
    /// `binding_id` with the given `color`, optionally INACTIVE. Returns
    /// the *previous* encoding's pool id on success (`NO_POOL` if the item
    /// never ran), which the binding's non-reentrancy check in
    /// [`crate::binding`] uses to redirect re-enqueues of a still-running
    /// item back onto the pool it is executing on.
    pub(crate) fn try_claim_for_enqueue(
        &self,
        binding_id: u32,
        color: u8,
        inactive: bool,
    ) -> Result<u32, ClaimError> {
        loop {
            let cur = WorkData(self.0.data.load(Ordering::Acquire));
            if cur.is_pending() {
                return Err(if cur.is_canceling() {
                    ClaimError::Canceling
                } else {
                    ClaimError::AlreadyPending
                });
            }
            let new = WorkData::pending(binding_id, color, false, inactive);
            if self
                .0
                .data
                .compare_exchange(cur.0, new.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(cur.id());
            }
        }
    }

    /// Claim PENDING for the cancel path when the item is currently Idle
    /// (spec §4.5 "claimed-from-idle" outcome). Fails the same way as
    /// [`Work::try_claim_for_enqueue`] if someone else owns it.
    pub(crate) fn try_claim_for_cancel(&self) -> Result<(), ClaimError> {
        loop {
            let cur = WorkData(self.0.data.load(Ordering::Acquire));
            if cur.is_pending() {
                return Err(if cur.is_canceling() {
                    ClaimError::Canceling
                } else {
                    ClaimError::AlreadyPending
                });
            }
            // Own it transiently with a dummy binding id of NO_POOL; the
            // caller clears the word again immediately after stamping
            // CANCELING, so no real binding ever observes this state.
            let new = WorkData::pending(NO_POOL, cur.color(), false, false);
            if self
                .0
                .data
                .compare_exchange(cur.0, new.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Re-publish an Idle encoding with PENDING still logically owned by
    /// the caller, then stamp CANCELING — the "stolen-from-queue"
    /// mid-cancel state from spec §4.5. Only valid while the caller holds
    /// ownership from a prior successful claim.
    pub(crate) fn mark_idle_and_canceling(&self, last_pool: u32) {
        let bits = WorkData::idle(last_pool).0 | CANCELING;
        self.0.data.store(bits, Ordering::Release);
    }

    /// Fully clear the word back to a fresh Idle state (spec §4.5, end of
    /// `cancel_work_sync`), releasing both PENDING and CANCELING.
    pub(crate) fn clear_to_idle(&self, pool_id: u32) {
        self.0.data.store(WorkData::idle(pool_id).0, Ordering::Release);
    }

    /// Transition Pending -> Running: clear PENDING, publish `pool_id` in
    /// its place, and erect the full fence the spec requires between the
    /// PENDING-clear and invoking `func` (spec §4.1 "Execute"). Returns the
    /// encoding as it was immediately before the clear, so the executor
    /// can read the color/flags the enqueuer stamped.
    pub(crate) fn begin_execute(&self, pool_id: u32) -> WorkData {
        let prev = self.0.data.swap(WorkData::idle(pool_id).0, Ordering::AcqRel);
        // "Between clearing PENDING and invoking func, a full memory fence
        // guarantees that any writes performed by the enqueue after CAS
        // are observed by the executor" (spec §4.1).
        std::sync::atomic::fence(Ordering::SeqCst);
        WorkData(prev)
    }

    /// Toggle LINKED on an already-pending item without disturbing any
    /// other bit. Used when a barrier is spliced in immediately after this
    /// item in a list (spec §4.5 `flush_work`).
    pub(crate) fn set_linked(&self, linked: bool) {
        loop {
            let cur = self.0.data.load(Ordering::Acquire);
            let new = if linked { cur | LINKED } else { cur & !LINKED };
            if new == cur
                || self
                    .0
                    .data
                    .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return;
            }
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.id())
            .field("data", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fresh_work_is_idle_at_no_pool() {
        let w = Work::new(|| {});
        let d = w.snapshot();
        assert!(!d.is_pending());
        assert_eq!(d.id(), NO_POOL);
    }

    #[test]
    fn claim_for_enqueue_succeeds_once() {
        let w = Work::new(|| {});
        assert!(w.try_claim_for_enqueue(7, 2, false).is_ok());
        assert_eq!(
            w.try_claim_for_enqueue(7, 2, false).unwrap_err(),
            ClaimError::AlreadyPending
        );
    }

    #[test]
    fn begin_execute_clears_pending_and_sets_pool_id() {
        let w = Work::new(|| {});
        w.try_claim_for_enqueue(3, 1, false).unwrap();
        let prev = w.begin_execute(9);
        assert!(prev.is_pending());
        assert_eq!(prev.id(), 3);
        assert_eq!(prev.color(), 1);
        let after = w.snapshot();
        assert!(!after.is_pending());
        assert_eq!(after.id(), 9);
    }

    #[test]
    fn reenqueue_after_completion_reports_last_pool() {
        let w = Work::new(|| {});
        w.try_claim_for_enqueue(3, 0, false).unwrap();
        w.begin_execute(9);
        let last_pool = w.try_claim_for_enqueue(4, 0, false).unwrap();
        assert_eq!(last_pool, 9);
    }

    #[test]
    fn cancel_markers_round_trip() {
        let w = Work::new(|| {});
        w.try_claim_for_cancel().unwrap();
        w.mark_idle_and_canceling(NO_POOL);
        assert!(w.snapshot().is_canceling());
        w.clear_to_idle(NO_POOL);
        let d = w.snapshot();
        assert!(!d.is_pending());
        assert!(!d.is_canceling());
    }

    #[test]
    fn counts_executions_exactly_once_per_claim() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let w = Work::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        w.try_claim_for_enqueue(1, 0, false).unwrap();
        w.begin_execute(1);
        (w.0.func)();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
