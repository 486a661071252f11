//! Work cancellation (spec §4.5 `cancel_work_sync`).
//!
//! Three outcomes, matching the kernel's `try_to_grab_pending` + wait
//! loop: the item was idle (never claimed concurrently, nothing to do but
//! mark-and-clear), it was still queued and got stolen straight off the
//! worklist, or it was already executing and the caller blocks until the
//! running worker finishes it.

use std::time::Duration;

use crate::pool::Pool;
use crate::registry;
use crate::work::{ClaimError, Work};

/// What [`cancel_sync`] actually had to do to settle `work`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The item was not pending; cancellation only had to fence off a
    /// concurrent enqueue.
    NotPending,
    /// The item was still on a worklist or a binding's inactive queue and
    /// was removed before any worker could claim it.
    CanceledQueued,
    /// The item was already executing; the caller waited for the running
    /// worker to finish it.
    WaitedForRunning,
}

/// Cancel `work` and block until it is guaranteed not to run again unless
/// re-submitted (spec §4.5). Safe to call from multiple threads
/// concurrently; exactly one caller observes each of the non-idle
/// outcomes, the rest settle for whichever happened first.
pub fn cancel_sync(work: &Work) -> CancelOutcome {
    crate::timer::cancel_delayed(work.id());
    loop {
        let snap = work.snapshot();
        if !snap.is_pending() {
            // `begin_execute` republishes an Idle-shaped word (PENDING
            // cleared, pool id in the high bits) the instant a worker
            // starts running this item (spec §4.1), so `is_pending() ==
            // false` alone cannot tell "running" apart from "never
            // claimed"/"already finished". `snap.id()` is a pool id in this
            // branch; the pool's busy hash is the only thing that still
            // distinguishes the two, so check it before claiming idle.
            let pool_id = snap.id();
            if pool_id != crate::work::NO_POOL {
                if let Some(pool) = registry::lookup_pool(pool_id) {
                    if pool.busy_worker_for(work.id()).is_some() {
                        wait_until_not_running(work, &pool);
                        return CancelOutcome::WaitedForRunning;
                    }
                }
            }
            match work.try_claim_for_cancel() {
                Ok(()) => {
                    work.mark_idle_and_canceling(pool_id);
                    work.clear_to_idle(pool_id);
                    return CancelOutcome::NotPending;
                }
                Err(ClaimError::AlreadyPending) => continue,
                Err(ClaimError::Canceling) => {
                    wait_until_settled(work);
                    continue;
                }
            }
        }

        let binding_id = snap.id();
        let Some(binding) = registry::lookup_binding(binding_id) else {
            // The owning workqueue was torn down from under us; there is
            // no list left to steal from, so just fence the word off.
            work.mark_idle_and_canceling(crate::work::NO_POOL);
            work.clear_to_idle(crate::work::NO_POOL);
            return CancelOutcome::NotPending;
        };

        if binding.remove_queued(work.id()).is_some() {
            work.mark_idle_and_canceling(binding.pool.id);
            work.clear_to_idle(binding.pool.id);
            return CancelOutcome::CanceledQueued;
        }

        if binding.pool.busy_worker_for(work.id()).is_some() {
            wait_until_not_running(work, &binding.pool);
            return CancelOutcome::WaitedForRunning;
        }

        // Lost a race: the item moved between the snapshot and the lookups
        // above (e.g. a rescuer just picked it up). Retry from the top.
        std::thread::sleep(Duration::from_micros(50));
    }
}

/// Cancel `work` without waiting for an in-progress execution to finish
/// (spec §4.5/§6 `cancel_work`, as distinct from [`cancel_sync`]). Clears a
/// pending timer or worklist entry synchronously; if the item is already
/// executing, returns `false` immediately and lets that execution run to
/// completion. Returns `true` iff this call itself prevented an execution
/// that would otherwise have happened.
pub fn cancel_async(work: &Work) -> bool {
    crate::timer::cancel_delayed(work.id());
    let snap = work.snapshot();
    if !snap.is_pending() {
        return false;
    }
    let binding_id = snap.id();
    let Some(binding) = registry::lookup_binding(binding_id) else {
        return false;
    };
    if binding.remove_queued(work.id()).is_some() {
        work.mark_idle_and_canceling(binding.pool.id);
        work.clear_to_idle(binding.pool.id);
        return true;
    }
    false
}

fn wait_until_settled(work: &Work) {
    while work.snapshot().is_pending() {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Poll until `work` is no longer in `pool`'s busy hash — i.e. until
/// `Pool::run_one` has actually returned from calling it. Unlike
/// [`wait_until_settled`], this does not rely on `is_pending()`, which is
/// already `false` for the entire time an item is running.
fn wait_until_not_running(work: &Work, pool: &std::sync::Arc<Pool>) {
    while pool.busy_worker_for(work.id()).is_some() {
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceling_an_idle_item_reports_not_pending() {
        let w = Work::new(|| {});
        assert_eq!(cancel_sync(&w), CancelOutcome::NotPending);
        assert!(!w.snapshot().is_pending());
        assert!(!w.snapshot().is_canceling());
    }
}
