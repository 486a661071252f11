//! The flush-color protocol (spec §4.4 "Flush Color Protocol").
//!
//! Simplified relative to the kernel's `flush_workqueue`: this
//! implementation coalesces concurrent flushers into monotonically
//! increasing rounds rather than maintaining a separate overflow list.
//! A flusher that arrives while a round is already in progress just waits
//! for it, rather than arming a new one — but that in-progress round's
//! target color was decided when it armed, which may be earlier than the
//! color current at this later call's own start. `workqueue::flush_wq` is
//! what actually makes "wait for an in-progress round" sound: it loops on
//! each binding's `epoch` (see `binding.rs`) and re-runs this coordinator
//! for another round whenever the one it just waited on didn't rotate
//! every binding past the generation this call needed covered.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::registry;
use crate::work::{NO_POOL, Work};

/// Block until `work`'s current submission completes (spec §4.5
/// `flush_work`). Returns `false` if `work` was neither queued nor
/// executing at the time of the call — there was nothing to wait on.
///
/// Implemented by splicing a self-completing barrier work item immediately
/// after `work` wherever it currently lives (a binding's worklist/inactive
/// position, or the `scheduled` list of the worker currently running it)
/// and waiting on the barrier's own completion.
pub fn flush_work(work: &Work) -> bool {
    let done = Arc::new((Mutex::new(false), Condvar::new()));
    let done2 = done.clone();
    let barrier = Work::new(move || {
        let (lock, cvar) = &*done2;
        *lock.lock() = true;
        cvar.notify_all();
    });

    if !splice_barrier_for(work, barrier) {
        return false;
    }

    let (lock, cvar) = &*done;
    let mut g = lock.lock();
    cvar.wait_while(&mut g, |done| !*done);
    true
}

/// Find `work`'s current owner (binding, if still pending; or the worker
/// executing it, if not) and splice `barrier` in immediately after it.
fn splice_barrier_for(work: &Work, barrier: Work) -> bool {
    let snap = work.snapshot();
    let (binding_id, color) = if snap.is_pending() {
        (snap.id(), snap.color())
    } else {
        let pool_id = snap.id();
        if pool_id == NO_POOL {
            return false;
        }
        let Some(pool) = registry::lookup_pool(pool_id) else {
            return false;
        };
        let Some(worker) = pool.busy_worker_for(work.id()) else {
            return false;
        };
        let g = worker.current.lock();
        match g.as_ref() {
            Some(c) if c.work.id() == work.id() => (c.binding_id, c.color),
            _ => return false,
        }
    };
    let Some(binding) = registry::lookup_binding(binding_id) else {
        return false;
    };
    binding.splice_barrier(work.id(), barrier, color)
}

pub(crate) struct FlushState {
    in_progress: bool,
    round: u64,
    completed_round: u64,
    target_color: u8,
    remaining: u32,
}

impl Default for FlushState {
    fn default() -> Self {
        FlushState {
            in_progress: false,
            round: 0,
            completed_round: 0,
            target_color: 0,
            remaining: 0,
        }
    }
}

/// Shared flush coordination state for one workqueue.
pub(crate) struct Flush {
    state: Mutex<FlushState>,
    done: Condvar,
}

impl Flush {
    pub fn new() -> Self {
        Flush {
            state: Mutex::new(FlushState::default()),
            done: Condvar::new(),
        }
    }

    /// Block until every work item enqueued on `advance` (the workqueue's
    /// per-binding color advance callback) before this call has completed.
    /// `advance` is invoked at most once per round, and returns the total
    /// number of bindings that still have in-flight work of the drained
    /// color.
    pub fn flush<F>(&self, advance: F)
    where
        F: FnOnce() -> u32,
    {
        let my_round = {
            let mut g = self.state.lock();
            let should_arm = !g.in_progress;
            // A flusher arriving while a round is already in flight just
            // waits for *that* round — it is never the one to pick the
            // next round number, since nothing else will ever arm it.
            let my_round = if should_arm { g.round + 1 } else { g.round };
            if should_arm {
                g.in_progress = true;
                g.round = my_round;
            }
            drop(g);
            if should_arm {
                let remaining = advance();
                let mut g = self.state.lock();
                g.remaining = remaining;
                if remaining == 0 {
                    g.in_progress = false;
                    g.completed_round = my_round;
                    self.done.notify_all();
                }
            }
            my_round
        };
        let mut g = self.state.lock();
        self.done
            .wait_while(&mut g, |s| s.completed_round < my_round);
    }

    /// Called once per binding that was counted in `remaining` when its
    /// in-flight count for the current target color reaches zero.
    pub fn binding_drained(&self) {
        let mut g = self.state.lock();
        if !g.in_progress || g.remaining == 0 {
            return;
        }
        g.remaining -= 1;
        if g.remaining == 0 {
            g.in_progress = false;
            g.completed_round = g.round;
            self.done.notify_all();
        }
    }

    pub fn target_color(&self) -> u8 {
        self.state.lock().target_color
    }

    pub fn set_target_color(&self, color: u8) {
        self.state.lock().target_color = color;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn flush_with_nothing_in_flight_returns_immediately() {
        let f = Flush::new();
        f.flush(|| 0);
    }

    #[test]
    fn flush_waits_for_binding_drained() {
        let f = Arc::new(Flush::new());
        let f2 = f.clone();
        let started = Arc::new(AtomicU32::new(0));
        let s2 = started.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            s2.store(1, Ordering::SeqCst);
            f2.binding_drained();
        });
        f.flush(|| 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);
        handle.join().unwrap();
    }
}
