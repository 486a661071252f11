//! Delayed work (spec §4.3 `queue_delayed_work` / `mod_delayed_work`).
//!
//! Workers themselves are plain OS threads (spec §5), so delayed enqueue
//! is the one place this crate leans on `tokio`: a single background
//! multi-thread runtime owns the timer wheel, and its only job is to call
//! back into [`crate::workqueue::Workqueue::enqueue`] once a delay elapses.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::work::{Work, WorkId};
use crate::workqueue::Workqueue;

static TIMER_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("workloom-timer")
        .enable_time()
        .build()
        .expect("failed to start the delayed-work timer runtime")
});

static PENDING: Lazy<DashMap<WorkId, tokio::task::AbortHandle>> = Lazy::new(DashMap::new);

/// Arm a one-shot timer that enqueues `work` onto `wq` after `delay`
/// (spec §4.3 `queue_delayed_work`). If a timer for this exact work item
/// is already pending it is left alone — callers wanting replace semantics
/// should use [`mod_delayed`].
pub(crate) fn schedule(wq: Arc<Workqueue>, work: Work, delay: Duration) {
    let work_id = work.id();
    let handle = TIMER_RUNTIME.spawn(async move {
        tokio::time::sleep(delay).await;
        PENDING.remove(&work_id);
        let _ = wq.enqueue(work);
    });
    PENDING.insert(work_id, handle.abort_handle());
}

/// Cancel any pending timer for `work` and arm a fresh one (spec §4.3
/// `mod_delayed_work`: "modifies the timer of a delayed work item").
/// Returns `true` if a previously pending timer was replaced.
pub fn mod_delayed(wq: Arc<Workqueue>, work: Work, delay: Duration) -> bool {
    let replaced = cancel_delayed(work.id());
    schedule(wq, work, delay);
    replaced
}

/// Cancel a pending timer without rescheduling (spec §4.5 cancel path for
/// delayed work still waiting on its timer). Returns `true` if a timer was
/// actually pending.
pub fn cancel_delayed(work_id: WorkId) -> bool {
    if let Some((_, handle)) = PENDING.remove(&work_id) {
        handle.abort();
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_delayed_reports_whether_a_timer_was_pending() {
        assert!(!cancel_delayed(0xdead_beef));
    }
}
