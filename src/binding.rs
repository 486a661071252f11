//! The pool-binding (spec §3 "Pool-Binding", §4.3 "Pool-Binding Flow
//! Control"). Called `pool_workqueue` in the kernel source this spec is
//! modeled on (GLOSSARY "Binding"): the link between one workqueue and one
//! pool for a given affinity key, carrying the per-queue flow control that
//! the pool itself knows nothing about.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::NR_COLORS;
use crate::pool::{Pool, QueuedWork};
use crate::work::{ClaimError, Work, WorkId};
use crate::workqueue::Workqueue;

struct BindingInner {
    work_color: u8,
    /// Monotonic generation counter bumped alongside `work_color` every
    /// rotation (spec §4.4). Unlike `work_color`, this never wraps, so
    /// `flush_wq` can tell whether a round it joined actually covers the
    /// color that was current when it was called, rather than a stale one
    /// from before `work_color` wrapped back around.
    epoch: u64,
    nr_in_flight: [u32; NR_COLORS as usize],
    nr_active: u32,
    max_active: u32,
    inactive_works: VecDeque<(Work, u8)>,
    /// Target color this binding is currently being asked to drain to 0,
    /// set by the flush protocol (spec §4.4); `None` when not flushing.
    flush_target: Option<u8>,
}

/// A per-(workqueue, affinity-key) binding (spec §3).
pub struct Binding {
    pub id: u32,
    pub wq_id: u32,
    pub pool: Arc<Pool>,
    wq: Weak<Workqueue>,
    inner: Mutex<BindingInner>,
    refcnt: AtomicI64,
    mayday_posted: std::sync::atomic::AtomicBool,
}

impl Binding {
    pub(crate) fn new(id: u32, wq_id: u32, wq: Weak<Workqueue>, pool: Arc<Pool>, max_active: u32) -> Arc<Self> {
        let binding = Arc::new(Binding {
            id,
            wq_id,
            pool: pool.clone(),
            wq,
            inner: Mutex::new(BindingInner {
                work_color: 0,
                epoch: 0,
                nr_in_flight: [0; NR_COLORS as usize],
                nr_active: 0,
                max_active,
                inactive_works: VecDeque::new(),
                flush_target: None,
            }),
            refcnt: AtomicI64::new(1),
            mayday_posted: std::sync::atomic::AtomicBool::new(false),
        });
        pool.register_binding(&binding);
        binding
    }

    pub fn incref(self: &Arc<Self>) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decref(self: &Arc<Self>) -> bool {
        self.refcnt.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn work_color(&self) -> u8 {
        self.inner.lock().work_color
    }

    /// Current generation counter (see [`BindingInner::epoch`]).
    pub(crate) fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn nr_active(&self) -> u32 {
        self.inner.lock().nr_active
    }

    pub fn nr_inactive(&self) -> u32 {
        self.inner.lock().inactive_works.len() as u32
    }

    pub fn nr_in_flight(&self, color: u8) -> u32 {
        self.inner.lock().nr_in_flight[color as usize]
    }

    /// Quantified invariant from spec §8: `sum_i nr_in_flight[i] ==
    /// nr_active + |inactive_works| + |barriers belonging to binding|`.
    /// Barriers are tracked as ordinary inactive-counted entries here (they
    /// live in `nr_in_flight` but never in `inactive_works` or on the pool
    /// worklist as "active"), so in this implementation the simplified
    /// form `sum_i nr_in_flight[i] >= nr_active + |inactive_works|` holds
    /// with equality once no barrier is mid-flight.
    pub fn debug_assert_invariants(&self) {
        if cfg!(debug_assertions) {
            let g = self.inner.lock();
            let total_in_flight: u32 = g.nr_in_flight.iter().sum();
            debug_assert!(
                total_in_flight >= g.nr_active + g.inactive_works.len() as u32,
                "binding {} in-flight accounting violated",
                self.id
            );
            debug_assert!(g.nr_active <= g.max_active, "binding {} over max_active", self.id);
        }
    }

    /// Submit `work` through this binding (spec §4.3 "On enqueue").
    /// Returns `Ok(true)` if this call claimed the item, `Ok(false)` if it
    /// was already pending, `Err` if it is mid-cancel.
    pub fn try_enqueue(self: &Arc<Self>, work: Work) -> crate::error::Result<bool> {
        let color = {
            let g = self.inner.lock();
            g.work_color
        };
        let claim = work.try_claim_for_enqueue(self.id, color, false);
        let last_pool = match claim {
            Ok(last_pool) => last_pool,
            Err(ClaimError::AlreadyPending) => return Ok(false),
            Err(ClaimError::Canceling) => return Err(crate::error::Error::Canceling),
        };

        // Non-reentrancy (spec §4.3): if a worker anywhere is still
        // executing this exact item — whether on a different pool or this
        // same one — redirect this enqueue onto that worker's own
        // `scheduled` list rather than a shared worklist, where any other
        // idle worker could grab it and run it concurrently with itself.
        // `last_pool == self.pool.id` is not special-cased: a still-running
        // item being re-submitted through its own binding needs exactly
        // the same redirect as one coming back through a different pool.
        let redirect_pool = if last_pool != crate::work::NO_POOL {
            crate::registry::lookup_pool(last_pool)
        } else {
            None
        };

        let mut g = self.inner.lock();
        g.nr_in_flight[color as usize] += 1;
        let inactive = g.nr_active >= g.max_active;
        if inactive {
            work.set_linked(false);
            g.inactive_works.push_back((work.clone(), color));
            drop(g);
            trace!(binding = self.id, work = work.id(), "queued inactive");
        } else {
            g.nr_active += 1;
            drop(g);
            let qw = QueuedWork {
                work: work.clone(),
                binding_id: self.id,
                color,
                counts_active: true,
            };
            let leftover = match redirect_pool {
                Some(pool) => pool.redirect_to_busy_worker(qw),
                None => Some(qw),
            };
            if let Some(qw) = leftover {
                self.pool.enqueue(qw);
            }
        }
        Ok(true)
    }

    /// Completion accounting (spec §4.3 "On completion"): decrement
    /// `nr_in_flight`, and if the item counted toward `nr_active`,
    /// decrement it and promote one inactive item if any is waiting.
    pub(crate) fn on_work_complete(self: &Arc<Self>, color: u8, _work_id: WorkId, counts_active: bool) {
        let mut g = self.inner.lock();
        g.nr_in_flight[color as usize] = g.nr_in_flight[color as usize].saturating_sub(1);
        let promoted = if counts_active {
            g.nr_active = g.nr_active.saturating_sub(1);
            g.inactive_works.pop_front()
        } else {
            None
        };
        if promoted.is_some() {
            g.nr_active += 1;
        }
        let drained = g.flush_target == Some(color) && g.nr_in_flight[color as usize] == 0;
        drop(g);

        if let Some((work, promoted_color)) = promoted {
            let binding_id = self.id;
            self.pool.enqueue(QueuedWork {
                work,
                binding_id,
                color: promoted_color,
                counts_active: true,
            });
        }
        if drained {
            self.complete_flush_target(color);
        }
    }

    fn complete_flush_target(self: &Arc<Self>, color: u8) {
        let mut g = self.inner.lock();
        if g.flush_target == Some(color) {
            g.flush_target = None;
            drop(g);
            if let Some(wq) = self.wq.upgrade() {
                wq.binding_flush_drained(self.id);
            }
        }
    }

    /// Called by the flush protocol (spec §4.4) when `target` becomes the
    /// color every binding must drain to zero. Returns `true` if this
    /// binding still has in-flight work of that color (the workqueue
    /// should count it toward `nr_bindings_to_flush`).
    pub(crate) fn begin_flush_target(&self, target: u8) -> bool {
        let mut g = self.inner.lock();
        if g.nr_in_flight[target as usize] == 0 {
            return false;
        }
        g.flush_target = Some(target);
        true
    }

    /// Advance `work_color` to the next color, returning the color that
    /// was current (the new flush target, spec §4.4).
    pub(crate) fn advance_work_color(&self) -> u8 {
        let mut g = self.inner.lock();
        let current = g.work_color;
        g.work_color = (g.work_color + 1) % NR_COLORS;
        g.epoch += 1;
        current
    }

    /// Insert a barrier work item immediately after `after` (spec §4.5
    /// `flush_work`). The barrier carries INACTIVE and the target's color,
    /// and counts in `nr_in_flight` like any other work item. The barrier
    /// is claimed through the normal PENDING protocol first so the
    /// executor's `begin_execute` fence and completion accounting treat it
    /// exactly like a real enqueue.
    pub(crate) fn splice_barrier(self: &Arc<Self>, after: WorkId, barrier: Work, color: u8) -> bool {
        if barrier.try_claim_for_enqueue(self.id, color, false).is_err() {
            return false;
        }
        let ok = self.pool.splice_barrier_after(
            after,
            QueuedWork {
                work: barrier.clone(),
                binding_id: self.id,
                color,
                counts_active: false,
            },
        );
        if ok {
            let mut g = self.inner.lock();
            g.nr_in_flight[color as usize] += 1;
        } else {
            // The target vanished between the caller's lookup and this
            // splice attempt (e.g. it just finished); release our claim.
            barrier.clear_to_idle(crate::work::NO_POOL);
        }
        ok
    }

    /// Remove `work` from this binding's tracking if it is still queued
    /// (either on the pool worklist or inactive) — the cancel path's
    /// "stolen-from-queue" case (spec §4.5). Returns the work's color if
    /// removed.
    pub(crate) fn remove_queued(self: &Arc<Self>, work_id: WorkId) -> Option<u8> {
        if let Some(qw) = self.pool.remove_from_worklist(work_id) {
            let promoted = {
                let mut g = self.inner.lock();
                g.nr_in_flight[qw.color as usize] = g.nr_in_flight[qw.color as usize].saturating_sub(1);
                g.nr_active = g.nr_active.saturating_sub(1);
                let promoted = g.inactive_works.pop_front();
                if promoted.is_some() {
                    g.nr_active += 1;
                }
                promoted
            };
            if let Some((work, color)) = promoted {
                self.pool.enqueue(QueuedWork {
                    work,
                    binding_id: self.id,
                    color,
                    counts_active: true,
                });
            }
            return Some(qw.color);
        }
        let mut g = self.inner.lock();
        if let Some(pos) = g.inactive_works.iter().position(|(w, _)| w.id() == work_id) {
            let (_, color) = g.inactive_works.remove(pos).unwrap();
            g.nr_in_flight[color as usize] = g.nr_in_flight[color as usize].saturating_sub(1);
            return Some(color);
        }
        None
    }

    pub(crate) fn request_rescue(self: &Arc<Self>) {
        if let Some(wq) = self.wq.upgrade() {
            if wq.flags().mem_reclaim {
                if !self.mayday_posted.swap(true, Ordering::AcqRel) {
                    wq.post_mayday(self.clone());
                }
            }
        }
    }

    pub(crate) fn clear_mayday(&self) {
        self.mayday_posted.store(false, Ordering::Release);
    }

    /// Pull every worklist item belonging to this binding off the pool's
    /// worklist for the rescuer to run (spec §4.3 `assign_work`). Items
    /// already picked up by a normal worker (found via `busy_hash`
    /// instead) are left alone — they're already making progress.
    pub(crate) fn take_work_for_rescue(self: &Arc<Self>) -> Vec<QueuedWork> {
        self.pool.drain_worklist_for_binding(self.id)
    }
}

impl Drop for Binding {
    /// Release this binding's one pool reference (spec §3 Pool-Binding
    /// "a binding holds one pool reference"). Per-CPU pools ignore the
    /// decref (their refcount never reaches zero); unbound pools are handed
    /// to the registry for reclamation once the last binding referencing
    /// their fingerprint is gone (spec §3 Worker Pool lifecycle).
    fn drop(&mut self) {
        if self.pool.is_unbound() {
            crate::registry::release_unbound_pool(&self.pool);
        }
    }
}
