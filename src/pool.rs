//! The worker pool (spec §3 "Worker Pool", §4.2 "Worker Pool Management").
//!
//! A fingerprinted, refcounted collection of workers plus a FIFO worklist,
//! LIFO idle list, busy index, and the `nr_running` concurrency-management
//! counter. Per-CPU pools are created once at [`crate::registry`]
//! start-up; unbound pools are created on demand and reference-counted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::binding::Binding;
use crate::config::{self, PoolAttrs};
use crate::cpu;
use crate::work::{Work, WorkId};
use crate::worker::{self, CurrentWork, Worker, flag};

/// A work item queued on a pool's worklist, carrying just enough context
/// (which binding it belongs to, and its flush color) for the executor to
/// account completion with the right binding (spec §4.3).
pub(crate) struct QueuedWork {
    pub work: Work,
    pub binding_id: u32,
    pub color: u8,
    /// `false` for barrier work items (spec §4.4/§4.5: barriers carry
    /// INACTIVE and never consume `nr_active`).
    pub counts_active: bool,
}

struct PoolInner {
    worklist: VecDeque<QueuedWork>,
    idle_list: VecDeque<Arc<Worker>>,
    busy: HashMap<WorkId, Arc<Worker>>,
    nr_workers: u32,
    nr_running: u32,
    manager_active: bool,
    disassociated: bool,
    next_worker_id: u64,
    /// Bindings that draw workers from this pool, for mayday fan-out
    /// (spec §4.2 "posts a mayday on each binding whose rescuer is
    /// waiting").
    bindings: Vec<std::sync::Weak<Binding>>,
}

thread_local! {
    /// The pool/worker executing the current thread's work item, if any.
    /// Set around the call to `func` in [`Pool::run_one`] so
    /// [`yield_concurrency`] can find the right pool to release the
    /// running slot on (spec §5 host-scheduler hook substitution).
    static CURRENT: std::cell::RefCell<Option<(Arc<Pool>, Arc<Worker>)>> =
        const { std::cell::RefCell::new(None) };
}

/// A voluntarily-released concurrency-management slot (spec §5
/// `yield_concurrency`). Dropping the guard re-acquires the slot via
/// `Pool::on_wake`, mirroring the kernel's wake-up hook firing when a
/// blocked task becomes runnable again.
pub struct ConcurrencyGuard {
    pool: Arc<Pool>,
    worker: Arc<Worker>,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.pool.on_wake(&self.worker);
    }
}

/// Give up this thread's `nr_running` slot for as long as the returned
/// guard lives. Call this from within a work item immediately before a
/// call that may block (spec §5: "a work item that wants to voluntarily
/// give up its running slot while it blocks"). Returns `None` if called
/// from outside a running work item.
pub fn yield_concurrency() -> Option<ConcurrencyGuard> {
    CURRENT.with(|c| {
        let borrow = c.borrow();
        let (pool, worker) = borrow.as_ref()?;
        pool.on_sleep(worker);
        Some(ConcurrencyGuard {
            pool: pool.clone(),
            worker: worker.clone(),
        })
    })
}

/// The worker pool itself (spec §3).
pub struct Pool {
    pub id: u32,
    /// `Some(cpu)` for a per-CPU pool, `None` for unbound.
    pub cpu: Option<usize>,
    pub attrs: PoolAttrs,
    pub highpri: bool,
    inner: Mutex<PoolInner>,
    not_empty: Condvar,
    /// Unbound pools are reference-counted by the bindings that use them
    /// (spec §3 Worker Pool lifecycle); per-CPU pools never reach zero.
    pub(crate) refcnt: AtomicI64,
    /// Test-only fault injection for spec §8 scenario 5 ("Rescue under
    /// OOM"): when `> 0`, the next `n` worker-spawn attempts fail.
    inject_spawn_failures: AtomicU32,
    disassociate_requested: AtomicBool,
}

impl Pool {
    pub(crate) fn new(id: u32, cpu: Option<usize>, attrs: PoolAttrs, highpri: bool) -> Arc<Self> {
        Arc::new(Pool {
            id,
            cpu,
            attrs,
            highpri,
            inner: Mutex::new(PoolInner {
                worklist: VecDeque::new(),
                idle_list: VecDeque::new(),
                busy: HashMap::new(),
                nr_workers: 0,
                nr_running: 0,
                manager_active: false,
                disassociated: false,
                next_worker_id: 1,
                bindings: Vec::new(),
            }),
            not_empty: Condvar::new(),
            refcnt: AtomicI64::new(if cpu.is_some() { 1 } else { 0 }),
            inject_spawn_failures: AtomicU32::new(0),
            disassociate_requested: AtomicBool::new(false),
        })
    }

    pub fn is_unbound(&self) -> bool {
        self.cpu.is_none()
    }

    pub fn incref(self: &Arc<Self>) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` if this was the last reference to an unbound pool,
    /// meaning the caller should hand the pool to the registry for
    /// grace-period reclamation (spec §3 "reclaimed after a grace period
    /// when refcount hits zero").
    pub fn decref(self: &Arc<Self>) -> bool {
        self.is_unbound() && self.refcnt.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn register_binding(&self, binding: &Arc<Binding>) {
        self.inner.lock().bindings.push(Arc::downgrade(binding));
    }

    pub fn nr_workers(&self) -> u32 {
        self.inner.lock().nr_workers
    }

    pub fn nr_idle(&self) -> u32 {
        self.inner.lock().idle_list.len() as u32
    }

    pub fn nr_running(&self) -> u32 {
        self.inner.lock().nr_running
    }

    /// Invariant check used by tests and, in debug builds, by every public
    /// mutating operation (SPEC_FULL §8): `nr_workers = nr_idle +
    /// |busy_hash| + (manager ? 1 : 0)`.
    pub fn debug_assert_invariants(&self) {
        if cfg!(debug_assertions) {
            let g = self.inner.lock();
            let manager = if g.manager_active { 1 } else { 0 };
            debug_assert_eq!(
                g.nr_workers as usize,
                g.idle_list.len() + g.busy.len() + manager,
                "pool {} worker accounting violated",
                self.id
            );
        }
    }

    /// Insert `qw` onto the worklist and wake or create a worker for it.
    /// Called by [`crate::binding::Binding`] once it has decided the item
    /// is runnable (spec §4.3).
    pub(crate) fn enqueue(self: &Arc<Self>, qw: QueuedWork) {
        let mut g = self.inner.lock();
        g.worklist.push_back(qw);
        // `idle_list` membership (not a pop) is what answers "is anyone
        // idle": workers register themselves there before blocking and
        // deregister whenever they grab work, so its length is an accurate
        // idle count even though any notified worker — not necessarily the
        // one this call inspects — is the one that actually picks the item
        // up via its own `worklist.pop_front()`.
        if !g.idle_list.is_empty() {
            drop(g);
            self.not_empty.notify_all();
            trace!(pool = self.id, "woke an idle worker");
        } else {
            let need_manager = !g.manager_active;
            drop(g);
            if need_manager {
                self.spawn_worker_via_manager();
            }
        }
    }

    /// Worker-creation path used both by the on-demand manager role and by
    /// initial pool population. Spawns a genuine OS thread (spec §5:
    /// "each worker is a genuine OS thread").
    fn spawn_worker_via_manager(self: &Arc<Self>) {
        {
            let mut g = self.inner.lock();
            if g.manager_active {
                return;
            }
            g.manager_active = true;
        }
        let pool = self.clone();
        std::thread::spawn(move || pool.manager_create_loop());
    }

    fn manager_create_loop(self: Arc<Self>) {
        let deadline = Instant::now() + config::MAYDAY_INITIAL_TIMEOUT;
        let mut mayday_posted = false;
        loop {
            match self.try_spawn_one_worker() {
                Ok(()) => {}
                Err(e) => {
                    warn!(pool = self.id, error = %e, "worker creation failed, retrying");
                    if !mayday_posted && Instant::now() >= deadline {
                        self.post_mayday();
                        mayday_posted = true;
                    }
                    std::thread::sleep(config::CREATE_COOLDOWN);
                    if mayday_posted {
                        // Keep nudging the rescuer while we retry, matching
                        // MAYDAY_INTERVAL re-arming in the source (spec §4.2).
                        self.post_mayday();
                    }
                }
            }
            // Stop once demand is satisfied: either nothing left to run, or
            // an idle worker (this spawn, or one freed elsewhere) can pick
            // it up. A successful spawn still loops back through this check
            // rather than exiting unconditionally — a burst of enqueues can
            // need more than one new worker before the manager stands down.
            let g = self.inner.lock();
            if g.worklist.is_empty() || !g.idle_list.is_empty() {
                break;
            }
        }
        self.inner.lock().manager_active = false;
    }

    fn post_mayday(&self) {
        let bindings: Vec<_> = {
            let g = self.inner.lock();
            g.bindings.iter().filter_map(|w| w.upgrade()).collect()
        };
        for b in bindings {
            b.request_rescue();
        }
    }

    /// Test-only: make the next `n` worker-spawn attempts fail, to drive
    /// spec §8 scenario 5 ("Rescue under OOM").
    pub fn inject_spawn_failures(&self, n: u32) {
        self.inject_spawn_failures.store(n, Ordering::SeqCst);
    }

    fn try_spawn_one_worker(self: &Arc<Self>) -> std::io::Result<()> {
        if self
            .inject_spawn_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n - 1)
            })
            .is_ok()
        {
            return Err(std::io::Error::other("injected worker-spawn failure"));
        }
        let id = {
            let mut g = self.inner.lock();
            let id = g.next_worker_id;
            g.next_worker_id += 1;
            id
        };
        self.spawn_worker(id, false)
    }

    fn spawn_worker(self: &Arc<Self>, id: u64, is_rescuer: bool) -> std::io::Result<()> {
        let worker = Worker::new(id, self.id, is_rescuer);
        let cpu = self.cpu;
        let pool = self.clone();
        std::thread::Builder::new()
            .name(format!("pool{}/{}", self.id, id))
            .spawn(move || {
                if let Some(cpu) = cpu {
                    let _ = cpu::pin_current_thread(cpu);
                }
                worker.enter_prep();
                worker.enter_idle();
                pool.worker_loop(worker);
            })?;
        let mut g = self.inner.lock();
        g.nr_workers += 1;
        debug!(pool = self.id, worker = id, "worker spawned");
        Ok(())
    }

    /// The steady-state per-worker loop (spec §4.6: "Self-loops IDLE ->
    /// BUSY -> IDLE dominate"). A worker adds itself to `idle_list` only
    /// from inside this loop, right before it actually blocks waiting for
    /// work — never preemptively at spawn time — so membership always
    /// reflects a worker that is genuinely available, never one that is
    /// mid-startup or already dispatched.
    fn worker_loop(self: Arc<Self>, worker: Arc<Worker>) {
        loop {
            // Barriers spliced onto this worker while it was busy (spec
            // §4.5 `flush_work` targeting a running item) run before this
            // worker goes back to the shared worklist, so they observe
            // "immediately after the item they were queued behind".
            while let Some(qw) = worker.scheduled.lock().pop_front() {
                self.run_one(&worker, qw);
            }
            let qw = {
                let mut g = self.inner.lock();
                loop {
                    if worker.flags.is_set(flag::DIE) {
                        g.idle_list.retain(|w| w.id != worker.id);
                        return self.detach(&worker);
                    }
                    if let Some(qw) = g.worklist.pop_front() {
                        g.idle_list.retain(|w| w.id != worker.id);
                        break qw;
                    }
                    // Make ourselves visible to `enqueue`'s idle check
                    // before we actually block on it — otherwise a worker
                    // that already consumed its one job stays invisible to
                    // every later `enqueue` call, which would then spawn a
                    // fresh OS thread per item instead of reusing this one.
                    if !g.idle_list.iter().any(|w| w.id == worker.id) {
                        g.idle_list.push_back(worker.clone());
                    }
                    let timed_out = self
                        .not_empty
                        .wait_for(&mut g, Duration::from_millis(250))
                        .timed_out();
                    if timed_out && worker.flags.is_set(flag::DIE) {
                        g.idle_list.retain(|w| w.id != worker.id);
                        return self.detach(&worker);
                    }
                }
            };
            self.run_one(&worker, qw);
        }
    }

    /// Execute one work item end to end: busy-hash insertion, the PENDING
    /// -> Running transition and fence (spec §4.1), the call itself, and
    /// completion accounting with the owning binding (spec §4.3).
    pub(crate) fn run_one(self: &Arc<Self>, worker: &Arc<Worker>, qw: QueuedWork) {
        let work_id = qw.work.id();
        worker.enter_busy(CurrentWork {
            work: qw.work.clone(),
            binding_id: qw.binding_id,
            color: qw.color,
            started_at: Instant::now(),
        });
        {
            let mut g = self.inner.lock();
            g.busy.insert(work_id, worker.clone());
            // Gated the same way the completion-side decrement below is
            // gated: a worker carrying any NOT_RUNNING flag (the rescuer
            // keeps PREP forever, spec §4.3) must never move
            // `nr_running`, in either direction.
            if worker.counts_toward_running() {
                g.nr_running += 1;
            }
        }
        let prev = qw.work.begin_execute(self.id);
        debug_assert!(prev.is_pending());
        CURRENT.with(|c| *c.borrow_mut() = Some((self.clone(), worker.clone())));
        qw.work.call();
        CURRENT.with(|c| *c.borrow_mut() = None);
        {
            let mut g = self.inner.lock();
            g.busy.remove(&work_id);
            if worker.counts_toward_running() {
                g.nr_running = g.nr_running.saturating_sub(1);
            }
        }
        worker.finish_busy();
        if let Some(binding) = crate::registry::lookup_binding(qw.binding_id) {
            binding.on_work_complete(qw.color, work_id, qw.counts_active);
        }
    }

    fn detach(&self, worker: &Arc<Worker>) {
        let mut g = self.inner.lock();
        g.nr_workers = g.nr_workers.saturating_sub(1);
        g.idle_list.retain(|w| w.id != worker.id);
        debug!(pool = self.id, worker = worker.id, "worker detached");
    }

    /// `on_sleep` host-scheduler hook (spec §4.2): a busy worker is about
    /// to block. If the worklist is nonempty and this was the last
    /// runnable worker, wake one idle worker.
    pub(crate) fn on_sleep(self: &Arc<Self>, worker: &Worker) {
        let mut g = self.inner.lock();
        if worker.counts_toward_running() {
            g.nr_running = g.nr_running.saturating_sub(1);
        }
        let should_wake = !g.worklist.is_empty() && g.nr_running == 0 && !g.idle_list.is_empty();
        drop(g);
        if should_wake {
            self.not_empty.notify_all();
        }
    }

    /// `on_wake` host-scheduler hook (spec §4.2).
    pub(crate) fn on_wake(&self, worker: &Worker) {
        let mut g = self.inner.lock();
        if !worker.flags.not_running() {
            g.nr_running += 1;
        }
    }

    /// `on_tick` host-scheduler hook (spec §4.2), driven here by a
    /// sampling thread rather than a real preemption callback (SPEC_FULL
    /// §5). Marks the first worker whose current item has run past the
    /// CPU-intensive threshold and, per spec §4.2, immediately decrements
    /// `nr_running` for it the same way blocking would.
    pub(crate) fn sample_cpu_intensive(self: &Arc<Self>, thresh: Duration) {
        let hit = {
            let g = self.inner.lock();
            g.busy.values().find_map(|worker| {
                let started = worker.current.lock().as_ref().map(|c| c.started_at)?;
                (started.elapsed() > thresh && !worker.flags.is_set(flag::CPU_INTENSIVE))
                    .then(|| worker.clone())
            })
        };
        if let Some(worker) = hit {
            worker.flags.set(flag::CPU_INTENSIVE);
            self.decrement_running_for_cpu_intensive();
        }
    }

    pub(crate) fn decrement_running_for_cpu_intensive(self: &Arc<Self>) {
        let mut g = self.inner.lock();
        g.nr_running = g.nr_running.saturating_sub(1);
        let should_wake = !g.worklist.is_empty() && !g.idle_list.is_empty();
        drop(g);
        if should_wake {
            self.not_empty.notify_all();
        }
    }

    pub(crate) fn busy_worker_for(&self, work_id: WorkId) -> Option<Arc<Worker>> {
        self.inner.lock().busy.get(&work_id).cloned()
    }

    /// Non-reentrancy redirect (spec §4.3): if a worker on this pool is
    /// currently executing `qw.work`, hand `qw` directly to that worker's
    /// own `scheduled` list instead of the shared worklist, where any other
    /// idle worker could grab it and run it concurrently with itself.
    /// Returns `qw` back if no such worker is found, so the caller can fall
    /// through to a normal enqueue.
    pub(crate) fn redirect_to_busy_worker(&self, qw: QueuedWork) -> Option<QueuedWork> {
        let worker = self.inner.lock().busy.get(&qw.work.id()).cloned();
        match worker {
            Some(worker) => {
                worker.scheduled.lock().push_back(qw);
                None
            }
            None => Some(qw),
        }
    }

    /// Remove a still-queued item from the worklist (cancel's
    /// "stolen-from-queue" path, spec §4.5).
    pub(crate) fn remove_from_worklist(&self, work_id: WorkId) -> Option<QueuedWork> {
        let mut g = self.inner.lock();
        if let Some(pos) = g.worklist.iter().position(|qw| qw.work.id() == work_id) {
            g.worklist.remove(pos)
        } else {
            None
        }
    }

    /// Pull every worklist item belonging to `binding_id` off the worklist
    /// for the rescuer to run directly (spec §4.3 `assign_work`). Items
    /// already claimed by a normal worker (tracked in `busy` instead of
    /// the worklist) are left alone.
    pub(crate) fn drain_worklist_for_binding(&self, binding_id: u32) -> Vec<QueuedWork> {
        let mut g = self.inner.lock();
        let (mine, rest): (VecDeque<QueuedWork>, VecDeque<QueuedWork>) =
            g.worklist.drain(..).partition(|qw| qw.binding_id == binding_id);
        g.worklist = rest;
        mine.into_iter().collect()
    }

    /// Splice a barrier work item immediately after `target` in the
    /// worklist if it is still queued there; otherwise, if `target` is
    /// executing, push the barrier to the front of that worker's
    /// `scheduled` list (spec §4.5 `flush_work`).
    pub(crate) fn splice_barrier_after(&self, target: WorkId, barrier: QueuedWork) -> bool {
        let mut g = self.inner.lock();
        if let Some(pos) = g.worklist.iter().position(|qw| qw.work.id() == target) {
            g.worklist.insert(pos + 1, barrier);
            return true;
        }
        if let Some(worker) = g.busy.get(&target).cloned() {
            drop(g);
            worker.scheduled.lock().push_front(barrier);
            return true;
        }
        false
    }

    /// Idle-cull timer (spec §4.2): fires whenever `nr_idle - 2 >
    /// nr_busy/4`, then marks the oldest idle workers `DIE` if they have
    /// exceeded [`config::IDLE_WORKER_TIMEOUT`].
    pub(crate) fn cull_idle_workers(&self) {
        let g = self.inner.lock();
        let nr_idle = g.idle_list.len() as i64;
        let nr_busy = g.busy.len() as i64;
        if nr_idle - 2 <= nr_busy / 4 {
            return;
        }
        for worker in g.idle_list.iter() {
            if worker.idle_for() > config::IDLE_WORKER_TIMEOUT {
                worker.mark_die();
            }
        }
        drop(g);
        self.not_empty.notify_all();
    }

    /// CPU hot-unplug (spec §4.2): mark the pool DISASSOCIATED, flip every
    /// worker to UNBOUND, and zero `nr_running` so it behaves as unbound
    /// until re-association.
    pub fn disassociate(&self) {
        let mut g = self.inner.lock();
        g.disassociated = true;
        g.nr_running = 0;
        for w in g.idle_list.iter() {
            w.flags.set(flag::UNBOUND);
        }
        for w in g.busy.values() {
            w.flags.set(flag::UNBOUND);
        }
    }

    /// CPU re-association (spec §4.2): re-pin workers, flip UNBOUND ->
    /// REBOUND atomically, clear DISASSOCIATED.
    pub fn reassociate(&self) {
        let mut g = self.inner.lock();
        g.disassociated = false;
        for w in g.idle_list.iter() {
            w.flags.swap_flags(flag::UNBOUND, flag::REBOUND);
        }
        for w in g.busy.values() {
            w.flags.swap_flags(flag::UNBOUND, flag::REBOUND);
        }
    }

    pub fn is_disassociated(&self) -> bool {
        self.inner.lock().disassociated
    }

    /// Start this pool's `on_tick` sampler and idle-cull timer (SPEC_FULL
    /// §5: "one lightweight per-pool background thread"). Both loop on a
    /// [`Weak`] reference and exit once the pool itself is reclaimed, so
    /// they never keep an unbound pool alive past its refcount draining to
    /// zero.
    pub(crate) fn spawn_background_threads(self: &Arc<Self>, cpu_intensive_thresh: Duration) {
        let tick_weak = Arc::downgrade(self);
        std::thread::Builder::new()
            .name(format!("pool{}/tick", self.id))
            .spawn(move || {
                let interval = (cpu_intensive_thresh / 4).max(Duration::from_millis(1));
                loop {
                    std::thread::sleep(interval);
                    let Some(pool) = tick_weak.upgrade() else {
                        break;
                    };
                    pool.sample_cpu_intensive(cpu_intensive_thresh);
                }
            })
            .expect("tick sampler thread spawn must not fail");

        let cull_weak = Arc::downgrade(self);
        std::thread::Builder::new()
            .name(format!("pool{}/cull", self.id))
            .spawn(move || {
                loop {
                    std::thread::sleep(Duration::from_secs(30));
                    let Some(pool) = cull_weak.upgrade() else {
                        break;
                    };
                    pool.cull_idle_workers();
                }
            })
            .expect("idle-cull thread spawn must not fail");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolAttrs;

    fn make_pool() -> Arc<Pool> {
        Pool::new(1, None, PoolAttrs::default(), false)
    }

    #[test]
    fn fresh_pool_has_no_workers() {
        let p = make_pool();
        assert_eq!(p.nr_workers(), 0);
        p.debug_assert_invariants();
    }

    #[test]
    fn enqueue_spawns_a_worker_when_none_idle() {
        let p = make_pool();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let d = done.clone();
        let work = Work::new(move || {
            d.store(true, Ordering::SeqCst);
        });
        p.enqueue(QueuedWork {
            work: work.clone(),
            binding_id: 0,
            color: 0,
            counts_active: true,
        });
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(done.load(Ordering::SeqCst));
    }
}
