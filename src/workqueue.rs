//! The workqueue (spec §3 "Workqueue", §4.3 "Pool-Binding Flow Control",
//! §4.4 "Flush Color Protocol"). The unit callers actually submit work
//! through: a name, a set of flags, and one [`crate::binding::Binding`] per
//! CPU (or a single shared one for unbound/ordered queues).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::binding::Binding;
use crate::config::{PoolAttrs, WqConfig, WqFlags};
use crate::cpu;
use crate::error::{Error, Result};
use crate::flush::Flush;
use crate::registry;
use crate::rescuer::Rescuer;
use crate::work::Work;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum BindingKey {
    Cpu(usize),
    Unbound,
}

struct Maydays {
    queue: Mutex<VecDeque<Arc<Binding>>>,
    posted: Condvar,
}

impl Maydays {
    fn new() -> Self {
        Maydays {
            queue: Mutex::new(VecDeque::new()),
            posted: Condvar::new(),
        }
    }

    fn post(&self, binding: Arc<Binding>) {
        let mut g = self.queue.lock();
        g.push_back(binding);
        self.posted.notify_one();
    }

    fn wait(&self, timeout: Duration) -> Option<Arc<Binding>> {
        let mut g = self.queue.lock();
        if g.is_empty() {
            let result = self.posted.wait_for(&mut g, timeout);
            if result.timed_out() {
                return None;
            }
        }
        g.pop_front()
    }
}

/// A workqueue (spec §3): the caller-facing submission point. Holds one
/// binding per CPU for a bound queue, or a single shared binding for an
/// unbound/ordered one.
pub struct Workqueue {
    pub id: u32,
    pub config: WqConfig,
    bindings: DashMap<BindingKey, Arc<Binding>>,
    flush: Flush,
    maydays: Maydays,
    rescuer: Mutex<Option<Arc<Rescuer>>>,
    /// Set by [`destroy_wq`] before draining (spec §6: "the workqueue has
    /// been destroyed and no longer accepts submissions"). Checked by every
    /// enqueue path so a submitter racing a concurrent `destroy_wq` gets a
    /// clean error instead of landing work on a queue mid-teardown.
    destroyed: AtomicBool,
}

impl Workqueue {
    pub(crate) fn alloc(config: WqConfig) -> Result<Arc<Self>> {
        if config.flags.unbound && config.flags.sysfs && config.name.is_empty() {
            return Err(Error::InvalidAttrs("workqueue name must not be empty".into()));
        }
        let id = registry::next_wq_id();
        let wq = Arc::new(Workqueue {
            id,
            config,
            bindings: DashMap::new(),
            flush: Flush::new(),
            maydays: Maydays::new(),
            rescuer: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        registry::register_workqueue(wq.clone());
        if wq.config.flags.mem_reclaim {
            *wq.rescuer.lock() = Some(Rescuer::spawn(id));
            info!(wq = wq.config.name, "rescuer attached (WQ_MEM_RECLAIM)");
        }
        debug!(wq = wq.config.name, flags = ?wq.config.flags, "workqueue allocated");
        Ok(wq)
    }

    pub fn flags(&self) -> WqFlags {
        self.config.flags
    }

    fn binding_for_key(self: &Arc<Self>, key: BindingKey) -> Arc<Binding> {
        if let Some(b) = self.bindings.get(&key) {
            return b.value().clone();
        }
        let pool = match key {
            BindingKey::Unbound => registry::unbound_pool(PoolAttrs::default(), self.config.flags.highpri),
            BindingKey::Cpu(cpu) => registry::standard_pool(cpu, self.config.flags.highpri),
        };
        let binding_id = registry::next_binding_id();
        let binding = Binding::new(
            binding_id,
            self.id,
            Arc::downgrade(self),
            pool,
            self.config.max_active,
        );
        registry::register_binding(binding.clone());
        self.bindings
            .entry(key)
            .or_insert_with(|| binding.clone());
        self.bindings.get(&key).unwrap().value().clone()
    }

    fn binding_for_enqueue(self: &Arc<Self>) -> Arc<Binding> {
        if self.config.flags.unbound || self.config.flags.ordered {
            self.binding_for_key(BindingKey::Unbound)
        } else {
            self.binding_for_key(BindingKey::Cpu(cpu::current_cpu_hint()))
        }
    }

    fn check_not_destroyed(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::Destroyed);
        }
        Ok(())
    }

    /// Submit `work`, letting the queue pick the binding (spec §4.3 `queue_work`).
    pub fn enqueue(self: &Arc<Self>, work: Work) -> Result<bool> {
        self.check_not_destroyed()?;
        self.binding_for_enqueue().try_enqueue(work)
    }

    /// Submit `work` pinned to a specific CPU's binding (spec §4.3
    /// `queue_work_on`), regardless of the workqueue's own unbound-ness —
    /// the caller is asserting it knows better.
    pub fn enqueue_on(self: &Arc<Self>, cpu: usize, work: Work) -> Result<bool> {
        self.check_not_destroyed()?;
        self.binding_for_key(BindingKey::Cpu(cpu)).try_enqueue(work)
    }

    /// Submit `work` after `delay` elapses (spec §4.3 `queue_delayed_work`),
    /// driven by [`crate::timer`]. A no-op once this queue has been
    /// destroyed — matches `enqueue`/`enqueue_on` refusing submissions past
    /// that point (spec §6).
    pub fn enqueue_after(self: &Arc<Self>, delay: Duration, work: Work) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        crate::timer::schedule(self.clone(), work, delay);
    }

    pub(crate) fn post_mayday(&self, binding: Arc<Binding>) {
        self.maydays.post(binding);
    }

    pub(crate) fn wait_for_mayday(&self, timeout: Duration) -> Option<Arc<Binding>> {
        self.maydays.wait(timeout)
    }

    /// Block until every work item enqueued on this workqueue before this
    /// call returns has completed (spec §4.4 `flush_workqueue`).
    pub fn flush_wq(self: &Arc<Self>) {
        loop {
            let bindings: Vec<Arc<Binding>> =
                self.bindings.iter().map(|e| e.value().clone()).collect();
            // Snapshot the generation every binding must rotate past for
            // this call to cover everything enqueued strictly before it
            // (spec §4.4). A round armed by someone else before this
            // snapshot already covers it; one armed earlier — whose target
            // color we'd just coalesce onto — does not, since work
            // enqueued between that round's arming and this call already
            // picked up the rotated color it is not waiting on.
            let needed: Vec<u64> = bindings.iter().map(|b| b.epoch()).collect();
            self.flush.flush(|| {
                let mut remaining = 0;
                for binding in &bindings {
                    let target = binding.advance_work_color();
                    if binding.begin_flush_target(target) {
                        remaining += 1;
                    }
                }
                remaining
            });
            let covered = bindings
                .iter()
                .zip(&needed)
                .all(|(b, &needed_epoch)| b.epoch() > needed_epoch);
            if covered {
                break;
            }
        }
    }

    pub(crate) fn binding_flush_drained(&self, _binding_id: u32) {
        self.flush.binding_drained();
    }

    /// Wait until this workqueue has zero in-flight and zero inactive work
    /// across every binding (spec §4.4 `drain_workqueue`), re-flushing as
    /// long as inactive work remains — `flush_wq` alone only guarantees the
    /// work that was active when it was called has completed.
    pub fn drain_wq(self: &Arc<Self>) {
        loop {
            self.flush_wq();
            let still_has_work = self
                .bindings
                .iter()
                .any(|e| e.value().nr_active() > 0 || e.value().nr_inactive() > 0);
            if !still_has_work {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Total `nr_active` across every binding (diagnostics/tests; spec §8
    /// scenario 1 "observe exactly 3 running, 7 inactive").
    pub fn nr_active(&self) -> u32 {
        self.bindings.iter().map(|e| e.value().nr_active()).sum()
    }

    /// Total inactive (queued-but-not-yet-runnable) work across every
    /// binding.
    pub fn nr_inactive(&self) -> u32 {
        self.bindings.iter().map(|e| e.value().nr_inactive()).sum()
    }

    pub fn debug_assert_invariants(&self) {
        if cfg!(debug_assertions) {
            for e in self.bindings.iter() {
                e.value().debug_assert_invariants();
            }
        }
    }

    /// Test-only: force this workqueue's default binding/pool to exist
    /// with zero workers yet, so a subsequent
    /// [`Workqueue::inject_worker_spawn_failures`] call reaches the pool
    /// before the first real spawn attempt happens (spec §8 scenario 5
    /// "Rescue under OOM").
    pub fn prime_binding(self: &Arc<Self>) {
        self.binding_for_enqueue();
    }

    /// Test-only fault injection (spec §8 scenario 5 "Rescue under OOM"):
    /// make the next `n` worker-spawn attempts on every pool this
    /// workqueue currently binds to fail, to exercise the mayday/rescuer
    /// escalation path without a real allocator failure.
    pub fn inject_worker_spawn_failures(&self, n: u32) {
        for e in self.bindings.iter() {
            e.value().pool.inject_spawn_failures(n);
        }
    }
}

/// Destroy a workqueue (spec §6 `destroy_wq`): drain outstanding work,
/// stop the rescuer, release binding/pool references, and drop the
/// workqueue's registry entry — the registry holds the only other strong
/// reference `alloc_wq` hands out, so removing it here is what actually
/// allows [`Workqueue`]'s `Drop` to run once this function's own `Arc`
/// clone goes out of scope.
pub fn destroy_wq(wq: Wq) {
    wq.0.destroyed.store(true, Ordering::Release);
    wq.0.drain_wq();
    registry::unregister_workqueue(wq.0.id);
}

impl Drop for Workqueue {
    fn drop(&mut self) {
        if let Some(rescuer) = self.rescuer.lock().take() {
            rescuer.stop();
        }
        for e in self.bindings.iter() {
            registry::unregister_binding(e.value().id);
        }
        registry::unregister_workqueue(self.id);
    }
}

/// The public handle to a workqueue (spec §6 crate API). Cheap to clone; a
/// thin wrapper over `Arc<Workqueue>` so callers never see the internal
/// registry plumbing.
#[derive(Clone)]
pub struct Wq(pub(crate) Arc<Workqueue>);

impl Wq {
    pub fn new(config: WqConfig) -> Result<Self> {
        Workqueue::alloc(config).map(Wq)
    }

    pub fn name(&self) -> &str {
        &self.0.config.name
    }

    pub fn submit<F>(&self, func: F) -> Result<Work>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let work = Work::new(func);
        self.0.enqueue(work.clone())?;
        Ok(work)
    }

    /// Re-submit an existing [`Work`] item, letting the queue pick the
    /// binding. Exposed alongside `submit` so callers (and tests) can
    /// re-enqueue the same item more than once, e.g. to exercise
    /// non-reentrancy redirection across bindings.
    pub fn enqueue(&self, work: Work) -> Result<bool> {
        self.0.enqueue(work)
    }

    /// Re-submit an existing [`Work`] item pinned to a specific CPU's
    /// binding (spec §4.3 `queue_work_on`).
    pub fn enqueue_on(&self, cpu: usize, work: Work) -> Result<bool> {
        self.0.enqueue_on(cpu, work)
    }

    pub fn submit_on<F>(&self, cpu: usize, func: F) -> Result<Work>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let work = Work::new(func);
        self.0.enqueue_on(cpu, work.clone())?;
        Ok(work)
    }

    pub fn submit_after<F>(&self, delay: Duration, func: F) -> Work
    where
        F: Fn() + Send + Sync + 'static,
    {
        let work = Work::new(func);
        self.0.enqueue_after(delay, work.clone());
        work
    }

    pub fn flush(&self) {
        self.0.flush_wq();
    }

    pub fn drain(&self) {
        self.0.drain_wq();
    }

    pub fn nr_active(&self) -> u32 {
        self.0.nr_active()
    }

    pub fn nr_inactive(&self) -> u32 {
        self.0.nr_inactive()
    }

    /// Test-only fault injection (spec §8 scenario 5 "Rescue under OOM").
    pub fn inject_worker_spawn_failures(&self, n: u32) {
        self.0.inject_worker_spawn_failures(n);
    }

    /// Test-only: see [`Workqueue::prime_binding`].
    pub fn prime_binding(&self) {
        self.0.prime_binding();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WqConfig, WqFlags};
    use crate::error::Error;

    #[test]
    fn enqueue_after_destroy_is_refused() {
        let wq = Workqueue::alloc(WqConfig::new("destroy-refuses", WqFlags::default(), 2)).unwrap();
        let handle = Wq(wq.clone());
        destroy_wq(handle.clone());
        let work = Work::new(|| {});
        match wq.enqueue(work) {
            Err(Error::Destroyed) => {}
            other => panic!("expected Error::Destroyed, got {other:?}"),
        }
    }
}
