//! The rescuer (spec §3 "Rescuer", §4.3 "Mayday / Rescuer Escalation").
//!
//! One rescuer thread is owned by each `mem_reclaim` workqueue (mirroring
//! the kernel's `alloc_workqueue(..., WQ_MEM_RECLAIM, ...)` contract: "a
//! rescuer thread is created only for mem-reclaim workqueues"). It sleeps
//! on the workqueue's mayday queue and, for each posted binding, drains
//! that binding's still-queued work directly rather than waiting on the
//! stalled pool's own manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

use crate::binding::Binding;
use crate::worker::Worker;

/// A synthetic worker id space reserved for rescuers, disjoint from the
/// per-pool `next_worker_id` counters (spec §3: a rescuer "does not count
/// against any pool's worker accounting").
const RESCUER_WORKER_ID: u64 = u64::MAX;

pub(crate) struct Rescuer {
    wq_id: u32,
    stop: AtomicBool,
    handle: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Rescuer {
    pub fn spawn(wq_id: u32) -> Arc<Self> {
        let rescuer = Arc::new(Rescuer {
            wq_id,
            stop: AtomicBool::new(false),
            handle: parking_lot::Mutex::new(None),
        });
        let r = rescuer.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rescuer/{}", wq_id))
            .spawn(move || r.run())
            .expect("rescuer thread spawn must not fail");
        *rescuer.handle.lock() = Some(handle);
        rescuer
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        debug!(wq = self.wq_id, "rescuer started");
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let Some(wq) = crate::registry::lookup_workqueue(self.wq_id) else {
                break;
            };
            match wq.wait_for_mayday(Duration::from_millis(200)) {
                None => continue,
                Some(binding) => {
                    self.rescue_binding(&binding);
                }
            }
        }
        debug!(wq = self.wq_id, "rescuer stopped");
    }

    fn rescue_binding(&self, binding: &Arc<Binding>) {
        let items = binding.take_work_for_rescue();
        if items.is_empty() {
            binding.clear_mayday();
            return;
        }
        trace!(
            wq = self.wq_id,
            binding = binding.id,
            count = items.len(),
            "rescuer draining binding"
        );
        // The rescuer runs items inline on its own thread rather than
        // spawning one of the stalled pool's own workers (spec §4.3: "the
        // rescuer must make forward progress without depending on the
        // allocation that is itself stalled").
        let worker = Worker::new(RESCUER_WORKER_ID, binding.pool.id, true);
        for qw in items {
            binding.pool.run_one(&worker, qw);
        }
        binding.clear_mayday();
    }
}
