//! The process-wide engine handle (SPEC_FULL §6, §9 "Global state"). A
//! single [`Engine`] singleton fronts the module-level registries so
//! callers get one obvious entry point (`workloom::engine()`) instead of
//! reaching into `registry`/`workqueue` directly, mirroring the teacher's
//! `global_instance_manager()` pattern (`cylo/src/instance_manager.rs`).

use once_cell::sync::Lazy;

use crate::config::{WqConfig, WqFlags};
use crate::error::Result;
use crate::registry;
use crate::workqueue::{Wq, Workqueue, destroy_wq};

/// The engine's process-wide handle. Zero-sized: all actual state lives in
/// the `registry`/`pool`/`workqueue` module statics, which are already
/// `once_cell` singletons; `Engine` just gives them a stable, documented
/// surface (spec §9: "explicit two-phase startup... early: structures
/// only; full: worker threads may run" — here both phases collapse into
/// lazy-on-first-use, since a userspace crate has no separate init stage).
pub struct Engine {
    _private: (),
}

static ENGINE: Lazy<Engine> = Lazy::new(|| Engine { _private: () });

/// The process-wide [`Engine`] singleton.
pub fn engine() -> &'static Engine {
    &ENGINE
}

impl Engine {
    /// Allocate a new workqueue (spec §6 `alloc_wq`).
    pub fn alloc_wq(&self, name: impl Into<String>, flags: WqFlags, max_active: u32) -> Result<Wq> {
        Wq::new(WqConfig::new(name, flags, max_active))
    }

    /// Destroy `wq` (spec §6 `destroy_wq`): drains it first, then releases
    /// its bindings, pool references, and rescuer.
    pub fn destroy_wq(&self, wq: Wq) {
        destroy_wq(wq)
    }

    /// Notify the engine that `cpu` has gone offline (spec §4.2 "Rebind
    /// after CPU hotplug"). Out of scope as a *source* in this spec (CPU
    /// hot-plug notifications are an external collaborator) but the core's
    /// reaction to the notification — disassociating the per-CPU pools —
    /// is in scope, so it is exposed here for a host to drive.
    pub fn cpu_offline(&self, cpu: usize) {
        registry::cpu_offline(cpu);
    }

    /// Notify the engine that `cpu` has come back online (spec §4.2).
    pub fn cpu_online(&self, cpu: usize) {
        registry::cpu_online(cpu);
    }

    /// Look up a previously-allocated workqueue by id, mainly useful for
    /// diagnostics/tests.
    pub fn lookup_wq(&self, id: u32) -> Option<std::sync::Arc<Workqueue>> {
        registry::lookup_workqueue(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_is_a_stable_process_wide_singleton() {
        let a = engine() as *const Engine;
        let b = engine() as *const Engine;
        assert_eq!(a, b);
    }

    #[test]
    fn alloc_and_destroy_round_trip() {
        let wq = engine()
            .alloc_wq("engine-test", WqFlags::default(), 4)
            .unwrap();
        engine().destroy_wq(wq);
    }
}
