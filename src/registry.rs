//! Process-wide registries (SPEC_FULL §4.9/§6): pool, binding and workqueue
//! lookup tables plus the id counters that hand out the u32 keys packed
//! into the work-item state word (spec §4.1). Mirrors the teacher's
//! `once_cell::sync::Lazy` + `dashmap::DashMap` singleton pattern used for
//! its own process-wide tool/session registries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::binding::Binding;
use crate::config::PoolAttrs;
use crate::pool::Pool;
use crate::workqueue::Workqueue;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_BINDING_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_WQ_ID: AtomicU32 = AtomicU32::new(1);

static POOLS: Lazy<DashMap<u32, Arc<Pool>>> = Lazy::new(DashMap::new);
static BINDINGS: Lazy<DashMap<u32, Arc<Binding>>> = Lazy::new(DashMap::new);
static WORKQUEUES: Lazy<DashMap<u32, Arc<Workqueue>>> = Lazy::new(DashMap::new);

/// Unbound pools are shared by fingerprint (spec §3 Worker Pool: "two
/// unbound pools with the same attributes are the same pool").
static UNBOUND_POOLS_BY_FINGERPRINT: Lazy<DashMap<u64, Arc<Pool>>> = Lazy::new(DashMap::new);

/// Per-CPU standard pools, populated lazily the first time each CPU/highpri
/// combination is requested (spec §3: "two standard pools per CPU").
static PER_CPU_POOLS: Lazy<DashMap<(usize, bool), Arc<Pool>>> = Lazy::new(DashMap::new);

pub fn lookup_pool(id: u32) -> Option<Arc<Pool>> {
    POOLS.get(&id).map(|e| e.value().clone())
}

pub fn lookup_binding(id: u32) -> Option<Arc<Binding>> {
    BINDINGS.get(&id).map(|e| e.value().clone())
}

pub fn lookup_workqueue(id: u32) -> Option<Arc<Workqueue>> {
    WORKQUEUES.get(&id).map(|e| e.value().clone())
}

pub(crate) fn register_binding(binding: Arc<Binding>) {
    BINDINGS.insert(binding.id, binding);
}

pub(crate) fn unregister_binding(id: u32) {
    BINDINGS.remove(&id);
}

pub(crate) fn register_workqueue(wq: Arc<Workqueue>) {
    WORKQUEUES.insert(wq.id, wq);
}

pub(crate) fn unregister_workqueue(id: u32) {
    WORKQUEUES.remove(&id);
}

pub(crate) fn next_binding_id() -> u32 {
    NEXT_BINDING_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn next_wq_id() -> u32 {
    NEXT_WQ_ID.fetch_add(1, Ordering::Relaxed)
}

/// The standard per-CPU pool for `cpu` (spec §3: a `NORMAL` and `HIGHPRI`
/// pool exist for every CPU, created on first use and never destroyed).
pub(crate) fn standard_pool(cpu: usize, highpri: bool) -> Arc<Pool> {
    if let Some(p) = PER_CPU_POOLS.get(&(cpu, highpri)) {
        return p.value().clone();
    }
    let mut attrs = PoolAttrs {
        cpumask: vec![cpu],
        ..PoolAttrs::default()
    };
    if highpri {
        attrs = attrs.highpri();
    }
    let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
    let pool = Pool::new(id, Some(cpu), attrs, highpri);
    pool.spawn_background_threads(crate::config::DEFAULT_CPU_INTENSIVE_THRESH);
    POOLS.insert(id, pool.clone());
    PER_CPU_POOLS
        .entry((cpu, highpri))
        .or_insert_with(|| pool.clone());
    PER_CPU_POOLS.get(&(cpu, highpri)).unwrap().value().clone()
}

/// The shared unbound pool matching `attrs`, creating one if this is the
/// first binding to ask for that fingerprint (spec §3 Worker Pool
/// lifecycle).
pub(crate) fn unbound_pool(attrs: PoolAttrs, highpri: bool) -> Arc<Pool> {
    let fp = attrs.fingerprint();
    if let Some(p) = UNBOUND_POOLS_BY_FINGERPRINT.get(&fp) {
        p.incref();
        return p.value().clone();
    }
    let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
    let pool = Pool::new(id, None, attrs, highpri);
    pool.incref(); // the binding about to be constructed on top of this pool
    pool.spawn_background_threads(crate::config::DEFAULT_CPU_INTENSIVE_THRESH);
    POOLS.insert(id, pool.clone());
    let entry = UNBOUND_POOLS_BY_FINGERPRINT
        .entry(fp)
        .or_insert_with(|| pool.clone());
    entry.value().clone()
}

/// Drop a reference to an unbound pool, removing it from the registry once
/// its refcount reaches zero (spec §3: "reclaimed after a grace period").
/// The grace period is realized here as an immediate removal from the
/// lookup tables; outstanding `Arc<Pool>` clones held by in-flight workers
/// keep the pool alive until they finish.
pub(crate) fn release_unbound_pool(pool: &Arc<Pool>) {
    if pool.decref() {
        let fp = pool.attrs.fingerprint();
        UNBOUND_POOLS_BY_FINGERPRINT.remove_if(&fp, |_, p| Arc::ptr_eq(p, pool));
        POOLS.remove(&pool.id);
    }
}

/// CPU hot-unplug notification (spec §4.2 "Rebind after CPU hotplug"): mark
/// both standard pools for `cpu` DISASSOCIATED so they behave as unbound
/// until [`cpu_online`] re-associates them.
pub fn cpu_offline(cpu: usize) {
    for highpri in [false, true] {
        if let Some(p) = PER_CPU_POOLS.get(&(cpu, highpri)) {
            p.value().disassociate();
        }
    }
}

/// CPU re-association (spec §4.2): re-pin workers and clear DISASSOCIATED
/// on both standard pools for `cpu`.
pub fn cpu_online(cpu: usize) {
    for highpri in [false, true] {
        if let Some(p) = PER_CPU_POOLS.get(&(cpu, highpri)) {
            p.value().reassociate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_pool_is_shared_across_calls() {
        let a = standard_pool(0, false);
        let b = standard_pool(0, false);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unbound_pool_shared_by_fingerprint() {
        let attrs = PoolAttrs::default();
        let a = unbound_pool(attrs.clone(), false);
        let b = unbound_pool(attrs, false);
        assert!(Arc::ptr_eq(&a, &b));
        release_unbound_pool(&a);
        release_unbound_pool(&b);
    }
}
