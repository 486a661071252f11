//! ============================================================================
//! workloom: Generic Asynchronous Work Execution Engine
//! ============================================================================
//!
//! A concurrency substrate for offloading callable work items onto a
//! deferred, process-context worker pool without the caller managing
//! threads itself:
//! - Fingerprint-keyed worker pools with refcounted lifecycle and automatic
//!   sizing
//! - Per-queue flow control (`max_active`) through pool-bindings
//! - A three-state (idle/pending/running) atomic ownership protocol per
//!   work item, with non-reentrancy across re-enqueues
//! - A flush-color protocol for waiting on in-flight work, plus a rescuer
//!   for forward progress under allocation pressure
//!
//! ## Quick Start
//!
//! ```rust
//! use workloom::{engine, WqFlags};
//!
//! let wq = engine().alloc_wq("example", WqFlags::default(), 4).unwrap();
//! let work = wq.submit(|| {
//!     // ... do some work ...
//! }).unwrap();
//! workloom::flush_work(&work);
//! ```

// ============================================================================
// Core components (spec §2: C1-C5)
// ============================================================================

pub mod work;
pub use work::{ClaimError, Work, WorkId};

pub mod worker;
pub use worker::{Lifecycle as WorkerLifecycle, Worker};

pub mod pool;
pub use pool::{ConcurrencyGuard, Pool, yield_concurrency};

pub mod binding;
pub use binding::Binding;

pub mod workqueue;
pub use workqueue::{Wq, Workqueue, destroy_wq};

// ============================================================================
// Supporting modules
// ============================================================================

pub mod registry;
pub use registry::{cpu_offline, cpu_online};

pub mod flush;
pub use flush::flush_work;

pub mod cancel;
pub use cancel::{CancelOutcome, cancel_async as cancel_work, cancel_sync as cancel_work_sync};

pub mod rescuer;

pub mod cpu;

pub mod timer;
pub use timer::mod_delayed as modify_delayed_work;

// ============================================================================
// Configuration and error handling
// ============================================================================

pub mod config;
pub use config::{AffinityScope, NR_COLORS, PoolAttrs, WqConfig, WqFlags};

pub mod error;
pub use error::{Error, Result};

// ============================================================================
// Process-wide engine handle
// ============================================================================

pub mod engine;
pub use engine::{Engine, engine};
