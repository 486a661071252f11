//! Error types for the engine's submitter-facing and internal operations.
//!
//! Shaped like the teacher's `ExecError`/`StorageError`: a flat enum, one
//! `#[error]` message per variant, `#[from]` where a lower-level cause is
//! wrapped rather than stringified.

use std::io;

use thiserror::Error;

/// Errors the engine can report back to a caller or to its own logs.
///
/// Per spec §7, category 1 (already-pending) and category 2 (canceling in
/// progress) are never surfaced as `Err` — they're encoded in `bool`
/// return values or resolved by waiting. Only categories 3 (resource
/// exhaustion, non-fatal and retried internally) and 4 (misuse) produce
/// this type, and category 3 is only visible here if retries are
/// exhausted or the caller asked for synchronous allocation.
#[derive(Debug, Error)]
pub enum Error {
    /// A pool could not be created or grown: the allocator or thread
    /// creation failed. Non-fatal to the engine; the pool retries with a
    /// cooldown per spec §4.2.
    #[error("failed to spawn worker: {0}")]
    WorkerSpawn(#[from] io::Error),

    /// `WorkqueueAttrs` describe something the engine cannot satisfy
    /// (e.g. an empty CPU mask, or `max_active` of zero).
    #[error("invalid workqueue attributes: {0}")]
    InvalidAttrs(String),

    /// A programmer error per spec §7 category 4: double-enqueue of an
    /// already-active item through a path that should have observed
    /// PENDING, flushing a system/reclaim workqueue from within itself,
    /// destroying a workqueue with work still in flight, or re-applying
    /// attributes to an `ORDERED` workqueue. The engine refuses and logs
    /// rather than corrupting state.
    #[error("workqueue misuse: {0}")]
    Misuse(String),

    /// The work item is currently being canceled by another thread; the
    /// caller observed this racing its own claim attempt.
    #[error("work item is being canceled")]
    Canceling,

    /// The workqueue has been destroyed and no longer accepts submissions.
    #[error("workqueue has been destroyed")]
    Destroyed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
