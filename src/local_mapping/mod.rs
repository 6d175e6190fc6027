//! Control surface of the local-mapping thread.
//!
//! The mapping algorithms (keyframe insertion, triangulation, local BA) run
//! in the owning system; loop closing only needs the stop/release handshake:
//! it asks the mapper to stop before rewriting the map, polls until the
//! mapper acknowledges, and releases it afterwards. All flags are atomics
//! polled with short sleeps, so no side holds a lock while waiting.

use std::sync::atomic::{AtomicBool, Ordering};

/// Stop/release handshake with the local-mapping thread.
#[derive(Debug, Default)]
pub struct LocalMapper {
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    finish_requested: AtomicBool,
    finished: AtomicBool,
}

impl LocalMapper {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Loop-closer side ─────────────────────────────────────────────────

    /// Ask the mapper to stop inserting keyframes.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Whether the mapper has acknowledged the stop request.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Let a stopped mapper resume.
    pub fn release(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn request_finish(&self) {
        self.finish_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_finish_requested(&self) -> bool {
        self.finish_requested.load(Ordering::SeqCst)
    }

    /// Whether the mapping thread has exited its loop.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    // ── Mapper side ──────────────────────────────────────────────────────

    /// Called by the mapping thread each iteration; acknowledges a pending
    /// stop request and reports whether the mapper should idle.
    pub fn stop_if_requested(&self) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) {
            self.stopped.store(true, Ordering::SeqCst);
            true
        } else {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    /// Called by the mapping thread when it exits.
    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }
}
