//! The loop-closing thread: queue, main loop, and lifecycle.
//!
//! The local mapper hands finished keyframes to
//! [`LoopCloserHandle::insert_keyframe`]; a single consumer thread drains
//! the queue, runs the detector on each keyframe, and applies accepted
//! loops with the corrector. Reset clears the queue and forgets the last
//! accepted loop; finish stops the thread after the current iteration.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::camera::CameraModel;
use crate::map::KeyFrameId;
use crate::optimizer::GlobalBaConfig;
use crate::system::SharedState;

use super::corrector::{CorrectorConfig, LoopCorrector};
use super::detector::{LoopDetector, LoopDetectorConfig};
use super::global_ba_task::GlobalBundleTask;

/// Poll interval of the main loop.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Configuration for the loop closer.
#[derive(Debug, Clone)]
pub struct LoopCloserConfig {
    pub detector: LoopDetectorConfig,
    pub corrector: CorrectorConfig,
    pub global_ba: GlobalBaConfig,

    /// Pin the similarity scale to 1 (stereo/RGB-D); monocular systems
    /// leave it free to absorb scale drift.
    pub fix_scale: bool,
}

impl Default for LoopCloserConfig {
    fn default() -> Self {
        Self {
            detector: LoopDetectorConfig::default(),
            corrector: CorrectorConfig::default(),
            global_ba: GlobalBaConfig::default(),
            fix_scale: true,
        }
    }
}

/// Counters reported when the thread exits.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    pub keyframes_processed: usize,
    pub loops_corrected: usize,
}

/// Inbound queue plus the id of the last accepted loop, guarded together.
struct QueueState {
    queue: VecDeque<KeyFrameId>,
    last_loop_kf_id: u64,
}

/// Cross-thread control surface of the loop closer.
struct LoopCloserFlags {
    queue: Mutex<QueueState>,
    reset_requested: AtomicBool,
    finish_requested: AtomicBool,
    finished: AtomicBool,
}

/// The loop-closing worker. Create it, take a [`LoopCloserHandle`], and
/// move the worker into a thread with [`LoopCloser::run`] (or use
/// [`spawn_loop_closer`]).
pub struct LoopCloser {
    shared: Arc<SharedState>,
    flags: Arc<LoopCloserFlags>,
    detector: LoopDetector,
    corrector: LoopCorrector,
    gba: Arc<GlobalBundleTask>,
    stats: LoopCloserStats,
}

impl LoopCloser {
    pub fn new(shared: Arc<SharedState>, camera: CameraModel, config: LoopCloserConfig) -> Self {
        let detector = LoopDetector::new(camera, config.fix_scale, config.detector);
        let corrector = LoopCorrector::new(
            Arc::clone(&shared),
            camera,
            config.fix_scale,
            config.corrector,
        );
        let gba = Arc::new(GlobalBundleTask::new(
            Arc::clone(&shared),
            camera,
            config.global_ba,
        ));

        Self {
            shared,
            flags: Arc::new(LoopCloserFlags {
                queue: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    last_loop_kf_id: 0,
                }),
                reset_requested: AtomicBool::new(false),
                finish_requested: AtomicBool::new(false),
                finished: AtomicBool::new(true),
            }),
            detector,
            corrector,
            gba,
            stats: LoopCloserStats::default(),
        }
    }

    /// Control surface usable from other threads.
    pub fn handle(&self) -> LoopCloserHandle {
        LoopCloserHandle {
            flags: Arc::clone(&self.flags),
            gba: Arc::clone(&self.gba),
        }
    }

    /// Main loop. Blocks until a finish request is seen.
    pub fn run(&mut self) {
        info!("loop closing thread started");
        self.flags.finished.store(false, Ordering::SeqCst);

        loop {
            // Pop the oldest queued keyframe and guard it against culling
            // while it is being processed.
            let next = {
                let mut state = self.flags.queue.lock();
                let next = state.queue.pop_front();
                if let Some(kf_id) = next {
                    let map = self.shared.map.read();
                    if let Some(kf) = map.get_keyframe(kf_id) {
                        kf.set_not_erase();
                    }
                }
                next
            };

            if let Some(kf_id) = next {
                self.process_keyframe(kf_id);
            }

            if self.flags.reset_requested.load(Ordering::SeqCst) {
                let mut state = self.flags.queue.lock();
                state.queue.clear();
                state.last_loop_kf_id = 0;
                self.flags.reset_requested.store(false, Ordering::SeqCst);
                info!("loop closer reset");
            }

            if self.flags.finish_requested.load(Ordering::SeqCst) {
                break;
            }

            thread::sleep(IDLE_POLL);
        }

        self.flags.finished.store(true, Ordering::SeqCst);
        info!(
            processed = self.stats.keyframes_processed,
            corrected = self.stats.loops_corrected,
            "loop closing thread exiting"
        );
    }

    fn process_keyframe(&mut self, kf_id: KeyFrameId) {
        self.stats.keyframes_processed += 1;

        let last_loop_kf_id = self.flags.queue.lock().last_loop_kf_id;
        let detection = self.detector.detect(&self.shared, kf_id, last_loop_kf_id);

        // Every processed keyframe becomes retrievable for future loops,
        // whether or not it closed one.
        {
            let map = self.shared.map.read();
            self.shared.keyframe_db.lock().add(&map, kf_id);
        }

        match detection {
            Some(accepted) => {
                self.corrector.correct(&self.gba, kf_id, &accepted);
                self.flags.queue.lock().last_loop_kf_id = kf_id.0;
                self.stats.loops_corrected += 1;
            }
            None => {
                let map = self.shared.map.read();
                if let Some(kf) = map.get_keyframe(kf_id) {
                    kf.set_erase();
                }
            }
        }
    }

    /// Statistics so far (main-loop thread only).
    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }
}

/// Clonable control surface: keyframe submission, reset/finish lifecycle,
/// and global-BA status queries.
#[derive(Clone)]
pub struct LoopCloserHandle {
    flags: Arc<LoopCloserFlags>,
    gba: Arc<GlobalBundleTask>,
}

impl LoopCloserHandle {
    /// Queue a keyframe for loop detection. The very first keyframe of a
    /// map never closes a loop and is skipped.
    pub fn insert_keyframe(&self, kf_id: KeyFrameId) {
        if kf_id.0 == 0 {
            return;
        }
        self.flags.queue.lock().queue.push_back(kf_id);
    }

    /// Number of keyframes waiting to be processed.
    pub fn queue_len(&self) -> usize {
        self.flags.queue.lock().queue.len()
    }

    /// Id of the keyframe at which the last loop was accepted (0 if none).
    pub fn last_loop_kf_id(&self) -> u64 {
        self.flags.queue.lock().last_loop_kf_id
    }

    /// Drop all queued keyframes and forget the last accepted loop. Blocks
    /// until the main loop acknowledges; the loop must be running.
    pub fn request_reset(&self) {
        self.flags.reset_requested.store(true, Ordering::SeqCst);
        while self.flags.reset_requested.load(Ordering::SeqCst) {
            thread::sleep(IDLE_POLL);
        }
    }

    /// Ask the main loop to exit after its current iteration.
    pub fn request_finish(&self) {
        self.flags.finish_requested.store(true, Ordering::SeqCst);
    }

    /// Whether the main loop has exited.
    pub fn is_finished(&self) -> bool {
        self.flags.finished.load(Ordering::SeqCst)
    }

    /// Whether a global bundle adjustment is currently active.
    pub fn is_running_gba(&self) -> bool {
        self.gba.is_running()
    }

    /// Whether the last global bundle adjustment has completed.
    pub fn is_finished_gba(&self) -> bool {
        self.gba.is_finished()
    }
}

/// Spawn the loop-closing thread, returning its control handle and join
/// handle.
pub fn spawn_loop_closer(
    shared: Arc<SharedState>,
    camera: CameraModel,
    config: LoopCloserConfig,
) -> (LoopCloserHandle, JoinHandle<()>) {
    let mut closer = LoopCloser::new(shared, camera, config);
    let handle = closer.handle();
    let join = thread::spawn(move || closer.run());
    (handle, join)
}
