//! Background global-bundle-adjustment task.
//!
//! Each accepted loop spawns a full bundle adjustment of the map in a
//! detached worker thread. At most one run is logically active: starting a
//! new run advances a monotonically increasing index and any still-running
//! older worker discards its result when it notices the mismatch.
//! Cancellation is cooperative — [`GlobalBundleTask::stop`] raises the
//! current run's stop flag (polled inside the optimization) and abandons
//! the thread.
//!
//! A worker that survives to completion stops the local mapper, takes the
//! map-update lock, and propagates the optimized poses through the spanning
//! tree so keyframes inserted while the adjustment was running stay
//! consistent with the refreshed map.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::camera::CameraModel;
use crate::map::{KeyFrameId, Map};
use crate::optimizer::{global_bundle_adjustment, GlobalBaConfig};
use crate::system::SharedState;

struct TaskState {
    running: bool,
    finished: bool,
    /// Advanced by every `stop`; a worker whose captured index no longer
    /// matches is stale and must not touch the map.
    index: u64,
    /// Stop flag of the currently active run.
    stop: Arc<AtomicBool>,
}

/// Spawn-detach-abort wrapper around global bundle adjustment.
pub struct GlobalBundleTask {
    shared: Arc<SharedState>,
    camera: CameraModel,
    config: GlobalBaConfig,
    state: Arc<Mutex<TaskState>>,
}

impl GlobalBundleTask {
    pub fn new(shared: Arc<SharedState>, camera: CameraModel, config: GlobalBaConfig) -> Self {
        Self {
            shared,
            camera,
            config,
            state: Arc::new(Mutex::new(TaskState {
                running: false,
                finished: true,
                index: 0,
                stop: Arc::new(AtomicBool::new(false)),
            })),
        }
    }

    /// Start a new adjustment for the loop closed at `loop_kf`. The worker
    /// thread is detached; track it through [`GlobalBundleTask::is_running`]
    /// and [`GlobalBundleTask::is_finished`].
    pub fn run(&self, loop_kf: KeyFrameId) {
        let stop = Arc::new(AtomicBool::new(false));
        let index = {
            let mut state = self.state.lock();
            state.running = true;
            state.finished = false;
            state.stop = Arc::clone(&stop);
            state.index
        };

        let shared = Arc::clone(&self.shared);
        let camera = self.camera;
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        thread::spawn(move || worker(&shared, &camera, &config, &state, loop_kf, index, &stop));
    }

    /// Abort the active run: raise its stop flag and invalidate its index.
    /// The worker thread is left to wind down on its own.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stop.store(true, Ordering::SeqCst);
        state.index += 1;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}

/// Body of a global-BA run. On completion, a run that is neither stale nor
/// stopped propagates its result to the live map.
fn worker(
    shared: &SharedState,
    camera: &CameraModel,
    config: &GlobalBaConfig,
    state: &Mutex<TaskState>,
    loop_kf: KeyFrameId,
    index: u64,
    stop: &AtomicBool,
) {
    info!(loop_kf = %loop_kf, "starting global bundle adjustment");

    global_bundle_adjustment(&shared.map, camera, config, stop, loop_kf);

    let mut state = state.lock();
    if state.index != index {
        // A newer run superseded this one while it was optimizing.
        debug!(loop_kf = %loop_kf, "discarding stale global BA result");
        return;
    }

    if !stop.load(Ordering::SeqCst) {
        info!(loop_kf = %loop_kf, "global bundle adjustment finished, updating map");

        // Local mapping was active during the adjustment; freeze it before
        // rewriting poses.
        shared.local_mapper.request_stop();
        while !shared.local_mapper.is_stopped() && !shared.local_mapper.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }

        {
            let mut map = shared.map.write();
            apply_global_ba_correction(&mut map, loop_kf);
            map.inform_new_big_change();
        }

        shared.local_mapper.release();
        info!("map updated");
    }

    state.finished = true;
    state.running = false;
}

/// Propagate stamped global-BA results to the live map.
///
/// Walks the spanning tree from the map origins. Keyframes created after
/// the adjustment started carry no stamp; they inherit their parent's
/// correction through the relative pose `T_child·T_parent⁻¹`. Map points
/// are either moved to their optimized position or rerouted through their
/// reference keyframe's pre-adjustment pose; points whose reference was
/// never stamped (culled or detached during the run) are left untouched.
pub fn apply_global_ba_correction(map: &mut Map, loop_kf: KeyFrameId) {
    // Keyframes, breadth-first over the spanning tree.
    let mut queue: VecDeque<KeyFrameId> = map.origins().iter().copied().collect();
    while let Some(kf_id) = queue.pop_front() {
        let (pose, gba_pose, children) = {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            (
                kf.pose,
                kf.tcw_gba,
                kf.children_ids.iter().copied().collect::<Vec<_>>(),
            )
        };

        for child_id in children {
            queue.push_back(child_id);
            let Some(gba_pose) = gba_pose else {
                continue;
            };
            let Some(child) = map.get_keyframe_mut(child_id) else {
                continue;
            };
            if child.ba_global_for_kf != Some(loop_kf) {
                let t_child_parent = child.pose * pose.inverse();
                child.tcw_gba = Some(t_child_parent * gba_pose);
                child.ba_global_for_kf = Some(loop_kf);
            }
        }

        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            kf.tcw_bef_gba = Some(kf.pose);
            if let Some(gba_pose) = kf.tcw_gba {
                kf.pose = gba_pose;
            }
        }
    }

    // Map points: optimized position if stamped, otherwise carried along
    // with the reference keyframe's correction.
    let mp_ids: Vec<_> = map.map_point_ids().collect();
    for mp_id in mp_ids {
        let (position, stamped, pos_gba, reference) = {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            (
                mp.position,
                mp.ba_global_for_kf == Some(loop_kf),
                mp.pos_gba,
                mp.reference_kf_id,
            )
        };

        if stamped {
            if let (Some(new_pos), Some(mp)) = (pos_gba, map.get_map_point_mut(mp_id)) {
                mp.position = new_pos;
            }
            continue;
        }

        let Some(reference_kf) = map.get_keyframe(reference) else {
            continue;
        };
        if reference_kf.ba_global_for_kf != Some(loop_kf) {
            // Reference untouched by this adjustment: leave the point be.
            continue;
        }
        let Some(before) = reference_kf.tcw_bef_gba else {
            continue;
        };

        let in_camera = before.transform_point(&position);
        let corrected = reference_kf.pose.inverse().transform_point(&in_camera);
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = corrected;
        }
    }
}
