//! MapPoint: a 3D landmark observed by one or more keyframes.
//!
//! Besides position and observations, a map point carries the viewing
//! geometry (mean viewing direction and the distance range over which its
//! descriptor is recognizable) and a set of per-loop scratch stamps the loop
//! closer uses to avoid touching the same point twice in one pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::Vector3;

use super::types::{KeyFrameId, MapPointId};

/// A 3D landmark.
pub struct MapPoint {
    pub id: MapPointId,

    /// Position in world coordinates.
    pub position: Vector3<f64>,

    /// Representative ORB descriptor, the observation descriptor with the
    /// smallest median Hamming distance to the others.
    pub descriptor: [u8; 32],

    /// Observing keyframe -> feature slot in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Closest distance at which the point is recognizable.
    pub min_distance: f64,

    /// Farthest distance at which the point is recognizable.
    pub max_distance: f64,

    /// Keyframe the point was created from.
    pub reference_kf_id: KeyFrameId,

    /// Tombstone flag.
    pub is_bad: bool,

    /// Times the point fell inside a frame's frustum.
    pub visible_count: u32,

    /// Times the point was actually matched in a frame.
    pub found_count: u32,

    // ── Loop-closing scratch ─────────────────────────────────────────────
    /// Dedup stamp used while gathering the loop-side point cloud; written
    /// by the detector under a shared map guard, hence atomic. Zero means
    /// unstamped (keyframe id 0 never enters the loop-closing queue).
    loop_point_for_kf: AtomicU64,

    /// Loop keyframe that corrected this point's position.
    pub corrected_by_kf: Option<KeyFrameId>,

    /// Neighbor keyframe whose correction was applied to this point.
    pub corrected_reference: Option<KeyFrameId>,

    /// Position computed by the last global BA, pending write-back.
    pub pos_gba: Option<Vector3<f64>>,

    /// Loop keyframe id that stamped this point during global BA.
    pub ba_global_for_kf: Option<KeyFrameId>,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: [u8; 32],
        reference_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            reference_kf_id,
            is_bad: false,
            visible_count: 0,
            found_count: 0,
            loop_point_for_kf: AtomicU64::new(0),
            corrected_by_kf: None,
            corrected_reference: None,
            pos_gba: None,
            ba_global_for_kf: None,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, slot: usize) {
        self.observations.insert(kf_id, slot);
    }

    /// Returns true if the observation existed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
        self.observations.clear();
    }

    // ── Loop dedup stamp ─────────────────────────────────────────────────

    /// Stamp the point for the given loop pass. Returns false if it was
    /// already stamped for that pass.
    pub fn stamp_loop_point(&self, loop_kf: KeyFrameId) -> bool {
        self.loop_point_for_kf.swap(loop_kf.0, Ordering::SeqCst) != loop_kf.0
    }

    pub fn loop_point_for_kf(&self) -> Option<KeyFrameId> {
        match self.loop_point_for_kf.load(Ordering::SeqCst) {
            0 => None,
            id => Some(KeyFrameId::new(id)),
        }
    }

    // ── Viewing geometry ─────────────────────────────────────────────────

    /// Recompute the mean viewing direction and the recognizable distance
    /// range from the observing camera centers.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        camera_centers: impl Iterator<Item = &'a Vector3<f64>>,
        scale_factor: f64,
        num_levels: u32,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut min_dist = f64::INFINITY;
        let mut max_dist = 0.0f64;
        let mut count = 0;

        for center in camera_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                min_dist = min_dist.min(dist);
                max_dist = max_dist.max(dist);
                count += 1;
            }
        }

        if count == 0 {
            return;
        }

        let norm = normal_sum.norm();
        if norm > 1e-10 {
            self.normal = normal_sum / norm;
        }

        let scale_range = scale_factor.powi(num_levels as i32 - 1);
        self.min_distance = min_dist / scale_range;
        self.max_distance = max_dist * scale_range;
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Predict the ORB octave a feature observing this point from `distance`
    /// would be extracted at.
    pub fn predict_octave(&self, distance: f64, scale_factor: f64, num_levels: u32) -> u32 {
        if distance <= 1e-10 || self.max_distance <= 0.0 {
            return 0;
        }
        let ratio = self.max_distance / distance;
        if ratio <= 1.0 {
            return 0;
        }
        let level = (ratio.ln() / scale_factor.ln()).ceil() as u32;
        level.min(num_levels - 1)
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
