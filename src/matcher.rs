//! ORB descriptor matching for loop closing.
//!
//! Four search modes are used along the loop-closing pipeline:
//!
//! 1. [`OrbMatcher::search_by_bow`] — descriptor matching between two
//!    keyframes, used to seed the similarity solver.
//! 2. [`OrbMatcher::search_by_sim3`] — guided matching through a candidate
//!    similarity transform, used to densify correspondences before
//!    refinement.
//! 3. [`OrbMatcher::search_by_projection`] — projection of a point cloud
//!    into a keyframe, used to gather the extended loop-side matches.
//! 4. [`OrbMatcher::fuse`] — projection-based duplicate detection, used to
//!    merge both sides of a closed loop.

use std::collections::HashSet;

use nalgebra::Vector3;

use crate::camera::CameraModel;
use crate::geometry::{SE3, Sim3};
use crate::map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId, ORB_SCALE_FACTOR};

/// Hamming threshold for confident descriptor matches.
pub const TH_LOW: u32 = 50;

/// Relaxed Hamming threshold for guided searches.
pub const TH_HIGH: u32 = 100;

/// Hamming distance between two 256-bit ORB descriptors.
pub fn hamming_distance(a: &[u8; 32], b: &[u8; 32]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Descriptor matcher with a nearest-neighbor ratio test.
pub struct OrbMatcher {
    /// Best-to-second-best distance ratio; matches failing it are dropped.
    pub nn_ratio: f64,
}

impl OrbMatcher {
    pub fn new(nn_ratio: f64) -> Self {
        Self { nn_ratio }
    }

    /// Match map-point-bearing features of `kf1` against those of `kf2`.
    ///
    /// Returns, per `kf1` slot, the matched `kf2` map point. Matches are
    /// one-to-one: each `kf2` slot is claimed at most once.
    pub fn search_by_bow(
        &self,
        map: &Map,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
    ) -> Vec<Option<MapPointId>> {
        let mut matches = vec![None; kf1.num_features()];
        let mut claimed: HashSet<usize> = HashSet::new();

        for (slot1, mp1_id) in kf1.map_point_indices() {
            if map.get_map_point(mp1_id).map_or(true, |mp| mp.is_bad) {
                continue;
            }
            let desc1 = &kf1.descriptors[slot1];

            let mut best_dist = u32::MAX;
            let mut second_dist = u32::MAX;
            let mut best: Option<(usize, MapPointId)> = None;

            for (slot2, mp2_id) in kf2.map_point_indices() {
                if claimed.contains(&slot2) {
                    continue;
                }
                if map.get_map_point(mp2_id).map_or(true, |mp| mp.is_bad) {
                    continue;
                }
                let dist = hamming_distance(desc1, &kf2.descriptors[slot2]);
                if dist < best_dist {
                    second_dist = best_dist;
                    best_dist = dist;
                    best = Some((slot2, mp2_id));
                } else if dist < second_dist {
                    second_dist = dist;
                }
            }

            if let Some((slot2, mp2_id)) = best {
                if best_dist <= TH_LOW && (best_dist as f64) < self.nn_ratio * second_dist as f64 {
                    matches[slot1] = Some(mp2_id);
                    claimed.insert(slot2);
                }
            }
        }

        matches
    }

    /// Guided matching through a candidate similarity transform.
    ///
    /// Projects `kf2`'s map points into `kf1` through `s12` (camera-2 to
    /// camera-1) and fills empty slots of `matches` within `radius` pixels
    /// (scaled by the predicted octave). Returns the number of matches
    /// added.
    pub fn search_by_sim3(
        &self,
        map: &Map,
        camera: &CameraModel,
        kf1: &KeyFrame,
        kf2: &KeyFrame,
        matches: &mut [Option<MapPointId>],
        s12: &Sim3,
        radius: f64,
    ) -> usize {
        let already: HashSet<MapPointId> = matches.iter().flatten().copied().collect();
        let mut added = 0;

        for (_, mp2_id) in kf2.map_point_indices() {
            let Some(mp2) = map.get_map_point(mp2_id) else {
                continue;
            };
            if mp2.is_bad || already.contains(&mp2_id) {
                continue;
            }

            let p_cam2 = kf2.pose.transform_point(&mp2.position);
            let p_cam1 = s12.transform_point(&p_cam2);
            if p_cam1.z <= 0.0 {
                continue;
            }
            let Some((u, v)) = camera.project(&p_cam1) else {
                continue;
            };
            if !camera.is_in_image(u, v) {
                continue;
            }

            let dist = p_cam1.norm();
            if !mp2.is_in_distance_range(dist) {
                continue;
            }

            if let Some(slot) = self.best_slot_in_area(
                kf1,
                matches,
                &mp2.descriptor,
                u,
                v,
                radius * octave_scale(mp2, dist),
                TH_HIGH,
            ) {
                matches[slot] = Some(mp2_id);
                added += 1;
            }
        }

        added
    }

    /// Project a loop-side point cloud into a keyframe and gather matches
    /// into empty slots. Returns the number of matches added.
    pub fn search_by_projection(
        &self,
        map: &Map,
        camera: &CameraModel,
        kf: &KeyFrame,
        scw: &Sim3,
        points: &[MapPointId],
        matches: &mut [Option<MapPointId>],
        radius: f64,
    ) -> usize {
        let rigid = scw.to_rigid();
        let center = rigid.camera_center();
        let already: HashSet<MapPointId> = matches.iter().flatten().copied().collect();
        let mut added = 0;

        for &mp_id in points {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if mp.is_bad || already.contains(&mp_id) {
                continue;
            }

            let Some((u, v, dist)) = project_checked(camera, &rigid, &center, mp) else {
                continue;
            };

            if let Some(slot) = self.best_slot_in_area(
                kf,
                matches,
                &mp.descriptor,
                u,
                v,
                radius * octave_scale(mp, dist),
                TH_LOW,
            ) {
                matches[slot] = Some(mp_id);
                added += 1;
            }
        }

        added
    }

    /// Project a point cloud into a keyframe through `scw` and either attach
    /// each point to a free feature slot or report the duplicate map point
    /// already occupying the best slot.
    ///
    /// The returned vector is indexed like `points`: `Some(existing)` means
    /// the caller should replace `existing` with the loop-side point.
    pub fn fuse(
        &self,
        map: &mut Map,
        camera: &CameraModel,
        kf_id: KeyFrameId,
        scw: &Sim3,
        points: &[MapPointId],
        radius: f64,
    ) -> Vec<Option<MapPointId>> {
        let mut replacements = vec![None; points.len()];
        let rigid = scw.to_rigid();
        let center = rigid.camera_center();

        // Proposal phase over the immutable map.
        let mut proposals: Vec<(usize, usize, Option<MapPointId>)> = Vec::new();
        {
            let Some(kf) = map.get_keyframe(kf_id) else {
                return replacements;
            };
            let mut used_slots: HashSet<usize> = HashSet::new();

            for (i, &mp_id) in points.iter().enumerate() {
                let Some(mp) = map.get_map_point(mp_id) else {
                    continue;
                };
                if mp.is_bad || mp.is_observed_by(kf_id) {
                    continue;
                }

                let Some((u, v, dist)) = project_checked(camera, &rigid, &center, mp) else {
                    continue;
                };

                let mut best_dist = u32::MAX;
                let mut best_slot = None;
                let r = radius * octave_scale(mp, dist);
                for slot in kf.features_in_area(u, v, r) {
                    if used_slots.contains(&slot) {
                        continue;
                    }
                    let dist = hamming_distance(&mp.descriptor, &kf.descriptors[slot]);
                    if dist < best_dist {
                        best_dist = dist;
                        best_slot = Some(slot);
                    }
                }

                if let Some(slot) = best_slot {
                    if best_dist <= TH_LOW {
                        used_slots.insert(slot);
                        let existing = kf
                            .map_point(slot)
                            .filter(|id| map.get_map_point(*id).map_or(false, |mp| !mp.is_bad));
                        proposals.push((i, slot, existing));
                    }
                }
            }
        }

        // Apply phase.
        for (i, slot, existing) in proposals {
            match existing {
                Some(duplicate) => replacements[i] = Some(duplicate),
                None => {
                    map.associate(kf_id, slot, points[i]);
                }
            }
        }

        replacements
    }

    /// Best free slot around `(u, v)` by descriptor distance, or `None`.
    fn best_slot_in_area(
        &self,
        kf: &KeyFrame,
        matches: &[Option<MapPointId>],
        descriptor: &[u8; 32],
        u: f64,
        v: f64,
        radius: f64,
        threshold: u32,
    ) -> Option<usize> {
        let mut best_dist = u32::MAX;
        let mut best_slot = None;

        for slot in kf.features_in_area(u, v, radius) {
            if matches[slot].is_some() {
                continue;
            }
            let dist = hamming_distance(descriptor, &kf.descriptors[slot]);
            if dist < best_dist {
                best_dist = dist;
                best_slot = Some(slot);
            }
        }

        best_slot.filter(|_| best_dist <= threshold)
    }
}

impl Default for OrbMatcher {
    fn default() -> Self {
        Self::new(0.75)
    }
}

/// Search-radius multiplier for the octave a point is expected at.
fn octave_scale(mp: &MapPoint, dist: f64) -> f64 {
    let octave = mp.predict_octave(dist, ORB_SCALE_FACTOR, crate::map::ORB_NUM_LEVELS);
    ORB_SCALE_FACTOR.powi(octave as i32)
}

/// Project a map point through a rigid world-to-camera transform, enforcing
/// positive depth, image bounds, the recognizable distance range and a
/// viewing angle within 60 degrees of the point's normal.
fn project_checked(
    camera: &CameraModel,
    rigid: &SE3,
    center: &Vector3<f64>,
    mp: &MapPoint,
) -> Option<(f64, f64, f64)> {
    let p_cam = rigid.transform_point(&mp.position);
    if p_cam.z <= 0.0 {
        return None;
    }
    let (u, v) = camera.project(&p_cam)?;
    if !camera.is_in_image(u, v) {
        return None;
    }

    let dir = mp.position - center;
    let dist = dir.norm();
    if !mp.is_in_distance_range(dist) {
        return None;
    }
    if mp.normal.norm() > 1e-10 && dir.dot(&mp.normal) < 0.5 * dist {
        return None;
    }

    Some((u, v, dist))
}
