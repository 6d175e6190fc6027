//! RANSAC similarity-transform solver.
//!
//! Estimates the Sim3 aligning the matched map points of two keyframes,
//! expressed in each keyframe's camera frame, so the transform directly
//! relates the two camera poses. The solver is resumable: the loop detector
//! runs a few iterations per candidate per pass, round-robin, until one
//! candidate produces a transform or every candidate exhausts its budget.
//!
//! The closed-form core is Horn's absolute-orientation method on minimal
//! 3-point samples. With `fix_scale` (stereo/RGB-D) the scale is pinned to
//! 1 and the estimate is rigid.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geometry::Sim3;
use crate::map::{KeyFrame, Map, MapPointId};

/// Point-to-point inlier threshold in meters.
const INLIER_THRESHOLD: f64 = 0.075;

/// Resumable RANSAC solver for the transform mapping candidate-keyframe
/// camera coordinates into current-keyframe camera coordinates.
pub struct Sim3Solver {
    /// Matched points in the current keyframe's camera frame.
    pts_current: Vec<Vector3<f64>>,
    /// Matched points in the candidate keyframe's camera frame.
    pts_candidate: Vec<Vector3<f64>>,
    /// Current-keyframe slot of each correspondence.
    slots: Vec<usize>,

    fix_scale: bool,
    min_inliers: usize,
    max_iterations: usize,
    iterations_done: usize,

    best_num_inliers: usize,
    best: Option<(Sim3, Vec<bool>)>,
    exhausted: bool,

    rng: StdRng,
}

impl Sim3Solver {
    /// Build the correspondence set from per-slot matches: slot `i` of the
    /// current keyframe pairs its own map point with `matches[i]`.
    pub fn new(
        map: &Map,
        current: &KeyFrame,
        candidate: &KeyFrame,
        matches: &[Option<MapPointId>],
        fix_scale: bool,
    ) -> Self {
        let mut pts_current = Vec::new();
        let mut pts_candidate = Vec::new();
        let mut slots = Vec::new();

        for (slot, matched) in matches.iter().enumerate() {
            let Some(mp2_id) = matched else {
                continue;
            };
            let Some(mp1_id) = current.map_point(slot) else {
                continue;
            };
            let (Some(mp1), Some(mp2)) = (map.get_map_point(mp1_id), map.get_map_point(*mp2_id))
            else {
                continue;
            };
            if mp1.is_bad || mp2.is_bad {
                continue;
            }

            pts_current.push(current.pose.transform_point(&mp1.position));
            pts_candidate.push(candidate.pose.transform_point(&mp2.position));
            slots.push(slot);
        }

        Self {
            pts_current,
            pts_candidate,
            slots,
            fix_scale,
            min_inliers: 20,
            max_iterations: 300,
            iterations_done: 0,
            best_num_inliers: 0,
            best: None,
            exhausted: false,
            // Fixed seed: detection over a frozen keyframe stream must be
            // repeatable.
            rng: StdRng::seed_from_u64(0x5117_3501),
        }
    }

    /// Configure the RANSAC termination criteria. The iteration budget is
    /// adapted to the expected inlier ratio, capped at `max_iterations`.
    pub fn set_ransac_parameters(&mut self, probability: f64, min_inliers: usize, max_iterations: usize) {
        self.min_inliers = min_inliers;
        let n = self.pts_current.len();

        if n < min_inliers.max(3) {
            self.exhausted = true;
            self.max_iterations = 0;
            return;
        }

        let epsilon = min_inliers as f64 / n as f64;
        let adaptive = if epsilon >= 1.0 {
            1
        } else {
            let denom = (1.0 - epsilon.powi(3)).ln();
            if denom.abs() < 1e-12 {
                1
            } else {
                ((1.0 - probability).ln() / denom).ceil() as usize
            }
        };
        self.max_iterations = adaptive.clamp(1, max_iterations);
    }

    /// Run up to `n` more RANSAC iterations. Returns a transform with its
    /// inlier mask (indexed like the correspondence set) as soon as a
    /// hypothesis reaches the inlier minimum.
    pub fn iterate(&mut self, n: usize) -> Option<(Sim3, Vec<bool>)> {
        if self.exhausted || self.pts_current.len() < 3 {
            self.exhausted = true;
            return None;
        }

        let num = self.pts_current.len();
        for _ in 0..n {
            if self.iterations_done >= self.max_iterations {
                break;
            }
            self.iterations_done += 1;

            let idx = sample_three(&mut self.rng, num);
            let sample_cand: Vec<_> = idx.iter().map(|&i| self.pts_candidate[i]).collect();
            let sample_curr: Vec<_> = idx.iter().map(|&i| self.pts_current[i]).collect();

            let Some(sim3) = solve_horn(&sample_cand, &sample_curr, self.fix_scale) else {
                continue;
            };

            let mut mask = vec![false; num];
            let mut count = 0;
            for i in 0..num {
                let err = (self.pts_current[i] - sim3.transform_point(&self.pts_candidate[i]))
                    .norm_squared();
                if err < INLIER_THRESHOLD * INLIER_THRESHOLD {
                    mask[i] = true;
                    count += 1;
                }
            }

            if count > self.best_num_inliers {
                self.best_num_inliers = count;
                self.best = Some((sim3, mask));
            }

            if count >= self.min_inliers {
                return self.best.clone();
            }
        }

        if self.iterations_done >= self.max_iterations {
            self.exhausted = true;
        }
        None
    }

    /// Whether the iteration budget is spent without a solution.
    pub fn terminate(&self) -> bool {
        self.exhausted
    }

    pub fn num_correspondences(&self) -> usize {
        self.pts_current.len()
    }

    /// Current-keyframe slot of correspondence `i` (for mapping inlier
    /// masks back onto per-slot matches).
    pub fn slot(&self, i: usize) -> usize {
        self.slots[i]
    }
}

/// Horn's closed-form absolute orientation: find `S` with
/// `target ≈ S * source`.
fn solve_horn(source: &[Vector3<f64>], target: &[Vector3<f64>], fix_scale: bool) -> Option<Sim3> {
    let n = source.len();
    if n < 3 || n != target.len() {
        return None;
    }

    let centroid_s: Vector3<f64> = source.iter().sum::<Vector3<f64>>() / n as f64;
    let centroid_t: Vector3<f64> = target.iter().sum::<Vector3<f64>>() / n as f64;

    let centered_s: Vec<_> = source.iter().map(|p| p - centroid_s).collect();
    let centered_t: Vec<_> = target.iter().map(|p| p - centroid_t).collect();

    let scale = if fix_scale {
        1.0
    } else {
        let sum_s: f64 = centered_s.iter().map(|p| p.norm_squared()).sum();
        let sum_t: f64 = centered_t.iter().map(|p| p.norm_squared()).sum();
        if sum_s < 1e-12 {
            return None;
        }
        (sum_t / sum_s).sqrt()
    };

    // Cross-covariance of source against target; R = V U^T maps source
    // directions onto target directions.
    let mut h = Matrix3::zeros();
    for (s, t) in centered_s.iter().zip(centered_t.iter()) {
        h += s * t.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation_mat = v_t.transpose() * u.transpose();
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(
        &nalgebra::Rotation3::from_matrix_unchecked(rotation_mat),
    );
    let translation = centroid_t - scale * (rotation * centroid_s);

    Some(Sim3::new(rotation, translation, scale))
}

/// Three distinct random indices in `0..n`.
fn sample_three(rng: &mut StdRng, n: usize) -> [usize; 3] {
    let mut idx = [rng.gen_range(0..n), 0, 0];
    loop {
        idx[1] = rng.gen_range(0..n);
        if idx[1] != idx[0] {
            break;
        }
    }
    loop {
        idx[2] = rng.gen_range(0..n);
        if idx[2] != idx[0] && idx[2] != idx[1] {
            break;
        }
    }
    idx
}
