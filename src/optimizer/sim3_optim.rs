//! Nonlinear refinement of a two-keyframe similarity transform.
//!
//! Starting from the RANSAC estimate, refines the Sim3 mapping candidate
//! camera coordinates into current camera coordinates by minimizing
//! bidirectional reprojection error over all correspondences, then prunes
//! matches whose error exceeds the chi-square bound.

use nalgebra::{DMatrix, DVector, Vector2, Vector3};

use crate::camera::CameraModel;
use crate::geometry::Sim3;
use crate::map::{KeyFrame, Map, MapPointId};

/// Residual weight for points projecting behind a camera.
const BEHIND_CAMERA_ERROR: f64 = 1e3;

struct Correspondence {
    slot: usize,
    /// Map point of the current keyframe, in its camera frame.
    x1: Vector3<f64>,
    /// Matched map point of the candidate keyframe, in its camera frame.
    x2: Vector3<f64>,
    /// Observed pixel in the current keyframe.
    obs1: Vector2<f64>,
    /// Observed pixel in the candidate keyframe.
    obs2: Vector2<f64>,
}

/// Refine `s12` over the per-slot matches between `kf1` (current) and `kf2`
/// (candidate). Matches whose reprojection chi-square exceeds `max_chi2` in
/// either image are nulled out. Returns the number of surviving inliers.
pub fn optimize_sim3(
    map: &Map,
    camera: &CameraModel,
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    matches: &mut [Option<MapPointId>],
    s12: &mut Sim3,
    max_chi2: f64,
    fix_scale: bool,
) -> usize {
    let mut correspondences = collect_correspondences(map, kf1, kf2, matches);
    if correspondences.is_empty() {
        return 0;
    }

    let mut estimate = *s12;

    // Two rounds: refine, drop outliers, refine the survivors.
    for round in 0..2 {
        estimate = solve_lm(&correspondences, camera, &estimate, fix_scale, 10);

        if round == 0 {
            let mut kept = Vec::new();
            for corr in correspondences.drain(..) {
                let (chi1, chi2) = edge_chi2(&corr, camera, &estimate);
                if chi1 > max_chi2 || chi2 > max_chi2 {
                    matches[corr.slot] = None;
                } else {
                    kept.push(corr);
                }
            }
            correspondences = kept;
            if correspondences.is_empty() {
                return 0;
            }
        }
    }

    *s12 = estimate;
    correspondences.len()
}

fn collect_correspondences(
    map: &Map,
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    matches: &[Option<MapPointId>],
) -> Vec<Correspondence> {
    let mut out = Vec::new();

    for (slot, matched) in matches.iter().enumerate() {
        let Some(mp2_id) = matched else {
            continue;
        };
        let Some(mp1_id) = kf1.map_point(slot) else {
            continue;
        };
        let (Some(mp1), Some(mp2)) = (map.get_map_point(mp1_id), map.get_map_point(*mp2_id))
        else {
            continue;
        };
        if mp1.is_bad || mp2.is_bad {
            continue;
        }
        // The matched point must itself be observed in the candidate frame.
        let Some(&slot2) = mp2.observations.get(&kf2.id) else {
            continue;
        };
        let (Some(f1), Some(f2)) = (kf1.features.get(slot), kf2.features.get(slot2)) else {
            continue;
        };

        out.push(Correspondence {
            slot,
            x1: kf1.pose.transform_point(&mp1.position),
            x2: kf2.pose.transform_point(&mp2.position),
            obs1: Vector2::new(f1.u, f1.v),
            obs2: Vector2::new(f2.u, f2.v),
        });
    }

    out
}

/// Reprojection residuals of one correspondence under `s12`:
/// the candidate point into image 1 and the current point into image 2.
fn edge_residuals(
    corr: &Correspondence,
    camera: &CameraModel,
    s12: &Sim3,
) -> (Vector2<f64>, Vector2<f64>) {
    let r12 = match camera.project(&s12.transform_point(&corr.x2)) {
        Some((u, v)) => corr.obs1 - Vector2::new(u, v),
        None => Vector2::new(BEHIND_CAMERA_ERROR, BEHIND_CAMERA_ERROR),
    };
    let r21 = match camera.project(&s12.inverse().transform_point(&corr.x1)) {
        Some((u, v)) => corr.obs2 - Vector2::new(u, v),
        None => Vector2::new(BEHIND_CAMERA_ERROR, BEHIND_CAMERA_ERROR),
    };
    (r12, r21)
}

fn edge_chi2(corr: &Correspondence, camera: &CameraModel, s12: &Sim3) -> (f64, f64) {
    let (r12, r21) = edge_residuals(corr, camera, s12);
    (r12.norm_squared(), r21.norm_squared())
}

/// Levenberg-Marquardt over the Sim3 tangent with numerical Jacobians.
fn solve_lm(
    correspondences: &[Correspondence],
    camera: &CameraModel,
    initial: &Sim3,
    fix_scale: bool,
    max_iterations: usize,
) -> Sim3 {
    let n_params = if fix_scale { 6 } else { 7 };
    let n_residuals = correspondences.len() * 4;

    let mut params = DVector::zeros(n_params);
    let tangent = initial.log();
    for i in 0..n_params {
        params[i] = tangent[i];
    }

    let residuals_of = |p: &DVector<f64>| -> DVector<f64> {
        let s = sim3_from_params(p, fix_scale);
        let mut r = DVector::zeros(n_residuals);
        for (i, corr) in correspondences.iter().enumerate() {
            let (r12, r21) = edge_residuals(corr, camera, &s);
            r[i * 4] = r12.x;
            r[i * 4 + 1] = r12.y;
            r[i * 4 + 2] = r21.x;
            r[i * 4 + 3] = r21.y;
        }
        r
    };

    let mut lambda = 1e-3;

    for _ in 0..max_iterations {
        let residuals = residuals_of(&params);
        let current_error = residuals.norm_squared();

        // Central-difference Jacobian.
        let eps = 1e-6;
        let mut jacobian = DMatrix::zeros(n_residuals, n_params);
        for p in 0..n_params {
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus[p] += eps;
            minus[p] -= eps;
            let rp = residuals_of(&plus);
            let rm = residuals_of(&minus);
            for r in 0..n_residuals {
                jacobian[(r, p)] = (rp[r] - rm[r]) / (2.0 * eps);
            }
        }

        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < 1e-8 {
            break;
        }

        let mut jtj = jacobian.transpose() * &jacobian;
        for i in 0..n_params {
            jtj[(i, i)] += lambda * jtj[(i, i)].max(1e-6);
        }

        let Some(delta) = jtj.lu().solve(&(-&gradient)) else {
            break;
        };
        if delta.norm() < 1e-10 {
            break;
        }

        let trial = &params + &delta;
        if residuals_of(&trial).norm_squared() < current_error {
            params = trial;
            lambda = (lambda * 0.1).max(1e-10);
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    sim3_from_params(&params, fix_scale)
}

fn sim3_from_params(params: &DVector<f64>, fix_scale: bool) -> Sim3 {
    let mut tangent = [0.0; 7];
    let n = if fix_scale { 6 } else { 7 };
    for i in 0..n {
        tangent[i] = params[i];
    }
    Sim3::exp(&tangent)
}
