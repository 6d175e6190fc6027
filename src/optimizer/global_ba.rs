//! Global bundle adjustment.
//!
//! Refines every keyframe pose and map-point position by minimizing
//! reprojection error over the whole map. Runs in the background while local
//! mapping keeps extending the map, so results are not written to the live
//! poses: they land in the `*_gba` scratch fields, stamped with the loop
//! keyframe id, and the global-BA task later propagates them through the
//! spanning tree under the map-update lock.
//!
//! The solve polls a stop flag between iterations; an aborted run still
//! stamps whatever it converged to, and the owner decides whether to discard
//! it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector2, Vector3};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::camera::CameraModel;
use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPointId};

/// Configuration for global bundle adjustment.
#[derive(Debug, Clone)]
pub struct GlobalBaConfig {
    /// Maximum LM iterations.
    pub iterations: usize,

    /// Huber kernel threshold in pixels.
    pub huber_threshold: f64,

    /// Convergence threshold on the update norm.
    pub param_tolerance: f64,

    /// Convergence threshold on the gradient norm.
    pub gradient_tolerance: f64,
}

impl Default for GlobalBaConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            huber_threshold: 5.991_f64.sqrt(),
            param_tolerance: 1e-6,
            gradient_tolerance: 1e-6,
        }
    }
}

/// Snapshot of the optimization problem, taken under the read guard.
pub struct GlobalBaProblem {
    kf_ids: Vec<KeyFrameId>,
    kf_poses: HashMap<KeyFrameId, SE3>,
    mp_ids: Vec<MapPointId>,
    mp_positions: HashMap<MapPointId, Vector3<f64>>,
    /// (keyframe, point, observed pixel).
    observations: Vec<(KeyFrameId, MapPointId, Vector2<f64>)>,
    fixed_kf: KeyFrameId,
}

/// Optimized poses and positions.
pub struct GlobalBaResult {
    pub poses: HashMap<KeyFrameId, SE3>,
    pub points: HashMap<MapPointId, Vector3<f64>>,
}

/// Run the three phases end to end. Returns false when the map has nothing
/// to optimize.
pub fn global_bundle_adjustment(
    map_lock: &RwLock<Map>,
    camera: &CameraModel,
    config: &GlobalBaConfig,
    stop: &AtomicBool,
    loop_kf: KeyFrameId,
) -> bool {
    let problem = {
        let map = map_lock.read();
        collect_global_ba_data(&map)
    };

    let Some(problem) = problem else {
        debug!("global BA: nothing to optimize");
        return false;
    };

    let Some(result) = solve_global_ba(&problem, camera, config, stop) else {
        return false;
    };

    {
        let mut map = map_lock.write();
        stamp_global_ba_results(&mut map, &result, loop_kf);
    }

    info!(
        keyframes = result.poses.len(),
        points = result.points.len(),
        "global BA stamped results"
    );
    true
}

// ── Phase 1: collect ─────────────────────────────────────────────────────

pub fn collect_global_ba_data(map: &Map) -> Option<GlobalBaProblem> {
    let mut kf_ids: Vec<KeyFrameId> = map
        .keyframes()
        .filter(|kf| !kf.is_bad)
        .map(|kf| kf.id)
        .collect();
    if kf_ids.len() < 2 {
        return None;
    }
    kf_ids.sort();
    let fixed_kf = kf_ids[0];

    let mut kf_poses = HashMap::new();
    for &id in &kf_ids {
        kf_poses.insert(id, map.get_keyframe(id)?.pose);
    }

    let mut mp_ids = Vec::new();
    let mut mp_positions = HashMap::new();
    let mut observations = Vec::new();

    for mp in map.map_points() {
        if mp.is_bad {
            continue;
        }
        let mut observed = false;
        for (&kf_id, &slot) in &mp.observations {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad {
                continue;
            }
            let Some(feature) = kf.features.get(slot) else {
                continue;
            };
            observations.push((kf_id, mp.id, Vector2::new(feature.u, feature.v)));
            observed = true;
        }
        if observed {
            mp_ids.push(mp.id);
            mp_positions.insert(mp.id, mp.position);
        }
    }

    if mp_ids.is_empty() || observations.is_empty() {
        return None;
    }
    mp_ids.sort();

    Some(GlobalBaProblem {
        kf_ids,
        kf_poses,
        mp_ids,
        mp_positions,
        observations,
        fixed_kf,
    })
}

// ── Phase 2: solve ───────────────────────────────────────────────────────

pub fn solve_global_ba(
    problem: &GlobalBaProblem,
    camera: &CameraModel,
    config: &GlobalBaConfig,
    stop: &AtomicBool,
) -> Option<GlobalBaResult> {
    let free_kfs: Vec<KeyFrameId> = problem
        .kf_ids
        .iter()
        .copied()
        .filter(|&id| id != problem.fixed_kf)
        .collect();
    let kf_param: HashMap<KeyFrameId, usize> = free_kfs
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();
    let mp_param: HashMap<MapPointId, usize> = problem
        .mp_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();

    let n_kf_params = free_kfs.len() * 6;
    let n_params = n_kf_params + problem.mp_ids.len() * 3;
    let n_residuals = problem.observations.len() * 2;
    if n_params == 0 {
        return None;
    }

    let mut params = DVector::zeros(n_params);
    for (&id, &i) in &kf_param {
        let pose = problem.kf_poses[&id];
        let omega = pose.rotation.scaled_axis();
        let base = i * 6;
        params[base] = omega.x;
        params[base + 1] = omega.y;
        params[base + 2] = omega.z;
        params[base + 3] = pose.translation.x;
        params[base + 4] = pose.translation.y;
        params[base + 5] = pose.translation.z;
    }
    for (&id, &i) in &mp_param {
        let pos = problem.mp_positions[&id];
        let base = n_kf_params + i * 3;
        params[base] = pos.x;
        params[base + 1] = pos.y;
        params[base + 2] = pos.z;
    }

    let fixed_pose = problem.kf_poses[&problem.fixed_kf];

    let pose_of = |p: &DVector<f64>, id: KeyFrameId| -> SE3 {
        match kf_param.get(&id) {
            Some(&i) => {
                let base = i * 6;
                let omega = Vector3::new(p[base], p[base + 1], p[base + 2]);
                SE3::new(
                    UnitQuaternion::from_scaled_axis(omega),
                    Vector3::new(p[base + 3], p[base + 4], p[base + 5]),
                )
            }
            None => fixed_pose,
        }
    };
    let point_of = |p: &DVector<f64>, id: MapPointId| -> Vector3<f64> {
        let i = mp_param[&id];
        let base = n_kf_params + i * 3;
        Vector3::new(p[base], p[base + 1], p[base + 2])
    };

    let residuals_of = |p: &DVector<f64>| -> DVector<f64> {
        let mut r = DVector::zeros(n_residuals);
        for (i, (kf_id, mp_id, observed)) in problem.observations.iter().enumerate() {
            let pose = pose_of(p, *kf_id);
            let point = point_of(p, *mp_id);
            let p_cam = pose.transform_point(&point);

            let error = match camera.project(&p_cam) {
                Some((u, v)) => *observed - Vector2::new(u, v),
                None => Vector2::new(100.0, 100.0),
            };

            // Huber reweighting keeps gross outliers from dominating.
            let norm = error.norm();
            let weight = if norm <= config.huber_threshold {
                1.0
            } else {
                (config.huber_threshold / norm).sqrt()
            };
            r[i * 2] = error.x * weight;
            r[i * 2 + 1] = error.y * weight;
        }
        r
    };

    let mut lambda = 1e-3;
    let mut current = params;

    for _ in 0..config.iterations {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let residuals = residuals_of(&current);
        let current_error = residuals.norm_squared();

        // Numerical Jacobian, perturbing only the parameters each
        // observation depends on.
        let eps = 1e-6;
        let mut jacobian = DMatrix::zeros(n_residuals, n_params);
        for (i, (kf_id, mp_id, observed)) in problem.observations.iter().enumerate() {
            let mut cols: Vec<usize> = Vec::with_capacity(9);
            if let Some(&k) = kf_param.get(kf_id) {
                cols.extend((k * 6)..(k * 6 + 6));
            }
            let m = mp_param[mp_id];
            cols.extend((n_kf_params + m * 3)..(n_kf_params + m * 3 + 3));

            for &col in &cols {
                let mut plus = current.clone();
                let mut minus = current.clone();
                plus[col] += eps;
                minus[col] -= eps;

                let ep = observation_residual(&plus, *kf_id, *mp_id, observed, camera, &pose_of, &point_of, config);
                let em = observation_residual(&minus, *kf_id, *mp_id, observed, camera, &pose_of, &point_of, config);
                jacobian[(i * 2, col)] = (ep.x - em.x) / (2.0 * eps);
                jacobian[(i * 2 + 1, col)] = (ep.y - em.y) / (2.0 * eps);
            }
        }

        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < config.gradient_tolerance {
            break;
        }

        let mut jtj = jacobian.transpose() * &jacobian;
        for i in 0..n_params {
            jtj[(i, i)] += lambda * jtj[(i, i)].max(1e-6);
        }

        let Some(delta) = jtj.lu().solve(&(-&gradient)) else {
            break;
        };
        if delta.norm() < config.param_tolerance * (current.norm() + config.param_tolerance) {
            break;
        }

        let trial = &current + &delta;
        if residuals_of(&trial).norm_squared() < current_error {
            current = trial;
            lambda = (lambda * 0.1).max(1e-10);
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    let mut poses = HashMap::new();
    poses.insert(problem.fixed_kf, fixed_pose);
    for &id in &free_kfs {
        poses.insert(id, pose_of(&current, id));
    }
    let mut points = HashMap::new();
    for &id in &problem.mp_ids {
        points.insert(id, point_of(&current, id));
    }

    Some(GlobalBaResult { poses, points })
}

#[allow(clippy::too_many_arguments)]
fn observation_residual(
    params: &DVector<f64>,
    kf_id: KeyFrameId,
    mp_id: MapPointId,
    observed: &Vector2<f64>,
    camera: &CameraModel,
    pose_of: &impl Fn(&DVector<f64>, KeyFrameId) -> SE3,
    point_of: &impl Fn(&DVector<f64>, MapPointId) -> Vector3<f64>,
    config: &GlobalBaConfig,
) -> Vector2<f64> {
    let pose = pose_of(params, kf_id);
    let point = point_of(params, mp_id);
    let p_cam = pose.transform_point(&point);

    let error = match camera.project(&p_cam) {
        Some((u, v)) => *observed - Vector2::new(u, v),
        None => Vector2::new(100.0, 100.0),
    };
    let norm = error.norm();
    let weight = if norm <= config.huber_threshold {
        1.0
    } else {
        (config.huber_threshold / norm).sqrt()
    };
    error * weight
}

// ── Phase 3: stamp ───────────────────────────────────────────────────────

/// Write results into the `*_gba` scratch fields and stamp every touched
/// entity with the loop keyframe id. Live poses and positions are not
/// modified here.
pub fn stamp_global_ba_results(map: &mut Map, result: &GlobalBaResult, loop_kf: KeyFrameId) {
    for (&kf_id, &pose) in &result.poses {
        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            kf.tcw_gba = Some(pose);
            kf.ba_global_for_kf = Some(loop_kf);
        }
    }
    for (&mp_id, &position) in &result.points {
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.pos_gba = Some(position);
            mp.ba_global_for_kf = Some(loop_kf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Feature;
    use crate::vocabulary::BowVector;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0)
    }

    /// Two exact keyframes and a third with a perturbed pose, all observing
    /// the same grid of points.
    fn build_map(perturb: Vector3<f64>) -> (Map, Vec<KeyFrameId>, Vec<MapPointId>) {
        let cam = camera();
        let mut map = Map::new();

        let positions: Vec<Vector3<f64>> = (0..12)
            .map(|i| {
                Vector3::new(
                    ((i % 4) as f64 - 1.5) * 0.8,
                    ((i / 4) as f64 - 1.0) * 0.8,
                    6.0 + (i % 3) as f64 * 0.5,
                )
            })
            .collect();

        let true_poses = [
            SE3::identity(),
            SE3::new(UnitQuaternion::identity(), Vector3::new(-0.4, 0.0, 0.0)),
            SE3::new(UnitQuaternion::identity(), Vector3::new(-0.8, 0.0, 0.0)),
        ];

        let mut kf_ids = Vec::new();
        for (k, true_pose) in true_poses.iter().enumerate() {
            // Features at the exact projections under the TRUE pose.
            let feats: Vec<Feature> = positions
                .iter()
                .map(|p| {
                    let (u, v) = cam.project(&true_pose.transform_point(p)).unwrap();
                    Feature { u, v, octave: 0 }
                })
                .collect();
            let stored_pose = if k == 2 {
                SE3::new(true_pose.rotation, true_pose.translation + perturb)
            } else {
                *true_pose
            };
            let n = feats.len();
            kf_ids.push(map.create_keyframe(stored_pose, feats, vec![[0u8; 32]; n], BowVector::new()));
        }

        let mut mp_ids = Vec::new();
        for (i, p) in positions.iter().enumerate() {
            let mp = map.create_map_point(*p, [0u8; 32], kf_ids[0]);
            for &kf in &kf_ids {
                map.associate(kf, i, mp);
            }
            mp_ids.push(mp);
        }

        (map, kf_ids, mp_ids)
    }

    #[test]
    fn test_ba_corrects_perturbed_pose_into_scratch_fields() {
        let (map, kf_ids, mp_ids) = build_map(Vector3::new(0.05, -0.03, 0.02));
        let lock = RwLock::new(map);
        let stop = AtomicBool::new(false);
        let loop_kf = KeyFrameId::new(99);

        let ran = global_bundle_adjustment(
            &lock,
            &camera(),
            &GlobalBaConfig::default(),
            &stop,
            loop_kf,
        );
        assert!(ran);

        let map = lock.read();
        let kf2 = map.get_keyframe(kf_ids[2]).unwrap();

        // Live pose untouched; scratch fields stamped.
        assert_relative_eq!(kf2.pose.translation.x, -0.75, epsilon = 1e-9);
        assert_eq!(kf2.ba_global_for_kf, Some(loop_kf));
        let optimized = kf2.tcw_gba.expect("scratch pose must be stamped");
        assert!(
            (optimized.translation.x - (-0.8)).abs() < 0.02,
            "BA should pull the pose toward truth, got {}",
            optimized.translation.x
        );

        for &mp in &mp_ids {
            let mp_ref = map.get_map_point(mp).unwrap();
            assert_eq!(mp_ref.ba_global_for_kf, Some(loop_kf));
            assert!(mp_ref.pos_gba.is_some());
        }
    }

    #[test]
    fn test_stop_flag_aborts_iterations() {
        let (map, _, _) = build_map(Vector3::new(0.3, 0.0, 0.0));
        let lock = RwLock::new(map);
        let stop = AtomicBool::new(true); // set before the first iteration

        let ran = global_bundle_adjustment(
            &lock,
            &camera(),
            &GlobalBaConfig::default(),
            &stop,
            KeyFrameId::new(7),
        );
        // A stopped run still stamps its (unimproved) snapshot; the caller
        // decides whether to discard it.
        assert!(ran);

        let map = lock.read();
        for kf in map.keyframes() {
            let stamped = kf.tcw_gba.unwrap();
            assert_relative_eq!(
                stamped.translation.x,
                kf.pose.translation.x,
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_empty_map_is_skipped() {
        let lock = RwLock::new(Map::new());
        let stop = AtomicBool::new(false);
        assert!(!global_bundle_adjustment(
            &lock,
            &camera(),
            &GlobalBaConfig::default(),
            &stop,
            KeyFrameId::new(1),
        ));
    }
}
