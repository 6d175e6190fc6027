//! Essential-graph optimization after a loop closure.
//!
//! Distributes the loop-closing correction over the whole keyframe graph by
//! optimizing Sim3 poses subject to relative-pose constraints from the
//! spanning tree, existing loop edges, strong covisibility edges and the new
//! loop connections. Map points are then rigidly carried along with their
//! reference keyframes.
//!
//! Runs in three phases so the map lock is only held to snapshot the graph
//! and to write results back:
//! 1. COLLECT (read guard): nodes, seed estimates and constraint edges.
//! 2. SOLVE (no lock): Levenberg-Marquardt over the Sim3 tangents.
//! 3. APPLY (write guard): pose write-back and map-point correction.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::geometry::Sim3;
use crate::map::{KeyFrameId, Map};

/// Configuration for essential-graph optimization.
#[derive(Debug, Clone)]
pub struct EssentialGraphConfig {
    /// Maximum LM iterations.
    pub max_iterations: usize,

    /// Minimum shared-point weight for a covisibility constraint.
    pub min_covisibility_weight: usize,

    /// Convergence threshold on the update norm.
    pub param_tolerance: f64,

    /// Convergence threshold on the gradient norm.
    pub gradient_tolerance: f64,
}

impl Default for EssentialGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            min_covisibility_weight: 100,
            param_tolerance: 1e-6,
            gradient_tolerance: 1e-6,
        }
    }
}

/// A relative-pose constraint between two graph nodes.
struct Edge {
    from: KeyFrameId,
    to: KeyFrameId,
    /// Measured `S_to_from` (maps `from`-camera coordinates into
    /// `to`-camera coordinates).
    measurement: Sim3,
}

struct Problem {
    /// Node ids in parameter order.
    node_ids: Vec<KeyFrameId>,
    /// Seed estimate per node (`S_iw`).
    estimates: HashMap<KeyFrameId, Sim3>,
    edges: Vec<Edge>,
    fixed: KeyFrameId,
}

/// Optimize the essential graph and write the corrected poses and map-point
/// positions back to the map.
pub fn optimize_essential_graph(
    map_lock: &RwLock<Map>,
    loop_kf: KeyFrameId,
    current_kf: KeyFrameId,
    non_corrected: &HashMap<KeyFrameId, Sim3>,
    corrected: &HashMap<KeyFrameId, Sim3>,
    loop_connections: &HashMap<KeyFrameId, HashSet<KeyFrameId>>,
    fix_scale: bool,
    config: &EssentialGraphConfig,
) {
    let problem = {
        let map = map_lock.read();
        collect(
            &map,
            loop_kf,
            current_kf,
            non_corrected,
            corrected,
            loop_connections,
            config,
        )
    };

    let Some(problem) = problem else {
        debug!("essential graph: nothing to optimize");
        return;
    };

    let optimized = solve(&problem, fix_scale, config);

    {
        let mut map = map_lock.write();
        apply(&mut map, current_kf, &problem, &optimized);
    }

    info!(
        nodes = problem.node_ids.len(),
        edges = problem.edges.len(),
        "essential graph optimized"
    );
}

// ── Phase 1: collect ─────────────────────────────────────────────────────

fn collect(
    map: &Map,
    loop_kf: KeyFrameId,
    current_kf: KeyFrameId,
    non_corrected: &HashMap<KeyFrameId, Sim3>,
    corrected: &HashMap<KeyFrameId, Sim3>,
    loop_connections: &HashMap<KeyFrameId, HashSet<KeyFrameId>>,
    config: &EssentialGraphConfig,
) -> Option<Problem> {
    let mut node_ids: Vec<KeyFrameId> = map
        .keyframes()
        .filter(|kf| !kf.is_bad)
        .map(|kf| kf.id)
        .collect();
    if node_ids.len() < 2 {
        return None;
    }
    node_ids.sort();

    // Seed estimate: the corrected pose where the corrector computed one,
    // the current map pose otherwise.
    let mut estimates = HashMap::new();
    // Pre-correction estimate used for measurement construction.
    let mut measured = HashMap::new();
    for &id in &node_ids {
        let kf = map.get_keyframe(id)?;
        let raw = Sim3::from(kf.pose);
        estimates.insert(id, corrected.get(&id).copied().unwrap_or(raw));
        measured.insert(id, non_corrected.get(&id).copied().unwrap_or(raw));
    }

    let mut edges = Vec::new();
    let mut inserted: HashSet<(KeyFrameId, KeyFrameId)> = HashSet::new();
    let mut mark = |a: KeyFrameId, b: KeyFrameId| inserted.insert((a.min(b), a.max(b)));

    // New loop connections, measured from the corrected estimates.
    for (&id, others) in loop_connections {
        let Some(kf) = map.get_keyframe(id) else {
            continue;
        };
        let Some(s_iw) = estimates.get(&id) else {
            continue;
        };
        for &other in others {
            // Weak pairs are skipped except for the closure itself.
            if (id != current_kf || other != loop_kf)
                && kf.covisibility_weight(other) < config.min_covisibility_weight
            {
                continue;
            }
            let Some(s_jw) = estimates.get(&other) else {
                continue;
            };
            if !mark(id, other) {
                continue;
            }
            edges.push(Edge {
                from: id,
                to: other,
                measurement: *s_jw * s_iw.inverse(),
            });
        }
    }

    // Spanning tree, previous loop edges and strong covisibility edges,
    // measured from the pre-correction poses.
    for &id in &node_ids {
        let kf = map.get_keyframe(id)?;
        let s_wi = measured.get(&id)?.inverse();

        let mut add_edge = |other: KeyFrameId, edges: &mut Vec<Edge>| {
            if let Some(s_jw) = measured.get(&other) {
                if mark(id, other) {
                    edges.push(Edge {
                        from: id,
                        to: other,
                        measurement: *s_jw * s_wi,
                    });
                }
            }
        };

        if let Some(parent) = kf.parent_id {
            add_edge(parent, &mut edges);
        }
        for &loop_edge in kf.loop_edges() {
            if loop_edge < id {
                add_edge(loop_edge, &mut edges);
            }
        }
        for (&other, &weight) in kf.covisibility_weights() {
            if other < id
                && weight >= config.min_covisibility_weight
                && Some(other) != kf.parent_id
                && !kf.children_ids.contains(&other)
            {
                add_edge(other, &mut edges);
            }
        }
    }

    if edges.is_empty() || !estimates.contains_key(&loop_kf) {
        return None;
    }

    Some(Problem {
        node_ids,
        estimates,
        edges,
        fixed: loop_kf,
    })
}

// ── Phase 2: solve ───────────────────────────────────────────────────────

fn solve(
    problem: &Problem,
    fix_scale: bool,
    config: &EssentialGraphConfig,
) -> HashMap<KeyFrameId, Sim3> {
    let params_per_node = if fix_scale { 6 } else { 7 };

    let free_nodes: Vec<KeyFrameId> = problem
        .node_ids
        .iter()
        .copied()
        .filter(|&id| id != problem.fixed)
        .collect();
    let node_param: HashMap<KeyFrameId, usize> = free_nodes
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();

    let n_params = free_nodes.len() * params_per_node;
    let n_residuals = problem.edges.len() * params_per_node;
    let fixed_pose = problem.estimates[&problem.fixed];

    if n_params == 0 {
        return problem.estimates.clone();
    }

    let mut params = DVector::zeros(n_params);
    for (i, &id) in free_nodes.iter().enumerate() {
        let tangent = problem.estimates[&id].log();
        for k in 0..params_per_node {
            params[i * params_per_node + k] = tangent[k];
        }
    }

    let pose_of = |p: &DVector<f64>, id: KeyFrameId| -> Sim3 {
        match node_param.get(&id) {
            Some(&i) => {
                let mut tangent = [0.0; 7];
                for k in 0..params_per_node {
                    tangent[k] = p[i * params_per_node + k];
                }
                Sim3::exp(&tangent)
            }
            None => fixed_pose,
        }
    };

    // Residual of an edge: log(Sji^-1 * Sj * Si^-1), zero when the estimate
    // agrees with the measurement.
    let residuals_of = |p: &DVector<f64>| -> DVector<f64> {
        let mut r = DVector::zeros(n_residuals);
        for (e, edge) in problem.edges.iter().enumerate() {
            let s_i = pose_of(p, edge.from);
            let s_j = pose_of(p, edge.to);
            let error = (edge.measurement.inverse() * (s_j * s_i.inverse())).log();
            for k in 0..params_per_node {
                r[e * params_per_node + k] = error[k];
            }
        }
        r
    };

    let mut lambda = 1e-3;

    for _ in 0..config.max_iterations {
        let residuals = residuals_of(&params);
        let current_error = residuals.norm_squared();

        let eps = 1e-6;
        let mut jacobian = DMatrix::zeros(n_residuals, n_params);
        // Only the two nodes of an edge influence its residual; perturb
        // parameters edge-locally to keep the numerical Jacobian affordable.
        for (e, edge) in problem.edges.iter().enumerate() {
            for &id in &[edge.from, edge.to] {
                let Some(&node_idx) = node_param.get(&id) else {
                    continue;
                };
                for k in 0..params_per_node {
                    let col = node_idx * params_per_node + k;
                    let mut plus = params.clone();
                    let mut minus = params.clone();
                    plus[col] += eps;
                    minus[col] -= eps;

                    let s_i_p = pose_of(&plus, edge.from);
                    let s_j_p = pose_of(&plus, edge.to);
                    let err_p = (edge.measurement.inverse() * (s_j_p * s_i_p.inverse())).log();
                    let s_i_m = pose_of(&minus, edge.from);
                    let s_j_m = pose_of(&minus, edge.to);
                    let err_m = (edge.measurement.inverse() * (s_j_m * s_i_m.inverse())).log();

                    for r in 0..params_per_node {
                        jacobian[(e * params_per_node + r, col)] =
                            (err_p[r] - err_m[r]) / (2.0 * eps);
                    }
                }
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
        if delta.norm() < config.param_tolerance * (params.norm() + config.param_tolerance) {
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

    let mut optimized = HashMap::new();
    optimized.insert(problem.fixed, fixed_pose);
    for &id in &free_nodes {
        optimized.insert(id, pose_of(&params, id));
    }
    optimized
}

// ── Phase 3: apply ───────────────────────────────────────────────────────

fn apply(
    map: &mut Map,
    current_kf: KeyFrameId,
    problem: &Problem,
    optimized: &HashMap<KeyFrameId, Sim3>,
) {
    // Pose write-back: Sim3 collapsed to a rigid pose.
    for (&id, s_iw) in optimized {
        if let Some(kf) = map.get_keyframe_mut(id) {
            if !kf.is_bad {
                kf.pose = s_iw.to_rigid();
            }
        }
    }

    // Carry each map point with its reference keyframe: map through the
    // reference's pre-optimization estimate, then back out through the
    // optimized one.
    let mp_ids: Vec<_> = map.map_point_ids().collect();
    for mp_id in mp_ids {
        let reference = {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            if mp.corrected_by_kf == Some(current_kf) {
                mp.corrected_reference.unwrap_or(mp.reference_kf_id)
            } else {
                mp.reference_kf_id
            }
        };

        let (Some(s_rw), Some(s_rw_opt)) =
            (problem.estimates.get(&reference), optimized.get(&reference))
        else {
            continue;
        };
        let correction = s_rw_opt.inverse();

        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = correction.transform_point(&s_rw.transform_point(&mp.position));
        }
        map.update_map_point_normal_and_depth(mp_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::Map;
    use crate::vocabulary::BowVector;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn keyframe_at(map: &mut Map, x: f64) -> KeyFrameId {
        // T_cw with camera center at (x, 0, 0).
        let pose = SE3::new(UnitQuaternion::identity(), Vector3::new(-x, 0.0, 0.0));
        map.create_keyframe(pose, Vec::new(), Vec::new(), BowVector::new())
    }

    /// A chain 0-1-2-3 with drift on the last node, closed by a loop edge
    /// back to the first. The optimizer should pull node 3 toward its
    /// drift-free position.
    #[test]
    fn test_loop_edge_reduces_drift() {
        let lock = RwLock::new(Map::new());
        let (k0, k1, k2, k3);
        {
            let mut map = lock.write();
            k0 = keyframe_at(&mut map, 0.0);
            k1 = keyframe_at(&mut map, 1.0);
            k2 = keyframe_at(&mut map, 2.0);
            // Drift: the map believes k3 is at x = 2.6 when it is at 2.0
            // (the camera returned next to k2's position).
            k3 = keyframe_at(&mut map, 2.6);

            for (child, parent) in [(k1, k0), (k2, k1), (k3, k2)] {
                map.get_keyframe_mut(child).unwrap().set_parent(parent);
                map.get_keyframe_mut(parent).unwrap().add_child(child);
            }
        }

        // The verified closure says k3 really sits at x = 2.0.
        let corrected_pose = Sim3::from(SE3::new(
            UnitQuaternion::identity(),
            Vector3::new(-2.0, 0.0, 0.0),
        ));
        let drifted_pose = Sim3::from(lock.read().get_keyframe(k3).unwrap().pose);

        let mut non_corrected = HashMap::new();
        non_corrected.insert(k3, drifted_pose);
        let mut corrected = HashMap::new();
        corrected.insert(k3, corrected_pose);

        let mut loop_connections = HashMap::new();
        loop_connections.insert(k3, HashSet::from([k0]));

        optimize_essential_graph(
            &lock,
            k0,
            k3,
            &non_corrected,
            &corrected,
            &loop_connections,
            true,
            &EssentialGraphConfig::default(),
        );

        let map = lock.read();
        // The fixed node is untouched.
        assert_relative_eq!(
            map.get_keyframe(k0).unwrap().pose.translation.x,
            0.0,
            epsilon = 1e-9
        );
        // The loop node moved from its drifted estimate toward the closure.
        let x3 = -map.get_keyframe(k3).unwrap().pose.translation.x;
        assert!(
            (x3 - 2.0).abs() < 0.3,
            "loop node should move near x=2.0, got {x3}"
        );
    }

    #[test]
    fn test_map_points_follow_reference_keyframe() {
        let lock = RwLock::new(Map::new());
        let (k0, k1, mp);
        {
            let mut map = lock.write();
            k0 = keyframe_at(&mut map, 0.0);
            k1 = keyframe_at(&mut map, 1.0);
            map.get_keyframe_mut(k1).unwrap().set_parent(k0);
            map.get_keyframe_mut(k0).unwrap().add_child(k1);

            // A point 5m in front of k1, already moved and stamped by the
            // corrector for the claimed pose of k1 at x = 1.5.
            mp = map.create_map_point(Vector3::new(1.5, 0.0, 5.0), [0u8; 32], k1);
            let point = map.get_map_point_mut(mp).unwrap();
            point.corrected_by_kf = Some(k1);
            point.corrected_reference = Some(k1);
        }

        // Claim k1 actually sits at x = 1.5.
        let corrected_pose = Sim3::from(SE3::new(
            UnitQuaternion::identity(),
            Vector3::new(-1.5, 0.0, 0.0),
        ));
        let drifted_pose = Sim3::from(SE3::new(
            UnitQuaternion::identity(),
            Vector3::new(-1.0, 0.0, 0.0),
        ));

        let mut non_corrected = HashMap::new();
        non_corrected.insert(k1, drifted_pose);
        let mut corrected = HashMap::new();
        corrected.insert(k1, corrected_pose);
        let mut loop_connections = HashMap::new();
        loop_connections.insert(k1, HashSet::from([k0]));

        optimize_essential_graph(
            &lock,
            k0,
            k1,
            &non_corrected,
            &corrected,
            &loop_connections,
            true,
            &EssentialGraphConfig::default(),
        );

        // Wherever the optimizer settles k1, the point keeps its offset
        // (straight ahead at depth 5) from the reference keyframe.
        let map = lock.read();
        let pos = map.get_map_point(mp).unwrap().position;
        let center = map.get_keyframe(k1).unwrap().pose.camera_center();
        assert!(
            (pos.x - center.x).abs() < 0.05,
            "point x={} should track reference center x={}",
            pos.x,
            center.x
        );
        assert!(pos.x > 1.0, "point should have moved with the correction");
    }

    #[test]
    fn test_fix_scale_keeps_rigid_poses() {
        let lock = RwLock::new(Map::new());
        let (k0, k1);
        {
            let mut map = lock.write();
            k0 = keyframe_at(&mut map, 0.0);
            k1 = keyframe_at(&mut map, 1.0);
            map.get_keyframe_mut(k1).unwrap().set_parent(k0);
            map.get_keyframe_mut(k0).unwrap().add_child(k1);
        }

        // With fix_scale the solve runs on rigid tangents and the written
        // pose stays a finite rigid transform.
        let corrected = HashMap::from([(
            k1,
            Sim3::new(UnitQuaternion::identity(), Vector3::new(-1.1, 0.0, 0.0), 1.0),
        )]);
        let non_corrected = HashMap::from([(
            k1,
            Sim3::from(lock.read().get_keyframe(k1).unwrap().pose),
        )]);
        let loop_connections = HashMap::from([(k1, HashSet::from([k0]))]);

        optimize_essential_graph(
            &lock,
            k0,
            k1,
            &non_corrected,
            &corrected,
            &loop_connections,
            true,
            &EssentialGraphConfig::default(),
        );

        // Pose write-back happened and produced a finite rigid pose.
        let map = lock.read();
        let pose = map.get_keyframe(k1).unwrap().pose;
        assert!(pose.translation.iter().all(|v| v.is_finite()));
    }
}
