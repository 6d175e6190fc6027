//! Loop detection: place recognition, temporal consistency, and geometric
//! verification.
//!
//! Detection runs in three stages on every keyframe leaving the local
//! mapper:
//!
//! 1. **Candidate retrieval** — the keyframe database returns keyframes
//!    whose BoW similarity beats the weakest covisible neighbor of the
//!    current keyframe.
//! 2. **Temporal consistency** — a candidate is only trusted once its
//!    covisibility group has been re-detected over enough consecutive
//!    keyframes.
//! 3. **Similarity estimation** — surviving candidates compete in a
//!    round-robin RANSAC for a Sim3 that aligns the two sides of the loop;
//!    the winner is densified by guided matching and accepted only if
//!    enough current-keyframe slots end up matched to loop-side points.
//!
//! The detector only ever takes shared map guards; candidates under
//! evaluation are protected from culling with `set_not_erase` brackets.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::camera::CameraModel;
use crate::geometry::Sim3;
use crate::map::{KeyFrameId, MapPointId};
use crate::matcher::OrbMatcher;
use crate::optimizer::optimize_sim3;
use crate::system::SharedState;
use crate::vocabulary;

use super::sim3_solver::Sim3Solver;

/// Tunables for loop detection.
#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Minimum keyframe-id gap since the last accepted loop.
    pub min_keyframe_gap: u64,

    /// Consecutive keyframes that must agree before a candidate is
    /// geometrically verified.
    pub min_consistency: usize,

    /// Minimum BoW matches to set up a similarity solver for a candidate.
    pub min_bow_matches: usize,

    /// Minimum inliers after nonlinear refinement.
    pub min_refined_inliers: usize,

    /// Minimum matched current-keyframe slots to accept the loop.
    pub min_accept_matches: usize,

    /// RANSAC success probability.
    pub ransac_probability: f64,

    /// RANSAC minimum inliers.
    pub ransac_min_inliers: usize,

    /// RANSAC iteration cap per candidate.
    pub ransac_max_iterations: usize,

    /// RANSAC iterations per candidate per round-robin pass.
    pub ransac_iterations_per_pass: usize,

    /// Guided-matching radius after a RANSAC hypothesis, in pixels.
    pub sim3_search_radius: f64,

    /// Projection radius for the extended loop-side gather, in pixels.
    pub projection_search_radius: f64,

    /// Chi-square bound for pruning matches during Sim3 refinement.
    pub sim3_max_chi2: f64,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            min_keyframe_gap: 10,
            min_consistency: 3,
            min_bow_matches: 20,
            min_refined_inliers: 20,
            min_accept_matches: 40,
            ransac_probability: 0.99,
            ransac_min_inliers: 20,
            ransac_max_iterations: 300,
            ransac_iterations_per_pass: 5,
            sim3_search_radius: 7.5,
            projection_search_radius: 10.0,
            sim3_max_chi2: 10.0,
        }
    }
}

/// An accepted loop, handed to the corrector.
#[derive(Debug, Clone)]
pub struct Loop {
    /// Historical keyframe closing the loop.
    pub matched_kf: KeyFrameId,

    /// Corrected world-to-camera Sim3 of the current keyframe.
    pub scw: Sim3,

    /// Per current-keyframe slot: the loop-side map point matched there.
    pub matched_points: Vec<Option<MapPointId>>,

    /// Map points visible from the matched keyframe and its neighbors.
    pub loop_map_points: Vec<MapPointId>,
}

/// A candidate's covisibility group with its consecutive-detection count.
struct ConsistentGroup {
    keyframes: HashSet<KeyFrameId>,
    consistency: usize,
}

/// The loop-detection state machine.
pub struct LoopDetector {
    camera: CameraModel,
    fix_scale: bool,
    config: LoopDetectorConfig,
    matcher: OrbMatcher,
    prev_consistent_groups: Vec<ConsistentGroup>,
}

impl LoopDetector {
    pub fn new(camera: CameraModel, fix_scale: bool, config: LoopDetectorConfig) -> Self {
        Self {
            camera,
            fix_scale,
            config,
            matcher: OrbMatcher::new(0.75),
            prev_consistent_groups: Vec::new(),
        }
    }

    /// Decide whether `current_id` closes a loop. `last_loop_kf_id` is the
    /// id of the keyframe at which the previous loop was accepted (0 if
    /// none).
    pub fn detect(
        &mut self,
        shared: &SharedState,
        current_id: KeyFrameId,
        last_loop_kf_id: u64,
    ) -> Option<Loop> {
        // Back-to-back acceptances on the same revisit are pointless; give
        // the map time to move on.
        if current_id.0 < last_loop_kf_id + self.config.min_keyframe_gap {
            return None;
        }

        // Candidate retrieval: the loop must look more similar than the
        // weakest covisible neighbor.
        let candidates = {
            let map = shared.map.read();
            let current = map.get_keyframe(current_id)?;

            let mut min_score = 1.0f64;
            for neighbor_id in current.covisible_keyframes() {
                let Some(neighbor) = map.get_keyframe(neighbor_id) else {
                    continue;
                };
                if neighbor.is_bad {
                    continue;
                }
                min_score = min_score.min(vocabulary::score(&current.bow, &neighbor.bow));
            }

            let db = shared.keyframe_db.lock();
            db.detect_loop_candidates(&map, current_id, min_score)
        };

        if candidates.is_empty() {
            self.prev_consistent_groups.clear();
            return None;
        }

        // Temporal consistency over the candidates' covisibility groups.
        let candidate_groups: Vec<(KeyFrameId, HashSet<KeyFrameId>)> = {
            let map = shared.map.read();
            candidates
                .iter()
                .map(|&id| {
                    let mut group = map
                        .get_keyframe(id)
                        .map(|kf| kf.covisible_set())
                        .unwrap_or_default();
                    group.insert(id);
                    (id, group)
                })
                .collect()
        };

        let admitted = self.check_consistency(candidate_groups);
        if admitted.is_empty() {
            return None;
        }
        debug!(
            current = %current_id,
            candidates = admitted.len(),
            "temporally consistent loop candidates"
        );

        // Geometric verification.
        let Some((matched_kf, scw, mut matched_points)) =
            self.compute_sim3(shared, current_id, &admitted)
        else {
            let map = shared.map.read();
            for &id in &admitted {
                if let Some(kf) = map.get_keyframe(id) {
                    kf.set_erase();
                }
            }
            if let Some(kf) = map.get_keyframe(current_id) {
                kf.set_erase();
            }
            return None;
        };

        // Gather the loop-side point cloud (matched keyframe + neighbors),
        // deduplicated with the per-pass stamp, and project it into the
        // current keyframe for additional matches.
        let total_matches = {
            let map = shared.map.read();
            let matched = map.get_keyframe(matched_kf)?;
            let mut loop_keyframes = matched.covisible_keyframes();
            loop_keyframes.push(matched_kf);

            let mut loop_map_points = Vec::new();
            for kf_id in loop_keyframes {
                let Some(kf) = map.get_keyframe(kf_id) else {
                    continue;
                };
                for (_, mp_id) in kf.map_point_indices() {
                    let Some(mp) = map.get_map_point(mp_id) else {
                        continue;
                    };
                    if mp.is_bad {
                        continue;
                    }
                    if mp.stamp_loop_point(current_id) {
                        loop_map_points.push(mp_id);
                    }
                }
            }

            let current = map.get_keyframe(current_id)?;
            self.matcher.search_by_projection(
                &map,
                &self.camera,
                current,
                &scw,
                &loop_map_points,
                &mut matched_points,
                self.config.projection_search_radius,
            );

            let total = matched_points.iter().filter(|m| m.is_some()).count();
            if total >= self.config.min_accept_matches {
                // Keep the matched keyframe protected; release the rest.
                for &id in &admitted {
                    if id != matched_kf {
                        if let Some(kf) = map.get_keyframe(id) {
                            kf.set_erase();
                        }
                    }
                }
                Some((total, loop_map_points))
            } else {
                for &id in &admitted {
                    if let Some(kf) = map.get_keyframe(id) {
                        kf.set_erase();
                    }
                }
                if let Some(kf) = map.get_keyframe(current_id) {
                    kf.set_erase();
                }
                None
            }
        };

        let (total, loop_map_points) = total_matches?;
        info!(
            current = %current_id,
            matched = %matched_kf,
            matches = total,
            "loop accepted"
        );

        Some(Loop {
            matched_kf,
            scw,
            matched_points,
            loop_map_points,
        })
    }

    /// Update the consistent-group cache with this keyframe's candidate
    /// groups and return the candidates whose groups have now been seen
    /// over `min_consistency` consecutive keyframes.
    ///
    /// Each previous group contributes to at most one current group, and
    /// each candidate is admitted at most once. Groups without a consistent
    /// predecessor are kept with count zero so they can start a streak on
    /// the next keyframe.
    fn check_consistency(
        &mut self,
        candidate_groups: Vec<(KeyFrameId, HashSet<KeyFrameId>)>,
    ) -> Vec<KeyFrameId> {
        let mut admitted = Vec::new();
        let mut current_groups: Vec<ConsistentGroup> = Vec::new();
        let mut consumed = vec![false; self.prev_consistent_groups.len()];

        for (candidate, group) in candidate_groups {
            let consistent_prev: Vec<usize> = self
                .prev_consistent_groups
                .iter()
                .enumerate()
                .filter(|(_, prev)| !prev.keyframes.is_disjoint(&group))
                .map(|(i, _)| i)
                .collect();

            let mut candidate_admitted = false;
            for &ig in &consistent_prev {
                let consistency = self.prev_consistent_groups[ig].consistency + 1;
                if !consumed[ig] {
                    current_groups.push(ConsistentGroup {
                        keyframes: group.clone(),
                        consistency,
                    });
                    consumed[ig] = true;
                }
                // `consistency` counts group-to-group links; links + 1
                // consecutive keyframes have agreed at this point.
                if consistency + 1 >= self.config.min_consistency && !candidate_admitted {
                    admitted.push(candidate);
                    candidate_admitted = true;
                }
            }

            if consistent_prev.is_empty() {
                current_groups.push(ConsistentGroup {
                    keyframes: group,
                    consistency: 0,
                });
            }
        }

        self.prev_consistent_groups = current_groups;
        admitted
    }

    /// Round-robin RANSAC over the admitted candidates, then guided
    /// matching and nonlinear refinement of the winner.
    ///
    /// Returns the matched keyframe, the corrected world-to-camera Sim3 of
    /// the current keyframe, and the per-slot loop-side matches. Candidates
    /// are `set_not_erase`-bracketed for the duration; on failure the
    /// caller releases them.
    fn compute_sim3(
        &self,
        shared: &SharedState,
        current_id: KeyFrameId,
        admitted: &[KeyFrameId],
    ) -> Option<(KeyFrameId, Sim3, Vec<Option<MapPointId>>)> {
        struct Candidate {
            id: KeyFrameId,
            solver: Sim3Solver,
            matches: Vec<Option<MapPointId>>,
            discarded: bool,
        }

        let map = shared.map.read();
        let current = map.get_keyframe(current_id)?;

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut remaining = 0usize;

        for &candidate_id in admitted {
            let Some(candidate_kf) = map.get_keyframe(candidate_id) else {
                continue;
            };
            // Keep the candidate alive while this thread works on it.
            candidate_kf.set_not_erase();
            if candidate_kf.is_bad {
                continue;
            }

            let matches = self.matcher.search_by_bow(&map, current, candidate_kf);
            let num_matches = matches.iter().filter(|m| m.is_some()).count();
            if num_matches < self.config.min_bow_matches {
                continue;
            }

            let mut solver =
                Sim3Solver::new(&map, current, candidate_kf, &matches, self.fix_scale);
            solver.set_ransac_parameters(
                self.config.ransac_probability,
                self.config.ransac_min_inliers,
                self.config.ransac_max_iterations,
            );
            candidates.push(Candidate {
                id: candidate_id,
                solver,
                matches,
                discarded: false,
            });
            remaining += 1;
        }

        // Alternate a few iterations per candidate until one produces a
        // transform or all of them exhaust their budgets.
        while remaining > 0 {
            for candidate in candidates.iter_mut().filter(|c| !c.discarded) {
                let hypothesis = candidate
                    .solver
                    .iterate(self.config.ransac_iterations_per_pass);

                if let Some((scm, inlier_mask)) = hypothesis {
                    let candidate_kf = map.get_keyframe(candidate.id)?;

                    // Keep only the inlier matches, then densify and refine.
                    let mut matches: Vec<Option<MapPointId>> =
                        vec![None; current.num_features()];
                    for (k, &is_inlier) in inlier_mask.iter().enumerate() {
                        if is_inlier {
                            let slot = candidate.solver.slot(k);
                            matches[slot] = candidate.matches[slot];
                        }
                    }

                    self.matcher.search_by_sim3(
                        &map,
                        &self.camera,
                        current,
                        candidate_kf,
                        &mut matches,
                        &scm,
                        self.config.sim3_search_radius,
                    );

                    let mut s12 = scm;
                    let inliers = optimize_sim3(
                        &map,
                        &self.camera,
                        current,
                        candidate_kf,
                        &mut matches,
                        &mut s12,
                        self.config.sim3_max_chi2,
                        self.fix_scale,
                    );

                    if inliers >= self.config.min_refined_inliers {
                        let smw = Sim3::from(candidate_kf.pose);
                        return Some((candidate.id, s12 * smw, matches));
                    }
                }

                if candidate.solver.terminate() {
                    candidate.discarded = true;
                    remaining -= 1;
                }
            }
        }

        None
    }
}
