//! Loop correction: rewrite the map so both sides of a detected loop agree.
//!
//! Applying a loop is the one place where the loop-closing thread mutates
//! the shared map wholesale. The sequence is fixed:
//!
//! 1. Stop the local mapper (and abort any running global BA) so no new
//!    keyframes land mid-correction.
//! 2. Under the map-update lock, propagate the verified similarity to the
//!    current keyframe's covisible neighborhood, move their map points, and
//!    write the corrected poses back as rigid transforms.
//! 3. Fuse the loop-side point cloud into the corrected neighborhood,
//!    replacing duplicates so both sides share landmarks.
//! 4. Detect the covisibility edges the fusion created across the loop and
//!    optimize the essential graph over them.
//! 5. Record the loop edge, bump the map's change counter, launch global
//!    bundle adjustment in the background, and release the local mapper.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::camera::CameraModel;
use crate::geometry::Sim3;
use crate::map::{KeyFrameId, MapPointId};
use crate::matcher::OrbMatcher;
use crate::optimizer::{optimize_essential_graph, EssentialGraphConfig};
use crate::system::SharedState;

use super::detector::Loop;
use super::global_ba_task::GlobalBundleTask;

/// Tunables for loop correction.
#[derive(Debug, Clone)]
pub struct CorrectorConfig {
    /// Projection radius for fusing loop points into the neighborhood, in
    /// pixels.
    pub fuse_search_radius: f64,

    /// Essential-graph optimization settings.
    pub essential_graph: EssentialGraphConfig,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            fuse_search_radius: 4.0,
            essential_graph: EssentialGraphConfig::default(),
        }
    }
}

/// Applies accepted loops to the shared map.
pub struct LoopCorrector {
    shared: Arc<SharedState>,
    camera: CameraModel,
    matcher: OrbMatcher,
    config: CorrectorConfig,
    fix_scale: bool,
}

impl LoopCorrector {
    pub fn new(
        shared: Arc<SharedState>,
        camera: CameraModel,
        fix_scale: bool,
        config: CorrectorConfig,
    ) -> Self {
        Self {
            shared,
            camera,
            matcher: OrbMatcher::new(0.8),
            config,
            fix_scale,
        }
    }

    /// Apply `accepted` at `current_id`. Pauses the local mapper for the
    /// duration and spawns a global-BA run on `gba` before returning.
    pub fn correct(&self, gba: &GlobalBundleTask, current_id: KeyFrameId, accepted: &Loop) {
        if self.shared.map.read().get_keyframe(current_id).is_none() {
            return;
        }

        info!(
            current = %current_id,
            matched = %accepted.matched_kf,
            "correcting loop"
        );

        // Freeze map producers: no keyframe insertion while the loop is
        // being applied, and any in-flight global BA is obsolete.
        self.shared.local_mapper.request_stop();
        if gba.is_running() {
            gba.stop();
        }
        while !self.shared.local_mapper.is_stopped() {
            thread::sleep(Duration::from_millis(1));
        }

        let mut corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
        let mut non_corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
        let connected: Vec<KeyFrameId>;

        {
            let mut map = self.shared.map.write();

            // The current keyframe's covisibility may be stale; refresh it
            // before collecting the neighborhood.
            map.update_connections(current_id);

            let current = match map.get_keyframe(current_id) {
                Some(kf) => kf,
                None => {
                    self.shared.local_mapper.release();
                    return;
                }
            };
            let mut neighborhood = current.covisible_keyframes();
            neighborhood.push(current_id);
            let t_wc = current.pose.inverse();

            // Propagate the verified similarity to every neighbor through
            // its relative pose to the current keyframe.
            corrected.insert(current_id, accepted.scw);
            for &kf_id in &neighborhood {
                let Some(kf) = map.get_keyframe(kf_id) else {
                    continue;
                };
                let t_iw = kf.pose;
                if kf_id != current_id {
                    let t_ic = t_iw * t_wc;
                    corrected.insert(kf_id, Sim3::from(t_ic) * accepted.scw);
                }
                non_corrected.insert(kf_id, Sim3::from(t_iw));
            }
            connected = neighborhood;

            // Move every map point seen by the neighborhood: out of the
            // world through the old pose, back in through the corrected
            // one. The stamp keeps points shared between neighbors from
            // being moved twice.
            for (&kf_id, corrected_siw) in &corrected {
                let Some(s_iw) = non_corrected.get(&kf_id) else {
                    continue;
                };
                let correction = corrected_siw.inverse() * *s_iw;

                let mp_ids: Vec<MapPointId> = map
                    .get_keyframe(kf_id)
                    .map(|kf| kf.map_point_indices().map(|(_, id)| id).collect())
                    .unwrap_or_default();
                for mp_id in mp_ids {
                    {
                        let Some(mp) = map.get_map_point_mut(mp_id) else {
                            continue;
                        };
                        if mp.is_bad || mp.corrected_by_kf == Some(current_id) {
                            continue;
                        }
                        mp.position = correction.transform_point(&mp.position);
                        mp.corrected_by_kf = Some(current_id);
                        mp.corrected_reference = Some(kf_id);
                    }
                    map.update_map_point_normal_and_depth(mp_id);
                }

                // Corrected similarity collapsed to a rigid pose: the map
                // stores SE3 only.
                if let Some(kf) = map.get_keyframe_mut(kf_id) {
                    kf.pose = corrected_siw.to_rigid();
                }
                map.update_connections(kf_id);
            }

            // Attach the matched loop points at the current keyframe:
            // replace where a point already occupies the slot, observe
            // otherwise.
            for (slot, matched) in accepted.matched_points.iter().enumerate() {
                let Some(loop_mp) = *matched else {
                    continue;
                };
                let existing = map.get_keyframe(current_id).and_then(|kf| kf.map_point(slot));
                match existing {
                    Some(current_mp) if current_mp != loop_mp => {
                        map.replace_map_point(current_mp, loop_mp);
                    }
                    Some(_) => {}
                    None => {
                        map.associate(current_id, slot, loop_mp);
                        map.compute_distinctive_descriptor(loop_mp);
                    }
                }
            }
        }

        // Project the whole loop-side cloud into each corrected keyframe;
        // duplicates found there are subsumed by their loop-side
        // counterparts. The lock is taken per neighbor so readers can
        // interleave.
        for (&kf_id, scw) in &corrected {
            let replacements = {
                let mut map = self.shared.map.write();
                self.matcher.fuse(
                    &mut map,
                    &self.camera,
                    kf_id,
                    scw,
                    &accepted.loop_map_points,
                    self.config.fuse_search_radius,
                )
            };

            let mut map = self.shared.map.write();
            for (i, replaced) in replacements.into_iter().enumerate() {
                if let Some(duplicate) = replaced {
                    if duplicate != accepted.loop_map_points[i] {
                        map.replace_map_point(duplicate, accepted.loop_map_points[i]);
                    }
                }
            }
        }

        // Fusion created fresh covisibility edges bridging the loop; those
        // are the constraints the essential graph hangs the correction on.
        let loop_connections: HashMap<KeyFrameId, HashSet<KeyFrameId>> = {
            let mut map = self.shared.map.write();
            let neighborhood: HashSet<KeyFrameId> = connected.iter().copied().collect();
            let mut found = HashMap::new();

            for &kf_id in &connected {
                let previous = map
                    .get_keyframe(kf_id)
                    .map(|kf| kf.covisible_set())
                    .unwrap_or_default();
                map.update_connections(kf_id);
                let mut fresh = map
                    .get_keyframe(kf_id)
                    .map(|kf| kf.covisible_set())
                    .unwrap_or_default();
                fresh.retain(|id| !previous.contains(id) && !neighborhood.contains(id));
                found.insert(kf_id, fresh);
            }
            found
        };

        optimize_essential_graph(
            &self.shared.map,
            accepted.matched_kf,
            current_id,
            &non_corrected,
            &corrected,
            &loop_connections,
            self.fix_scale,
            &self.config.essential_graph,
        );

        {
            let mut map = self.shared.map.write();
            map.inform_new_big_change();
            if let Some(kf) = map.get_keyframe_mut(accepted.matched_kf) {
                kf.add_loop_edge(current_id);
            }
            if let Some(kf) = map.get_keyframe_mut(current_id) {
                kf.add_loop_edge(accepted.matched_kf);
            }
        }

        gba.run(current_id);
        self.shared.local_mapper.release();

        info!(current = %current_id, "loop closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::{Feature, Map};
    use crate::optimizer::GlobalBaConfig;
    use crate::vocabulary::BowVector;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0)
    }

    fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if check() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached within timeout");
    }

    fn keyframe_with_slots(map: &mut Map, pose: SE3, n: usize) -> KeyFrameId {
        let features = (0..n)
            .map(|i| Feature {
                u: 100.0 + 40.0 * i as f64,
                v: 240.0,
                octave: 0,
            })
            .collect();
        map.create_keyframe(pose, features, vec![[0u8; 32]; n], BowVector::new())
    }

    struct Fixture {
        shared: Arc<SharedState>,
        gba: Arc<GlobalBundleTask>,
        corrector: LoopCorrector,
        current: KeyFrameId,
        matched: KeyFrameId,
    }

    /// A matched keyframe with loop-side points, and a current keyframe
    /// with its own points, far from each other in the keyframe-id space.
    fn build_fixture() -> (Fixture, Vec<MapPointId>) {
        let shared = SharedState::new();
        // No real mapping thread: mark it finished so stop waits pass.
        shared.local_mapper.set_finished();

        let (matched, current, loop_points);
        {
            let mut map = shared.map.write();
            matched = keyframe_with_slots(&mut map, SE3::identity(), 4);
            loop_points = (0..4)
                .map(|i| {
                    let mp = map.create_map_point(
                        Vector3::new(i as f64 * 0.5, 0.0, 5.0),
                        [0u8; 32],
                        matched,
                    );
                    map.associate(matched, i, mp);
                    mp
                })
                .collect::<Vec<_>>();

            current = keyframe_with_slots(&mut map, SE3::identity(), 4);
            for i in 0..2 {
                let mp = map.create_map_point(
                    Vector3::new(i as f64 * 0.5, 0.1, 5.0),
                    [0u8; 32],
                    current,
                );
                map.associate(current, i, mp);
            }
        }

        // Zero BA iterations: the background task still runs its full
        // protocol but stamps back the unchanged snapshot, keeping the
        // assertions below independent of optimizer behavior.
        let gba_config = GlobalBaConfig {
            iterations: 0,
            ..Default::default()
        };
        let gba = Arc::new(GlobalBundleTask::new(
            Arc::clone(&shared),
            camera(),
            gba_config,
        ));
        let corrector = LoopCorrector::new(
            Arc::clone(&shared),
            camera(),
            true,
            CorrectorConfig::default(),
        );

        (
            Fixture {
                shared,
                gba,
                corrector,
                current,
                matched,
            },
            loop_points,
        )
    }

    /// Stereo scale lock: a similarity with scale 1.1 must be written back
    /// as a rigid pose with the translation divided by the scale.
    #[test]
    fn test_scale_folded_into_written_pose() {
        let (fx, loop_points) = build_fixture();

        let scw = Sim3::new(
            UnitQuaternion::identity(),
            Vector3::new(0.22, 0.0, 0.0),
            1.1,
        );
        let accepted = Loop {
            matched_kf: fx.matched,
            scw,
            matched_points: vec![None; 4],
            loop_map_points: loop_points.clone(),
        };

        fx.corrector.correct(&fx.gba, fx.current, &accepted);

        let map = fx.shared.map.read();
        let pose = map.get_keyframe(fx.current).unwrap().pose;
        assert_relative_eq!(pose.translation.x, 0.22 / 1.1, epsilon = 1e-6);
        assert_eq!(
            map.get_map_point(loop_points[0]).map(|_| ()),
            Some(()),
            "loop points survive correction"
        );
    }

    #[test]
    fn test_correction_stamps_and_moves_neighborhood() {
        let (fx, loop_points) = build_fixture();

        // A covisible neighbor of the current keyframe with its own point.
        let (neighbor, neighbor_point);
        {
            let mut map = fx.shared.map.write();
            neighbor = keyframe_with_slots(&mut map, SE3::identity(), 1);
            neighbor_point =
                map.create_map_point(Vector3::new(0.0, -0.2, 4.0), [0u8; 32], neighbor);
            map.associate(neighbor, 0, neighbor_point);
            map.get_keyframe_mut(fx.current)
                .unwrap()
                .add_covisibility(neighbor, 30);
            map.get_keyframe_mut(neighbor)
                .unwrap()
                .add_covisibility(fx.current, 30);
        }

        // The loop says the current keyframe drifted by -0.4 in x.
        let scw = Sim3::new(
            UnitQuaternion::identity(),
            Vector3::new(0.4, 0.0, 0.0),
            1.0,
        );
        let accepted = Loop {
            matched_kf: fx.matched,
            scw,
            matched_points: vec![None; 4],
            loop_map_points: loop_points,
        };

        fx.corrector.correct(&fx.gba, fx.current, &accepted);

        let map = fx.shared.map.read();

        // The neighbor was dragged along with the current keyframe.
        let neighbor_pose = map.get_keyframe(neighbor).unwrap().pose;
        assert_relative_eq!(neighbor_pose.translation.x, 0.4, epsilon = 1e-6);

        // Its map point moved through the correction and was stamped.
        let point = map.get_map_point(neighbor_point).unwrap();
        assert_eq!(point.corrected_by_kf, Some(fx.current));
        assert_eq!(point.corrected_reference, Some(neighbor));
        assert_relative_eq!(point.position.x, -0.4, epsilon = 1e-6);

        // Loop edges recorded in both directions.
        assert!(map
            .get_keyframe(fx.current)
            .unwrap()
            .loop_edges()
            .contains(&fx.matched));
        assert!(map
            .get_keyframe(fx.matched)
            .unwrap()
            .loop_edges()
            .contains(&fx.current));
    }

    /// The matched loop points are attached at the current keyframe:
    /// occupied slots are replaced, free slots get a new observation.
    #[test]
    fn test_matched_points_fused_at_current_keyframe() {
        let (fx, loop_points) = build_fixture();

        let old_slot0 = fx
            .shared
            .map
            .read()
            .get_keyframe(fx.current)
            .unwrap()
            .map_point(0)
            .unwrap();

        let accepted = Loop {
            matched_kf: fx.matched,
            scw: Sim3::identity(),
            // Slot 0 is occupied by old_slot0, slot 2 is free.
            matched_points: vec![Some(loop_points[0]), None, Some(loop_points[2]), None],
            loop_map_points: loop_points.clone(),
        };

        fx.corrector.correct(&fx.gba, fx.current, &accepted);

        let map = fx.shared.map.read();
        // Replaced: the old point is a tombstone and the slot now holds the
        // loop-side point.
        assert!(map.get_map_point(old_slot0).unwrap().is_bad);
        assert_eq!(
            map.get_keyframe(fx.current).unwrap().map_point(0),
            Some(loop_points[0])
        );
        // Added: the free slot observes the loop-side point directly.
        assert_eq!(
            map.get_keyframe(fx.current).unwrap().map_point(2),
            Some(loop_points[2])
        );
        assert!(map
            .get_map_point(loop_points[2])
            .unwrap()
            .is_observed_by(fx.current));
    }

    /// Correcting a loop bumps the change counter once, and the spawned
    /// global BA bumps it a second time when it lands.
    #[test]
    fn test_big_change_counts_correction_and_global_ba() {
        let (fx, loop_points) = build_fixture();

        let accepted = Loop {
            matched_kf: fx.matched,
            scw: Sim3::identity(),
            matched_points: vec![None; 4],
            loop_map_points: loop_points,
        };

        fx.corrector.correct(&fx.gba, fx.current, &accepted);
        assert!(fx.shared.map.read().big_change_count() >= 1);

        wait_until(|| fx.gba.is_finished());
        assert_eq!(fx.shared.map.read().big_change_count(), 2);
        assert!(!fx.gba.is_running());
    }
}
