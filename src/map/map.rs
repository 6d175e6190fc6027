//! Map: sole owner of the keyframe and map-point pools.
//!
//! All cross-references between entities are ids resolved through the map,
//! so there are no ownership cycles and culling is a tombstone operation.
//! The map is shared across threads behind a `RwLock`; the write guard is
//! the map-update lock every bulk mutation (loop correction, global-BA
//! write-back) must hold.

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use crate::geometry::SE3;
use crate::matcher::hamming_distance;
use crate::vocabulary::BowVector;

use super::keyframe::{Feature, KeyFrame, ORB_NUM_LEVELS, ORB_SCALE_FACTOR};
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Minimum number of shared map points for a covisibility edge.
const MIN_SHARED_POINTS: usize = 15;

/// The SLAM map.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    /// Spanning-tree roots, in creation order.
    origins: Vec<KeyFrameId>,

    next_kf_id: u64,
    next_mp_id: u64,

    /// Bumped after every loop correction and global-BA write-back so
    /// consumers (trajectory export, viewers) know the whole map moved.
    big_changes: u64,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            origins: Vec::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            big_changes: 0,
        }
    }

    // ── Big-change counter ───────────────────────────────────────────────

    pub fn inform_new_big_change(&mut self) {
        self.big_changes += 1;
    }

    pub fn big_change_count(&self) -> u64 {
        self.big_changes
    }

    // ── Keyframes ────────────────────────────────────────────────────────

    /// Create a keyframe and insert it into the map. The first keyframe
    /// becomes a spanning-tree origin.
    pub fn create_keyframe(
        &mut self,
        pose: SE3,
        features: Vec<Feature>,
        descriptors: Vec<[u8; 32]>,
        bow: BowVector,
    ) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;

        let kf = KeyFrame::new(id, pose, features, descriptors, bow);
        if self.keyframes.is_empty() {
            self.origins.push(id);
        }
        self.keyframes.insert(id, kf);
        id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.keyframes.keys().copied()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn origins(&self) -> &[KeyFrameId] {
        &self.origins
    }

    // ── Map points ───────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: [u8; 32],
        reference_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, reference_kf_id));
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn map_point_ids(&self) -> impl Iterator<Item = MapPointId> + '_ {
        self.map_points.keys().copied()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    // ── Associations ─────────────────────────────────────────────────────

    /// Create a bidirectional association between a keyframe slot and a map
    /// point, updating covisibility weights with the point's other
    /// observers. Returns false if either entity is missing.
    pub fn associate(&mut self, kf_id: KeyFrameId, slot: usize, mp_id: MapPointId) -> bool {
        let other_observers: Vec<KeyFrameId> = match self.map_points.get(&mp_id) {
            Some(mp) => mp
                .observations
                .keys()
                .copied()
                .filter(|&id| id != kf_id)
                .collect(),
            None => return false,
        };

        if !self.keyframes.contains_key(&kf_id) {
            return false;
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, slot);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(slot, mp_id);
        }

        for other_id in other_observers {
            let weight = self
                .keyframes
                .get(&other_id)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_id, weight);
            }
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.add_covisibility(kf_id, weight);
            }
        }

        true
    }

    /// Remove the association at a keyframe slot. Returns the map point
    /// that was associated, if any.
    pub fn erase_association(&mut self, kf_id: KeyFrameId, slot: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get(&kf_id)?.map_point(slot)?;

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_map_point(slot);
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }

        Some(mp_id)
    }

    // ── Covisibility refresh ─────────────────────────────────────────────

    /// Rebuild a keyframe's covisibility edges from its current map-point
    /// observations. Pairs sharing at least [`MIN_SHARED_POINTS`] points are
    /// connected; if no pair reaches the threshold, the single best pair is
    /// kept so the graph stays connected. The first refresh of an unattached
    /// keyframe also hooks it into the spanning tree under its best
    /// covisible neighbor.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let mut counts: HashMap<KeyFrameId, usize> = HashMap::new();
        {
            let Some(kf) = self.keyframes.get(&kf_id) else {
                return;
            };
            for (_, mp_id) in kf.map_point_indices() {
                let Some(mp) = self.map_points.get(&mp_id) else {
                    continue;
                };
                if mp.is_bad {
                    continue;
                }
                for &other_id in mp.observations.keys() {
                    if other_id != kf_id {
                        *counts.entry(other_id).or_insert(0) += 1;
                    }
                }
            }
        }

        if counts.is_empty() {
            return;
        }

        let (best_id, best_weight) = counts
            .iter()
            .map(|(&id, &w)| (id, w))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .unwrap();

        let mut kept: HashMap<KeyFrameId, usize> = counts
            .into_iter()
            .filter(|&(_, w)| w >= MIN_SHARED_POINTS)
            .collect();
        if kept.is_empty() {
            kept.insert(best_id, best_weight);
        }

        for (&other_id, &weight) in &kept {
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.add_covisibility(kf_id, weight);
            }
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_covisibility(kept);
        }

        // Spanning-tree attachment on the first refresh.
        let needs_parent = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.parent_id.is_none() && !self.origins.contains(&kf_id))
            .unwrap_or(false);
        if needs_parent {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_parent(best_id);
            }
            if let Some(parent) = self.keyframes.get_mut(&best_id) {
                parent.add_child(kf_id);
            }
        }
    }

    // ── Map-point replacement ────────────────────────────────────────────

    /// Replace `old_id` by `new_id` everywhere: observations of the old
    /// point are rewired to the new one (or dropped where the new point is
    /// already observed), visibility statistics are merged, and the old
    /// point becomes a tombstone.
    pub fn replace_map_point(&mut self, old_id: MapPointId, new_id: MapPointId) {
        if old_id == new_id || !self.map_points.contains_key(&new_id) {
            return;
        }

        let (observations, visible, found) = match self.map_points.get_mut(&old_id) {
            Some(old) => {
                let obs: Vec<(KeyFrameId, usize)> =
                    old.observations.iter().map(|(&k, &s)| (k, s)).collect();
                let stats = (old.visible_count, old.found_count);
                old.set_bad();
                (obs, stats.0, stats.1)
            }
            None => return,
        };

        for (kf_id, slot) in observations {
            let already_observed = self
                .map_points
                .get(&new_id)
                .map(|mp| mp.is_observed_by(kf_id))
                .unwrap_or(false);

            if already_observed {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    if kf.map_point(slot) == Some(old_id) {
                        kf.erase_map_point(slot);
                    }
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_map_point(slot, new_id);
                }
                if let Some(mp) = self.map_points.get_mut(&new_id) {
                    mp.add_observation(kf_id, slot);
                }
            }
        }

        if let Some(mp) = self.map_points.get_mut(&new_id) {
            mp.visible_count += visible;
            mp.found_count += found;
        }
        self.compute_distinctive_descriptor(new_id);

        debug!("replaced {} with {}", old_id, new_id);
    }

    // ── Descriptor / viewing-geometry maintenance ────────────────────────

    /// Pick the observation descriptor with the least median Hamming
    /// distance to the others as the point's representative descriptor.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let descriptors: Vec<[u8; 32]> = match self.map_points.get(&mp_id) {
            Some(mp) => mp
                .observations
                .iter()
                .filter_map(|(&kf_id, &slot)| {
                    self.keyframes
                        .get(&kf_id)
                        .and_then(|kf| kf.descriptors.get(slot))
                        .copied()
                })
                .collect(),
            None => return,
        };

        if descriptors.is_empty() {
            return;
        }

        let mut best_idx = 0;
        let mut best_median = u32::MAX;
        for (i, di) in descriptors.iter().enumerate() {
            let mut dists: Vec<u32> = descriptors
                .iter()
                .map(|dj| hamming_distance(di, dj))
                .collect();
            dists.sort_unstable();
            let median = dists[dists.len() / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.descriptor = descriptors[best_idx];
        }
    }

    /// Recompute a map point's viewing normal and distance range from its
    /// observers' camera centers.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let centers: Vec<Vector3<f64>> = match self.map_points.get(&mp_id) {
            Some(mp) => mp
                .observations
                .keys()
                .filter_map(|kf_id| self.keyframes.get(kf_id).map(|kf| kf.camera_center()))
                .collect(),
            None => return,
        };

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centers.iter(), ORB_SCALE_FACTOR, ORB_NUM_LEVELS);
        }
    }

    // ── Culling ──────────────────────────────────────────────────────────

    /// Tombstone a keyframe: detach its observations and graph edges and
    /// reparent its spanning-tree children. Returns false when the cull is
    /// deferred (the keyframe is guarded by the loop closer) or the
    /// keyframe is an origin.
    pub fn cull_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        if self.origins.contains(&kf_id) {
            return false;
        }
        {
            let Some(kf) = self.keyframes.get(&kf_id) else {
                return false;
            };
            if !kf.is_erasable() {
                kf.defer_erase();
                return false;
            }
        }

        let (associations, covisibles, parent_id, children) = {
            let kf = self.keyframes.get(&kf_id).unwrap();
            (
                kf.map_point_indices().collect::<Vec<_>>(),
                kf.covisible_set(),
                kf.parent_id,
                kf.children_ids.iter().copied().collect::<Vec<_>>(),
            )
        };

        for (_, mp_id) in associations {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id);
            }
        }
        for other_id in covisibles {
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.erase_covisibility(kf_id);
            }
        }

        let new_parent = parent_id.unwrap_or_else(|| self.origins[0]);
        for child_id in &children {
            if let Some(child) = self.keyframes.get_mut(child_id) {
                child.set_parent(new_parent);
            }
            if let Some(parent) = self.keyframes.get_mut(&new_parent) {
                parent.add_child(*child_id);
            }
        }
        if let Some(parent) = parent_id.and_then(|id| self.keyframes.get_mut(&id)) {
            parent.erase_child(kf_id);
        }

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.is_bad = true;
            kf.set_covisibility(HashMap::new());
            kf.children_ids.clear();
        }

        true
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.origins.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
        self.big_changes = 0;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("keyframes", &self.keyframes.len())
            .field("map_points", &self.map_points.len())
            .field("big_changes", &self.big_changes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyframe_with_slots(map: &mut Map, n: usize) -> KeyFrameId {
        let features = (0..n)
            .map(|i| Feature {
                u: 10.0 * i as f64,
                v: 10.0 * i as f64,
                octave: 0,
            })
            .collect();
        map.create_keyframe(SE3::identity(), features, vec![[0u8; 32]; n], BowVector::new())
    }

    #[test]
    fn test_first_keyframe_is_origin() {
        let mut map = Map::new();
        let kf0 = keyframe_with_slots(&mut map, 0);
        let _kf1 = keyframe_with_slots(&mut map, 0);
        assert_eq!(map.origins(), &[kf0]);
    }

    #[test]
    fn test_associate_updates_covisibility() {
        let mut map = Map::new();
        let kf1 = keyframe_with_slots(&mut map, 10);
        let kf2 = keyframe_with_slots(&mut map, 10);
        let mp = map.create_map_point(Vector3::zeros(), [0u8; 32], kf1);

        assert!(map.associate(kf1, 0, mp));
        assert!(map.associate(kf2, 3, mp));

        assert_eq!(map.get_map_point(mp).unwrap().num_observations(), 2);
        assert_eq!(map.get_keyframe(kf2).unwrap().map_point(3), Some(mp));
        assert_eq!(map.get_keyframe(kf1).unwrap().covisibility_weight(kf2), 1);
        assert_eq!(map.get_keyframe(kf2).unwrap().covisibility_weight(kf1), 1);
    }

    #[test]
    fn test_update_connections_threshold_and_fallback() {
        let mut map = Map::new();
        let kf1 = keyframe_with_slots(&mut map, 40);
        let kf2 = keyframe_with_slots(&mut map, 40);
        let kf3 = keyframe_with_slots(&mut map, 40);

        // kf1 shares 20 points with kf2 and 3 with kf3.
        for i in 0..20 {
            let mp = map.create_map_point(Vector3::zeros(), [0u8; 32], kf1);
            map.associate(kf1, i, mp);
            map.associate(kf2, i, mp);
        }
        for i in 20..23 {
            let mp = map.create_map_point(Vector3::zeros(), [0u8; 32], kf1);
            map.associate(kf1, i, mp);
            map.associate(kf3, i, mp);
        }

        map.update_connections(kf1);
        let kf1_ref = map.get_keyframe(kf1).unwrap();
        // kf2 passes the threshold, kf3 does not.
        assert_eq!(kf1_ref.covisibility_weight(kf2), 20);
        assert_eq!(kf1_ref.covisibility_weight(kf3), 0);

        // A keyframe whose best pair is below the threshold keeps that pair.
        map.update_connections(kf3);
        assert_eq!(map.get_keyframe(kf3).unwrap().covisibility_weight(kf1), 3);
    }

    #[test]
    fn test_update_connections_attaches_spanning_tree() {
        let mut map = Map::new();
        let kf1 = keyframe_with_slots(&mut map, 40);
        let kf2 = keyframe_with_slots(&mut map, 40);
        for i in 0..16 {
            let mp = map.create_map_point(Vector3::zeros(), [0u8; 32], kf1);
            map.associate(kf1, i, mp);
            map.associate(kf2, i, mp);
        }

        map.update_connections(kf2);
        assert_eq!(map.get_keyframe(kf2).unwrap().parent_id, Some(kf1));
        assert!(map.get_keyframe(kf1).unwrap().children_ids.contains(&kf2));

        // Origins never get a parent.
        map.update_connections(kf1);
        assert_eq!(map.get_keyframe(kf1).unwrap().parent_id, None);
    }

    #[test]
    fn test_replace_map_point_subsumes_observations() {
        let mut map = Map::new();
        let kf1 = keyframe_with_slots(&mut map, 10);
        let kf2 = keyframe_with_slots(&mut map, 10);

        let old = map.create_map_point(Vector3::zeros(), [0u8; 32], kf1);
        let new = map.create_map_point(Vector3::new(0.0, 0.0, 1.0), [0xffu8; 32], kf1);

        map.associate(kf1, 0, old);
        map.associate(kf2, 1, old);
        map.associate(kf2, 2, new); // new already observed by kf2

        map.replace_map_point(old, new);

        let old_mp = map.get_map_point(old).unwrap();
        assert!(old_mp.is_bad);
        assert_eq!(old_mp.num_observations(), 0);

        // kf1's slot was rewired, kf2's duplicate slot was dropped.
        assert_eq!(map.get_keyframe(kf1).unwrap().map_point(0), Some(new));
        assert_eq!(map.get_keyframe(kf2).unwrap().map_point(1), None);
        assert_eq!(map.get_keyframe(kf2).unwrap().map_point(2), Some(new));
        assert!(map.get_map_point(new).unwrap().is_observed_by(kf1));
    }

    #[test]
    fn test_replace_is_idempotent_and_self_safe() {
        let mut map = Map::new();
        let kf = keyframe_with_slots(&mut map, 5);
        let mp = map.create_map_point(Vector3::zeros(), [0u8; 32], kf);
        map.associate(kf, 0, mp);

        map.replace_map_point(mp, mp);
        assert!(!map.get_map_point(mp).unwrap().is_bad);
    }

    #[test]
    fn test_distinctive_descriptor_prefers_consensus() {
        let mut map = Map::new();
        let kf1 = keyframe_with_slots(&mut map, 2);
        let kf2 = keyframe_with_slots(&mut map, 2);
        let kf3 = keyframe_with_slots(&mut map, 2);

        // Two near-identical descriptors and one outlier.
        map.get_keyframe_mut(kf1).unwrap().descriptors[0] = [0u8; 32];
        map.get_keyframe_mut(kf2).unwrap().descriptors[0] = {
            let mut d = [0u8; 32];
            d[0] = 0x01;
            d
        };
        map.get_keyframe_mut(kf3).unwrap().descriptors[0] = [0xffu8; 32];

        let mp = map.create_map_point(Vector3::zeros(), [0xAAu8; 32], kf1);
        map.associate(kf1, 0, mp);
        map.associate(kf2, 0, mp);
        map.associate(kf3, 0, mp);

        map.compute_distinctive_descriptor(mp);
        let d = map.get_map_point(mp).unwrap().descriptor;
        assert!(d == [0u8; 32] || d[0] == 0x01);
    }

    #[test]
    fn test_cull_respects_guard() {
        let mut map = Map::new();
        let _origin = keyframe_with_slots(&mut map, 0);
        let kf = keyframe_with_slots(&mut map, 0);

        map.get_keyframe(kf).unwrap().set_not_erase();
        assert!(!map.cull_keyframe(kf));
        assert!(!map.get_keyframe(kf).unwrap().is_bad);
        assert!(map.get_keyframe(kf).unwrap().is_erase_deferred());

        map.get_keyframe(kf).unwrap().set_erase();
        assert!(map.cull_keyframe(kf));
        assert!(map.get_keyframe(kf).unwrap().is_bad);
    }

    #[test]
    fn test_cull_reparents_children() {
        let mut map = Map::new();
        let root = keyframe_with_slots(&mut map, 0);
        let mid = keyframe_with_slots(&mut map, 0);
        let leaf = keyframe_with_slots(&mut map, 0);

        map.get_keyframe_mut(mid).unwrap().set_parent(root);
        map.get_keyframe_mut(root).unwrap().add_child(mid);
        map.get_keyframe_mut(leaf).unwrap().set_parent(mid);
        map.get_keyframe_mut(mid).unwrap().add_child(leaf);

        assert!(map.cull_keyframe(mid));
        assert_eq!(map.get_keyframe(leaf).unwrap().parent_id, Some(root));
        assert!(map.get_keyframe(root).unwrap().children_ids.contains(&leaf));
        // Tombstone stays reachable in the pool.
        assert!(map.get_keyframe(mid).is_some());
    }

    #[test]
    fn test_big_change_counter() {
        let mut map = Map::new();
        assert_eq!(map.big_change_count(), 0);
        map.inform_new_big_change();
        map.inform_new_big_change();
        assert_eq!(map.big_change_count(), 2);
    }
}
