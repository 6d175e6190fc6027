//! KeyFrame: a retained frame and its place in the map graph.
//!
//! Keyframes carry the visual payload of a frame (feature positions,
//! descriptors, BoW vector), a world-to-camera pose, per-feature map-point
//! associations, and two graph structures used by loop closing:
//!
//! - the **covisibility graph**, weighted by shared map-point observations,
//! - the **spanning tree**, a minimal connected structure rooted at the map
//!   origin, used to propagate corrections to keyframes the optimizers did
//!   not see.
//!
//! Cull guards (`set_not_erase`/`set_erase`) are atomics so the loop-closing
//! thread can protect a keyframe it is processing while holding only a read
//! guard on the map.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::geometry::SE3;
use crate::vocabulary::BowVector;

use super::types::{KeyFrameId, MapPointId};

/// Multiplicative scale between consecutive ORB pyramid octaves.
pub const ORB_SCALE_FACTOR: f64 = 1.2;

/// Number of octaves in the ORB pyramid.
pub const ORB_NUM_LEVELS: u32 = 8;

/// An extracted image feature: pixel position plus pyramid octave.
#[derive(Debug, Clone, Copy)]
pub struct Feature {
    pub u: f64,
    pub v: f64,
    pub octave: u32,
}

impl Feature {
    /// Scale factor of this feature's octave (`1.2^octave`).
    pub fn scale(&self) -> f64 {
        ORB_SCALE_FACTOR.powi(self.octave as i32)
    }
}

/// A keyframe in the map.
pub struct KeyFrame {
    /// Unique identifier, increasing in insertion order.
    pub id: KeyFrameId,

    /// World-to-camera pose (`p_cam = pose * p_world`).
    pub pose: SE3,

    /// Extracted features, one per slot.
    pub features: Vec<Feature>,

    /// 256-bit ORB descriptor per feature slot.
    pub descriptors: Vec<[u8; 32]>,

    /// Visual-word histogram used for place recognition.
    pub bow: BowVector,

    /// Feature slot -> observed map point.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ── Covisibility graph ───────────────────────────────────────────────
    /// Connected keyframe -> number of shared map points.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    // ── Spanning tree ────────────────────────────────────────────────────
    /// Parent in the spanning tree; `None` for a map origin.
    pub parent_id: Option<KeyFrameId>,

    /// Children in the spanning tree.
    pub children_ids: HashSet<KeyFrameId>,

    /// Keyframes this one closes a loop with. A keyframe carrying loop
    /// edges is never culled.
    loop_edges: HashSet<KeyFrameId>,

    // ── Status ───────────────────────────────────────────────────────────
    /// Tombstone flag set when the keyframe is culled.
    pub is_bad: bool,

    /// Cull guard: while set, culling is deferred.
    not_erase: AtomicBool,

    /// A cull was requested while the guard was held.
    to_be_erased: AtomicBool,

    // ── Global-BA scratch ────────────────────────────────────────────────
    /// Pose after the last global BA, pending write-back.
    pub tcw_gba: Option<SE3>,

    /// Pose immediately before the global-BA write-back, kept so map points
    /// can be rerouted through their reference keyframe.
    pub tcw_bef_gba: Option<SE3>,

    /// Loop keyframe id that stamped this keyframe during global-BA
    /// propagation.
    pub ba_global_for_kf: Option<KeyFrameId>,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        pose: SE3,
        features: Vec<Feature>,
        descriptors: Vec<[u8; 32]>,
        bow: BowVector,
    ) -> Self {
        debug_assert_eq!(features.len(), descriptors.len());
        let num_features = features.len();

        Self {
            id,
            pose,
            features,
            descriptors,
            bow,
            map_point_ids: vec![None; num_features],
            covisibility_weights: HashMap::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            loop_edges: HashSet::new(),
            is_bad: false,
            not_erase: AtomicBool::new(false),
            to_be_erased: AtomicBool::new(false),
            tcw_gba: None,
            tcw_bef_gba: None,
            ba_global_for_kf: None,
        }
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> nalgebra::Vector3<f64> {
        self.pose.camera_center()
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    // ── Map point associations ───────────────────────────────────────────

    pub fn map_point(&self, slot: usize) -> Option<MapPointId> {
        self.map_point_ids.get(slot).copied().flatten()
    }

    pub fn set_map_point(&mut self, slot: usize, mp_id: MapPointId) {
        if slot < self.map_point_ids.len() {
            self.map_point_ids[slot] = Some(mp_id);
        }
    }

    pub fn erase_map_point(&mut self, slot: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(slot).and_then(|s| s.take())
    }

    /// All (slot, map point) associations.
    pub fn map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(slot, mp)| mp.map(|id| (slot, id)))
    }

    // ── Covisibility graph ───────────────────────────────────────────────

    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id != self.id {
            self.covisibility_weights.insert(kf_id, weight);
        }
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        self.covisibility_weights.remove(&kf_id);
    }

    /// Replace the whole adjacency list (bulk covisibility refresh).
    pub fn set_covisibility(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
    }

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// Connected keyframes ordered by weight, best first.
    pub fn covisible_keyframes(&self) -> Vec<KeyFrameId> {
        let mut ordered: Vec<(KeyFrameId, usize)> = self
            .covisibility_weights
            .iter()
            .map(|(&id, &w)| (id, w))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered.into_iter().map(|(id, _)| id).collect()
    }

    /// Connected keyframes as an unordered set.
    pub fn covisible_set(&self) -> HashSet<KeyFrameId> {
        self.covisibility_weights.keys().copied().collect()
    }

    // ── Spanning tree ────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    // ── Loop edges ───────────────────────────────────────────────────────

    /// Record a loop closure with another keyframe. Keyframes that anchor a
    /// loop stay in the map permanently.
    pub fn add_loop_edge(&mut self, kf_id: KeyFrameId) {
        self.not_erase.store(true, Ordering::SeqCst);
        self.loop_edges.insert(kf_id);
    }

    pub fn loop_edges(&self) -> &HashSet<KeyFrameId> {
        &self.loop_edges
    }

    // ── Cull guards ──────────────────────────────────────────────────────

    /// Protect this keyframe from culling while a worker holds a reference
    /// to it.
    pub fn set_not_erase(&self) {
        self.not_erase.store(true, Ordering::SeqCst);
    }

    /// Drop the cull protection. Keyframes with loop edges remain
    /// protected. Returns true if a deferred cull is now pending.
    pub fn set_erase(&self) -> bool {
        if self.loop_edges.is_empty() {
            self.not_erase.store(false, Ordering::SeqCst);
        }
        self.to_be_erased.load(Ordering::SeqCst) && !self.not_erase.load(Ordering::SeqCst)
    }

    /// Whether the keyframe may be culled right now.
    pub fn is_erasable(&self) -> bool {
        !self.not_erase.load(Ordering::SeqCst)
    }

    /// Note that a cull was requested while the guard was held.
    pub fn defer_erase(&self) {
        self.to_be_erased.store(true, Ordering::SeqCst);
    }

    pub fn is_erase_deferred(&self) -> bool {
        self.to_be_erased.load(Ordering::SeqCst)
    }

    // ── Spatial queries ──────────────────────────────────────────────────

    /// Indices of features within `radius` pixels of `(u, v)`.
    pub fn features_in_area(&self, u: f64, v: f64, radius: f64) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.features
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                let du = f.u - u;
                let dv = f.v - v;
                du * du + dv * dv <= radius_sq
            })
            .map(|(i, _)| i)
            .collect()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("num_features", &self.num_features())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("loop_edges", &self.loop_edges.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
