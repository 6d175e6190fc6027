//! KeyFrameDatabase: inverted-index place recognition over BoW vectors.
//!
//! Every keyframe is indexed by the visual words it contains. A loop query
//! first narrows the search to keyframes sharing enough words with the
//! current one, then scores the survivors with the vocabulary similarity and
//! keeps those above the caller's minimum score. The query keyframe and its
//! covisible neighbors are never returned as candidates.

use std::collections::HashMap;

use crate::vocabulary;

use super::map::Map;
use super::types::KeyFrameId;

/// Fraction of the best shared-word count a candidate must reach to be
/// scored at all.
const MIN_COMMON_WORD_RATIO: f64 = 0.8;

/// Place-recognition database.
pub struct KeyFrameDatabase {
    /// Visual word -> keyframes containing it.
    inverted_index: HashMap<u32, Vec<KeyFrameId>>,

    /// Keyframes already indexed, to keep `add` idempotent.
    indexed: std::collections::HashSet<KeyFrameId>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self {
            inverted_index: HashMap::new(),
            indexed: std::collections::HashSet::new(),
        }
    }

    /// Index a keyframe's BoW vector. Re-adding a keyframe is a no-op.
    pub fn add(&mut self, map: &Map, kf_id: KeyFrameId) {
        if !self.indexed.insert(kf_id) {
            return;
        }
        let Some(kf) = map.get_keyframe(kf_id) else {
            return;
        };
        for &word in kf.bow.keys() {
            self.inverted_index.entry(word).or_default().push(kf_id);
        }
    }

    /// Remove a keyframe from the index (used when a keyframe is culled).
    pub fn erase(&mut self, map: &Map, kf_id: KeyFrameId) {
        if !self.indexed.remove(&kf_id) {
            return;
        }
        if let Some(kf) = map.get_keyframe(kf_id) {
            for word in kf.bow.keys() {
                if let Some(list) = self.inverted_index.get_mut(word) {
                    list.retain(|&id| id != kf_id);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.indexed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexed.is_empty()
    }

    /// Keyframes that could close a loop with `kf_id`, best score first.
    ///
    /// Candidates must share at least one visual word with the query, must
    /// not be the query itself or covisibly connected to it, must pass the
    /// shared-word prefilter relative to the best candidate, and must score
    /// at least `min_score` against the query's BoW vector.
    pub fn detect_loop_candidates(
        &self,
        map: &Map,
        kf_id: KeyFrameId,
        min_score: f64,
    ) -> Vec<KeyFrameId> {
        let Some(query) = map.get_keyframe(kf_id) else {
            return Vec::new();
        };
        let connected = query.covisible_set();

        // Count shared words per keyframe outside the query's neighborhood.
        let mut shared_words: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in query.bow.keys() {
            if let Some(list) = self.inverted_index.get(word) {
                for &other in list {
                    if other == kf_id || connected.contains(&other) {
                        continue;
                    }
                    *shared_words.entry(other).or_insert(0) += 1;
                }
            }
        }

        if shared_words.is_empty() {
            return Vec::new();
        }

        let max_common = shared_words.values().copied().max().unwrap_or(0);
        let min_common = (MIN_COMMON_WORD_RATIO * max_common as f64) as usize;

        let mut scored: Vec<(KeyFrameId, f64)> = shared_words
            .into_iter()
            .filter(|&(_, n)| n > min_common)
            .filter_map(|(other_id, _)| {
                let other = map.get_keyframe(other_id)?;
                if other.is_bad {
                    return None;
                }
                let score = vocabulary::score(&query.bow, &other.bow);
                (score >= min_score).then_some((other_id, score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(id, _)| id).collect()
    }
}

impl Default for KeyFrameDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::vocabulary::BowVector;

    fn add_keyframe(map: &mut Map, words: &[(u32, f64)]) -> KeyFrameId {
        let bow: BowVector = words.iter().copied().collect();
        map.create_keyframe(SE3::identity(), Vec::new(), Vec::new(), bow)
    }

    #[test]
    fn test_candidates_sorted_by_score() {
        let mut map = Map::new();
        let query = add_keyframe(&mut map, &[(1, 0.5), (2, 0.5)]);
        let strong = add_keyframe(&mut map, &[(1, 0.5), (2, 0.5)]);
        let weak = add_keyframe(&mut map, &[(1, 0.9), (3, 0.1)]);

        let mut db = KeyFrameDatabase::new();
        db.add(&map, strong);
        db.add(&map, weak);

        let candidates = db.detect_loop_candidates(&map, query, 0.01);
        assert_eq!(candidates.first(), Some(&strong));
        assert!(candidates.contains(&weak) || candidates.len() == 1);
    }

    #[test]
    fn test_min_score_filters() {
        let mut map = Map::new();
        let query = add_keyframe(&mut map, &[(1, 1.0)]);
        let distant = add_keyframe(&mut map, &[(1, 0.1), (9, 0.9)]);

        let mut db = KeyFrameDatabase::new();
        db.add(&map, distant);

        assert!(db.detect_loop_candidates(&map, query, 0.95).is_empty());
        assert_eq!(db.detect_loop_candidates(&map, query, 0.05), vec![distant]);
    }

    #[test]
    fn test_connected_keyframes_excluded() {
        let mut map = Map::new();
        let query = add_keyframe(&mut map, &[(1, 1.0)]);
        let neighbor = add_keyframe(&mut map, &[(1, 1.0)]);
        map.get_keyframe_mut(query).unwrap().add_covisibility(neighbor, 30);

        let mut db = KeyFrameDatabase::new();
        db.add(&map, query);
        db.add(&map, neighbor);

        assert!(db.detect_loop_candidates(&map, query, 0.01).is_empty());
    }

    #[test]
    fn test_no_shared_words_no_candidates() {
        let mut map = Map::new();
        let query = add_keyframe(&mut map, &[(1, 1.0)]);
        let other = add_keyframe(&mut map, &[(2, 1.0)]);

        let mut db = KeyFrameDatabase::new();
        db.add(&map, other);

        assert!(db.detect_loop_candidates(&map, query, 0.0).is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut map = Map::new();
        let query = add_keyframe(&mut map, &[(1, 1.0)]);
        let other = add_keyframe(&mut map, &[(1, 1.0)]);

        let mut db = KeyFrameDatabase::new();
        db.add(&map, other);
        db.add(&map, other);
        assert_eq!(db.len(), 1);

        let candidates = db.detect_loop_candidates(&map, query, 0.01);
        assert_eq!(candidates, vec![other]);
    }

    #[test]
    fn test_erase_removes_candidate() {
        let mut map = Map::new();
        let query = add_keyframe(&mut map, &[(1, 1.0)]);
        let other = add_keyframe(&mut map, &[(1, 1.0)]);

        let mut db = KeyFrameDatabase::new();
        db.add(&map, other);
        db.erase(&map, other);

        assert!(db.detect_loop_candidates(&map, query, 0.01).is_empty());
        assert!(db.is_empty());
    }
}
