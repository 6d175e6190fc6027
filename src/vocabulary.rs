//! Bag-of-Words vectors and similarity scoring.
//!
//! Keyframes arrive with their BoW vectors already computed by the feature
//! pipeline (a hierarchical visual vocabulary quantizes each ORB descriptor
//! into a word id with a TF-IDF weight). This module only defines the sparse
//! histogram type and the similarity score used for place recognition.

use std::collections::HashMap;

/// Sparse visual-word histogram: word id -> TF-IDF weight.
pub type BowVector = HashMap<u32, f64>;

/// L1 similarity score between two BoW vectors, in `[0, 1]`.
///
/// Both vectors are L1-normalized before comparison, so the score is
/// insensitive to the number of features in each frame. Identical
/// distributions score 1, disjoint ones score 0.
pub fn score(a: &BowVector, b: &BowVector) -> f64 {
    let norm_a: f64 = a.values().map(|w| w.abs()).sum();
    let norm_b: f64 = b.values().map(|w| w.abs()).sum();
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }

    // 1 - 0.5 * sum |a_i - b_i| over the union of words, with the vectors
    // normalized. Words present in only one vector contribute their full
    // weight to the distance.
    let mut distance = 0.0;
    for (word, wa) in a {
        let wa = wa / norm_a;
        match b.get(word) {
            Some(wb) => distance += (wa - wb / norm_b).abs(),
            None => distance += wa.abs(),
        }
    }
    for (word, wb) in b {
        if !a.contains_key(word) {
            distance += (wb / norm_b).abs();
        }
    }

    (1.0 - 0.5 * distance).clamp(0.0, 1.0)
}
