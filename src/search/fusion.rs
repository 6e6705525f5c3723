//! Score fusion across the keyword and vector matchers.
//!
//! Each source is normalized first (keyword score / 100, similarity clamped
//! to [0, 1]); a photo present in both sources sums its weighted
//! contributions rather than taking the max.

use std::collections::HashMap;

use crate::config::SearchConfig;
use crate::intent::QueryIntent;

use super::keyword::KeywordHit;
use super::vector::VectorHit;

#[derive(Debug, Clone, Copy)]
pub struct FusionWeights {
    pub keyword: f32,
    pub vector: f32,
}

impl FusionWeights {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self { keyword: config.keyword_weight, vector: config.vector_weight }
    }

    /// Intent-driven overrides of the default 0.3/0.7 split.
    pub fn for_intent(intent: QueryIntent, config: &SearchConfig) -> Self {
        match intent {
            QueryIntent::Keyword => Self { keyword: 0.7, vector: 0.3 },
            QueryIntent::Semantic => Self { keyword: 0.2, vector: 0.8 },
            QueryIntent::Person | QueryIntent::Location | QueryIntent::Time => {
                Self { keyword: 0.5, vector: 0.5 }
            }
            QueryIntent::General => Self::from_config(config),
        }
    }
}

/// Alternate sort keys for on-demand re-ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Keyword,
    Vector,
    Recency,
    Combined,
}

/// A fused, ranked search result.
#[derive(Debug, Clone)]
pub struct RankedResult {
    pub photo_id: i64,
    pub path: String,
    pub filename: String,
    pub taken_at: Option<String>,
    /// Raw keyword score on the 0-100 scale; 0 when keyword-silent.
    pub keyword_score: f32,
    /// Best cosine similarity; 0 when vector-silent.
    pub vector_similarity: f32,
    /// Weighted sum of the normalized per-source scores.
    pub score: f32,
}

/// Per-photo fused score, before hydration with photo fields.
#[derive(Debug, Clone, Default)]
pub struct FusedScore {
    pub keyword_score: f32,
    pub vector_similarity: f32,
    pub score: f32,
}

/// Merge both sources into one score map and drop entries under the
/// minimum combined score.
pub fn fuse(
    keyword_hits: &[KeywordHit],
    vector_hits: &[VectorHit],
    weights: FusionWeights,
    min_combined_score: f32,
) -> HashMap<i64, FusedScore> {
    let mut fused: HashMap<i64, FusedScore> = HashMap::new();

    for hit in keyword_hits {
        let entry = fused.entry(hit.photo_id).or_default();
        entry.keyword_score = hit.score;
        entry.score += (hit.score / 100.0).clamp(0.0, 1.0) * weights.keyword;
    }

    for hit in vector_hits {
        let entry = fused.entry(hit.photo_id).or_default();
        entry.vector_similarity = hit.similarity;
        entry.score += hit.similarity.clamp(0.0, 1.0) * weights.vector;
    }

    fused.retain(|_, entry| entry.score >= min_combined_score);
    fused
}

/// Re-rank in place by the requested key, descending.
pub fn rerank(results: &mut [RankedResult], key: SortKey) {
    match key {
        SortKey::Keyword => {
            results.sort_by(|a, b| cmp_f32(b.keyword_score, a.keyword_score));
        }
        SortKey::Vector => {
            results.sort_by(|a, b| cmp_f32(b.vector_similarity, a.vector_similarity));
        }
        SortKey::Combined => {
            results.sort_by(|a, b| cmp_f32(b.score, a.score));
        }
        SortKey::Recency => {
            // Missing timestamps sink to the bottom
            results.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        }
    }
}

fn cmp_f32(a: f32, b: f32) -> std::cmp::Ordering {
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(photo_id: i64, keyword: f32, vector: f32, score: f32, taken_at: Option<&str>) -> RankedResult {
        RankedResult {
            photo_id,
            path: String::new(),
            filename: String::new(),
            taken_at: taken_at.map(String::from),
            keyword_score: keyword,
            vector_similarity: vector,
            score,
        }
    }

    #[test]
    fn test_keyword_heavy_weights_rank_keyword_match_first() {
        // Photo A: keyword only, raw 90 (normalized 0.9).
        // Photo B: vector only, similarity 0.5.
        let keyword_hits = vec![KeywordHit { photo_id: 1, score: 90.0 }];
        let vector_hits = vec![VectorHit { photo_id: 2, face_id: 7, similarity: 0.5 }];
        let weights = FusionWeights { keyword: 0.7, vector: 0.3 };

        let fused = fuse(&keyword_hits, &vector_hits, weights, 0.05);
        let a = fused.get(&1).unwrap();
        let b = fused.get(&2).unwrap();

        assert!((a.score - 0.63).abs() < 1e-5);
        assert!((b.score - 0.15).abs() < 1e-5);
        assert!(a.score > b.score);
    }

    #[test]
    fn test_both_sources_sum_contributions() {
        let keyword_hits = vec![KeywordHit { photo_id: 1, score: 50.0 }];
        let vector_hits = vec![VectorHit { photo_id: 1, face_id: 3, similarity: 0.8 }];
        let weights = FusionWeights { keyword: 0.3, vector: 0.7 };

        let fused = fuse(&keyword_hits, &vector_hits, weights, 0.0);
        let entry = fused.get(&1).unwrap();
        // 0.5 * 0.3 + 0.8 * 0.7, summed not maxed
        assert!((entry.score - 0.71).abs() < 1e-5);
        assert!((entry.keyword_score - 50.0).abs() < 1e-5);
        assert!((entry.vector_similarity - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_min_combined_score_filters() {
        let vector_hits = vec![
            VectorHit { photo_id: 1, face_id: 1, similarity: 0.5 },
            VectorHit { photo_id: 2, face_id: 2, similarity: 0.01 },
        ];
        let weights = FusionWeights { keyword: 0.3, vector: 0.7 };
        let fused = fuse(&[], &vector_hits, weights, 0.05);
        assert!(fused.contains_key(&1));
        assert!(!fused.contains_key(&2));
    }

    #[test]
    fn test_similarity_is_clamped() {
        // A denormalized vector can push cosine past 1; the fused score
        // must clamp it
        let vector_hits = vec![VectorHit { photo_id: 1, face_id: 1, similarity: 1.7 }];
        let weights = FusionWeights { keyword: 0.0, vector: 1.0 };
        let fused = fuse(&[], &vector_hits, weights, 0.0);
        assert!((fused.get(&1).unwrap().score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_intent_weight_overrides() {
        let config = SearchConfig::default();
        let keyword = FusionWeights::for_intent(QueryIntent::Keyword, &config);
        assert!((keyword.keyword - 0.7).abs() < 1e-5);
        let semantic = FusionWeights::for_intent(QueryIntent::Semantic, &config);
        assert!((semantic.vector - 0.8).abs() < 1e-5);
        let person = FusionWeights::for_intent(QueryIntent::Person, &config);
        assert!((person.keyword - 0.5).abs() < 1e-5);
        let general = FusionWeights::for_intent(QueryIntent::General, &config);
        assert!((general.vector - 0.7).abs() < 1e-5);
    }

    #[test]
    fn test_rerank_keys() {
        let mut results = vec![
            result(1, 10.0, 0.9, 0.7, Some("2023-01-01T00:00:00Z")),
            result(2, 80.0, 0.1, 0.5, Some("2024-06-01T00:00:00Z")),
            result(3, 40.0, 0.4, 0.6, None),
        ];

        rerank(&mut results, SortKey::Keyword);
        assert_eq!(results[0].photo_id, 2);

        rerank(&mut results, SortKey::Vector);
        assert_eq!(results[0].photo_id, 1);

        rerank(&mut results, SortKey::Recency);
        assert_eq!(results[0].photo_id, 2);
        assert_eq!(results[2].photo_id, 3);

        rerank(&mut results, SortKey::Combined);
        assert_eq!(results[0].photo_id, 1);
    }
}
