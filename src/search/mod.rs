//! Retrieval engine: keyword matcher + vector matcher + score fusion.

pub mod fusion;
pub mod keyword;
pub mod vector;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::embed::EmbeddingProvider;
use crate::intent::QueryIntent;
use crate::store::VectorStore;

pub use fusion::{rerank, FusionWeights, RankedResult, SortKey};
pub use keyword::KeywordHit;
pub use vector::VectorHit;

pub struct RetrievalEngine {
    store: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    config: SearchConfig,
}

impl RetrievalEngine {
    pub fn new(store: Arc<VectorStore>, provider: Arc<dyn EmbeddingProvider>, config: SearchConfig) -> Self {
        Self { store, provider, config }
    }

    /// Hybrid search. Explicit weights win over intent-derived ones, which
    /// win over the configured defaults.
    pub fn search(
        &self,
        query: &str,
        weights: Option<FusionWeights>,
        intent: QueryIntent,
    ) -> Result<Vec<RankedResult>> {
        let photos = self.store.photos_for_keyword_scan()?;
        let keyword_hits = keyword::keyword_matches(&photos, query);
        let vector_hits =
            vector::vector_matches(&self.store, self.provider.as_ref(), query, self.config.min_similarity)?;

        let weights = weights.unwrap_or_else(|| FusionWeights::for_intent(intent, &self.config));
        tracing::debug!(
            query,
            keyword_hits = keyword_hits.len(),
            vector_hits = vector_hits.len(),
            w_keyword = weights.keyword,
            w_vector = weights.vector,
            "fusing search results"
        );

        let fused = fusion::fuse(&keyword_hits, &vector_hits, weights, self.config.min_combined_score);
        let mut results = self.hydrate(fused, &photos);
        rerank(&mut results, SortKey::Combined);
        results.truncate(self.config.result_limit);
        Ok(results)
    }

    /// Vector-only fast path.
    pub fn quick_search(&self, query: &str, top_k: usize) -> Result<Vec<RankedResult>> {
        let vector_hits =
            vector::vector_matches(&self.store, self.provider.as_ref(), query, self.config.min_similarity)?;
        let photos = self.store.photos_for_keyword_scan()?;

        let weights = FusionWeights { keyword: 0.0, vector: 1.0 };
        let fused = fusion::fuse(&[], &vector_hits, weights, 0.0);
        let mut results = self.hydrate(fused, &photos);
        rerank(&mut results, SortKey::Vector);
        results.truncate(top_k);
        Ok(results)
    }

    fn hydrate(
        &self,
        fused: HashMap<i64, fusion::FusedScore>,
        photos: &[crate::store::PhotoText],
    ) -> Vec<RankedResult> {
        let by_id: HashMap<i64, &crate::store::PhotoText> =
            photos.iter().map(|p| (p.photo_id, p)).collect();

        fused
            .into_iter()
            .filter_map(|(photo_id, scores)| {
                by_id.get(&photo_id).map(|photo| RankedResult {
                    photo_id,
                    path: photo.path.clone(),
                    filename: photo.filename.clone(),
                    taken_at: photo.taken_at.clone(),
                    keyword_score: scores.keyword_score,
                    vector_similarity: scores.vector_similarity,
                    score: scores.score,
                })
            })
            .collect()
    }
}
