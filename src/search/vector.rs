//! Vector matcher: query text against every stored semantic vector.

use anyhow::Result;
use rayon::prelude::*;
use std::collections::HashMap;

use crate::embed::EmbeddingProvider;
use crate::store::{cosine_similarity, VectorStore};

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub photo_id: i64,
    /// Detection that produced the best-matching semantic vector.
    pub face_id: i64,
    pub similarity: f32,
}

/// Embed the query and scan all stored semantic vectors. Photos with
/// several detections keep only their best similarity. Malformed vectors
/// simply score 0 and fall below the floor.
pub fn vector_matches(
    store: &VectorStore,
    provider: &dyn EmbeddingProvider,
    query: &str,
    min_similarity: f32,
) -> Result<Vec<VectorHit>> {
    let query_vector = provider.embed_text(query)?;
    let rows = store.semantic_vectors()?;

    let scored: Vec<(i64, i64, f32)> = rows
        .par_iter()
        .map(|(face_id, photo_id, vector)| {
            (*face_id, *photo_id, cosine_similarity(&query_vector, vector))
        })
        .filter(|(_, _, similarity)| *similarity >= min_similarity)
        .collect();

    // Best hit per photo
    let mut best: HashMap<i64, VectorHit> = HashMap::new();
    for (face_id, photo_id, similarity) in scored {
        let entry = best.entry(photo_id).or_insert(VectorHit { photo_id, face_id, similarity });
        if similarity > entry.similarity {
            entry.face_id = face_id;
            entry.similarity = similarity;
        }
    }

    let mut hits: Vec<VectorHit> = best.into_values().collect();
    hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::stub::StubProvider;
    use crate::store::{BoundingBox, NewDetection, NewPhoto};

    fn seed_photo(store: &VectorStore, name: &str, semantic: Vec<f32>) -> i64 {
        let photo_id = store
            .insert_photo(&NewPhoto {
                uuid: format!("uuid-{name}"),
                path: format!("/photos/{name}"),
                filename: name.to_string(),
                directory: "/photos".to_string(),
                taken_at: None,
                width: Some(1000),
                height: Some(1000),
                exif_json: None,
                location_json: None,
            })
            .unwrap();
        store
            .replace_photo_detections(
                photo_id,
                &[NewDetection {
                    bbox: BoundingBox { x: 0, y: 0, width: 10, height: 10 },
                    confidence: 0.9,
                    face_embedding: Some(vec![1.0; 128]),
                    semantic_embedding: Some(semantic),
                }],
            )
            .unwrap();
        photo_id
    }

    #[test]
    fn test_floor_and_ranking() {
        let store = VectorStore::open_in_memory().unwrap();
        let close = seed_photo(&store, "close.jpg", vec![1.0, 0.0, 0.0]);
        let mid = seed_photo(&store, "mid.jpg", vec![1.0, 1.0, 0.0]);
        seed_photo(&store, "far.jpg", vec![0.0, 0.0, 1.0]);

        let mut provider = StubProvider::default();
        provider.text_embeddings.insert("lake".to_string(), vec![1.0, 0.0, 0.0]);

        let hits = vector_matches(&store, &provider, "lake", 0.2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].photo_id, close);
        assert_eq!(hits[1].photo_id, mid);
        assert!(hits[0].similarity > hits[1].similarity);
    }

    #[test]
    fn test_multiple_detections_keep_best_per_photo() {
        let store = VectorStore::open_in_memory().unwrap();
        let photo_id = seed_photo(&store, "a.jpg", vec![1.0, 0.0, 0.0]);
        // Second detection set replaces the first, with two vectors
        store
            .replace_photo_detections(
                photo_id,
                &[
                    NewDetection {
                        bbox: BoundingBox { x: 0, y: 0, width: 10, height: 10 },
                        confidence: 0.9,
                        face_embedding: Some(vec![1.0; 128]),
                        semantic_embedding: Some(vec![1.0, 0.0, 0.0]),
                    },
                    NewDetection {
                        bbox: BoundingBox { x: 50, y: 50, width: 10, height: 10 },
                        confidence: 0.8,
                        face_embedding: Some(vec![1.0; 128]),
                        semantic_embedding: Some(vec![0.5, 0.5, 0.0]),
                    },
                ],
            )
            .unwrap();

        let mut provider = StubProvider::default();
        provider.text_embeddings.insert("q".to_string(), vec![1.0, 0.0, 0.0]);

        let hits = vector_matches(&store, &provider, "q", 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
    }
}
