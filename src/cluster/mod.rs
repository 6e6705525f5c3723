//! Clustering engine: groups face detections into person identities.
//!
//! Matching is anchor-then-greedy. Faces that resemble an existing person's
//! centroid are claimed first; the remainder seed new single-link clusters
//! grown against the seed vector. Clusters need at least two members to
//! mint a Person; singletons stay unassigned and are retried on later runs.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::embed::{EmbeddingProvider, ImageSource, DETECTOR_INPUT_SIZE};
use crate::store::{centroid, cosine_similarity, VectorStore};

/// Result of one auto-match run.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Faces that received a person assignment this run.
    pub matched: usize,
    /// New persons created this run.
    pub persons_created: usize,
    /// Every cluster found, singletons included.
    pub clusters: Vec<ClusterSummary>,
}

#[derive(Debug, Clone)]
pub struct ClusterSummary {
    /// Person the cluster was written to; None for singletons.
    pub person_id: Option<i64>,
    pub size: usize,
    /// Minimum pairwise similarity observed while growing the cluster,
    /// not an average. 1.0 for singletons.
    pub confidence: f32,
}

/// A face ranked by similarity to a probe face.
#[derive(Debug, Clone)]
pub struct SimilarFace {
    pub face_id: i64,
    pub photo_id: i64,
    pub person_id: Option<i64>,
    pub similarity: f32,
}

/// Result of a re-embedding maintenance pass.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    pub refreshed: usize,
    pub failed: usize,
    pub last_error: Option<String>,
}

pub struct ClusteringEngine {
    store: Arc<VectorStore>,
    config: ClusterConfig,
}

impl ClusteringEngine {
    pub fn new(store: Arc<VectorStore>, config: ClusterConfig) -> Self {
        Self { store, config }
    }

    /// Assign unassigned faces to persons. Idempotent on a quiet store:
    /// with no new detections the second run matches nothing and creates
    /// nothing.
    pub fn auto_match(&self, threshold: Option<f32>) -> Result<MatchOutcome> {
        let threshold = threshold.unwrap_or(self.config.match_threshold);

        let centroids = self.person_centroids()?;
        let unassigned = self.store.unassigned_faces_with_vectors()?;

        tracing::debug!(
            unassigned = unassigned.len(),
            known_persons = centroids.len(),
            threshold,
            "auto-match started"
        );

        let mut matched = 0usize;
        let mut persons_created = 0usize;
        let mut clusters = Vec::new();
        let mut taken = vec![false; unassigned.len()];

        // Anchor pass: a face close enough to a known person's centroid is
        // claimed immediately; the hit short-circuits further comparison.
        for (idx, (face_id, vector)) in unassigned.iter().enumerate() {
            let mut best: Option<(i64, f32)> = None;
            for (person_id, centroid_vec) in &centroids {
                let similarity = cosine_similarity(vector, centroid_vec);
                if similarity > threshold && best.map_or(true, |(_, s)| similarity > s) {
                    best = Some((*person_id, similarity));
                }
            }

            if let Some((person_id, similarity)) = best {
                self.store.assign_face_to_person(*face_id, person_id)?;
                taken[idx] = true;
                matched += 1;
                tracing::debug!(face_id, person_id, similarity, "anchor match");
            }
        }

        // Greedy pass: seed clusters from the remainder in arrival order
        // and absorb single-link neighbors of the seed.
        let mut seeded = vec![false; unassigned.len()];
        let mut unnamed_counter = 0usize;

        for i in 0..unassigned.len() {
            if taken[i] || seeded[i] {
                continue;
            }
            seeded[i] = true;

            let (_, ref seed_vector) = unassigned[i];
            let mut members = vec![i];
            let mut confidence = 1.0f32;

            for j in (i + 1)..unassigned.len() {
                if taken[j] || seeded[j] {
                    continue;
                }
                let similarity = cosine_similarity(seed_vector, &unassigned[j].1);
                if similarity > threshold {
                    members.push(j);
                    seeded[j] = true;
                    confidence = confidence.min(similarity);
                    if members.len() >= self.config.max_cluster_size {
                        break;
                    }
                }
            }

            if members.len() < 2 {
                // Singleton: reported, not persisted; retried next run
                clusters.push(ClusterSummary { person_id: None, size: 1, confidence: 1.0 });
                continue;
            }

            unnamed_counter += 1;
            let name = format!("Unnamed {unnamed_counter}");
            let person_id = self.store.create_person(&name, false)?;

            let mut assigned = 0usize;
            for &member in &members {
                match self.store.assign_face_to_person(unassigned[member].0, person_id) {
                    Ok(()) => {
                        taken[member] = true;
                        assigned += 1;
                    }
                    Err(e) => {
                        tracing::warn!(face_id = unassigned[member].0, error = %e, "cluster assignment failed");
                    }
                }
            }

            if assigned == 0 {
                // Never leave an empty automatic person behind
                self.store.delete_person(person_id)?;
                clusters.push(ClusterSummary { person_id: None, size: members.len(), confidence });
                continue;
            }

            matched += assigned;
            persons_created += 1;
            clusters.push(ClusterSummary { person_id: Some(person_id), size: assigned, confidence });
            tracing::info!(person_id, name = %name, faces = assigned, confidence, "person created");
        }

        self.store.delete_orphan_persons()?;

        tracing::info!(matched, persons_created, clusters = clusters.len(), "auto-match finished");
        Ok(MatchOutcome { matched, persons_created, clusters })
    }

    /// Mean face vector per person, over every face currently assigned.
    fn person_centroids(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let mut grouped: HashMap<i64, Vec<Vec<f32>>> = HashMap::new();
        for (person_id, vector) in self.store.assigned_face_vectors()? {
            grouped.entry(person_id).or_default().push(vector);
        }

        let mut centroids: Vec<(i64, Vec<f32>)> = grouped
            .into_iter()
            .filter_map(|(person_id, vectors)| centroid(&vectors).map(|c| (person_id, c)))
            .collect();
        centroids.sort_by_key(|(person_id, _)| *person_id);
        Ok(centroids)
    }

    /// Faces ranked by similarity to the probe face, above the configured
    /// floor, best first. The probe itself is excluded.
    pub fn find_similar_faces(&self, face_id: i64) -> Result<Vec<SimilarFace>> {
        let Some(probe) = self.store.face_by_id(face_id)? else {
            bail!("face {face_id} does not exist");
        };
        let Some(probe_vector) = probe.face_embedding else {
            bail!("face {face_id} has no face vector");
        };

        let mut results: Vec<SimilarFace> = self
            .store
            .faces_with_vectors()?
            .into_iter()
            .filter(|(id, _, _, _)| *id != face_id)
            .map(|(id, photo_id, person_id, vector)| SimilarFace {
                face_id: id,
                photo_id,
                person_id,
                similarity: cosine_similarity(&probe_vector, &vector),
            })
            .filter(|s| s.similarity >= self.config.similar_floor)
            .collect();

        results.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        Ok(results)
    }

    pub fn assign_faces_to_person(&self, face_ids: &[i64], person_id: i64) -> Result<usize> {
        if self.store.person(person_id)?.is_none() {
            bail!("person {person_id} does not exist");
        }
        self.store.assign_faces_to_person(face_ids, person_id)
    }

    /// Clear a face's person link and reap the person if it ended up empty.
    pub fn unassign_face(&self, face_id: i64) -> Result<()> {
        self.store.unassign_face(face_id)?;
        self.store.delete_orphan_persons()?;
        Ok(())
    }

    /// Reassign all of source's faces to target, then delete source.
    pub fn merge_persons(&self, source_id: i64, target_id: i64) -> Result<usize> {
        if source_id == target_id {
            bail!("cannot merge a person into itself");
        }
        if self.store.person(source_id)?.is_none() {
            bail!("person {source_id} does not exist");
        }
        if self.store.person(target_id)?.is_none() {
            bail!("person {target_id} does not exist");
        }

        let moved = self.store.merge_persons(source_id, target_id)?;
        tracing::info!(source_id, target_id, moved, "persons merged");
        Ok(moved)
    }
}

/// Re-embedding maintenance: bring detections with stale vector slots
/// (vector_version < 2) up to the current pipeline. Per-row failures are
/// counted, never fatal.
pub fn refresh_face_vectors(
    store: &VectorStore,
    provider: &dyn EmbeddingProvider,
) -> Result<RefreshOutcome> {
    let rows = store.faces_needing_vectors(10_000)?;
    let mut outcome = RefreshOutcome::default();

    for (face, photo_path, width, height) in rows {
        let path = Path::new(&photo_path);
        if !path.exists() {
            outcome.failed += 1;
            outcome.last_error = Some(format!("file not found: {photo_path}"));
            continue;
        }

        let descriptor = match face.face_embedding {
            Some(existing) => existing,
            None => match provider.face_descriptor(path, &face.bbox) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    outcome.failed += 1;
                    outcome.last_error = Some(e.to_string());
                    continue;
                }
            },
        };

        let dims = match (width, height) {
            (Some(w), Some(h)) => Some((w as u32, h as u32)),
            _ => image::image_dimensions(path).ok(),
        };

        // Semantic vector comes from the face region of the original image,
        // so the detector-space box has to be scaled first
        let semantic = dims.and_then(|(w, h)| {
            let rect = face.bbox.scaled(DETECTOR_INPUT_SIZE, w, h);
            provider.embed_image(ImageSource::Region { path, rect }).ok()
        });

        match store.update_face_vectors(face.id, Some(&descriptor), semantic.as_deref()) {
            Ok(()) => outcome.refreshed += 1,
            Err(e) => {
                outcome.failed += 1;
                outcome.last_error = Some(e.to_string());
            }
        }
    }

    tracing::info!(refreshed = outcome.refreshed, failed = outcome.failed, "vector refresh finished");
    Ok(outcome)
}
