//! Keyword matcher.
//!
//! Scores a photo by matching query terms against its file name, folder
//! path and serialized EXIF/location text. File-name prefix matches score
//! highest; an approximate match (edit-distance similarity above 0.6)
//! scores half of the exact weight for its field. Raw scores live on a
//! 0-100 scale and are normalized at fusion time.

use crate::store::PhotoText;

const FILENAME_PREFIX_WEIGHT: f32 = 50.0;
const FILENAME_WEIGHT: f32 = 30.0;
const FOLDER_WEIGHT: f32 = 15.0;
const METADATA_WEIGHT: f32 = 10.0;
const FUZZY_PENALTY: f32 = 0.5;
const FUZZY_FLOOR: f32 = 0.6;

#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub photo_id: i64,
    /// Raw score on the 0-100 scale.
    pub score: f32,
}

/// Score every photo against the query, dropping zero scores.
pub fn keyword_matches(photos: &[PhotoText], query: &str) -> Vec<KeywordHit> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return Vec::new();
    }

    photos
        .iter()
        .filter_map(|photo| {
            let score = score_photo(photo, &terms);
            (score > 0.0).then_some(KeywordHit { photo_id: photo.photo_id, score })
        })
        .collect()
}

fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_string())
        .collect()
}

fn score_photo(photo: &PhotoText, terms: &[String]) -> f32 {
    let filename = photo.filename.to_lowercase();
    let directory = photo.directory.to_lowercase();
    let metadata = photo.metadata_text.to_lowercase();

    let mut score = 0.0;
    for term in terms {
        score += score_filename(&filename, term);
        score += score_field(&directory, term, FOLDER_WEIGHT);
        score += score_field(&metadata, term, METADATA_WEIGHT);
    }
    score
}

fn score_filename(filename: &str, term: &str) -> f32 {
    if filename.starts_with(term) {
        FILENAME_PREFIX_WEIGHT
    } else if filename.contains(term) {
        FILENAME_WEIGHT
    } else if fuzzy_token_similarity(filename, term) > FUZZY_FLOOR {
        FILENAME_WEIGHT * FUZZY_PENALTY
    } else {
        0.0
    }
}

fn score_field(field: &str, term: &str, weight: f32) -> f32 {
    if field.contains(term) {
        weight
    } else if fuzzy_token_similarity(field, term) > FUZZY_FLOOR {
        weight * FUZZY_PENALTY
    } else {
        0.0
    }
}

/// Best edit-distance similarity between the term and any token of the field.
fn fuzzy_token_similarity(field: &str, term: &str) -> f32 {
    field
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| edit_similarity(token, term))
        .fold(0.0, f32::max)
}

/// Similarity in [0, 1] derived from Levenshtein distance.
pub fn edit_similarity(a: &str, b: &str) -> f32 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f32 / max_len as f32
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(id: i64, filename: &str, directory: &str, metadata: &str) -> PhotoText {
        PhotoText {
            photo_id: id,
            path: format!("{directory}/{filename}"),
            filename: filename.to_string(),
            directory: directory.to_string(),
            taken_at: None,
            metadata_text: metadata.to_string(),
        }
    }

    #[test]
    fn test_edit_distance_basics() {
        assert_eq!(edit_distance("lake", "lake"), 0);
        assert_eq!(edit_distance("lake", "lakke"), 1);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
    }

    #[test]
    fn test_prefix_beats_substring() {
        let photos = vec![
            photo(1, "lake-sunset.jpg", "/photos", ""),
            photo(2, "great-lake.jpg", "/photos", ""),
        ];
        let hits = keyword_matches(&photos, "lake");
        let by_id = |id| hits.iter().find(|h| h.photo_id == id).unwrap().score;
        assert!(by_id(1) > by_id(2));
        assert!((by_id(1) - FILENAME_PREFIX_WEIGHT).abs() < 1e-5);
        assert!((by_id(2) - FILENAME_WEIGHT).abs() < 1e-5);
    }

    #[test]
    fn test_fuzzy_match_is_penalized() {
        let photos = vec![
            photo(1, "river.jpg", "/photos", ""),
            photo(2, "lakes.jpg", "/photos", ""),
        ];
        let hits = keyword_matches(&photos, "laks");
        // "laks" vs "river": nowhere near the floor
        assert!(hits.iter().all(|h| h.photo_id != 1));

        let close = hits.iter().find(|h| h.photo_id == 2).unwrap();
        // "laks" vs "lakes": distance 1 of 5 -> similarity 0.8, penalized
        assert!((close.score - FILENAME_WEIGHT * FUZZY_PENALTY).abs() < 1e-5);
    }

    #[test]
    fn test_folder_and_metadata_fields_contribute() {
        let photos = vec![photo(
            1,
            "img_0001.jpg",
            "/photos/vacation/lake-tahoe",
            r#"{"gps_area": "lake shore"}"#,
        )];
        let hits = keyword_matches(&photos, "lake");
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - (FOLDER_WEIGHT + METADATA_WEIGHT)).abs() < 1e-5);
    }

    #[test]
    fn test_no_terms_no_hits() {
        let photos = vec![photo(1, "a.jpg", "/p", "")];
        assert!(keyword_matches(&photos, "").is_empty());
        assert!(keyword_matches(&photos, "x").is_empty()); // single char dropped
    }
}
