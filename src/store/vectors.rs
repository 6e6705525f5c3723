//! Vector blob codec and similarity math.
//!
//! Vectors are persisted as little-endian 32-bit float arrays and must
//! round-trip byte-exact.

/// Convert f32 slice to bytes for storage
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &val in vector {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector. Trailing bytes that do not form a
/// complete f32 are dropped.
pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap();
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Calculate cosine similarity between two vectors.
///
/// Vectors of unequal length are compared over the shorter length rather
/// than rejected; a malformed or zero-norm vector scores 0. Preserved
/// legacy behavior when legacy/face/semantic slots of differing
/// dimensionality meet.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dims = a.len().min(b.len());
    if dims == 0 {
        return 0.0;
    }

    let a = &a[..dims];
    let b = &b[..dims];

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Mean of a set of vectors, truncated to the shortest member.
/// Returns None for an empty set.
pub fn centroid(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let dims = vectors.iter().map(|v| v.len()).min()?;
    if dims == 0 {
        return None;
    }

    let mut sum = vec![0.0f32; dims];
    for v in vectors {
        for (acc, val) in sum.iter_mut().zip(v.iter()) {
            *acc += val;
        }
    }
    let n = vectors.len() as f32;
    for val in sum.iter_mut() {
        *val /= n;
    }
    Some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - (-1.0)).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_self_is_one() {
        let v = vec![0.3, -1.2, 4.5, 0.001, 7.7];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_unequal_lengths_truncates() {
        // Compared over the shorter length; must not panic
        let short = vec![1.0, 0.0];
        let long = vec![1.0, 0.0, 5.0, 5.0, 5.0];
        assert!((cosine_similarity(&short, &long) - 1.0).abs() < 1e-5);
        assert!((cosine_similarity(&long, &short) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_vector_round_trip() {
        let original = vec![1.5, -2.3, 0.0, 100.0, f32::MIN_POSITIVE];
        let bytes = vector_to_bytes(&original);
        assert_eq!(bytes.len(), original.len() * 4);
        let recovered = bytes_to_vector(&bytes);
        assert_eq!(original, recovered);
    }

    #[test]
    fn test_bytes_to_vector_drops_partial_tail() {
        let mut bytes = vector_to_bytes(&[1.0, 2.0]);
        bytes.push(0xFF);
        assert_eq!(bytes_to_vector(&bytes), vec![1.0, 2.0]);
    }

    #[test]
    fn test_centroid() {
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert_eq!(centroid(&vectors), Some(vec![0.5, 0.5]));
        assert_eq!(centroid(&[]), None);
    }

    #[test]
    fn test_centroid_truncates_to_shortest() {
        let vectors = vec![vec![2.0, 2.0, 9.0], vec![4.0, 4.0]];
        assert_eq!(centroid(&vectors), Some(vec![3.0, 3.0]));
    }
}
