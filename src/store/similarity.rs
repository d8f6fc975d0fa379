// Vector math shared by the store, the embedding fallback and the reranker

/// Cosine similarity in `[-1, 1]`.
///
/// A zero vector (or a pair of different lengths) scores 0 against anything.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot = x.mul_add(y, dot);
        norm_a = x.mul_add(x, norm_a);
        norm_b = y.mul_add(y, norm_b);
    }

    // Squares of any non-zero f32 stay positive in f64
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_nan() {
        return 0.0;
    }
    similarity.clamp(-1.0, 1.0) as f32
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
#[inline]
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector
        .iter()
        .map(|x| f64::from(*x) * f64::from(*x))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value = (f64::from(*value) / norm) as f32;
        }
    }
}

/// Cosine similarity with negative values clamped to zero, for ranking features.
#[inline]
pub fn unit_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).max(0.0)
}
