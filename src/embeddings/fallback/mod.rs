#[cfg(test)]
mod tests;

use crate::store::similarity::l2_normalize;
use crate::text;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;
/// Feature hashed for input with no tokens so the output still has unit length
const EMPTY_FEATURE: &str = "\u{0}empty";

/// Deterministic embedding generator used when no model is available.
///
/// Words and character trigrams are hashed with blake3 into signed buckets of
/// a fixed-length vector, which is then normalized to unit length. The same
/// input always yields the same vector, on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackEmbedder {
    dimension: usize,
}

impl FallbackEmbedder {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn embed(&self, input: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let tokens = text::tokenize(input);

        if tokens.is_empty() {
            self.add_feature(&mut vector, "e", EMPTY_FEATURE, WORD_WEIGHT);
            return vector;
        }

        for token in &tokens {
            self.add_feature(&mut vector, "w", token, WORD_WEIGHT);

            let padded: Vec<char> = format!(" {} ", token).chars().collect();
            for trigram in padded.windows(3) {
                let trigram: String = trigram.iter().collect();
                self.add_feature(&mut vector, "c", &trigram, TRIGRAM_WEIGHT);
            }
        }

        l2_normalize(&mut vector);
        if vector.iter().all(|v| *v == 0.0) {
            // Every feature cancelled out; fall back to the sentinel bucket.
            self.add_feature(&mut vector, "e", EMPTY_FEATURE, WORD_WEIGHT);
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], namespace: &str, feature: &str, weight: f32) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b":");
        hasher.update(feature.as_bytes());
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();

        let mut bucket_bytes = [0_u8; 8];
        bucket_bytes.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };

        if let Some(slot) = vector.get_mut(bucket) {
            *slot += sign * weight;
        }
    }
}
