//! Embeddings for stored content chunks.
//!
//! Uses a hash-based bag-of-words embedding rather than an external
//! embedding model: each term is hashed to a dimension, term frequency is
//! accumulated, and the vector is L2-normalised. Good enough for the
//! store's similarity lookups while keeping the engine self-contained.

/// Produces fixed-dimension vectors for content chunks.
pub trait Embedder: Send + Sync {
    /// Embed a text into a vector of `dimensions()` length.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Dimensionality of produced vectors.
    fn dimensions(&self) -> usize;
}

/// Hashed term-frequency embedder.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let terms = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty());

        let mut any = false;
        for term in terms {
            any = true;
            let idx = term_hash(term) % self.dimensions;
            vector[idx] += 1.0;
        }
        if !any {
            return vector;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn term_hash(term: &str) -> usize {
    let mut hash: usize = 5381;
    for b in term.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_normalized() {
        let embedder = HashEmbedder::new(64);
        let vector = embedder.embed("iterative topic research engine");
        assert_eq!(vector.len(), 64);
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_embed_empty_is_zero_vector() {
        let embedder = HashEmbedder::new(32);
        let vector = embedder.embed("");
        assert_eq!(vector.len(), 32);
        assert!(vector.iter().all(|&v| v == 0.0));
        // Punctuation-only text has no terms either.
        assert!(embedder.embed("!!! --- ???").iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_embed_deterministic() {
        let embedder = HashEmbedder::new(64);
        assert_eq!(
            embedder.embed("rust research engine"),
            embedder.embed("rust research engine")
        );
    }

    #[test]
    fn test_embed_case_insensitive() {
        let embedder = HashEmbedder::new(64);
        assert_eq!(embedder.embed("Rust Engine"), embedder.embed("rust engine"));
    }

    #[test]
    fn test_dimensions_reported() {
        assert_eq!(HashEmbedder::new(384).dimensions(), 384);
    }
}
