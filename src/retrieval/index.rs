use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::RetrievalError;

/// A passage returned from vector search or reranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub passage: String,
    pub source_id: String,
    pub score: f32,
    /// Optional topic tag assigned at ingestion (e.g. "dermatology").
    pub tag: Option<String>,
}

/// Approximate nearest-neighbor search over embedded medical documents.
pub trait VectorIndex: Send + Sync {
    fn search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<ScoredPassage>, RetrievalError>;
}

/// In-memory cosine-similarity index.
///
/// The default index for local operation and tests; a persistent ANN store
/// implements the same trait.
pub struct InMemoryVectorIndex {
    entries: RwLock<Vec<StoredEntry>>,
}

struct StoredEntry {
    source_id: String,
    passage: String,
    embedding: Vec<f32>,
    tag: Option<String>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    pub fn add(&self, source_id: &str, passage: &str, embedding: Vec<f32>, tag: Option<&str>) {
        self.entries.write().expect("vector index poisoned").push(StoredEntry {
            source_id: source_id.to_string(),
            passage: passage.to_string(),
            embedding,
            tag: tag.map(|t| t.to_string()),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("vector index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn search(&self, query_embedding: &[f32], k: usize) -> Result<Vec<ScoredPassage>, RetrievalError> {
        let entries = self.entries.read().expect("vector index poisoned");

        let mut scored: Vec<ScoredPassage> = entries
            .iter()
            .map(|entry| ScoredPassage {
                passage: entry.passage.clone(),
                source_id: entry.source_id.clone(),
                score: cosine_similarity(query_embedding, &entry.embedding),
                tag: entry.tag.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.01);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 0.01);
    }

    #[test]
    fn search_returns_top_k_most_similar() {
        let index = InMemoryVectorIndex::new();
        index.add("doc-1", "Influenza management", vec![1.0, 0.0, 0.0], None);
        index.add("doc-2", "Dermatitis care", vec![0.8, 0.6, 0.0], Some("dermatology"));
        index.add("doc-3", "Clinic parking", vec![0.0, 1.0, 0.0], None);

        let results = index.search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_id, "doc-1");
        assert_eq!(results[1].source_id, "doc-2");
        assert_eq!(results[1].tag.as_deref(), Some("dermatology"));
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = InMemoryVectorIndex::new();
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }
}
