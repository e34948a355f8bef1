use std::collections::HashSet;

use super::embedder::tokenize;
use super::index::ScoredPassage;
use super::RetrievalError;

/// Reorders a candidate passage list against a query and returns top-k.
pub trait Reranker: Send + Sync {
    fn rerank(
        &self,
        query: &str,
        passages: Vec<ScoredPassage>,
        k: usize,
    ) -> Result<Vec<ScoredPassage>, RetrievalError>;
}

/// Token-overlap reranker.
///
/// Scores each candidate by the Jaccard-style overlap between query and
/// passage token sets, blended with the vector score that got it into the
/// candidate list. A cross-encoder service implements the same trait.
pub struct LexicalReranker {
    /// Weight on lexical overlap; remainder stays with the vector score.
    overlap_weight: f32,
}

impl LexicalReranker {
    pub fn new() -> Self {
        Self { overlap_weight: 0.7 }
    }
}

impl Default for LexicalReranker {
    fn default() -> Self {
        Self::new()
    }
}

impl Reranker for LexicalReranker {
    fn rerank(
        &self,
        query: &str,
        passages: Vec<ScoredPassage>,
        k: usize,
    ) -> Result<Vec<ScoredPassage>, RetrievalError> {
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        if query_tokens.is_empty() {
            let mut passages = passages;
            passages.truncate(k);
            return Ok(passages);
        }

        let mut reranked: Vec<ScoredPassage> = passages
            .into_iter()
            .map(|mut p| {
                let passage_tokens: HashSet<String> = tokenize(&p.passage).into_iter().collect();
                let shared = query_tokens.intersection(&passage_tokens).count() as f32;
                let union = query_tokens.union(&passage_tokens).count().max(1) as f32;
                let overlap = shared / union;
                p.score = self.overlap_weight * overlap + (1.0 - self.overlap_weight) * p.score;
                p
            })
            .collect();

        reranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        reranked.truncate(k);
        Ok(reranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: &str, text: &str, score: f32) -> ScoredPassage {
        ScoredPassage {
            passage: text.to_string(),
            source_id: id.to_string(),
            score,
            tag: None,
        }
    }

    #[test]
    fn overlap_beats_raw_vector_score() {
        let reranker = LexicalReranker::new();
        let candidates = vec![
            passage("weak", "clinic parking and opening times", 0.9),
            passage("strong", "influenza causes fever headache and body aches", 0.5),
        ];

        let top = reranker
            .rerank("fever headache body aches", candidates, 2)
            .unwrap();
        assert_eq!(top[0].source_id, "strong");
    }

    #[test]
    fn rerank_truncates_to_k() {
        let reranker = LexicalReranker::new();
        let candidates = (0..10)
            .map(|i| passage(&format!("doc-{i}"), "fever management guidance", 0.5))
            .collect();
        let top = reranker.rerank("fever", candidates, 5).unwrap();
        assert_eq!(top.len(), 5);
    }

    #[test]
    fn empty_query_preserves_input_order() {
        let reranker = LexicalReranker::new();
        let candidates = vec![passage("a", "alpha", 0.9), passage("b", "beta", 0.8)];
        let top = reranker.rerank("", candidates, 2).unwrap();
        assert_eq!(top[0].source_id, "a");
    }
}
