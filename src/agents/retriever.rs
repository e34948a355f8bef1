//! Retrieves evidence passages for the working differential:
//! query from top hypotheses + salient symptom terms, vector search for a
//! wide candidate set, rerank down to the evidence the recommender cites.

use std::sync::Arc;

use super::{Agent, AgentError};
use crate::models::{AgentName, EvidencePassage, TurnState};
use crate::retrieval::{EmbeddingModel, Reranker, VectorIndex};

/// Candidate pool fetched from the index.
const CANDIDATES_K: usize = 20;

/// Evidence passages kept after reranking.
const EVIDENCE_K: usize = 5;

/// Hypotheses included in the retrieval query.
const QUERY_HYPOTHESES: usize = 3;

pub struct DocumentRetriever {
    embedder: Arc<dyn EmbeddingModel>,
    index: Arc<dyn VectorIndex>,
    reranker: Arc<dyn Reranker>,
}

impl DocumentRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        index: Arc<dyn VectorIndex>,
        reranker: Arc<dyn Reranker>,
    ) -> Self {
        Self { embedder, index, reranker }
    }

    /// Top hypotheses plus salient symptom terms.
    fn build_query(state: &TurnState) -> String {
        let mut terms: Vec<&str> = state
            .diagnosis
            .iter()
            .take(QUERY_HYPOTHESES)
            .map(|h| h.name.as_str())
            .collect();
        terms.extend(state.symptoms.iter().map(|s| s.name.as_str()));
        terms.join(", ")
    }
}

impl Agent for DocumentRetriever {
    fn name(&self) -> AgentName {
        AgentName::DocumentRetriever
    }

    fn run(&self, state: &mut TurnState) -> Result<(), AgentError> {
        if state.diagnosis.is_empty() {
            return Err(AgentError::Invariant(
                "retrieval dispatched without a differential".into(),
            ));
        }

        let query = Self::build_query(state);

        // Index or embedder trouble is non-fatal: the recommender degrades
        // to an evidence-free response.
        let evidence = (|| -> Result<Vec<EvidencePassage>, crate::retrieval::RetrievalError> {
            let embedding = self.embedder.embed(&query)?;
            let candidates = self.index.search(&embedding, CANDIDATES_K)?;
            let reranked = self.reranker.rerank(&query, candidates, EVIDENCE_K)?;
            Ok(reranked
                .into_iter()
                .filter(|p| p.score > 0.0)
                .map(|p| EvidencePassage {
                    passage: p.passage,
                    source_id: p.source_id,
                    relevance: p.score.clamp(0.0, 1.0),
                })
                .collect())
        })();

        match evidence {
            Ok(evidence) => {
                state.push_trace(
                    AgentName::DocumentRetriever,
                    &format!("{} evidence passages for \"{query}\"", evidence.len()),
                );
                state.evidence = evidence;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Evidence retrieval unavailable, continuing without");
                state.push_trace(
                    AgentName::DocumentRetriever,
                    &format!("retrieval degraded: {e}"),
                );
                state.evidence = Vec::new();
            }
        }
        Ok(())
    }
}
