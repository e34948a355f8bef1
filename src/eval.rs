//! Evaluation runner over the public chat interface.
//!
//! Consumes a JSONL dataset of expected-behavior rows, drives each
//! through [`Engine::chat`] with a fresh session, and writes a JSON
//! summary. The judge side of the harness lives outside the core; this
//! runner only checks literal expectations.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::{ChatRequest, Engine, EngineError};

/// One dataset row.
#[derive(Debug, Deserialize)]
pub struct EvalCase {
    pub input: String,
    /// Substrings the response must contain.
    #[serde(default)]
    pub expect_contains: Vec<String>,
    /// Substrings the response must not contain.
    #[serde(default)]
    pub expect_absent: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EvalResult {
    pub input: String,
    pub response: String,
    pub passed: bool,
    pub failures: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EvalSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<EvalResult>,
}

/// Run every case against the engine and collect a summary.
pub fn run_cases(engine: &Engine, cases: Vec<EvalCase>) -> Result<EvalSummary, EngineError> {
    let mut results = Vec::with_capacity(cases.len());

    for (i, case) in cases.into_iter().enumerate() {
        let outcome = engine.chat(ChatRequest::text(format!("eval-{i}"), case.input.clone()))?;

        let mut failures = Vec::new();
        for expected in &case.expect_contains {
            if !outcome.response.contains(expected) {
                failures.push(format!("missing expected text: {expected:?}"));
            }
        }
        for forbidden in &case.expect_absent {
            if outcome.response.contains(forbidden) {
                failures.push(format!("contains forbidden text: {forbidden:?}"));
            }
        }

        tracing::debug!(case = i, passed = failures.is_empty(), "Evaluation case done");
        results.push(EvalResult {
            input: case.input,
            response: outcome.response,
            passed: failures.is_empty(),
            failures,
        });
    }

    let passed = results.iter().filter(|r| r.passed).count();
    Ok(EvalSummary {
        total: results.len(),
        passed,
        failed: results.len() - passed,
        results,
    })
}

/// Load a JSONL dataset; blank lines are skipped.
pub fn load_dataset(path: &Path) -> Result<Vec<EvalCase>, EngineError> {
    let content = fs::read_to_string(path)
        .map_err(|e| EngineError::Validation(format!("cannot read dataset: {e}")))?;

    let mut cases = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let case: EvalCase = serde_json::from_str(line).map_err(|e| {
            EngineError::Validation(format!("dataset line {}: {e}", line_no + 1))
        })?;
        cases.push(case);
    }
    Ok(cases)
}

/// Write the summary as pretty JSON.
pub fn write_summary(summary: &EvalSummary, output: &Path) -> Result<(), EngineError> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    fs::write(output, json).map_err(|e| EngineError::Internal(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ClinicProfile;
    use crate::db::{open_memory_database, AppointmentStore};
    use crate::engine::{EngineConfig, EngineDeps};
    use crate::knowledge::KnowledgeStore;
    use crate::llm::MockLlm;
    use crate::retrieval::{HashEmbedder, InMemoryVectorIndex, LexicalReranker};

    fn engine() -> Engine {
        Engine::new(
            EngineConfig::default(),
            EngineDeps {
                llm: Arc::new(MockLlm::unreachable()),
                embedder: Arc::new(HashEmbedder::default()),
                index: Arc::new(InMemoryVectorIndex::new()),
                reranker: Arc::new(LexicalReranker::new()),
                knowledge: Arc::new(KnowledgeStore::new(ClinicProfile::default())),
                appointments: Arc::new(AppointmentStore::new(
                    open_memory_database().unwrap(),
                    ClinicProfile::default(),
                )),
                history_db: None,
            },
        )
    }

    #[test]
    fn cases_pass_and_fail_on_expectations() {
        let engine = engine();
        let summary = run_cases(
            &engine,
            vec![
                EvalCase {
                    input: "What are your hours?".into(),
                    expect_contains: vec!["Mon-Fri".into()],
                    expect_absent: vec!["diagnosis".into()],
                },
                EvalCase {
                    input: "What are your hours?".into(),
                    expect_contains: vec!["definitely not in the answer".into()],
                    expect_absent: vec![],
                },
            ],
        )
        .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.results[1].failures[0].contains("missing expected"));
    }

    #[test]
    fn dataset_round_trip() {
        let dir = std::env::temp_dir().join(format!("mediq-eval-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let dataset = dir.join("cases.jsonl");
        fs::write(
            &dataset,
            r#"{"input": "What are your hours?", "expect_contains": ["Mon-Fri"]}

{"input": "Tôi bị đột quỵ", "expect_contains": ["115"]}
"#,
        )
        .unwrap();

        let cases = load_dataset(&dataset).unwrap();
        assert_eq!(cases.len(), 2);

        let engine = engine();
        let summary = run_cases(&engine, cases).unwrap();
        assert_eq!(summary.passed, 2);

        let output = dir.join("summary.json");
        write_summary(&summary, &output).unwrap();
        assert!(fs::read_to_string(&output).unwrap().contains("\"passed\": 2"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_dataset_is_a_validation_error() {
        let dir = std::env::temp_dir().join(format!("mediq-eval-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let dataset = dir.join("bad.jsonl");
        fs::write(&dataset, "not json at all\n").unwrap();

        let err = load_dataset(&dataset).unwrap_err();
        assert_eq!(err.code(), crate::engine::ErrorCode::ValidationError);

        fs::remove_dir_all(&dir).unwrap();
    }
}
