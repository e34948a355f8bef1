//! Produces the ranked differential with per-hypothesis rationale and
//! red-flag detection.
//!
//! Up to five hypotheses, probabilities normalized to sum ≤ 1 (the
//! residual reads as "other/insufficient information"), deterministic
//! alphabetical tie-breaks. Any hypothesis matching a curated emergency
//! pattern flips the turn's intent to emergency; the supervisor then
//! terminates with a redirect on its next inspection.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;

use super::{Agent, AgentError};
use crate::llm::{extract, LlmClient};
use crate::models::{AgentName, Hypothesis, Intent, TurnState};

/// Maximum differential size.
const MAX_HYPOTHESES: usize = 5;

/// A curated emergency presentation.
struct RedFlagPattern {
    regex: &'static LazyLock<Regex>,
    hypothesis: &'static str,
    rationale: &'static str,
}

static ACS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(chest pain|đau ngực|tức ngực).{0,80}(radiat|lan ra|arm|cánh tay|jaw|hàm|shortness of breath|khó thở|sweat|vã mồ hôi)",
    )
    .unwrap()
});

static STROKE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(face droop|slurred speech|méo miệng|nói ngọng|sudden weakness|yếu liệt|yếu nửa người|liệt nửa người|one side of (the )?body)",
    )
    .unwrap()
});

static ANAPHYLAXIS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(anaphylaxis|phản vệ|(swelling|sưng).{0,40}(throat|tongue|họng|lưỡi)|(throat|tongue|họng|lưỡi).{0,40}(swelling|sưng))",
    )
    .unwrap()
});

static RESPIRATORY_FAILURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(can't breathe|cannot breathe|không thở được|turning blue|tím tái)").unwrap()
});

static RED_FLAG_PATTERNS: &[RedFlagPattern] = &[
    RedFlagPattern {
        regex: &ACS_PATTERN,
        hypothesis: "acute coronary syndrome",
        rationale: "chest pain with radiation, dyspnea or diaphoresis",
    },
    RedFlagPattern {
        regex: &STROKE_PATTERN,
        hypothesis: "acute stroke",
        rationale: "focal neurological deficit of sudden onset",
    },
    RedFlagPattern {
        regex: &ANAPHYLAXIS_PATTERN,
        hypothesis: "anaphylaxis",
        rationale: "airway-threatening allergic reaction",
    },
    RedFlagPattern {
        regex: &RESPIRATORY_FAILURE_PATTERN,
        hypothesis: "acute respiratory failure",
        rationale: "inability to breathe",
    },
];

#[derive(Debug, Deserialize)]
struct RawDifferential {
    #[serde(default)]
    hypotheses: Vec<RawHypothesis>,
}

#[derive(Debug, Deserialize)]
struct RawHypothesis {
    name: String,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    probability: f32,
}

pub struct DiagnosisEngine {
    llm: Arc<dyn LlmClient>,
}

impl DiagnosisEngine {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn diagnose_with_llm(&self, state: &TurnState) -> Result<Vec<Hypothesis>, crate::llm::LlmError> {
        let symptoms = serde_json::to_string(&state.symptoms).unwrap_or_default();
        let image_part = state
            .image_analysis
            .as_ref()
            .map(|a| format!("\nImage findings: {}", a.description))
            .unwrap_or_default();

        let prompt = format!(
            "Given these structured symptoms, produce a ranked differential of up to \
             {MAX_HYPOTHESES} hypotheses with probabilities that sum to at most 1.0.\n\n\
             Symptoms: {symptoms}{image_part}\n\n\
             Respond with JSON:\n\
             {{\"hypotheses\": [{{\"name\": \"...\", \"rationale\": \"...\", \"probability\": 0.0}}]}}"
        );

        let raw: RawDifferential = extract::generate_structured(
            &*self.llm,
            "You are a cautious diagnostic assistant producing differentials for clinician review.",
            &prompt,
        )?;

        Ok(raw
            .hypotheses
            .into_iter()
            .filter(|h| !h.name.trim().is_empty())
            .map(|h| Hypothesis {
                name: h.name.trim().to_lowercase(),
                rationale: h.rationale,
                probability: h.probability.clamp(0.0, 1.0),
                red_flag: false,
            })
            .collect())
    }
}

/// Curated fallback differential from symptom names alone.
fn heuristic_differential(state: &TurnState) -> Vec<Hypothesis> {
    let names: Vec<&str> = state.symptoms.iter().map(|s| s.name.as_str()).collect();
    let has = |n: &str| names.contains(&n);
    let mut out: Vec<Hypothesis> = Vec::new();
    let mut push = |name: &str, rationale: &str, probability: f32| {
        out.push(Hypothesis {
            name: name.into(),
            rationale: rationale.into(),
            probability,
            red_flag: false,
        });
    };

    if has("fever") && (has("headache") || has("body aches")) {
        push("influenza", "fever with headache and myalgia", 0.35);
        push("viral upper respiratory infection", "febrile syndrome with systemic aches", 0.25);
        push("dengue fever", "febrile illness; endemic consideration", 0.15);
    } else if has("skin rash") || has("itching") {
        push("contact dermatitis", "pruritic localized eruption", 0.3);
        push("atopic dermatitis", "itchy patches, often recurrent", 0.25);
        push("fungal skin infection", "localized patch, common differential", 0.15);
    } else if has("cough") && has("sore throat") {
        push("viral pharyngitis", "cough with throat pain", 0.35);
        push("streptococcal pharyngitis", "bacterial throat infection", 0.2);
    } else if has("abdominal pain") && (has("diarrhea") || has("nausea") || has("vomiting")) {
        push("gastroenteritis", "abdominal pain with GI upset", 0.4);
        push("food poisoning", "acute GI syndrome", 0.2);
    } else if has("chest pain") {
        push("musculoskeletal chest pain", "common benign cause", 0.3);
        push("gastroesophageal reflux", "retrosternal discomfort", 0.2);
    } else if !names.is_empty() {
        push("nonspecific viral illness", "symptoms without a distinctive pattern", 0.3);
    }

    out
}

/// Red-flag presentations found in the combined narrative.
fn detect_red_flags(narrative: &str) -> Vec<Hypothesis> {
    RED_FLAG_PATTERNS
        .iter()
        .filter(|p| p.regex.is_match(narrative))
        .map(|p| Hypothesis {
            name: p.hypothesis.into(),
            rationale: p.rationale.into(),
            probability: 0.5,
            red_flag: true,
        })
        .collect()
}

/// Rank, tie-break alphabetically, truncate and normalize to sum ≤ 1.
fn finalize(mut hypotheses: Vec<Hypothesis>) -> Vec<Hypothesis> {
    hypotheses.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    let mut seen = std::collections::HashSet::new();
    hypotheses.retain(|h| seen.insert(h.name.clone()));
    hypotheses.truncate(MAX_HYPOTHESES);

    let total: f32 = hypotheses.iter().map(|h| h.probability).sum();
    if total > 1.0 {
        for h in &mut hypotheses {
            h.probability /= total;
        }
    }
    hypotheses
}

impl Agent for DiagnosisEngine {
    fn name(&self) -> AgentName {
        AgentName::DiagnosisEngine
    }

    fn run(&self, state: &mut TurnState) -> Result<(), AgentError> {
        if state.symptoms.is_empty() && state.image_analysis.is_none() {
            return Err(AgentError::Invariant(
                "diagnosis dispatched without symptoms or image analysis".into(),
            ));
        }

        let mut hypotheses = match self.diagnose_with_llm(state) {
            Ok(list) if !list.is_empty() => list,
            Ok(_) => heuristic_differential(state),
            Err(e) => {
                tracing::debug!(error = %e, "Diagnosis degraded to curated differential");
                heuristic_differential(state)
            }
        };

        // Red flags come from the raw narrative plus structured names, so
        // a presentation the extractor flattened still trips them.
        let mut narrative = state.user_input.clone();
        for symptom in &state.symptoms {
            narrative.push_str(", ");
            narrative.push_str(&symptom.name);
        }
        if let Some(analysis) = &state.image_analysis {
            narrative.push_str(", ");
            narrative.push_str(&analysis.description);
        }
        hypotheses.extend(detect_red_flags(&narrative));

        let hypotheses = finalize(hypotheses);
        let any_red_flag = hypotheses.iter().any(|h| h.red_flag);
        if any_red_flag {
            state.intent = Some(Intent::Emergency);
        }

        state.push_trace(
            AgentName::DiagnosisEngine,
            &format!(
                "{} hypotheses{}",
                hypotheses.len(),
                if any_red_flag { ", red flag raised" } else { "" }
            ),
        );
        state.diagnosis = hypotheses;
        Ok(())
    }
}
