//! Normalizes free text into the structured symptom list.
//!
//! LLM extraction first; a bilingual keyword table takes over when the
//! model is unavailable or returns garbage. An empty result is a valid
//! outcome; the supervisor then routes to clarification through the
//! recommender.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;

use super::{Agent, AgentError};
use crate::llm::{extract, LlmClient};
use crate::models::{AgentName, Severity, Symptom, TurnState};

/// A symptom keyword table row: match patterns, canonical name, body site.
struct SymptomPattern {
    patterns: &'static [&'static str],
    name: &'static str,
    site: Option<&'static str>,
}

const SYMPTOM_TABLE: &[SymptomPattern] = &[
    SymptomPattern { patterns: &["fever", "sốt"], name: "fever", site: None },
    SymptomPattern { patterns: &["headache", "đau đầu", "nhức đầu"], name: "headache", site: Some("head") },
    SymptomPattern { patterns: &["body ache", "body aches", "đau nhức", "đau mình", "nhức mỏi"], name: "body aches", site: None },
    SymptomPattern { patterns: &["cough", "ho khan", "ho có đờm", " ho ", " ho,", " ho."], name: "cough", site: Some("chest") },
    SymptomPattern { patterns: &["sore throat", "đau họng", "viêm họng"], name: "sore throat", site: Some("throat") },
    SymptomPattern { patterns: &["runny nose", "sổ mũi", "nghẹt mũi"], name: "runny nose", site: Some("nose") },
    SymptomPattern { patterns: &["nausea", "buồn nôn"], name: "nausea", site: Some("stomach") },
    SymptomPattern { patterns: &["vomit", "nôn mửa", "nôn ói"], name: "vomiting", site: Some("stomach") },
    SymptomPattern { patterns: &["diarrhea", "tiêu chảy"], name: "diarrhea", site: Some("abdomen") },
    SymptomPattern { patterns: &["abdominal pain", "stomach ache", "đau bụng"], name: "abdominal pain", site: Some("abdomen") },
    SymptomPattern { patterns: &["dizzy", "dizziness", "chóng mặt"], name: "dizziness", site: Some("head") },
    SymptomPattern { patterns: &["fatigue", "tired", "mệt mỏi"], name: "fatigue", site: None },
    SymptomPattern { patterns: &["rash", "red patch", "red patches", "phát ban", "mẩn đỏ", "nổi mẩn", "erythematous"], name: "skin rash", site: Some("skin") },
    SymptomPattern { patterns: &["itchy", "itching", "ngứa", "pruritic"], name: "itching", site: Some("skin") },
    SymptomPattern { patterns: &["chest pain", "đau ngực", "tức ngực"], name: "chest pain", site: Some("chest") },
    SymptomPattern { patterns: &["short of breath", "shortness of breath", "khó thở"], name: "shortness of breath", site: Some("chest") },
    SymptomPattern { patterns: &["sweat", "vã mồ hôi", "đổ mồ hôi"], name: "sweating", site: None },
    SymptomPattern { patterns: &["swelling", "swollen", "sưng"], name: "swelling", site: None },
];

static DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(days?|weeks?|hours?|months?|ngày|tuần|giờ|tháng)").unwrap()
});

static TEMPERATURE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2}(?:[.,]\d)?)\s*°?\s*C\b").unwrap());

const SEVERE_TERMS: &[&str] = &["severe", "intense", "unbearable", "dữ dội", "nặng", "kinh khủng"];
const MILD_TERMS: &[&str] = &["mild", "slight", "a little", "nhẹ", "hơi"];

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    symptoms: Vec<RawSymptom>,
}

#[derive(Debug, Deserialize)]
struct RawSymptom {
    name: String,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    site: Option<String>,
    #[serde(default)]
    modifiers: Vec<String>,
}

pub struct SymptomExtractor {
    llm: Arc<dyn LlmClient>,
}

impl SymptomExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn extract_with_llm(&self, text: &str) -> Result<Vec<Symptom>, crate::llm::LlmError> {
        let prompt = format!(
            "Extract the patient's symptoms from the message below. The message may be in \
             English or Vietnamese; report symptom names in English.\n\n\
             Message: \"{text}\"\n\n\
             Respond with JSON:\n\
             {{\"symptoms\": [{{\"name\": \"...\", \"duration\": null, \"severity\": \
             \"mild|moderate|severe\", \"site\": null, \"modifiers\": []}}]}}\n\
             Use null for anything the patient did not state. An empty list is valid."
        );

        let raw: RawExtraction = extract::generate_structured(
            &*self.llm,
            "You normalize patient messages into structured symptom lists.",
            &prompt,
        )?;

        Ok(raw
            .symptoms
            .into_iter()
            .filter(|s| !s.name.trim().is_empty())
            .map(|s| Symptom {
                name: s.name.trim().to_lowercase(),
                duration: s.duration.filter(|d| !d.is_empty()),
                severity: s.severity.as_deref().and_then(parse_severity),
                site: s.site.filter(|v| !v.is_empty()),
                modifiers: s.modifiers,
            })
            .collect())
    }
}

fn parse_severity(value: &str) -> Option<Severity> {
    match value.trim().to_lowercase().as_str() {
        "mild" | "nhẹ" => Some(Severity::Mild),
        "moderate" | "vừa" | "trung bình" => Some(Severity::Moderate),
        "severe" | "nặng" | "dữ dội" => Some(Severity::Severe),
        _ => None,
    }
}

/// Keyword extraction used when the model path fails.
pub fn heuristic_extract(text: &str) -> Vec<Symptom> {
    let lower = format!(" {} ", text.to_lowercase());

    let turn_duration = DURATION_PATTERN
        .captures(&lower)
        .map(|c| format!("{} {}", &c[1], normalize_duration_unit(&c[2])));
    let turn_severity = if SEVERE_TERMS.iter().any(|t| lower.contains(t)) {
        Some(Severity::Severe)
    } else if MILD_TERMS.iter().any(|t| lower.contains(t)) {
        Some(Severity::Mild)
    } else {
        None
    };

    let mut symptoms = Vec::new();
    for row in SYMPTOM_TABLE {
        if row.patterns.iter().any(|p| lower.contains(p)) {
            let mut symptom = Symptom::named(row.name);
            symptom.duration = turn_duration.clone();
            symptom.severity = turn_severity;
            symptom.site = row.site.map(|s| s.to_string());
            if row.name == "fever" {
                if let Some(temp) = TEMPERATURE_PATTERN.captures(text) {
                    symptom.modifiers.push(format!("{}°C", temp[1].replace(',', ".")));
                }
            }
            symptoms.push(symptom);
        }
    }
    symptoms
}

fn normalize_duration_unit(unit: &str) -> String {
    match unit.to_lowercase().as_str() {
        "ngày" => "days".into(),
        "tuần" => "weeks".into(),
        "giờ" => "hours".into(),
        "tháng" => "months".into(),
        other => other.into(),
    }
}

impl Agent for SymptomExtractor {
    fn name(&self) -> AgentName {
        AgentName::SymptomExtractor
    }

    fn run(&self, state: &mut TurnState) -> Result<(), AgentError> {
        // Free text from the image analysis joins the extraction input.
        let mut text = state.user_input.clone();
        if let Some(analysis) = &state.image_analysis {
            text.push_str(". ");
            text.push_str(&analysis.description);
        }

        let symptoms = match self.extract_with_llm(&text) {
            Ok(symptoms) => symptoms,
            Err(e) => {
                tracing::debug!(error = %e, "Symptom extraction degraded to keyword table");
                heuristic_extract(&text)
            }
        };

        let summary = if symptoms.is_empty() {
            "no symptoms identified".to_string()
        } else {
            format!(
                "extracted {}: {}",
                symptoms.len(),
                symptoms.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
            )
        };

        state.symptoms = symptoms;
        state.push_trace(AgentName::SymptomExtractor, &summary);
        Ok(())
    }
}
