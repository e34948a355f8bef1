//! Produces a structured visual description plus focused Q&A from an
//! image and the user's symptom text.
//!
//! One batched multimodal call yields the description and every answer
//! together, never one call per question. A malformed reply is retried
//! once with a stricter prompt (inside the extraction utility); a second
//! failure leaves `image_analysis` empty with a warning in the trace, and
//! downstream agents tolerate the gap.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use super::{Agent, AgentError};
use crate::llm::{extract, LlmClient};
use crate::models::{AgentName, ImageAnalysis, TurnState};

/// Upper bound on focused questions per image.
const MAX_QUESTIONS: usize = 4;

/// Hedging terms that lower the confidence score.
const HEDGING_TERMS: &[&str] = &[
    "unclear", "blurry", "cannot tell", "not sure", "possibly", "hard to say", "không rõ",
    "khó nói", "có lẽ",
];

#[derive(Debug, Deserialize)]
struct RawVision {
    description: String,
    #[serde(default)]
    answers: BTreeMap<String, String>,
}

pub struct ImageAnalyzer {
    llm: Arc<dyn LlmClient>,
}

impl ImageAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Focused questions derived from the symptom text.
    fn questions_for(text: &str) -> Vec<&'static str> {
        let lower = text.to_lowercase();
        let mut questions: Vec<&'static str> = Vec::new();

        if ["rash", "patch", "itchy", "skin", "ngứa", "mẩn", "da", "ban"]
            .iter()
            .any(|t| lower.contains(t))
        {
            questions.extend([
                "What color and texture does the affected skin have?",
                "Are the borders of the lesion well-defined?",
                "Is there scaling, blistering, or weeping?",
                "Roughly how large is the affected area?",
            ]);
        } else if ["swelling", "swollen", "sưng"].iter().any(|t| lower.contains(t)) {
            questions.extend([
                "Which area appears swollen?",
                "Is the overlying skin discolored?",
                "Is there visible asymmetry compared to the other side?",
            ]);
        } else if ["wound", "cut", "vết thương", "vết cắt"].iter().any(|t| lower.contains(t)) {
            questions.extend([
                "How deep does the wound appear?",
                "Are there signs of infection such as pus or spreading redness?",
                "Are the wound edges clean or ragged?",
            ]);
        } else {
            questions.extend([
                "What is the most prominent visible finding?",
                "Is there any discoloration or asymmetry?",
                "Are there signs of inflammation?",
            ]);
        }

        questions.truncate(MAX_QUESTIONS);
        questions
    }

    /// Confidence from answer completeness and hedging density.
    fn score_confidence(questions: &[&str], analysis: &RawVision) -> f32 {
        if questions.is_empty() {
            return 0.5;
        }
        let answered = questions
            .iter()
            .filter(|q| {
                analysis
                    .answers
                    .get(**q)
                    .map(|a| !a.trim().is_empty())
                    .unwrap_or(false)
            })
            .count();
        let completeness = answered as f32 / questions.len() as f32;

        let haystack = format!(
            "{} {}",
            analysis.description.to_lowercase(),
            analysis.answers.values().cloned().collect::<Vec<_>>().join(" ").to_lowercase()
        );
        let hedges = HEDGING_TERMS.iter().filter(|t| haystack.contains(**t)).count();

        (0.4 + 0.6 * completeness - 0.1 * hedges as f32).clamp(0.0, 1.0)
    }
}

impl Agent for ImageAnalyzer {
    fn name(&self) -> AgentName {
        AgentName::ImageAnalyzer
    }

    fn run(&self, state: &mut TurnState) -> Result<(), AgentError> {
        let Some(image) = state.image.clone() else {
            return Err(AgentError::Invariant("image analysis dispatched without an image".into()));
        };

        let questions = Self::questions_for(&state.user_input);
        let question_list = questions
            .iter()
            .map(|q| format!("- {q}"))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Describe the medical image objectively, then answer each question from the image \
             alone. Patient context: \"{}\"\n\n\
             Questions:\n{question_list}\n\n\
             Respond with JSON:\n\
             {{\"description\": \"...\", \"answers\": {{\"<question>\": \"<answer>\"}}}}",
            state.user_input
        );

        match extract::generate_structured_multimodal::<RawVision>(
            &*self.llm,
            "You describe medical images factually for triage. You do not diagnose.",
            &prompt,
            &image.data,
            &image.mime,
        ) {
            Ok(raw) => {
                let confidence = Self::score_confidence(&questions, &raw);
                state.push_trace(
                    AgentName::ImageAnalyzer,
                    &format!(
                        "description {} chars, {} answers, confidence {confidence:.2}",
                        raw.description.chars().count(),
                        raw.answers.len()
                    ),
                );
                state.image_analysis = Some(ImageAnalysis {
                    description: raw.description,
                    visual_qa: raw.answers,
                    confidence,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Image analysis failed twice, continuing without");
                state.push_trace(AgentName::ImageAnalyzer, &format!("analysis failed: {e}"));
                state.image_analysis = None;
            }
        }
        Ok(())
    }
}
