use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{AgentName, GuardrailAction, Intent, InvestigationKind, Role, Severity, StepStatus};
use crate::lang::{self, Lang};

/// Longest input/output preview recorded in the transition log.
const TRACE_PREVIEW_CHARS: usize = 120;

/// One prior exchange entry fed into the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}

/// An opaque image reference supplied with the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    /// Base64-encoded image payload.
    pub data: String,
    pub mime: String,
}

/// A structured symptom normalized from free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symptom {
    pub name: String,
    pub duration: Option<String>,
    pub severity: Option<Severity>,
    pub site: Option<String>,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

impl Symptom {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: None,
            severity: None,
            site: None,
            modifiers: Vec::new(),
        }
    }
}

/// Result of the single batched vision call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub description: String,
    /// Focused question → answer pairs; BTreeMap keeps serialization stable.
    pub visual_qa: BTreeMap<String, String>,
    /// 0.0 – 1.0, derived from answer completeness and hedging density.
    pub confidence: f32,
}

/// One entry of the ranked differential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub name: String,
    pub rationale: String,
    pub probability: f32,
    pub red_flag: bool,
}

/// A follow-up question or test proposed to disambiguate the differential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Investigation {
    pub item: String,
    pub kind: InvestigationKind,
    pub reason: String,
    /// Hypothesis names this item discriminates between.
    pub targets: Vec<String>,
}

/// A retrieved and reranked evidence passage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePassage {
    pub passage: String,
    pub source_id: String,
    pub relevance: f32,
}

/// One step of the supervisor's working plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub agent: AgentName,
    pub status: StepStatus,
    pub note: String,
}

/// An append-only record of an agent transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub agent: AgentName,
    pub summary: String,
    pub at: DateTime<Utc>,
}

/// The per-turn mutable record shared by all agents.
///
/// Exactly one agent writes at a time (the loop is serial and cooperative);
/// the supervisor reads it between steps. Created per turn from history +
/// input and discarded after `final_response` is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnState {
    pub session_id: String,
    pub user_input: String,
    pub image: Option<ImageRef>,
    pub history: Vec<ChatTurn>,
    pub intent: Option<Intent>,
    pub symptoms: Vec<Symptom>,
    pub image_analysis: Option<ImageAnalysis>,
    pub diagnosis: Vec<Hypothesis>,
    pub investigations: Vec<Investigation>,
    pub evidence: Vec<EvidencePassage>,
    pub plan: Vec<PlanStep>,
    pub messages: Vec<TraceEntry>,
    pub final_response: String,
    pub guardrail_action: Option<GuardrailAction>,
    /// Detected response language, fixed at construction.
    pub lang: Lang,
}

impl TurnState {
    pub fn new(
        session_id: impl Into<String>,
        user_input: impl Into<String>,
        image: Option<ImageRef>,
        history: Vec<ChatTurn>,
    ) -> Self {
        let user_input = user_input.into();
        let lang = lang::detect(&user_input);
        Self {
            session_id: session_id.into(),
            user_input,
            image,
            history,
            intent: None,
            symptoms: Vec::new(),
            image_analysis: None,
            diagnosis: Vec::new(),
            investigations: Vec::new(),
            evidence: Vec::new(),
            plan: Vec::new(),
            messages: Vec::new(),
            final_response: String::new(),
            guardrail_action: None,
            lang,
        }
    }

    /// Record an agent transition with a truncated summary.
    pub fn push_trace(&mut self, agent: AgentName, summary: &str) {
        let summary: String = summary.chars().take(TRACE_PREVIEW_CHARS).collect();
        self.messages.push(TraceEntry { agent, summary, at: Utc::now() });
    }

    /// Whether an agent has already been dispatched this turn.
    pub fn has_run(&self, agent: AgentName) -> bool {
        self.messages.iter().any(|m| m.agent == agent)
    }

    /// The highest-probability hypothesis, if any.
    pub fn top_hypothesis(&self) -> Option<&Hypothesis> {
        self.diagnosis.first()
    }

    /// Whether the input carries enough text to attempt symptom extraction.
    pub fn has_substantive_input(&self) -> bool {
        self.user_input.trim().chars().count() >= 4
    }

    /// Mark a plan step with a new status, respecting the monotone order
    /// pending → current → done | skipped.
    pub fn mark_plan_step(&mut self, agent: AgentName, status: StepStatus) {
        if let Some(step) = self.plan.iter_mut().find(|s| s.agent == agent) {
            let allowed = matches!(
                (step.status, status),
                (StepStatus::Pending, _)
                    | (StepStatus::Current, StepStatus::Done)
                    | (StepStatus::Current, StepStatus::Skipped)
            );
            if allowed {
                step.status = status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(input: &str) -> TurnState {
        TurnState::new("s1", input, None, vec![])
    }

    #[test]
    fn new_state_detects_language() {
        assert_eq!(state("I have a fever").lang, Lang::En);
        assert_eq!(state("Tôi bị sốt").lang, Lang::Vi);
    }

    #[test]
    fn trace_entries_preserve_dispatch_order() {
        let mut st = state("hello");
        st.push_trace(AgentName::SymptomExtractor, "extracted 2 symptoms");
        st.push_trace(AgentName::DiagnosisEngine, "3 hypotheses");
        assert_eq!(st.messages[0].agent, AgentName::SymptomExtractor);
        assert_eq!(st.messages[1].agent, AgentName::DiagnosisEngine);
        assert!(st.has_run(AgentName::DiagnosisEngine));
        assert!(!st.has_run(AgentName::Recommender));
    }

    #[test]
    fn trace_summary_is_truncated() {
        let mut st = state("hello");
        st.push_trace(AgentName::Recommender, &"x".repeat(500));
        assert!(st.messages[0].summary.chars().count() <= 120);
    }

    #[test]
    fn plan_step_transitions_are_monotone() {
        let mut st = state("hello");
        st.plan.push(PlanStep {
            agent: AgentName::Recommender,
            status: StepStatus::Pending,
            note: String::new(),
        });

        st.mark_plan_step(AgentName::Recommender, StepStatus::Current);
        assert_eq!(st.plan[0].status, StepStatus::Current);

        st.mark_plan_step(AgentName::Recommender, StepStatus::Done);
        assert_eq!(st.plan[0].status, StepStatus::Done);

        // Done is terminal
        st.mark_plan_step(AgentName::Recommender, StepStatus::Pending);
        assert_eq!(st.plan[0].status, StepStatus::Done);
        st.mark_plan_step(AgentName::Recommender, StepStatus::Current);
        assert_eq!(st.plan[0].status, StepStatus::Done);
    }

    #[test]
    fn substantive_input_requires_some_text() {
        assert!(state("fever").has_substantive_input());
        assert!(!state("ok").has_substantive_input());
        assert!(!state("  ").has_substantive_input());
    }
}
