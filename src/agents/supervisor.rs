//! The supervisor: a stateless policy over [`TurnState`].
//!
//! Split per the orchestration design: a pure [`decide`] function that is
//! deterministically testable, an LLM-backed intent classification used
//! only on first inspection (with a bilingual keyword fallback), and the
//! shared JSON extraction utility in [`crate::llm::extract`].

use std::sync::Arc;

use serde::Deserialize;

use crate::guardrails::keywords::{contains_keyword, EMERGENCY_KEYWORDS, OUT_OF_SCOPE_KEYWORDS};
use crate::llm::{extract, LlmClient};
use crate::models::{AgentName, Intent, PlanStep, StepStatus, TurnState};

/// History entries shown to the intent classifier.
const CLASSIFIER_HISTORY: usize = 3;

/// The supervisor's choice for the next step.
#[derive(Debug, Clone)]
pub struct Decision {
    /// `None` means TERMINATE.
    pub next: Option<AgentName>,
    pub reasoning: String,
}

impl Decision {
    fn terminate(reasoning: impl Into<String>) -> Self {
        Self { next: None, reasoning: reasoning.into() }
    }

    fn dispatch(agent: AgentName, reasoning: impl Into<String>) -> Self {
        Self { next: Some(agent), reasoning: reasoning.into() }
    }
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    intent: String,
}

pub struct Supervisor {
    llm: Arc<dyn LlmClient>,
    /// Top-hypothesis probability above which investigations are skipped.
    investigation_skip_threshold: f32,
}

impl Supervisor {
    pub fn new(llm: Arc<dyn LlmClient>, investigation_skip_threshold: f32) -> Self {
        Self { llm, investigation_skip_threshold }
    }

    /// One supervision step: classify intent on first inspection, then
    /// decide the next agent and keep the plan current.
    pub fn inspect(&self, state: &mut TurnState) -> Decision {
        if state.intent.is_none() {
            let intent = self.classify_intent(state);
            tracing::info!(intent = ?intent, "Supervisor classified intent");
            state.intent = Some(intent);
            state.plan = seed_plan(intent);
        }

        let decision = decide(state, self.investigation_skip_threshold);
        self.update_plan(state, &decision);
        tracing::debug!(
            next = ?decision.next,
            reasoning = %decision.reasoning,
            "Supervisor decision"
        );
        decision
    }

    fn update_plan(&self, state: &mut TurnState, decision: &Decision) {
        // Settle the previously current step.
        let previously_current: Vec<AgentName> = state
            .plan
            .iter()
            .filter(|s| s.status == StepStatus::Current)
            .map(|s| s.agent)
            .collect();
        for agent in previously_current {
            let status = if state.has_run(agent) { StepStatus::Done } else { StepStatus::Skipped };
            state.mark_plan_step(agent, status);
        }

        match decision.next {
            Some(next) => {
                // The policy is strictly ordered, so a pending step before
                // the dispatched one has been passed over for good
                // (e.g. investigations when the top hypothesis is strong).
                let passed_over: Vec<AgentName> = state
                    .plan
                    .iter()
                    .take_while(|s| s.agent != next)
                    .filter(|s| s.status == StepStatus::Pending)
                    .map(|s| s.agent)
                    .collect();
                for agent in passed_over {
                    state.mark_plan_step(agent, StepStatus::Skipped);
                }
                // Intent refinements can route outside the seeded plan;
                // record the step so the plan stays a faithful log.
                if !state.plan.iter().any(|s| s.agent == next) {
                    state.plan.push(PlanStep {
                        agent: next,
                        status: StepStatus::Pending,
                        note: "added after intent refinement".into(),
                    });
                }
                state.mark_plan_step(next, StepStatus::Current);
            }
            None => {
                let remaining: Vec<AgentName> = state
                    .plan
                    .iter()
                    .filter(|s| s.status == StepStatus::Pending)
                    .map(|s| s.agent)
                    .collect();
                for agent in remaining {
                    state.mark_plan_step(agent, StepStatus::Skipped);
                }
            }
        }
    }

    /// Classify the turn's intent: LLM first, keyword heuristic on any
    /// failure. Never raises to the loop.
    fn classify_intent(&self, state: &TurnState) -> Intent {
        let context: String = state
            .history
            .iter()
            .rev()
            .take(CLASSIFIER_HISTORY)
            .rev()
            .map(|t| format!("{}: {}", t.role.as_str(), t.text))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Classify the patient's intent for a medical clinic assistant.\n\n\
             Intents: faq, appointment, symptoms, image_analysis, emergency, out_of_scope, unknown\n\n\
             Recent conversation:\n{context}\n\n\
             Image attached: {}\n\
             Message: \"{}\"\n\n\
             Respond with JSON: {{\"intent\": \"<name>\"}}",
            if state.image.is_some() { "yes" } else { "no" },
            state.user_input,
        );

        match extract::generate_structured::<RawIntent>(
            &*self.llm,
            "You route patient messages for a clinic triage assistant.",
            &prompt,
        ) {
            Ok(raw) => parse_intent(&raw.intent).unwrap_or_else(|| heuristic_intent(state)),
            Err(e) => {
                tracing::debug!(error = %e, "Intent classification degraded to heuristic");
                heuristic_intent(state)
            }
        }
    }
}

fn parse_intent(name: &str) -> Option<Intent> {
    match name.trim().to_lowercase().as_str() {
        "faq" => Some(Intent::Faq),
        "appointment" => Some(Intent::Appointment),
        "symptoms" => Some(Intent::Symptoms),
        "image_analysis" => Some(Intent::ImageAnalysis),
        "emergency" => Some(Intent::Emergency),
        "out_of_scope" => Some(Intent::OutOfScope),
        "unknown" => Some(Intent::Unknown),
        _ => None,
    }
}

const APPOINTMENT_HINTS: &[&str] = &[
    "appointment", "book", "schedule a visit", "reschedule", "đặt lịch", "hẹn khám", "hủy lịch",
    "đổi lịch",
];

const FAQ_HINTS: &[&str] = &[
    "hours", "open", "location", "address", "insurance", "cost", "price", "services", "parking",
    "giờ làm việc", "địa chỉ", "bảo hiểm", "chi phí", "dịch vụ", "ở đâu",
];

// "bị ho" rather than bare "ho": the bare syllable hides inside common
// English words (hours, phone).
const SYMPTOM_HINTS: &[&str] = &[
    "pain", "fever", "cough", "headache", "ache", "itchy", "rash", "dizzy", "nausea", "tired",
    "sick", "sore", "swollen", "đau", "sốt", "bị ho", "ho khan", "ngứa", "mẩn", "chóng mặt",
    "buồn nôn", "mệt", "sưng",
];

/// Deterministic keyword fallback for intent classification.
pub fn heuristic_intent(state: &TurnState) -> Intent {
    let input = state.user_input.as_str();

    if contains_keyword(input, EMERGENCY_KEYWORDS) {
        return Intent::Emergency;
    }
    if contains_keyword(input, APPOINTMENT_HINTS) {
        return Intent::Appointment;
    }
    if contains_keyword(input, SYMPTOM_HINTS) {
        return if state.image.is_some() { Intent::ImageAnalysis } else { Intent::Symptoms };
    }
    if contains_keyword(input, FAQ_HINTS) {
        return Intent::Faq;
    }
    if state.image.is_some() {
        return Intent::ImageAnalysis;
    }
    if contains_keyword(input, OUT_OF_SCOPE_KEYWORDS) {
        return Intent::OutOfScope;
    }

    // A turn that only supplies missing details ("name ..., phone ...")
    // belongs to the flow the recent history was in.
    let recent: String = state
        .history
        .iter()
        .rev()
        .take(CLASSIFIER_HISTORY)
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    if contains_keyword(&recent, APPOINTMENT_HINTS) {
        return Intent::Appointment;
    }
    if contains_keyword(&recent, SYMPTOM_HINTS) {
        return Intent::Symptoms;
    }

    Intent::Unknown
}

/// The plan seeded for a freshly classified intent.
fn seed_plan(intent: Intent) -> Vec<PlanStep> {
    let agents: &[AgentName] = match intent {
        Intent::Faq => &[AgentName::Conversation],
        Intent::Appointment => &[AgentName::Appointment],
        Intent::Emergency => &[],
        Intent::OutOfScope => &[AgentName::Recommender],
        Intent::ImageAnalysis => &[
            AgentName::ImageAnalyzer,
            AgentName::SymptomExtractor,
            AgentName::DiagnosisEngine,
            AgentName::InvestigationGenerator,
            AgentName::DocumentRetriever,
            AgentName::Recommender,
        ],
        Intent::Symptoms | Intent::Unknown => &[
            AgentName::SymptomExtractor,
            AgentName::DiagnosisEngine,
            AgentName::InvestigationGenerator,
            AgentName::DocumentRetriever,
            AgentName::Recommender,
        ],
    };

    agents
        .iter()
        .map(|&agent| PlanStep { agent, status: StepStatus::Pending, note: String::new() })
        .collect()
}

/// The decision policy. Priority order; first match wins.
///
/// Pure over the state; callable from tests without any collaborator.
pub fn decide(state: &TurnState, investigation_skip_threshold: f32) -> Decision {
    let intent = state.intent.unwrap_or(Intent::Unknown);

    // 2. Emergencies terminate; the redirect text is the guardrail layer's.
    if intent == Intent::Emergency {
        return Decision::terminate("emergency intent: terminate with redirect");
    }

    // 3. Plain FAQ turns with no unresolved diagnostic context.
    if intent == Intent::Faq
        && state.symptoms.is_empty()
        && state.diagnosis.is_empty()
        && !state.has_run(AgentName::Conversation)
    {
        return Decision::dispatch(AgentName::Conversation, "faq intent: answer from knowledge store");
    }

    // 4. Appointment turns go straight to the booking state machine.
    if intent == Intent::Appointment && !state.has_run(AgentName::Appointment) {
        return Decision::dispatch(AgentName::Appointment, "appointment intent: run booking flow");
    }

    // Out-of-scope turns get a single clarification pass.
    if intent == Intent::OutOfScope && !state.has_run(AgentName::Recommender) {
        return Decision::dispatch(
            AgentName::Recommender,
            "out-of-scope input: clarify what the clinic assistant can help with",
        );
    }

    // 5. An unanalyzed image blocks the diagnostic pipeline.
    if state.image.is_some()
        && state.image_analysis.is_none()
        && !state.has_run(AgentName::ImageAnalyzer)
    {
        return Decision::dispatch(AgentName::ImageAnalyzer, "image supplied and not yet analyzed");
    }

    // 6. Extract symptoms when there is material to extract from.
    if state.symptoms.is_empty()
        && !state.has_run(AgentName::SymptomExtractor)
        && (state.has_substantive_input() || state.image_analysis.is_some())
    {
        return Decision::dispatch(AgentName::SymptomExtractor, "no structured symptoms yet");
    }

    // 7. Diagnose once something is known (symptoms or image analysis).
    if state.diagnosis.is_empty()
        && !state.has_run(AgentName::DiagnosisEngine)
        && (!state.symptoms.is_empty() || state.image_analysis.is_some())
    {
        return Decision::dispatch(AgentName::DiagnosisEngine, "symptoms present, no differential yet");
    }

    // 8. Investigations only while the top hypothesis is uncertain.
    if state.investigations.is_empty()
        && !state.has_run(AgentName::InvestigationGenerator)
        && !state.diagnosis.is_empty()
    {
        let top = state.top_hypothesis().map(|h| h.probability).unwrap_or(0.0);
        if top < investigation_skip_threshold {
            return Decision::dispatch(
                AgentName::InvestigationGenerator,
                format!("top hypothesis at {top:.2}, below {investigation_skip_threshold}"),
            );
        }
    }

    // 9. Retrieve evidence against the hypothesis set.
    if state.evidence.is_empty()
        && !state.has_run(AgentName::DocumentRetriever)
        && !state.diagnosis.is_empty()
    {
        return Decision::dispatch(AgentName::DocumentRetriever, "no evidence retrieved yet");
    }

    // 10. The recommender always closes the turn.
    if state.final_response.is_empty() && !state.has_run(AgentName::Recommender) {
        return Decision::dispatch(AgentName::Recommender, "compose the final response");
    }

    Decision::terminate("nothing left to do")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::models::{Hypothesis, ImageAnalysis, ImageRef, Symptom};

    const THRESHOLD: f32 = 0.7;

    fn state(input: &str) -> TurnState {
        TurnState::new("s1", input, None, vec![])
    }

    fn with_image(input: &str) -> TurnState {
        TurnState::new(
            "s1",
            input,
            Some(ImageRef { data: "aGVsbG8=".into(), mime: "image/jpeg".into() }),
            vec![],
        )
    }

    fn hypothesis(name: &str, probability: f32) -> Hypothesis {
        Hypothesis {
            name: name.into(),
            rationale: "test".into(),
            probability,
            red_flag: false,
        }
    }

    #[test]
    fn emergency_intent_terminates() {
        let mut st = state("anything");
        st.intent = Some(Intent::Emergency);
        assert!(decide(&st, THRESHOLD).next.is_none());
    }

    #[test]
    fn faq_routes_to_conversation() {
        let mut st = state("what are your hours");
        st.intent = Some(Intent::Faq);
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::Conversation));
    }

    #[test]
    fn faq_with_open_diagnosis_keeps_diagnostic_flow() {
        let mut st = state("also what are your hours");
        st.intent = Some(Intent::Faq);
        st.symptoms.push(Symptom::named("fever"));
        // Rule 3 does not fire; rule 7 picks the diagnostic path up.
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::DiagnosisEngine));
    }

    #[test]
    fn image_is_analyzed_before_diagnosis() {
        let mut st = with_image("red patch on my arm, itchy");
        st.intent = Some(Intent::ImageAnalysis);
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::ImageAnalyzer));

        // Once analyzed, extraction comes next, never diagnosis first.
        st.image_analysis = Some(ImageAnalysis {
            description: "erythematous patch".into(),
            visual_qa: Default::default(),
            confidence: 0.8,
        });
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::SymptomExtractor));
    }

    #[test]
    fn diagnosis_requires_symptoms_or_image_analysis() {
        let mut st = state("hello");
        st.intent = Some(Intent::Unknown);
        st.push_trace(AgentName::SymptomExtractor, "no symptoms found");
        // Nothing to diagnose from: falls through to the recommender.
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::Recommender));
    }

    #[test]
    fn full_diagnostic_ordering() {
        let mut st = state("I have a fever and headache for 3 days");
        st.intent = Some(Intent::Symptoms);

        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::SymptomExtractor));

        st.push_trace(AgentName::SymptomExtractor, "2 symptoms");
        st.symptoms.push(Symptom::named("fever"));
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::DiagnosisEngine));

        st.push_trace(AgentName::DiagnosisEngine, "2 hypotheses");
        st.diagnosis.push(hypothesis("influenza", 0.4));
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::InvestigationGenerator));

        st.push_trace(AgentName::InvestigationGenerator, "3 items");
        st.investigations.push(crate::models::Investigation {
            item: "rapid flu test".into(),
            kind: crate::models::InvestigationKind::Test,
            reason: "confirm influenza".into(),
            targets: vec!["influenza".into()],
        });
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::DocumentRetriever));

        st.push_trace(AgentName::DocumentRetriever, "5 passages");
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::Recommender));

        st.push_trace(AgentName::Recommender, "response composed");
        st.final_response = "hedged summary".into();
        assert!(decide(&st, THRESHOLD).next.is_none());
    }

    #[test]
    fn confident_top_hypothesis_skips_investigations() {
        let mut st = state("classic presentation");
        st.intent = Some(Intent::Symptoms);
        st.symptoms.push(Symptom::named("fever"));
        st.push_trace(AgentName::SymptomExtractor, "1 symptom");
        st.push_trace(AgentName::DiagnosisEngine, "1 hypothesis");
        st.diagnosis.push(hypothesis("influenza", 0.85));

        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::DocumentRetriever));
    }

    #[test]
    fn retriever_never_runs_before_diagnosis() {
        let mut st = state("fever");
        st.intent = Some(Intent::Symptoms);
        st.symptoms.push(Symptom::named("fever"));
        st.push_trace(AgentName::SymptomExtractor, "1 symptom");

        // Evidence is empty and diagnosis is empty: rule 9 must not fire.
        assert_eq!(decide(&st, THRESHOLD).next, Some(AgentName::DiagnosisEngine));
    }

    #[test]
    fn decision_reasoning_is_never_empty() {
        let mut st = state("I have a cough");
        st.intent = Some(Intent::Symptoms);
        loop {
            let decision = decide(&st, THRESHOLD);
            assert!(!decision.reasoning.is_empty());
            match decision.next {
                Some(agent) => {
                    st.push_trace(agent, "ran");
                    if agent == AgentName::Recommender {
                        st.final_response = "done".into();
                    }
                }
                None => break,
            }
        }
    }

    #[test]
    fn heuristic_intent_covers_both_languages() {
        assert_eq!(heuristic_intent(&state("Tôi cần đặt lịch khám")), Intent::Appointment);
        assert_eq!(heuristic_intent(&state("book me an appointment")), Intent::Appointment);
        assert_eq!(heuristic_intent(&state("Tôi bị sốt và đau đầu")), Intent::Symptoms);
        assert_eq!(heuristic_intent(&state("what are your hours")), Intent::Faq);
        assert_eq!(heuristic_intent(&state("I'm having a stroke")), Intent::Emergency);
        assert_eq!(heuristic_intent(&with_image("")), Intent::ImageAnalysis);
        assert_eq!(heuristic_intent(&state("who won the football game")), Intent::OutOfScope);
        assert_eq!(heuristic_intent(&state("ờm...")), Intent::Unknown);
    }

    #[test]
    fn inspect_seeds_plan_and_marks_current() {
        let supervisor = Supervisor::new(std::sync::Arc::new(MockLlm::unreachable()), THRESHOLD);
        let mut st = state("I have a fever and a cough");

        let decision = supervisor.inspect(&mut st);
        assert_eq!(st.intent, Some(Intent::Symptoms));
        assert_eq!(decision.next, Some(AgentName::SymptomExtractor));
        assert_eq!(st.plan.len(), 5);
        assert_eq!(st.plan[0].agent, AgentName::SymptomExtractor);
        assert_eq!(st.plan[0].status, crate::models::StepStatus::Current);
    }

    #[test]
    fn llm_intent_classification_used_when_parseable() {
        let supervisor = Supervisor::new(
            std::sync::Arc::new(MockLlm::scripted(&[r#"{"intent": "appointment"}"#])),
            THRESHOLD,
        );
        let mut st = state("I'd like to come in next week");
        supervisor.inspect(&mut st);
        assert_eq!(st.intent, Some(Intent::Appointment));
    }
}
