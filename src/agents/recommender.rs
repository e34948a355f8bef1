//! Composes the patient-facing response from diagnosis, investigations
//! and retrieved evidence.
//!
//! Composition is deterministic template synthesis in the user's language:
//! acknowledgement, a hedged summary of the leading hypotheses (never
//! probabilities as authority), follow-up questions/tests, source
//! citations, and a care disclaimer. No medication names with dosages;
//! the output guardrail enforces what the template already avoids.

use super::{Agent, AgentError};
use crate::lang::Lang;
use crate::models::{AgentName, InvestigationKind, TurnState};

/// Hypotheses surfaced to the patient.
const SUMMARY_HYPOTHESES: usize = 3;

/// Follow-up items surfaced to the patient.
const SUMMARY_ITEMS: usize = 4;

pub struct Recommender;

impl Recommender {
    pub fn new() -> Self {
        Self
    }

    fn compose(state: &TurnState) -> String {
        if state.symptoms.is_empty() && state.diagnosis.is_empty() {
            return clarification(state.lang);
        }

        let mut out = String::new();
        out.push_str(&acknowledgement(state));

        if !state.diagnosis.is_empty() {
            out.push_str(&hedged_summary(state));
        }

        if !state.investigations.is_empty() {
            out.push_str(&follow_up_section(state));
        }

        if !state.evidence.is_empty() {
            let sources: Vec<&str> =
                state.evidence.iter().map(|e| e.source_id.as_str()).collect();
            match state.lang {
                Lang::Vi => {
                    out.push_str(&format!("\nTài liệu tham khảo: {}\n", sources.join(", ")))
                }
                Lang::En => out.push_str(&format!("\nSources: {}\n", sources.join(", "))),
            }
        }

        out.push_str(&disclaimer(state.lang));
        out
    }
}

impl Default for Recommender {
    fn default() -> Self {
        Self::new()
    }
}

fn acknowledgement(state: &TurnState) -> String {
    let symptom_list = state
        .symptoms
        .iter()
        .take(5)
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    match state.lang {
        Lang::Vi => {
            if symptom_list.is_empty() {
                "Cảm ơn bạn đã chia sẻ tình trạng của mình.\n".to_string()
            } else {
                format!("Cảm ơn bạn đã chia sẻ. Tôi ghi nhận các triệu chứng: {symptom_list}.\n")
            }
        }
        Lang::En => {
            if symptom_list.is_empty() {
                "Thank you for sharing how you're feeling.\n".to_string()
            } else {
                format!("Thank you for sharing. I've noted these symptoms: {symptom_list}.\n")
            }
        }
    }
}

fn hedged_summary(state: &TurnState) -> String {
    let names = state
        .diagnosis
        .iter()
        .take(SUMMARY_HYPOTHESES)
        .map(|h| h.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    match state.lang {
        Lang::Vi => format!(
            "\nDựa trên mô tả của bạn, một số khả năng có thể liên quan là: {names}. \
             Đây không phải là chẩn đoán — chỉ bác sĩ mới có thể xác định sau khi thăm khám.\n"
        ),
        Lang::En => format!(
            "\nBased on what you've described, possible explanations may include: {names}. \
             This is not a diagnosis — only a doctor can determine the cause after an examination.\n"
        ),
    }
}

fn follow_up_section(state: &TurnState) -> String {
    let mut section = match state.lang {
        Lang::Vi => "\nĐể giúp bác sĩ đánh giá chính xác hơn, những điều sau sẽ hữu ích:\n".to_string(),
        Lang::En => "\nTo help a clinician narrow this down, the following would be useful:\n".to_string(),
    };

    for item in state.investigations.iter().take(SUMMARY_ITEMS) {
        let marker = match (state.lang, item.kind) {
            (Lang::Vi, InvestigationKind::Test) => "xét nghiệm",
            (Lang::Vi, InvestigationKind::Question) => "câu hỏi",
            (Lang::En, InvestigationKind::Test) => "test",
            (Lang::En, InvestigationKind::Question) => "question",
        };
        section.push_str(&format!("- ({marker}) {}\n", item.item));
    }
    section
}

fn clarification(lang: Lang) -> String {
    match lang {
        Lang::Vi => "Tôi chưa đủ thông tin để hỗ trợ bạn. Bạn có thể cho biết điều gì đang làm \
                     bạn khó chịu, bắt đầu từ khi nào, và mức độ ra sao không? Nếu bạn muốn đặt \
                     lịch khám, hãy cho tôi biết ngày giờ mong muốn."
            .to_string(),
        Lang::En => "I don't have quite enough to go on yet. Could you tell me what's bothering \
                     you, when it started, and how severe it feels? If you'd like to book a \
                     visit instead, just tell me a preferred date and time."
            .to_string(),
    }
}

fn disclaimer(lang: Lang) -> String {
    match lang {
        Lang::Vi => "\nVui lòng đặt lịch khám với bác sĩ để được đánh giá đầy đủ. Nếu các triệu \
                     chứng trở nặng đột ngột, hãy đến cơ sở y tế gần nhất."
            .to_string(),
        Lang::En => "\nPlease book a visit with a doctor for a proper evaluation. If your \
                     symptoms suddenly get worse, please seek care at the nearest clinic or \
                     hospital."
            .to_string(),
    }
}

impl Agent for Recommender {
    fn name(&self) -> AgentName {
        AgentName::Recommender
    }

    fn run(&self, state: &mut TurnState) -> Result<(), AgentError> {
        let response = Self::compose(state);
        state.push_trace(
            AgentName::Recommender,
            &format!("composed {} chars", response.chars().count()),
        );
        state.final_response = response;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvidencePassage, Hypothesis, Investigation, Symptom};

    fn full_state() -> TurnState {
        let mut state =
            TurnState::new("s1", "fever, headache, body aches for 3 days", None, vec![]);
        state.symptoms = vec![
            Symptom::named("fever"),
            Symptom::named("headache"),
            Symptom::named("body aches"),
        ];
        state.diagnosis = vec![
            Hypothesis {
                name: "influenza".into(),
                rationale: "febrile syndrome".into(),
                probability: 0.35,
                red_flag: false,
            },
            Hypothesis {
                name: "viral upper respiratory infection".into(),
                rationale: "systemic aches".into(),
                probability: 0.25,
                red_flag: false,
            },
        ];
        state.investigations = vec![Investigation {
            item: "Rapid influenza antigen test".into(),
            kind: InvestigationKind::Test,
            reason: "confirm flu".into(),
            targets: vec!["influenza".into()],
        }];
        state.evidence = vec![EvidencePassage {
            passage: "Influenza presents with fever and myalgia.".into(),
            source_id: "flu-guide#0".into(),
            relevance: 0.8,
        }];
        state
    }

    #[test]
    fn full_response_has_all_sections() {
        let mut state = full_state();
        Recommender::new().run(&mut state).unwrap();
        let response = &state.final_response;

        assert!(response.contains("Thank you for sharing"));
        assert!(response.contains("may include"));
        assert!(response.contains("influenza"));
        assert!(response.contains("antigen test"));
        assert!(response.contains("flu-guide#0"));
        assert!(response.contains("not a diagnosis"));
        assert!(response.contains("book a visit"));
    }

    #[test]
    fn probabilities_are_never_shown() {
        let mut state = full_state();
        Recommender::new().run(&mut state).unwrap();
        assert!(!state.final_response.contains("0.35"));
        assert!(!state.final_response.contains("35%"));
    }

    #[test]
    fn no_dosage_in_output() {
        let mut state = full_state();
        Recommender::new().run(&mut state).unwrap();
        assert!(crate::guardrails::keywords::medical_compliance_violation(&state.final_response)
            .is_none());
    }

    #[test]
    fn vietnamese_turn_gets_vietnamese_response() {
        let mut state = TurnState::new("s1", "Tôi bị sốt và đau đầu", None, vec![]);
        state.symptoms = vec![Symptom::named("fever")];
        state.diagnosis = vec![Hypothesis {
            name: "influenza".into(),
            rationale: String::new(),
            probability: 0.4,
            red_flag: false,
        }];
        Recommender::new().run(&mut state).unwrap();
        assert!(state.final_response.contains("Cảm ơn bạn"));
        assert!(state.final_response.contains("bác sĩ"));
    }

    #[test]
    fn empty_state_yields_clarification() {
        let mut state = TurnState::new("s1", "hello?", None, vec![]);
        Recommender::new().run(&mut state).unwrap();
        assert!(state.final_response.contains("Could you tell me"));
    }

    #[test]
    fn missing_evidence_omits_sources_section() {
        let mut state = full_state();
        state.evidence.clear();
        Recommender::new().run(&mut state).unwrap();
        assert!(!state.final_response.contains("Sources:"));
        assert!(state.final_response.contains("influenza"));
    }
}
