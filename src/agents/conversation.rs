//! FAQ and small-talk responder.
//!
//! Answers from the knowledge store when a confident match exists; below
//! the threshold it asks the LLM with the store as context, and when that
//! fails it refines the intent to unknown so the supervisor falls through
//! to clarification.

use std::sync::Arc;

use super::{Agent, AgentError};
use crate::knowledge::KnowledgeStore;
use crate::lang::Lang;
use crate::llm::LlmClient;
use crate::models::{AgentName, Intent, TurnState};

/// Related questions appended under a direct FAQ answer.
const RELATED_LIMIT: usize = 2;

pub struct ConversationAgent {
    knowledge: Arc<KnowledgeStore>,
    llm: Arc<dyn LlmClient>,
}

impl ConversationAgent {
    pub fn new(knowledge: Arc<KnowledgeStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self { knowledge, llm }
    }

    fn answer_with_llm(&self, state: &TurnState) -> Option<String> {
        let profile = self.knowledge.profile();
        let hits = self.knowledge.search(&state.user_input, 3);
        let faq_context: String = hits
            .iter()
            .map(|h| format!("Q: {}\nA: {}", h.question, h.answer))
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "Clinic: {} — {}\nPhone: {}\nHours: {}\n\n\
             Relevant FAQ entries:\n{faq_context}\n\n\
             Patient message: \"{}\"\n\n\
             Answer warmly in the patient's language using only the clinic information above. \
             If the question is unrelated to the clinic, say you can only help with clinic and \
             health matters.",
            profile.name, profile.address, profile.phone, profile.hours_text, state.user_input
        );

        let answer = self
            .llm
            .generate("You are a friendly clinic receptionist assistant.", &prompt)
            .ok()?;
        let answer = answer.trim().to_string();
        (!answer.is_empty()).then_some(answer)
    }
}

impl Agent for ConversationAgent {
    fn name(&self) -> AgentName {
        AgentName::Conversation
    }

    fn run(&self, state: &mut TurnState) -> Result<(), AgentError> {
        if let Some(best) = self.knowledge.best_match(&state.user_input) {
            let mut response = best.answer.clone();

            let related: Vec<String> = self
                .knowledge
                .search(&state.user_input, RELATED_LIMIT + 1)
                .into_iter()
                .filter(|h| h.question != best.question)
                .take(RELATED_LIMIT)
                .map(|h| h.question)
                .collect();
            if !related.is_empty() {
                let heading = match state.lang {
                    Lang::Vi => "\n\nCâu hỏi liên quan:",
                    Lang::En => "\n\nRelated questions:",
                };
                response.push_str(heading);
                for question in related {
                    response.push_str(&format!("\n- {question}"));
                }
            }

            state.push_trace(
                AgentName::Conversation,
                &format!("faq match \"{}\" (score {})", best.question, best.score),
            );
            state.final_response = response;
            return Ok(());
        }

        if let Some(answer) = self.answer_with_llm(state) {
            state.push_trace(AgentName::Conversation, "llm answer with knowledge context");
            state.final_response = answer;
            return Ok(());
        }

        // No confident match and no model: refine the intent so the
        // supervisor falls through to clarification.
        state.push_trace(AgentName::Conversation, "no faq match, refining intent to unknown");
        state.intent = Some(Intent::Unknown);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClinicProfile;
    use crate::llm::MockLlm;

    fn agent(llm: MockLlm) -> ConversationAgent {
        ConversationAgent::new(
            Arc::new(KnowledgeStore::new(ClinicProfile::default())),
            Arc::new(llm),
        )
    }

    #[test]
    fn hours_question_answered_from_faq() {
        let mut state = TurnState::new("s1", "What are your hours?", None, vec![]);
        agent(MockLlm::unreachable()).run(&mut state).unwrap();

        assert!(state.final_response.contains("Mon-Fri 9:00-17:00"));
        assert!(state.final_response.contains("Sat 9:00-12:00"));
    }

    #[test]
    fn unmatched_smalltalk_refines_intent_when_llm_down() {
        let mut state = TurnState::new("s1", "heyyy", None, vec![]);
        agent(MockLlm::unreachable()).run(&mut state).unwrap();

        assert!(state.final_response.is_empty());
        assert_eq!(state.intent, Some(Intent::Unknown));
    }

    #[test]
    fn unmatched_question_falls_back_to_llm_with_context() {
        let llm = MockLlm::scripted(&["Hello! We're a primary-care clinic — happy to help."]);
        let mut state = TurnState::new("s1", "heyyy", None, vec![]);
        agent(llm).run(&mut state).unwrap();
        assert!(state.final_response.contains("primary-care"));
    }

    #[test]
    fn faq_answer_includes_related_questions() {
        let mut state = TurnState::new("s1", "how do I book an appointment", None, vec![]);
        agent(MockLlm::unreachable()).run(&mut state).unwrap();
        assert!(state.final_response.contains("Related questions:"));
    }
}
