//! Proposes follow-up questions and tests that discriminate between the
//! top hypotheses, without re-asking what the patient already stated.

use std::sync::Arc;

use serde::Deserialize;

use super::{Agent, AgentError};
use crate::llm::{extract, LlmClient};
use crate::models::{AgentName, Investigation, InvestigationKind, TurnState};

/// Upper bound on proposed items.
const MAX_ITEMS: usize = 6;

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    investigations: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    item: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    targets: Vec<String>,
}

/// A curated follow-up tied to hypothesis keywords.
struct CuratedItem {
    hypothesis_keyword: &'static str,
    item: &'static str,
    kind: InvestigationKind,
    reason: &'static str,
}

const CURATED: &[CuratedItem] = &[
    CuratedItem {
        hypothesis_keyword: "influenza",
        item: "Rapid influenza antigen test",
        kind: InvestigationKind::Test,
        reason: "confirms or excludes influenza quickly",
    },
    CuratedItem {
        hypothesis_keyword: "influenza",
        item: "Have you been in contact with anyone sick in the last week?",
        kind: InvestigationKind::Question,
        reason: "exposure history separates influenza from other febrile causes",
    },
    CuratedItem {
        hypothesis_keyword: "dengue",
        item: "Complete blood count with platelet count",
        kind: InvestigationKind::Test,
        reason: "thrombocytopenia points toward dengue",
    },
    CuratedItem {
        hypothesis_keyword: "dengue",
        item: "Any bleeding gums, nosebleeds, or skin petechiae?",
        kind: InvestigationKind::Question,
        reason: "warning signs change dengue management",
    },
    CuratedItem {
        hypothesis_keyword: "dermatitis",
        item: "Have you used any new soaps, cosmetics, or detergents recently?",
        kind: InvestigationKind::Question,
        reason: "a new exposure favors contact dermatitis",
    },
    CuratedItem {
        hypothesis_keyword: "dermatitis",
        item: "Does the patch spread, blister, or weep fluid?",
        kind: InvestigationKind::Question,
        reason: "morphology separates eczema from infection",
    },
    CuratedItem {
        hypothesis_keyword: "fungal",
        item: "Skin scraping for KOH microscopy",
        kind: InvestigationKind::Test,
        reason: "confirms fungal involvement",
    },
    CuratedItem {
        hypothesis_keyword: "pharyngitis",
        item: "Rapid strep antigen test",
        kind: InvestigationKind::Test,
        reason: "distinguishes streptococcal from viral pharyngitis",
    },
    CuratedItem {
        hypothesis_keyword: "gastroenteritis",
        item: "Have you eaten anything unusual in the last 48 hours?",
        kind: InvestigationKind::Question,
        reason: "food history points toward food poisoning",
    },
    CuratedItem {
        hypothesis_keyword: "reflux",
        item: "Does the discomfort worsen after meals or when lying down?",
        kind: InvestigationKind::Question,
        reason: "positional pattern favors reflux over musculoskeletal pain",
    },
];

pub struct InvestigationGenerator {
    llm: Arc<dyn LlmClient>,
}

impl InvestigationGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn generate_with_llm(
        &self,
        state: &TurnState,
    ) -> Result<Vec<Investigation>, crate::llm::LlmError> {
        let diagnosis = serde_json::to_string(&state.diagnosis).unwrap_or_default();
        let known = serde_json::to_string(&state.symptoms).unwrap_or_default();

        let prompt = format!(
            "Given this differential, propose at most {MAX_ITEMS} follow-up questions or tests \
             that discriminate between the hypotheses. Do not ask about facts already known.\n\n\
             Differential: {diagnosis}\n\
             Already known: {known}\n\n\
             Respond with JSON:\n\
             {{\"investigations\": [{{\"item\": \"...\", \"kind\": \"question|test\", \
             \"reason\": \"...\", \"targets\": [\"hypothesis name\"]}}]}}"
        );

        let raw: RawPlan = extract::generate_structured(
            &*self.llm,
            "You plan focused clinical follow-up questions and tests.",
            &prompt,
        )?;

        Ok(raw
            .investigations
            .into_iter()
            .filter(|i| !i.item.trim().is_empty())
            .map(|i| Investigation {
                item: i.item,
                kind: match i.kind.as_deref() {
                    Some("test") => InvestigationKind::Test,
                    _ => InvestigationKind::Question,
                },
                reason: i.reason,
                targets: i.targets,
            })
            .collect())
    }
}

/// Curated fallback: items whose hypothesis keyword appears in the
/// differential, targeted at the matching hypotheses.
fn heuristic_plan(state: &TurnState) -> Vec<Investigation> {
    let mut plan = Vec::new();
    for entry in CURATED {
        let targets: Vec<String> = state
            .diagnosis
            .iter()
            .filter(|h| h.name.contains(entry.hypothesis_keyword))
            .map(|h| h.name.clone())
            .collect();
        if !targets.is_empty() {
            plan.push(Investigation {
                item: entry.item.to_string(),
                kind: entry.kind,
                reason: entry.reason.to_string(),
                targets,
            });
        }
    }

    // Generic fallbacks so a thin differential still gets follow-up.
    if plan.is_empty() && !state.diagnosis.is_empty() {
        let all: Vec<String> = state.diagnosis.iter().map(|h| h.name.clone()).collect();
        plan.push(Investigation {
            item: "How have the symptoms changed since they started?".into(),
            kind: InvestigationKind::Question,
            reason: "trajectory separates self-limiting from progressive causes".into(),
            targets: all.clone(),
        });
        if !state.symptoms.iter().any(|s| s.duration.is_some()) {
            plan.push(Investigation {
                item: "When exactly did the symptoms begin?".into(),
                kind: InvestigationKind::Question,
                reason: "onset timing narrows the differential".into(),
                targets: all,
            });
        }
    }
    plan
}

/// Drop items that re-ask facts the patient already stated.
fn filter_known(plan: Vec<Investigation>, state: &TurnState) -> Vec<Investigation> {
    plan.into_iter()
        .filter(|inv| {
            let item_lower = inv.item.to_lowercase();
            !state.symptoms.iter().any(|s| {
                // A question naming a reported symptom as a yes/no probe is
                // redundant; tests and qualifier questions stay.
                inv.kind == InvestigationKind::Question
                    && item_lower.contains(&format!("do you have {}", s.name))
            })
        })
        .collect()
}

impl Agent for InvestigationGenerator {
    fn name(&self) -> AgentName {
        AgentName::InvestigationGenerator
    }

    fn run(&self, state: &mut TurnState) -> Result<(), AgentError> {
        if state.diagnosis.is_empty() {
            return Err(AgentError::Invariant(
                "investigations dispatched without a differential".into(),
            ));
        }

        let plan = match self.generate_with_llm(state) {
            Ok(plan) if !plan.is_empty() => plan,
            Ok(_) => heuristic_plan(state),
            Err(e) => {
                tracing::debug!(error = %e, "Investigation planning degraded to curated list");
                heuristic_plan(state)
            }
        };

        let mut plan = filter_known(plan, state);
        plan.truncate(MAX_ITEMS);

        state.push_trace(
            AgentName::InvestigationGenerator,
            &format!("{} follow-up items", plan.len()),
        );
        state.investigations = plan;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::models::{Hypothesis, Symptom};

    fn state_with_differential(names: &[&str]) -> TurnState {
        let mut state = TurnState::new("s1", "fever and aches", None, vec![]);
        state.symptoms.push(Symptom::named("fever"));
        state.diagnosis = names
            .iter()
            .enumerate()
            .map(|(i, n)| Hypothesis {
                name: n.to_string(),
                rationale: "test".into(),
                probability: 0.4 - i as f32 * 0.1,
                red_flag: false,
            })
            .collect();
        state
    }

    fn generator() -> InvestigationGenerator {
        InvestigationGenerator::new(Arc::new(MockLlm::unreachable()))
    }

    #[test]
    fn influenza_differential_gets_flu_items_with_targets() {
        let mut state = state_with_differential(&["influenza", "dengue fever"]);
        generator().run(&mut state).unwrap();

        assert!(state.investigations.len() >= 2);
        assert!(state.investigations.len() <= MAX_ITEMS);

        let flu_test = state
            .investigations
            .iter()
            .find(|i| i.item.contains("influenza antigen"))
            .unwrap();
        assert_eq!(flu_test.targets, vec!["influenza"]);

        let cbc = state
            .investigations
            .iter()
            .find(|i| i.item.contains("platelet"))
            .unwrap();
        assert_eq!(cbc.targets, vec!["dengue fever"]);
    }

    #[test]
    fn thin_differential_still_gets_generic_followup() {
        let mut state = state_with_differential(&["nonspecific viral illness"]);
        generator().run(&mut state).unwrap();
        assert!(!state.investigations.is_empty());
    }

    #[test]
    fn known_facts_are_not_re_asked() {
        let plan = vec![
            Investigation {
                item: "Do you have fever?".into(),
                kind: InvestigationKind::Question,
                reason: "screen".into(),
                targets: vec![],
            },
            Investigation {
                item: "Rapid influenza antigen test".into(),
                kind: InvestigationKind::Test,
                reason: "confirm".into(),
                targets: vec![],
            },
        ];
        let state = state_with_differential(&["influenza"]);
        let filtered = filter_known(plan, &state);
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].item.contains("antigen"));
    }

    #[test]
    fn llm_plan_used_when_valid() {
        let llm = MockLlm::scripted(&[r#"{"investigations": [
            {"item": "Chest X-ray", "kind": "test", "reason": "rule out pneumonia",
             "targets": ["pneumonia"]}
        ]}"#]);
        let mut state = state_with_differential(&["pneumonia"]);
        InvestigationGenerator::new(Arc::new(llm)).run(&mut state).unwrap();
        assert_eq!(state.investigations.len(), 1);
        assert_eq!(state.investigations[0].kind, InvestigationKind::Test);
    }

    #[test]
    fn dispatch_without_differential_is_invariant_error() {
        let mut state = TurnState::new("s1", "hi", None, vec![]);
        assert!(matches!(
            generator().run(&mut state),
            Err(AgentError::Invariant(_))
        ));
    }
}
