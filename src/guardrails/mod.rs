//! Tiered input/output validation composed around every agent boundary.
//!
//! Three implementations share one [`Guardrail`] trait; a
//! [`GuardrailManager`] selects a tier at startup and the turn loop only
//! ever talks to the manager. A tier that fails internally (e.g. LLM
//! timeout) degrades to the next lower tier's check for that message; it
//! never raises into the loop.

pub mod advanced;
pub mod intermediate;
pub mod keywords;
pub mod messages;
pub mod risk;
pub mod simple;

pub use advanced::{AdvancedGuardrail, ComplianceReport};
pub use intermediate::IntermediateGuardrail;
pub use risk::{RiskLevel, UserRiskProfile};
pub use simple::SimpleGuardrail;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::LlmClient;
use crate::models::{GuardrailAction, Intent, TurnState};

/// Which guardrail implementation the engine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailTier {
    Simple,
    Intermediate,
    Advanced,
}

/// Outcome of one guardrail pass.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub action: GuardrailAction,
    pub reason: String,
    /// Text that becomes `final_response` on redirect/block.
    pub replacement: Option<String>,
    pub risk: RiskLevel,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            action: GuardrailAction::Allow,
            reason: "validation passed".into(),
            replacement: None,
            risk: RiskLevel::Safe,
        }
    }

    pub fn warn(reason: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            action: GuardrailAction::Warn,
            reason: reason.into(),
            replacement: None,
            risk,
        }
    }

    pub fn redirect(reason: impl Into<String>, replacement: String) -> Self {
        Self {
            action: GuardrailAction::Redirect,
            reason: reason.into(),
            replacement: Some(replacement),
            risk: RiskLevel::Critical,
        }
    }

    pub fn block(reason: impl Into<String>, replacement: String, risk: RiskLevel) -> Self {
        Self {
            action: GuardrailAction::Block,
            reason: reason.into(),
            replacement: Some(replacement),
            risk,
        }
    }
}

/// The pair every tier exposes. Implementations take the whole state so
/// they can see history, language, and session id, but only the manager
/// mutates the state.
pub trait Guardrail: Send + Sync {
    fn check_input(&self, state: &TurnState) -> Verdict;
    fn check_output(&self, state: &TurnState) -> Verdict;
    fn tier(&self) -> GuardrailTier;
}

/// Selects one tier at startup; the loop calls the manager, not the
/// concrete implementation.
pub struct GuardrailManager {
    inner: Arc<dyn Guardrail>,
}

impl GuardrailManager {
    pub fn new(tier: GuardrailTier, llm: Arc<dyn LlmClient>) -> Self {
        let inner: Arc<dyn Guardrail> = match tier {
            GuardrailTier::Simple => Arc::new(SimpleGuardrail::new()),
            GuardrailTier::Intermediate => Arc::new(IntermediateGuardrail::new(llm)),
            GuardrailTier::Advanced => Arc::new(AdvancedGuardrail::new(llm)),
        };
        Self { inner }
    }

    /// Wrap an already-built tier (used to share an advanced tier with the
    /// compliance-report surface).
    pub fn from_guardrail(inner: Arc<dyn Guardrail>) -> Self {
        Self { inner }
    }

    pub fn tier(&self) -> GuardrailTier {
        self.inner.tier()
    }

    /// Run the input check and apply its verdict to the state.
    /// Returns true when the turn is terminal (redirect or block).
    pub fn apply_input(&self, state: &mut TurnState) -> bool {
        let verdict = self.inner.check_input(state);
        tracing::info!(
            tier = ?self.inner.tier(),
            action = ?verdict.action,
            risk = ?verdict.risk,
            reason = %verdict.reason,
            "Guardrail input check"
        );

        state.guardrail_action = Some(verdict.action);
        match verdict.action {
            GuardrailAction::Allow | GuardrailAction::Warn => false,
            GuardrailAction::Redirect => {
                state.intent = Some(Intent::Emergency);
                if let Some(text) = verdict.replacement {
                    state.final_response = text;
                }
                true
            }
            GuardrailAction::Block => {
                if let Some(text) = verdict.replacement {
                    state.final_response = text;
                }
                true
            }
        }
    }

    /// Run the output check and apply its verdict. May rewrite
    /// `final_response`; never re-enables a turn the input check terminated.
    pub fn apply_output(&self, state: &mut TurnState) {
        // An input-terminated turn keeps its redirect/block response.
        if matches!(
            state.guardrail_action,
            Some(GuardrailAction::Redirect) | Some(GuardrailAction::Block)
        ) {
            return;
        }

        let verdict = self.inner.check_output(state);
        tracing::info!(
            tier = ?self.inner.tier(),
            action = ?verdict.action,
            risk = ?verdict.risk,
            reason = %verdict.reason,
            "Guardrail output check"
        );

        match verdict.action {
            GuardrailAction::Allow => {}
            GuardrailAction::Warn => {
                state.guardrail_action = Some(GuardrailAction::Warn);
            }
            GuardrailAction::Redirect | GuardrailAction::Block => {
                state.guardrail_action = Some(verdict.action);
                if let Some(text) = verdict.replacement {
                    state.final_response = text;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    fn manager(tier: GuardrailTier) -> GuardrailManager {
        GuardrailManager::new(tier, Arc::new(MockLlm::unreachable()))
    }

    #[test]
    fn manager_selects_requested_tier() {
        assert_eq!(manager(GuardrailTier::Simple).tier(), GuardrailTier::Simple);
        assert_eq!(
            manager(GuardrailTier::Intermediate).tier(),
            GuardrailTier::Intermediate
        );
        assert_eq!(manager(GuardrailTier::Advanced).tier(), GuardrailTier::Advanced);
    }

    #[test]
    fn redirect_sets_emergency_intent_and_terminates() {
        let mgr = manager(GuardrailTier::Simple);
        let mut state = TurnState::new("s1", "I think I'm having a heart attack", None, vec![]);
        let terminal = mgr.apply_input(&mut state);
        assert!(terminal);
        assert_eq!(state.intent, Some(Intent::Emergency));
        assert!(state.final_response.contains("115"));
    }

    #[test]
    fn output_check_cannot_reenable_terminated_turn() {
        let mgr = manager(GuardrailTier::Simple);
        let mut state = TurnState::new("s1", "I think I'm having a heart attack", None, vec![]);
        mgr.apply_input(&mut state);
        let redirect = state.final_response.clone();

        mgr.apply_output(&mut state);
        assert_eq!(state.final_response, redirect);
        assert_eq!(state.guardrail_action, Some(GuardrailAction::Redirect));
    }

    #[test]
    fn clean_turn_passes_both_checks() {
        let mgr = manager(GuardrailTier::Simple);
        let mut state = TurnState::new("s1", "What are your opening hours?", None, vec![]);
        assert!(!mgr.apply_input(&mut state));

        state.final_response =
            "We're open Mon-Fri 9:00-17:00 and Sat 9:00-12:00. See you soon!".into();
        mgr.apply_output(&mut state);
        assert_eq!(state.guardrail_action, Some(GuardrailAction::Allow));
        assert!(state.final_response.contains("Mon-Fri"));
    }
}
