//! Tier 2: intent-classified, context-aware guardrail.
//!
//! Uses the LLM for intent classification over recent history + input and
//! for a strict yes/no output verification pass; adds a per-session
//! sliding-window rate limit and repeated-message spam detection. Any LLM
//! failure degrades to the tier-1 check for that message.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;

use super::simple::SimpleGuardrail;
use super::{messages, Guardrail, GuardrailTier, RiskLevel, Verdict};
use crate::llm::LlmClient;
use crate::models::{GuardrailAction, Role, TurnState};

/// Rate limit: at most R messages per window per session.
const RATE_LIMIT_MAX: usize = 10;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// History entries fed to the intent classifier.
const CLASSIFIER_HISTORY: usize = 3;

/// Confidence above which a medical-advice classification draws a warning.
const MEDICAL_ADVICE_THRESHOLD: f32 = 0.7;

static INTENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)intent:\s*([a-z_]+)").unwrap());
static CONFIDENCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)confidence:\s*(0?\.\d+|1\.0|1|0)").unwrap());
static SAFE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)safe:\s*(yes|no)").unwrap());

const INTENT_CATEGORIES: &str = "\
- emergency: medical emergency requiring immediate attention
- appointment: scheduling or managing appointments
- medical_advice: seeking diagnosis or treatment recommendations
- general_info: general clinic information
- symptoms: describing symptoms for assessment
- faq: common questions about clinic services
- small_talk: casual conversation
- inappropriate: offensive or out-of-scope content
- sensitive: contains personal or sensitive information";

pub struct IntermediateGuardrail {
    llm: Arc<dyn LlmClient>,
    fallback: SimpleGuardrail,
    rate_windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl IntermediateGuardrail {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            fallback: SimpleGuardrail::new(),
            rate_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record one message for the session and report whether the rate
    /// limit is breached.
    fn rate_limited(&self, session_id: &str) -> bool {
        let mut windows = self.rate_windows.lock().expect("rate limiter poisoned");
        let window = windows.entry(session_id.to_string()).or_default();

        let now = Instant::now();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > RATE_LIMIT_WINDOW)
        {
            window.pop_front();
        }

        window.push_back(now);
        window.len() > RATE_LIMIT_MAX
    }

    /// The last three user messages are identical, i.e. spam.
    fn is_repeated_message(&self, state: &TurnState) -> bool {
        let mut recent: Vec<&str> = state
            .history
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.text.trim())
            .collect();
        recent.push(state.user_input.trim());

        if recent.len() < 3 {
            return false;
        }
        let last_three = &recent[recent.len() - 3..];
        !last_three[0].is_empty() && last_three.windows(2).all(|w| w[0] == w[1])
    }

    /// Classify intent with the LLM; None means the call failed and the
    /// caller should degrade to the keyword tier.
    fn classify_intent(&self, state: &TurnState) -> Option<(String, f32)> {
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
            "Classify the intent of this user message in a medical clinic chatbot context.\n\n\
             Available intents:\n{INTENT_CATEGORIES}\n\n\
             Conversation context (if any):\n{context}\n\n\
             User message: \"{}\"\n\n\
             Respond with ONLY the intent name and confidence (0-1) in this format:\n\
             intent: <intent_name>\nconfidence: <0.XX>",
            state.user_input
        );

        let response = self
            .llm
            .generate("You classify patient messages for a clinic assistant.", &prompt)
            .ok()?;

        let intent = INTENT_LINE.captures(&response)?.get(1)?.as_str().to_lowercase();
        let confidence = CONFIDENCE_LINE
            .captures(&response)
            .and_then(|c| c.get(1)?.as_str().parse::<f32>().ok())
            .unwrap_or(0.5);
        Some((intent, confidence))
    }

    /// Strict yes/no verification of the output; None on LLM failure.
    fn verify_output(&self, state: &TurnState) -> Option<bool> {
        let prompt = format!(
            "Analyze this chatbot response to a medical clinic patient.\n\n\
             User question: \"{}\"\n\
             Bot response: \"{}\"\n\n\
             Check if the bot is:\n\
             1. Giving a specific medical diagnosis\n\
             2. Prescribing medication\n\
             3. Making definitive medical claims without a disclaimer\n\n\
             Respond with ONLY:\nsafe: yes/no",
            state.user_input, state.final_response
        );

        let response = self
            .llm
            .generate("You verify clinic chatbot responses for safety.", &prompt)
            .ok()?;
        let safe = SAFE_LINE.captures(&response)?.get(1)?.as_str().eq_ignore_ascii_case("yes");
        Some(safe)
    }
}

impl Guardrail for IntermediateGuardrail {
    fn check_input(&self, state: &TurnState) -> Verdict {
        if self.rate_limited(&state.session_id) {
            return Verdict::block(
                "rate limit exceeded",
                messages::blocked_rate_limit(state.lang),
                RiskLevel::Medium,
            );
        }

        if self.is_repeated_message(state) {
            return Verdict::block(
                "repeated identical messages",
                messages::blocked_spam(state.lang),
                RiskLevel::Low,
            );
        }

        match self.classify_intent(state) {
            Some((intent, confidence)) => {
                tracing::debug!(intent = %intent, confidence, "Tier-2 intent classified");
                match intent.as_str() {
                    "emergency" => Verdict::redirect(
                        format!("emergency intent (confidence {confidence:.2})"),
                        messages::emergency_redirect(state.lang),
                    ),
                    "inappropriate" => Verdict::block(
                        format!("inappropriate intent (confidence {confidence:.2})"),
                        messages::blocked_inappropriate(state.lang),
                        RiskLevel::Medium,
                    ),
                    "medical_advice" if confidence > MEDICAL_ADVICE_THRESHOLD => {
                        Verdict::warn("direct medical-advice request", RiskLevel::Medium)
                    }
                    "sensitive" => Verdict::warn("sensitive data shared", RiskLevel::Medium),
                    _ => {
                        // Keyword floor still applies (length, profanity, ...)
                        self.fallback.check_input(state)
                    }
                }
            }
            // Classifier unavailable: degrade to the tier-1 check.
            None => self.fallback.check_input(state),
        }
    }

    fn check_output(&self, state: &TurnState) -> Verdict {
        // Keyword floor first; it is cheap and deterministic.
        let baseline = self.fallback.check_output(state);
        if baseline.action != GuardrailAction::Allow {
            return baseline;
        }

        match self.verify_output(state) {
            Some(true) | None => baseline,
            Some(false) => Verdict::block(
                "llm output verification: unsafe medical claim",
                messages::blocked_medical_advice(state.lang),
                RiskLevel::Critical,
            ),
        }
    }

    fn tier(&self) -> GuardrailTier {
        GuardrailTier::Intermediate
    }
}
