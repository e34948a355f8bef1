use std::sync::Mutex;

use super::LlmError;

/// The capability the engine requires from an LLM provider.
///
/// Structured output is not assumed: callers run raw text through
/// [`super::extract`] which tolerates code fences and retries once with a
/// stricter prompt before falling back to heuristics.
pub trait LlmClient: Send + Sync {
    /// Generate a completion for a system + user prompt pair.
    fn generate(&self, system: &str, prompt: &str) -> Result<String, LlmError>;

    /// Generate a completion that also sees one base64-encoded image.
    fn generate_multimodal(
        &self,
        system: &str,
        prompt: &str,
        image_b64: &str,
        mime: &str,
    ) -> Result<String, LlmError>;
}

/// Scripted LLM for tests: pops canned responses in order, then errors.
///
/// An empty script behaves like an unreachable provider, which is exactly
/// the degraded mode every agent must tolerate.
pub struct MockLlm {
    responses: Mutex<Vec<String>>,
}

impl MockLlm {
    /// A mock that fails every call.
    pub fn unreachable() -> Self {
        Self { responses: Mutex::new(Vec::new()) }
    }

    /// A mock that replies with the given responses in order.
    pub fn scripted(responses: &[&str]) -> Self {
        let mut list: Vec<String> = responses.iter().map(|s| s.to_string()).collect();
        list.reverse();
        Self { responses: Mutex::new(list) }
    }

    fn next(&self) -> Result<String, LlmError> {
        self.responses
            .lock()
            .expect("mock llm poisoned")
            .pop()
            .ok_or(LlmError::NotReachable)
    }
}

impl LlmClient for MockLlm {
    fn generate(&self, _system: &str, _prompt: &str) -> Result<String, LlmError> {
        self.next()
    }

    fn generate_multimodal(
        &self,
        _system: &str,
        _prompt: &str,
        _image_b64: &str,
        _mime: &str,
    ) -> Result<String, LlmError> {
        self.next()
    }
}
