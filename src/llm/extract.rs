//! Structured-output extraction for LLM responses.
//!
//! Providers vary in structured-output fidelity, so every LLM boundary in
//! the crate goes through the same path: raw text → fence-tolerant JSON
//! extraction → typed deserialization → one retry with a stricter prompt.
//! Heuristic fallbacks live with each agent, not here.

use serde::de::DeserializeOwned;

use super::client::LlmClient;
use super::LlmError;

/// Appended to the prompt on the retry pass.
const STRICT_SUFFIX: &str = "\n\nReturn ONLY the JSON object. No prose, no markdown, no code fences.";

/// Pull the first JSON object or array out of a response, tolerating
/// ```json fences and surrounding prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    // Fenced block first
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }

    // Otherwise the outermost { } or [ ] span
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if end > start {
                return Some(trimmed[start..=end].trim());
            }
        }
    }

    None
}

/// Parse a typed value out of raw LLM text.
pub fn parse_response<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let json = extract_json(text).ok_or_else(|| {
        LlmError::Malformed(format!(
            "no JSON found in response ({} chars)",
            text.chars().count()
        ))
    })?;
    serde_json::from_str(json).map_err(|e| LlmError::Malformed(e.to_string()))
}

/// Generate and parse a structured response, retrying once with a stricter
/// prompt when the first reply does not deserialize.
pub fn generate_structured<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    system: &str,
    prompt: &str,
) -> Result<T, LlmError> {
    let first = llm.generate(system, prompt)?;
    match parse_response::<T>(&first) {
        Ok(value) => Ok(value),
        Err(parse_err) => {
            tracing::debug!(error = %parse_err, "Structured parse failed, retrying with strict prompt");
            let strict_prompt = format!("{prompt}{STRICT_SUFFIX}");
            let second = llm.generate(system, &strict_prompt)?;
            parse_response::<T>(&second)
        }
    }
}

/// Multimodal variant of [`generate_structured`].
pub fn generate_structured_multimodal<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    system: &str,
    prompt: &str,
    image_b64: &str,
    mime: &str,
) -> Result<T, LlmError> {
    let first = llm.generate_multimodal(system, prompt, image_b64, mime)?;
    match parse_response::<T>(&first) {
        Ok(value) => Ok(value),
        Err(parse_err) => {
            tracing::debug!(error = %parse_err, "Multimodal structured parse failed, retrying");
            let strict_prompt = format!("{prompt}{STRICT_SUFFIX}");
            let second = llm.generate_multimodal(system, &strict_prompt, image_b64, mime)?;
            parse_response::<T>(&second)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::llm::MockLlm;

    #[derive(Deserialize, PartialEq, Debug)]
    struct Probe {
        name: String,
        score: f32,
    }

    #[test]
    fn extracts_bare_json() {
        let text = r#"{"name": "fever", "score": 0.8}"#;
        assert_eq!(extract_json(text), Some(text));
    }

    #[test]
    fn extracts_fenced_json() {
        let text = "Here you go:\n```json\n{\"name\": \"fever\", \"score\": 0.8}\n```\nHope that helps!";
        let probe: Probe = parse_response(text).unwrap();
        assert_eq!(probe.name, "fever");
    }

    #[test]
    fn extracts_json_embedded_in_prose() {
        let text = "Sure! The result is {\"name\": \"cough\", \"score\": 0.5} as requested.";
        let probe: Probe = parse_response(text).unwrap();
        assert_eq!(probe.name, "cough");
    }

    #[test]
    fn extracts_json_array() {
        let text = "```\n[1, 2, 3]\n```";
        let values: Vec<i32> = parse_response(text).unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn no_json_is_malformed() {
        let err = parse_response::<Probe>("I cannot answer that.").unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
    }

    #[test]
    fn retry_recovers_from_prose_first_answer() {
        let llm = MockLlm::scripted(&[
            "Sorry, here is some prose without structure.",
            r#"{"name": "fever", "score": 0.9}"#,
        ]);
        let probe: Probe = generate_structured(&llm, "sys", "prompt").unwrap();
        assert_eq!(probe, Probe { name: "fever".into(), score: 0.9 });
    }

    #[test]
    fn two_malformed_answers_error_out() {
        let llm = MockLlm::scripted(&["prose", "more prose"]);
        let err = generate_structured::<Probe>(&llm, "sys", "prompt").unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
    }
}
