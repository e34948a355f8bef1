//! Curated keyword sets and compiled patterns shared by all guardrail tiers.
//!
//! Keyword tables cover both supported languages (English + Vietnamese);
//! regex tables are compiled once via `LazyLock`.

use std::sync::LazyLock;

use regex::Regex;

/// Emergency phrases that preempt the turn with a redirect.
pub const EMERGENCY_KEYWORDS: &[&str] = &[
    // Vietnamese
    "cấp cứu",
    "khẩn cấp",
    "nguy kịch",
    "hôn mê",
    "đau tim",
    "đột quỵ",
    "không thở được",
    "chảy máu nhiều",
    "ngộ độc",
    "tự tử",
    "tự sát",
    "muốn chết",
    "sốc phản vệ",
    // English
    "emergency",
    "911",
    "dying",
    "heart attack",
    "stroke",
    "suicide",
    "can't breathe",
    "cannot breathe",
    "severe bleeding",
    "unconscious",
    "anaphylaxis",
    "overdose",
];

/// Inappropriate language that blocks the turn.
pub const PROFANITY_KEYWORDS: &[&str] = &[
    "đồ chó", "địt", "lồn", "khốn nạn", "chết tiệt", "fuck", "shit", "asshole",
];

/// Hints that the user is sharing personal/sensitive data (warn, not block).
pub const SENSITIVE_DATA_KEYWORDS: &[&str] = &[
    "số cmnd",
    "cccd",
    "thẻ tín dụng",
    "mật khẩu",
    "tài khoản ngân hàng",
    "password",
    "credit card",
    "social security",
    "bank account",
];

/// Topics outside the clinic's domain.
pub const OUT_OF_SCOPE_KEYWORDS: &[&str] = &[
    "thời tiết",
    "bóng đá",
    "chính trị",
    "tôn giáo",
    "nấu ăn",
    "du lịch",
    "weather",
    "football",
    "politics",
    "religion",
    "cooking",
    "travel",
];

/// Case-insensitive containment check against a keyword table.
pub fn contains_keyword(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|kw| lower.contains(kw))
}

/// A compiled pattern with a description for the audit log.
pub struct NamedPattern {
    pub regex: Regex,
    pub name: &'static str,
}

fn pattern(name: &'static str, regex_str: &str) -> NamedPattern {
    NamedPattern {
        regex: Regex::new(regex_str).expect("Invalid guardrail regex"),
        name,
    }
}

/// Output patterns asserting a diagnosis without attribution.
pub static DIAGNOSIS_ASSERTIONS: LazyLock<Vec<NamedPattern>> = LazyLock::new(|| {
    vec![
        pattern("en_you_have", r"(?i)\byou\s+(?:definitely\s+)?have\s+(?:a\s+|an\s+)?[a-z]"),
        pattern("en_diagnosis_is", r"(?i)\b(?:the\s+|your\s+|my\s+)?diagnosis\s+is\b"),
        pattern("en_this_is_disease", r"(?i)\bthis\s+is\s+(?:a\s+)?(?:disease|cancer|infection)\b"),
        pattern("vi_ban_bi_benh", r"(?i)bạn\s+(?:bị|có)\s+bệnh"),
        pattern("vi_day_la_benh", r"(?i)đây\s+là\s+bệnh"),
        pattern("vi_chan_doan", r"(?i)chẩn\s+đoán\s+(?:của\s+bạn\s+)?là"),
    ]
});

/// Output patterns prescribing medication.
pub static PRESCRIPTION_PATTERNS: LazyLock<Vec<NamedPattern>> = LazyLock::new(|| {
    vec![
        pattern("en_take_drug", r"(?i)\b(?:take|use)\s+this\s+(?:medicine|medication|drug)\b"),
        pattern("en_you_should_take", r"(?i)\byou\s+should\s+take\s+\w+"),
        pattern("vi_uong_thuoc", r"(?i)(?:uống|dùng)\s+thuốc\s+\w+"),
        pattern("vi_ke_don", r"(?i)kê\s+đơn"),
    ]
});

/// A specific dose of a named preparation; never allowed in output.
pub static DOSAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d+(?:\.\d+)?\s?(?:mg|mcg|µg|ml|g)\b").expect("Invalid dosage regex")
});

/// Fragments that indicate leaked system text or internals.
pub const SYSTEM_LEAK_KEYWORDS: &[&str] = &[
    "system:",
    "assistant:",
    "you are a",
    "bạn là một ai",
    "prompt:",
    "instruction:",
    "traceback",
    "api_key",
    "api key",
];

/// Adversarial / jailbreak patterns over user input.
pub static ADVERSARIAL_PATTERNS: LazyLock<Vec<NamedPattern>> = LazyLock::new(|| {
    vec![
        pattern(
            "role_play_attack",
            r"(?i)(pretend|act as|you are now|bạn giờ là|giả vờ)",
        ),
        pattern(
            "instruction_override",
            r"(?i)(ignore|forget|disregard|bỏ qua|quên).{0,30}(instruction|rule|guideline|previous|prior|hướng dẫn)",
        ),
        pattern("jailbreak", r"(?i)(jailbreak|dan mode|developer mode|sudo|root access)"),
        pattern(
            "system_prompt_leak",
            r"(?i)(show|reveal|tell me|print|in ra).{0,30}(system prompt|your prompt|your instructions|your rules)",
        ),
    ]
});

/// First adversarial pattern matching the text, if any.
pub fn adversarial_match(text: &str) -> Option<&'static str> {
    ADVERSARIAL_PATTERNS
        .iter()
        .find(|p| p.regex.is_match(text))
        .map(|p| p.name)
}

/// PII panel for the advanced tier.
pub static PII_PATTERNS: LazyLock<Vec<NamedPattern>> = LazyLock::new(|| {
    vec![
        pattern("phone_number", r"\b0\d{9,10}\b|\b\d{3}[-.\s]\d{3}[-.\s]\d{4}\b"),
        pattern("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
        pattern("credit_card", r"\b\d{4}[\s-]\d{4}[\s-]\d{4}[\s-]\d{4}\b"),
        pattern("national_id", r"\b\d{12}\b|\bcmnd\s*:?\s*\d{9}\b"),
        pattern(
            "address",
            r"(?i)\b\d+\s+[\p{L}\s]+(?:street|st|avenue|ave|road|rd|đường|phố)\b",
        ),
    ]
});

/// Names of PII kinds found in the text.
pub fn detect_pii(text: &str) -> Vec<&'static str> {
    PII_PATTERNS
        .iter()
        .filter(|p| p.regex.is_match(text))
        .map(|p| p.name)
        .collect()
}

/// Hedging/attribution markers that exempt a window of text from the
/// diagnosis-assertion check. Grounded statements ("the doctor noted you
/// have…") and hedged summaries ("possible causes may include…") pass.
static HEDGING_EXCEPTIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\b(?:may|might|could|possible|possibly|potential)\b").unwrap(),
        Regex::new(r"(?i)\b(?:doctor|bác sĩ)\s+(?:will|noted|recorded|sẽ|đã ghi)\b").unwrap(),
        Regex::new(r"(?i)\b(?:consult|tham khảo)\b").unwrap(),
        Regex::new(r"(?i)\bcó thể\b").unwrap(),
    ]
});

/// Whether the text around `offset` carries a hedging/attribution marker.
pub fn is_hedged(text: &str, offset: usize) -> bool {
    let start = floor_char_boundary(text, offset.saturating_sub(96));
    let end = floor_char_boundary(text, (offset + 96).min(text.len()));
    let window = &text[start..end];
    HEDGING_EXCEPTIONS.iter().any(|p| p.is_match(window))
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// An unhedged diagnosis assertion or prescription found in output text.
pub fn medical_compliance_violation(text: &str) -> Option<&'static str> {
    for set in [&*DIAGNOSIS_ASSERTIONS, &*PRESCRIPTION_PATTERNS] {
        for p in set {
            if let Some(mat) = p.regex.find(text) {
                if !is_hedged(text, mat.start()) {
                    return Some(p.name);
                }
            }
        }
    }
    if DOSAGE_PATTERN.is_match(text) {
        return Some("specific_dosage");
    }
    None
}
