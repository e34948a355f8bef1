//! Lightweight language detection for patient messages.
//!
//! Detects Vietnamese vs English using character-level signals only:
//! Vietnamese diacritics (ạ, ế, ơ, ư, đ, ...) are structural to the
//! orthography and almost never appear in English text. No keyword lists.

use serde::{Deserialize, Serialize};

/// The two languages the engine answers in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    En,
    Vi,
}

impl Default for Lang {
    fn default() -> Self {
        Self::En
    }
}

/// Detect the primary language of a patient message.
///
/// Any Vietnamese character signal wins: tone-marked vowels and đ do not
/// occur in English. Untagged ASCII text defaults to English.
pub fn detect(text: &str) -> Lang {
    let lower = text.to_lowercase();
    if count_vietnamese_signals(&lower) >= 1 {
        Lang::Vi
    } else {
        Lang::En
    }
}

/// Count Vietnamese-specific characters: đ plus tone-marked or
/// horn/breve-marked vowels.
fn count_vietnamese_signals(lower_text: &str) -> u32 {
    let mut count = 0u32;
    for ch in lower_text.chars() {
        if matches!(
            ch,
            'đ' | 'ă' | 'â' | 'ê' | 'ô' | 'ơ' | 'ư'
                | 'á' | 'à' | 'ả' | 'ã' | 'ạ'
                | 'ắ' | 'ằ' | 'ẳ' | 'ẵ' | 'ặ'
                | 'ấ' | 'ầ' | 'ẩ' | 'ẫ' | 'ậ'
                | 'é' | 'è' | 'ẻ' | 'ẽ' | 'ẹ'
                | 'ế' | 'ề' | 'ể' | 'ễ' | 'ệ'
                | 'í' | 'ì' | 'ỉ' | 'ĩ' | 'ị'
                | 'ó' | 'ò' | 'ỏ' | 'õ' | 'ọ'
                | 'ố' | 'ồ' | 'ổ' | 'ỗ' | 'ộ'
                | 'ớ' | 'ờ' | 'ở' | 'ỡ' | 'ợ'
                | 'ú' | 'ù' | 'ủ' | 'ũ' | 'ụ'
                | 'ứ' | 'ừ' | 'ử' | 'ữ' | 'ự'
                | 'ý' | 'ỳ' | 'ỷ' | 'ỹ' | 'ỵ'
        ) {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_vietnamese_symptom_text() {
        assert_eq!(detect("Tôi bị sốt và đau đầu ba ngày nay"), Lang::Vi);
        assert_eq!(detect("Đau ngực dữ dội lan ra cánh tay trái"), Lang::Vi);
    }

    #[test]
    fn detects_english_symptom_text() {
        assert_eq!(detect("I have a fever and a headache for 3 days"), Lang::En);
        assert_eq!(detect("What are your opening hours?"), Lang::En);
    }

    #[test]
    fn empty_text_defaults_to_english() {
        assert_eq!(detect(""), Lang::En);
    }
}
