//! Read-only clinic FAQ and profile store.
//!
//! Lookup is keyword-scored over a curated FAQ table; repeated queries hit
//! an in-memory LRU keyed case-insensitively.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::ClinicProfile;

/// Capacity of the query → results cache.
const CACHE_CAPACITY: usize = 100;

/// Score a keyword hit / question-word hit / answer-word hit contributes.
const KEYWORD_WEIGHT: u32 = 10;
const QUESTION_WEIGHT: u32 = 5;
const ANSWER_WEIGHT: u32 = 2;

/// Matches below this score do not count as an FAQ answer.
pub const MATCH_THRESHOLD: u32 = 10;

/// One FAQ entry.
#[derive(Debug, Clone)]
pub struct FaqEntry {
    pub question: &'static str,
    pub answer: String,
    pub keywords: &'static [&'static str],
    pub category: &'static str,
}

/// A scored search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaqHit {
    pub question: String,
    pub answer: String,
    pub score: u32,
}

/// Read-only FAQ + clinic profile store with an LRU query cache.
pub struct KnowledgeStore {
    profile: ClinicProfile,
    faqs: Vec<FaqEntry>,
    cache: Mutex<LruCache>,
}

impl KnowledgeStore {
    pub fn new(profile: ClinicProfile) -> Self {
        let faqs = build_faqs(&profile);
        Self {
            profile,
            faqs,
            cache: Mutex::new(LruCache::new(CACHE_CAPACITY)),
        }
    }

    pub fn profile(&self) -> &ClinicProfile {
        &self.profile
    }

    /// Keyword-scored FAQ search, best matches first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<FaqHit> {
        let key = query.trim().to_lowercase();

        if let Some(cached) = self.cache.lock().expect("faq cache poisoned").get(&key) {
            return cached.into_iter().take(limit).collect();
        }

        let mut hits: Vec<FaqHit> = self
            .faqs
            .iter()
            .filter_map(|faq| {
                let score = score_entry(faq, &key);
                (score > 0).then(|| FaqHit {
                    question: faq.question.to_string(),
                    answer: faq.answer.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.cmp(&a.score).then(a.question.cmp(&b.question)));
        hits.truncate(limit.max(5));

        self.cache
            .lock()
            .expect("faq cache poisoned")
            .put(key, hits.clone());

        hits.truncate(limit);
        hits
    }

    /// The best match, when it clears the confidence threshold.
    pub fn best_match(&self, query: &str) -> Option<FaqHit> {
        self.search(query, 1)
            .into_iter()
            .next()
            .filter(|hit| hit.score >= MATCH_THRESHOLD)
    }
}

fn score_entry(faq: &FaqEntry, query_lower: &str) -> u32 {
    let mut score = 0;

    for keyword in faq.keywords {
        if query_lower.contains(keyword) {
            score += KEYWORD_WEIGHT;
        }
    }

    let question_lower = faq.question.to_lowercase();
    let answer_lower = faq.answer.to_lowercase();
    for word in query_lower.split_whitespace() {
        if word.chars().count() <= 3 {
            continue;
        }
        if question_lower.contains(word) {
            score += QUESTION_WEIGHT;
        }
        if answer_lower.contains(word) {
            score += ANSWER_WEIGHT;
        }
    }

    score
}

fn build_faqs(profile: &ClinicProfile) -> Vec<FaqEntry> {
    vec![
        FaqEntry {
            question: "What are your hours?",
            answer: format!(
                "We're open {}. We're closed on Sundays and major holidays.",
                profile.hours_text
            ),
            keywords: &["hours", "open", "close", "schedule", "when", "giờ làm việc", "mấy giờ"],
            category: "hours_and_location",
        },
        FaqEntry {
            question: "Where are you located?",
            answer: format!(
                "We're located at {}. Free parking is available for patients.",
                profile.address
            ),
            keywords: &["location", "address", "where", "directions", "parking", "địa chỉ", "ở đâu"],
            category: "hours_and_location",
        },
        FaqEntry {
            question: "How do I schedule an appointment?",
            answer: format!(
                "You can book by calling us at {}, or right here in this chat — just tell me \
                 your preferred date and time, your name, phone number, and the reason for the visit.",
                profile.phone
            ),
            keywords: &["schedule", "appointment", "book", "booking", "đặt lịch", "hẹn khám"],
            category: "appointments",
        },
        FaqEntry {
            question: "Can I cancel or reschedule my appointment?",
            answer: format!(
                "Yes — tell me the appointment id from your confirmation, or call {}. \
                 We ask for at least 24 hours notice so the slot can go to another patient.",
                profile.phone
            ),
            keywords: &["cancel", "reschedule", "change appointment", "hủy lịch", "đổi lịch"],
            category: "appointments",
        },
        FaqEntry {
            question: "What should I bring to my appointment?",
            answer: "Please bring a photo ID, your insurance card, a list of current medications, \
                     any relevant medical records, and a payment method. Arriving 10-15 minutes \
                     early helps with paperwork."
                .to_string(),
            keywords: &["bring", "paperwork", "documents", "mang theo", "giấy tờ"],
            category: "appointments",
        },
        FaqEntry {
            question: "Do you accept insurance?",
            answer: format!(
                "Yes, we accept most major insurance plans. Please call us at {} to verify \
                 your specific plan.",
                profile.phone
            ),
            keywords: &["insurance", "coverage", "plan", "bảo hiểm"],
            category: "insurance_and_payment",
        },
        FaqEntry {
            question: "How much does a visit cost?",
            answer: "Costs vary by service and coverage. With insurance you typically pay your \
                     copay; without insurance a standard visit is billed at the clinic rate. \
                     We discuss costs before any major procedure."
                .to_string(),
            keywords: &["cost", "price", "how much", "fee", "chi phí", "giá"],
            category: "insurance_and_payment",
        },
        FaqEntry {
            question: "What services do you offer?",
            answer: "We offer comprehensive primary care: annual checkups, sick visits, chronic \
                     disease management, immunizations, on-site lab tests, minor procedures, \
                     and preventive care."
                .to_string(),
            keywords: &["services", "offer", "treatment", "dịch vụ", "khám gì"],
            category: "services",
        },
        FaqEntry {
            question: "Do you do lab tests?",
            answer: "Yes, we have an on-site lab for common tests (blood work, urinalysis). \
                     Results are typically available within 24-48 hours."
                .to_string(),
            keywords: &["lab", "blood work", "test", "results", "xét nghiệm"],
            category: "services",
        },
        FaqEntry {
            question: "What should I do in an emergency?",
            answer: format!(
                "For life-threatening emergencies (chest pain, difficulty breathing, severe \
                 bleeding), call {} or go to the nearest emergency room immediately. For urgent \
                 but non-emergency care we offer same-day appointments.",
                profile.emergency_number
            ),
            keywords: &["emergency", "urgent", "after hours", "cấp cứu", "khẩn cấp"],
            category: "emergency",
        },
    ]
}

/// Small LRU over a HashMap + recency queue. Keys are lowercased queries.
struct LruCache {
    capacity: usize,
    map: HashMap<String, Vec<FaqHit>>,
    order: VecDeque<String>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<FaqHit>> {
        if let Some(hits) = self.map.get(key) {
            let hits = hits.clone();
            self.touch(key);
            Some(hits)
        } else {
            None
        }
    }

    fn put(&mut self, key: String, value: Vec<FaqHit>) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        } else {
            self.touch(&key);
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
            self.order.push_back(key.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KnowledgeStore {
        KnowledgeStore::new(ClinicProfile::default())
    }

    #[test]
    fn hours_query_finds_hours_answer() {
        let store = store();
        let best = store.best_match("What are your hours?").unwrap();
        assert!(best.answer.contains("Mon-Fri"));
        assert!(best.answer.contains("Sat"));
    }

    #[test]
    fn booking_query_finds_appointment_answer() {
        let store = store();
        let best = store.best_match("how do I book an appointment").unwrap();
        assert!(best.question.contains("schedule"));
    }

    #[test]
    fn vietnamese_keywords_match() {
        let store = store();
        let best = store.best_match("giờ làm việc của phòng khám").unwrap();
        assert!(best.question.contains("hours"));
    }

    #[test]
    fn unrelated_query_has_no_confident_match() {
        let store = store();
        assert!(store.best_match("zzqk vbnw").is_none());
    }

    #[test]
    fn repeated_queries_are_cached_and_identical() {
        let store = store();
        let first = store.search("what are your hours", 3);
        let second = store.search("What Are Your HOURS", 3);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.question, b.question);
            assert_eq!(a.score, b.score);
        }
    }

    #[test]
    fn search_orders_by_score() {
        let store = store();
        let hits = store.search("appointment cost insurance", 5);
        assert!(hits.len() >= 2);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn lru_evicts_oldest_entry() {
        let mut cache = LruCache::new(2);
        cache.put("a".into(), vec![]);
        cache.put("b".into(), vec![]);
        cache.get("a");
        cache.put("c".into(), vec![]);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }
}
