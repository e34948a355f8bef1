//! Per-user risk accounting for the advanced tier.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Sliding window for recent warnings.
const WARNING_WINDOW_HOURS: i64 = 24;

/// Risk levels derived from the aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f32) -> Self {
        if score < 0.2 {
            Self::Safe
        } else if score < 0.4 {
            Self::Low
        } else if score < 0.6 {
            Self::Medium
        } else if score < 0.8 {
            Self::High
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Aggregate of a session's safety-relevant signals.
///
/// Counter updates are last-writer-wins; `recent_warnings` is append-only
/// and aged out by the 24 h sliding window on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRiskProfile {
    pub violation_count: u32,
    pub blocked_count: u32,
    pub recent_warnings: Vec<(DateTime<Utc>, String)>,
    pub suspicious_patterns: Vec<String>,
    pub risk_score: f32,
}

impl UserRiskProfile {
    pub fn record_warning(&mut self, kind: impl Into<String>) {
        self.recent_warnings.push((Utc::now(), kind.into()));
        self.prune_warnings();
    }

    pub fn record_violation(&mut self) {
        self.violation_count += 1;
    }

    pub fn record_block(&mut self) {
        self.blocked_count += 1;
    }

    pub fn record_suspicious(&mut self, pattern: impl Into<String>) {
        self.suspicious_patterns.push(pattern.into());
    }

    fn prune_warnings(&mut self) {
        let cutoff = Utc::now() - Duration::hours(WARNING_WINDOW_HOURS);
        self.recent_warnings.retain(|(at, _)| *at >= cutoff);
    }

    /// Recompute the aggregate risk score in [0, 1].
    ///
    /// Factors: violation history (≤ 0.3), input length (≤ 0.2),
    /// suspicious patterns (≤ 0.3), warnings in the last hour (≤ 0.2).
    pub fn recompute(&mut self, input_len: usize) -> f32 {
        self.prune_warnings();

        let history_risk = (self.violation_count as f32 * 0.1).min(0.3);
        let length_risk = (input_len as f32 / 5000.0).min(0.2);
        let pattern_risk = (self.suspicious_patterns.len() as f32 * 0.1).min(0.3);

        let hour_ago = Utc::now() - Duration::hours(1);
        let recent = self.recent_warnings.iter().filter(|(at, _)| *at >= hour_ago).count();
        let warning_risk = (recent as f32 * 0.1).min(0.2);

        self.risk_score = (history_risk + length_risk + pattern_risk + warning_risk).min(1.0);
        self.risk_score
    }

    pub fn level(&self) -> RiskLevel {
        RiskLevel::from_score(self.risk_score)
    }
}
