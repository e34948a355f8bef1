use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

/// Classified intent of the current turn, set by the supervisor on first
/// inspection and refined by agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Faq,
    Appointment,
    Symptoms,
    ImageAnalysis,
    Emergency,
    OutOfScope,
    Unknown,
}

/// Patient-reported symptom severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
}

/// Whether an investigation item is a question for the patient or a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestigationKind {
    Question,
    Test,
}

/// Status of a step in the supervisor's plan.
/// Transitions are monotone: pending → current → done | skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Current,
    Done,
    Skipped,
}

/// Outcome chosen by a guardrail pass for the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailAction {
    Allow,
    Warn,
    Redirect,
    Block,
}

/// The closed set of agents the supervisor can dispatch to.
/// `TurnState` refers to agents only by name; agents hold no back-references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    Conversation,
    Appointment,
    ImageAnalyzer,
    SymptomExtractor,
    DiagnosisEngine,
    InvestigationGenerator,
    DocumentRetriever,
    Recommender,
}

impl AgentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Appointment => "appointment",
            Self::ImageAnalyzer => "image_analyzer",
            Self::SymptomExtractor => "symptom_extractor",
            Self::DiagnosisEngine => "diagnosis_engine",
            Self::InvestigationGenerator => "investigation_generator",
            Self::DocumentRetriever => "document_retriever",
            Self::Recommender => "recommender",
        }
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(DatabaseError::InvalidEnum {
                field: "role".into(),
                value: other.into(),
            }),
        }
    }
}

/// Lifecycle of a persisted appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Scheduled,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            other => Err(DatabaseError::InvalidEnum {
                field: "status".into(),
                value: other.into(),
            }),
        }
    }
}
