use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntentId(pub String);

/// Closed classification set for a user utterance. Anything the refiner
/// cannot place with confidence lands in `Unknown`, which is never
/// actionable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Informational,
    Action,
    Cancellation,
    CapabilityInquiry,
    Unknown,
}

impl IntentType {
    pub fn as_key(&self) -> &'static str {
        match self {
            Self::Informational => "informational",
            Self::Action => "action",
            Self::Cancellation => "cancellation",
            Self::CapabilityInquiry => "capability_inquiry",
            Self::Unknown => "unknown",
        }
    }
}

/// Immutable result of intent refinement. `source_text_redacted` is the only
/// copy of the user text that may be persisted or audited; when injection is
/// detected the raw text is discarded entirely and this field stays empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub intent_type: IntentType,
    pub entities: BTreeMap<String, String>,
    pub requested_operations: Vec<String>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub clarification_needed: bool,
    pub clarification_question: Option<String>,
    pub response: Option<String>,
    pub source_text_redacted: String,
    pub created_at: DateTime<Utc>,
}

impl Intent {
    pub fn is_actionable(&self) -> bool {
        self.intent_type == IntentType::Action && !self.clarification_needed
    }
}
