use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::domain::intent::IntentId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(pub String);

/// Risk ordering is total: `Low < Medium < High < Critical`. A plan's
/// overall risk is the maximum across its steps and is never lower than
/// any constituent step.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_key(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown risk level `{other}`")),
        }
    }
}

/// One proposed tool call. The schema version is recorded at plan time so
/// the registry can detect drift at execution time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub tool_id: String,
    pub schema_version: u32,
    pub ordinal: u32,
    pub arguments: Map<String, Value>,
    pub risk: RiskLevel,
    pub description: String,
}

/// Ordered sequence of steps produced by the planner. Immutable after
/// creation: any change requires a new plan and therefore a new content
/// hash, which is what the approval token binds to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub id: PlanId,
    pub intent_id: IntentId,
    pub tenant_id: String,
    pub user_id: String,
    pub steps: Vec<ActionStep>,
    pub overall_risk: RiskLevel,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl ActionPlan {
    pub fn new(
        id: PlanId,
        intent_id: impl Into<String>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        steps: Vec<ActionStep>,
    ) -> Self {
        let overall_risk =
            steps.iter().map(|step| step.risk).max().unwrap_or(RiskLevel::Low);
        let content_hash = content_hash(&steps);
        Self {
            id,
            intent_id: IntentId(intent_id.into()),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            steps,
            overall_risk,
            content_hash,
            created_at: Utc::now(),
        }
    }

    /// Recompute the content hash from the live step list. Token validation
    /// must use this, never the cached `content_hash` field.
    pub fn compute_content_hash(&self) -> String {
        content_hash(&self.steps)
    }
}

/// Stable digest over the ordered (tool id, schema version, canonical
/// arguments) tuples. Object keys are sorted so semantically identical
/// argument maps hash identically regardless of insertion order.
pub fn content_hash(steps: &[ActionStep]) -> String {
    let mut hasher = Sha256::new();
    for step in steps {
        let material = format!(
            "{}|{}|{}|{}",
            step.ordinal,
            step.tool_id,
            step.schema_version,
            canonical_json(&Value::Object(step.arguments.clone())),
        );
        hasher.update(material.as_bytes());
        hasher.update(b"\n");
    }
    encode_hex(hasher.finalize().as_slice())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .iter()
                .map(|key| format!("{}:{}", key, canonical_json(&map[key.as_str()])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body =
                items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
