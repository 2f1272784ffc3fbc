use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::plan::RiskLevel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    pub fn as_key(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Declarative validation rule attached to a parameter. Evaluated by the
/// registry before any tool body runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamRule {
    OneOf { allowed: Vec<String> },
    MinNumber { min: f64 },
    MaxNumber { max: f64 },
    MaxLength { max: usize },
    NonEmpty,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamType,
    pub required: bool,
    #[serde(default)]
    pub rules: Vec<ParamRule>,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamType) -> Self {
        Self { name: name.to_string(), kind, required: true, rules: Vec::new() }
    }

    pub fn optional(name: &str, kind: ParamType) -> Self {
        Self { name: name.to_string(), kind, required: false, rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: ParamRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Declared shape of a tool's successful result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnShape {
    Record,
    RecordList,
    Acknowledgement,
    Report,
}

/// Registry entry for one allowlisted operation. Registered once at process
/// start; the schema version recorded on a plan step must match the
/// registered version at execution time or the step is aborted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    /// Capability group for kill-switch scoping, e.g. `records.write`.
    pub capability: String,
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub schema_version: u32,
    pub risk: RiskLevel,
    pub required_permissions: Vec<String>,
    /// Data categories this tool touches, matched against the compliance
    /// rule's forbidden set.
    #[serde(default)]
    pub data_categories: Vec<String>,
    pub allowlisted: bool,
    pub mutating: bool,
    pub parameters: Vec<ParamSpec>,
    pub returns: ReturnShape,
}
