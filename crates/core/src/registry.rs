use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::plan::ActionStep;
use crate::domain::tool::{ParamRule, ToolDefinition};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Simulate,
    Execute,
}

/// One change a tool would make, reported in simulate mode instead of
/// being applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedChange {
    pub target: String,
    pub operation: String,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub result: Value,
    #[serde(default)]
    pub simulated_changes: Vec<SimulatedChange>,
}

impl ToolOutcome {
    pub fn applied(result: Value) -> Self {
        Self { result, simulated_changes: Vec::new() }
    }

    pub fn simulated(result: Value, changes: Vec<SimulatedChange>) -> Self {
        Self { result, simulated_changes: changes }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool failure: {0}")]
    Failure(String),
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
}

/// Contract every allowlisted operation implements. In `Simulate` mode the
/// body must report the changes it would make without mutating any store;
/// that is a tool-level contract, so every in-repo tool carries a test for
/// it.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    async fn execute(
        &self,
        arguments: &Map<String, Value>,
        mode: ExecutionMode,
    ) -> Result<ToolOutcome, ToolError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown tool `{tool_id}`")]
    UnknownTool { tool_id: String },
    #[error("tool `{tool_id}` is not allowlisted")]
    NotAllowlisted { tool_id: String },
    #[error(
        "schema drift for `{tool_id}`: plan recorded v{planned}, registry has v{registered}"
    )]
    SchemaDrift { tool_id: String, planned: u32, registered: u32 },
    #[error("missing required parameter `{name}` for `{tool_id}`")]
    MissingParameter { tool_id: String, name: String },
    #[error("unexpected parameter `{name}` for `{tool_id}`")]
    UnexpectedParameter { tool_id: String, name: String },
    #[error("invalid type for `{name}` on `{tool_id}`: expected {expected}")]
    InvalidType { tool_id: String, name: String, expected: &'static str },
    #[error("rule violation for `{name}` on `{tool_id}`: {message}")]
    RuleViolation { tool_id: String, name: String, message: String },
}

impl RegistryError {
    /// Schema drift is the one registry failure that must never be coerced
    /// around; callers use this to pick the fatal error class.
    pub fn is_schema_drift(&self) -> bool {
        matches!(self, Self::SchemaDrift { .. })
    }
}

/// Process-local catalog of allowlisted operations, rebuilt at startup from
/// static declarations. Dispatch is by explicit registration only.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        let id = tool.definition().id.clone();
        self.tools.insert(id, Arc::new(tool));
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool_id).cloned()
    }

    pub fn definition(&self, tool_id: &str) -> Option<ToolDefinition> {
        self.tools.get(tool_id).map(|tool| tool.definition().clone())
    }

    pub fn list(&self, allowed_only: bool) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| tool.definition().clone())
            .filter(|definition| !allowed_only || definition.allowlisted)
            .collect();
        definitions.sort_by(|left, right| left.id.cmp(&right.id));
        definitions
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate a plan step against the live registry: allowlist, schema
    /// drift, then declared parameter rules. Any failure aborts the step.
    pub fn validate(&self, step: &ActionStep) -> Result<(), RegistryError> {
        let tool = self.tools.get(&step.tool_id).ok_or_else(|| {
            RegistryError::UnknownTool { tool_id: step.tool_id.clone() }
        })?;
        let definition = tool.definition();

        if !definition.allowlisted {
            return Err(RegistryError::NotAllowlisted { tool_id: step.tool_id.clone() });
        }

        if definition.schema_version != step.schema_version {
            return Err(RegistryError::SchemaDrift {
                tool_id: step.tool_id.clone(),
                planned: step.schema_version,
                registered: definition.schema_version,
            });
        }

        validate_arguments(definition, &step.arguments)
    }
}

fn validate_arguments(
    definition: &ToolDefinition,
    arguments: &Map<String, Value>,
) -> Result<(), RegistryError> {
    for spec in &definition.parameters {
        let Some(value) = arguments.get(&spec.name) else {
            if spec.required {
                return Err(RegistryError::MissingParameter {
                    tool_id: definition.id.clone(),
                    name: spec.name.clone(),
                });
            }
            continue;
        };

        if !spec.kind.matches(value) {
            return Err(RegistryError::InvalidType {
                tool_id: definition.id.clone(),
                name: spec.name.clone(),
                expected: spec.kind.as_key(),
            });
        }

        for rule in &spec.rules {
            apply_rule(definition, &spec.name, rule, value)?;
        }
    }

    for name in arguments.keys() {
        if !definition.parameters.iter().any(|spec| &spec.name == name) {
            return Err(RegistryError::UnexpectedParameter {
                tool_id: definition.id.clone(),
                name: name.clone(),
            });
        }
    }

    Ok(())
}

fn apply_rule(
    definition: &ToolDefinition,
    name: &str,
    rule: &ParamRule,
    value: &Value,
) -> Result<(), RegistryError> {
    let violation = |message: String| RegistryError::RuleViolation {
        tool_id: definition.id.clone(),
        name: name.to_string(),
        message,
    };

    match rule {
        ParamRule::OneOf { allowed } => {
            let Some(candidate) = value.as_str() else {
                return Err(violation("enum rule requires a string value".to_string()));
            };
            if !allowed.iter().any(|entry| entry == candidate) {
                return Err(violation(format!(
                    "`{candidate}` is not one of {allowed:?}"
                )));
            }
        }
        ParamRule::MinNumber { min } => {
            if value.as_f64().is_some_and(|number| number < *min) {
                return Err(violation(format!("value must be at least {min}")));
            }
        }
        ParamRule::MaxNumber { max } => {
            if value.as_f64().is_some_and(|number| number > *max) {
                return Err(violation(format!("value must be at most {max}")));
            }
        }
        ParamRule::MaxLength { max } => {
            if value.as_str().is_some_and(|text| text.len() > *max) {
                return Err(violation(format!("length must be at most {max}")));
            }
        }
        ParamRule::NonEmpty => {
            if value.as_str().is_some_and(str::is_empty) {
                return Err(violation("value must not be empty".to_string()));
            }
        }
    }

    Ok(())
}
