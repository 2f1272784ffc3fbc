use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::intent::Intent;
use crate::domain::plan::{ActionPlan, ActionStep, PlanId};
use crate::domain::tool::ToolDefinition;
use crate::registry::ToolRegistry;

/// Deployment phase gate. Read-only deployments never plan a mutating tool,
/// whatever the intent asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiPhase {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlannerResult {
    /// Every requested operation resolved to a permitted tool.
    Planned { plan: ActionPlan },
    /// At least one requested operation could not be planned. No partial
    /// plan is produced.
    Denied { reason: String },
    /// The intent carries nothing to execute.
    NotActionable,
}

/// Turns a refined intent into an ordered [`ActionPlan`]. Risk is always
/// taken from the registered tool definition, never from anything the model
/// said about the request.
#[derive(Clone)]
pub struct ActionPlanner {
    registry: ToolRegistry,
    phase: AiPhase,
}

impl ActionPlanner {
    pub fn new(registry: ToolRegistry, phase: AiPhase) -> Self {
        Self { registry, phase }
    }

    pub fn plan(
        &self,
        intent: &Intent,
        tenant_id: &str,
        user_id: &str,
        permissions: &BTreeSet<String>,
    ) -> PlannerResult {
        if !intent.is_actionable() || intent.requested_operations.is_empty() {
            return PlannerResult::NotActionable;
        }

        let mut steps = Vec::with_capacity(intent.requested_operations.len());
        for (ordinal, operation) in intent.requested_operations.iter().enumerate() {
            let Some(definition) = self.resolve(operation) else {
                return PlannerResult::Denied {
                    reason: format!("no allowlisted tool matches `{operation}`"),
                };
            };

            if self.phase == AiPhase::ReadOnly && definition.mutating {
                return PlannerResult::Denied {
                    reason: format!(
                        "`{}` mutates data and this deployment is read-only",
                        definition.id
                    ),
                };
            }

            if !definition
                .required_permissions
                .iter()
                .all(|permission| permissions.contains(permission))
            {
                return PlannerResult::Denied {
                    reason: format!("`{}` is not permitted for this user", definition.id),
                };
            }

            steps.push(ActionStep {
                tool_id: definition.id.clone(),
                schema_version: definition.schema_version,
                ordinal: ordinal as u32,
                arguments: bind_arguments(&definition, intent),
                risk: definition.risk,
                description: definition.description.clone(),
            });
        }

        PlannerResult::Planned {
            plan: ActionPlan::new(
                PlanId(Uuid::new_v4().to_string()),
                intent.id.0.clone(),
                tenant_id,
                user_id,
                steps,
            ),
        }
    }

    /// Match by canonical id first, then by declared alias. Matching is
    /// case-insensitive and ignores surrounding whitespace.
    fn resolve(&self, operation: &str) -> Option<ToolDefinition> {
        let wanted = normalize_key(operation);
        self.registry
            .list(true)
            .into_iter()
            .find(|definition| {
                normalize_key(&definition.id) == wanted
                    || definition.aliases.iter().any(|alias| normalize_key(alias) == wanted)
            })
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Copy over only the entities the tool declares as parameters, coercing
/// each to the declared JSON type where the text allows it.
fn bind_arguments(definition: &ToolDefinition, intent: &Intent) -> Map<String, Value> {
    let mut arguments = Map::new();
    for spec in &definition.parameters {
        if let Some(raw) = intent.entities.get(&spec.name) {
            arguments.insert(spec.name.clone(), coerce(raw, spec.kind));
        }
    }
    arguments
}

fn coerce(raw: &str, kind: crate::domain::tool::ParamType) -> Value {
    use crate::domain::tool::ParamType;
    match kind {
        ParamType::Integer => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        ParamType::Number => raw
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        ParamType::Boolean => raw
            .parse::<bool>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        ParamType::String | ParamType::Object | ParamType::Array => {
            Value::String(raw.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Map, Value};

    use super::{ActionPlanner, AiPhase, PlannerResult};
    use crate::domain::intent::{Intent, IntentId, IntentType};
    use crate::domain::plan::RiskLevel;
    use crate::domain::tool::{ParamSpec, ParamType, ReturnShape, ToolDefinition};
    use crate::registry::{ExecutionMode, Tool, ToolError, ToolOutcome, ToolRegistry};

    struct FixedTool {
        definition: ToolDefinition,
    }

    #[async_trait]
    impl Tool for FixedTool {
        fn definition(&self) -> &ToolDefinition {
            &self.definition
        }

        async fn execute(
            &self,
            _arguments: &Map<String, Value>,
            _mode: ExecutionMode,
        ) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome::applied(json!({"ok": true})))
        }
    }

    fn definition(
        id: &str,
        risk: RiskLevel,
        mutating: bool,
        permission: &str,
    ) -> ToolDefinition {
        ToolDefinition {
            id: id.to_string(),
            capability: "records.read".to_string(),
            description: format!("demo tool {id}"),
            aliases: vec![format!("{id}-alias")],
            schema_version: 1,
            risk,
            required_permissions: vec![permission.to_string()],
            data_categories: vec!["operational".to_string()],
            allowlisted: true,
            mutating,
            parameters: vec![
                ParamSpec::required("record_id", ParamType::String),
                ParamSpec::optional("quantity", ParamType::Integer),
            ],
            returns: ReturnShape::Record,
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(FixedTool {
            definition: definition("records.lookup", RiskLevel::Low, false, "records:read"),
        });
        registry.register(FixedTool {
            definition: definition("records.update", RiskLevel::High, true, "records:write"),
        });
        registry
    }

    fn intent(operations: &[&str], entities: &[(&str, &str)]) -> Intent {
        Intent {
            id: IntentId("intent-1".to_string()),
            intent_type: IntentType::Action,
            entities: entities
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect::<BTreeMap<_, _>>(),
            requested_operations: operations.iter().map(|op| op.to_string()).collect(),
            confidence: 0.9,
            clarification_needed: false,
            clarification_question: None,
            response: None,
            source_text_redacted: "look up record r-7".to_string(),
            created_at: Utc::now(),
        }
    }

    fn permissions(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn plans_permitted_operations_with_registry_risk() {
        let planner = ActionPlanner::new(registry(), AiPhase::ReadWrite);
        let intent = intent(
            &["records.lookup", "records.update"],
            &[("record_id", "r-7"), ("quantity", "3"), ("ignored", "x")],
        );

        let result = planner.plan(
            &intent,
            "tenant-a",
            "u-1",
            &permissions(&["records:read", "records:write"]),
        );

        let PlannerResult::Planned { plan } = result else {
            panic!("expected a plan, got {result:?}");
        };
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].ordinal, 0);
        assert_eq!(plan.steps[1].risk, RiskLevel::High);
        assert_eq!(plan.overall_risk, RiskLevel::High);
        // Only declared parameters are bound, with type coercion.
        assert_eq!(plan.steps[0].arguments.get("record_id"), Some(&json!("r-7")));
        assert_eq!(plan.steps[0].arguments.get("quantity"), Some(&json!(3)));
        assert!(!plan.steps[0].arguments.contains_key("ignored"));
    }

    #[test]
    fn resolves_aliases_case_insensitively() {
        let planner = ActionPlanner::new(registry(), AiPhase::ReadWrite);
        let intent = intent(&["  Records.Lookup-ALIAS "], &[("record_id", "r-7")]);

        let result =
            planner.plan(&intent, "tenant-a", "u-1", &permissions(&["records:read"]));

        assert!(matches!(result, PlannerResult::Planned { .. }));
    }

    #[test]
    fn unknown_operation_denies_the_whole_plan() {
        let planner = ActionPlanner::new(registry(), AiPhase::ReadWrite);
        let intent = intent(&["records.lookup", "records.vanish"], &[]);

        let result = planner.plan(
            &intent,
            "tenant-a",
            "u-1",
            &permissions(&["records:read", "records:write"]),
        );

        assert!(matches!(result, PlannerResult::Denied { .. }));
    }

    #[test]
    fn missing_permission_denies_without_partial_plan() {
        let planner = ActionPlanner::new(registry(), AiPhase::ReadWrite);
        let intent = intent(&["records.update"], &[("record_id", "r-7")]);

        let result =
            planner.plan(&intent, "tenant-a", "u-1", &permissions(&["records:read"]));

        let PlannerResult::Denied { reason } = result else {
            panic!("expected denial");
        };
        assert!(reason.contains("records.update"));
    }

    #[test]
    fn read_only_phase_refuses_mutating_tools() {
        let planner = ActionPlanner::new(registry(), AiPhase::ReadOnly);
        let intent = intent(&["records.update"], &[("record_id", "r-7")]);

        let result =
            planner.plan(&intent, "tenant-a", "u-1", &permissions(&["records:write"]));

        assert!(matches!(result, PlannerResult::Denied { .. }));
    }

    #[test]
    fn informational_intent_is_not_actionable() {
        let planner = ActionPlanner::new(registry(), AiPhase::ReadWrite);
        let mut intent = intent(&["records.lookup"], &[]);
        intent.intent_type = IntentType::Informational;

        assert_eq!(
            planner.plan(&intent, "tenant-a", "u-1", &permissions(&["records:read"])),
            PlannerResult::NotActionable
        );
    }
}
