//! Built-in demo toolset over an in-memory record store. The server and CLI
//! register these at startup; integration tests use them as realistic
//! allowlisted operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::plan::RiskLevel;
use crate::domain::tool::{ParamRule, ParamSpec, ParamType, ReturnShape, ToolDefinition};
use crate::registry::{
    ExecutionMode, SimulatedChange, Tool, ToolError, ToolOutcome, ToolRegistry,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub id: String,
    pub tenant_id: String,
    pub status: String,
    pub quantity: i64,
}

/// Shared in-memory store backing the demo tools.
#[derive(Clone, Default)]
pub struct RecordStore {
    records: Arc<Mutex<HashMap<String, BusinessRecord>>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, records: Vec<BusinessRecord>) {
        let mut map = self.lock();
        for record in records {
            map.insert(record.id.clone(), record);
        }
    }

    pub fn get(&self, id: &str) -> Option<BusinessRecord> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BusinessRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn required_record_id(arguments: &Map<String, Value>) -> Result<&str, ToolError> {
    arguments
        .get("record_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::Failure("record_id argument missing".to_string()))
}

pub struct RecordLookupTool {
    definition: ToolDefinition,
    store: RecordStore,
}

impl RecordLookupTool {
    pub fn new(store: RecordStore) -> Self {
        Self {
            definition: ToolDefinition {
                id: "records.lookup".to_string(),
                capability: "records.read".to_string(),
                description: "Look up a single business record".to_string(),
                aliases: vec!["lookup".to_string(), "find_record".to_string()],
                schema_version: 1,
                risk: RiskLevel::Low,
                required_permissions: vec!["records:read".to_string()],
                data_categories: vec!["operational".to_string()],
                allowlisted: true,
                mutating: false,
                parameters: vec![ParamSpec::required("record_id", ParamType::String)
                    .with_rule(ParamRule::NonEmpty)],
                returns: ReturnShape::Record,
            },
            store,
        }
    }
}

#[async_trait]
impl Tool for RecordLookupTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(
        &self,
        arguments: &Map<String, Value>,
        _mode: ExecutionMode,
    ) -> Result<ToolOutcome, ToolError> {
        let record_id = required_record_id(arguments)?;
        let record = self
            .store
            .get(record_id)
            .ok_or_else(|| ToolError::Failure(format!("record `{record_id}` not found")))?;
        // Reads behave identically in both modes.
        Ok(ToolOutcome::applied(json!(record)))
    }
}

pub struct InventoryAdjustTool {
    definition: ToolDefinition,
    store: RecordStore,
}

impl InventoryAdjustTool {
    pub fn new(store: RecordStore) -> Self {
        Self {
            definition: ToolDefinition {
                id: "inventory.adjust".to_string(),
                capability: "inventory.write".to_string(),
                description: "Adjust the on-hand quantity of a record".to_string(),
                aliases: vec!["adjust_inventory".to_string()],
                schema_version: 1,
                risk: RiskLevel::Medium,
                required_permissions: vec!["inventory:write".to_string()],
                data_categories: vec!["operational".to_string()],
                allowlisted: true,
                mutating: true,
                parameters: vec![
                    ParamSpec::required("record_id", ParamType::String)
                        .with_rule(ParamRule::NonEmpty),
                    ParamSpec::required("delta", ParamType::Integer)
                        .with_rule(ParamRule::MinNumber { min: -1_000.0 })
                        .with_rule(ParamRule::MaxNumber { max: 1_000.0 }),
                ],
                returns: ReturnShape::Acknowledgement,
            },
            store,
        }
    }
}

#[async_trait]
impl Tool for InventoryAdjustTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(
        &self,
        arguments: &Map<String, Value>,
        mode: ExecutionMode,
    ) -> Result<ToolOutcome, ToolError> {
        let record_id = required_record_id(arguments)?;
        let delta = arguments
            .get("delta")
            .and_then(Value::as_i64)
            .ok_or_else(|| ToolError::Failure("delta argument missing".to_string()))?;

        let mut records = self.store.lock();
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| ToolError::Failure(format!("record `{record_id}` not found")))?;
        let next = record.quantity + delta;

        if mode == ExecutionMode::Simulate {
            return Ok(ToolOutcome::simulated(
                json!({"record_id": record_id, "quantity": next}),
                vec![SimulatedChange {
                    target: format!("record:{record_id}"),
                    operation: "adjust_quantity".to_string(),
                    detail: format!("{} -> {next}", record.quantity),
                }],
            ));
        }

        record.quantity = next;
        Ok(ToolOutcome::applied(json!({"record_id": record_id, "quantity": next})))
    }
}

pub struct RecordUpdateTool {
    definition: ToolDefinition,
    store: RecordStore,
}

impl RecordUpdateTool {
    pub fn new(store: RecordStore) -> Self {
        Self {
            definition: ToolDefinition {
                id: "records.update".to_string(),
                capability: "records.write".to_string(),
                description: "Change the status of a business record".to_string(),
                aliases: vec!["update_record".to_string()],
                schema_version: 1,
                risk: RiskLevel::High,
                required_permissions: vec!["records:write".to_string()],
                data_categories: vec!["operational".to_string()],
                allowlisted: true,
                mutating: true,
                parameters: vec![
                    ParamSpec::required("record_id", ParamType::String)
                        .with_rule(ParamRule::NonEmpty),
                    ParamSpec::required("status", ParamType::String).with_rule(
                        ParamRule::OneOf {
                            allowed: vec![
                                "open".to_string(),
                                "closed".to_string(),
                                "archived".to_string(),
                            ],
                        },
                    ),
                ],
                returns: ReturnShape::Acknowledgement,
            },
            store,
        }
    }
}

#[async_trait]
impl Tool for RecordUpdateTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(
        &self,
        arguments: &Map<String, Value>,
        mode: ExecutionMode,
    ) -> Result<ToolOutcome, ToolError> {
        let record_id = required_record_id(arguments)?;
        let status = arguments
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Failure("status argument missing".to_string()))?;

        let mut records = self.store.lock();
        let record = records
            .get_mut(record_id)
            .ok_or_else(|| ToolError::Failure(format!("record `{record_id}` not found")))?;

        if mode == ExecutionMode::Simulate {
            return Ok(ToolOutcome::simulated(
                json!({"record_id": record_id, "status": status}),
                vec![SimulatedChange {
                    target: format!("record:{record_id}"),
                    operation: "update_status".to_string(),
                    detail: format!("{} -> {status}", record.status),
                }],
            ));
        }

        record.status = status.to_string();
        Ok(ToolOutcome::applied(json!({"record_id": record_id, "status": status})))
    }
}

pub struct RecordPurgeTool {
    definition: ToolDefinition,
    store: RecordStore,
}

impl RecordPurgeTool {
    pub fn new(store: RecordStore) -> Self {
        Self {
            definition: ToolDefinition {
                id: "records.purge".to_string(),
                capability: "records.write".to_string(),
                description: "Permanently delete a business record".to_string(),
                aliases: vec!["purge_record".to_string(), "delete_record".to_string()],
                schema_version: 1,
                risk: RiskLevel::Critical,
                required_permissions: vec!["records:purge".to_string()],
                data_categories: vec!["operational".to_string()],
                allowlisted: true,
                mutating: true,
                parameters: vec![ParamSpec::required("record_id", ParamType::String)
                    .with_rule(ParamRule::NonEmpty)],
                returns: ReturnShape::Acknowledgement,
            },
            store,
        }
    }
}

#[async_trait]
impl Tool for RecordPurgeTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(
        &self,
        arguments: &Map<String, Value>,
        mode: ExecutionMode,
    ) -> Result<ToolOutcome, ToolError> {
        let record_id = required_record_id(arguments)?;

        let mut records = self.store.lock();
        if !records.contains_key(record_id) {
            return Err(ToolError::Failure(format!("record `{record_id}` not found")));
        }

        if mode == ExecutionMode::Simulate {
            return Ok(ToolOutcome::simulated(
                json!({"record_id": record_id, "purged": false}),
                vec![SimulatedChange {
                    target: format!("record:{record_id}"),
                    operation: "purge".to_string(),
                    detail: "record would be permanently deleted".to_string(),
                }],
            ));
        }

        records.remove(record_id);
        Ok(ToolOutcome::applied(json!({"record_id": record_id, "purged": true})))
    }
}

/// Registry with every built-in tool registered against one shared store.
pub fn builtin_registry(store: RecordStore) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(RecordLookupTool::new(store.clone()));
    registry.register(InventoryAdjustTool::new(store.clone()));
    registry.register(RecordUpdateTool::new(store.clone()));
    registry.register(RecordPurgeTool::new(store));
    registry
}
