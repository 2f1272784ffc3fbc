use crate::commands::CommandResult;
use serde::Serialize;
use warden_core::toolset::{builtin_registry, RecordStore};

#[derive(Debug, Serialize)]
struct ToolSummary {
    id: String,
    capability: String,
    description: String,
    risk: String,
    mutating: bool,
    schema_version: u32,
    required_permissions: Vec<String>,
    aliases: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ToolsOutput {
    command: &'static str,
    tool_count: usize,
    tools: Vec<ToolSummary>,
}

/// Dump the builtin catalog. Output lists only allowlisted tools, which is
/// the same view the planner works from.
pub fn run() -> CommandResult {
    let registry = builtin_registry(RecordStore::default());

    let tools: Vec<ToolSummary> = registry
        .list(true)
        .into_iter()
        .map(|definition| ToolSummary {
            id: definition.id,
            capability: definition.capability,
            description: definition.description,
            risk: format!("{:?}", definition.risk).to_lowercase(),
            mutating: definition.mutating,
            schema_version: definition.schema_version,
            required_permissions: definition.required_permissions,
            aliases: definition.aliases,
        })
        .collect();

    let payload = ToolsOutput { command: "tools", tool_count: tools.len(), tools };
    let output = serde_json::to_string_pretty(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"tools\",\"status\":\"error\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult { exit_code: 0, output }
}
