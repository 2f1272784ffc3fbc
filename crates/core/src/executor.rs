use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::ApprovalGate;
use crate::domain::plan::{ActionPlan, ActionStep, RiskLevel};
use crate::domain::token::TokenId;
use crate::killswitch::KillSwitch;
use crate::policy::{PolicyContext, PolicyEngine};
use crate::registry::{ExecutionMode, SimulatedChange, ToolRegistry};

/// Who is asking. Permissions here come from the caller's session, never
/// from the plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub tenant_id: String,
    pub user_id: String,
    pub permissions: BTreeSet<String>,
    pub cross_tenant_admin: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConstraints {
    pub risk_ceiling: RiskLevel,
    pub forbidden_data_categories: BTreeSet<String>,
}

impl Default for ExecutionConstraints {
    fn default() -> Self {
        Self {
            risk_ceiling: RiskLevel::Critical,
            forbidden_data_categories: BTreeSet::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    /// The tool body (or a pre-flight validation) failed.
    Failed,
    /// Stopped by the kill switch or the policy engine before the tool ran.
    Denied,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub ordinal: u32,
    pub tool_id: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    #[serde(default)]
    pub simulated_changes: Vec<SimulatedChange>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Every step ran.
    Completed,
    /// A step failed; later steps were skipped.
    Halted,
    /// An authorization check said no: before the first step (missing or
    /// invalid token) or at the step the kill switch or policy stopped.
    Denied,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    pub denial_reason: Option<String>,
    pub steps: Vec<StepResult>,
}

/// An authorization stop and a tool fault take different paths to the audit
/// trail: the first is a denial, the second an execution error.
enum StepError {
    Denied(String),
    Failed(String),
}

/// Runs approved plans step by step. Every step clears the kill switch, the
/// registry, and the policy engine again at execution time; approval does
/// not exempt a plan from any of those checks.
pub struct Executor {
    registry: ToolRegistry,
    policy: Arc<dyn PolicyEngine>,
    kill_switch: Arc<KillSwitch>,
    gate: Arc<ApprovalGate>,
    constraints: ExecutionConstraints,
}

impl Executor {
    pub fn new(
        registry: ToolRegistry,
        policy: Arc<dyn PolicyEngine>,
        kill_switch: Arc<KillSwitch>,
        gate: Arc<ApprovalGate>,
        constraints: ExecutionConstraints,
    ) -> Self {
        Self { registry, policy, kill_switch, gate, constraints }
    }

    pub async fn execute(
        &self,
        plan: &ActionPlan,
        mode: ExecutionMode,
        token: Option<&TokenId>,
        actor: &ActorContext,
    ) -> ExecutionReport {
        // Approval is checked before anything runs. Simulation never needs
        // a token; it is the preview that earns one.
        if mode == ExecutionMode::Execute && self.gate.requires_approval(plan) {
            let Some(token_id) = token else {
                return denied(plan, mode, "plan requires an approval token");
            };
            if let Err(error) = self.gate.validate_and_consume(token_id, plan).await {
                return denied(plan, mode, &error.to_string());
            }
        }

        let mut steps = Vec::with_capacity(plan.steps.len());
        let mut halted = false;
        let mut denial_reason = None;

        for step in &plan.steps {
            if halted {
                steps.push(skipped(step));
                continue;
            }

            match self.run_step(plan, step, mode, actor).await {
                Ok(result) => steps.push(result),
                Err(error) => {
                    halted = true;
                    let (status, message) = match error {
                        StepError::Denied(message) => {
                            denial_reason = Some(message.clone());
                            (StepStatus::Denied, message)
                        }
                        StepError::Failed(message) => (StepStatus::Failed, message),
                    };
                    steps.push(StepResult {
                        ordinal: step.ordinal,
                        tool_id: step.tool_id.clone(),
                        status,
                        output: None,
                        simulated_changes: Vec::new(),
                        error: Some(message),
                    });
                }
            }
        }

        let status = if denial_reason.is_some() {
            ExecutionStatus::Denied
        } else if halted {
            ExecutionStatus::Halted
        } else {
            ExecutionStatus::Completed
        };
        ExecutionReport { status, mode, denial_reason, steps }
    }

    async fn run_step(
        &self,
        plan: &ActionPlan,
        step: &ActionStep,
        mode: ExecutionMode,
        actor: &ActorContext,
    ) -> Result<StepResult, StepError> {
        let definition = self
            .registry
            .definition(&step.tool_id)
            .ok_or_else(|| StepError::Failed(format!("unknown tool `{}`", step.tool_id)))?;

        self.kill_switch
            .check(&plan.tenant_id, &definition.capability)
            .map_err(|block| {
                StepError::Denied(format!("{}: {}", block.scope.key(), block.reason))
            })?;

        self.registry
            .validate(step)
            .map_err(|error| StepError::Failed(error.to_string()))?;

        let context = PolicyContext {
            actor_tenant_id: actor.tenant_id.clone(),
            target_tenant_id: plan.tenant_id.clone(),
            cross_tenant_admin: actor.cross_tenant_admin,
            actor_permissions: actor.permissions.clone(),
            tool_id: definition.id.clone(),
            required_permissions: definition.required_permissions.iter().cloned().collect(),
            risk: step.risk,
            risk_ceiling: self.constraints.risk_ceiling,
            tool_data_categories: definition.data_categories.iter().cloned().collect(),
            forbidden_data_categories: self.constraints.forbidden_data_categories.clone(),
        };
        let decision = self.policy.evaluate(&context);
        if let Some(violation) = decision.denial {
            return Err(StepError::Denied(format!(
                "{}: {}",
                violation.rule.as_key(),
                violation.reason
            )));
        }

        let tool = self
            .registry
            .get(&step.tool_id)
            .ok_or_else(|| StepError::Failed(format!("unknown tool `{}`", step.tool_id)))?;
        let outcome = tool
            .execute(&step.arguments, mode)
            .await
            .map_err(|error| StepError::Failed(error.to_string()))?;

        Ok(StepResult {
            ordinal: step.ordinal,
            tool_id: step.tool_id.clone(),
            status: StepStatus::Completed,
            output: Some(outcome.result),
            simulated_changes: outcome.simulated_changes,
            error: None,
        })
    }
}

fn denied(plan: &ActionPlan, mode: ExecutionMode, reason: &str) -> ExecutionReport {
    ExecutionReport {
        status: ExecutionStatus::Denied,
        mode,
        denial_reason: Some(reason.to_string()),
        steps: plan.steps.iter().map(skipped).collect(),
    }
}

fn skipped(step: &ActionStep) -> StepResult {
    StepResult {
        ordinal: step.ordinal,
        tool_id: step.tool_id.clone(),
        status: StepStatus::Skipped,
        output: None,
        simulated_changes: Vec::new(),
        error: None,
    }
}
