use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use warden_core::approval::ApprovalGate;
use warden_core::audit::{AuditOutcome, AuditRecord, AuditSink};
use warden_core::{ApplicationError, DomainError};
use warden_core::domain::intent::{Intent, IntentType};
use warden_core::domain::plan::ActionPlan;
use warden_core::domain::token::TokenId;
use warden_core::domain::tool::ToolDefinition;
use warden_core::executor::{ActorContext, ExecutionReport, ExecutionStatus, Executor};
use warden_core::killswitch::KillSwitch;
use warden_core::planner::{ActionPlanner, PlannerResult};
use warden_core::policy::POLICY_ENGINE_VERSION;
use warden_core::registry::{ExecutionMode, ToolRegistry};

use crate::redactor::Redactor;
use crate::refiner::{IntentRefiner, RefinerOutput, RefinerResult, PROMPT_TEMPLATE_VERSION};
use crate::sanitizer::{PromptSanitizer, Verdict};

/// Capability the whole intake path is scoped under, so operators can stop
/// new requests without touching tool capabilities.
pub const INTAKE_CAPABILITY: &str = "agent.intake";

#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub correlation_id: Option<String>,
    pub tenant_id: String,
    pub user_id: String,
    pub permissions: BTreeSet<String>,
    pub cross_tenant_admin: bool,
    pub text: String,
    pub mode: ExecutionMode,
    pub approval_token: Option<TokenId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentReply {
    /// Input rejected or admission blocked. Terminal for the request.
    Rejected { message: String },
    /// Inference backend down, timed out, or breaker open. Nothing was
    /// classified; the same request can be retried later.
    Unavailable { message: String },
    Clarification { question: String },
    Informational { message: String },
    Capabilities { tools: Vec<ToolDefinition> },
    /// Plan parked at the approval gate; nothing was executed.
    AwaitingApproval { plan: ActionPlan },
    Denied { reason: String },
    Executed { report: ExecutionReport },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub correlation_id: String,
    pub reply: AgentReply,
}

/// The full safety pipeline for one request: sanitize, redact, refine, plan,
/// gate, execute. Exactly one audit record is appended per request, whatever
/// path the request takes.
pub struct AgentRuntime {
    sanitizer: PromptSanitizer,
    redactor: Redactor,
    refiner: IntentRefiner,
    planner: ActionPlanner,
    registry: ToolRegistry,
    gate: Arc<ApprovalGate>,
    executor: Arc<Executor>,
    kill_switch: Arc<KillSwitch>,
    audit: Arc<dyn AuditSink>,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        refiner: IntentRefiner,
        planner: ActionPlanner,
        registry: ToolRegistry,
        gate: Arc<ApprovalGate>,
        executor: Arc<Executor>,
        kill_switch: Arc<KillSwitch>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            sanitizer: PromptSanitizer::new(),
            redactor: Redactor::new(),
            refiner,
            planner,
            registry,
            gate,
            executor,
            kill_switch,
            audit,
        }
    }

    pub async fn handle(&self, request: AgentRequest) -> AgentResponse {
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let started_at = Utc::now();
        let mut ledger = AuditLedger::new(&request, &correlation_id, started_at);

        if let Err(block) =
            self.kill_switch.check(&request.tenant_id, INTAKE_CAPABILITY)
        {
            warn!(
                event_name = "request_blocked_by_kill_switch",
                correlation_id = %correlation_id,
                tenant_id = %request.tenant_id,
                scope = %block.scope.key(),
                reason = %block.reason,
            );
            // The blocked caller is told which scope stopped them and why.
            let error = ApplicationError::Authorization(format!(
                "{}: {}",
                block.scope.key(),
                block.reason
            ));
            let reply = AgentReply::Rejected { message: error.to_string() };
            return self.finish(ledger, AuditOutcome::Denied, correlation_id, reply);
        }

        if let Verdict::Injection { pattern } = self.sanitizer.screen(&request.text) {
            // Raw text is dropped here; only the pattern label is logged.
            warn!(
                event_name = "prompt_injection_rejected",
                correlation_id = %correlation_id,
                tenant_id = %request.tenant_id,
                pattern,
            );
            let interface = ApplicationError::from(DomainError::InjectionDetected)
                .into_interface(correlation_id.clone());
            let reply =
                AgentReply::Rejected { message: interface.user_message().to_string() };
            return self.finish(ledger, AuditOutcome::Denied, correlation_id, reply);
        }

        let redacted = self.redactor.redact(&request.text);
        let RefinerOutput { intent, path: _, model_version } =
            match self.refiner.refine(&redacted).await {
                RefinerResult::Refined(output) => output,
                RefinerResult::Unavailable { reason } => {
                    warn!(
                        event_name = "request_unavailable",
                        correlation_id = %correlation_id,
                        reason = %reason,
                    );
                    let interface = ApplicationError::Availability(reason)
                        .into_interface(correlation_id.clone());
                    let reply = AgentReply::Unavailable {
                        message: interface.user_message().to_string(),
                    };
                    return self.finish(ledger, AuditOutcome::Error, correlation_id, reply);
                }
            };
        ledger.model_version = model_version;
        ledger.intent = Some(intent.clone());

        info!(
            event_name = "intent_refined",
            correlation_id = %correlation_id,
            intent_type = intent.intent_type.as_key(),
            confidence = intent.confidence,
        );

        if intent.clarification_needed {
            let question = intent
                .clarification_question
                .clone()
                .unwrap_or_else(|| "Could you rephrase that?".to_string());
            let reply = AgentReply::Clarification { question };
            return self.finish(ledger, AuditOutcome::Success, correlation_id, reply);
        }

        match intent.intent_type {
            IntentType::Informational => {
                let message = intent.response.clone().unwrap_or_else(|| {
                    "I can answer that with a records lookup if you name a record."
                        .to_string()
                });
                let reply = AgentReply::Informational { message };
                self.finish(ledger, AuditOutcome::Success, correlation_id, reply)
            }
            IntentType::CapabilityInquiry => {
                let reply = AgentReply::Capabilities { tools: self.registry.list(true) };
                self.finish(ledger, AuditOutcome::Success, correlation_id, reply)
            }
            IntentType::Cancellation => {
                let reply = AgentReply::Informational {
                    message: "Nothing was executed; there is nothing to cancel.".to_string(),
                };
                self.finish(ledger, AuditOutcome::Success, correlation_id, reply)
            }
            IntentType::Unknown => {
                let reply = AgentReply::Clarification {
                    question: "Could you rephrase what you would like me to do?".to_string(),
                };
                self.finish(ledger, AuditOutcome::Success, correlation_id, reply)
            }
            IntentType::Action => {
                self.handle_action(request, intent, ledger, correlation_id).await
            }
        }
    }

    async fn handle_action(
        &self,
        request: AgentRequest,
        intent: Intent,
        mut ledger: AuditLedger,
        correlation_id: String,
    ) -> AgentResponse {
        let result = self.planner.plan(
            &intent,
            &request.tenant_id,
            &request.user_id,
            &request.permissions,
        );

        let plan = match result {
            PlannerResult::NotActionable => {
                let reply = AgentReply::Clarification {
                    question: "Which operation should I run, and on which record?"
                        .to_string(),
                };
                return self.finish(ledger, AuditOutcome::Success, correlation_id, reply);
            }
            PlannerResult::Denied { reason } => {
                info!(
                    event_name = "plan_denied",
                    correlation_id = %correlation_id,
                    reason = %reason,
                );
                let reply = AgentReply::Denied { reason };
                return self.finish(ledger, AuditOutcome::Denied, correlation_id, reply);
            }
            PlannerResult::Planned { plan } => plan,
        };

        ledger.plan = Some(plan.clone());
        info!(
            event_name = "plan_created",
            correlation_id = %correlation_id,
            plan_id = %plan.id.0,
            overall_risk = plan.overall_risk.as_key(),
            steps = plan.steps.len(),
        );

        if request.mode == ExecutionMode::Execute
            && request.approval_token.is_none()
            && self.gate.requires_approval(&plan)
        {
            let pending = self.gate.submit(plan);
            let reply = AgentReply::AwaitingApproval { plan: pending.plan };
            return self.finish(ledger, AuditOutcome::Success, correlation_id, reply);
        }

        let actor = ActorContext {
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            permissions: request.permissions.clone(),
            cross_tenant_admin: request.cross_tenant_admin,
        };
        let report: ExecutionReport = self
            .executor
            .execute(&plan, request.mode, request.approval_token.as_ref(), &actor)
            .await;

        info!(
            event_name = "plan_executed",
            correlation_id = %correlation_id,
            plan_id = %plan.id.0,
            status = ?report.status,
        );

        let outcome = match report.status {
            ExecutionStatus::Completed => AuditOutcome::Success,
            ExecutionStatus::Denied => AuditOutcome::Denied,
            ExecutionStatus::Halted => AuditOutcome::Error,
        };
        let reply = match report.status {
            ExecutionStatus::Denied => AgentReply::Denied {
                reason: report
                    .denial_reason
                    .clone()
                    .unwrap_or_else(|| "execution was denied".to_string()),
            },
            _ => AgentReply::Executed { report },
        };
        self.finish(ledger, outcome, correlation_id, reply)
    }

    /// Execute a plan previously parked at the approval gate, spending the
    /// token minted for it. Appends its own audit record.
    pub async fn execute_approved(
        &self,
        plan_id: &warden_core::domain::plan::PlanId,
        token: &TokenId,
        actor: &ActorContext,
    ) -> Option<AgentResponse> {
        let plan = self.gate.plan(plan_id)?;
        let correlation_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let report = self
            .executor
            .execute(&plan, ExecutionMode::Execute, Some(token), actor)
            .await;

        let outcome = match report.status {
            ExecutionStatus::Completed => AuditOutcome::Success,
            ExecutionStatus::Denied => AuditOutcome::Denied,
            ExecutionStatus::Halted => AuditOutcome::Error,
        };
        let mut record = AuditRecord::new(
            correlation_id.clone(),
            plan.tenant_id.clone(),
            plan.user_id.clone(),
            outcome,
            POLICY_ENGINE_VERSION,
            started_at,
        );
        record = record.with_plan(plan);
        self.audit.append(record);

        let reply = match report.status {
            ExecutionStatus::Denied => AgentReply::Denied {
                reason: report
                    .denial_reason
                    .clone()
                    .unwrap_or_else(|| "execution was denied".to_string()),
            },
            _ => AgentReply::Executed { report },
        };
        Some(AgentResponse { correlation_id, reply })
    }

    fn finish(
        &self,
        ledger: AuditLedger,
        outcome: AuditOutcome,
        correlation_id: String,
        reply: AgentReply,
    ) -> AgentResponse {
        self.audit.append(ledger.into_record(outcome));
        AgentResponse { correlation_id, reply }
    }
}

/// Accumulates what the audit record needs as the pipeline progresses, so
/// every exit path appends exactly one record.
struct AuditLedger {
    correlation_id: String,
    tenant_id: String,
    user_id: String,
    started_at: chrono::DateTime<Utc>,
    intent: Option<Intent>,
    plan: Option<ActionPlan>,
    model_version: Option<String>,
}

impl AuditLedger {
    fn new(
        request: &AgentRequest,
        correlation_id: &str,
        started_at: chrono::DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            started_at,
            intent: None,
            plan: None,
            model_version: None,
        }
    }

    fn into_record(self, outcome: AuditOutcome) -> AuditRecord {
        let mut record = AuditRecord::new(
            self.correlation_id,
            self.tenant_id,
            self.user_id,
            outcome,
            POLICY_ENGINE_VERSION,
            self.started_at,
        );
        if let Some(version) = self.model_version {
            record = record.with_model(version.clone(), version, PROMPT_TEMPLATE_VERSION);
        }
        if let Some(intent) = self.intent {
            record = record.with_intent(intent);
        }
        if let Some(plan) = self.plan {
            record = record.with_plan(plan);
        }
        record
    }
}
