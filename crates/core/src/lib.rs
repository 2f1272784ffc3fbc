pub mod approval;
pub mod audit;
pub mod breaker;
pub mod config;
pub mod domain;
pub mod errors;
pub mod executor;
pub mod killswitch;
pub mod planner;
pub mod policy;
pub mod registry;
pub mod toolset;

pub use approval::{
    ApprovalConfig, ApprovalError, ApprovalGate, ApprovalState, InMemoryTokenStore,
    PendingApproval, TokenConsumeError, TokenStore, TokenStoreError, TokenValidationError,
};
pub use audit::{AuditOutcome, AuditRecord, AuditSink, InMemoryAuditSink};
pub use breaker::{BreakerConfig, BreakerMetrics, BreakerOpen, BreakerState, CircuitBreaker};
pub use domain::intent::{Intent, IntentId, IntentType};
pub use domain::plan::{ActionPlan, ActionStep, PlanId, RiskLevel};
pub use domain::token::{ApprovalToken, TokenId, TokenState};
pub use domain::tool::{ParamRule, ParamSpec, ParamType, ReturnShape, ToolDefinition};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use executor::{
    ActorContext, ExecutionConstraints, ExecutionReport, ExecutionStatus, Executor,
    StepResult, StepStatus,
};
pub use killswitch::{ActiveScope, KillSwitch, KillSwitchBlock, KillSwitchScope};
pub use planner::{ActionPlanner, AiPhase, PlannerResult};
pub use policy::{
    DeterministicPolicyEngine, PolicyContext, PolicyDecision, PolicyEngine, PolicyRule,
    PolicyViolation, RuleOutcome, POLICY_ENGINE_VERSION,
};
pub use registry::{
    ExecutionMode, RegistryError, SimulatedChange, Tool, ToolError, ToolOutcome, ToolRegistry,
};
pub use toolset::{builtin_registry, BusinessRecord, RecordStore};
