use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::plan::RiskLevel;

/// Recorded on every audit record so identical replays can be matched to
/// the rule set that produced them.
pub const POLICY_ENGINE_VERSION: &str = "1";

/// Rules are evaluated in this fixed order. The first failing rule is the
/// denial reason, but every rule is still evaluated and reported so audit
/// replays see the full picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    TenantIsolation,
    Rbac,
    RiskThreshold,
    Compliance,
}

impl PolicyRule {
    pub fn as_key(&self) -> &'static str {
        match self {
            Self::TenantIsolation => "tenant_isolation",
            Self::Rbac => "rbac",
            Self::RiskThreshold => "risk_threshold",
            Self::Compliance => "compliance",
        }
    }
}

/// Everything the engine is allowed to look at. No clock, no randomness:
/// identical context must always yield an identical decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub actor_tenant_id: String,
    pub target_tenant_id: String,
    pub cross_tenant_admin: bool,
    pub actor_permissions: BTreeSet<String>,
    pub tool_id: String,
    pub required_permissions: BTreeSet<String>,
    pub risk: RiskLevel,
    pub risk_ceiling: RiskLevel,
    pub tool_data_categories: BTreeSet<String>,
    pub forbidden_data_categories: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule: PolicyRule,
    pub passed: bool,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub rule: PolicyRule,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub denial: Option<PolicyViolation>,
    pub outcomes: Vec<RuleOutcome>,
}

pub trait PolicyEngine: Send + Sync {
    fn evaluate(&self, context: &PolicyContext) -> PolicyDecision;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeterministicPolicyEngine;

impl PolicyEngine for DeterministicPolicyEngine {
    fn evaluate(&self, context: &PolicyContext) -> PolicyDecision {
        evaluate_context(context)
    }
}

pub fn evaluate_context(context: &PolicyContext) -> PolicyDecision {
    let outcomes = vec![
        tenant_isolation(context),
        rbac(context),
        risk_threshold(context),
        compliance(context),
    ];

    let denial = outcomes.iter().find(|outcome| !outcome.passed).map(|outcome| {
        PolicyViolation { rule: outcome.rule, reason: outcome.detail.clone() }
    });

    PolicyDecision { allowed: denial.is_none(), denial, outcomes }
}

fn tenant_isolation(context: &PolicyContext) -> RuleOutcome {
    let passed = context.actor_tenant_id == context.target_tenant_id
        || context.cross_tenant_admin;
    let detail = if passed {
        "actor tenant matches target tenant".to_string()
    } else {
        "actor may not act on another tenant's data".to_string()
    };
    RuleOutcome { rule: PolicyRule::TenantIsolation, passed, detail }
}

// Deliberately does not name the missing permission: denial text is what
// callers see, and it must not let them enumerate the permission space.
fn rbac(context: &PolicyContext) -> RuleOutcome {
    let passed = context
        .required_permissions
        .iter()
        .all(|permission| context.actor_permissions.contains(permission));
    let detail = if passed {
        format!("permission set covers `{}`", context.tool_id)
    } else {
        format!("permission set does not cover `{}`", context.tool_id)
    };
    RuleOutcome { rule: PolicyRule::Rbac, passed, detail }
}

fn risk_threshold(context: &PolicyContext) -> RuleOutcome {
    let passed = context.risk <= context.risk_ceiling;
    let detail = if passed {
        format!("risk {} within ceiling {}", context.risk.as_key(), context.risk_ceiling.as_key())
    } else {
        format!(
            "risk {} exceeds configured ceiling {}",
            context.risk.as_key(),
            context.risk_ceiling.as_key()
        )
    };
    RuleOutcome { rule: PolicyRule::RiskThreshold, passed, detail }
}

fn compliance(context: &PolicyContext) -> RuleOutcome {
    let breached: Vec<&String> = context
        .tool_data_categories
        .intersection(&context.forbidden_data_categories)
        .collect();
    let passed = breached.is_empty();
    let detail = if passed {
        "no forbidden data categories touched".to_string()
    } else {
        format!("tool touches forbidden data categories: {breached:?}")
    };
    RuleOutcome { rule: PolicyRule::Compliance, passed, detail }
}
