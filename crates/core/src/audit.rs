use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::intent::Intent;
use crate::domain::plan::{ActionPlan, RiskLevel};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

/// Append-only record of one processed request. Created exactly once per
/// request; the intent it carries is the redacted copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: String,
    pub correlation_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub intent: Option<Intent>,
    pub plan: Option<ActionPlan>,
    pub risk: Option<RiskLevel>,
    pub outcome: AuditOutcome,
    pub model_id: Option<String>,
    pub model_version: Option<String>,
    pub prompt_template_version: Option<String>,
    pub policy_engine_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AuditRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: impl Into<String>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        outcome: AuditOutcome,
        policy_engine_version: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            intent: None,
            plan: None,
            risk: None,
            outcome,
            model_id: None,
            model_version: None,
            prompt_template_version: None,
            policy_engine_version: policy_engine_version.into(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_plan(mut self, plan: ActionPlan) -> Self {
        self.risk = Some(plan.overall_risk);
        self.plan = Some(plan);
        self
    }

    pub fn with_model(
        mut self,
        model_id: impl Into<String>,
        model_version: impl Into<String>,
        template_version: impl Into<String>,
    ) -> Self {
        self.model_id = Some(model_id.into());
        self.model_version = Some(model_version.into());
        self.prompt_template_version = Some(template_version.into());
        self
    }
}

/// Sink contract: must never reject a well-formed record. Implementations
/// that persist asynchronously surface failures through logging, never back
/// to the request path.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: AuditRecord);
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl InMemoryAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn append(&self, record: AuditRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{AuditOutcome, AuditRecord, AuditSink, InMemoryAuditSink};
    use crate::policy::POLICY_ENGINE_VERSION;

    #[test]
    fn in_memory_sink_records_one_record_per_request() {
        let sink = InMemoryAuditSink::default();
        sink.append(
            AuditRecord::new(
                "req-123",
                "tenant-a",
                "u-1",
                AuditOutcome::Denied,
                POLICY_ENGINE_VERSION,
                Utc::now(),
            )
            .with_model("warden-intent", "2026-07", "intent-v3"),
        );

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].correlation_id, "req-123");
        assert_eq!(records[0].outcome, AuditOutcome::Denied);
        assert_eq!(records[0].model_id.as_deref(), Some("warden-intent"));
        assert_eq!(records[0].policy_engine_version, POLICY_ENGINE_VERSION);
    }
}
