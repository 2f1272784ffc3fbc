use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;

use warden_core::audit::{AuditOutcome, AuditRecord, AuditSink};
use warden_core::domain::plan::RiskLevel;

use super::RepositoryError;
use crate::DbPool;

pub struct SqlAuditRepository {
    pool: DbPool,
}

impl SqlAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append-only insert. Records are never updated or deleted.
    pub async fn insert(&self, record: &AuditRecord) -> Result<(), RepositoryError> {
        let intent_json = match &record.intent {
            Some(intent) => Some(
                serde_json::to_string(intent)
                    .map_err(|e| RepositoryError::Decode(e.to_string()))?,
            ),
            None => None,
        };
        let plan_json = match &record.plan {
            Some(plan) => Some(
                serde_json::to_string(plan)
                    .map_err(|e| RepositoryError::Decode(e.to_string()))?,
            ),
            None => None,
        };

        sqlx::query(
            "INSERT INTO audit_record (record_id, correlation_id, tenant_id, user_id,
                                       intent_json, plan_json, risk, outcome,
                                       model_id, model_version, prompt_template_version,
                                       policy_engine_version, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.record_id)
        .bind(&record.correlation_id)
        .bind(&record.tenant_id)
        .bind(&record.user_id)
        .bind(intent_json)
        .bind(plan_json)
        .bind(record.risk.map(risk_as_str))
        .bind(outcome_as_str(record.outcome))
        .bind(&record.model_id)
        .bind(&record.model_version)
        .bind(&record.prompt_template_version)
        .bind(&record.policy_engine_version)
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<AuditRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record_id, correlation_id, tenant_id, user_id, intent_json, plan_json,
                    risk, outcome, model_id, model_version, prompt_template_version,
                    policy_engine_version, started_at, finished_at
             FROM audit_record WHERE correlation_id = ?
             ORDER BY started_at ASC",
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    pub async fn recent_for_tenant(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<AuditRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record_id, correlation_id, tenant_id, user_id, intent_json, plan_json,
                    risk, outcome, model_id, model_version, prompt_template_version,
                    policy_engine_version, started_at, finished_at
             FROM audit_record WHERE tenant_id = ?
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(tenant_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<AuditRecord, RepositoryError> {
    let record_id: String =
        row.try_get("record_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let correlation_id: String =
        row.try_get("correlation_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let user_id: String =
        row.try_get("user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let intent_json: Option<String> =
        row.try_get("intent_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let plan_json: Option<String> =
        row.try_get("plan_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let risk: Option<String> =
        row.try_get("risk").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let outcome: String =
        row.try_get("outcome").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let model_id: Option<String> =
        row.try_get("model_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let model_version: Option<String> =
        row.try_get("model_version").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let prompt_template_version: Option<String> = row
        .try_get("prompt_template_version")
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let policy_engine_version: String = row
        .try_get("policy_engine_version")
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let started_at: String =
        row.try_get("started_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let finished_at: String =
        row.try_get("finished_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let intent = match intent_json {
        Some(json) => Some(
            serde_json::from_str(&json).map_err(|e| RepositoryError::Decode(e.to_string()))?,
        ),
        None => None,
    };
    let plan = match plan_json {
        Some(json) => Some(
            serde_json::from_str(&json).map_err(|e| RepositoryError::Decode(e.to_string()))?,
        ),
        None => None,
    };
    let risk = match risk {
        Some(raw) => Some(parse_risk(&raw)?),
        None => None,
    };

    Ok(AuditRecord {
        record_id,
        correlation_id,
        tenant_id,
        user_id,
        intent,
        plan,
        risk,
        outcome: parse_outcome(&outcome)?,
        model_id,
        model_version,
        prompt_template_version,
        policy_engine_version,
        started_at: parse_timestamp("started_at", &started_at)?,
        finished_at: parse_timestamp("finished_at", &finished_at)?,
    })
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{field}: {e}")))
}

fn risk_as_str(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
        RiskLevel::Critical => "critical",
    }
}

fn parse_risk(raw: &str) -> Result<RiskLevel, RepositoryError> {
    match raw {
        "low" => Ok(RiskLevel::Low),
        "medium" => Ok(RiskLevel::Medium),
        "high" => Ok(RiskLevel::High),
        "critical" => Ok(RiskLevel::Critical),
        other => Err(RepositoryError::Decode(format!("unknown risk level `{other}`"))),
    }
}

fn outcome_as_str(outcome: AuditOutcome) -> &'static str {
    match outcome {
        AuditOutcome::Success => "success",
        AuditOutcome::Denied => "denied",
        AuditOutcome::Error => "error",
    }
}

fn parse_outcome(raw: &str) -> Result<AuditOutcome, RepositoryError> {
    match raw {
        "success" => Ok(AuditOutcome::Success),
        "denied" => Ok(AuditOutcome::Denied),
        "error" => Ok(AuditOutcome::Error),
        other => Err(RepositoryError::Decode(format!("unknown audit outcome `{other}`"))),
    }
}

/// Persists records off the request path. The sink contract forbids pushing
/// failures back to the caller, so insert errors are logged and dropped.
#[derive(Clone)]
pub struct SpawningAuditSink {
    repository: Arc<SqlAuditRepository>,
}

impl SpawningAuditSink {
    pub fn new(repository: Arc<SqlAuditRepository>) -> Self {
        Self { repository }
    }
}

impl AuditSink for SpawningAuditSink {
    fn append(&self, record: AuditRecord) {
        let repository = self.repository.clone();
        tokio::spawn(async move {
            if let Err(error) = repository.insert(&record).await {
                tracing::error!(
                    event_name = "audit_persist_failed",
                    record_id = %record.record_id,
                    correlation_id = %record.correlation_id,
                    error = %error,
                    "failed to persist audit record",
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use warden_core::audit::{AuditOutcome, AuditRecord, AuditSink};
    use warden_core::domain::plan::{ActionPlan, ActionStep, PlanId, RiskLevel};

    use super::{SpawningAuditSink, SqlAuditRepository};
    use crate::{connect_with_settings, migrations};

    async fn repository() -> SqlAuditRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        SqlAuditRepository::new(pool)
    }

    fn plan() -> ActionPlan {
        ActionPlan::new(
            PlanId("plan-1".to_string()),
            "intent-1",
            "tenant-a",
            "u-1",
            vec![ActionStep {
                tool_id: "records.update".to_string(),
                schema_version: 1,
                ordinal: 0,
                arguments: serde_json::Map::new(),
                risk: RiskLevel::High,
                description: "update record".to_string(),
            }],
        )
    }

    fn record(correlation_id: &str) -> AuditRecord {
        AuditRecord::new(correlation_id, "tenant-a", "u-1", AuditOutcome::Success, "1", Utc::now())
            .with_plan(plan())
            .with_model("warden-intent", "2026-07", "intent-v3")
    }

    #[tokio::test]
    async fn insert_and_fetch_by_correlation_round_trips_the_record() {
        let repository = repository().await;
        let record = record("req-1");
        repository.insert(&record).await.expect("insert");

        let found = repository.find_by_correlation("req-1").await.expect("query");

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].record_id, record.record_id);
        assert_eq!(found[0].outcome, AuditOutcome::Success);
        assert_eq!(found[0].risk, Some(RiskLevel::High));
        assert_eq!(found[0].plan.as_ref().map(|p| p.id.0.as_str()), Some("plan-1"));
        assert_eq!(found[0].model_version.as_deref(), Some("2026-07"));
    }

    #[tokio::test]
    async fn recent_for_tenant_respects_the_limit() {
        let repository = repository().await;
        for index in 0..3 {
            repository.insert(&record(&format!("req-{index}"))).await.expect("insert");
        }

        let recent = repository.recent_for_tenant("tenant-a", 2).await.expect("query");
        assert_eq!(recent.len(), 2);

        let other = repository.recent_for_tenant("tenant-b", 10).await.expect("query");
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn spawning_sink_persists_in_the_background() {
        let repository = Arc::new(repository().await);
        let sink = SpawningAuditSink::new(repository.clone());

        sink.append(record("req-bg"));

        // The write happens on a spawned task; poll briefly for it to land.
        for _ in 0..50 {
            if !repository.find_by_correlation("req-bg").await.expect("query").is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background audit insert never landed");
    }
}
