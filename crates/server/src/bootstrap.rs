use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use warden_agent::model::{GuardedModelClient, HttpModelClient, ModelError};
use warden_agent::refiner::IntentRefiner;
use warden_agent::runtime::AgentRuntime;
use warden_core::approval::{ApprovalConfig, ApprovalGate};
use warden_core::breaker::{BreakerConfig, CircuitBreaker};
use warden_core::config::{AppConfig, ConfigError, LoadOptions};
use warden_core::executor::{ExecutionConstraints, Executor};
use warden_core::killswitch::KillSwitch;
use warden_core::planner::ActionPlanner;
use warden_core::policy::DeterministicPolicyEngine;
use warden_core::toolset::{builtin_registry, BusinessRecord, RecordStore};
use warden_db::{
    connect_with_settings, migrations, DbPool, SpawningAuditSink, SqlAuditRepository,
    SqlTokenStore,
};

use crate::api::ApiState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
    pub gate: Arc<ApprovalGate>,
    pub kill_switch: Arc<KillSwitch>,
    pub breaker: Arc<CircuitBreaker>,
    pub audit_repository: Arc<SqlAuditRepository>,
}

impl Application {
    pub fn api_state(&self) -> ApiState {
        ApiState {
            runtime: self.runtime.clone(),
            gate: self.gate.clone(),
            kill_switch: self.kill_switch.clone(),
            breaker: self.breaker.clone(),
            audit: self.audit_repository.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("model client setup failed: {0}")]
    Model(#[source] ModelError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let store = RecordStore::new();
    store.seed(demo_records());
    let registry = builtin_registry(store);

    let kill_switch = Arc::new(KillSwitch::new());
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
        failure_threshold: config.safety.breaker_failure_threshold,
        cooldown: Duration::from_secs(config.safety.breaker_cooldown_secs),
    }));

    let token_store = Arc::new(SqlTokenStore::new(db_pool.clone()));
    let gate = Arc::new(ApprovalGate::new(
        ApprovalConfig {
            approval_threshold: config.safety.approval_threshold,
            token_ttl: chrono::Duration::seconds(config.safety.token_ttl_secs as i64),
        },
        config.safety.signing_key.clone(),
        token_store,
    ));

    let executor = Arc::new(Executor::new(
        registry.clone(),
        Arc::new(DeterministicPolicyEngine),
        kill_switch.clone(),
        gate.clone(),
        ExecutionConstraints {
            risk_ceiling: config.safety.risk_ceiling,
            forbidden_data_categories: config
                .safety
                .forbidden_data_categories
                .iter()
                .cloned()
                .collect(),
        },
    ));

    let http_client = HttpModelClient::new(config.model.clone()).map_err(BootstrapError::Model)?;
    let guarded = GuardedModelClient::new(
        Arc::new(http_client),
        breaker.clone(),
        Duration::from_secs(config.model.timeout_secs),
    );
    let refiner = IntentRefiner::new(Arc::new(guarded), config.safety.confidence_threshold);

    let audit_repository = Arc::new(SqlAuditRepository::new(db_pool.clone()));
    let audit_sink = Arc::new(SpawningAuditSink::new(audit_repository.clone()));

    let runtime = Arc::new(AgentRuntime::new(
        refiner,
        ActionPlanner::new(registry.clone(), config.safety.phase),
        registry,
        gate.clone(),
        executor,
        kill_switch.clone(),
        audit_sink,
    ));

    Ok(Application {
        config,
        db_pool,
        runtime,
        gate,
        kill_switch,
        breaker,
        audit_repository,
    })
}

/// In-memory demo dataset backing the builtin toolset. Real deployments
/// replace the toolset with adapters over their own business store.
fn demo_records() -> Vec<BusinessRecord> {
    vec![
        BusinessRecord {
            id: "r-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            status: "open".to_string(),
            quantity: 40,
        },
        BusinessRecord {
            id: "r-2".to_string(),
            tenant_id: "tenant-a".to_string(),
            status: "closed".to_string(),
            quantity: 0,
        },
        BusinessRecord {
            id: "r-3".to_string(),
            tenant_id: "tenant-b".to_string(),
            status: "open".to_string(),
            quantity: 12,
        },
    ]
}
