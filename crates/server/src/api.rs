//! HTTP surface for the safety pipeline: request intake, the approval
//! workflow, kill switch administration, and operational read-outs.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use warden_agent::runtime::{AgentRequest, AgentResponse, AgentRuntime};
use warden_core::approval::{ApprovalError, ApprovalGate, PendingApproval};
use warden_core::breaker::{BreakerMetrics, CircuitBreaker};
use warden_core::domain::plan::PlanId;
use warden_core::domain::token::{ApprovalToken, TokenId};
use warden_core::executor::ActorContext;
use warden_core::killswitch::{ActiveScope, KillSwitch, KillSwitchScope};
use warden_core::registry::ExecutionMode;
use warden_db::SqlAuditRepository;

#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<AgentRuntime>,
    pub gate: Arc<ApprovalGate>,
    pub kill_switch: Arc<KillSwitch>,
    pub breaker: Arc<CircuitBreaker>,
    pub audit: Arc<SqlAuditRepository>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/requests", post(submit_request))
        .route("/v1/approvals", get(list_approvals))
        .route("/v1/approvals/{plan_id}/approve", post(approve_plan))
        .route("/v1/approvals/{plan_id}/reject", post(reject_plan))
        .route("/v1/killswitch", get(list_kill_switches))
        .route("/v1/killswitch/activate", post(activate_kill_switch))
        .route("/v1/killswitch/deactivate", post(deactivate_kill_switch))
        .route("/v1/breaker", get(breaker_metrics))
        .route("/v1/audit", get(recent_audit))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiError { error: message.into() })).into_response()
}

fn approval_error_response(error: ApprovalError) -> Response {
    match &error {
        ApprovalError::UnknownPlan(_) => error_response(StatusCode::NOT_FOUND, error.to_string()),
        ApprovalError::NotPending { .. } => {
            error_response(StatusCode::CONFLICT, error.to_string())
        }
        ApprovalError::Store(_) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, error.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    correlation_id: Option<String>,
    tenant_id: String,
    user_id: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    cross_tenant_admin: bool,
    text: String,
    #[serde(default = "default_mode")]
    mode: ExecutionMode,
    #[serde(default)]
    approval_token: Option<String>,
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Simulate
}

async fn submit_request(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitRequest>,
) -> Json<AgentResponse> {
    let request = AgentRequest {
        correlation_id: payload.correlation_id,
        tenant_id: payload.tenant_id,
        user_id: payload.user_id,
        permissions: payload.permissions.into_iter().collect::<BTreeSet<_>>(),
        cross_tenant_admin: payload.cross_tenant_admin,
        text: payload.text,
        mode: payload.mode,
        approval_token: payload.approval_token.map(TokenId),
    };

    Json(state.runtime.handle(request).await)
}

#[derive(Debug, Deserialize)]
struct ApprovalsQuery {
    #[serde(default)]
    tenant_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApprovalsResponse {
    pending: Vec<PendingApproval>,
}

async fn list_approvals(
    State(state): State<ApiState>,
    Query(query): Query<ApprovalsQuery>,
) -> Json<ApprovalsResponse> {
    let pending = state.gate.list_pending(query.tenant_id.as_deref());
    Json(ApprovalsResponse { pending })
}

#[derive(Debug, Deserialize)]
struct ActorPayload {
    tenant_id: String,
    user_id: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    cross_tenant_admin: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ApproveRequest {
    /// When present, the approved plan is executed immediately with the
    /// minted token on behalf of this actor.
    #[serde(default)]
    actor: Option<ActorPayload>,
}

#[derive(Debug, Serialize)]
struct ApproveResponse {
    token: ApprovalToken,
    executed: Option<AgentResponse>,
}

async fn approve_plan(
    State(state): State<ApiState>,
    Path(plan_id): Path<String>,
    Json(payload): Json<ApproveRequest>,
) -> Response {
    let plan_id = PlanId(plan_id);
    let token = match state.gate.approve(&plan_id).await {
        Ok(token) => token,
        Err(error) => return approval_error_response(error),
    };
    info!(
        event_name = "plan_approved",
        plan_id = %plan_id.0,
        token_id = %token.id.0,
        "approval token minted"
    );

    let executed = match payload.actor {
        Some(actor) => {
            let actor = ActorContext {
                tenant_id: actor.tenant_id,
                user_id: actor.user_id,
                permissions: actor.permissions.into_iter().collect::<BTreeSet<_>>(),
                cross_tenant_admin: actor.cross_tenant_admin,
            };
            state.runtime.execute_approved(&plan_id, &token.id, &actor).await
        }
        None => None,
    };

    (StatusCode::OK, Json(ApproveResponse { token, executed })).into_response()
}

async fn reject_plan(State(state): State<ApiState>, Path(plan_id): Path<String>) -> Response {
    let plan_id = PlanId(plan_id);
    match state.gate.reject(&plan_id) {
        Ok(()) => {
            info!(event_name = "plan_rejected", plan_id = %plan_id.0, "plan rejected");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(error) => approval_error_response(error),
    }
}

#[derive(Debug, Serialize)]
struct KillSwitchListResponse {
    active: Vec<ActiveScope>,
}

async fn list_kill_switches(State(state): State<ApiState>) -> Json<KillSwitchListResponse> {
    Json(KillSwitchListResponse { active: state.kill_switch.active_scopes() })
}

#[derive(Debug, Deserialize)]
struct ActivateRequest {
    #[serde(flatten)]
    scope: KillSwitchScope,
    reason: String,
}

async fn activate_kill_switch(
    State(state): State<ApiState>,
    Json(payload): Json<ActivateRequest>,
) -> StatusCode {
    info!(
        event_name = "kill_switch_activated",
        scope = %payload.scope.key(),
        reason = %payload.reason,
        "kill switch activated"
    );
    state.kill_switch.activate(payload.scope, payload.reason);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct DeactivateRequest {
    #[serde(flatten)]
    scope: KillSwitchScope,
}

async fn deactivate_kill_switch(
    State(state): State<ApiState>,
    Json(payload): Json<DeactivateRequest>,
) -> Response {
    if state.kill_switch.deactivate(&payload.scope) {
        info!(
            event_name = "kill_switch_deactivated",
            scope = %payload.scope.key(),
            "kill switch deactivated"
        );
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "no active kill switch for that scope")
    }
}

async fn breaker_metrics(State(state): State<ApiState>) -> Json<BreakerMetrics> {
    Json(state.breaker.metrics())
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    tenant_id: String,
    #[serde(default = "default_audit_limit")]
    limit: u32,
}

fn default_audit_limit() -> u32 {
    20
}

async fn recent_audit(
    State(state): State<ApiState>,
    Query(query): Query<AuditQuery>,
) -> Response {
    match state.audit.recent_for_tenant(&query.tenant_id, query.limit.min(200)).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(error) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("audit query failed: {error}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use warden_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    async fn test_state() -> crate::api::ApiState {
        // Each test gets its own named in-memory database so parallel tests
        // never share state or race migrations.
        let database_url = format!(
            "sqlite://file:warden_api_{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url),
                signing_key: Some("api-test-signing-key".to_string()),
                phase: Some(warden_core::planner::AiPhase::ReadWrite),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed");
        app.api_state()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        serde_json::from_slice(&bytes).expect("body should be valid JSON")
    }

    fn submit_payload(text: &str, mode: &str) -> Value {
        json!({
            "tenant_id": "tenant-a",
            "user_id": "u-1",
            "permissions": ["records:read", "records:write", "inventory:write", "records:purge"],
            "text": text,
            "mode": mode,
        })
    }

    #[tokio::test]
    async fn simulate_request_executes_without_approval() {
        let router = super::router(test_state().await);

        let response = router
            .oneshot(post_json(
                "/v1/requests",
                submit_payload("update record r-1 to closed", "simulate"),
            ))
            .await
            .expect("request should be handled");

        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["reply"]["kind"], "executed");
        assert_eq!(payload["reply"]["report"]["mode"], "simulate");
    }

    #[tokio::test]
    async fn high_risk_execute_parks_then_approval_runs_the_plan() {
        let state = test_state().await;
        let router = super::router(state.clone());

        let response = router
            .clone()
            .oneshot(post_json(
                "/v1/requests",
                submit_payload("update record r-1 to closed", "execute"),
            ))
            .await
            .expect("request should be handled");
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["reply"]["kind"], "awaiting_approval");
        let plan_id = payload["reply"]["plan"]["id"]
            .as_str()
            .expect("parked plan should carry an id")
            .to_string();

        let listed = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/approvals?tenant_id=tenant-a")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should be handled");
        assert_eq!(listed.status(), StatusCode::OK);
        let listed = body_json(listed).await;
        assert_eq!(listed["pending"].as_array().map(Vec::len), Some(1));

        let approved = router
            .clone()
            .oneshot(post_json(
                &format!("/v1/approvals/{plan_id}/approve"),
                json!({
                    "actor": {
                        "tenant_id": "tenant-a",
                        "user_id": "approver-1",
                        "permissions": ["records:write"],
                    }
                }),
            ))
            .await
            .expect("request should be handled");
        assert_eq!(approved.status(), StatusCode::OK);
        let approved = body_json(approved).await;
        assert_eq!(approved["executed"]["reply"]["kind"], "executed");

        // The token was consumed by the approved run; approving again is a
        // conflict because the request already left the pending state.
        let again = router
            .oneshot(post_json(&format!("/v1/approvals/{plan_id}/approve"), json!({})))
            .await
            .expect("request should be handled");
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn reject_removes_the_pending_request() {
        let state = test_state().await;
        let router = super::router(state.clone());

        let response = router
            .clone()
            .oneshot(post_json(
                "/v1/requests",
                submit_payload("purge record r-2", "execute"),
            ))
            .await
            .expect("request should be handled");
        let payload = body_json(response).await;
        assert_eq!(payload["reply"]["kind"], "awaiting_approval");
        let plan_id = payload["reply"]["plan"]["id"].as_str().expect("plan id").to_string();

        let rejected = router
            .clone()
            .oneshot(post_json(&format!("/v1/approvals/{plan_id}/reject"), json!({})))
            .await
            .expect("request should be handled");
        assert_eq!(rejected.status(), StatusCode::NO_CONTENT);

        assert!(state.gate.list_pending(Some("tenant-a")).is_empty());
    }

    #[tokio::test]
    async fn unknown_plan_approval_is_not_found() {
        let router = super::router(test_state().await);

        let response = router
            .oneshot(post_json("/v1/approvals/missing-plan/approve", json!({})))
            .await
            .expect("request should be handled");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn kill_switch_round_trip_blocks_and_releases_requests() {
        let router = super::router(test_state().await);

        let activated = router
            .clone()
            .oneshot(post_json(
                "/v1/killswitch/activate",
                json!({"scope": "tenant", "tenant_id": "tenant-a", "reason": "incident"}),
            ))
            .await
            .expect("request should be handled");
        assert_eq!(activated.status(), StatusCode::NO_CONTENT);

        let blocked = router
            .clone()
            .oneshot(post_json(
                "/v1/requests",
                submit_payload("look up record r-1", "simulate"),
            ))
            .await
            .expect("request should be handled");
        let payload = body_json(blocked).await;
        assert_eq!(payload["reply"]["kind"], "rejected");

        let listed = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/killswitch")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should be handled");
        let listed = body_json(listed).await;
        assert_eq!(listed["active"].as_array().map(Vec::len), Some(1));

        let deactivated = router
            .clone()
            .oneshot(post_json(
                "/v1/killswitch/deactivate",
                json!({"scope": "tenant", "tenant_id": "tenant-a"}),
            ))
            .await
            .expect("request should be handled");
        assert_eq!(deactivated.status(), StatusCode::NO_CONTENT);

        let allowed = router
            .oneshot(post_json(
                "/v1/requests",
                submit_payload("look up record r-1", "simulate"),
            ))
            .await
            .expect("request should be handled");
        let payload = body_json(allowed).await;
        assert_eq!(payload["reply"]["kind"], "executed");
    }

    #[tokio::test]
    async fn breaker_metrics_are_exposed() {
        let router = super::router(test_state().await);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/breaker")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should be handled");

        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["state"], "closed");
    }
}
