//! Human approval gate for high-risk plans.
//!
//! A plan whose overall risk reaches the configured threshold is parked here
//! until a human approves or rejects it. Approval mints a single-use
//! [`ApprovalToken`] whose signature binds the exact plan content; executing
//! a plan that changed after approval fails the drift check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::plan::{encode_hex, ActionPlan, PlanId, RiskLevel};
use crate::domain::token::{ApprovalToken, TokenId, TokenState};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A plan waiting for a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub plan: ActionPlan,
    pub state: ApprovalState,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no approval request found for plan `{0}`")]
    UnknownPlan(String),
    #[error("approval request for plan `{plan_id}` is {state:?}, not pending")]
    NotPending { plan_id: String, state: ApprovalState },
    #[error("token store failure: {0}")]
    Store(String),
}

/// Failed token validation. Every variant fails closed, and by the time any
/// of them is produced the token has already been burned.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("approval token not found")]
    NotFound,
    #[error("approval token was already consumed")]
    AlreadyConsumed,
    #[error("approval token signature does not verify")]
    SignatureMismatch,
    #[error("approval token has expired")]
    Expired,
    #[error("plan content changed after approval")]
    PlanDrift,
    #[error("approval token was minted for a different plan")]
    WrongPlan,
    #[error("token store failure: {0}")]
    Store(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenStoreError {
    #[error("token store backend failure: {0}")]
    Backend(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenConsumeError {
    #[error("token not found")]
    NotFound,
    #[error("token already consumed")]
    AlreadyConsumed,
    #[error("token store backend failure: {0}")]
    Backend(String),
}

/// Persistence for minted tokens. `consume` is the single-use guard: it must
/// atomically flip the token from issued to consumed and return the stored
/// token, so that two racing callers cannot both succeed.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, token: ApprovalToken) -> Result<(), TokenStoreError>;

    async fn consume(&self, token_id: &TokenId) -> Result<ApprovalToken, TokenConsumeError>;

    async fn find_by_plan_hash(
        &self,
        plan_hash: &str,
    ) -> Result<Option<ApprovalToken>, TokenStoreError>;
}

#[derive(Clone, Debug)]
struct StoredToken {
    token: ApprovalToken,
    state: TokenState,
}

#[derive(Clone, Default)]
pub struct InMemoryTokenStore {
    tokens: Arc<Mutex<HashMap<String, StoredToken>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredToken>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn insert(&self, token: ApprovalToken) -> Result<(), TokenStoreError> {
        self.lock().insert(
            token.id.0.clone(),
            StoredToken { token, state: TokenState::Issued },
        );
        Ok(())
    }

    async fn consume(&self, token_id: &TokenId) -> Result<ApprovalToken, TokenConsumeError> {
        let mut tokens = self.lock();
        match tokens.get_mut(&token_id.0) {
            None => Err(TokenConsumeError::NotFound),
            Some(stored) if stored.state == TokenState::Consumed => {
                Err(TokenConsumeError::AlreadyConsumed)
            }
            Some(stored) => {
                stored.state = TokenState::Consumed;
                Ok(stored.token.clone())
            }
        }
    }

    async fn find_by_plan_hash(
        &self,
        plan_hash: &str,
    ) -> Result<Option<ApprovalToken>, TokenStoreError> {
        let tokens = self.lock();
        Ok(tokens
            .values()
            .find(|stored| stored.token.plan_hash == plan_hash)
            .map(|stored| stored.token.clone()))
    }
}

#[derive(Clone, Debug)]
pub struct ApprovalConfig {
    pub approval_threshold: RiskLevel,
    pub token_ttl: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { approval_threshold: RiskLevel::High, token_ttl: Duration::minutes(15) }
    }
}

pub struct ApprovalGate {
    config: ApprovalConfig,
    signing_key: SecretString,
    pending: Mutex<HashMap<String, PendingApproval>>,
    store: Arc<dyn TokenStore>,
}

impl ApprovalGate {
    pub fn new(
        config: ApprovalConfig,
        signing_key: SecretString,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        Self { config, signing_key, pending: Mutex::new(HashMap::new()), store }
    }

    pub fn requires_approval(&self, plan: &ActionPlan) -> bool {
        plan.overall_risk >= self.config.approval_threshold
    }

    /// Park a plan for human review. Re-submitting the same plan id resets
    /// the request window.
    pub fn submit(&self, plan: ActionPlan) -> PendingApproval {
        let now = Utc::now();
        let pending = PendingApproval {
            plan,
            state: ApprovalState::Pending,
            requested_at: now,
            expires_at: now + self.config.token_ttl,
        };
        self.lock_pending().insert(pending.plan.id.0.clone(), pending.clone());
        pending
    }

    /// Pending requests, optionally filtered to one tenant. Requests past
    /// their window are flipped to expired on the way through.
    pub fn list_pending(&self, tenant_id: Option<&str>) -> Vec<PendingApproval> {
        self.sweep_expired();
        let pending = self.lock_pending();
        let mut requests: Vec<PendingApproval> = pending
            .values()
            .filter(|request| request.state == ApprovalState::Pending)
            .filter(|request| {
                tenant_id.map_or(true, |tenant| request.plan.tenant_id == tenant)
            })
            .cloned()
            .collect();
        requests.sort_by(|left, right| left.requested_at.cmp(&right.requested_at));
        requests
    }

    /// The parked copy of a submitted plan, whatever state the request is
    /// in. Execution after approval runs against this copy.
    pub fn plan(&self, plan_id: &PlanId) -> Option<ActionPlan> {
        self.lock_pending().get(&plan_id.0).map(|request| request.plan.clone())
    }

    pub fn sweep_expired(&self) {
        let now = Utc::now();
        let mut pending = self.lock_pending();
        for request in pending.values_mut() {
            if request.state == ApprovalState::Pending && request.expires_at <= now {
                request.state = ApprovalState::Expired;
            }
        }
    }

    /// Approve a pending plan and mint its single-use token. The signature
    /// covers the plan hash, token id, expiry, and the tenant/user scope, so
    /// none of those can be swapped after the fact.
    pub async fn approve(&self, plan_id: &PlanId) -> Result<ApprovalToken, ApprovalError> {
        let plan = self.take_pending(plan_id, ApprovalState::Approved)?;

        let now = Utc::now();
        let token_id = TokenId(Uuid::new_v4().to_string());
        let expires_at = now + self.config.token_ttl;
        let scope = format!("{}:{}", plan.tenant_id, plan.user_id);
        let signature = self.sign(&plan.content_hash, &token_id, expires_at, &scope);

        let token = ApprovalToken {
            id: token_id,
            plan_id: plan.id.clone(),
            plan_hash: plan.content_hash.clone(),
            tenant_id: plan.tenant_id.clone(),
            user_id: plan.user_id.clone(),
            issued_at: now,
            expires_at,
            signature,
        };

        self.store
            .insert(token.clone())
            .await
            .map_err(|error| ApprovalError::Store(error.to_string()))?;
        Ok(token)
    }

    pub fn reject(&self, plan_id: &PlanId) -> Result<(), ApprovalError> {
        self.take_pending(plan_id, ApprovalState::Rejected).map(|_| ())
    }

    /// Validate a token against the plan about to run, consuming it first.
    ///
    /// The consume happens before any check so that a token presented with a
    /// bad signature, past expiry, or against a drifted plan is burned and
    /// cannot be retried. Signature comparison is constant-time.
    pub async fn validate_and_consume(
        &self,
        token_id: &TokenId,
        plan: &ActionPlan,
    ) -> Result<(), TokenValidationError> {
        let token = self.store.consume(token_id).await.map_err(|error| match error {
            TokenConsumeError::NotFound => TokenValidationError::NotFound,
            TokenConsumeError::AlreadyConsumed => TokenValidationError::AlreadyConsumed,
            TokenConsumeError::Backend(detail) => TokenValidationError::Store(detail),
        })?;

        let scope = token.scope();
        let mut mac = self.mac();
        mac.update(
            signing_material(&token.plan_hash, &token.id, token.expires_at, &scope).as_bytes(),
        );
        let signature = decode_hex(&token.signature)
            .ok_or(TokenValidationError::SignatureMismatch)?;
        mac.verify_slice(&signature)
            .map_err(|_| TokenValidationError::SignatureMismatch)?;

        if token.is_expired(Utc::now()) {
            return Err(TokenValidationError::Expired);
        }
        if token.plan_id != plan.id {
            return Err(TokenValidationError::WrongPlan);
        }
        // Recompute from the live plan rather than trusting its cached hash.
        if token.plan_hash != plan.compute_content_hash() {
            return Err(TokenValidationError::PlanDrift);
        }

        Ok(())
    }

    fn take_pending(
        &self,
        plan_id: &PlanId,
        next: ApprovalState,
    ) -> Result<ActionPlan, ApprovalError> {
        self.sweep_expired();
        let mut pending = self.lock_pending();
        let request = pending
            .get_mut(&plan_id.0)
            .ok_or_else(|| ApprovalError::UnknownPlan(plan_id.0.clone()))?;
        if request.state != ApprovalState::Pending {
            return Err(ApprovalError::NotPending {
                plan_id: plan_id.0.clone(),
                state: request.state,
            });
        }
        request.state = next;
        Ok(request.plan.clone())
    }

    fn sign(
        &self,
        plan_hash: &str,
        token_id: &TokenId,
        expires_at: DateTime<Utc>,
        scope: &str,
    ) -> String {
        let mut mac = self.mac();
        mac.update(signing_material(plan_hash, token_id, expires_at, scope).as_bytes());
        encode_hex(&mac.finalize().into_bytes())
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(self.signing_key.expose_secret().as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"))
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingApproval>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
impl ApprovalGate {
    /// Insert a pending entry with a far-future review window, regardless of
    /// the configured TTL.
    fn force_pending(&self, plan: ActionPlan) {
        let now = Utc::now();
        self.lock_pending().insert(
            plan.id.0.clone(),
            PendingApproval {
                plan,
                state: ApprovalState::Pending,
                requested_at: now,
                expires_at: now + Duration::hours(1),
            },
        );
    }
}

fn signing_material(
    plan_hash: &str,
    token_id: &TokenId,
    expires_at: DateTime<Utc>,
    scope: &str,
) -> String {
    format!("{plan_hash}|{}|{}|{scope}", token_id.0, expires_at.to_rfc3339())
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&text[index..index + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use secrecy::SecretString;
    use serde_json::{Map, Value};

    use super::{
        ApprovalConfig, ApprovalError, ApprovalGate, ApprovalState, InMemoryTokenStore,
        TokenConsumeError, TokenStore, TokenValidationError,
    };
    use crate::domain::plan::{ActionPlan, ActionStep, PlanId, RiskLevel};

    fn arguments(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect()
    }

    fn plan(risk: RiskLevel) -> ActionPlan {
        ActionPlan::new(
            PlanId("plan-1".to_string()),
            "intent-1",
            "tenant-a",
            "u-1",
            vec![ActionStep {
                tool_id: "records.update".to_string(),
                schema_version: 1,
                ordinal: 0,
                arguments: arguments(&[("record_id", "r-42"), ("status", "closed")]),
                risk,
                description: "update record r-42".to_string(),
            }],
        )
    }

    fn gate() -> (ApprovalGate, Arc<InMemoryTokenStore>) {
        let store = Arc::new(InMemoryTokenStore::new());
        let gate = ApprovalGate::new(
            ApprovalConfig::default(),
            SecretString::from("test-signing-key"),
            store.clone(),
        );
        (gate, store)
    }

    #[test]
    fn threshold_splits_low_from_high_risk() {
        let (gate, _) = gate();
        assert!(!gate.requires_approval(&plan(RiskLevel::Medium)));
        assert!(gate.requires_approval(&plan(RiskLevel::High)));
        assert!(gate.requires_approval(&plan(RiskLevel::Critical)));
    }

    #[tokio::test]
    async fn approve_mints_token_bound_to_the_plan() {
        let (gate, _) = gate();
        let plan = plan(RiskLevel::High);
        gate.submit(plan.clone());

        let token = gate.approve(&plan.id).await.unwrap();

        assert_eq!(token.plan_hash, plan.content_hash);
        assert_eq!(token.scope(), "tenant-a:u-1");
        gate.validate_and_consume(&token.id, &plan).await.unwrap();
    }

    #[tokio::test]
    async fn token_is_single_use() {
        let (gate, _) = gate();
        let plan = plan(RiskLevel::High);
        gate.submit(plan.clone());
        let token = gate.approve(&plan.id).await.unwrap();

        gate.validate_and_consume(&token.id, &plan).await.unwrap();
        let second = gate.validate_and_consume(&token.id, &plan).await;

        assert_eq!(second, Err(TokenValidationError::AlreadyConsumed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_consumers_produce_exactly_one_winner() {
        let (gate, store) = gate();
        let plan = plan(RiskLevel::High);
        gate.submit(plan.clone());
        let token = gate.approve(&plan.id).await.unwrap();

        let first = tokio::spawn({
            let store = store.clone();
            let id = token.id.clone();
            async move { store.consume(&id).await }
        });
        let second = tokio::spawn({
            let store = store.clone();
            let id = token.id.clone();
            async move { store.consume(&id).await }
        });

        let outcomes = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, Err(TokenConsumeError::AlreadyConsumed))));
    }

    #[tokio::test]
    async fn drifted_plan_is_rejected_and_token_burned() {
        let (gate, _) = gate();
        let plan = plan(RiskLevel::High);
        gate.submit(plan.clone());
        let token = gate.approve(&plan.id).await.unwrap();

        let mut drifted = plan.clone();
        drifted.steps[0]
            .arguments
            .insert("status".to_string(), Value::String("purged".to_string()));

        let outcome = gate.validate_and_consume(&token.id, &drifted).await;
        assert_eq!(outcome, Err(TokenValidationError::PlanDrift));

        // The failed attempt burned the token; the original plan can no
        // longer ride on it either.
        let retry = gate.validate_and_consume(&token.id, &plan).await;
        assert_eq!(retry, Err(TokenValidationError::AlreadyConsumed));
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() {
        let (gate, store) = gate();
        let plan = plan(RiskLevel::High);
        gate.submit(plan.clone());
        let mut token = gate.approve(&plan.id).await.unwrap();

        token.signature = "00".repeat(32);
        // Re-insert the tampered copy under a fresh id.
        token.id.0 = "forged".to_string();
        store.insert(token.clone()).await.unwrap();

        let outcome = gate.validate_and_consume(&token.id, &plan).await;
        assert_eq!(outcome, Err(TokenValidationError::SignatureMismatch));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let store = Arc::new(InMemoryTokenStore::new());
        let gate = ApprovalGate::new(
            ApprovalConfig {
                approval_threshold: RiskLevel::High,
                token_ttl: Duration::seconds(-1),
            },
            SecretString::from("test-signing-key"),
            store,
        );
        let plan = plan(RiskLevel::High);
        // Pending window stays open; the minted token is born expired.
        gate.force_pending(plan.clone());
        let token = gate.approve(&plan.id).await.unwrap();

        let outcome = gate.validate_and_consume(&token.id, &plan).await;
        assert_eq!(outcome, Err(TokenValidationError::Expired));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (gate, _) = gate();
        let plan = plan(RiskLevel::High);

        let outcome = gate
            .validate_and_consume(&crate::domain::token::TokenId("missing".to_string()), &plan)
            .await;
        assert_eq!(outcome, Err(TokenValidationError::NotFound));
    }

    #[tokio::test]
    async fn rejected_plan_cannot_be_approved_later() {
        let (gate, _) = gate();
        let plan = plan(RiskLevel::High);
        gate.submit(plan.clone());
        gate.reject(&plan.id).unwrap();

        let outcome = gate.approve(&plan.id).await;
        assert_eq!(
            outcome.unwrap_err(),
            ApprovalError::NotPending {
                plan_id: "plan-1".to_string(),
                state: ApprovalState::Rejected,
            }
        );
    }

    #[test]
    fn pending_list_filters_by_tenant_and_sweeps_expired() {
        let (gate, _) = gate();
        let mut other = plan(RiskLevel::High);
        other.id = PlanId("plan-2".to_string());
        other.tenant_id = "tenant-b".to_string();
        gate.submit(plan(RiskLevel::High));
        gate.submit(other);

        assert_eq!(gate.list_pending(None).len(), 2);
        let scoped = gate.list_pending(Some("tenant-b"));
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].plan.tenant_id, "tenant-b");
    }
}
