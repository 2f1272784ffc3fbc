use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::plan::PlanId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub String);

/// Lifecycle state tracked by the token store. `Issued -> Consumed` is the
/// only transition and happens at most once, under compare-and-swap
/// discipline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Issued,
    Consumed,
}

/// Signed capability granting permission to execute one specific plan.
/// The signature covers (plan hash, token id, expiry, scope), so neither
/// the plan binding nor the tenant/user scope can change without
/// invalidating it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub id: TokenId,
    pub plan_id: PlanId,
    pub plan_hash: String,
    pub tenant_id: String,
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Hex-encoded HMAC-SHA256 over the signing material.
    pub signature: String,
}

impl ApprovalToken {
    /// Scope string baked into the HMAC material; a token replayed under a
    /// different tenant or user fails signature validation.
    pub fn scope(&self) -> String {
        format!("{}:{}", self.tenant_id, self.user_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
