use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scopes are independent: activating a tenant scope does not imply the
/// global scope, and a capability scope blocks that capability across all
/// tenants.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum KillSwitchScope {
    Global,
    Tenant { tenant_id: String },
    Capability { capability: String },
}

impl KillSwitchScope {
    pub fn key(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Tenant { tenant_id } => format!("tenant:{tenant_id}"),
            Self::Capability { capability } => format!("capability:{capability}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveScope {
    pub scope: KillSwitchScope,
    pub reason: String,
    pub activated_at: DateTime<Utc>,
}

/// Why a request was blocked: the first active scope found in the fixed
/// global -> tenant -> capability order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchBlock {
    pub scope: KillSwitchScope,
    pub reason: String,
}

/// Process-wide safety valve. Injected as a shared component so tests can
/// construct isolated instances; reads are linearizable with respect to a
/// completed activation (RwLock), so any request admitted after `activate`
/// returns observes the stop.
#[derive(Debug, Default)]
pub struct KillSwitch {
    scopes: RwLock<HashMap<String, ActiveScope>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self, scope: KillSwitchScope, reason: impl Into<String>) {
        let entry = ActiveScope {
            scope: scope.clone(),
            reason: reason.into(),
            activated_at: Utc::now(),
        };
        match self.scopes.write() {
            Ok(mut scopes) => {
                scopes.insert(scope.key(), entry);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(scope.key(), entry);
            }
        }
    }

    /// Returns true when the scope was active.
    pub fn deactivate(&self, scope: &KillSwitchScope) -> bool {
        match self.scopes.write() {
            Ok(mut scopes) => scopes.remove(&scope.key()).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&scope.key()).is_some(),
        }
    }

    /// Check in fixed order: global, then the tenant, then the capability.
    pub fn check(
        &self,
        tenant_id: &str,
        capability: &str,
    ) -> Result<(), KillSwitchBlock> {
        let ordered = [
            KillSwitchScope::Global,
            KillSwitchScope::Tenant { tenant_id: tenant_id.to_string() },
            KillSwitchScope::Capability { capability: capability.to_string() },
        ];

        let scopes = match self.scopes.read() {
            Ok(scopes) => scopes,
            Err(poisoned) => poisoned.into_inner(),
        };

        for scope in ordered {
            if let Some(active) = scopes.get(&scope.key()) {
                return Err(KillSwitchBlock {
                    scope: active.scope.clone(),
                    reason: active.reason.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn active_scopes(&self) -> Vec<ActiveScope> {
        let scopes = match self.scopes.read() {
            Ok(scopes) => scopes,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut active: Vec<ActiveScope> = scopes.values().cloned().collect();
        active.sort_by(|left, right| left.scope.key().cmp(&right.scope.key()));
        active
    }
}
