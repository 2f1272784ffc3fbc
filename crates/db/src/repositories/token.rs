use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use warden_core::approval::{TokenConsumeError, TokenStore, TokenStoreError};
use warden_core::domain::plan::PlanId;
use warden_core::domain::token::{ApprovalToken, TokenId};

use super::RepositoryError;
use crate::DbPool;

pub struct SqlTokenStore {
    pool: DbPool,
}

impl SqlTokenStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_token(row: &sqlx::sqlite::SqliteRow) -> Result<ApprovalToken, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let plan_id: String =
        row.try_get("plan_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let plan_hash: String =
        row.try_get("plan_hash").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let user_id: String =
        row.try_get("user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let issued_at_str: String =
        row.try_get("issued_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let expires_at_str: String =
        row.try_get("expires_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let signature: String =
        row.try_get("signature").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let issued_at = parse_timestamp("issued_at", &issued_at_str)?;
    let expires_at = parse_timestamp("expires_at", &expires_at_str)?;

    Ok(ApprovalToken {
        id: TokenId(id),
        plan_id: PlanId(plan_id),
        plan_hash,
        tenant_id,
        user_id,
        issued_at,
        expires_at,
        signature,
    })
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{field}: {e}")))
}

#[async_trait]
impl TokenStore for SqlTokenStore {
    async fn insert(&self, token: ApprovalToken) -> Result<(), TokenStoreError> {
        sqlx::query(
            "INSERT INTO approval_token (id, plan_id, plan_hash, tenant_id, user_id,
                                         issued_at, expires_at, signature, state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'issued')",
        )
        .bind(&token.id.0)
        .bind(&token.plan_id.0)
        .bind(&token.plan_hash)
        .bind(&token.tenant_id)
        .bind(&token.user_id)
        .bind(token.issued_at.to_rfc3339())
        .bind(token.expires_at.to_rfc3339())
        .bind(&token.signature)
        .execute(&self.pool)
        .await
        .map_err(|e| TokenStoreError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self, token_id: &TokenId) -> Result<ApprovalToken, TokenConsumeError> {
        // The conditional UPDATE is the single-use guard: only one of two
        // racing consumers can flip the row out of 'issued'.
        let updated = sqlx::query(
            "UPDATE approval_token SET state = 'consumed', consumed_at = ?
             WHERE id = ? AND state = 'issued'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&token_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| TokenConsumeError::Backend(e.to_string()))?;

        if updated.rows_affected() == 0 {
            let exists = sqlx::query("SELECT state FROM approval_token WHERE id = ?")
                .bind(&token_id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| TokenConsumeError::Backend(e.to_string()))?;
            return match exists {
                Some(_) => Err(TokenConsumeError::AlreadyConsumed),
                None => Err(TokenConsumeError::NotFound),
            };
        }

        let row = sqlx::query(
            "SELECT id, plan_id, plan_hash, tenant_id, user_id, issued_at, expires_at,
                    signature
             FROM approval_token WHERE id = ?",
        )
        .bind(&token_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TokenConsumeError::Backend(e.to_string()))?;

        row_to_token(&row).map_err(|e| TokenConsumeError::Backend(e.to_string()))
    }

    async fn find_by_plan_hash(
        &self,
        plan_hash: &str,
    ) -> Result<Option<ApprovalToken>, TokenStoreError> {
        let row = sqlx::query(
            "SELECT id, plan_id, plan_hash, tenant_id, user_id, issued_at, expires_at,
                    signature
             FROM approval_token WHERE plan_hash = ?
             ORDER BY issued_at DESC LIMIT 1",
        )
        .bind(plan_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TokenStoreError::Backend(e.to_string()))?;

        match row {
            Some(ref r) => Ok(Some(
                row_to_token(r).map_err(|e| TokenStoreError::Backend(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use warden_core::approval::{TokenConsumeError, TokenStore};
    use warden_core::domain::plan::PlanId;
    use warden_core::domain::token::{ApprovalToken, TokenId};

    use super::SqlTokenStore;
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlTokenStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        SqlTokenStore::new(pool)
    }

    fn token(plan_hash: &str) -> ApprovalToken {
        let now = Utc::now();
        ApprovalToken {
            id: TokenId(Uuid::new_v4().to_string()),
            plan_id: PlanId("plan-1".to_string()),
            plan_hash: plan_hash.to_string(),
            tenant_id: "tenant-a".to_string(),
            user_id: "u-1".to_string(),
            issued_at: now,
            expires_at: now + Duration::minutes(15),
            signature: "ab".repeat(32),
        }
    }

    #[tokio::test]
    async fn insert_then_consume_round_trips_the_token() {
        let store = store().await;
        let token = token("hash-1");
        store.insert(token.clone()).await.expect("insert");

        let consumed = store.consume(&token.id).await.expect("consume");

        assert_eq!(consumed.plan_hash, "hash-1");
        assert_eq!(consumed.signature, token.signature);
        assert_eq!(consumed.tenant_id, "tenant-a");
    }

    #[tokio::test]
    async fn second_consume_reports_already_consumed() {
        let store = store().await;
        let token = token("hash-2");
        store.insert(token.clone()).await.expect("insert");

        store.consume(&token.id).await.expect("first consume");
        let second = store.consume(&token.id).await;

        assert!(matches!(second, Err(TokenConsumeError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn unknown_token_reports_not_found() {
        let store = store().await;

        let outcome = store.consume(&TokenId("missing".to_string())).await;

        assert!(matches!(outcome, Err(TokenConsumeError::NotFound)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_consumers_produce_exactly_one_winner() {
        // A shared named in-memory database so both consumers get their own
        // connection against the same token row.
        let database_url = format!(
            "sqlite://file:warden_token_race_{}?mode=memory&cache=shared",
            Uuid::new_v4().simple()
        );
        let pool = connect_with_settings(&database_url, 4, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        let store = Arc::new(SqlTokenStore::new(pool));

        let token = token("hash-race");
        store.insert(token.clone()).await.expect("insert");

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

        let outcomes = [first.await.expect("join"), second.await.expect("join")];

        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, Err(TokenConsumeError::AlreadyConsumed))));
    }

    #[tokio::test]
    async fn find_by_plan_hash_returns_the_matching_token() {
        let store = store().await;
        let token = token("hash-3");
        store.insert(token.clone()).await.expect("insert");

        let found = store.find_by_plan_hash("hash-3").await.expect("query");
        assert_eq!(found.map(|t| t.id), Some(token.id));

        let missing = store.find_by_plan_hash("hash-404").await.expect("query");
        assert!(missing.is_none());
    }
}
