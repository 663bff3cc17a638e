//! Cached resources and per-scope refresh state.

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};

use crate::Result;
use crate::database::models::{CachedResourceDbModel, RefreshStateDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{WritePool, begin_immediate};
use crate::domain::{RefreshTokenValue, Scope, SupportState};

/// Resource cache repository trait.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Committed items for a scope, ordered by id.
    async fn list(&self, scope: &Scope) -> Result<Vec<CachedResourceDbModel>>;

    /// Ids of the committed items for a scope.
    async fn list_ids(&self, scope: &Scope) -> Result<Vec<String>>;

    /// Refresh state row for a scope, if one was ever written.
    async fn get_state(&self, scope: &Scope) -> Result<Option<RefreshStateDbModel>>;

    async fn set_cursor(&self, scope: &Scope, cursor: &RefreshTokenValue) -> Result<()>;

    async fn set_support_state(&self, scope: &Scope, state: SupportState) -> Result<()>;

    /// Remove `removed_ids`, upsert `upserts`, store `cursor` and mark the
    /// scope supported, all in one transaction.
    async fn replace_resource_set(
        &self,
        scope: &Scope,
        upserts: &[CachedResourceDbModel],
        removed_ids: &[String],
        cursor: &RefreshTokenValue,
    ) -> Result<()>;

    /// Drop every item in the scope, clear the cursor and mark it unsupported.
    async fn mark_unsupported(&self, scope: &Scope) -> Result<()>;
}

/// SQLx implementation of ResourceRepository.
pub struct SqlxResourceRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxResourceRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl ResourceRepository for SqlxResourceRepository {
    async fn list(&self, scope: &Scope) -> Result<Vec<CachedResourceDbModel>> {
        let items = sqlx::query_as::<_, CachedResourceDbModel>(
            r#"
            SELECT * FROM cached_resources
            WHERE address = ? AND auth_token_id = ? AND resource_type = ?
            ORDER BY id ASC
            "#,
        )
        .bind(&scope.address)
        .bind(&scope.auth_token_id)
        .bind(scope.resource_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn list_ids(&self, scope: &Scope) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM cached_resources
            WHERE address = ? AND auth_token_id = ? AND resource_type = ?
            "#,
        )
        .bind(&scope.address)
        .bind(&scope.auth_token_id)
        .bind(scope.resource_type.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn get_state(&self, scope: &Scope) -> Result<Option<RefreshStateDbModel>> {
        let state = sqlx::query_as::<_, RefreshStateDbModel>(
            r#"
            SELECT * FROM refresh_state
            WHERE address = ? AND auth_token_id = ? AND resource_type = ?
            "#,
        )
        .bind(&scope.address)
        .bind(&scope.auth_token_id)
        .bind(scope.resource_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    async fn set_cursor(&self, scope: &Scope, cursor: &RefreshTokenValue) -> Result<()> {
        retry_on_sqlite_busy("set_cursor", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            ResourceTxOps::upsert_cursor(&mut tx, scope, cursor).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn set_support_state(&self, scope: &Scope, state: SupportState) -> Result<()> {
        retry_on_sqlite_busy("set_support_state", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            ResourceTxOps::upsert_support_state(&mut tx, scope, state).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn replace_resource_set(
        &self,
        scope: &Scope,
        upserts: &[CachedResourceDbModel],
        removed_ids: &[String],
        cursor: &RefreshTokenValue,
    ) -> Result<()> {
        retry_on_sqlite_busy("replace_resource_set", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            ResourceTxOps::delete_ids(&mut tx, scope, removed_ids).await?;
            for item in upserts {
                ResourceTxOps::upsert_item(&mut tx, item).await?;
            }
            ResourceTxOps::upsert_state(&mut tx, scope, cursor, SupportState::Supported).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn mark_unsupported(&self, scope: &Scope) -> Result<()> {
        retry_on_sqlite_busy("mark_unsupported", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            ResourceTxOps::delete_all(&mut tx, scope).await?;
            ResourceTxOps::upsert_state(
                &mut tx,
                scope,
                &RefreshTokenValue::default(),
                SupportState::Unsupported,
            )
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }
}

/// Transactional operations for cached resources and refresh state.
///
/// These methods operate within an existing transaction and do NOT commit.
pub struct ResourceTxOps;

impl ResourceTxOps {
    pub async fn upsert_item(tx: &mut SqliteConnection, item: &CachedResourceDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cached_resources (
                address, auth_token_id, resource_type, id, name, description, item, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(address, auth_token_id, resource_type, id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                item = excluded.item,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.address)
        .bind(&item.auth_token_id)
        .bind(&item.resource_type)
        .bind(&item.id)
        .bind(&item.name)
        .bind(&item.description)
        .bind(&item.item)
        .bind(item.updated_at)
        .execute(tx)
        .await?;
        Ok(())
    }

    pub async fn delete_ids(tx: &mut SqliteConnection, scope: &Scope, ids: &[String]) -> Result<u64> {
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query(
                r#"
                DELETE FROM cached_resources
                WHERE address = ? AND auth_token_id = ? AND resource_type = ? AND id = ?
                "#,
            )
            .bind(&scope.address)
            .bind(&scope.auth_token_id)
            .bind(scope.resource_type.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    pub async fn delete_all(tx: &mut SqliteConnection, scope: &Scope) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cached_resources WHERE address = ? AND auth_token_id = ? AND resource_type = ?",
        )
        .bind(&scope.address)
        .bind(&scope.auth_token_id)
        .bind(scope.resource_type.as_str())
        .execute(tx)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_state(
        tx: &mut SqliteConnection,
        scope: &Scope,
        cursor: &RefreshTokenValue,
        state: SupportState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_state (
                address, auth_token_id, resource_type, refresh_token, support_state, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(address, auth_token_id, resource_type) DO UPDATE SET
                refresh_token = excluded.refresh_token,
                support_state = excluded.support_state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&scope.address)
        .bind(&scope.auth_token_id)
        .bind(scope.resource_type.as_str())
        .bind(cursor.as_str())
        .bind(state.as_str())
        .bind(now_ms())
        .execute(tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_cursor(
        tx: &mut SqliteConnection,
        scope: &Scope,
        cursor: &RefreshTokenValue,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_state (
                address, auth_token_id, resource_type, refresh_token, updated_at
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(address, auth_token_id, resource_type) DO UPDATE SET
                refresh_token = excluded.refresh_token,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&scope.address)
        .bind(&scope.auth_token_id)
        .bind(scope.resource_type.as_str())
        .bind(cursor.as_str())
        .bind(now_ms())
        .execute(tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_support_state(
        tx: &mut SqliteConnection,
        scope: &Scope,
        state: SupportState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_state (
                address, auth_token_id, resource_type, support_state, updated_at
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(address, auth_token_id, resource_type) DO UPDATE SET
                support_state = excluded.support_state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&scope.address)
        .bind(&scope.auth_token_id)
        .bind(scope.resource_type.as_str())
        .bind(state.as_str())
        .bind(now_ms())
        .execute(tx)
        .await?;
        Ok(())
    }
}
