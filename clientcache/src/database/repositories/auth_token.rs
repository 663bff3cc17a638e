//! Auth token and keyring token persistence.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::Result;
use crate::database::models::{AuthTokenDbModel, KeyringTokenDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{WritePool, begin_immediate};

/// Auth token repository trait.
#[async_trait]
pub trait AuthTokenRepository: Send + Sync {
    /// Find a snapshot by id.
    async fn get(&self, id: &str) -> Result<Option<AuthTokenDbModel>>;

    /// List snapshots issued by `address`, oldest first.
    async fn list_by_address(&self, address: &str) -> Result<Vec<AuthTokenDbModel>>;

    /// List every snapshot.
    async fn list_all(&self) -> Result<Vec<AuthTokenDbModel>>;

    /// Delete a snapshot and, by cascade, its keyring tokens and cached state.
    /// Returns whether a row existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Find the keyring token registered for `(address, token_name)`.
    async fn find_keyring_token(
        &self,
        address: &str,
        token_name: &str,
    ) -> Result<Option<KeyringTokenDbModel>>;

    async fn list_keyring_tokens(&self) -> Result<Vec<KeyringTokenDbModel>>;

    /// Persist a snapshot and the keyring token pointing at it in one transaction.
    async fn save_keyring_registration(
        &self,
        snapshot: &AuthTokenDbModel,
        keyring_token: &KeyringTokenDbModel,
    ) -> Result<()>;

    /// Persist a snapshot on its own.
    async fn save_snapshot(&self, snapshot: &AuthTokenDbModel) -> Result<()>;

    /// Remove one keyring token row.
    async fn delete_keyring_token(
        &self,
        address: &str,
        keyring_type: &str,
        token_name: &str,
    ) -> Result<bool>;

    /// Remove a keyring token together with the snapshot it points at.
    async fn delete_keyring_registration(&self, keyring_token: &KeyringTokenDbModel)
    -> Result<()>;

    /// Delete snapshots that are expired at `now_ms`, or that no keyring token
    /// references and whose id is not in `keep`. Returns the deleted ids.
    async fn delete_expired_or_orphaned(
        &self,
        now_ms: i64,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>>;
}

/// SQLx implementation of AuthTokenRepository.
pub struct SqlxAuthTokenRepository {
    pool: SqlitePool,
    write_pool: WritePool,
}

impl SqlxAuthTokenRepository {
    pub fn new(pool: SqlitePool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl AuthTokenRepository for SqlxAuthTokenRepository {
    async fn get(&self, id: &str) -> Result<Option<AuthTokenDbModel>> {
        let token = sqlx::query_as::<_, AuthTokenDbModel>("SELECT * FROM auth_tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(token)
    }

    async fn list_by_address(&self, address: &str) -> Result<Vec<AuthTokenDbModel>> {
        let tokens = sqlx::query_as::<_, AuthTokenDbModel>(
            "SELECT * FROM auth_tokens WHERE address = ? ORDER BY created_time ASC, id ASC",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }

    async fn list_all(&self) -> Result<Vec<AuthTokenDbModel>> {
        let tokens = sqlx::query_as::<_, AuthTokenDbModel>(
            "SELECT * FROM auth_tokens ORDER BY address ASC, created_time ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE id = ?")
            .bind(id)
            .execute(&self.write_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_keyring_token(
        &self,
        address: &str,
        token_name: &str,
    ) -> Result<Option<KeyringTokenDbModel>> {
        let token = sqlx::query_as::<_, KeyringTokenDbModel>(
            r#"
            SELECT * FROM keyring_tokens
            WHERE address = ? AND token_name = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(address)
        .bind(token_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    async fn list_keyring_tokens(&self) -> Result<Vec<KeyringTokenDbModel>> {
        let tokens = sqlx::query_as::<_, KeyringTokenDbModel>(
            "SELECT * FROM keyring_tokens ORDER BY address ASC, keyring_type ASC, token_name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }

    async fn save_keyring_registration(
        &self,
        snapshot: &AuthTokenDbModel,
        keyring_token: &KeyringTokenDbModel,
    ) -> Result<()> {
        retry_on_sqlite_busy("save_keyring_registration", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            AuthTokenTxOps::upsert_snapshot(&mut tx, snapshot).await?;
            AuthTokenTxOps::upsert_keyring_token(&mut tx, keyring_token).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn save_snapshot(&self, snapshot: &AuthTokenDbModel) -> Result<()> {
        retry_on_sqlite_busy("save_snapshot", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            AuthTokenTxOps::upsert_snapshot(&mut tx, snapshot).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn delete_keyring_token(
        &self,
        address: &str,
        keyring_type: &str,
        token_name: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM keyring_tokens WHERE address = ? AND keyring_type = ? AND token_name = ?",
        )
        .bind(address)
        .bind(keyring_type)
        .bind(token_name)
        .execute(&self.write_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_keyring_registration(
        &self,
        keyring_token: &KeyringTokenDbModel,
    ) -> Result<()> {
        retry_on_sqlite_busy("delete_keyring_registration", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            AuthTokenTxOps::delete_keyring_token(&mut tx, keyring_token).await?;
            AuthTokenTxOps::delete_snapshot(&mut tx, &keyring_token.auth_token_id).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn delete_expired_or_orphaned(
        &self,
        now_ms: i64,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>> {
        retry_on_sqlite_busy("delete_expired_or_orphaned", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            let rows = sqlx::query(
                r#"
                SELECT a.id AS id,
                       a.expiration_time AS expiration_time,
                       EXISTS (SELECT 1 FROM keyring_tokens k WHERE k.auth_token_id = a.id) AS referenced
                FROM auth_tokens a
                "#,
            )
            .fetch_all(&mut *tx)
            .await?;

            let mut deleted = Vec::new();
            for row in rows {
                let id: String = row.get("id");
                let expiration_time: i64 = row.get("expiration_time");
                let referenced: i64 = row.get("referenced");

                let expired = expiration_time <= now_ms;
                let orphaned = referenced == 0 && !keep.contains(&id);
                if expired || orphaned {
                    AuthTokenTxOps::delete_snapshot(&mut tx, &id).await?;
                    deleted.push(id);
                }
            }

            tx.commit().await?;

            if !deleted.is_empty() {
                debug!(count = deleted.len(), "Deleted expired or orphaned auth tokens");
            }
            Ok(deleted)
        })
        .await
    }
}

/// Transactional operations for auth tokens and keyring tokens.
///
/// These methods operate within an existing transaction and do NOT commit.
pub struct AuthTokenTxOps;

impl AuthTokenTxOps {
    /// Insert or update a snapshot.
    ///
    /// The stored expiration time never moves backwards.
    pub async fn upsert_snapshot(
        tx: &mut SqliteConnection,
        snapshot: &AuthTokenDbModel,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_tokens (
                id, address, user_id, auth_method_id, created_time, updated_time,
                approximate_last_used_time, expiration_time, last_refreshed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                user_id = excluded.user_id,
                auth_method_id = excluded.auth_method_id,
                created_time = excluded.created_time,
                updated_time = excluded.updated_time,
                approximate_last_used_time = excluded.approximate_last_used_time,
                expiration_time = MAX(auth_tokens.expiration_time, excluded.expiration_time),
                last_refreshed_at = excluded.last_refreshed_at
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.address)
        .bind(&snapshot.user_id)
        .bind(&snapshot.auth_method_id)
        .bind(snapshot.created_time)
        .bind(snapshot.updated_time)
        .bind(snapshot.approximate_last_used_time)
        .bind(snapshot.expiration_time)
        .bind(snapshot.last_refreshed_at)
        .execute(tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_keyring_token(
        tx: &mut SqliteConnection,
        token: &KeyringTokenDbModel,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO keyring_tokens (address, keyring_type, token_name, auth_token_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(address, keyring_type, token_name) DO UPDATE SET
                auth_token_id = excluded.auth_token_id
            "#,
        )
        .bind(&token.address)
        .bind(&token.keyring_type)
        .bind(&token.token_name)
        .bind(&token.auth_token_id)
        .bind(token.created_at)
        .execute(tx)
        .await?;
        Ok(())
    }

    pub async fn delete_keyring_token(
        tx: &mut SqliteConnection,
        token: &KeyringTokenDbModel,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM keyring_tokens WHERE address = ? AND keyring_type = ? AND token_name = ?",
        )
        .bind(&token.address)
        .bind(&token.keyring_type)
        .bind(&token.token_name)
        .execute(tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete a snapshot. Keyring tokens and cached state cascade.
    pub async fn delete_snapshot(tx: &mut SqliteConnection, id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE id = ?")
            .bind(id)
            .execute(tx)
            .await?;
        Ok(result.rows_affected())
    }
}
