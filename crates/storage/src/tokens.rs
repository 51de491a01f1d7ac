use chrono::{DateTime, Utc};
use shared::domain::{TokenId, UserId};
use sqlx::{sqlite::SqliteRow, Row};

use crate::{
    error::{conflict_or_db, ConflictKind, StorageResult},
    Storage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub id: TokenId,
    pub user_id: UserId,
    pub token: String,
    /// `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StoredToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }
}

fn token_from_row(row: &SqliteRow) -> StorageResult<StoredToken> {
    Ok(StoredToken {
        id: TokenId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        token: row.try_get("token")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Storage {
    pub async fn insert_token(
        &self,
        user_id: UserId,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<StoredToken> {
        let row = sqlx::query(
            "INSERT INTO user_tokens (user_id, token, expires_at, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id, user_id, token, expires_at, created_at",
        )
        .bind(user_id.0)
        .bind(token)
        .bind(expires_at)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await
        .map_err(|e| conflict_or_db(e, ConflictKind::Token))?;
        token_from_row(&row)
    }

    /// Looks a token up only in combination with its owner, so a token issued
    /// to one user never authenticates another.
    pub async fn find_token(&self, user_id: UserId, token: &str) -> StorageResult<Option<StoredToken>> {
        let row = sqlx::query(
            "SELECT id, user_id, token, expires_at, created_at
             FROM user_tokens
             WHERE user_id = ? AND token = ?",
        )
        .bind(user_id.0)
        .bind(token)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(token_from_row).transpose()
    }

    pub async fn delete_token(&self, token_id: TokenId) -> StorageResult<bool> {
        let deleted = sqlx::query("DELETE FROM user_tokens WHERE id = ?")
            .bind(token_id.0)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn count_tokens(&self, user_id: UserId) -> StorageResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM user_tokens WHERE user_id = ?")
                .bind(user_id.0)
                .fetch_one(self.pool())
                .await?,
        )
    }
}
