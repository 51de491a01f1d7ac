use chrono::{DateTime, Utc};
use shared::domain::UserId;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use uuid::Uuid;

use crate::{
    error::{conflict_or_db, ConflictKind, StorageError, StorageResult},
    Storage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub id: UserId,
    pub uuid: Uuid,
    pub email: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

const USER_COLUMNS: &str = "id, uuid, email, verified, created_at";

fn user_from_row(row: &SqliteRow) -> StorageResult<StoredUser> {
    let raw_uuid: String = row.try_get("uuid")?;
    let uuid = Uuid::parse_str(&raw_uuid).map_err(|e| StorageError::corrupt("users", e))?;
    Ok(StoredUser {
        id: UserId(row.try_get("id")?),
        uuid,
        email: row.try_get("email")?,
        verified: row.try_get("verified")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn find_by(
    conn: &mut SqliteConnection,
    column: &'static str,
    value: String,
) -> StorageResult<Option<StoredUser>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?");
    let row = sqlx::query(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

impl Storage {
    /// Creates an account row. Password handling lives outside the relay core,
    /// so only an already-hashed credential is accepted.
    pub async fn create_user(
        &self,
        email: &str,
        password_hash: Option<&str>,
        verified: bool,
    ) -> StorageResult<StoredUser> {
        let now = Utc::now();
        let mut conn = self.conn().await?;
        let row = sqlx::query(&format!(
            "INSERT INTO users (uuid, email, password_hash, verified, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(email)
        .bind(password_hash)
        .bind(verified)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| conflict_or_db(e, ConflictKind::UserEmail))?;
        user_from_row(&row)
    }

    pub async fn find_user(&self, user_id: UserId) -> StorageResult<Option<StoredUser>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(user_id.0)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn find_user_by_uuid(&self, uuid: &Uuid) -> StorageResult<Option<StoredUser>> {
        let mut conn = self.conn().await?;
        find_by(&mut conn, "uuid", uuid.to_string()).await
    }

    pub async fn find_user_by_email(&self, email: &str) -> StorageResult<Option<StoredUser>> {
        let mut conn = self.conn().await?;
        find_by(&mut conn, "email", email.to_string()).await
    }

    pub async fn set_user_verified(&self, user_id: UserId, verified: bool) -> StorageResult<bool> {
        let updated = sqlx::query("UPDATE users SET verified = ?, updated_at = ? WHERE id = ?")
            .bind(verified)
            .bind(Utc::now())
            .bind(user_id.0)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(updated > 0)
    }
}
