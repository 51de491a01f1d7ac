use chrono::{DateTime, Utc};
use shared::domain::{DeviceGroupId, UserId};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use crate::{error::StorageResult, Storage, StorageTx};

/// A user's single push fan-out group as registered with the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDeviceGroup {
    pub id: DeviceGroupId,
    pub user_id: UserId,
    pub group_name: String,
    pub external_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEncryptionKey {
    pub user_id: UserId,
    pub key: String,
    pub created_at: DateTime<Utc>,
}

fn group_from_row(row: &SqliteRow) -> StorageResult<StoredDeviceGroup> {
    Ok(StoredDeviceGroup {
        id: DeviceGroupId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        group_name: row.try_get("group_name")?,
        external_key: row.try_get("external_key")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn find_group(
    conn: &mut SqliteConnection,
    user_id: UserId,
) -> StorageResult<Option<StoredDeviceGroup>> {
    let row = sqlx::query(
        "SELECT id, user_id, group_name, external_key, created_at
         FROM device_groups
         WHERE user_id = ?",
    )
    .bind(user_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(group_from_row).transpose()
}

/// Inserts `candidate` unless a key already exists and returns whichever key
/// is stored afterwards. Repeated calls always observe the first key written.
async fn get_or_create_key(
    conn: &mut SqliteConnection,
    user_id: UserId,
    candidate: &str,
) -> StorageResult<StoredEncryptionKey> {
    sqlx::query(
        "INSERT INTO encryption_keys (user_id, key, created_at) VALUES (?, ?, ?)
         ON CONFLICT(user_id) DO NOTHING",
    )
    .bind(user_id.0)
    .bind(candidate)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query("SELECT user_id, key, created_at FROM encryption_keys WHERE user_id = ?")
        .bind(user_id.0)
        .fetch_one(&mut *conn)
        .await?;
    Ok(StoredEncryptionKey {
        user_id: UserId(row.try_get("user_id")?),
        key: row.try_get("key")?,
        created_at: row.try_get("created_at")?,
    })
}

impl StorageTx {
    /// Persists a freshly created group. Returns `None` when a group row for
    /// the user already exists, in which case nothing is written and the
    /// caller must fall back to the stored group.
    pub async fn insert_device_group_if_absent(
        &mut self,
        user_id: UserId,
        group_name: &str,
        external_key: &str,
    ) -> StorageResult<Option<StoredDeviceGroup>> {
        let row = sqlx::query(
            "INSERT INTO device_groups (user_id, group_name, external_key, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO NOTHING
             RETURNING id, user_id, group_name, external_key, created_at",
        )
        .bind(user_id.0)
        .bind(group_name)
        .bind(external_key)
        .bind(Utc::now())
        .fetch_optional(self.conn())
        .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    pub async fn get_or_create_encryption_key(
        &mut self,
        user_id: UserId,
        candidate: &str,
    ) -> StorageResult<StoredEncryptionKey> {
        get_or_create_key(self.conn(), user_id, candidate).await
    }
}

impl Storage {
    pub async fn find_device_group(&self, user_id: UserId) -> StorageResult<Option<StoredDeviceGroup>> {
        let mut conn = self.conn().await?;
        find_group(&mut conn, user_id).await
    }

    pub async fn get_or_create_encryption_key(
        &self,
        user_id: UserId,
        candidate: &str,
    ) -> StorageResult<StoredEncryptionKey> {
        let mut conn = self.conn().await?;
        get_or_create_key(&mut conn, user_id, candidate).await
    }

    pub async fn count_device_groups(&self, user_id: UserId) -> StorageResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM device_groups WHERE user_id = ?")
                .bind(user_id.0)
                .fetch_one(self.pool())
                .await?,
        )
    }

    pub async fn count_encryption_keys(&self, user_id: UserId) -> StorageResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM encryption_keys WHERE user_id = ?")
                .bind(user_id.0)
                .fetch_one(self.pool())
                .await?,
        )
    }
}
