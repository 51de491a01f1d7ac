use chrono::{DateTime, Utc};
use shared::domain::{DeviceGroupId, DeviceId, DeviceState, DeviceType, UserId};
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use crate::{
    error::{conflict_or_db, ConflictKind, StorageError, StorageResult},
    Storage, StorageTx,
};

#[derive(Debug, Clone)]
pub struct NewDevice<'a> {
    pub user_id: UserId,
    pub registration_handle: &'a str,
    pub name: &'a str,
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDevice {
    pub id: DeviceId,
    pub uuid: Uuid,
    pub user_id: UserId,
    pub group_id: Option<DeviceGroupId>,
    pub registration_handle: String,
    pub name: String,
    pub device_type: DeviceType,
    pub state: DeviceState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const DEVICE_COLUMNS: &str = "id, uuid, user_id, group_id, registration_handle, name, device_type, state, created_at, updated_at";

fn device_from_row(row: &SqliteRow) -> StorageResult<StoredDevice> {
    let raw_uuid: String = row.try_get("uuid")?;
    let raw_type: String = row.try_get("device_type")?;
    let raw_state: String = row.try_get("state")?;
    Ok(StoredDevice {
        id: DeviceId(row.try_get("id")?),
        uuid: Uuid::parse_str(&raw_uuid).map_err(|e| StorageError::corrupt("devices", e))?,
        user_id: UserId(row.try_get("user_id")?),
        group_id: row.try_get::<Option<i64>, _>("group_id")?.map(DeviceGroupId),
        registration_handle: row.try_get("registration_handle")?,
        name: row.try_get("name")?,
        device_type: raw_type
            .parse()
            .map_err(|e| StorageError::corrupt("devices", e))?,
        state: raw_state
            .parse()
            .map_err(|e| StorageError::corrupt("devices", e))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl StorageTx {
    /// Inserts a linked device. The registration handle is unique across all
    /// users; a second insert with the same handle fails with
    /// `Conflict(DeviceHandle)`.
    pub async fn insert_device(&mut self, device: &NewDevice<'_>) -> StorageResult<StoredDevice> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO devices (uuid, user_id, registration_handle, name, device_type, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(device.user_id.0)
        .bind(device.registration_handle)
        .bind(device.name)
        .bind(device.device_type.as_str())
        .bind(DeviceState::Linked.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(self.conn())
        .await
        .map_err(|e| conflict_or_db(e, ConflictKind::DeviceHandle))?;
        device_from_row(&row)
    }

    pub async fn attach_device_to_group(
        &mut self,
        device_id: DeviceId,
        group_id: DeviceGroupId,
    ) -> StorageResult<()> {
        sqlx::query("UPDATE devices SET group_id = ?, updated_at = ? WHERE id = ?")
            .bind(group_id.0)
            .bind(Utc::now())
            .bind(device_id.0)
            .execute(self.conn())
            .await?;
        Ok(())
    }
}

impl Storage {
    /// Resolves the device behind an upstream relay event. Only linked devices
    /// are returned; an unlinked handle behaves like an unknown one.
    pub async fn find_linked_device_by_handle(
        &self,
        registration_handle: &str,
    ) -> StorageResult<Option<StoredDevice>> {
        let row = sqlx::query(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE registration_handle = ? AND state = ?"
        ))
        .bind(registration_handle)
        .bind(DeviceState::Linked.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    pub async fn find_device(&self, user_id: UserId, uuid: &Uuid) -> StorageResult<Option<StoredDevice>> {
        let row = sqlx::query(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE user_id = ? AND uuid = ?"
        ))
        .bind(user_id.0)
        .bind(uuid.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(device_from_row).transpose()
    }

    pub async fn list_linked_devices(&self, user_id: UserId) -> StorageResult<Vec<StoredDevice>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE user_id = ? AND state = ?
             ORDER BY id ASC"
        ))
        .bind(user_id.0)
        .bind(DeviceState::Linked.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    pub async fn set_device_state(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        state: DeviceState,
    ) -> StorageResult<bool> {
        let updated =
            sqlx::query("UPDATE devices SET state = ?, updated_at = ? WHERE user_id = ? AND id = ?")
                .bind(state.as_str())
                .bind(Utc::now())
                .bind(user_id.0)
                .bind(device_id.0)
                .execute(self.pool())
                .await?
                .rows_affected();
        Ok(updated > 0)
    }

    pub async fn count_devices_with_handle(&self, registration_handle: &str) -> StorageResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE registration_handle = ?")
                .bind(registration_handle)
                .fetch_one(self.pool())
                .await?,
        )
    }
}
