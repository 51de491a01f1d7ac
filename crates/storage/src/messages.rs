use chrono::{DateTime, Utc};
use shared::domain::{MessageSeq, MessageStatus, UserId};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use crate::{
    error::{conflict_or_db, ConflictKind, StorageError, StorageResult},
    Storage, StorageTx,
};

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub client_message_id: &'a str,
    pub destination: &'a str,
    pub body: &'a str,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub seq: MessageSeq,
    pub user_id: UserId,
    pub client_message_id: String,
    pub destination: String,
    pub status: MessageStatus,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Typed filter for administrative counts. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageFilter {
    pub user_id: Option<UserId>,
    pub status: Option<MessageStatus>,
}

const MESSAGE_COLUMNS: &str =
    "seq, user_id, client_message_id, destination, status, body, created_at, updated_at";

fn message_from_row(row: &SqliteRow) -> StorageResult<StoredMessage> {
    let raw_status: String = row.try_get("status")?;
    Ok(StoredMessage {
        seq: MessageSeq(row.try_get("seq")?),
        user_id: UserId(row.try_get("user_id")?),
        client_message_id: row.try_get("client_message_id")?,
        destination: row.try_get("destination")?,
        status: raw_status
            .parse()
            .map_err(|e| StorageError::corrupt("messages", e))?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn find_one(
    conn: &mut SqliteConnection,
    user_id: UserId,
    client_message_id: &str,
) -> StorageResult<Option<StoredMessage>> {
    let row = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ? AND client_message_id = ?"
    ))
    .bind(user_id.0)
    .bind(client_message_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(message_from_row).transpose()
}

impl StorageTx {
    pub async fn find_message(
        &mut self,
        user_id: UserId,
        client_message_id: &str,
    ) -> StorageResult<Option<StoredMessage>> {
        find_one(self.conn(), user_id, client_message_id).await
    }

    pub async fn set_message_status(
        &mut self,
        seq: MessageSeq,
        status: MessageStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<StoredMessage> {
        let row = sqlx::query(&format!(
            "UPDATE messages SET status = ?, updated_at = ? WHERE seq = ?
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(status.as_str())
        .bind(now)
        .bind(seq.0)
        .fetch_one(self.conn())
        .await?;
        message_from_row(&row)
    }
}

impl Storage {
    /// Appends to the user's ledger. The sequence is assigned by the database
    /// and is never reused, even after deletes.
    pub async fn insert_message(
        &self,
        user_id: UserId,
        message: &NewMessage<'_>,
    ) -> StorageResult<StoredMessage> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO messages (user_id, client_message_id, destination, status, body, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(user_id.0)
        .bind(message.client_message_id)
        .bind(message.destination)
        .bind(message.status.as_str())
        .bind(message.body)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(|e| conflict_or_db(e, ConflictKind::MessageId))?;
        message_from_row(&row)
    }

    pub async fn find_message(
        &self,
        user_id: UserId,
        client_message_id: &str,
    ) -> StorageResult<Option<StoredMessage>> {
        let mut conn = self.conn().await?;
        find_one(&mut conn, user_id, client_message_id).await
    }

    /// Newest first by sequence.
    pub async fn list_messages(&self, user_id: UserId, limit: u32) -> StorageResult<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE user_id = ?
             ORDER BY seq DESC
             LIMIT ?"
        ))
        .bind(user_id.0)
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Every message of the user strictly after `after`, newest first.
    pub async fn list_messages_after(
        &self,
        user_id: UserId,
        after: MessageSeq,
    ) -> StorageResult<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE user_id = ? AND seq > ?
             ORDER BY seq DESC"
        ))
        .bind(user_id.0)
        .bind(after.0)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn delete_message(&self, user_id: UserId, client_message_id: &str) -> StorageResult<u64> {
        Ok(
            sqlx::query("DELETE FROM messages WHERE user_id = ? AND client_message_id = ?")
                .bind(user_id.0)
                .bind(client_message_id)
                .execute(self.pool())
                .await?
                .rows_affected(),
        )
    }

    pub async fn count_messages(&self, filter: &MessageFilter) -> StorageResult<i64> {
        let user_id = filter.user_id.map(|u| u.0);
        let status = filter.status.map(MessageStatus::as_str);
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE (? IS NULL OR user_id = ?)
               AND (? IS NULL OR status = ?)",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(status)
        .bind(status)
        .fetch_one(self.pool())
        .await?)
    }
}
