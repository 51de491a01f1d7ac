//! Per-user message log. Ordering is always by the server-assigned
//! insertion sequence, never by the client-supplied `at`.

use chrono::Utc;
use shared::{
    domain::{MessageStatus, UserId},
    error::{ApiError, ErrorCode},
    protocol::MessageBody,
};
use storage::{ConflictKind, MessageFilter, NewMessage, StoredMessage};
use tracing::{debug, info};

use crate::{internal, ApiContext};

pub const DEFAULT_HISTORY_LIMIT: u32 = 1000;

pub async fn append(
    ctx: &ApiContext,
    user_id: UserId,
    message: &NewMessage<'_>,
) -> Result<StoredMessage, ApiError> {
    match ctx.storage.insert_message(user_id, message).await {
        Ok(stored) => {
            debug!(
                user_id = user_id.0,
                mid = %stored.client_message_id,
                seq = stored.seq.0,
                "message appended"
            );
            Ok(stored)
        }
        Err(err) if err.is_conflict(ConflictKind::MessageId) => {
            Err(ApiError::new(ErrorCode::DuplicateMessage))
        }
        Err(err) => Err(internal(err)),
    }
}

/// Moves a message forward through its status lifecycle. Lookup and write
/// happen in one transaction so two racing updates cannot both pass the
/// transition check against the same old status.
pub async fn update_status(
    ctx: &ApiContext,
    user_id: UserId,
    client_message_id: &str,
    status: MessageStatus,
) -> Result<StoredMessage, ApiError> {
    let mut tx = ctx.storage.begin().await.map_err(internal)?;
    let current = tx
        .find_message(user_id, client_message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::MessageNotFound))?;

    if !current.status.can_transition_to(status) {
        return Err(ApiError::with_reason(
            ErrorCode::InvalidStatusTransition,
            format!("cannot move from {} to {status}", current.status),
        ));
    }

    let updated = tx
        .set_message_status(current.seq, status, Utc::now())
        .await
        .map_err(internal)?;
    tx.commit().await.map_err(internal)?;
    debug!(user_id = user_id.0, mid = client_message_id, %status, "message status updated");
    Ok(updated)
}

/// Up to `limit` most recent messages, newest first.
pub async fn history(ctx: &ApiContext, user_id: UserId, limit: u32) -> Result<Vec<StoredMessage>, ApiError> {
    ctx.storage
        .list_messages(user_id, limit)
        .await
        .map_err(internal)
}

/// Everything the user stored after `cursor`, newest first. The cursor must
/// name one of the user's own messages.
pub async fn since(
    ctx: &ApiContext,
    user_id: UserId,
    cursor: &str,
) -> Result<Vec<StoredMessage>, ApiError> {
    let anchor = ctx
        .storage
        .find_message(user_id, cursor)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::MessageNotFound))?;
    ctx.storage
        .list_messages_after(user_id, anchor.seq)
        .await
        .map_err(internal)
}

/// Hard delete. Returns the number of rows removed so callers can tell a
/// miss apart from a deletion.
pub async fn delete(ctx: &ApiContext, user_id: UserId, client_message_id: &str) -> Result<u64, ApiError> {
    let removed = ctx
        .storage
        .delete_message(user_id, client_message_id)
        .await
        .map_err(internal)?;
    if removed > 0 {
        info!(user_id = user_id.0, mid = client_message_id, "message deleted");
    }
    Ok(removed)
}

pub async fn count(ctx: &ApiContext, filter: &MessageFilter) -> Result<i64, ApiError> {
    ctx.storage.count_messages(filter).await.map_err(internal)
}

pub fn to_wire(message: &StoredMessage) -> MessageBody {
    MessageBody {
        mid: message.client_message_id.clone(),
        to: message.destination.clone(),
        status: message.status.as_str().to_string(),
        body: message.body.clone(),
        at: message.updated_at.timestamp(),
    }
}

#[cfg(test)]
#[path = "tests/ledger_tests.rs"]
mod tests;
