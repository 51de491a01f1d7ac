use chrono::{DateTime, Utc};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};
use storage::{StoredToken, StoredUser};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{internal, random_hex, ApiContext};

const TOKEN_BYTES: usize = 32;

/// A request that passed [`authenticate`]. The token is kept so that
/// sign-out can revoke exactly the credential that was presented.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: StoredUser,
    pub token: StoredToken,
}

/// Validates a session token against the user's external id.
///
/// Order matters: credentials are checked for presence first, then the
/// token, and only then the verified flag, so an unverified account is only
/// reported to a caller holding a valid token. Expired tokens are deleted
/// on sight.
pub async fn authenticate(
    ctx: &ApiContext,
    token: &str,
    user_external_id: &str,
) -> Result<AuthenticatedUser, ApiError> {
    if token.is_empty() || user_external_id.is_empty() {
        return Err(ApiError::new(ErrorCode::MissingCredentials));
    }

    let Ok(user_uuid) = Uuid::parse_str(user_external_id) else {
        return Err(ApiError::new(ErrorCode::InvalidUserToken));
    };
    let user = ctx
        .storage
        .find_user_by_uuid(&user_uuid)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidUserToken))?;
    let stored = ctx
        .storage
        .find_token(user.id, token)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidUserToken))?;

    if stored.is_expired_at(Utc::now()) {
        debug!(user_id = user.id.0, token_id = stored.id.0, "deleting expired token");
        ctx.storage.delete_token(stored.id).await.map_err(internal)?;
        return Err(ApiError::new(ErrorCode::InvalidUserToken));
    }

    if !user.verified {
        return Err(ApiError::new(ErrorCode::AccountNotVerified));
    }

    Ok(AuthenticatedUser {
        user,
        token: stored,
    })
}

/// Issues a fresh random token. `None` never expires.
pub async fn issue_token(
    ctx: &ApiContext,
    user_id: UserId,
    expires_at: Option<DateTime<Utc>>,
) -> Result<StoredToken, ApiError> {
    let token = ctx
        .storage
        .insert_token(user_id, &random_hex(TOKEN_BYTES), expires_at)
        .await
        .map_err(internal)?;
    info!(user_id = user_id.0, token_id = token.id.0, "issued session token");
    Ok(token)
}

/// Deletes exactly this token. Other sessions of the same user stay valid.
pub async fn revoke_token(ctx: &ApiContext, token: &StoredToken) -> Result<bool, ApiError> {
    let removed = ctx.storage.delete_token(token.id).await.map_err(internal)?;
    info!(user_id = token.user_id.0, token_id = token.id.0, removed, "revoked session token");
    Ok(removed)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
