use push_relay::RelayError;
use shared::{
    domain::{DeviceState, DeviceType, UserId},
    error::{ApiError, ErrorCode},
    protocol::{AddDeviceRequest, AddDeviceResponse, LinkedDevice, SignoutRequest},
};
use storage::{ConflictKind, NewDevice, StoredDevice, StoredDeviceGroup};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{self, AuthenticatedUser},
    internal, random_hex,
    validation::{validate_add_device, violations_error},
    ApiContext,
};

const GROUP_NAME_BYTES: usize = 48;
const ENCRYPTION_KEY_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct RegisteredDevice {
    pub device: StoredDevice,
    pub encryption_key: String,
    pub notification_key: String,
}

fn relay_failure(err: RelayError) -> ApiError {
    match err {
        RelayError::Rejected(reason) => {
            ApiError::with_reason(ErrorCode::UnableToRegisterDevice, reason)
        }
        RelayError::Unavailable(reason) | RelayError::InvalidResponse(reason) => {
            ApiError::with_reason(ErrorCode::RelayUnavailable, reason)
        }
    }
}

/// Where a new device stands with respect to the user's relay group once
/// the relay has answered.
enum GroupMembership {
    /// The device was added to the group already stored for the user.
    Joined(StoredDeviceGroup),
    /// A fresh relay group was created for the device and is not stored yet.
    Created {
        group_name: String,
        external_key: String,
    },
}

/// Links a device to the user and makes sure it is part of the user's
/// single fan-out group.
///
/// Relay calls happen before any local write, so a slow relay never holds
/// the database write lock. Device row, group row and encryption key then
/// commit together in one short transaction. When a concurrent
/// registration stores the user's group first, the relay group created
/// here is abandoned and the device joins the stored one.
pub async fn ensure_device(
    ctx: &ApiContext,
    user_id: UserId,
    registration_handle: &str,
    name: &str,
    device_type: DeviceType,
) -> Result<RegisteredDevice, ApiError> {
    let taken = ctx
        .storage
        .count_devices_with_handle(registration_handle)
        .await
        .map_err(internal)?;
    if taken > 0 {
        return Err(ApiError::new(ErrorCode::DuplicateDeviceToken));
    }

    let device = NewDevice {
        user_id,
        registration_handle,
        name,
        device_type,
    };
    let membership = join_or_create_group(ctx, user_id, registration_handle).await?;
    if let Some(registered) = persist_device(ctx, &device, &membership).await? {
        return Ok(registered);
    }

    warn!(user_id = user_id.0, "device group already created concurrently, joining it");
    let group = ctx
        .storage
        .find_device_group(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::with_reason(ErrorCode::DuplicateDeviceGroup, "group vanished"))?;
    join_group(ctx, &group, registration_handle).await?;
    persist_device(ctx, &device, &GroupMembership::Joined(group))
        .await?
        .ok_or_else(|| ApiError::with_reason(ErrorCode::DuplicateDeviceGroup, "group changed"))
}

async fn join_or_create_group(
    ctx: &ApiContext,
    user_id: UserId,
    registration_handle: &str,
) -> Result<GroupMembership, ApiError> {
    if let Some(group) = ctx.storage.find_device_group(user_id).await.map_err(internal)? {
        join_group(ctx, &group, registration_handle).await?;
        return Ok(GroupMembership::Joined(group));
    }

    let group_name = random_hex(GROUP_NAME_BYTES);
    let external_key = ctx
        .relay
        .create_group(&group_name, registration_handle)
        .await
        .map_err(relay_failure)?;
    Ok(GroupMembership::Created {
        group_name,
        external_key,
    })
}

async fn join_group(
    ctx: &ApiContext,
    group: &StoredDeviceGroup,
    registration_handle: &str,
) -> Result<(), ApiError> {
    ctx.relay
        .add_device(&group.group_name, &group.external_key, registration_handle)
        .await
        .map_err(relay_failure)
}

/// Writes device, group and key in one transaction. `Ok(None)` means the
/// freshly created group lost the race for the user's single group row;
/// nothing was written.
async fn persist_device(
    ctx: &ApiContext,
    device: &NewDevice<'_>,
    membership: &GroupMembership,
) -> Result<Option<RegisteredDevice>, ApiError> {
    let user_id = device.user_id;
    let mut tx = ctx.storage.begin().await.map_err(internal)?;

    let stored = match tx.insert_device(device).await {
        Ok(stored) => stored,
        Err(err) if err.is_conflict(ConflictKind::DeviceHandle) => {
            tx.rollback().await.map_err(internal)?;
            if let GroupMembership::Joined(group) = membership {
                leave_group(ctx, group, device.registration_handle).await;
            }
            return Err(ApiError::new(ErrorCode::DuplicateDeviceToken));
        }
        Err(err) => return Err(internal(err)),
    };

    let group = match membership {
        GroupMembership::Joined(group) => group.clone(),
        GroupMembership::Created {
            group_name,
            external_key,
        } => match tx
            .insert_device_group_if_absent(user_id, group_name, external_key)
            .await
            .map_err(internal)?
        {
            Some(group) => {
                info!(user_id = user_id.0, group_id = group.id.0, "device group created");
                group
            }
            None => {
                tx.rollback().await.map_err(internal)?;
                return Ok(None);
            }
        },
    };

    tx.attach_device_to_group(stored.id, group.id)
        .await
        .map_err(internal)?;
    let encryption_key = tx
        .get_or_create_encryption_key(user_id, &random_hex(ENCRYPTION_KEY_BYTES))
        .await
        .map_err(internal)?;
    tx.commit().await.map_err(internal)?;

    info!(
        user_id = user_id.0,
        device = %stored.uuid,
        group_id = group.id.0,
        "device linked"
    );
    Ok(Some(RegisteredDevice {
        device: StoredDevice {
            group_id: Some(group.id),
            ..stored
        },
        encryption_key: encryption_key.key,
        notification_key: group.external_key,
    }))
}

/// Best-effort removal of a handle from a relay group. Failures are logged.
async fn leave_group(ctx: &ApiContext, group: &StoredDeviceGroup, registration_handle: &str) {
    if let Err(err) = ctx
        .relay
        .remove_device(&group.group_name, &group.external_key, registration_handle)
        .await
    {
        warn!(
            group_id = group.id.0,
            error = %err,
            "relay remove-device failed"
        );
    }
}

/// Validates a raw registration body and links the device.
pub async fn register_device(
    ctx: &ApiContext,
    user_id: UserId,
    request: &AddDeviceRequest,
) -> Result<AddDeviceResponse, ApiError> {
    let valid = validate_add_device(request)
        .map_err(|violations| violations_error(ErrorCode::InvalidJson, &violations))?;
    let registered = ensure_device(
        ctx,
        user_id,
        valid.registration_handle,
        valid.name,
        valid.device_type,
    )
    .await?;
    Ok(AddDeviceResponse {
        device_id: registered.device.uuid.to_string(),
        encryption_key: registered.encryption_key,
        notification_key: registered.notification_key,
    })
}

pub async fn list_linked_devices(ctx: &ApiContext, user_id: UserId) -> Result<Vec<LinkedDevice>, ApiError> {
    let devices = ctx
        .storage
        .list_linked_devices(user_id)
        .await
        .map_err(internal)?;
    Ok(devices
        .into_iter()
        .map(|device| LinkedDevice {
            device_id: device.uuid.to_string(),
            created_at: device.created_at.timestamp(),
            updated_at: device.updated_at.timestamp(),
            name: device.name,
            device_type: device.device_type,
        })
        .collect())
}

/// Marks the device unlinked, then asks the relay to drop it from the
/// user's group. The local state change stands even if the relay call
/// fails.
pub async fn unlink_device(
    ctx: &ApiContext,
    user_id: UserId,
    device_external_id: &str,
) -> Result<(), ApiError> {
    let not_found = || ApiError::new(ErrorCode::DeviceNotFound);
    let uuid = Uuid::parse_str(device_external_id).map_err(|_| not_found())?;
    let device = ctx
        .storage
        .find_device(user_id, &uuid)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;

    if device.state == DeviceState::Unlinked {
        return Ok(());
    }
    ctx.storage
        .set_device_state(user_id, device.id, DeviceState::Unlinked)
        .await
        .map_err(internal)?;
    info!(user_id = user_id.0, device = %device.uuid, "device unlinked");

    match ctx.storage.find_device_group(user_id).await {
        Ok(Some(group)) => leave_group(ctx, &group, &device.registration_handle).await,
        Ok(None) => {}
        Err(err) => {
            warn!(user_id = user_id.0, error = %err, "could not load device group after unlink");
        }
    }
    Ok(())
}

/// Ends the presenting session. A named device is unlinked first; an
/// unknown device id does not block sign-out.
pub async fn sign_out(
    ctx: &ApiContext,
    session: &AuthenticatedUser,
    request: &SignoutRequest,
) -> Result<(), ApiError> {
    let user_id = session.user.id;
    if let Some(device_id) = request.device_id.as_deref().filter(|id| !id.is_empty()) {
        match unlink_device(ctx, user_id, device_id).await {
            Ok(()) => {}
            Err(err) if err.code() == ErrorCode::DeviceNotFound => {
                info!(user_id = user_id.0, device_id, "sign-out named an unknown device");
            }
            Err(err) => return Err(err),
        }
    }
    auth::revoke_token(ctx, &session.token).await?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/devices_tests.rs"]
mod tests;
