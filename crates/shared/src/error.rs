use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MissingCredentials,
    InvalidUserToken,
    AccountNotVerified,
    DuplicateDeviceToken,
    DuplicateMessage,
    DuplicateDeviceGroup,
    MessageNotFound,
    DeviceNotFound,
    InvalidStatusTransition,
    UnableToRegisterDevice,
    RelayUnavailable,
    InvalidJson,
    InvalidMessagePayload,
    InvalidMessageType,
    UnregisteredDevice,
    #[serde(rename = "internal_server_error")]
    Internal,
}

/// Coarse error taxonomy. Every `ErrorCode` belongs to exactly one category
/// and callers decide retry and status mapping from the category alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Auth,
    Conflict,
    NotFound,
    RelayRejection,
    RelayUnavailable,
    Validation,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::InvalidUserToken => "invalid_user_token",
            Self::AccountNotVerified => "account_not_verified",
            Self::DuplicateDeviceToken => "duplicate_device_token",
            Self::DuplicateMessage => "duplicate_message",
            Self::DuplicateDeviceGroup => "duplicate_device_group",
            Self::MessageNotFound => "message_not_found",
            Self::DeviceNotFound => "device_not_found",
            Self::InvalidStatusTransition => "invalid_status_transition",
            Self::UnableToRegisterDevice => "unable_to_register_device",
            Self::RelayUnavailable => "relay_unavailable",
            Self::InvalidJson => "invalid_json",
            Self::InvalidMessagePayload => "invalid_message_payload",
            Self::InvalidMessageType => "invalid_message_type",
            Self::UnregisteredDevice => "unregistered_device",
            Self::Internal => "internal_server_error",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::MissingCredentials | Self::InvalidUserToken | Self::AccountNotVerified => {
                ErrorCategory::Auth
            }
            Self::DuplicateDeviceToken
            | Self::DuplicateMessage
            | Self::DuplicateDeviceGroup
            | Self::InvalidStatusTransition => ErrorCategory::Conflict,
            Self::MessageNotFound | Self::DeviceNotFound | Self::UnregisteredDevice => {
                ErrorCategory::NotFound
            }
            Self::UnableToRegisterDevice => ErrorCategory::RelayRejection,
            Self::RelayUnavailable => ErrorCategory::RelayUnavailable,
            Self::InvalidJson | Self::InvalidMessagePayload | Self::InvalidMessageType => {
                ErrorCategory::Validation
            }
            Self::Internal => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-visible error body: `{ "error": "<code>", "reason": "..." }`.
/// The same shape is used for HTTP responses and for error events echoed
/// back to a device over the push relay.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{error}{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
pub struct ApiError {
    pub error: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApiError {
    pub fn new(error: ErrorCode) -> Self {
        Self {
            error,
            reason: None,
        }
    }

    pub fn with_reason(error: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            error,
            reason: Some(reason.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.error
    }

    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }

    /// Internal errors never leak their cause to the caller; the cause is
    /// expected to be logged where it happened.
    pub fn internal() -> Self {
        Self::new(ErrorCode::Internal)
    }
}
