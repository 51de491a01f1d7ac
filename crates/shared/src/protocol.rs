use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{domain::DeviceType, error::ApiError};

pub const USER_TOKEN_HEADER: &str = "x-user-token";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Body of a device registration. Fields stay loosely typed until
/// validation so that every violation can be reported at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddDeviceRequest {
    #[serde(default)]
    pub registration_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDeviceResponse {
    pub device_id: String,
    pub encryption_key: String,
    pub notification_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedDevice {
    pub device_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub devices: Vec<LinkedDevice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignoutRequest {
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageBody {
    pub mid: String,
    pub to: String,
    pub status: String,
    pub body: String,
    /// Last server-side update, unix seconds.
    pub at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHistoryResponse {
    pub messages: Vec<MessageBody>,
}

/// One upstream event delivered by the push relay: the registration handle
/// of the sending device plus an untyped data map. The `type` key of the map
/// selects the payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub from: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// A unicast event sent back down to one device handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownstreamMessage {
    pub to: String,
    pub message_id: String,
    pub data: Value,
}

impl DownstreamMessage {
    pub fn error(to: impl Into<String>, message_id: impl Into<String>, error: &ApiError) -> Self {
        Self {
            to: to.into(),
            message_id: message_id.into(),
            data: serde_json::json!({
                "error": error.error.as_str(),
                "reason": error.reason.clone().unwrap_or_default(),
            }),
        }
    }
}
