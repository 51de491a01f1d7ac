//! One explicit validator per input shape. Each returns the typed value or
//! every field violation found, never just the first.

use std::fmt;

use serde_json::{Map, Value};
use shared::{
    domain::{DeviceType, MessageStatus},
    error::{ApiError, ErrorCode},
    protocol::AddDeviceRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: &'static str,
    pub message: String,
}

impl FieldViolation {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Folds violations into a single caller-visible error with a readable
/// reason.
pub fn violations_error(code: ErrorCode, violations: &[FieldViolation]) -> ApiError {
    let reason = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    ApiError::with_reason(code, reason)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration<'a> {
    pub registration_handle: &'a str,
    pub name: &'a str,
    pub device_type: DeviceType,
}

fn one_of(names: &[&str]) -> String {
    format!("must be one of {}", names.join(", "))
}

pub fn validate_add_device(
    request: &AddDeviceRequest,
) -> Result<DeviceRegistration<'_>, Vec<FieldViolation>> {
    let mut violations = Vec::new();
    let registration_handle = required(&request.registration_id, "registration_id", &mut violations);
    let name = required(&request.name, "name", &mut violations);
    let device_type = required(&request.device_type, "type", &mut violations).and_then(|raw| {
        match raw.parse::<DeviceType>() {
            Ok(device_type) => Some(device_type),
            Err(_) => {
                let names = DeviceType::ALL.map(DeviceType::as_str);
                violations.push(FieldViolation::new("type", one_of(&names)));
                None
            }
        }
    });

    match (registration_handle, name, device_type) {
        (Some(registration_handle), Some(name), Some(device_type)) if violations.is_empty() => {
            Ok(DeviceRegistration {
                registration_handle,
                name,
                device_type,
            })
        }
        _ => Err(violations),
    }
}

fn required<'a>(
    value: &'a Option<String>,
    field: &'static str,
    violations: &mut Vec<FieldViolation>,
) -> Option<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Some(v),
        _ => {
            violations.push(FieldViolation::new(field, "is required"));
            None
        }
    }
}

/// A new message announced by a device over the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePayload {
    pub mid: String,
    pub to: String,
    pub status: MessageStatus,
    pub body: String,
    /// Client clock; kept for logging only, never used for ordering.
    pub at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPayload {
    pub mid: String,
    pub status: MessageStatus,
    pub at: String,
}

const STATUS_UPDATES: [MessageStatus; 3] = [
    MessageStatus::Sent,
    MessageStatus::Delivered,
    MessageStatus::Failed,
];

pub fn validate_message_payload(
    payload: &Map<String, Value>,
) -> Result<MessagePayload, Vec<FieldViolation>> {
    let mut violations = Vec::new();
    let mid = required_str(payload, "mid", &mut violations);
    let to = required_str(payload, "to", &mut violations);
    let status = required_status(payload, &MessageStatus::ALL, &mut violations);
    let body = required_str(payload, "body", &mut violations);
    let at = required_timestamp(payload, &mut violations);

    match (mid, to, status, body, at) {
        (Some(mid), Some(to), Some(status), Some(body), Some(at)) => Ok(MessagePayload {
            mid,
            to,
            status,
            body,
            at,
        }),
        _ => Err(violations),
    }
}

pub fn validate_status_payload(
    payload: &Map<String, Value>,
) -> Result<StatusPayload, Vec<FieldViolation>> {
    let mut violations = Vec::new();
    let mid = required_str(payload, "mid", &mut violations);
    let status = required_status(payload, &STATUS_UPDATES, &mut violations);
    let at = required_timestamp(payload, &mut violations);

    match (mid, status, at) {
        (Some(mid), Some(status), Some(at)) => Ok(StatusPayload { mid, status, at }),
        _ => Err(violations),
    }
}

fn required_str(
    payload: &Map<String, Value>,
    field: &'static str,
    violations: &mut Vec<FieldViolation>,
) -> Option<String> {
    match payload.get(field) {
        None | Some(Value::Null) => {
            violations.push(FieldViolation::new(field, "is required"));
            None
        }
        Some(Value::String(s)) if s.is_empty() => {
            violations.push(FieldViolation::new(field, "is required"));
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            violations.push(FieldViolation::new(field, "must be a string"));
            None
        }
    }
}

fn required_status(
    payload: &Map<String, Value>,
    allowed: &[MessageStatus],
    violations: &mut Vec<FieldViolation>,
) -> Option<MessageStatus> {
    let raw = required_str(payload, "status", violations)?;
    match raw.parse::<MessageStatus>() {
        Ok(status) if allowed.contains(&status) => Some(status),
        _ => {
            let names: Vec<_> = allowed.iter().map(|s| s.as_str()).collect();
            violations.push(FieldViolation::new("status", one_of(&names)));
            None
        }
    }
}

// Relays deliver data values as strings, newer clients send numbers.
fn required_timestamp(
    payload: &Map<String, Value>,
    violations: &mut Vec<FieldViolation>,
) -> Option<String> {
    match payload.get("at") {
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => required_str(payload, "at", violations),
    }
}

#[cfg(test)]
#[path = "tests/validation_tests.rs"]
mod tests;
