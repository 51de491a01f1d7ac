use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use relay_api::{
    auth::{self, AuthenticatedUser},
    devices, ledger,
};
use serde::{de::DeserializeOwned, Deserialize};
use shared::{
    error::{ApiError, ErrorCategory, ErrorCode},
    protocol::{
        AddDeviceRequest, AddDeviceResponse, DeviceListResponse, InboundEvent,
        MessageHistoryResponse, SignoutRequest, SuccessResponse, USER_ID_HEADER,
        USER_TOKEN_HEADER,
    },
};
use tokio::sync::mpsc::error::TrySendError;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, warn};

use crate::app_state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/user/devices", post(add_device).get(list_devices))
        .route("/user/signout", post(signout))
        .route("/user/messages/history", get(message_history))
        .route("/user/messages/sync/:mid", get(message_sync))
        .route("/user/messages/:mid", delete(delete_message))
        .route("/relay/upstream", post(relay_upstream))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::Auth => StatusCode::UNAUTHORIZED,
        ErrorCategory::Conflict => StatusCode::CONFLICT,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::RelayRejection | ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::RelayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> HttpError {
    (status_for(err.category()), Json(err))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

async fn authenticated(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser, HttpError> {
    auth::authenticate(
        &state.api,
        header_str(headers, USER_TOKEN_HEADER),
        header_str(headers, USER_ID_HEADER),
    )
    .await
    .map_err(reject)
}

/// Bodies are decoded by hand so malformed JSON surfaces as `invalid_json`
/// rather than the extractor's plain-text rejection. An empty body decodes
/// as `null`.
fn json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, HttpError> {
    let raw: &[u8] = if body.is_empty() { b"null" } else { &body[..] };
    serde_json::from_slice(raw)
        .map_err(|err| reject(ApiError::with_reason(ErrorCode::InvalidJson, err.to_string())))
}

async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(err) => {
            error!(error = %err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn add_device(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AddDeviceResponse>, HttpError> {
    let session = authenticated(&state, &headers).await?;
    let request: Option<AddDeviceRequest> = json_body(&body)?;
    devices::register_device(&state.api, session.user.id, &request.unwrap_or_default())
        .await
        .map(Json)
        .map_err(reject)
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<DeviceListResponse>, HttpError> {
    let session = authenticated(&state, &headers).await?;
    let devices = devices::list_linked_devices(&state.api, session.user.id)
        .await
        .map_err(reject)?;
    Ok(Json(DeviceListResponse { devices }))
}

async fn signout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SuccessResponse>, HttpError> {
    let session = authenticated(&state, &headers).await?;
    let request: Option<SignoutRequest> = json_body(&body)?;
    devices::sign_out(&state.api, &session, &request.unwrap_or_default())
        .await
        .map_err(reject)?;
    Ok(Json(SuccessResponse::ok()))
}

async fn message_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessageHistoryResponse>, HttpError> {
    let session = authenticated(&state, &headers).await?;
    let limit = query
        .limit
        .unwrap_or(state.history_limit)
        .min(state.history_limit);
    let messages = ledger::history(&state.api, session.user.id, limit)
        .await
        .map_err(reject)?;
    Ok(Json(MessageHistoryResponse {
        messages: messages.iter().map(ledger::to_wire).collect(),
    }))
}

async fn message_sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(mid): Path<String>,
) -> Result<Json<MessageHistoryResponse>, HttpError> {
    let session = authenticated(&state, &headers).await?;
    let messages = ledger::since(&state.api, session.user.id, &mid)
        .await
        .map_err(reject)?;
    Ok(Json(MessageHistoryResponse {
        messages: messages.iter().map(ledger::to_wire).collect(),
    }))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(mid): Path<String>,
) -> Result<Json<SuccessResponse>, HttpError> {
    let session = authenticated(&state, &headers).await?;
    let removed = ledger::delete(&state.api, session.user.id, &mid)
        .await
        .map_err(reject)?;
    if removed == 0 {
        return Err(reject(ApiError::new(ErrorCode::MessageNotFound)));
    }
    Ok(Json(SuccessResponse::ok()))
}

fn keys_match(presented: &[u8], expected: &[u8]) -> bool {
    presented.len() == expected.len()
        && presented
            .iter()
            .zip(expected)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

/// Checks `Authorization: key=<relay api key>` on the upstream bridge.
fn authorize_upstream(state: &AppState, headers: &HeaderMap) -> Result<(), HttpError> {
    let presented = header_str(headers, AUTHORIZATION.as_str());
    let Some(presented) = presented.strip_prefix("key=").filter(|key| !key.is_empty()) else {
        return Err(reject(ApiError::with_reason(
            ErrorCode::MissingCredentials,
            "relay key required",
        )));
    };
    match state.upstream_key.as_deref() {
        Some(expected) if keys_match(presented.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => {
            warn!("upstream event with invalid relay key");
            Err(reject(ApiError::with_reason(
                ErrorCode::InvalidUserToken,
                "invalid relay key",
            )))
        }
    }
}

/// Hands an upstream event to the ingress listener. Processing is
/// asynchronous; failures reach the device as echoed error events.
async fn relay_upstream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<SuccessResponse>), HttpError> {
    authorize_upstream(&state, &headers)?;
    let event: InboundEvent = json_body(&body)?;
    match state.ingress.try_send(event) {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(SuccessResponse::ok()))),
        Err(TrySendError::Full(event)) => {
            warn!(from = %event.from, "ingress queue full, refusing event");
            Err(reject(ApiError::with_reason(
                ErrorCode::RelayUnavailable,
                "ingress queue full",
            )))
        }
        Err(TrySendError::Closed(event)) => {
            error!(from = %event.from, "ingress listener stopped");
            Err(reject(ApiError::with_reason(
                ErrorCode::RelayUnavailable,
                "ingress listener stopped",
            )))
        }
    }
}

#[cfg(test)]
#[path = "tests/routes_tests.rs"]
mod tests;
