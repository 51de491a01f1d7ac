//! Handler for upstream events arriving from the push relay.
//!
//! An event is decoded, validated, attributed to a linked device and then
//! written to the ledger. Any failure on the way is echoed back to the
//! sending handle as a `{ error, reason }` event; nothing is dropped
//! silently and no single event can stop the listener.

use std::{borrow::Cow, sync::Arc};

use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{DownstreamMessage, InboundEvent},
};
use storage::{NewMessage, StoredMessage};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    internal, ledger,
    validation::{validate_message_payload, validate_status_payload, violations_error},
    ApiContext,
};

const DISCRIMINATOR: &str = "type";
const PAYLOAD: &str = "payload";

/// What became of one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum IngressOutcome {
    Recorded(StoredMessage),
    /// The event was refused and `ApiError` was echoed to the sender.
    Rejected(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Message,
    Status,
}

#[derive(Clone)]
pub struct RelayIngress {
    ctx: ApiContext,
}

impl RelayIngress {
    pub fn new(ctx: ApiContext) -> Self {
        Self { ctx }
    }

    pub async fn handle_event(&self, event: InboundEvent) -> IngressOutcome {
        debug!(from = %event.from, message_id = ?event.message_id, "inbound relay event");
        match self.dispatch(&event).await {
            Ok(stored) => IngressOutcome::Recorded(stored),
            Err(err) => {
                self.echo_error(&event.from, &err).await;
                IngressOutcome::Rejected(err)
            }
        }
    }

    /// Consumes `events` until the stream ends, handling each event on its
    /// own task. Returns once every spawned handler has finished.
    pub async fn run<S>(self: Arc<Self>, events: S)
    where
        S: Stream<Item = InboundEvent> + Send + Unpin,
    {
        let mut handlers = JoinSet::new();
        let mut events = events;
        while let Some(event) = events.next().await {
            let ingress = Arc::clone(&self);
            handlers.spawn(async move { ingress.handle_event(event).await });
            while let Some(finished) = handlers.try_join_next() {
                log_join(finished);
            }
        }
        while let Some(finished) = handlers.join_next().await {
            log_join(finished);
        }
        info!("relay ingress stream closed");
    }

    async fn dispatch(&self, event: &InboundEvent) -> Result<StoredMessage, ApiError> {
        let kind = event_kind(&event.data)?;
        let payload = payload_object(&event.data)?;
        let invalid = |violations: Vec<_>| violations_error(ErrorCode::InvalidMessagePayload, &violations);

        match kind {
            EventKind::Message => {
                let message = validate_message_payload(&payload).map_err(invalid)?;
                let user_id = self.resolve_sender(&event.from).await?;
                ledger::append(
                    &self.ctx,
                    user_id,
                    &NewMessage {
                        client_message_id: &message.mid,
                        destination: &message.to,
                        body: &message.body,
                        status: message.status,
                    },
                )
                .await
            }
            EventKind::Status => {
                let update = validate_status_payload(&payload).map_err(invalid)?;
                let user_id = self.resolve_sender(&event.from).await?;
                ledger::update_status(&self.ctx, user_id, &update.mid, update.status).await
            }
        }
    }

    async fn resolve_sender(&self, handle: &str) -> Result<UserId, ApiError> {
        let device = self
            .ctx
            .storage
            .find_linked_device_by_handle(handle)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::with_reason(ErrorCode::UnregisteredDevice, "device not found"))?;
        Ok(device.user_id)
    }

    async fn echo_error(&self, to: &str, err: &ApiError) {
        let message = DownstreamMessage::error(to, Uuid::new_v4().to_string(), err);
        info!(to, error = %err, echo_id = %message.message_id, "echoing ingress error");
        if let Err(send_err) = self.ctx.relay.send(&message).await {
            warn!(to, error = %send_err, "failed to echo ingress error");
        }
    }
}

fn event_kind(data: &Map<String, Value>) -> Result<EventKind, ApiError> {
    match data.get(DISCRIMINATOR).and_then(Value::as_str) {
        Some("message") => Ok(EventKind::Message),
        Some("status") => Ok(EventKind::Status),
        _ => Err(ApiError::with_reason(
            ErrorCode::InvalidMessageType,
            "must be 'message' or 'status'",
        )),
    }
}

// Relays that only carry string values deliver the payload as encoded JSON.
fn payload_object(data: &Map<String, Value>) -> Result<Cow<'_, Map<String, Value>>, ApiError> {
    let not_object = || ApiError::with_reason(ErrorCode::InvalidMessagePayload, "payload must be an object");
    match data.get(PAYLOAD) {
        Some(Value::Object(map)) => Ok(Cow::Borrowed(map)),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Cow::Owned(map)),
            _ => Err(not_object()),
        },
        _ => Err(not_object()),
    }
}

fn log_join(result: Result<IngressOutcome, tokio::task::JoinError>) {
    if let Err(err) = result {
        error!(error = %err, "ingress handler task failed");
    }
}

#[cfg(test)]
#[path = "tests/ingress_tests.rs"]
mod tests;
