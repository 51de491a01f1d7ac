use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde::{Deserialize, Serialize};
use shared::protocol::DownstreamMessage;
use tracing::debug;
use url::Url;

use crate::{PushRelay, RelayError, RelayResult};

#[derive(Debug, Clone)]
pub struct HttpRelayConfig {
    /// Endpoint for create/add/remove group operations.
    pub group_url: Url,
    /// Endpoint for downstream unicast sends.
    pub send_url: Url,
    pub api_key: String,
    pub sender_id: String,
    pub timeout: Duration,
}

/// Push relay spoken over HTTP with JSON bodies.
pub struct HttpPushRelay {
    config: HttpRelayConfig,
    http: Client,
}

#[derive(Debug, Serialize)]
struct GroupOperation<'a> {
    operation: &'static str,
    notification_key_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_key: Option<&'a str>,
    registration_ids: [&'a str; 1],
}

#[derive(Debug, Default, Deserialize)]
struct RelayReply {
    #[serde(default)]
    notification_key: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpPushRelay {
    pub fn new(config: HttpRelayConfig) -> RelayResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RelayError::Unavailable(format!("http client: {e}")))?;
        Ok(Self { config, http })
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &Url, body: &T) -> RelayResult<RelayReply> {
        let response = self
            .http
            .post(url.clone())
            .header(header::AUTHORIZATION, format!("key={}", self.config.api_key))
            .header("project_id", &self.config.sender_id)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        read_reply(response).await
    }

    async fn group_operation(&self, operation: GroupOperation<'_>) -> RelayResult<RelayReply> {
        debug!(
            operation = operation.operation,
            group = operation.notification_key_name,
            "relay group operation"
        );
        self.post(&self.config.group_url, &operation).await
    }
}

fn map_transport_error(err: reqwest::Error) -> RelayError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        RelayError::Unavailable(err.to_string())
    } else {
        RelayError::InvalidResponse(err.to_string())
    }
}

async fn read_reply(response: Response) -> RelayResult<RelayReply> {
    let status = response.status();
    if status.is_server_error() {
        return Err(RelayError::Unavailable(format!("relay returned {status}")));
    }
    let bytes = response.bytes().await.map_err(map_transport_error)?;
    let parsed = serde_json::from_slice::<RelayReply>(&bytes);

    if let Ok(RelayReply {
        error: Some(error), ..
    }) = &parsed
    {
        if !error.is_empty() {
            return Err(RelayError::Rejected(error.clone()));
        }
    }
    if !status.is_success() {
        return Err(RelayError::Rejected(format!("relay returned {status}")));
    }
    if bytes.is_empty() {
        return Ok(RelayReply::default());
    }
    parsed.map_err(|e| RelayError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl PushRelay for HttpPushRelay {
    async fn create_group(&self, group_name: &str, registration_handle: &str) -> RelayResult<String> {
        let reply = self
            .group_operation(GroupOperation {
                operation: "create",
                notification_key_name: group_name,
                notification_key: None,
                registration_ids: [registration_handle],
            })
            .await?;
        match reply.notification_key {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(RelayError::InvalidResponse(
                "create reply carried no notification_key".to_string(),
            )),
        }
    }

    async fn add_device(
        &self,
        group_name: &str,
        group_key: &str,
        registration_handle: &str,
    ) -> RelayResult<()> {
        self.group_operation(GroupOperation {
            operation: "add",
            notification_key_name: group_name,
            notification_key: Some(group_key),
            registration_ids: [registration_handle],
        })
        .await?;
        Ok(())
    }

    async fn remove_device(
        &self,
        group_name: &str,
        group_key: &str,
        registration_handle: &str,
    ) -> RelayResult<()> {
        self.group_operation(GroupOperation {
            operation: "remove",
            notification_key_name: group_name,
            notification_key: Some(group_key),
            registration_ids: [registration_handle],
        })
        .await?;
        Ok(())
    }

    async fn send(&self, message: &DownstreamMessage) -> RelayResult<()> {
        debug!(to = %message.to, message_id = %message.message_id, "relay downstream send");
        self.post(&self.config.send_url, message).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
