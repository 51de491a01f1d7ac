//! Boundary to the external push relay: group management for a user's
//! devices and unicast delivery of downstream events.

use async_trait::async_trait;
use shared::protocol::DownstreamMessage;
use thiserror::Error;

mod http;
mod memory;

pub use http::{HttpPushRelay, HttpRelayConfig};
pub use memory::{MemoryRelay, RelayCall};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The relay answered with an in-band error. Retrying the same request
    /// will not help.
    #[error("relay rejected request: {0}")]
    Rejected(String),

    /// The relay could not be reached or failed server-side.
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("relay returned an unreadable response: {0}")]
    InvalidResponse(String),
}

impl RelayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[async_trait]
pub trait PushRelay: Send + Sync {
    /// Registers a new fan-out group seeded with one device and returns the
    /// relay's key for it.
    async fn create_group(&self, group_name: &str, registration_handle: &str) -> RelayResult<String>;

    async fn add_device(
        &self,
        group_name: &str,
        group_key: &str,
        registration_handle: &str,
    ) -> RelayResult<()>;

    async fn remove_device(
        &self,
        group_name: &str,
        group_key: &str,
        registration_handle: &str,
    ) -> RelayResult<()>;

    async fn send(&self, message: &DownstreamMessage) -> RelayResult<()>;
}
